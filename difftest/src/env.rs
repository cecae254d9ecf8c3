use std::path::{Path, PathBuf};

use tracing::warn;

/// Attempt to load in the local `.env` if present and set any environment
/// variables specified inside of it.
///
/// Any IO error is treated as the file not existing. A file that can't be
/// parsed is reported and otherwise ignored.
pub fn load_dotenvy_vars_if_present() {
    loaded(dotenvy::dotenv());
}

/// Like [`load_dotenvy_vars_if_present`], for an explicit file.
pub fn load_dotenvy_vars_from(path: &Path) -> bool {
    loaded(dotenvy::from_path(path).map(|()| path.to_owned()))
}

/// Whether variables were loaded.
fn loaded(result: dotenvy::Result<PathBuf>) -> bool {
    match result {
        Ok(_) => true,
        Err(dotenvy::Error::Io(_)) => false,
        Err(e) => {
            warn!("Found local `.env` file but was unable to parse it! (err: {e})");
            false
        }
    }
}
