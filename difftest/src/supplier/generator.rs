//! Random state tests from an external generator.
//!
//! The generator (`testeth --createRandomTest`) prints one fixture holding a
//! single `randomStatetest`. Each one is given a unique name and written into
//! a corpus layout under the generator root, because `cpp` can only run tests
//! it finds there by name.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context as _};
use async_stream::stream;
use serde_json::json;
use tracing::{info, warn};

use super::CaseStream;
use crate::client::ClientLocation;
use crate::forks::Fork;
use crate::statetest::{Fixture, TestCase};

/// Name of the test in the generator's output.
pub const RANDOM_TEST: &str = "randomStatetest";
/// Subfolder generated tests are written to.
pub const SUBFOLDER: &str = "stRandom";
/// Default pause before asking a failing generator again.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(2);
/// Default time a single generator run may take.
pub const DEFAULT_GENERATOR_TIMEOUT: Duration = Duration::from_secs(60);

/// Unique names for generated tests.
///
/// Identifiers are `<user>-<host>-<unix seconds>-<pid>-<counter>`. A run can
/// be resumed from a counter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratorState {
    host_id: String,
    counter: u64,
}

impl GeneratorState {
    pub fn new(counter: u64) -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_owned());
        let host = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_owned());
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|it| it.as_secs())
            .unwrap_or_default();
        Self::with_host_id(format!("{user}-{host}-{started}-{}", std::process::id()), counter)
    }

    pub fn with_host_id(host_id: impl Into<String>, counter: u64) -> Self {
        Self {
            host_id: host_id.into(),
            counter,
        }
    }

    /// The counter the next identifier will use.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn next_identifier(&mut self) -> String {
        let identifier = format!("{}-{}", self.host_id, self.counter);
        self.counter += 1;
        identifier
    }
}

/// Supplies an endless stream of generated tests.
#[derive(Clone, Debug)]
pub struct Generator {
    pub location: ClientLocation,
    /// Corpus root generated fixtures are written under.
    pub root: PathBuf,
    pub fork: Fork,
    pub backoff: Duration,
    /// A generator run taking longer than this is killed and retried.
    pub timeout: Duration,
    pub state: GeneratorState,
}

impl Generator {
    pub fn command(&self) -> tokio::process::Command {
        let mut command = match &self.location {
            ClientLocation::Binary(binary) => tokio::process::Command::new(binary),
            ClientLocation::Docker(image) => {
                let mut command = tokio::process::Command::new("docker");
                command.args(["run", "--rm", image.as_str()]);
                command
            }
        };
        command
            .args(["-t", "GeneralStateTests", "--", "--createRandomTest"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn test_dir(&self) -> PathBuf {
        self.root.join("GeneralStateTests").join(SUBFOLDER)
    }

    fn filler_dir(&self) -> PathBuf {
        self.root
            .join("src")
            .join("GeneralStateTestsFiller")
            .join(SUBFOLDER)
    }

    /// Run the generator once. The fixture is only returned if it holds a
    /// [`RANDOM_TEST`].
    async fn generate(&self) -> anyhow::Result<Fixture> {
        let output = tokio::time::timeout(self.timeout, self.command().output())
            .await
            .map_err(|_| anyhow!("test generator timed out after {:?}", self.timeout))?
            .context("couldn't run the test generator")?;
        if !output.status.success() {
            bail!("test generator exited with {}", output.status);
        }
        let fixture = Fixture::from_slice(&output.stdout)
            .context("test generator printed an invalid fixture")?;
        if !fixture.tests.iter().any(|(name, _)| name == RANDOM_TEST) {
            bail!("generated fixture has no `{RANDOM_TEST}`");
        }
        Ok(fixture)
    }

    /// Write `fixture` into the corpus layout, along with the empty filler
    /// file `cpp` insists on.
    async fn persist(&self, name: &str, fixture: &Fixture) -> anyhow::Result<PathBuf> {
        let test_dir = self.test_dir();
        let filler_dir = self.filler_dir();
        tokio::fs::create_dir_all(&test_dir).await?;
        tokio::fs::create_dir_all(&filler_dir).await?;

        let path = generated_test_path(&self.root, name);
        tokio::fs::write(&path, serde_json::to_vec(fixture)?)
            .await
            .with_context(|| format!("couldn't write {}", path.display()))?;
        let filler = filler_dir.join(format!("{name}Filler.json"));
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&filler)
            .await
            .with_context(|| format!("couldn't touch {}", filler.display()))?;
        Ok(path)
    }

    pub fn into_stream(mut self) -> CaseStream {
        Box::pin(stream! {
            let mut number = 0;
            loop {
                let generated = match self.generate().await {
                    Ok(generated) => generated,
                    Err(e) => {
                        warn!("Exception generating test: {e:#}");
                        tokio::time::sleep(self.backoff).await;
                        continue;
                    }
                };
                // only a usable fixture takes up an identifier
                let fixture = match stamp(generated, &self.state.next_identifier()) {
                    Ok(fixture) => fixture,
                    Err(e) => {
                        warn!("Exception generating test: {e:#}");
                        continue;
                    }
                };
                let Some((name, _)) = fixture.tests.first() else {
                    continue;
                };
                let name = name.clone();
                let path = match self.persist(&name, &fixture).await {
                    Ok(path) => path,
                    Err(e) => {
                        yield Err(e);
                        tokio::time::sleep(self.backoff).await;
                        continue;
                    }
                };
                info!("Saved generated test to {}", path.display());

                let first = fixture.derive(self.fork).next();
                match first {
                    Some(Ok(derived)) => {
                        let root = self.root.clone();
                        yield Ok(TestCase::new(number, SUBFOLDER, self.fork, root, derived));
                        number += 1;
                    }
                    Some(Err(e)) => {
                        let context = format!("in {}", path.display());
                        yield Err(anyhow::Error::new(e).context(context));
                    }
                    None => warn!("Generated test {name} has no post-state for {}", self.fork),
                }
            }
        })
    }
}

/// Rename the generated test to `randomStatetest<identifier>` and give it
/// the `_info` block clients expect.
pub fn stamp(mut fixture: Fixture, identifier: &str) -> anyhow::Result<Fixture> {
    let Some(position) = fixture.tests.iter().position(|(name, _)| name == RANDOM_TEST) else {
        bail!("generated fixture has no `{RANDOM_TEST}`");
    };
    let (_, mut test) = fixture.tests.swap_remove(position);
    test.extra.insert(
        "_info".to_owned(),
        json!({
            "sourceHash": "0000000000000000000000000000000000000000000000000000000000001337",
            "comment": "x",
        }),
    );
    Ok(Fixture {
        tests: vec![(format!("{RANDOM_TEST}{identifier}"), test)],
    })
}

/// Where the generated test `name` is written under `root`.
pub fn generated_test_path(root: &Path, name: &str) -> PathBuf {
    root.join("GeneralStateTests")
        .join(SUBFOLDER)
        .join(format!("{name}.json"))
}
