use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_stream::stream;
use tracing::{debug, info};

use super::{CaseStream, SkipList};
use crate::forks::Fork;
use crate::statetest::{Fixture, TestCase};

/// Walks the fixtures of a test corpus.
#[derive(Clone, Debug)]
pub struct Corpus {
    /// Root of the corpus; fixtures live under `GeneralStateTests/`.
    pub tests_path: PathBuf,
    pub fork: Fork,
    pub skip: SkipList,
    /// Cases numbered below this are not emitted, to resume an interrupted
    /// run.
    pub start_index: usize,
}

impl Corpus {
    /// Every fixture file, in sorted order.
    pub fn files(&self) -> anyhow::Result<Vec<PathBuf>> {
        let root = self
            .tests_path
            .to_str()
            .context("non-UTF-8 tests path")?;
        let pattern = format!(
            "{}/GeneralStateTests/**/*.json",
            glob::Pattern::escape(root.trim_end_matches('/'))
        );
        let mut files = glob::glob(&pattern)
            .context("invalid tests path")?
            .collect::<Result<Vec<_>, _>>()
            .context("filesystem error discovering fixtures")?;
        files.sort();
        Ok(files)
    }

    pub fn into_stream(self) -> CaseStream {
        Box::pin(stream! {
            let files = match self.files() {
                Ok(files) => files,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            info!("Found {} fixture files under {}", files.len(), self.tests_path.display());

            let mut number = 0;
            for path in files {
                let fixture = match load(&path).await {
                    Ok(fixture) => fixture,
                    Err(e) => {
                        yield Err(e);
                        continue;
                    }
                };
                let subfolder = subfolder(&path);
                for derived in fixture.derive(self.fork) {
                    let derived = match derived {
                        Ok(derived) => derived,
                        Err(e) => {
                            let context = format!("in {}", path.display());
                            yield Err(anyhow::Error::new(e).context(context));
                            continue;
                        }
                    };
                    if self.skip.matches(&derived.name) {
                        debug!("Skipping {}", derived.name);
                        continue;
                    }
                    let current = number;
                    number += 1;
                    if current < self.start_index {
                        continue;
                    }
                    yield Ok(TestCase::new(
                        current,
                        subfolder.clone(),
                        self.fork,
                        self.tests_path.clone(),
                        derived,
                    ));
                }
            }
        })
    }
}

async fn load(path: &Path) -> anyhow::Result<Fixture> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("couldn't read {}", path.display()))?;
    Fixture::from_slice(&bytes).with_context(|| format!("couldn't parse {}", path.display()))
}

/// Name of the directory holding `path`.
pub(crate) fn subfolder(path: &Path) -> String {
    path.parent()
        .and_then(Path::file_name)
        .map(|it| it.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use futures::StreamExt as _;

    use super::*;
    use crate::statetest::tests::fixture;

    fn corpus(dir: &Path) -> Corpus {
        let write = |relative: &str, contents: &[u8]| {
            let path = dir.join(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        };
        let fixture = serde_json::to_vec(&fixture()).unwrap();
        write("GeneralStateTests/stB/b.json", &fixture);
        write("GeneralStateTests/stA/a.json", &fixture);
        write("GeneralStateTests/stA/broken.json", b"{ not json");
        write("GeneralStateTests/stA/notes.txt", b"ignored");
        Corpus {
            tests_path: dir.to_owned(),
            fork: Fork::Byzantium,
            skip: SkipList::default(),
            start_index: 0,
        }
    }

    async fn ids(corpus: Corpus) -> (Vec<String>, usize) {
        let results = corpus.into_stream().collect::<Vec<_>>().await;
        let errors = results.iter().filter(|it| it.is_err()).count();
        let ids = results
            .into_iter()
            .filter_map(Result::ok)
            .map(|it| it.id())
            .collect();
        (ids, errors)
    }

    #[tokio::test]
    async fn walks_fixtures_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        let (ids, errors) = ids(corpus(dir.path())).await;
        assert_eq!(errors, 1);
        assert_eq!(
            ids,
            [
                "0000-stA-add11-0",
                "0001-stA-add11-1",
                "0002-stA-add11-2",
                "0003-stA-add12-0",
                "0004-stB-add11-0",
                "0005-stB-add11-1",
                "0006-stB-add11-2",
                "0007-stB-add12-0",
            ]
        );
    }

    #[tokio::test]
    async fn skipped_tests_are_not_numbered() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = Corpus {
            skip: SkipList::new(["add11"]),
            ..corpus(dir.path())
        };
        let (ids, _) = ids(corpus).await;
        assert_eq!(ids, ["0000-stA-add12-0", "0001-stB-add12-0"]);
    }

    #[tokio::test]
    async fn resuming_keeps_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = Corpus {
            start_index: 6,
            ..corpus(dir.path())
        };
        let (ids, _) = ids(corpus).await;
        assert_eq!(ids, ["0006-stB-add11-2", "0007-stB-add12-0"]);
    }

    #[tokio::test]
    async fn missing_corpus_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = Corpus {
            tests_path: dir.path().join("nowhere"),
            fork: Fork::Byzantium,
            skip: SkipList::default(),
            start_index: 0,
        };
        let (ids, errors) = ids(corpus).await;
        assert!(ids.is_empty());
        assert_eq!(errors, 0);
    }
}
