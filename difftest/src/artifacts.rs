//! What's kept on disk after a case has been judged.
//!
//! Every client's full output is written to `<logs>/<id>-<client>.trace.log`
//! as soon as it has been reaped. If the clients agreed, those logs and the
//! test file are deleted again. Otherwise the test file is moved next to them
//! as `<id>-test.json`, along with the combined trace `FAIL-<id>.log.txt` and
//! its summary `FAIL-<id>.summary.txt`.
//!
//! Nothing here fails a run: I/O problems are logged and skipped.

use std::path::{Path, PathBuf};

use trace_canon::compare::{SUMMARY_FOLLOWING_LINES, SUMMARY_PRECEDING_LINES};
use trace_canon::{summarize, ComparisonResult};
use tracing::{debug, error, info, warn};

use crate::client::ClientRun;
use crate::statetest::TestCase;

/// How a case was judged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Equivalent,
    Divergent(ComparisonResult),
    /// Some clients had to be killed. Holds one diagnostic line per client.
    TimedOut(Vec<String>),
    /// There was nothing to compare: the test file couldn't be written, or
    /// no client printed a single step.
    Unusable(Vec<String>),
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Equivalent)
    }

    /// The combined trace written for a failure.
    fn combined_lines(&self) -> &[String] {
        match self {
            Verdict::Equivalent => &[],
            Verdict::Divergent(result) => &result.lines,
            Verdict::TimedOut(diagnostic) | Verdict::Unusable(diagnostic) => diagnostic,
        }
    }
}

/// Paths written for a failed case.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureArtifacts {
    pub test_file: PathBuf,
    pub combined: PathBuf,
    pub summary: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ArtifactManager {
    logs_path: PathBuf,
}

impl ArtifactManager {
    pub fn new(logs_path: impl Into<PathBuf>) -> Self {
        Self {
            logs_path: logs_path.into(),
        }
    }

    pub fn logs_path(&self) -> &Path {
        &self.logs_path
    }

    /// Create the logs directory if it doesn't exist.
    pub async fn prepare(&self) -> anyhow::Result<()> {
        if !self.logs_path.exists() {
            info!("Created logs directory {}", self.logs_path.display());
        }
        tokio::fs::create_dir_all(&self.logs_path).await?;
        Ok(())
    }

    pub fn trace_log_path(&self, case_id: &str, client: &str) -> PathBuf {
        self.logs_path.join(format!("{case_id}-{client}.trace.log"))
    }

    /// Write a client's full output, headed by the command that produced it.
    pub async fn write_trace_log(&self, case_id: &str, run: &ClientRun) -> Option<PathBuf> {
        let path = self.trace_log_path(case_id, run.name());
        let contents = format!("# command\n# {}\n\n{}", run.command_line, run.lines.join("\n"));
        match tokio::fs::write(&path, contents).await {
            Ok(()) => Some(path),
            Err(e) => {
                error!("Couldn't write trace log {}: {e}", path.display());
                None
            }
        }
    }

    /// Keep or discard the files of a judged case.
    pub async fn record(
        &self,
        case: &TestCase,
        verdict: &Verdict,
        trace_logs: &[PathBuf],
    ) -> Option<FailureArtifacts> {
        if verdict.is_pass() {
            for path in trace_logs.iter().chain([&case.test_file]) {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    error!("Couldn't remove {}: {e}", path.display());
                }
            }
            return None;
        }

        let id = case.id();
        match verdict {
            Verdict::TimedOut(diagnostic) => {
                warn!("Timeout on test {id}: {}", diagnostic.join("; "))
            }
            Verdict::Unusable(diagnostic) => {
                warn!("Nothing to compare on test {id}: {}", diagnostic.join("; "))
            }
            _ => warn!("CONSENSUS BUG!!! on test {id}"),
        }

        let test_file = self.logs_path.join(format!("{id}-test.json"));
        if !case.test_file.exists() {
            debug!("No test file to keep for {id}");
        } else if let Err(e) = move_file(&case.test_file, &test_file).await {
            error!(
                "Couldn't move {} to {}: {e}",
                case.test_file.display(),
                test_file.display()
            );
        }

        let lines = verdict.combined_lines();
        let combined = self.logs_path.join(format!("FAIL-{id}.log.txt"));
        match tokio::fs::write(&combined, lines.join("\n")).await {
            Ok(()) => info!("Combined trace: {}", combined.display()),
            Err(e) => error!("Couldn't write {}: {e}", combined.display()),
        }

        let summary = self.logs_path.join(format!("FAIL-{id}.summary.txt"));
        let text = summarize(lines, SUMMARY_PRECEDING_LINES, SUMMARY_FOLLOWING_LINES).to_string();
        match tokio::fs::write(&summary, text).await {
            Ok(()) => info!("Summary trace: {}", summary.display()),
            Err(e) => error!("Couldn't write {}: {e}", summary.display()),
        }

        Some(FailureArtifacts {
            test_file,
            combined,
            summary,
        })
    }
}

/// Rename, or copy and remove when `from` and `to` are on different
/// filesystems.
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}
