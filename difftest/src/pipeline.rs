//! The test loop.
//!
//! Clients are started on case `i` before the processes of case `i - 1` are
//! reaped, so every client always has the next test running while the
//! previous traces are compared. The one case still in flight when the loop
//! ends is always judged before [`Orchestrator::run`] returns.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use futures::StreamExt as _;
use tokio::sync::watch;
use trace_canon::{compare_traces, ClientTrace};
use tracing::{debug, error, info, warn};

use crate::artifacts::{ArtifactManager, Verdict};
use crate::client::{ClientInvocation, ClientRun, RunOutcome, RunSettings};
use crate::config::{ConfiguredClient, RunConfig};
use crate::statetest::TestCase;
use crate::supplier::CaseStream;

pub const DEFAULT_REPORT_INTERVAL: usize = 10;

/// When to stop early, and how often to report progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunLimits {
    pub max_cases: Option<usize>,
    pub max_duration: Option<Duration>,
    /// Log progress every this many cases.
    pub report_interval: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_cases: None,
            max_duration: None,
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    /// No new cases are started; the last one is being judged.
    Draining,
    Stopped,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub passed: usize,
    pub failed: usize,
}

impl RunStats {
    pub fn total(&self) -> usize {
        self.passed + self.failed
    }
}

/// A case whose clients have been started.
#[derive(Debug)]
struct InFlight {
    case: TestCase,
    invocations: Vec<ClientInvocation>,
    /// Set when the test file couldn't be written. No client is started then.
    setup_error: Option<String>,
}

/// Holds at most one case in flight.
#[derive(Debug, Default)]
struct Pipeline {
    slot: Option<InFlight>,
}

impl Pipeline {
    /// Put `next` in flight, handing back the case it replaces.
    fn advance(&mut self, next: InFlight) -> Option<InFlight> {
        self.slot.replace(next)
    }

    fn drain(&mut self) -> Option<InFlight> {
        self.slot.take()
    }
}

#[derive(Debug)]
pub struct Orchestrator {
    clients: Vec<ConfiguredClient>,
    settings: RunSettings,
    artifacts: ArtifactManager,
    temp_dir: PathBuf,
    temp_prefix: String,
    limits: RunLimits,
    state: RunState,
    stats: RunStats,
}

impl Orchestrator {
    pub fn new(config: &RunConfig, limits: RunLimits) -> Self {
        Self {
            clients: config.clients.clone(),
            settings: RunSettings::new(config.timeout),
            artifacts: ArtifactManager::new(&config.logs_path),
            temp_dir: config.temp_dir.clone(),
            temp_prefix: config.temp_prefix.clone(),
            limits,
            state: RunState::Idle,
            stats: RunStats::default(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    /// Run every case of `cases` until it's exhausted, `stop` turns true, or
    /// a [`RunLimits`] bound is hit.
    pub async fn run(
        &mut self,
        mut cases: CaseStream,
        mut stop: watch::Receiver<bool>,
    ) -> anyhow::Result<RunStats> {
        self.artifacts.prepare().await?;
        self.state = RunState::Running;
        let started = Instant::now();
        let limits = self.limits;
        let deadline = async move {
            match limits.max_duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let mut pipeline = Pipeline::default();
        let mut launched = 0;
        loop {
            if *stop.borrow() {
                info!("Stop requested");
                break;
            }
            if limits.max_cases.is_some_and(|max| launched >= max) {
                info!("Reached the maximum of {launched} cases");
                break;
            }
            let next = tokio::select! {
                biased;
                Ok(()) = stop.changed() => continue,
                () = &mut deadline => {
                    info!("Reached the maximum run time");
                    break;
                }
                next = cases.next() => next,
            };
            let case = match next {
                Some(Ok(case)) => case,
                Some(Err(e)) => {
                    warn!("Skipping test: {e:#}");
                    continue;
                }
                None => {
                    info!("No more tests");
                    break;
                }
            };

            let next = self.launch(case).await;
            launched += 1;
            if let Some(previous) = pipeline.advance(next) {
                self.judge(previous).await;
            }
            if limits.report_interval > 0 && launched % limits.report_interval == 0 {
                self.report(started.elapsed());
            }
        }

        self.state = RunState::Draining;
        if let Some(last) = pipeline.drain() {
            self.judge(last).await;
        }
        self.state = RunState::Stopped;
        self.report(started.elapsed());
        Ok(self.stats)
    }

    fn report(&self, elapsed: Duration) {
        let RunStats { passed, failed } = self.stats;
        let total = self.stats.total();
        info!(
            "Fails: {failed}, Pass: {passed}, #test {total} speed: {:.6} tests/s",
            total as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
        );
    }

    fn temp_file(&self, number: usize) -> PathBuf {
        self.temp_dir.join(format!(
            "{}-{}-{number}.json",
            self.temp_prefix,
            std::process::id()
        ))
    }

    /// Write the case's test file and start every client on it.
    async fn launch(&self, mut case: TestCase) -> InFlight {
        info!("Test id: {}", case.id());
        case.test_file = self.temp_file(case.number);
        let written = match case.to_json() {
            Ok(json) => tokio::fs::write(&case.test_file, json)
                .await
                .map_err(|e| format!("couldn't write {}: {e}", case.test_file.display())),
            Err(e) => Err(format!("couldn't serialize test {}: {e}", case.id())),
        };
        if let Err(diagnostic) = written {
            error!("Not starting any client: {diagnostic}");
            return InFlight {
                case,
                invocations: vec![],
                setup_error: Some(diagnostic),
            };
        }

        let mut invocations = Vec::with_capacity(self.clients.len());
        for client in &self.clients {
            let command = client.adapter.command(&case, &client.location, &self.settings);
            match ClientInvocation::launch(client.adapter, command) {
                Ok(invocation) => invocations.push(invocation),
                Err(e) => warn!("{e:#}"),
            }
        }
        debug!(
            "Started {} processes for test {}",
            invocations.len(),
            case.name
        );
        InFlight {
            case,
            invocations,
            setup_error: None,
        }
    }

    /// Reap every client of a case, compare their traces and keep the
    /// artifacts.
    async fn judge(&mut self, in_flight: InFlight) {
        let InFlight {
            case,
            invocations,
            setup_error,
        } = in_flight;
        let id = case.id();
        let runs =
            futures::future::join_all(invocations.into_iter().map(ClientInvocation::finish)).await;

        let mut trace_logs = Vec::with_capacity(runs.len());
        for run in &runs {
            trace_logs.extend(self.artifacts.write_trace_log(&id, run).await);
        }

        let verdict = match setup_error {
            Some(diagnostic) => Verdict::Unusable(vec![diagnostic]),
            None => judge_runs(&case, &runs),
        };
        if verdict.is_pass() {
            self.stats.passed += 1;
        } else {
            self.stats.failed += 1;
        }
        self.artifacts.record(&case, &verdict, &trace_logs).await;
    }
}

/// Compare the traces of a case's reaped clients.
///
/// A case on which no client produced a single trace step fails as
/// [`Verdict::Unusable`]: empty traces trivially agree.
pub fn judge_runs(case: &TestCase, runs: &[ClientRun]) -> Verdict {
    if runs.is_empty() {
        warn!("No client ran test {}", case.id());
        return Verdict::Unusable(vec![format!("no client ran test {}", case.id())]);
    }

    let timed_out = runs
        .iter()
        .filter_map(|run| match run.outcome {
            RunOutcome::TimedOut(after) => {
                Some(format!("{} timed out after {after:?}", run.name()))
            }
            _ => None,
        })
        .collect::<Vec<_>>();
    if !timed_out.is_empty() {
        return Verdict::TimedOut(timed_out);
    }

    let traces = runs
        .iter()
        .map(|run| {
            if let RunOutcome::Failed(e) = &run.outcome {
                warn!("Couldn't collect the output of {}: {e}", run.name());
            }
            let steps = run.adapter.canonicalize(&run.lines);
            info!(
                "Processed {} steps for {} on test {}",
                steps.len(),
                run.name(),
                case.name
            );
            ClientTrace::new(run.name(), steps)
        })
        .collect::<Vec<_>>();

    if traces.iter().all(|trace| trace.steps.is_empty()) {
        return Verdict::Unusable(
            traces
                .iter()
                .map(|trace| format!("{} produced no trace", trace.client))
                .collect(),
        );
    }

    let result = compare_traces(&traces);
    if result.equivalent {
        Verdict::Equivalent
    } else {
        Verdict::Divergent(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientAdapter, Geth, Parity};

    #[test]
    fn pipeline_holds_one_case() {
        let case = |number| InFlight {
            case: TestCase {
                number,
                ..TestCase::new(
                    0,
                    "st",
                    crate::forks::Fork::Byzantium,
                    "/tests",
                    crate::statetest::tests::fixture()
                        .derive(crate::forks::Fork::Byzantium)
                        .next()
                        .unwrap()
                        .unwrap(),
                )
            },
            invocations: vec![],
            setup_error: None,
        };
        let mut pipeline = Pipeline::default();
        assert!(pipeline.advance(case(0)).is_none());
        assert_eq!(pipeline.advance(case(1)).map(|it| it.case.number), Some(0));
        assert_eq!(pipeline.drain().map(|it| it.case.number), Some(1));
        assert!(pipeline.drain().is_none());
    }

    #[test]
    fn silent_clients_do_not_agree() {
        let case = TestCase::new(
            0,
            "st",
            crate::forks::Fork::Byzantium,
            "/tests",
            crate::statetest::tests::fixture()
                .derive(crate::forks::Fork::Byzantium)
                .next()
                .unwrap()
                .unwrap(),
        );
        let silent = |adapter: &'static dyn ClientAdapter| ClientRun {
            adapter,
            command_line: adapter.name().into(),
            lines: vec![],
            outcome: RunOutcome::Failed("broken pipe".into()),
        };
        let runs = [silent(&Geth), silent(&Parity)];
        assert_eq!(
            judge_runs(&case, &runs),
            Verdict::Unusable(vec![
                "geth produced no trace".into(),
                "parity produced no trace".into(),
            ])
        );
        assert!(matches!(judge_runs(&case, &[]), Verdict::Unusable(_)));
    }

    #[test]
    fn default_limits() {
        let limits = RunLimits::default();
        assert_eq!(limits.report_interval, 10);
        assert_eq!(limits.max_cases, None);
        assert_eq!(limits.max_duration, None);
    }
}
