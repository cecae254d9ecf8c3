//! Running a test case on the EVM clients.
//!
//! Each supported client has a [`ClientAdapter`] that knows how to invoke it,
//! on which stream its trace appears, and how to canonicalize that trace.
//! Adapters are looked up by name in a static table with [`adapter`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::Context as _;
use itertools::Itertools as _;
use tokio::task::JoinHandle;
use trace_canon::{CanonicalStep, Native};
use tracing::{debug, warn};

use crate::statetest::TestCase;

/// Where a client's test file is mounted inside its container.
pub const MOUNTED_TESTFILE: &str = "/mounted_testfile";
/// Where the corpus is mounted for clients that look tests up by name.
pub const MOUNTED_TESTS: &str = "/mounted_tests";

/// `py` is much slower than the others.
const PY_TIMEOUT_FACTOR: u32 = 3;

/// How to start a client (or the test generator).
///
/// A binary takes precedence over a container image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientLocation {
    Binary(PathBuf),
    Docker(String),
}

impl ClientLocation {
    pub fn new(binary: Option<PathBuf>, docker_name: Option<String>) -> Option<Self> {
        match (binary, docker_name) {
            (Some(binary), _) => Some(Self::Binary(binary)),
            (None, Some(image)) => Some(Self::Docker(image)),
            (None, None) => None,
        }
    }
}

impl fmt::Display for ClientLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientLocation::Binary(path) => write!(f, "{} docker:false", path.display()),
            ClientLocation::Docker(image) => write!(f, "{image} docker:true"),
        }
    }
}

/// Settings shared by every client invocation of a run.
#[derive(Clone, Debug)]
pub struct RunSettings {
    pub timeout: Duration,
    /// Prefix of container names, unique to this process.
    pub instance: String,
}

impl RunSettings {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            instance: format!("difftest-{}", std::process::id()),
        }
    }
}

/// The output stream a client writes its trace to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceStream {
    Stdout,
    Stderr,
}

/// A fully rendered client invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientCommand {
    pub program: String,
    pub args: Vec<String>,
    pub stream: TraceStream,
    pub timeout: Duration,
    /// Name of the container, for clients run under docker.
    pub container: Option<String>,
}

impl ClientCommand {
    fn new(
        location: &ClientLocation,
        args: Vec<String>,
        stream: TraceStream,
        settings: &RunSettings,
    ) -> Self {
        let program = match location {
            ClientLocation::Binary(binary) => binary.display().to_string(),
            ClientLocation::Docker(_) => "docker".to_owned(),
        };
        Self {
            program,
            args,
            stream,
            timeout: settings.timeout,
            container: None,
        }
    }

    /// The command line as it's recorded in trace logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .join(" ")
    }
}

/// Arguments for `docker run`, up to and including the image.
fn docker_run(image: &str, container: &str, mounts: &[(&Path, &str)]) -> Vec<String> {
    let mut args = vec![
        "run".to_owned(),
        "--rm".to_owned(),
        "-t".to_owned(),
        "--name".to_owned(),
        container.to_owned(),
    ];
    for (host, target) in mounts {
        args.push("-v".to_owned());
        args.push(format!("{}:{target}", host.display()));
    }
    args.push(image.to_owned());
    args
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_owned();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_owned())
}

/// Knows how to run one client and read its trace.
pub trait ClientAdapter: fmt::Debug + Sync {
    /// The name clients are configured by.
    fn name(&self) -> &'static str;

    /// Trace format of the client.
    fn native(&self) -> Native;

    /// Render the invocation of this client on `case`.
    fn command(
        &self,
        case: &TestCase,
        location: &ClientLocation,
        settings: &RunSettings,
    ) -> ClientCommand;

    fn canonicalize(&self, lines: &[String]) -> Vec<CanonicalStep> {
        self.native().canonicalize(lines)
    }
}

/// Every adapter, by name.
static ADAPTERS: &[&dyn ClientAdapter] = &[&Geth, &Parity, &Cpp, &Py];

/// Look up the adapter for a client name.
pub fn adapter(name: &str) -> Option<&'static dyn ClientAdapter> {
    ADAPTERS.iter().copied().find(|it| it.name() == name)
}

/// Names of every supported client.
pub fn supported() -> impl Iterator<Item = &'static str> {
    ADAPTERS.iter().map(|it| it.name())
}

/// Adapters for a command that reads the test from a single file.
fn single_file_command(
    adapter: &dyn ClientAdapter,
    case: &TestCase,
    location: &ClientLocation,
    settings: &RunSettings,
    build: impl Fn(&str) -> Vec<String>,
    binary_stream: TraceStream,
) -> ClientCommand {
    match location {
        ClientLocation::Binary(_) => {
            let file = absolute(&case.test_file);
            let args = build(&file.display().to_string());
            ClientCommand::new(location, args, binary_stream, settings)
        }
        ClientLocation::Docker(image) => {
            let container = container_name(adapter, case, settings);
            let test_file = absolute(&case.test_file);
            let mounts = [(test_file.as_path(), MOUNTED_TESTFILE)];
            let mut args = docker_run(image, &container, &mounts);
            args.extend(build(MOUNTED_TESTFILE));
            ClientCommand {
                container: Some(container),
                ..ClientCommand::new(location, args, TraceStream::Stdout, settings)
            }
        }
    }
}

fn container_name(adapter: &dyn ClientAdapter, case: &TestCase, settings: &RunSettings) -> String {
    format!("{}-{}-{}", settings.instance, case.number, adapter.name())
}

/// go-ethereum's `evm`. Traces to stderr, except under docker where `-t`
/// merges it into stdout.
#[derive(Debug)]
pub struct Geth;

impl ClientAdapter for Geth {
    fn name(&self) -> &'static str {
        "geth"
    }

    fn native(&self) -> Native {
        Native::Geth
    }

    fn command(
        &self,
        case: &TestCase,
        location: &ClientLocation,
        settings: &RunSettings,
    ) -> ClientCommand {
        single_file_command(
            self,
            case,
            location,
            settings,
            |file| {
                ["--json", "--nomemory", "statetest", file]
                    .map(str::to_owned)
                    .to_vec()
            },
            TraceStream::Stderr,
        )
    }
}

/// OpenEthereum's `evmbin`.
#[derive(Debug)]
pub struct Parity;

impl ClientAdapter for Parity {
    fn name(&self) -> &'static str {
        "parity"
    }

    fn native(&self) -> Native {
        Native::Parity
    }

    fn command(
        &self,
        case: &TestCase,
        location: &ClientLocation,
        settings: &RunSettings,
    ) -> ClientCommand {
        single_file_command(
            self,
            case,
            location,
            settings,
            |file| ["state-test", file, "--json"].map(str::to_owned).to_vec(),
            TraceStream::Stdout,
        )
    }
}

/// aleth's `testeth`. It can't read a single test file, so it's pointed at
/// the original fixture in the corpus and told which variant to run.
#[derive(Debug)]
pub struct Cpp;

impl Cpp {
    const JSON_TRACE_OPTIONS: &'static str = r#"{ "disableStorage":true, "disableMemory":true }"#;
}

impl ClientAdapter for Cpp {
    fn name(&self) -> &'static str {
        "cpp"
    }

    fn native(&self) -> Native {
        Native::Cpp
    }

    fn command(
        &self,
        case: &TestCase,
        location: &ClientLocation,
        settings: &RunSettings,
    ) -> ClientCommand {
        let corpus_root = absolute(&case.corpus_root);
        let (mut args, testpath, container) = match location {
            ClientLocation::Binary(_) => (vec![], corpus_root.display().to_string(), None),
            ClientLocation::Docker(image) => {
                let container = container_name(self, case, settings);
                (
                    docker_run(image, &container, &[(corpus_root.as_path(), MOUNTED_TESTS)]),
                    MOUNTED_TESTS.to_owned(),
                    Some(container),
                )
            }
        };
        args.extend([
            "-t".to_owned(),
            format!("GeneralStateTests/{}", case.subfolder),
            "--".to_owned(),
            "--singletest".to_owned(),
            case.name.clone(),
            "--jsontrace".to_owned(),
            Self::JSON_TRACE_OPTIONS.to_owned(),
            "--singlenet".to_owned(),
            case.fork.to_string(),
            "-d".to_owned(),
            case.indexes.data.to_string(),
            "-g".to_owned(),
            case.indexes.gas.to_string(),
            "-v".to_owned(),
            case.indexes.value.to_string(),
            "--testpath".to_owned(),
            testpath,
        ]);
        if case.fork.needs_all_flag() {
            args.push("--all".to_owned());
        }
        ClientCommand {
            container,
            ..ClientCommand::new(location, args, TraceStream::Stdout, settings)
        }
    }
}

/// pyethereum's state test runner.
#[derive(Debug)]
pub struct Py;

impl ClientAdapter for Py {
    fn name(&self) -> &'static str {
        "py"
    }

    fn native(&self) -> Native {
        Native::Py
    }

    fn command(
        &self,
        case: &TestCase,
        location: &ClientLocation,
        settings: &RunSettings,
    ) -> ClientCommand {
        let command = single_file_command(
            self,
            case,
            location,
            settings,
            |file| ["run_statetest.py", file].map(str::to_owned).to_vec(),
            TraceStream::Stdout,
        );
        ClientCommand {
            timeout: settings.timeout * PY_TIMEOUT_FACTOR,
            ..command
        }
    }
}

/// How a client process ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Exited(ExitStatus),
    /// Killed after running for this long.
    TimedOut(Duration),
    /// Waiting for the process failed.
    Failed(String),
}

/// A reaped client process.
#[derive(Debug)]
pub struct ClientRun {
    pub adapter: &'static dyn ClientAdapter,
    pub command_line: String,
    /// The trace stream's output, one entry per line.
    pub lines: Vec<String>,
    pub outcome: RunOutcome,
}

impl ClientRun {
    pub fn name(&self) -> &'static str {
        self.adapter.name()
    }
}

/// A started client process.
#[derive(Debug)]
pub struct ClientInvocation {
    pub adapter: &'static dyn ClientAdapter,
    pub command_line: String,
    task: JoinHandle<(Vec<String>, RunOutcome)>,
}

impl ClientInvocation {
    /// Start `command` without waiting for it.
    ///
    /// Both output pipes are drained by a spawned task, which kills the
    /// process if it outlives [`ClientCommand::timeout`].
    pub fn launch(
        adapter: &'static dyn ClientAdapter,
        command: ClientCommand,
    ) -> anyhow::Result<Self> {
        let command_line = command.command_line();
        let child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("couldn't start {}: {command_line}", adapter.name()))?;
        debug!("Started {}: {command_line}", adapter.name());
        Ok(Self {
            adapter,
            command_line,
            task: tokio::spawn(reap(child, command)),
        })
    }

    /// Wait for the process to end and collect its trace output.
    pub async fn finish(self) -> ClientRun {
        let (lines, outcome) = match self.task.await {
            Ok(reaped) => reaped,
            Err(e) => (vec![], RunOutcome::Failed(e.to_string())),
        };
        ClientRun {
            adapter: self.adapter,
            command_line: self.command_line,
            lines,
            outcome,
        }
    }
}

async fn reap(child: tokio::process::Child, command: ClientCommand) -> (Vec<String>, RunOutcome) {
    match tokio::time::timeout(command.timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let bytes = match command.stream {
                TraceStream::Stdout => output.stdout,
                TraceStream::Stderr => output.stderr,
            };
            let lines = String::from_utf8_lossy(&bytes)
                .lines()
                .map(|it| it.trim_end_matches('\r').to_owned())
                .collect();
            (lines, RunOutcome::Exited(output.status))
        }
        Ok(Err(e)) => (vec![], RunOutcome::Failed(e.to_string())),
        // the child went down with the timed out future
        Err(_) => {
            if let Some(container) = &command.container {
                kill_container(container).await;
            }
            (vec![], RunOutcome::TimedOut(command.timeout))
        }
    }
}

async fn kill_container(container: &str) {
    let killed = tokio::process::Command::new("docker")
        .args(["kill", container])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match killed {
        Ok(status) if status.success() => debug!("Killed container {container}"),
        Ok(status) => warn!("docker kill {container} exited with {status}"),
        Err(e) => warn!("couldn't run docker kill {container}: {e}"),
    }
}
