use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueHint};
use difftest::pipeline::{RunLimits, DEFAULT_REPORT_INTERVAL};

const LIMITS_HELP_HEADING: &str = "Run limits";

/// Run state tests on several EVM clients and compare their traces
#[derive(Parser)]
#[command(version = difftest::version(), propagate_version = true)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,

    /// The run configuration file.
    #[arg(
        short,
        long,
        env = "DIFFTEST_CONFIG",
        default_value = "difftest.toml",
        value_hint = ValueHint::FilePath
    )]
    pub(crate) config: PathBuf,

    /// Run under this fork instead of the configured one.
    #[arg(long, env = "DIFFTEST_FORK")]
    pub(crate) fork: Option<String>,

    /// Comma separated clients to run instead of the configured ones.
    #[arg(long, env = "DIFFTEST_CLIENTS", value_delimiter = ',')]
    pub(crate) clients: Option<Vec<String>>,

    #[clap(flatten)]
    pub(crate) limits: CliRunLimits,
}

#[derive(Args, Clone, Debug)]
pub(crate) struct CliRunLimits {
    /// Stop after this many tests.
    #[arg(long, env = "DIFFTEST_MAX_CASES", help_heading = LIMITS_HELP_HEADING)]
    pub(crate) max_cases: Option<usize>,
    /// Stop starting new tests after this many seconds.
    #[arg(long, env = "DIFFTEST_MAX_DURATION", help_heading = LIMITS_HELP_HEADING)]
    pub(crate) max_duration: Option<u64>,
    /// Log progress every this many tests.
    #[arg(
        long,
        env = "DIFFTEST_REPORT_INTERVAL",
        help_heading = LIMITS_HELP_HEADING,
        default_value_t = DEFAULT_REPORT_INTERVAL
    )]
    pub(crate) report_interval: usize,
}

impl From<CliRunLimits> for RunLimits {
    fn from(cli: CliRunLimits) -> Self {
        Self {
            max_cases: cli.max_cases,
            max_duration: cli.max_duration.map(Duration::from_secs),
            report_interval: cli.report_interval,
        }
    }
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Runs every test of a fixture corpus.
    Corpus {
        /// The corpus root, containing `GeneralStateTests/`.
        #[arg(short, long, env = "DIFFTEST_TESTS_PATH", value_hint = ValueHint::DirPath)]
        tests_path: Option<PathBuf>,
        /// Skip tests numbered below this, to resume an interrupted run.
        #[arg(short, long, default_value_t = 0)]
        start_index: usize,
        /// More test names to skip. A trailing `*` matches any suffix.
        #[arg(long, value_delimiter = ',')]
        skip: Vec<String>,
    },
    /// Runs randomly generated tests until interrupted.
    Generate {
        /// Continue naming generated tests from this counter.
        #[arg(short, long, default_value_t = 0)]
        resume_counter: u64,
    },
    /// Prints the steps around the first divergence of a combined trace.
    Summary {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
    },
}
