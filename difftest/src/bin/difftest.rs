use anyhow::{Context as _, Result};
use clap::Parser;
use ::difftest::config::ConfigFile;
use ::difftest::env::load_dotenvy_vars_if_present;
use ::difftest::pipeline::Orchestrator;
use ::difftest::supplier::{CaseStream, Corpus, Generator, GeneratorState};
use cli::Command;
use tokio::sync::watch;
use trace_canon::compare::{SUMMARY_FOLLOWING_LINES, SUMMARY_PRECEDING_LINES};
use tracing::{info, warn};

use self::difftest::*;
mod difftest {
    pub mod cli;
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenvy_vars_if_present();
    ::difftest::tracing::init();

    let args = cli::Cli::parse();

    if let Command::Summary { file } = &args.command {
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("couldn't read {}", file.display()))?;
        let lines = text.lines().collect::<Vec<_>>();
        print!(
            "{}",
            trace_canon::summarize(&lines, SUMMARY_PRECEDING_LINES, SUMMARY_FOLLOWING_LINES)
        );
        return Ok(());
    }

    let mut file = ConfigFile::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(fork) = args.fork {
        file.fork = fork;
    }
    if let Some(clients) = args.clients {
        file.clients = clients;
    }
    if let Command::Corpus {
        tests_path, skip, ..
    } = &args.command
    {
        file.skip.extend(skip.iter().cloned());
        if tests_path.is_some() {
            file.tests_path.clone_from(tests_path);
        }
    }
    let config = file.resolve()?;
    config.report();

    let cases: CaseStream = match args.command {
        Command::Corpus { start_index, .. } => Corpus {
            tests_path: config
                .tests_path
                .clone()
                .context("no `tests_path` configured")?,
            fork: config.fork,
            skip: config.skip.clone(),
            start_index,
        }
        .into_stream(),
        Command::Generate { resume_counter } => {
            let generator = config
                .generator
                .clone()
                .context("no `[generator]` with a `binary` or `docker_name` configured")?;
            Generator {
                location: generator.location,
                root: generator.generated_path,
                fork: config.fork,
                backoff: generator.backoff,
                timeout: generator.timeout,
                state: GeneratorState::new(resume_counter),
            }
            .into_stream()
        }
        Command::Summary { .. } => unreachable!("Summaries have already been handled."),
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing the tests in flight");
            let _ = stop_tx.send(true);
        }
    });

    let stats = Orchestrator::new(&config, args.limits.into())
        .run(cases, stop_rx)
        .await?;
    info!(
        "Finished {} tests: {} passed, {} failed",
        stats.total(),
        stats.passed,
        stats.failed
    );
    Ok(())
}
