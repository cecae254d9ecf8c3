//! Lockstep comparison of canonical traces.
//!
//! All traces are walked by step index. At each index, every field reported
//! by at least two clients must agree among the clients reporting it; fields
//! a client doesn't report are simply not compared for that client.
//!
//! When one trace ends before another, the remainder is only tolerated if
//! every trace that ended did so with a [`CanonicalStep::Halt`] and the rest
//! of every longer trace consists of nothing but halt records. Anything else
//! is a divergence at the index where the shorter trace stopped.

use std::fmt::{self, Display};

use itertools::Itertools as _;

use crate::{CanonicalStep, ExecStep, Halt};

/// Prefix of a combined-trace line on which all clients agree.
pub const AGREEMENT_MARKER: &str = "[OK]";
/// Prefix of a combined-trace line showing one client's view of a divergent
/// step.
pub const DIVERGENCE_MARKER: &str = "[!!]";
/// Default number of lines kept before the first divergence by [`summarize`].
pub const SUMMARY_PRECEDING_LINES: usize = 20;
/// Default number of lines kept from the first divergence on by
/// [`summarize`].
pub const SUMMARY_FOLLOWING_LINES: usize = 5;

/// The canonical trace of one client for one test case.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientTrace {
    /// Client name, used to label divergent lines.
    pub client: String,
    /// Steps in execution order.
    pub steps: Vec<CanonicalStep>,
}

impl ClientTrace {
    /// Create a trace for `client`.
    pub fn new(client: impl Into<String>, steps: Vec<CanonicalStep>) -> Self {
        Self {
            client: client.into(),
            steps,
        }
    }
}

/// Outcome of comparing the traces of all clients for one test case.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComparisonResult {
    /// Whether no two clients disagree anywhere.
    pub equivalent: bool,
    /// The combined trace. An agreed step is one [`AGREEMENT_MARKER`] line;
    /// a divergent step is one [`DIVERGENCE_MARKER`] line per client.
    pub lines: Vec<String>,
    /// Index of the first divergent step.
    ///
    /// Every step before it is a single line, so this is also the index of
    /// the first divergent line in [`ComparisonResult::lines`].
    pub first_divergence: Option<usize>,
}

/// Compare the traces of all clients, in the given order.
pub fn compare_traces(traces: &[ClientTrace]) -> ComparisonResult {
    let len = traces.iter().map(|it| it.steps.len()).max().unwrap_or(0);
    let mut lines = Vec::with_capacity(len);
    let mut first_divergence = None;

    for index in 0..len {
        let at = traces
            .iter()
            .map(|it| it.steps.get(index))
            .collect::<Vec<_>>();

        if steps_agree(traces, index, &at) {
            if let Some(step) = at.iter().flatten().next() {
                lines.push(format!("{AGREEMENT_MARKER} {step}"));
            }
            continue;
        }

        first_divergence.get_or_insert(index);
        for (trace, step) in traces.iter().zip(&at) {
            let client = &trace.client;
            match step {
                Some(step) => lines.push(format!("{DIVERGENCE_MARKER} {client:>8}: {step}")),
                None => lines.push(format!("{DIVERGENCE_MARKER} {client:>8}: --")),
            }
        }
    }

    if let Some(index) = first_divergence {
        log::debug!("traces diverge at step {index} of {len}");
    }

    ComparisonResult {
        equivalent: first_divergence.is_none(),
        lines,
        first_divergence,
    }
}

fn steps_agree(traces: &[ClientTrace], index: usize, at: &[Option<&CanonicalStep>]) -> bool {
    if at.iter().any(Option::is_none) {
        let ended_normally = traces
            .iter()
            .zip(at)
            .filter(|(_, step)| step.is_none())
            .all(|(trace, _)| trace.steps.last().is_some_and(CanonicalStep::is_halt));
        let only_halts_left = traces.iter().all(|trace| {
            trace
                .steps
                .get(index..)
                .map_or(true, |rest| rest.iter().all(CanonicalStep::is_halt))
        });
        if !(ended_normally && only_halts_left) {
            return false;
        }
    }

    let present = at.iter().flatten().copied().collect::<Vec<_>>();
    if let Some(execs) = present
        .iter()
        .map(|it| match it {
            CanonicalStep::Exec(step) => Some(step),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()
    {
        return execs_agree(&execs);
    }
    if let Some(halts) = present
        .iter()
        .map(|it| match it {
            CanonicalStep::Halt(halt) => Some(halt),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()
    {
        return halts_agree(&halts);
    }
    // mixed kinds, or a malformed record
    false
}

/// Values agree if all clients that reported one reported the same.
fn agree<'a, T: PartialEq + 'a>(values: impl IntoIterator<Item = Option<&'a T>>) -> bool {
    values.into_iter().flatten().all_equal()
}

fn execs_agree(steps: &[&ExecStep]) -> bool {
    steps.iter().map(|it| it.pc).all_equal()
        && steps.iter().map(|it| it.op).all_equal()
        && steps.iter().map(|it| it.gas).all_equal()
        && steps.iter().map(|it| it.depth).all_equal()
        && agree(steps.iter().map(|it| it.stack.as_ref()))
        && agree(steps.iter().map(|it| it.memory.as_ref()))
        && agree(steps.iter().map(|it| it.storage.as_ref()))
}

fn halts_agree(halts: &[&Halt]) -> bool {
    agree(halts.iter().map(|it| it.state_root.as_ref()))
        && agree(halts.iter().map(|it| it.output.as_ref()))
        && agree(halts.iter().map(|it| it.gas_used.as_ref()))
        && agree(halts.iter().map(|it| it.failed.as_ref()))
}

/// A bounded window around the first divergence of a combined trace.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Lines immediately before the first divergent line.
    pub preceding: Vec<String>,
    /// The first divergent line and the lines right after it.
    pub divergence: Vec<String>,
    /// Number of lines before the first divergent line, if there is one.
    pub steps_before: Option<usize>,
}

/// Extract up to `preceding` lines before the first [`DIVERGENCE_MARKER`]
/// line, and up to `following` lines starting at it.
///
/// Without a divergence, the last `preceding` lines are kept.
pub fn summarize<S: AsRef<str>>(lines: &[S], preceding: usize, following: usize) -> Summary {
    let owned = |lines: &[S]| {
        lines
            .iter()
            .map(|it| it.as_ref().to_owned())
            .collect::<Vec<_>>()
    };
    match lines
        .iter()
        .position(|it| it.as_ref().starts_with(DIVERGENCE_MARKER))
    {
        Some(index) => Summary {
            preceding: owned(&lines[index.saturating_sub(preceding)..index]),
            divergence: owned(&lines[index..lines.len().min(index + following)]),
            steps_before: Some(index),
        },
        None => Summary {
            preceding: owned(&lines[lines.len().saturating_sub(preceding)..]),
            divergence: Vec::new(),
            steps_before: None,
        },
    }
}

impl Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.preceding {
            writeln!(f, "{line}")?;
        }
        if let Some(steps) = self.steps_before {
            writeln!(f, "\n---- [ {steps} steps in total before diff ]-------\n")?;
        }
        for line in &self.divergence {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}
