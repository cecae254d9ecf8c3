//! Compare recorded client outputs under `tests/cases`.
//!
//! Each case directory holds one `<client>.log` per client that took part,
//! and an `expected.json` with the comparison outcome.

use std::{fs, str::FromStr as _};

use anyhow::Context as _;
use assert2::check;
use camino::{Utf8Path, Utf8PathBuf};
use libtest_mimic::{Arguments, Trial};
use serde::Deserialize;
use trace_canon::{compare_traces, ClientTrace, Native};

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Expected {
    equivalent: bool,
    #[serde(default)]
    first_divergence: Option<usize>,
}

struct Case {
    name: String,
    logs: Vec<(Native, Vec<String>)>,
    expected: Expected,
}

fn main() -> anyhow::Result<()> {
    let mut trials = vec![];
    for Case {
        name,
        logs,
        expected,
    } in cases()?
    {
        for (native, lines) in logs.clone() {
            trials.push(Trial::test(format!("{name}/{native}"), move || {
                let steps = native.canonicalize(&lines);
                check!(!steps.is_empty());
                check!(steps == native.canonicalize(&lines));
                Ok(())
            }));
        }
        trials.push(Trial::test(name, move || {
            let traces = logs
                .iter()
                .map(|(native, lines)| {
                    ClientTrace::new(native.to_string(), native.canonicalize(lines))
                })
                .collect::<Vec<_>>();
            let result = compare_traces(&traces);
            check!(result.equivalent == expected.equivalent);
            check!(result.first_divergence == expected.first_divergence);
            if let Some(index) = result.first_divergence {
                check!(result.lines[index].starts_with(trace_canon::compare::DIVERGENCE_MARKER));
            }
            Ok(())
        }));
    }
    libtest_mimic::run(&Arguments::from_args(), trials).exit()
}

fn cases() -> anyhow::Result<Vec<Case>> {
    glob::glob(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/cases/*/expected.json"))
        .expect("valid glob pattern")
        .map(|res| {
            let expected_path = res.context("filesystem error discovering test cases")?;
            let expected_path = Utf8PathBuf::from_path_buf(expected_path)
                .map_err(|_| anyhow::anyhow!("non-UTF-8 path"))?;
            Case::load(&expected_path).context(format!("couldn't load case {expected_path}"))
        })
        .collect()
}

impl Case {
    /// `expected_path` MUST be `<case>/expected.json`
    fn load(expected_path: &Utf8Path) -> anyhow::Result<Self> {
        let dir = expected_path.parent().context("no case directory")?;
        let expected = serde_json::from_str(&fs::read_to_string(expected_path)?)?;
        let mut logs = vec![];
        for entry in dir.read_dir_utf8()? {
            let path = entry?.into_path();
            if path.extension() != Some("log") {
                continue;
            }
            let stem = path.file_stem().context("bad log name")?;
            let native = Native::from_str(stem).context(format!("unknown client {stem}"))?;
            let lines = fs::read_to_string(&path)?
                .lines()
                .map(str::to_owned)
                .collect();
            logs.push((native, lines));
        }
        logs.sort_by_key(|(native, _)| *native);
        Ok(Self {
            name: dir.file_name().context("bad case name")?.to_owned(),
            logs,
            expected,
        })
    }
}
