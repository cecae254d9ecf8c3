//! Per-client trace formats.
//!
//! Each submodule exposes a pure `canonicalize` function from the raw output
//! lines of one client run to a sequence of [`CanonicalStep`]s. Running it
//! twice on the same lines yields the same sequence.

pub mod cpp;
pub mod geth;
pub mod parity;
pub mod py;

use std::collections::BTreeMap;

use ethereum_types::U256;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{CanonicalStep, ExecStep, Halt, Quantity};

/// The trace formats this library understands, one per client.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum Native {
    /// go-ethereum `evm --json statetest`.
    Geth,
    /// OpenEthereum / parity `evmbin state-test --json`.
    Parity,
    /// aleth `testeth --jsontrace`.
    Cpp,
    /// pyethereum `run_statetest.py`.
    Py,
}

impl Native {
    /// Canonicalize the raw output of a client speaking this format.
    pub fn canonicalize<S: AsRef<str>>(self, lines: &[S]) -> Vec<CanonicalStep> {
        match self {
            Native::Geth => geth::canonicalize(lines),
            Native::Parity => parity::canonicalize(lines),
            Native::Cpp => cpp::canonicalize(lines),
            Native::Py => py::canonicalize(lines),
        }
    }
}

/// A step record shared by the JSON-speaking clients. Unknown fields
/// (`opName`, `gasCost`, `refund`, ...) are ignored.
#[derive(Deserialize)]
struct JsonStep {
    pc: u64,
    op: u8,
    gas: Quantity,
    depth: u64,
    #[serde(default)]
    stack: Option<Vec<Quantity>>,
    #[serde(default)]
    memory: Option<JsonMemory>,
    #[serde(default)]
    storage: Option<BTreeMap<String, Quantity>>,
}

/// Memory is either one hex blob or a list of hex words, depending on the
/// client version.
#[derive(Deserialize)]
#[serde(untagged)]
enum JsonMemory {
    Blob(#[serde(with = "crate::hex_bytes")] Vec<u8>),
    Words(Vec<String>),
}

/// What a single JSON line turned out to be.
enum JsonRecord {
    Step(ExecStep),
    Halt(Halt),
    Malformed(String),
    /// Not part of the trace.
    Framing,
}

/// Classify one output line of a JSON-speaking client.
///
/// `depth_offset` is added to the reported depth to make it 1-based.
fn json_record(line: &str, depth_offset: u64) -> JsonRecord {
    let line = line.trim();
    if !line.starts_with('{') {
        return JsonRecord::Framing;
    }
    let object = match serde_json::from_str::<Map<String, Value>>(line) {
        Ok(object) => object,
        // a step record we can't read is a problem, a garbled log line isn't
        Err(e) if line.contains("\"pc\"") => return JsonRecord::Malformed(e.to_string()),
        Err(_) => return JsonRecord::Framing,
    };

    if object.contains_key("pc") {
        return match serde_json::from_value::<JsonStep>(Value::Object(object)) {
            Ok(step) => match exec_step(step, depth_offset) {
                Ok(step) => JsonRecord::Step(step),
                Err(e) => JsonRecord::Malformed(e),
            },
            Err(e) => JsonRecord::Malformed(e.to_string()),
        };
    }

    match json_halt(&object) {
        Ok(Some(halt)) => JsonRecord::Halt(halt),
        Ok(None) => JsonRecord::Framing,
        Err(e) => JsonRecord::Malformed(e),
    }
}

fn exec_step(step: JsonStep, depth_offset: u64) -> Result<ExecStep, String> {
    let JsonStep {
        pc,
        op,
        gas,
        depth,
        stack,
        memory,
        storage,
    } = step;
    let memory = match memory {
        None => None,
        Some(JsonMemory::Blob(bytes)) => Some(bytes),
        Some(JsonMemory::Words(words)) => Some(
            words
                .iter()
                .map(|word| crate::decode_hex(word))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("invalid memory word: {e}"))?
                .concat(),
        ),
    };
    let storage = match storage {
        None => None,
        Some(slots) => Some(
            slots
                .into_iter()
                .map(|(slot, value)| {
                    crate::parse_quantity(&slot)
                        .map(|slot| (slot, U256::from(value)))
                        .map_err(|e| format!("invalid storage slot: {e}"))
                })
                .collect::<Result<BTreeMap<_, _>, _>>()?,
        ),
    };
    Ok(ExecStep {
        pc,
        op,
        gas: gas.into(),
        depth: depth + depth_offset,
        stack: stack.map(|stack| stack.into_iter().map(U256::from).collect()),
        memory,
        storage,
    })
}

/// Read the halt-related fields of a summary object. Returns `None` unless
/// the object carries a state root, output or gas used. An `error` on its own
/// is a log record, not a summary.
///
/// Field aliases: `stateRoot`/`root`, `output`/`return`, `gasUsed`/`gas_used`.
fn json_halt(object: &Map<String, Value>) -> Result<Option<Halt>, String> {
    let root = field(object, &["stateRoot", "root"]);
    let output = field(object, &["output", "return"]);
    let gas_used = field(object, &["gasUsed", "gas_used"]);
    if root.is_none() && output.is_none() && gas_used.is_none() {
        return Ok(None);
    }
    let error = object.get("error");

    let string = |value: &Value, name: &str| {
        value
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| format!("expected a string for `{name}`, got {value}"))
    };

    let state_root = root
        .map(|it| string(it, "stateRoot").and_then(|it| crate::parse_h256(&it)))
        .transpose()?;
    let output = output
        .map(|it| {
            string(it, "output")
                .and_then(|it| crate::decode_hex(&it).map_err(|e| format!("invalid output: {e}")))
        })
        .transpose()?;
    let gas_used = gas_used
        .map(|it| {
            serde_json::from_value::<Quantity>(it.clone())
                .map(U256::from)
                .map_err(|e| format!("invalid gasUsed: {e}"))
        })
        .transpose()?;
    let failed = match error {
        Some(Value::Null) => Some(false),
        Some(Value::String(message)) => Some(!message.is_empty()),
        Some(other) => return Err(format!("expected a string for `error`, got {other}")),
        // a summary with output but no error field is a success
        None if output.is_some() => Some(false),
        None => None,
    };

    Ok(Some(Halt {
        state_root,
        output,
        gas_used,
        failed,
    }))
}

fn field<'a>(object: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| object.get(*name))
}

/// Shared driver for the JSON-line clients.
///
/// Consecutive summary records are folded into one [`Halt`]. If
/// `halt_on_framing` returns true for a framing line, an empty [`Halt`] is
/// recorded for it unless one is already pending.
fn canonicalize_json_lines<S: AsRef<str>>(
    lines: &[S],
    depth_offset: u64,
    halt_on_framing: impl Fn(&str) -> bool,
) -> Vec<CanonicalStep> {
    let mut steps = Vec::new();
    let mut pending_halt: Option<Halt> = None;
    for line in lines {
        let line = line.as_ref();
        match json_record(line, depth_offset) {
            JsonRecord::Step(step) => {
                if let Some(halt) = pending_halt.take() {
                    steps.push(CanonicalStep::Halt(halt));
                }
                steps.push(CanonicalStep::Exec(step));
            }
            JsonRecord::Halt(halt) => match &mut pending_halt {
                Some(pending) => pending.merge(halt),
                None => pending_halt = Some(halt),
            },
            JsonRecord::Malformed(reason) => {
                log::debug!("stopping at malformed trace record {line:?}: {reason}");
                if let Some(halt) = pending_halt.take() {
                    steps.push(CanonicalStep::Halt(halt));
                }
                steps.push(CanonicalStep::Malformed(reason));
                return steps;
            }
            JsonRecord::Framing => {
                if halt_on_framing(line) && pending_halt.is_none() {
                    pending_halt = Some(Halt::default());
                }
            }
        }
    }
    steps.extend(pending_halt.map(CanonicalStep::Halt));
    steps
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use strum::IntoEnumIterator as _;

    use super::*;

    #[test]
    fn names_round_trip() {
        for native in Native::iter() {
            assert_eq!(Native::from_str(&native.to_string()), Ok(native));
        }
        assert_eq!(Native::from_str("geth"), Ok(Native::Geth));
        assert!(Native::from_str("besu").is_err());
    }

    #[test]
    fn memory_words_are_concatenated() {
        let record = json_record(
            r#"{"pc":0,"op":0,"gas":"0x1","depth":1,"memory":["0x01","0x0203"]}"#,
            0,
        );
        let JsonRecord::Step(step) = record else {
            panic!("expected a step")
        };
        assert_eq!(step.memory, Some(vec![1, 2, 3]));
    }

    #[test]
    fn step_with_wrong_field_type_is_malformed() {
        assert!(matches!(
            json_record(r#"{"pc":0,"op":"PUSH1","gas":"0x1","depth":1}"#, 0),
            JsonRecord::Malformed(_)
        ));
        assert!(matches!(
            json_record(r#"{"pc":0,"op":96,"gas":"0x1","depth":1"#, 0),
            JsonRecord::Malformed(_)
        ));
    }

    #[test]
    fn unrelated_json_is_framing() {
        assert!(matches!(
            json_record(r#"{"level":"info","msg":"hello"}"#, 0),
            JsonRecord::Framing
        ));
        assert!(matches!(json_record("{not json", 0), JsonRecord::Framing));
    }

    #[test]
    fn error_alone_is_not_a_summary() {
        for line in [
            r#"{"error":"database closed"}"#,
            r#"{"level":"error","error":"state root mismatch","t":"2017-10-19"}"#,
        ] {
            assert!(matches!(json_record(line, 0), JsonRecord::Framing), "{line}");
        }
        assert!(matches!(
            json_record(r#"{"error":"Out of gas","gasUsed":"0x186a0","time":1231}"#, 0),
            JsonRecord::Halt(Halt {
                failed: Some(true),
                ..
            })
        ));
    }

    #[test]
    fn logger_error_between_steps_is_ignored() {
        let steps = canonicalize_json_lines(
            &[
                r#"{"pc":0,"op":96,"gas":"0x186a0","stack":[],"depth":1}"#,
                r#"{"error":"peer dropped"}"#,
                r#"{"pc":2,"op":0,"gas":"0x1869d","stack":["0x1"],"depth":1}"#,
            ],
            0,
            |_| false,
        );
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|it| matches!(it, CanonicalStep::Exec(_))));
    }
}
