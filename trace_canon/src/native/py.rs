//! pyethereum `run_statetest.py` output.
//!
//! The VM logs one `key=value` record per step, alongside unrelated log
//! records from other components:
//!
//! ```text
//! eth.pb.tx applying tx nonce=0
//! vm.op pc=0 inst=96 gas=100000 depth=0 stack=[]
//! vm.op pc=2 inst=1 gas=99994 depth=0 stack=[1,2]
//! vm.end root=0x5dd1.. gas_used=9
//! ```
//!
//! Numbers are decimal and depth starts at 0.

use std::collections::HashMap;

use ethereum_types::U256;

use crate::{parse_quantity, CanonicalStep, ExecStep, Halt};

const OP_RECORD: &str = "vm.op";
const END_RECORD: &str = "vm.end";

/// Canonicalize a pyethereum log. Records other than `vm.op` and `vm.end`
/// are ignored.
pub fn canonicalize<S: AsRef<str>>(lines: &[S]) -> Vec<CanonicalStep> {
    let mut steps = Vec::new();
    for line in lines {
        let line = line.as_ref().trim();
        let record = if let Some(rest) = line.strip_prefix(OP_RECORD) {
            op_record(rest).map(CanonicalStep::Exec)
        } else if let Some(rest) = line.strip_prefix(END_RECORD) {
            end_record(rest).map(CanonicalStep::Halt)
        } else {
            continue;
        };
        match record {
            Ok(step) => steps.push(step),
            Err(reason) => {
                log::debug!("stopping at malformed trace record {line:?}: {reason}");
                steps.push(CanonicalStep::Malformed(reason));
                break;
            }
        }
    }
    steps
}

/// Split `k=v k=v ...` into a map. The `stack=[..]` value contains no spaces.
fn key_values(rest: &str) -> Result<HashMap<&str, &str>, String> {
    rest.split_whitespace()
        .map(|pair| {
            pair.split_once('=')
                .ok_or_else(|| format!("expected key=value, got {pair:?}"))
        })
        .collect()
}

fn required<'a>(fields: &HashMap<&str, &'a str>, key: &str) -> Result<&'a str, String> {
    fields
        .get(key)
        .copied()
        .ok_or_else(|| format!("missing `{key}`"))
}

fn number(fields: &HashMap<&str, &str>, key: &str) -> Result<U256, String> {
    parse_quantity(required(fields, key)?).map_err(|e| format!("`{key}`: {e}"))
}

fn small<T: TryFrom<u64>>(fields: &HashMap<&str, &str>, key: &str) -> Result<T, String> {
    let value = number(fields, key)?;
    if value > U256::from(u64::MAX) {
        return Err(format!("`{key}` out of range"));
    }
    T::try_from(value.low_u64()).map_err(|_| format!("`{key}` out of range"))
}

fn op_record(rest: &str) -> Result<ExecStep, String> {
    let fields = key_values(rest)?;
    let stack = match fields.get("stack") {
        None => None,
        Some(raw) => {
            let inner = raw
                .strip_prefix('[')
                .and_then(|it| it.strip_suffix(']'))
                .ok_or_else(|| format!("malformed stack {raw:?}"))?;
            Some(
                inner
                    .split(',')
                    .filter(|it| !it.is_empty())
                    .map(|it| parse_quantity(it).map_err(|e| format!("stack item: {e}")))
                    .collect::<Result<Vec<_>, _>>()?,
            )
        }
    };
    Ok(ExecStep {
        pc: small(&fields, "pc")?,
        op: small(&fields, "inst")?,
        gas: number(&fields, "gas")?,
        depth: small::<u64>(&fields, "depth")? + 1,
        stack,
        memory: None,
        storage: None,
    })
}

fn end_record(rest: &str) -> Result<Halt, String> {
    let fields = key_values(rest)?;
    Ok(Halt {
        state_root: fields
            .get("root")
            .map(|it| crate::parse_h256(it))
            .transpose()?,
        output: None,
        gas_used: fields
            .get("gas_used")
            .map(|_| number(&fields, "gas_used"))
            .transpose()?,
        failed: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_depth_and_decimal_stack() {
        let steps = canonicalize(&[
            "eth.pb.tx applying tx nonce=0",
            "vm.op pc=4 inst=1 gas=99994 depth=0 stack=[1,2]",
            "vm.end gas_used=9",
        ]);
        assert_eq!(
            steps,
            vec![
                CanonicalStep::Exec(ExecStep {
                    pc: 4,
                    op: 1,
                    gas: U256::from(99_994),
                    depth: 1,
                    stack: Some(vec![U256::from(1), U256::from(2)]),
                    memory: None,
                    storage: None,
                }),
                CanonicalStep::Halt(Halt {
                    gas_used: Some(U256::from(9)),
                    ..Default::default()
                }),
            ]
        );
    }

    #[test]
    fn empty_stack() {
        let steps = canonicalize(&["vm.op pc=0 inst=96 gas=100000 depth=0 stack=[]"]);
        let [CanonicalStep::Exec(step)] = &steps[..] else {
            panic!("expected one step")
        };
        assert_eq!(step.stack, Some(vec![]));
    }

    #[test]
    fn missing_field_is_malformed() {
        let steps = canonicalize(&[
            "vm.op pc=0 inst=96 gas=100000 depth=0 stack=[]",
            "vm.op pc=2 inst=96 depth=0 stack=[1]",
            "vm.op pc=4 inst=1 gas=99994 depth=0 stack=[1,2]",
        ]);
        assert_eq!(steps.len(), 2);
        assert_eq!(
            steps[1],
            CanonicalStep::Malformed("missing `gas`".to_owned())
        );
    }

    #[test]
    fn opcode_must_fit_a_byte() {
        let steps = canonicalize(&["vm.op pc=0 inst=256 gas=1 depth=0"]);
        assert!(matches!(steps[..], [CanonicalStep::Malformed(_)]));
    }
}
