//! aleth `testeth --jsontrace` output.
//!
//! The test harness prints its own progress lines around the trace:
//!
//! ```text
//! Running tests using path: "/tests"
//! Running 1 test case...
//! {"depth":1,"gas":"100000","gasCost":"3","op":96,"opName":"PUSH1","pc":0,"stack":[]}
//! *** No errors detected
//! ```
//!
//! Gas is a decimal string. There is no summary record; the harness' final
//! verdict line is the only sign that execution finished.

use crate::CanonicalStep;

/// The harness' closing verdict: `*** No errors detected`, or
/// `*** 1 failure is detected in the test module ..` when its own post-state
/// check failed. Either way execution ran to completion.
fn is_harness_verdict(line: &str) -> bool {
    let line = line.trim();
    line.starts_with("*** ") && line.contains(" detected")
}

/// Canonicalize a `testeth` trace, including its harness output.
pub fn canonicalize<S: AsRef<str>>(lines: &[S]) -> Vec<CanonicalStep> {
    super::canonicalize_json_lines(lines, 0, is_harness_verdict)
}

#[cfg(test)]
mod tests {
    use ethereum_types::U256;

    use super::*;
    use crate::Halt;

    #[test]
    fn decimal_gas_and_harness_verdict() {
        let steps = canonicalize(&[
            "Running 1 test case...",
            r#"{"depth":1,"gas":"100000","gasCost":"3","op":96,"opName":"PUSH1","pc":0,"stack":[]}"#,
            "",
            "*** No errors detected",
        ]);
        assert_eq!(steps.len(), 2);
        let CanonicalStep::Exec(step) = &steps[0] else {
            panic!("expected a step")
        };
        assert_eq!(step.gas, U256::from(100_000));
        assert_eq!(steps[1], CanonicalStep::Halt(Halt::default()));
    }

    #[test]
    fn crashed_harness_has_no_halt() {
        let steps = canonicalize(&[
            r#"{"depth":1,"gas":"100000","gasCost":"3","op":96,"opName":"PUSH1","pc":0,"stack":[]}"#,
            "unknown location(0): fatal error: in \"GeneralStateTests/stRandom\": std::exception",
        ]);
        assert!(!steps.last().unwrap().is_halt());
    }
}
