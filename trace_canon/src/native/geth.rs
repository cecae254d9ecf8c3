//! go-ethereum's `evm --json statetest` output.
//!
//! One JSON object per step:
//!
//! ```text
//! {"pc":0,"op":96,"gas":"0x186a0","gasCost":"0x3","memSize":0,"stack":[],"depth":1,"refund":0,"opName":"PUSH1","error":""}
//! ```
//!
//! followed by a summary `{"output":"","gasUsed":"0x9","time":141,"error":""}`
//! and a `{"stateRoot":"0x.."}` line. Everything that isn't JSON (logger
//! output, banners) is framing.

use crate::CanonicalStep;

/// Canonicalize a geth trace. Depth is already 1-based.
pub fn canonicalize<S: AsRef<str>>(lines: &[S]) -> Vec<CanonicalStep> {
    super::canonicalize_json_lines(lines, 0, |_| false)
}
