//! parity `evmbin state-test --json` output.
//!
//! Steps look like geth's but carry the touched `storage` of the current
//! account and no error field:
//!
//! ```text
//! {"pc":0,"op":96,"opName":"PUSH1","gas":"0x186a0","stack":[],"storage":{},"depth":1}
//! ```
//!
//! Execution ends with either `{"output":"0x","gasUsed":"0x9","time":1231}`
//! or `{"error":"Out of gas","gasUsed":"0x186a0","time":1231}`, then
//! `{"stateRoot":"0x.."}`.

use crate::CanonicalStep;

/// Canonicalize a parity trace.
pub fn canonicalize<S: AsRef<str>>(lines: &[S]) -> Vec<CanonicalStep> {
    super::canonicalize_json_lines(lines, 0, |_| false)
}
