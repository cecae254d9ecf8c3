//! Every EVM client has its own opinion on what a step trace looks like.
//!
//! `geth` prints JSON objects with hex gas on stderr, `parity` adds storage
//! maps, the `cpp` test harness interleaves its own chatter with decimal gas
//! strings, and `py` logs `key=value` records. None of them agree on depth
//! numbering or on how to report the end of execution.
//!
//! This library maps each of those formats onto one sequence of
//! [`CanonicalStep`]s, and then walks several such sequences in lockstep to
//! find the first step at which the clients disagree.
//!
//! - [`native`] holds one canonicalizer per client format.
//! - [`compare`] holds the lockstep comparator and the failure summary
//!   extractor.
//!
//! # Non-Goals
//! - Streaming. A trace is only canonicalized once the client process has
//!   exited and its whole output is available.
//! - Judging which client is right. A divergence only says that they differ.

#![deny(rustdoc::broken_intra_doc_links)]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]

pub mod compare;
pub mod native;
mod number;

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use ethereum_types::{H256, U256};
use itertools::Itertools as _;

pub use compare::{compare_traces, summarize, ClientTrace, ComparisonResult, Summary};
pub use native::Native;
pub use number::{parse_quantity, Quantity, QuantityError};

/// One normalized execution record of a client trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CanonicalStep {
    /// A single executed opcode.
    Exec(ExecStep),
    /// The end of execution, as reported by the client.
    ///
    /// Its presence as the last record means the client terminated normally,
    /// even if it reported none of the optional fields.
    Halt(Halt),
    /// A record that looked like part of the trace but could not be parsed.
    ///
    /// Canonicalizers stop at the first such record, and the comparator
    /// never considers it equal to anything.
    Malformed(String),
}

/// Machine state before an opcode is executed.
///
/// `pc`, `op`, `gas` and `depth` are reported by every supported client. The
/// remaining fields are only compared between clients that report them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecStep {
    /// Program counter.
    pub pc: u64,
    /// Opcode byte.
    pub op: u8,
    /// Gas remaining before the opcode is charged.
    pub gas: U256,
    /// Call depth, starting at 1 for the outermost frame.
    pub depth: u64,
    /// Stack, bottom first.
    pub stack: Option<Vec<U256>>,
    /// Memory contents.
    pub memory: Option<Vec<u8>>,
    /// Storage slots touched so far in the current account.
    pub storage: Option<BTreeMap<U256, U256>>,
}

/// Terminal record of a trace.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Halt {
    /// Post-state root.
    pub state_root: Option<H256>,
    /// Return data of the outermost frame.
    pub output: Option<Vec<u8>>,
    /// Gas consumed by execution.
    pub gas_used: Option<U256>,
    /// Whether execution ended in an exceptional halt or revert.
    pub failed: Option<bool>,
}

impl Halt {
    /// Fold a later partial halt record into this one. Later values win.
    pub fn merge(&mut self, other: Halt) {
        let Halt {
            state_root,
            output,
            gas_used,
            failed,
        } = other;
        self.state_root = state_root.or(self.state_root);
        self.output = output.or(self.output.take());
        self.gas_used = gas_used.or(self.gas_used);
        self.failed = failed.or(self.failed);
    }
}

impl CanonicalStep {
    /// Whether this record marks normal termination.
    pub const fn is_halt(&self) -> bool {
        matches!(self, CanonicalStep::Halt(_))
    }
}

impl Display for CanonicalStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanonicalStep::Exec(step) => step.fmt(f),
            CanonicalStep::Halt(halt) => halt.fmt(f),
            CanonicalStep::Malformed(reason) => write!(f, "malformed trace record: {reason}"),
        }
    }
}

impl Display for ExecStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pc {:>5} op 0x{:02x} gas {:>10} depth {:>2}",
            self.pc,
            self.op,
            // `U256` doesn't honour width
            format!("{:#x}", self.gas),
            self.depth
        )?;
        if let Some(stack) = &self.stack {
            write!(f, " stack [{}]", stack.iter().map(|it| format!("{it:#x}")).join(","))?;
        }
        if let Some(memory) = &self.memory {
            write!(f, " memory 0x{}", hex::encode(memory))?;
        }
        if let Some(storage) = &self.storage {
            write!(
                f,
                " storage {{{}}}",
                storage
                    .iter()
                    .map(|(k, v)| format!("{k:#x}:{v:#x}"))
                    .join(",")
            )?;
        }
        Ok(())
    }
}

impl Display for Halt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("END")?;
        if let Some(root) = &self.state_root {
            write!(f, " stateRoot {root:#x}")?;
        }
        if let Some(output) = &self.output {
            write!(f, " output 0x{}", hex::encode(output))?;
        }
        if let Some(gas_used) = &self.gas_used {
            write!(f, " gasUsed {gas_used:#x}")?;
        }
        if let Some(failed) = self.failed {
            write!(f, " failed {failed}")?;
        }
        Ok(())
    }
}

/// Like `#[serde(with = "::hex")]` on the way in, but tolerates a leading
/// `0x` and odd lengths.
mod hex_bytes {
    use serde::{de::Error as _, Deserialize as _, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::decode_hex(&s).map_err(D::Error::custom)
    }
}

/// Decode a hex string with an optional `0x` prefix. Odd-length strings are
/// left-padded with a zero nibble.
pub(crate) fn decode_hex(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.len() % 2 == 1 {
        hex::decode(format!("0{digits}"))
    } else {
        hex::decode(digits)
    }
}

/// Parse a 32-byte hash with an optional `0x` prefix.
pub(crate) fn parse_h256(s: &str) -> Result<H256, String> {
    let bytes = decode_hex(s).map_err(|e| format!("invalid hash {s:?}: {e}"))?;
    if bytes.len() != 32 {
        return Err(format!("invalid hash {s:?}: expected 32 bytes, got {}", bytes.len()));
    }
    Ok(H256::from_slice(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push1(pc: u64, gas: u64, stack: &[u64]) -> ExecStep {
        ExecStep {
            pc,
            op: 0x60,
            gas: gas.into(),
            depth: 1,
            stack: Some(stack.iter().map(|it| U256::from(*it)).collect()),
            memory: None,
            storage: None,
        }
    }

    #[test]
    fn renders_exec_step_on_one_line() {
        let rendered = CanonicalStep::Exec(push1(2, 99997, &[1, 255])).to_string();
        assert_eq!(
            rendered,
            "pc     2 op 0x60 gas    0x1869d depth  1 stack [0x1,0xff]"
        );
    }

    #[test]
    fn renders_only_reported_halt_fields() {
        let halt = Halt {
            gas_used: Some(9.into()),
            ..Default::default()
        };
        assert_eq!(CanonicalStep::Halt(halt).to_string(), "END gasUsed 0x9");
        assert_eq!(CanonicalStep::Halt(Halt::default()).to_string(), "END");
    }

    #[test]
    fn merging_halts_keeps_earlier_fields() {
        let mut halt = Halt {
            gas_used: Some(21.into()),
            failed: Some(false),
            ..Default::default()
        };
        halt.merge(Halt {
            state_root: Some(H256::repeat_byte(0xab)),
            ..Default::default()
        });
        assert_eq!(halt.gas_used, Some(21.into()));
        assert_eq!(halt.failed, Some(false));
        assert_eq!(halt.state_root, Some(H256::repeat_byte(0xab)));
    }

    #[test]
    fn decodes_odd_length_hex() {
        assert_eq!(decode_hex("0x1").unwrap(), vec![1]);
        assert_eq!(decode_hex("").unwrap(), Vec::<u8>::new());
        assert_eq!(decode_hex("0x").unwrap(), Vec::<u8>::new());
        assert!(parse_h256("0x01").is_err());
    }
}
