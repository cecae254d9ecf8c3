//! Static fork activation table.
//!
//! Clients running a single state test need to know which rules are active at
//! the test's block. Every test runs on a chain where the forks up to and
//! including the one under test are active from genesis, and every later fork
//! is scheduled at [`NOT_ACTIVE`].

use serde_json::{Map, Value};

/// Activation block for rules that are not active for the fork under test.
pub const NOT_ACTIVE: u64 = 2000;

/// Forks a test can be run under, in activation order.
#[allow(clippy::upper_case_acronyms)]
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
    strum::EnumIter,
)]
pub enum Fork {
    Frontier,
    Homestead,
    EIP150,
    EIP158,
    Byzantium,
    Constantinople,
}

impl Fork {
    /// The `config` object injected into a derived test, keyed the way the
    /// clients' genesis files are.
    pub fn chain_config(self) -> Map<String, Value> {
        let at = |fork: Fork| Value::from(if self >= fork { 0 } else { NOT_ACTIVE });
        let mut config = Map::new();
        config.insert("homesteadBlock".into(), at(Fork::Homestead));
        config.insert("eip150Block".into(), at(Fork::EIP150));
        // EIP-155 replay protection shipped together with EIP-158
        config.insert("eip155Block".into(), at(Fork::EIP158));
        config.insert("eip158Block".into(), at(Fork::EIP158));
        config.insert("metropolisBlock".into(), at(Fork::Byzantium));
        config.insert("constantinopleBlock".into(), at(Fork::Constantinople));
        config
    }

    /// The `cpp` client wants `--all` for the oldest forks.
    pub const fn needs_all_flag(self) -> bool {
        matches!(self, Fork::Frontier | Fork::Homestead)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use strum::IntoEnumIterator as _;

    use super::*;

    #[test]
    fn frontier_activates_nothing() {
        let config = Fork::Frontier.chain_config();
        assert_eq!(config.len(), 6);
        assert!(config.values().all(|it| it == &Value::from(NOT_ACTIVE)));
    }

    #[test]
    fn byzantium_activates_everything_up_to_metropolis() {
        let config = Fork::Byzantium.chain_config();
        for key in [
            "homesteadBlock",
            "eip150Block",
            "eip155Block",
            "eip158Block",
            "metropolisBlock",
        ] {
            assert_eq!(config[key], Value::from(0), "{key}");
        }
        assert_eq!(config["constantinopleBlock"], Value::from(NOT_ACTIVE));
    }

    #[test]
    fn homestead_only_activates_homestead() {
        let config = Fork::Homestead.chain_config();
        assert_eq!(config["homesteadBlock"], Value::from(0));
        assert_eq!(config["eip150Block"], Value::from(NOT_ACTIVE));
    }

    #[test]
    fn names_match_fixture_keys() {
        for fork in Fork::iter() {
            assert_eq!(Fork::from_str(&fork.to_string()), Ok(fork));
        }
        assert_eq!(Fork::from_str("EIP158"), Ok(Fork::EIP158));
        assert!(Fork::from_str("Istanbul").is_err());
        assert!(Fork::from_str("byzantium").is_err());
    }
}
