//! Where test cases come from.
//!
//! Both suppliers produce a lazy stream of [`TestCase`]s numbered from 0.
//! Problems with individual fixtures are yielded as errors, and the stream
//! carries on.

pub mod corpus;
pub mod generator;

use std::collections::HashSet;
use std::pin::Pin;

use futures::Stream;

use crate::statetest::TestCase;

pub use corpus::Corpus;
pub use generator::{Generator, GeneratorState};

/// The async stream of test cases.
pub type CaseStream = Pin<Box<dyn Stream<Item = anyhow::Result<TestCase>> + Send>>;

/// Names of tests that aren't run.
///
/// An entry ending in `*` matches every name starting with the rest of the
/// entry. Other entries match exactly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SkipList {
    exact: HashSet<String>,
    prefixes: Vec<String>,
}

impl SkipList {
    pub fn new<S: AsRef<str>>(entries: impl IntoIterator<Item = S>) -> Self {
        let mut skip = Self::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            match entry.strip_suffix('*') {
                Some(prefix) => skip.prefixes.push(prefix.to_owned()),
                None => {
                    skip.exact.insert(entry.to_owned());
                }
            }
        }
        skip
    }

    pub fn matches(&self, name: &str) -> bool {
        self.exact.contains(name) || self.prefixes.iter().any(|it| name.starts_with(it.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }
}
