//! General state test fixtures, and their derivation into single-transaction
//! test cases.
//!
//! A fixture's transaction carries arrays of candidate `data`, `gasLimit` and
//! `value` entries, and each post-state under a fork selects one of each by
//! index. Clients are run on one such combination at a time.

use std::fmt;
use std::path::PathBuf;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::forks::Fork;

/// A fixture file: named tests, in file order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Fixture {
    pub tests: Vec<(String, GeneralStateTest)>,
}

/// One named test of a fixture, with all its transaction variants.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct GeneralStateTest {
    pub env: Value,
    pub pre: Value,
    pub transaction: GeneralTransaction,
    /// Expected post-states, keyed by fork name.
    pub post: Map<String, Value>,
    /// `_info`, `config` and whatever else the fixture carries.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct GeneralTransaction {
    pub data: Vec<Value>,
    #[serde(rename = "gasLimit")]
    pub gas_limit: Vec<Value>,
    pub value: Vec<Value>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct PostState {
    pub indexes: Indexes,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Selects one entry of each of a [`GeneralTransaction`]'s arrays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Indexes {
    pub data: usize,
    pub gas: usize,
    pub value: usize,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeriveError {
    #[error("post-state {variant} of {test} selects {field}[{index}], but there are only {len}")]
    IndexOutOfRange {
        test: String,
        variant: usize,
        field: &'static str,
        index: usize,
        len: usize,
    },
    #[error("post-state {variant} of {test} under {fork} is not a valid post-state: {message}")]
    InvalidPostState {
        test: String,
        fork: Fork,
        variant: usize,
        message: String,
    },
}

impl Fixture {
    pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        let de = &mut serde_json::Deserializer::from_slice(bytes);
        Ok(serde_path_to_error::deserialize(de)?)
    }

    /// Split every test into one single-transaction test per post-state under
    /// `fork`, in file order.
    ///
    /// Tests without post-states for `fork` contribute nothing. A post-state
    /// whose indexes can't be resolved yields an error, and doesn't affect the
    /// other post-states of the test.
    pub fn derive(
        &self,
        fork: Fork,
    ) -> impl Iterator<Item = Result<DerivedTest, DeriveError>> + '_ {
        self.tests.iter().flat_map(move |(name, test)| {
            let posts = test
                .post
                .get(&fork.to_string())
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            posts
                .into_iter()
                .enumerate()
                .map(move |(variant, post)| derive_one(name, test, fork, variant, post))
        })
    }
}

/// A single-transaction test, before it's numbered.
#[derive(Clone, Debug, PartialEq)]
pub struct DerivedTest {
    pub name: String,
    /// Position of the post-state under the fork.
    pub variant: usize,
    /// The indexes the post-state originally selected.
    pub indexes: Indexes,
    /// A fixture holding only the derived test.
    pub fixture: Fixture,
}

fn derive_one(
    name: &str,
    test: &GeneralStateTest,
    fork: Fork,
    variant: usize,
    post: Value,
) -> Result<DerivedTest, DeriveError> {
    let mut post = serde_json::from_value::<PostState>(post).map_err(|e| {
        DeriveError::InvalidPostState {
            test: name.to_owned(),
            fork,
            variant,
            message: e.to_string(),
        }
    })?;
    let indexes = post.indexes;
    let pick = |field: &'static str, entries: &[Value], index: usize| {
        entries
            .get(index)
            .cloned()
            .ok_or_else(|| DeriveError::IndexOutOfRange {
                test: name.to_owned(),
                variant,
                field,
                index,
                len: entries.len(),
            })
    };

    let mut derived = test.clone();
    derived.transaction.data = vec![pick("data", &test.transaction.data[..], indexes.data)?];
    derived.transaction.gas_limit =
        vec![pick("gasLimit", &test.transaction.gas_limit[..], indexes.gas)?];
    derived.transaction.value = vec![pick("value", &test.transaction.value[..], indexes.value)?];

    post.indexes = Indexes::default();
    derived.post = Map::from_iter([(
        fork.to_string(),
        Value::Array(vec![serde_json::to_value(post).map_err(|e| {
            DeriveError::InvalidPostState {
                test: name.to_owned(),
                fork,
                variant,
                message: e.to_string(),
            }
        })?]),
    )]);
    derived
        .extra
        .insert("config".into(), Value::Object(fork.chain_config()));

    Ok(DerivedTest {
        name: name.to_owned(),
        variant,
        indexes,
        fixture: Fixture {
            tests: vec![(name.to_owned(), derived)],
        },
    })
}

/// One derived test, numbered and ready to be run on every client.
#[derive(Clone, Debug, PartialEq)]
pub struct TestCase {
    /// Sequence number within the run, starting at 0.
    pub number: usize,
    /// Name of the directory the fixture was found in.
    pub subfolder: String,
    pub name: String,
    pub fork: Fork,
    pub variant: usize,
    pub indexes: Indexes,
    pub fixture: Fixture,
    /// Root of the corpus the fixture lives in. Clients that look tests up
    /// by name need it.
    pub corpus_root: PathBuf,
    /// Where [`TestCase::fixture`] is written before clients are started.
    /// Assigned by the pipeline.
    pub test_file: PathBuf,
}

impl TestCase {
    pub fn new(
        number: usize,
        subfolder: impl Into<String>,
        fork: Fork,
        corpus_root: impl Into<PathBuf>,
        derived: DerivedTest,
    ) -> Self {
        let DerivedTest {
            name,
            variant,
            indexes,
            fixture,
        } = derived;
        Self {
            number,
            subfolder: subfolder.into(),
            name,
            fork,
            variant,
            indexes,
            fixture,
            corpus_root: corpus_root.into(),
            test_file: PathBuf::new(),
        }
    }

    /// `0042-stExample-add11-3`
    pub fn id(&self) -> String {
        format!(
            "{:0>4}-{}-{}-{}",
            self.number, self.subfolder, self.name, self.variant
        )
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.fixture)
    }
}

impl Serialize for Fixture {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.tests.len()))?;
        for (name, test) in &self.tests {
            map.serialize_entry(name, test)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Fixture {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FixtureVisitor;

        impl<'de> Visitor<'de> for FixtureVisitor {
            type Value = Fixture;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of test names to general state tests")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut tests = Vec::with_capacity(access.size_hint().unwrap_or(1));
                while let Some(entry) = access.next_entry::<String, GeneralStateTest>()? {
                    tests.push(entry);
                }
                Ok(Fixture { tests })
            }
        }

        deserializer.deserialize_map(FixtureVisitor)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;

    use super::*;

    /// Two tests, the first with 2 data, 2 gas and 1 value entries and three
    /// Byzantium post-states.
    pub(crate) fn fixture() -> Fixture {
        Fixture::from_slice(
            json!({
                "add11": {
                    "_info": { "comment": "" },
                    "env": { "currentNumber": "0x01" },
                    "pre": {
                        "0x095e7baea6a6c7c4c2dfeb977efac326af552d87": {
                            "code": "0x600160010160005500"
                        }
                    },
                    "transaction": {
                        "data": ["0x", "0x01"],
                        "gasLimit": ["0x061a80", "0x0a"],
                        "value": ["0x0"],
                        "nonce": "0x00",
                        "to": "0x095e7baea6a6c7c4c2dfeb977efac326af552d87"
                    },
                    "post": {
                        "Byzantium": [
                            { "hash": "0x01", "indexes": { "data": 0, "gas": 0, "value": 0 } },
                            { "hash": "0x02", "indexes": { "data": 1, "gas": 0, "value": 0 } },
                            { "hash": "0x03", "indexes": { "data": 1, "gas": 1, "value": 0 } }
                        ],
                        "Homestead": [
                            { "hash": "0x04", "indexes": { "data": 0, "gas": 0, "value": 0 } }
                        ]
                    }
                },
                "add12": {
                    "env": {},
                    "pre": {},
                    "transaction": {
                        "data": ["0x"],
                        "gasLimit": ["0x01"],
                        "value": ["0x0", "0x1"]
                    },
                    "post": {
                        "Byzantium": [
                            { "hash": "0x05", "indexes": { "data": 0, "gas": 0, "value": 1 } }
                        ]
                    }
                }
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn one_case_per_post_state() {
        let fixture = fixture();
        let derived = fixture
            .derive(Fork::Byzantium)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(derived.len(), 4);
        assert_eq!(
            derived
                .iter()
                .map(|it| (it.name.as_str(), it.variant))
                .collect::<Vec<_>>(),
            [("add11", 0), ("add11", 1), ("add11", 2), ("add12", 0)]
        );
        assert_eq!(
            derived[2].indexes,
            Indexes {
                data: 1,
                gas: 1,
                value: 0
            }
        );
        assert_eq!(fixture.derive(Fork::Homestead).count(), 1);
        assert_eq!(fixture.derive(Fork::Frontier).count(), 0);
    }

    #[test]
    fn derived_test_is_narrowed() {
        let fixture = fixture();
        let derived = fixture.derive(Fork::Byzantium).nth(2).unwrap().unwrap();
        let [(name, test)] = &derived.fixture.tests[..] else {
            panic!("expected exactly one test")
        };
        assert_eq!(name, "add11");
        assert_eq!(test.transaction.data, [json!("0x01")]);
        assert_eq!(test.transaction.gas_limit, [json!("0x0a")]);
        assert_eq!(test.transaction.value, [json!("0x0")]);
        assert_eq!(test.transaction.rest["nonce"], json!("0x00"));
        assert_eq!(test.post.len(), 1);
        assert_eq!(
            test.post["Byzantium"],
            json!([{ "hash": "0x03", "indexes": { "data": 0, "gas": 0, "value": 0 } }])
        );
        assert_eq!(test.extra["config"]["metropolisBlock"], json!(0));
        assert_eq!(test.extra["_info"], json!({ "comment": "" }));
    }

    #[test]
    fn derivation_leaves_the_fixture_alone() {
        let fixture = fixture();
        let before = fixture.clone();
        let _ = fixture.derive(Fork::Byzantium).collect::<Vec<_>>();
        assert_eq!(fixture, before);
    }

    #[test]
    fn out_of_range_index_only_fails_its_post_state() {
        let mut fixture = fixture();
        fixture.tests[0].1.post["Byzantium"][1]["indexes"]["gas"] = json!(7);
        let derived = fixture.derive(Fork::Byzantium).collect::<Vec<_>>();
        assert_eq!(derived.len(), 4);
        assert_eq!(
            derived[1],
            Err(DeriveError::IndexOutOfRange {
                test: "add11".into(),
                variant: 1,
                field: "gasLimit",
                index: 7,
                len: 2,
            })
        );
        assert!(derived[0].is_ok());
        assert!(derived[2].is_ok());
    }

    #[test]
    fn file_order_survives_a_round_trip() {
        let fixture = fixture();
        let names = |fixture: &Fixture| {
            fixture
                .tests
                .iter()
                .map(|(name, _)| name.clone())
                .collect::<Vec<_>>()
        };
        let bytes = serde_json::to_vec(&fixture).unwrap();
        assert_eq!(names(&Fixture::from_slice(&bytes).unwrap()), ["add11", "add12"]);
    }

    #[test]
    fn case_id_is_zero_padded() {
        let derived = fixture().derive(Fork::Byzantium).nth(3).unwrap().unwrap();
        let case = TestCase::new(42, "stExample", Fork::Byzantium, "/tests", derived);
        assert_eq!(case.id(), "0042-stExample-add12-0");
    }
}
