//! Run configuration, read from a TOML file.
//!
//! ```toml
//! clients = ["geth", "parity", "cpp"]
//! fork = "Byzantium"
//! tests_path = "/data/tests"
//! logs_path = "logs"
//! skip = ["POP_Bounds", "static_Call50000*"]
//!
//! [client.geth]
//! binary = "/usr/local/bin/evm"
//!
//! [client.parity]
//! docker_name = "holiman/std-parityvm"
//!
//! [generator]
//! docker_name = "holiman/testeth"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr as _;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::client::{self, ClientAdapter, ClientLocation};
use crate::forks::Fork;
use crate::supplier::generator::{DEFAULT_BACKOFF, DEFAULT_GENERATOR_TIMEOUT};
use crate::supplier::SkipList;

pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_TEMP_PREFIX: &str = "difftest";
pub const DEFAULT_GENERATED_PATH: &str = "generatedTests";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("couldn't read config file {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file")]
    Parse(#[from] serde_path_to_error::Error<toml::de::Error>),
    #[error("unknown fork {0:?}")]
    UnknownFork(String),
    #[error("client {0} has neither a `binary` nor a `docker_name`")]
    NoLocation(String),
    #[error("no usable clients configured")]
    NoClients,
}

/// The configuration file as written.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Clients to run, in the order their traces are reported.
    pub clients: Vec<String>,
    pub fork: String,
    pub tests_path: Option<PathBuf>,
    pub logs_path: PathBuf,
    pub temp_dir: Option<PathBuf>,
    pub temp_prefix: Option<String>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub skip: Vec<String>,
    #[serde(default)]
    pub client: BTreeMap<String, LocationConfig>,
    pub generator: Option<GeneratorConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocationConfig {
    pub binary: Option<PathBuf>,
    pub docker_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratorConfig {
    pub binary: Option<PathBuf>,
    pub docker_name: Option<String>,
    pub backoff_ms: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub generated_path: Option<PathBuf>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_path_to_error::deserialize(toml::Deserializer::new(text))?)
    }

    /// Check the configuration and look up the client adapters.
    ///
    /// Unknown clients are dropped with a warning.
    pub fn resolve(self) -> Result<RunConfig, ConfigError> {
        let fork =
            Fork::from_str(&self.fork).map_err(|_| ConfigError::UnknownFork(self.fork.clone()))?;

        let mut clients = vec![];
        for name in &self.clients {
            let Some(adapter) = client::adapter(name) else {
                warn!(
                    "Undefined client {name}, supported clients are {}",
                    client::supported().collect::<Vec<_>>().join(", ")
                );
                continue;
            };
            let location = self
                .client
                .get(name)
                .cloned()
                .and_then(|it| ClientLocation::new(it.binary, it.docker_name))
                .ok_or_else(|| ConfigError::NoLocation(name.clone()))?;
            clients.push(ConfiguredClient { adapter, location });
        }
        if clients.is_empty() {
            return Err(ConfigError::NoClients);
        }

        let generator = self.generator.and_then(|it| {
            Some(GeneratorSettings {
                location: ClientLocation::new(it.binary, it.docker_name)?,
                backoff: it
                    .backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_BACKOFF),
                timeout: it
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_GENERATOR_TIMEOUT),
                generated_path: it
                    .generated_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_GENERATED_PATH)),
            })
        });

        Ok(RunConfig {
            clients,
            fork,
            tests_path: self.tests_path,
            logs_path: self.logs_path,
            temp_dir: self.temp_dir.unwrap_or_else(std::env::temp_dir),
            temp_prefix: self
                .temp_prefix
                .unwrap_or_else(|| DEFAULT_TEMP_PREFIX.to_owned()),
            timeout: Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            skip: SkipList::new(&self.skip),
            generator,
        })
    }
}

/// A client that will be run, and how.
#[derive(Clone, Debug)]
pub struct ConfiguredClient {
    pub adapter: &'static dyn ClientAdapter,
    pub location: ClientLocation,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratorSettings {
    pub location: ClientLocation,
    pub backoff: Duration,
    pub timeout: Duration,
    pub generated_path: PathBuf,
}

/// A checked configuration.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub clients: Vec<ConfiguredClient>,
    pub fork: Fork,
    pub tests_path: Option<PathBuf>,
    pub logs_path: PathBuf,
    pub temp_dir: PathBuf,
    pub temp_prefix: String,
    pub timeout: Duration,
    pub skip: SkipList,
    pub generator: Option<GeneratorSettings>,
}

impl RunConfig {
    /// Log what's about to be run.
    pub fn report(&self) {
        info!("Config");
        info!("\tActive clients:");
        for client in &self.clients {
            info!("\t* {} : {}", client.adapter.name(), client.location);
        }
        match &self.generator {
            Some(generator) => {
                info!("\tTest generator:");
                info!("\t* testeth : {}", generator.location);
            }
            None => info!("\tTest generator:       none"),
        }
        info!("\tFork config:          {}", self.fork);
        info!(
            "\tTest tempfiles:       {}/{}-{}-*.json",
            self.temp_dir.display(),
            self.temp_prefix,
            std::process::id()
        );
        info!("\tLog path:             {}", self.logs_path.display());
    }
}
