//! Generation and digestion of the MySQL Cluster configuration.
//!
//! The operator renders an authoritative `config.ini` (and optionally a
//! `my.cnf`) from the NdbCluster spec and stores it in a ConfigMap. The
//! stored text, not the live spec, is the base for the current rollout
//! cycle, so this module can also parse the text back into a
//! [`ConfigSummary`](summary::ConfigSummary).

pub mod generator;
pub mod parser;
pub mod summary;

use thiserror::Error;

pub use generator::{generate_config_text, generate_my_cnf, resolve_hostname_suffix};
pub use parser::ConfigIni;
pub use summary::{calculate_spec_hash, ConfigSummary};

/// Errors raised while parsing or generating cluster configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A non-comment line appeared before any section header.
    #[error("non-empty line without section at line {0}")]
    LineWithoutSection(usize),

    /// A line inside a section was not a `key=value` entry.
    #[error("invalid config entry at line {0}: {1}")]
    InvalidEntry(usize, String),

    /// An empty `[]` section header.
    #[error("empty section name at line {0}")]
    EmptySectionName(usize),

    /// A key required to rebuild the config summary was absent.
    #[error("missing key {0} in stored config")]
    MissingKey(String),

    /// A stored value could not be interpreted.
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    /// The config-feeding spec slice could not be serialized for hashing.
    #[error("failed to serialize config source: {0}")]
    Serialize(#[from] serde_json::Error),
}
