//! Supervisor configuration
//!
//! TOML file, one section per subsystem; every section and every key
//! falls back to the wire defaults so a missing or partial file still
//! yields a runnable fleet.

mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors from loading the fleet configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read fleet config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed fleet config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Load the supervisor configuration from a TOML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
