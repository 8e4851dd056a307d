//! Configuration file loading and saving

use std::path::Path;

use thiserror::Error;

use crate::LedgerConfig;

/// Errors from configuration parsing
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid YAML in {path}: {source}")]
    Yaml {
        path: String,
        source: serde_yaml::Error,
    },
}

/// Load a configuration file, applying defaults for omitted fields
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<LedgerConfig, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
        path: path.display().to_string(),
        source,
    })
}

/// Save a configuration file
pub fn save_config<P: AsRef<Path>>(config: &LedgerConfig, path: P) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let raw = serde_yaml::to_string(config).map_err(|source| ConfigError::Yaml {
        path: path.display().to_string(),
        source,
    })?;
    std::fs::write(path, raw).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}
