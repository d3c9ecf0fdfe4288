//! Loading of the TOML documents that drive every command.
//!
//! Each command owns its configuration type next to the code that consumes it; this
//! module only reads and parses. Semantic checks live in the `validate` methods of the
//! individual configuration types and are run before any heavy computation starts.

use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failures while reading or interpreting a configuration document.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse configuration file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Reads and deserializes a TOML configuration document.
pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    log::debug!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Loads an optional configuration document, falling back to the type's defaults.
pub fn load_config_or_default<T: DeserializeOwned + Default>(
    path: Option<&Path>,
) -> Result<T, ConfigError> {
    match path {
        Some(path) => load_config(path),
        None => Ok(T::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    struct Example {
        grid_size: usize,
        #[serde(default)]
        shuffle: bool,
    }

    #[test]
    fn parses_valid_document() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "grid_size = 4\nshuffle = true").expect("write config");
        let parsed: Example = load_config(file.path()).expect("config should parse");
        assert_eq!(parsed.grid_size, 4);
        assert!(parsed.shuffle);
    }

    #[test]
    fn missing_required_key_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "shuffle = true").expect("write config");
        let err = load_config::<Example>(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_config::<Example>(Path::new("/nonexistent/dieback.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn absent_path_uses_defaults() {
        let parsed: Example = load_config_or_default(None).expect("defaults");
        assert_eq!(parsed.grid_size, 0);
    }
}
