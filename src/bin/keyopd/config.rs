//! `keyopd` configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides
//! besides `RUST_LOG`/`KEYOP_DEBUG` (handled in `main`, not here).
//! Default config path: `/etc/keyop/keyopd.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `paths.data_dir`
//! - `paths.state_dir`

use keyop_kernel::ServiceConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level `keyopd` configuration.
#[derive(Debug, Clone)]
pub struct KeyopdConfig {
    pub schema_version: u32,
    /// Overrides the OS-reported hostname used in route stamps and
    /// envelope enrichment; empty means use the OS hostname.
    pub hostname_override: Option<String>,
    pub paths: PathsConfig,
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub state_dir: PathBuf,
    /// Empty means `"<home>/.keyop/certs"`.
    pub cert_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    hostname_override: Option<String>,
    paths: Option<RawPaths>,
    services: Option<Vec<ServiceConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawPaths {
    data_dir: Option<String>,
    state_dir: Option<String>,
    cert_dir: Option<String>,
}

/// Load config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<KeyopdConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from the default path `/etc/keyop/keyopd.toml`.
pub fn load_config() -> Result<KeyopdConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/keyop/keyopd.toml"))
}

pub fn load_config_from_str(toml_str: &str) -> Result<KeyopdConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let raw_paths = raw
        .paths
        .ok_or_else(|| ConfigError::MissingField("paths".to_owned()))?;
    let data_dir = raw_paths
        .data_dir
        .ok_or_else(|| ConfigError::MissingField("paths.data_dir".to_owned()))?;
    let state_dir = raw_paths
        .state_dir
        .ok_or_else(|| ConfigError::MissingField("paths.state_dir".to_owned()))?;
    let cert_dir = raw_paths.cert_dir.filter(|s| !s.is_empty()).map(PathBuf::from);

    let services = raw.services.unwrap_or_default();

    Ok(KeyopdConfig {
        schema_version,
        hostname_override: raw.hostname_override.filter(|s| !s.is_empty()),
        paths: PathsConfig {
            data_dir: PathBuf::from(data_dir),
            state_dir: PathBuf::from(state_dir),
            cert_dir,
        },
        services,
    })
}

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "Parse error: {s}"),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses() {
        let toml = r#"
schema_version = 1

[paths]
data_dir = "/var/lib/keyop/bus"
state_dir = "/var/lib/keyop/state"
"#;
        let cfg = load_config_from_str(toml).unwrap();
        assert_eq!(cfg.paths.data_dir, PathBuf::from("/var/lib/keyop/bus"));
        assert!(cfg.services.is_empty());
    }

    #[test]
    fn missing_data_dir_is_rejected() {
        let toml = r#"
schema_version = 1
[paths]
state_dir = "/var/lib/keyop/state"
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }

    #[test]
    fn wrong_schema_version_is_rejected() {
        let toml = r#"
schema_version = 2
[paths]
data_dir = "a"
state_dir = "b"
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn services_with_pubs_and_subs_parse() {
        let toml = r#"
schema_version = 1
[paths]
data_dir = "a"
state_dir = "b"

[[services]]
name = "main"
type = "wss"
[services.config]
bind = "0.0.0.0:8443"
[services.subs.in]
name = "events"
max_age_secs = 0
"#;
        let cfg = load_config_from_str(toml).unwrap();
        assert_eq!(cfg.services.len(), 1);
        assert_eq!(cfg.services[0].service_type, "wss");
        assert_eq!(cfg.services[0].subs["in"].name, "events");
    }
}
