use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::device::capabilities::CapabilityProfile;
use crate::models::enums::DatabaseType;

/// Prefix of the environment variables that override a loaded config.
const ENV_PREFIX: &str = "SQLDEVICE_";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub connection_string: String,
    /// Dialect to emit; inferred from the connection string when absent.
    pub dialect: Option<DatabaseType>,
    /// Replaces the dialect's default capability profile.
    pub profile: Option<CapabilityProfile>,
    pub max_execute_connections: usize,
    pub max_browse_connections: usize,
    /// Rows fetched per cursor round trip; `0` reads the whole result at once.
    pub batch_size: usize,
    pub command_timeout_secs: u64,
    /// Bind restart keys as parameters rather than literals.
    pub use_parameters_for_cursors: bool,
    /// Statement run once on every new execute connection.
    pub on_new_connection: Option<String>,
    /// Statement run once on every new browse connection.
    pub on_new_browse_connection: Option<String>,
    /// Pretty-print emitted SQL in debug logs.
    pub format_sql: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            dialect: None,
            profile: None,
            max_execute_connections: 4,
            max_browse_connections: 2,
            batch_size: 100,
            command_timeout_secs: 30,
            use_parameters_for_cursors: true,
            on_new_connection: None,
            on_new_browse_connection: None,
            format_sql: false,
        }
    }
}

impl DeviceConfig {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self { connection_string: connection_string.into(), ..Default::default() }
    }

    /// Reads a JSON config file, then applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        let mut config: DeviceConfig = serde_json::from_str(&content)?;
        config.apply_overrides(std::env::vars())?;
        info!("Loaded device config from {}: dialect={:?}", path.display(), config.db_type());
        Ok(config)
    }

    /// Defaults plus `SQLDEVICE_*` variables, after loading any `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let mut config = Self::default();
        config.apply_overrides(std::env::vars())?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Read { path: path.display().to_string(), source })
    }

    /// Applies `SQLDEVICE_*` pairs; other keys are ignored.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else { continue };
            let invalid = || ConfigError::InvalidValue { key: key.clone(), value: value.clone() };
            match name {
                "CONNECTION_STRING" => self.connection_string = value.clone(),
                "DIALECT" => self.dialect = Some(value.parse().map_err(|_| invalid())?),
                "MAX_EXECUTE_CONNECTIONS" => self.max_execute_connections = value.parse().map_err(|_| invalid())?,
                "MAX_BROWSE_CONNECTIONS" => self.max_browse_connections = value.parse().map_err(|_| invalid())?,
                "BATCH_SIZE" => self.batch_size = value.parse().map_err(|_| invalid())?,
                "COMMAND_TIMEOUT_SECS" => self.command_timeout_secs = value.parse().map_err(|_| invalid())?,
                "USE_PARAMETERS_FOR_CURSORS" => self.use_parameters_for_cursors = parse_flag(&value).ok_or_else(invalid)?,
                "FORMAT_SQL" => self.format_sql = parse_flag(&value).ok_or_else(invalid)?,
                "ON_NEW_CONNECTION" => self.on_new_connection = Some(value.clone()),
                "ON_NEW_BROWSE_CONNECTION" => self.on_new_browse_connection = Some(value.clone()),
                _ => {
                    debug!("ignoring unknown setting {}", key);
                    continue;
                }
            }
            debug!("config override {}", key);
        }
        Ok(())
    }

    /// Configured dialect, else the connection string's scheme, else generic.
    pub fn db_type(&self) -> DatabaseType {
        self.dialect
            .or_else(|| DatabaseType::from_connection_string(&self.connection_string))
            .unwrap_or_default()
    }

    pub fn capability_profile(&self) -> CapabilityProfile {
        self.profile.clone().unwrap_or_else(|| CapabilityProfile::for_dialect(self.db_type()))
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: DeviceConfig =
            serde_json::from_str(r#"{ "connection_string": "sqlite::memory:", "batch_size": 0 }"#).unwrap();
        assert_eq!(config.batch_size, 0);
        assert_eq!(config.max_execute_connections, 4);
        assert_eq!(config.db_type(), DatabaseType::SQLite);
    }

    #[test]
    fn environment_overrides_apply() {
        let mut config = DeviceConfig::new("postgres://localhost/app");
        config
            .apply_overrides(vars(&[
                ("SQLDEVICE_DIALECT", "generic"),
                ("SQLDEVICE_MAX_EXECUTE_CONNECTIONS", "1"),
                ("SQLDEVICE_USE_PARAMETERS_FOR_CURSORS", "off"),
                ("PATH", "/usr/bin"),
            ]))
            .unwrap();
        assert_eq!(config.db_type(), DatabaseType::Generic);
        assert_eq!(config.max_execute_connections, 1);
        assert!(!config.use_parameters_for_cursors);
    }

    #[test]
    fn bad_override_is_reported() {
        let mut config = DeviceConfig::default();
        let err = config.apply_overrides(vars(&[("SQLDEVICE_BATCH_SIZE", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "SQLDEVICE_BATCH_SIZE"));
    }

    #[test]
    fn profile_override_replaces_dialect_default() {
        let mut config = DeviceConfig::new("mysql://localhost/app");
        assert!(!config.capability_profile().supports_order_by_nulls_first_last);
        config.profile = Some(CapabilityProfile::default());
        assert!(config.capability_profile().supports_order_by_nulls_first_last);
    }
}
