//! Configuration loading.
//!
//! Priority: TOML file, then `DES_*` environment variables overriding single
//! fields, then the built-in defaults below.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Built-in defaults.
pub mod defaults {
    pub const DATA_DIR: &str = "data";
    pub const CONFIG_FILE: &str = "des.toml";

    pub const MQTT_HOST: &str = "127.0.0.1";
    pub const MQTT_PORT: u16 = 1883;
    pub const MQTT_CLIENT_PREFIX: &str = "des";
    pub const MQTT_KEEP_ALIVE_SECS: u64 = 30;
    pub const MQTT_QOS: u8 = 1;

    /// Server liveness publish interval.
    pub const SERVER_PING_MS: u64 = 5_000;
    /// Expected period of device-reported pings.
    pub const DEVICE_PING_MS: u32 = 10_000;
    /// A device ping is stale after this many missed periods.
    pub const STALE_MULTIPLIER: u32 = 3;

    /// Used when a header carries no geolocation.
    pub const LATITUDE: f64 = 52.951_977;
    pub const LONGITUDE: f64 = -122.439_384;

    pub const SERVER_ADDR: &str = "des-server";
    pub const SERVER_APP: &str = "des";
}

/// Environment variable names.
pub mod env_vars {
    pub const DATA_DIR: &str = "DES_DATA_DIR";
    pub const MQTT_HOST: &str = "DES_MQTT_HOST";
    pub const MQTT_PORT: &str = "DES_MQTT_PORT";
    pub const MQTT_USER: &str = "DES_MQTT_USER";
    pub const MQTT_PASSWORD: &str = "DES_MQTT_PASSWORD";
    pub const LOG_JSON: &str = "DES_LOG_JSON";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    /// 0, 1 or 2.
    pub qos: u8,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: defaults::MQTT_HOST.to_string(),
            port: defaults::MQTT_PORT,
            username: None,
            password: None,
            client_id_prefix: defaults::MQTT_CLIENT_PREFIX.to_string(),
            keep_alive_secs: defaults::MQTT_KEEP_ALIVE_SECS,
            qos: defaults::MQTT_QOS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub server_ping_ms: u64,
    pub device_ping_ms: u32,
    pub stale_multiplier: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            server_ping_ms: defaults::SERVER_PING_MS,
            device_ping_ms: defaults::DEVICE_PING_MS,
            stale_multiplier: defaults::STALE_MULTIPLIER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub latitude: f64,
    pub longitude: f64,
    pub server_app: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            latitude: defaults::LATITUDE,
            longitude: defaults::LONGITUDE,
            server_app: defaults::SERVER_APP.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesConfig {
    pub data_dir: PathBuf,
    pub mqtt: MqttConfig,
    pub liveness: LivenessConfig,
    pub defaults: DefaultsConfig,
}

impl Default for DesConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(defaults::DATA_DIR),
            mqtt: MqttConfig::default(),
            liveness: LivenessConfig::default(),
            defaults: DefaultsConfig::default(),
        }
    }
}

impl DesConfig {
    /// Parse a TOML document. Missing sections and fields take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Load from `path`, or from `des.toml` in the working directory when it
    /// exists, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(defaults::CONFIG_FILE).exists() => {
                Self::from_file(defaults::CONFIG_FILE)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        tracing::info!(
            category = "config",
            data_dir = %config.data_dir.display(),
            mqtt = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Apply `DES_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(env_vars::DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(host) = lookup(env_vars::MQTT_HOST) {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup(env_vars::MQTT_PORT) {
            self.mqtt.port = port
                .parse()
                .map_err(|_| Error::Config(format!("invalid {}: {}", env_vars::MQTT_PORT, port)))?;
        }
        if let Some(user) = lookup(env_vars::MQTT_USER) {
            self.mqtt.username = Some(user);
        }
        if let Some(password) = lookup(env_vars::MQTT_PASSWORD) {
            self.mqtt.password = Some(password);
        }
        Ok(())
    }
}

/// Whether `DES_LOG_JSON` asks for JSON log output.
pub fn log_json() -> bool {
    std::env::var(env_vars::LOG_JSON)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_toml() {
        let config = DesConfig::from_toml_str(
            r#"
            data_dir = "/var/lib/des"

            [mqtt]
            host = "broker.local"

            [liveness]
            stale_multiplier = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/des"));
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, defaults::MQTT_PORT);
        assert_eq!(config.liveness.stale_multiplier, 5);
        assert_eq!(config.liveness.server_ping_ms, defaults::SERVER_PING_MS);
        assert_eq!(config.defaults.latitude, defaults::LATITUDE);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (env_vars::MQTT_HOST, "10.1.1.1"),
            (env_vars::MQTT_PORT, "8883"),
            (env_vars::MQTT_USER, "des"),
        ]
        .into_iter()
        .collect();

        let mut config = DesConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.mqtt.host, "10.1.1.1");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.username.as_deref(), Some("des"));
        assert!(config.mqtt.password.is_none());
    }

    #[test]
    fn test_bad_port_rejected() {
        let mut config = DesConfig::default();
        let err = config
            .apply_env(|k| (k == env_vars::MQTT_PORT).then(|| "nope".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            DesConfig::from_toml_str("mqtt = 3"),
            Err(Error::Config(_))
        ));
    }
}
