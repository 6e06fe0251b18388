use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr as _;
use std::time::Duration;

use mac_address::MacAddress;
use rumqttc::QoS;
use serde_derive::Deserialize;
use thiserror::Error;

/// Places searched, in order, when no `--config` path is given.
pub const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "config/scanner.toml",
    "/etc/bt-mqtt-scanner/scanner.toml",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no configuration file found (searched: {})", .0.join(", "))]
    NotFound(Vec<String>),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub scanner: ScannerConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub deduplication: DeduplicationConfig,
    #[serde(default)]
    pub blocklist: BlocklistConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ScannerConfig {
    pub id: String,
    #[serde(default = "default_adapter")]
    pub adapter: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: Option<String>,
    pub qos: Option<u8>,
    pub client_id_prefix: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    pub reconnect_delay_seconds: Option<u64>,
    pub channel_capacity: Option<usize>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DeduplicationConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub cleanup_age_seconds: u64,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct BlocklistConfig {
    pub enabled: bool,
    pub devices: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub timestamps: bool,
}

fn default_adapter() -> String {
    "hci0".to_string()
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        DeduplicationConfig {
            enabled: false,
            interval_seconds: 30,
            cleanup_age_seconds: 3600,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            enabled: true,
            interval_seconds: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            timestamps: true,
        }
    }
}

impl AppConfig {
    /// Load from an explicit path, or from the first default location that exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => find_config_file()?,
        };
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let raw: toml::Value = toml::from_str(contents)?;
        let config = substitute_env_vars(raw).try_into::<AppConfig>()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.scanner.id.trim().is_empty() {
            return Err(ConfigError::invalid("scanner.id", "must not be empty"));
        }
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::invalid("mqtt.host", "must not be empty"));
        }
        if let Some(qos) = self.mqtt.qos
            && qos > 2
        {
            return Err(ConfigError::invalid("mqtt.qos", format!("{qos} is not 0, 1 or 2")));
        }
        if self.mqtt.channel_capacity == Some(0) {
            return Err(ConfigError::invalid("mqtt.channel_capacity", "must be positive"));
        }
        if self.heartbeat.interval_seconds == 0 {
            return Err(ConfigError::invalid("heartbeat.interval_seconds", "must be positive"));
        }
        if self.deduplication.cleanup_age_seconds < self.deduplication.interval_seconds {
            return Err(ConfigError::invalid(
                "deduplication.cleanup_age_seconds",
                "must not be shorter than interval_seconds",
            ));
        }
        for device in &self.blocklist.devices {
            MacAddress::from_str(device)
                .map_err(|e| ConfigError::invalid("blocklist.devices", format!("{device}: {e}")))?;
        }
        Ok(())
    }

    /// Blocklisted addresses in the same uppercase form the normalizer produces.
    pub fn blocked_addresses(&self) -> HashSet<String> {
        self.blocklist
            .devices
            .iter()
            .filter_map(|device| MacAddress::from_str(device).ok())
            .map(|mac| mac.to_string())
            .collect()
    }
}

impl MqttConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(1883)
    }

    pub fn topic_prefix(&self) -> &str {
        self.topic_prefix.as_deref().unwrap_or("bt-mqtt")
    }

    pub fn qos(&self) -> QoS {
        match self.qos.unwrap_or(1) {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }

    pub fn client_id(&self, scanner_id: &str) -> String {
        let prefix = self.client_id_prefix.as_deref().unwrap_or("scanner");
        format!("{prefix}-{scanner_id}")
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_seconds.unwrap_or(60))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_seconds.unwrap_or(5))
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity.unwrap_or(100)
    }
}

impl DeduplicationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn cleanup_age(&self) -> Duration {
        Duration::from_secs(self.cleanup_age_seconds)
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

fn find_config_file() -> Result<PathBuf, ConfigError> {
    let mut candidates: Vec<PathBuf> = DEFAULT_CONFIG_PATHS.iter().map(PathBuf::from).collect();
    if let Some(home) = std::env::var_os("HOME") {
        candidates.push(
            PathBuf::from(home)
                .join(".config")
                .join("bt-mqtt-scanner")
                .join("scanner.toml"),
        );
    }

    candidates
        .iter()
        .find(|path| path.exists())
        .cloned()
        .ok_or_else(|| {
            ConfigError::NotFound(candidates.iter().map(|p| p.display().to_string()).collect())
        })
}

/// Replace string values of the exact form `${NAME}` with the environment
/// variable `NAME`. Unset variables leave the placeholder as written.
fn substitute_env_vars(value: toml::Value) -> toml::Value {
    match value {
        toml::Value::String(s) => {
            let resolved = s
                .strip_prefix("${")
                .and_then(|rest| rest.strip_suffix('}'))
                .and_then(|name| std::env::var(name).ok());
            toml::Value::String(resolved.unwrap_or(s))
        }
        toml::Value::Array(items) => {
            toml::Value::Array(items.into_iter().map(substitute_env_vars).collect())
        }
        toml::Value::Table(table) => toml::Value::Table(
            table
                .into_iter()
                .map(|(key, value)| (key, substitute_env_vars(value)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [scanner]
        id = "test-scanner"

        [mqtt]
        host = "mqtt.example.com"
    "#;

    #[test]
    fn test_config() {
        let config_str = r#"
            [scanner]
            id = "test-scanner"
            adapter = "hci1"

            [mqtt]
            host = "localhost"
            port = 1884
            username = "user"
            password = "pass"
            topic_prefix = "ble"
            qos = 2

            [deduplication]
            enabled = true
            interval_seconds = 10

            [blocklist]
            enabled = true
            devices = ["aa:bb:cc:dd:ee:ff"]

            [heartbeat]
            enabled = false
            interval_seconds = 15

            [logging]
            level = "debug"
        "#;
        let config = AppConfig::from_toml(config_str).unwrap();
        assert_eq!(config.scanner.id, "test-scanner");
        assert_eq!(config.scanner.adapter, "hci1");
        assert_eq!(config.mqtt.port(), 1884);
        assert_eq!(config.mqtt.topic_prefix(), "ble");
        assert_eq!(config.mqtt.qos(), QoS::ExactlyOnce);
        assert!(config.deduplication.enabled);
        assert_eq!(config.deduplication.interval(), Duration::from_secs(10));
        assert_eq!(config.deduplication.cleanup_age(), Duration::from_secs(3600));
        assert!(!config.heartbeat.enabled);
        assert_eq!(config.heartbeat.interval_seconds, 15);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.timestamps);
        assert!(config.blocked_addresses().contains("AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.scanner.adapter, "hci0");
        assert_eq!(config.mqtt.port(), 1883);
        assert_eq!(config.mqtt.topic_prefix(), "bt-mqtt");
        assert_eq!(config.mqtt.qos(), QoS::AtLeastOnce);
        assert_eq!(config.mqtt.client_id("test-scanner"), "scanner-test-scanner");
        assert_eq!(config.mqtt.keep_alive(), Duration::from_secs(60));
        assert_eq!(config.mqtt.reconnect_delay(), Duration::from_secs(5));
        assert!(!config.deduplication.enabled);
        assert_eq!(config.deduplication.interval_seconds, 30);
        assert!(!config.blocklist.enabled);
        assert!(config.blocked_addresses().is_empty());
        assert!(config.heartbeat.enabled);
        assert_eq!(config.heartbeat.interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_env_substitution() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("BT_MQTT_SCANNER_TEST_PASSWORD", "s3cret") };
        let config = AppConfig::from_toml(
            r#"
            [scanner]
            id = "test-scanner"

            [mqtt]
            host = "localhost"
            username = "user"
            password = "${BT_MQTT_SCANNER_TEST_PASSWORD}"
            topic_prefix = "${BT_MQTT_SCANNER_TEST_UNSET}"
            "#,
        )
        .unwrap();
        assert_eq!(config.mqtt.password.as_deref(), Some("s3cret"));
        assert_eq!(config.mqtt.topic_prefix(), "${BT_MQTT_SCANNER_TEST_UNSET}");
    }

    #[test]
    fn test_invalid_qos() {
        let err = AppConfig::from_toml(&format!("{MINIMAL}\nqos = 3\n")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "mqtt.qos", .. }));
    }

    #[test]
    fn test_invalid_blocklist_entry() {
        let config_str = format!("{MINIMAL}\n[blocklist]\ndevices = [\"not-a-mac\"]\n");
        let err = AppConfig::from_toml(&config_str).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "blocklist.devices", .. }));
    }

    #[test]
    fn test_empty_scanner_id() {
        let err = AppConfig::from_toml("[scanner]\nid = \"\"\n[mqtt]\nhost = \"h\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "scanner.id", .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = AppConfig::load(Some(Path::new("does/not/exist.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
