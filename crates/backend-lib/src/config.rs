// ============================
// crates/backend-lib/src/config.rs
// ============================
//! Configuration management.
use crate::error::AppError;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "chat-relay.toml";

/// Prefix for environment overrides, e.g. `CHAT_RELAY_DELIVERY__PUSH_TIMEOUT_MS`
pub const ENV_PREFIX: &str = "CHAT_RELAY_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Log level, used when `RUST_LOG` is not set
    pub log_level: String,
    /// `pretty` or `json`
    pub log_format: LogFormat,
    /// Message storage
    pub storage: StorageSettings,
    /// Fan-out tuning
    pub delivery: DeliverySettings,
    /// Connection identification
    pub connection: ConnectionSettings,
    /// Input limits
    pub limits: LimitSettings,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// JSON files under `storage.path`
    File,
    /// Process memory only, lost on restart
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// Data directory for the file backend
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    /// A push that does not complete within this bound counts as failed
    pub push_timeout_ms: u64,
    /// Capacity of each connection's outbound queue
    pub outbound_buffer: usize,
    /// Deliver once per identity when it is both member and admin of a channel
    pub dedupe_channel_recipients: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Header carrying the claimed identity when no `identity` query parameter is given
    pub identity_header: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    /// Maximum text content size in bytes
    pub max_content_len: usize,
    /// Maximum identity / channel id length
    pub max_identity_len: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            storage: StorageSettings::default(),
            delivery: DeliverySettings::default(),
            connection: ConnectionSettings::default(),
            limits: LimitSettings::default(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            path: PathBuf::from("data"),
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            push_timeout_ms: 2_000,
            outbound_buffer: 64,
            dedupe_channel_recipients: false,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            identity_header: "x-user-identity".to_string(),
        }
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_content_len: 8 * 1024,
            max_identity_len: 128,
        }
    }
}

impl DeliverySettings {
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }
}

impl Settings {
    /// Load settings from `chat-relay.toml` (if present) and the environment
    pub fn load() -> Result<Self, AppError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load settings from a specific TOML file (if present) and the environment
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let settings: Settings = Self::figment(path.as_ref())
            .extract()
            .map_err(|e| AppError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Layered provider: defaults, then file, then environment
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<(), AppError> {
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(AppError::Config(format!(
                "log_level must be one of {LOG_LEVELS:?}, got {}",
                self.log_level
            )));
        }
        if self.delivery.push_timeout_ms == 0 {
            return Err(AppError::Config(
                "delivery.push_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.delivery.outbound_buffer == 0 {
            return Err(AppError::Config(
                "delivery.outbound_buffer must be greater than zero".to_string(),
            ));
        }
        if self.connection.identity_header.trim().is_empty() {
            return Err(AppError::Config(
                "connection.identity_header must not be empty".to_string(),
            ));
        }
        if self.limits.max_content_len == 0 || self.limits.max_identity_len == 0 {
            return Err(AppError::Config("limits must be greater than zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.storage.backend, StorageBackend::File);
        assert!(!settings.delivery.dedupe_channel_recipients);
        assert_eq!(settings.delivery.push_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_settings_validation() {
        let mut invalid = Settings::default();
        invalid.log_level = "loud".to_string();
        assert!(invalid.validate().is_err());

        let mut invalid = Settings::default();
        invalid.delivery.push_timeout_ms = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = Settings::default();
        invalid.delivery.outbound_buffer = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = Settings::default();
        invalid.connection.identity_header = " ".to_string();
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_load_from_file_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "relay.toml",
                r#"
                bind_addr = "0.0.0.0:9000"
                log_format = "json"

                [storage]
                backend = "memory"

                [delivery]
                dedupe_channel_recipients = true
                "#,
            )?;
            jail.set_env("CHAT_RELAY_DELIVERY__PUSH_TIMEOUT_MS", "250");

            let settings = Settings::load_from("relay.toml").expect("settings load");
            assert_eq!(settings.bind_addr.to_string(), "0.0.0.0:9000");
            assert_eq!(settings.log_format, LogFormat::Json);
            assert_eq!(settings.storage.backend, StorageBackend::Memory);
            assert!(settings.delivery.dedupe_channel_recipients);
            assert_eq!(settings.delivery.push_timeout_ms, 250);
            // untouched sections keep their defaults
            assert_eq!(settings.connection.identity_header, "x-user-identity");
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        Jail::expect_with(|_jail| {
            let settings = Settings::load_from("does-not-exist.toml").expect("settings load");
            assert_eq!(settings.bind_addr, Settings::default().bind_addr);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_env_override_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("CHAT_RELAY_LOG_LEVEL", "chatty");
            assert!(matches!(Settings::load(), Err(AppError::Config(_))));
            Ok(())
        });
    }
}
