//! Configuration loading and persistence.
//!
//! Handles reading and writing the client configuration file. The bearer
//! token is never written to disk; it comes from the authentication
//! collaborator or the `PFCAM_TOKEN` environment variable.

use std::time::Duration;
use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::constants;
use crate::notifications::NotificationPreferences;

/// Push channel settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Base URL of the PFCAM backend (`http(s)://host[:port]`).
    pub server_url: String,
    /// Handshake timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Reconnect base delay in milliseconds.
    pub reconnect_base_delay_ms: u64,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".to_string(),
            connect_timeout_secs: constants::CONNECT_TIMEOUT.as_secs(),
            reconnect_base_delay_ms: constants::RECONNECT_BASE_DELAY.as_millis() as u64,
            max_reconnect_attempts: constants::MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ConnectionConfig {
    /// Handshake timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Reconnect base delay.
    #[must_use]
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }
}

/// Notification store bounds.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum number of retained notifications.
    pub max_notifications: usize,
    /// Retention window in hours.
    pub retention_hours: u64,
    /// Background sweep interval in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_notifications: constants::MAX_NOTIFICATIONS,
            retention_hours: constants::NOTIFICATION_RETENTION.as_secs() / 3600,
            sweep_interval_secs: constants::SWEEP_INTERVAL.as_secs(),
        }
    }
}

impl StoreConfig {
    /// Retention window.
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    /// Background sweep interval, never below one second.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs).max(constants::MIN_TIMER_INTERVAL)
    }
}

/// Session watchdog thresholds.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Absolute session lifetime in hours.
    pub max_session_hours: u64,
    /// Inactivity timeout in minutes.
    pub inactivity_minutes: u64,
    /// Watchdog tick interval in seconds.
    pub watchdog_interval_secs: u64,
    /// Whether expiry raises a notice in the notification store.
    pub notify_on_expiry: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_session_hours: constants::SESSION_MAX_DURATION.as_secs() / 3600,
            inactivity_minutes: constants::INACTIVITY_TIMEOUT.as_secs() / 60,
            watchdog_interval_secs: constants::WATCHDOG_INTERVAL.as_secs(),
            notify_on_expiry: true,
        }
    }
}

impl SessionConfig {
    /// Absolute session lifetime.
    #[must_use]
    pub fn max_session(&self) -> Duration {
        Duration::from_secs(self.max_session_hours * 3600)
    }

    /// Inactivity timeout.
    #[must_use]
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_minutes * 60)
    }

    /// Watchdog tick interval, never below one second.
    #[must_use]
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs).max(constants::MIN_TIMER_INTERVAL)
    }
}

/// Configuration for the real-time client.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Config {
    /// Push channel settings.
    pub connection: ConnectionConfig,
    /// Notification store bounds.
    pub store: StoreConfig,
    /// Session watchdog thresholds.
    pub session: SessionConfig,
    /// Which notification families reach the store.
    pub preferences: NotificationPreferences,
    /// Bearer token - NOT serialized to disk.
    #[serde(skip)]
    pub token: Option<String>,
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `#[cfg(test)]` (unit tests): `tmp/pfcam-test`
    /// 2. `PFCAM_CONFIG_DIR` env var: explicit override
    /// 3. `PFCAM_ENV=test`: `tmp/pfcam-test` (integration tests)
    /// 4. Default: platform config dir + `pfcam`
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/pfcam-test")
            }

            #[cfg(not(test))]
            {
                if let Ok(custom_dir) = std::env::var("PFCAM_CONFIG_DIR") {
                    PathBuf::from(custom_dir)
                } else if crate::env::is_test_mode() {
                    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/pfcam-test")
                } else {
                    dirs::config_dir()
                        .context("Could not determine config directory")?
                        .join("pfcam")
                }
            }
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing or unreadable file falls back to defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|e| {
            log::debug!("[Config] Using defaults: {:#}", e);
            Self::default()
        });
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid config file {}", config_path.display()))
        } else {
            anyhow::bail!("Config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
            value.and_then(|v| v.trim().parse().ok())
        }

        if let Some(server_url) = var("PFCAM_SERVER_URL") {
            self.connection.server_url = server_url;
        }

        if let Some(token) = var("PFCAM_TOKEN").filter(|t| !t.is_empty()) {
            self.token = Some(token);
        }

        if let Some(secs) = parsed(var("PFCAM_CONNECT_TIMEOUT_SECS")) {
            self.connection.connect_timeout_secs = secs;
        }

        if let Some(ms) = parsed(var("PFCAM_RECONNECT_BASE_MS")) {
            self.connection.reconnect_base_delay_ms = ms;
        }

        if let Some(attempts) = parsed(var("PFCAM_MAX_RECONNECT_ATTEMPTS")) {
            self.connection.max_reconnect_attempts = attempts;
        }

        if let Some(hours) = parsed(var("PFCAM_SESSION_MAX_HOURS")) {
            self.session.max_session_hours = hours;
        }

        if let Some(minutes) = parsed(var("PFCAM_INACTIVITY_MINUTES")) {
            self.session.inactivity_minutes = minutes;
        }
    }

    /// Persists the current configuration to disk.
    ///
    /// The token is never written.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.connection.server_url, "http://localhost:8000");
        assert_eq!(config.connection.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert_eq!(config.store.max_notifications, 50);
        assert_eq!(config.store.retention(), Duration::from_secs(24 * 3600));
        assert_eq!(config.store.sweep_interval(), Duration::from_secs(3600));
        assert_eq!(config.session.max_session(), Duration::from_secs(8 * 3600));
        assert_eq!(
            config.session.inactivity_timeout(),
            Duration::from_secs(30 * 60)
        );
        assert_eq!(config.session.watchdog_interval(), Duration::from_secs(60));
        assert!(config.token.is_none());
    }

    #[test]
    fn test_config_serialization_excludes_token() {
        let config = Config {
            token: Some("secret_token".to_string()),
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();

        assert!(!json.contains("secret_token"));
        assert!(!json.contains("\"token\""));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"connection": {"server_url": "https://cam.local"}}"#)
                .unwrap();
        assert_eq!(config.connection.server_url, "https://cam.local");
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert_eq!(config.store.max_notifications, 50);
        assert!(config.preferences.system_alerts);
    }

    #[test]
    fn test_overrides_apply_and_ignore_garbage() {
        let vars: HashMap<&str, &str> = [
            ("PFCAM_SERVER_URL", "https://cam.example.com"),
            ("PFCAM_TOKEN", "abc.def.ghi"),
            ("PFCAM_RECONNECT_BASE_MS", "250"),
            ("PFCAM_MAX_RECONNECT_ATTEMPTS", "not-a-number"),
            ("PFCAM_INACTIVITY_MINUTES", " 15 "),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| (*v).to_string()));

        assert_eq!(config.connection.server_url, "https://cam.example.com");
        assert_eq!(config.token.as_deref(), Some("abc.def.ghi"));
        assert_eq!(
            config.connection.reconnect_base_delay(),
            Duration::from_millis(250)
        );
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert_eq!(config.session.inactivity_minutes, 15);
    }

    #[test]
    fn test_zero_intervals_clamped() {
        let config: Config = serde_json::from_str(
            r#"{"store": {"sweep_interval_secs": 0}, "session": {"watchdog_interval_secs": 0}}"#,
        )
        .unwrap();
        assert_eq!(config.store.sweep_interval(), Duration::from_secs(1));
        assert_eq!(config.session.watchdog_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_empty_token_override_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|name| (name == "PFCAM_TOKEN").then(String::new));
        assert!(config.token.is_none());
    }
}
