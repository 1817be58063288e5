//! Configuration for the event source client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{EventSourceError, EventSourceResult};

/// Overrides the default retry delay.
pub const ENV_RETRY_MS: &str = "EVENTSOURCE_RETRY_MS";

/// Disables automatic reconnection when truthy.
pub const ENV_IGNORE_RETRY: &str = "EVENTSOURCE_IGNORE_RETRY";

/// Client configuration, typically stored at `~/.eventsource/config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSourceConfig {
    /// Reconnect delay until the server sends `retry:`.
    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,

    /// Floor applied to every reconnect delay, server-provided or not.
    #[serde(default = "default_min_retry_ms")]
    pub min_retry_ms: u64,

    /// Consecutive failures tolerated before closing. Unlimited when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Close on the first failure instead of reconnecting.
    #[serde(default)]
    pub ignore_retry_action: bool,

    /// TCP connect timeout for the HTTP transport.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for EventSourceConfig {
    fn default() -> Self {
        Self {
            retry_ms: default_retry_ms(),
            min_retry_ms: default_min_retry_ms(),
            max_retries: None,
            ignore_retry_action: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl EventSourceConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(source: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(source).context("invalid event source config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&source).with_context(|| format!("in {}", path.display()))
    }

    /// Load from [`default_path`](Self::default_path) with environment
    /// overrides applied. A missing file yields the defaults.
    pub fn load_default() -> anyhow::Result<Self> {
        let config = match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path)?,
            _ => Self::default(),
        };
        let config = config.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// `~/.eventsource/config.toml`, if a home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        dirs_next::home_dir().map(|home| home.join(".eventsource").join("config.toml"))
    }

    /// Apply `EVENTSOURCE_*` environment variables.
    pub fn with_env_overrides(self) -> EventSourceResult<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    pub fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> EventSourceResult<Self> {
        if let Some(value) = lookup(ENV_RETRY_MS) {
            self.retry_ms = value.trim().parse().map_err(|_| {
                EventSourceError::Config(format!("{ENV_RETRY_MS} must be an integer, got {value:?}"))
            })?;
        }
        if let Some(value) = lookup(ENV_IGNORE_RETRY) {
            self.ignore_retry_action = parse_flag(&value).ok_or_else(|| {
                EventSourceError::Config(format!("{ENV_IGNORE_RETRY} must be a boolean, got {value:?}"))
            })?;
        }
        Ok(self)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> EventSourceResult<()> {
        if self.min_retry_ms == 0 {
            return Err(EventSourceError::Config(
                "min_retry_ms must be at least 1".into(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(EventSourceError::Config(
                "connect_timeout_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }

    pub fn min_retry_delay(&self) -> Duration {
        Duration::from_millis(self.min_retry_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_retry_ms() -> u64 {
    3_000
}

fn default_min_retry_ms() -> u64 {
    100
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Whether to install a subscriber at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,

    /// `EnvFilter` directives; `RUST_LOG` wins when set.
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            json: false,
            filter: default_filter(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_filter() -> String {
    "info,eventsource=debug,sse_wire=debug".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EventSourceConfig::default();
        assert_eq!(config.retry_delay(), Duration::from_secs(3));
        assert_eq!(config.min_retry_delay(), Duration::from_millis(100));
        assert_eq!(config.max_retries, None);
        assert!(!config.ignore_retry_action);
        assert!(config.telemetry.enabled);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = EventSourceConfig::from_toml_str(
            r#"
            retry_ms = 500
            max_retries = 4

            [telemetry]
            json = true
            "#,
        )
        .unwrap();

        assert_eq!(
            config,
            EventSourceConfig {
                retry_ms: 500,
                max_retries: Some(4),
                telemetry: TelemetryConfig {
                    json: true,
                    ..TelemetryConfig::default()
                },
                ..EventSourceConfig::default()
            }
        );
    }

    #[test]
    fn test_rejects_invalid_toml() {
        assert!(EventSourceConfig::from_toml_str("retry_ms = \"soon\"").is_err());
        assert!(EventSourceConfig::from_toml_str("min_retry_ms = 0").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("eventsource-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "ignore_retry_action = true\n").unwrap();
        let config = EventSourceConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(config.ignore_retry_action);

        assert!(EventSourceConfig::load(&path).is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> =
            HashMap::from([(ENV_RETRY_MS, "750"), (ENV_IGNORE_RETRY, "yes")]);
        let config = EventSourceConfig::default()
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.retry_ms, 750);
        assert!(config.ignore_retry_action);
    }

    #[test]
    fn test_bad_override_is_config_error() {
        let result = EventSourceConfig::default()
            .apply_overrides(|key| (key == ENV_IGNORE_RETRY).then(|| "maybe".to_string()));
        assert!(matches!(result, Err(EventSourceError::Config(_))));
    }
}
