//! thecloud.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub state: StateConfig,
    pub provisioner: ProvisionerConfig,
    pub reconciler: ReconcilerConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Stack jobs allowed to run at the same time.
    pub max_concurrent_jobs: usize,
    /// Pending jobs buffered before submissions are refused.
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Tick interval (e.g., "10s").
    pub interval: String,
    /// Consecutive failures before a group enters backoff.
    pub failure_threshold: u32,
    /// How long a group in backoff is left alone (e.g., "5m").
    pub backoff_window: String,
    /// Evaluation window for policy metrics (e.g., "5m").
    pub metric_window: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/thecloud"),
        }
    }
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            queue_capacity: 256,
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: "10s".to_string(),
            failure_threshold: 5,
            backoff_window: "5m".to_string(),
            metric_window: "5m".to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info,thecloud=debug".to_string(),
            json: false,
        }
    }
}

impl CloudConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: CloudConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Reject values the engines cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provisioner.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid {
                field: "provisioner.max_concurrent_jobs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.provisioner.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "provisioner.queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.reconciler.tick_interval()?.is_zero() {
            return Err(ConfigError::Invalid {
                field: "reconciler.interval",
                reason: "must be non-zero".to_string(),
            });
        }
        self.reconciler.backoff()?;
        self.reconciler.metrics_window()?;
        Ok(())
    }
}

impl ReconcilerConfig {
    pub fn tick_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration("reconciler.interval", &self.interval)
    }

    pub fn backoff(&self) -> Result<Duration, ConfigError> {
        parse_duration("reconciler.backoff_window", &self.backoff_window)
    }

    pub fn metrics_window(&self) -> Result<Duration, ConfigError> {
        parse_duration("reconciler.metric_window", &self.metric_window)
    }
}

/// Parse a duration string like "30s", "5m", "1h". A bare number is seconds.
pub fn parse_duration(field: &'static str, s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let (digits, multiplier) = if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600)
    } else {
        (s, 1)
    };
    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::Duration {
            field,
            value: s.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = CloudConfig::from_toml_str("").unwrap();
        assert_eq!(config, CloudConfig::default());
        assert_eq!(config.reconciler.failure_threshold, 5);
        assert_eq!(config.reconciler.backoff().unwrap(), Duration::from_secs(300));
        assert_eq!(config.provisioner.max_concurrent_jobs, 4);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = CloudConfig::from_toml_str(
            r#"
[reconciler]
interval = "30s"

[log]
json = true
"#,
        )
        .unwrap();
        assert_eq!(
            config.reconciler.tick_interval().unwrap(),
            Duration::from_secs(30)
        );
        assert_eq!(config.reconciler.metric_window, "5m");
        assert!(config.log.json);
        assert_eq!(config.log.filter, "info,thecloud=debug");
    }

    #[test]
    fn rejects_zero_workers() {
        let err = CloudConfig::from_toml_str("[provisioner]\nmax_concurrent_jobs = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "provisioner.max_concurrent_jobs", .. }));
    }

    #[test]
    fn rejects_bad_duration() {
        let err = CloudConfig::from_toml_str("[reconciler]\nbackoff_window = \"soon\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Duration { .. }));
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("t", "30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("t", "5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("t", "2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("t", "45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("t", "").is_err());
        assert!(parse_duration("t", "5d").is_err());
    }

    #[test]
    fn round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thecloud.toml");
        let mut config = CloudConfig::default();
        config.state.data_dir = dir.path().join("data");
        config.reconciler.failure_threshold = 3;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = CloudConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
