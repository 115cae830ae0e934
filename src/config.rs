//! Process-wide engine settings.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub dial: DialConfig,
    pub transfer: TransferConfig,
    pub pool: PoolConfig,
    /// Deadline applied to a reconciliation when the caller gives none.
    pub command_timeout_secs: Option<u64>,
}

/// Backoff between dial attempts. The attempt limit itself is part of the
/// connection (`dial_error_limit`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
        }
    }
}

impl DialConfig {
    /// Delay before retry number `retry` (1-based), doubling and capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Keep writing the remaining files after one fails.
    pub continue_on_error: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub enabled: bool,
    pub idle_timeout_secs: u64,
    pub max_idle_per_key: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_timeout_secs: 60,
            max_idle_per_key: 2,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl RunnerConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, anyhow::Error> {
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))?;
        Ok(config)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let dial = DialConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        assert_eq!(dial.backoff(1), Duration::from_millis(100));
        assert_eq!(dial.backoff(2), Duration::from_millis(200));
        assert_eq!(dial.backoff(4), Duration::from_millis(800));
        assert_eq!(dial.backoff(5), Duration::from_millis(1_000));
        assert_eq!(dial.backoff(90), Duration::from_millis(1_000));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: RunnerConfig =
            serde_json::from_str(r#"{"transfer": {"continue_on_error": true}}"#).unwrap();
        assert!(config.transfer.continue_on_error);
        assert!(config.pool.enabled);
        assert_eq!(config.dial, DialConfig::default());
        assert_eq!(config.command_timeout(), None);
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.json");
        let json = r#"{"command_timeout_secs": 30, "pool": {"enabled": false}}"#;
        std::fs::write(&path, json).unwrap();
        let config = RunnerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.command_timeout(), Some(Duration::from_secs(30)));
        assert!(!config.pool.enabled);
        assert_eq!(config.pool.max_idle_per_key, 2);
    }
}
