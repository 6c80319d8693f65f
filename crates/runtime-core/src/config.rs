//! Runtime configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Failure signatures treated as transient infrastructure faults
pub const DEFAULT_TRANSIENT_SIGNATURES: &[&str] = &[
    "nccl",
    "connection reset",
    "timeout",
    "cuda error: out of memory",
    "runtimeerror: cuda error",
];

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Launch topology and retry settings
    pub launch: LaunchConfig,

    /// Fault classification settings
    pub fault: FaultConfig,

    /// Checkpoint settings
    pub checkpoint: CheckpointConfig,
}

impl RuntimeConfig {
    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: RuntimeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.launch.validate()?;
        self.checkpoint.validate()
    }
}

/// Launch topology configuration, immutable for the process lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Number of machines in the job
    pub node_count: u32,

    /// Worker processes per machine (one per compute unit)
    pub units_per_node: u32,

    /// Rank of this machine
    pub node_rank: u32,

    /// Rendezvous address handed to workers
    pub coordinator_address: String,

    /// Rendezvous port handed to workers
    pub coordinator_port: u16,

    /// Retry configuration for the whole launch
    pub retry: RetryConfig,

    /// Optional communication backend selector
    pub backend: Option<String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            node_count: 1,
            units_per_node: 1,
            node_rank: 0,
            coordinator_address: "127.0.0.1".to_string(),
            coordinator_port: 29500,
            retry: RetryConfig::default(),
            backend: None,
        }
    }
}

impl LaunchConfig {
    /// Total number of workers across all nodes; [`validate`](Self::validate)
    /// guarantees it fits in a `u32`
    pub fn world_size(&self) -> u32 {
        self.node_count * self.units_per_node
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_count == 0 {
            return Err(Error::invalid_config("node_count must be at least 1"));
        }
        if self.units_per_node == 0 {
            return Err(Error::invalid_config("units_per_node must be at least 1"));
        }
        if self.node_count.checked_mul(self.units_per_node).is_none() {
            return Err(Error::invalid_config(format!(
                "world size of {} node(s) x {} unit(s) overflows",
                self.node_count, self.units_per_node
            )));
        }
        if self.node_rank >= self.node_count {
            return Err(Error::invalid_config(format!(
                "node_rank {} out of range for {} node(s)",
                self.node_rank, self.node_count
            )));
        }
        self.retry.validate()
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub base_backoff: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_backoff.is_zero() {
            return Err(Error::invalid_config("base_backoff must be positive"));
        }
        if self.max_backoff < self.base_backoff {
            return Err(Error::invalid_config(format!(
                "max_backoff ({:?}) must not be below base_backoff ({:?})",
                self.max_backoff, self.base_backoff
            )));
        }
        Ok(())
    }
}

/// Fault classification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Case-insensitive substrings marking a failure as transient
    pub transient_signatures: Vec<String>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            transient_signatures: DEFAULT_TRANSIENT_SIGNATURES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Root directory holding `manifest.json` and `step_*` directories
    pub root: PathBuf,

    /// Number of manifest records retained
    pub history_limit: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./checkpoints"),
            history_limit: 20,
        }
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_limit == 0 {
            return Err(Error::invalid_config("history_limit must be at least 1"));
        }
        Ok(())
    }
}

/// Duration serialization helper for human-readable formats
mod duration_millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.launch.world_size(), 1);
        assert_eq!(config.launch.coordinator_port, 29500);
        assert_eq!(config.launch.retry.max_retries, 3);
        assert_eq!(config.checkpoint.history_limit, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_world_size() {
        let launch = LaunchConfig {
            node_count: 2,
            units_per_node: 8,
            node_rank: 1,
            ..Default::default()
        };
        assert_eq!(launch.world_size(), 16);
        assert!(launch.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"launch": {"units_per_node": 4, "retry": {"base_backoff": 500}}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.launch.units_per_node, 4);
        assert_eq!(config.launch.retry.base_backoff, Duration::from_millis(500));
        assert_eq!(config.launch.retry.max_backoff, Duration::from_secs(300));
        assert_eq!(config.fault.transient_signatures.len(), 5);
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.launch.coordinator_port, config.launch.coordinator_port);
        assert_eq!(parsed.checkpoint.root, config.checkpoint.root);
    }

    #[test]
    fn test_invalid_configs() {
        let mut launch = LaunchConfig {
            node_count: 2,
            node_rank: 2,
            ..Default::default()
        };
        assert!(matches!(launch.validate(), Err(Error::InvalidConfig { .. })));

        launch.node_rank = 0;
        launch.retry.max_backoff = Duration::from_secs(1);
        assert!(matches!(launch.validate(), Err(Error::InvalidConfig { .. })));

        let oversized = LaunchConfig {
            node_count: 70_000,
            units_per_node: 70_000,
            ..Default::default()
        };
        assert!(matches!(oversized.validate(), Err(Error::InvalidConfig { .. })));

        let largest = LaunchConfig {
            node_count: 65_536,
            units_per_node: 65_535,
            ..Default::default()
        };
        assert!(largest.validate().is_ok());
        assert_eq!(largest.world_size(), 65_536 * 65_535);

        let checkpoint = CheckpointConfig {
            history_limit: 0,
            ..Default::default()
        };
        assert!(checkpoint.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.json");
        std::fs::write(&path, r#"{"checkpoint": {"root": "/data/ckpt"}}"#).unwrap();

        let config = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(config.checkpoint.root, PathBuf::from("/data/ckpt"));

        std::fs::write(&path, r#"{"launch": {"units_per_node": 0}}"#).unwrap();
        assert!(RuntimeConfig::from_file(&path).is_err());
    }
}
