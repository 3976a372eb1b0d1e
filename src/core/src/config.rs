use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Parallelism settings for storage-wide iteration.
///
/// Seeds the manager's worker count; when disabled, every for-each
/// operation runs with a single worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParallelConfig {
    /// Whether parallel iteration is enabled.
    #[serde(default)]
    pub enabled: bool,

    /// Maximum number of in-flight workers when enabled.
    #[serde(default = "default_tasks_limit")]
    pub tasks_limit: usize,
}

fn default_tasks_limit() -> usize {
    5
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tasks_limit: default_tasks_limit(),
        }
    }
}

/// Storage manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Directory hosting the shared host image locks. Lock files live for
    /// the whole process; the directory is created on first acquisition.
    #[serde(default = "default_locks_dir")]
    pub locks_dir: PathBuf,

    /// Parallelism settings.
    #[serde(default)]
    pub parallel: ParallelConfig,
}

fn default_locks_dir() -> PathBuf {
    std::env::temp_dir().join("stagedock").join("locks")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            locks_dir: default_locks_dir(),
            parallel: ParallelConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallel_config_defaults() {
        let config = ParallelConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.tasks_limit, 5);
    }

    #[test]
    fn test_storage_config_roundtrip() {
        let config = StorageConfig {
            locks_dir: PathBuf::from("/var/lib/stagedock/locks"),
            parallel: ParallelConfig {
                enabled: true,
                tasks_limit: 8,
            },
        };

        let json = serde_json::to_string(&config).unwrap();
        let parsed: StorageConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, config);
    }

    #[test]
    fn test_storage_config_from_empty_json() {
        let parsed: StorageConfig = serde_json::from_str("{}").unwrap();
        assert!(!parsed.parallel.enabled);
        assert!(parsed.locks_dir.ends_with("stagedock/locks"));
    }
}
