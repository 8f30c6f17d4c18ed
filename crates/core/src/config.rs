//! Sync-root configuration file parsing (.mirsync.toml)

use std::path::Path;

/// Config file name, looked up at the sync root.
pub const CONFIG_FILE: &str = ".mirsync.toml";

/// Per-root tuning knobs.
#[derive(Debug, serde::Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Nominal block size in bytes; 0 derives it from each file's size.
    pub block_size: u64,

    /// Deadline for a single RPC, in milliseconds.
    pub rpc_timeout_ms: u64,

    /// Bound on the number of queued-but-unprocessed operations.
    pub queue_capacity: usize,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// Retry policy for failed transfers.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per queue item before it is dropped.
    pub max_attempts: u32,

    /// Base backoff, doubled on each further attempt.
    pub backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            block_size: 0,
            rpc_timeout_ms: 30_000,
            queue_capacity: 1024,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 500,
        }
    }
}

impl SyncConfig {
    /// Load config from the sync root.
    ///
    /// Returns defaults if `.mirsync.toml` doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(root: &Path) -> Result<Self, crate::SyncError> {
        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)?;
        toml::from_str(&content).map_err(|err| {
            crate::SyncError::Validation(format!("{}: {err}", config_path.display()))
        })
    }
}
