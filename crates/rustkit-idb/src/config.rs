//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::transaction::Durability;
use crate::tree::DEFAULT_TOMBSTONE_RATIO;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fraction of tombstoned nodes that triggers a tree rebuild.
    pub tombstone_ratio: f64,
    /// Durability for transactions that do not ask for one.
    pub default_durability: Durability,
    /// Attempts at flushing a commit before the writes are queued for replay
    /// (1 = no retries).
    pub flush_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tombstone_ratio: DEFAULT_TOMBSTONE_RATIO,
            default_durability: Durability::Default,
            flush_attempts: 3,
        }
    }
}

impl EngineConfig {
    /// Create a config where every commit must reach the backend.
    pub fn strict() -> Self {
        Self {
            default_durability: Durability::Strict,
            ..Default::default()
        }
    }

    /// Create a config that never retries flushes.
    pub fn relaxed() -> Self {
        Self {
            default_durability: Durability::Relaxed,
            flush_attempts: 1,
            ..Default::default()
        }
    }

    /// Set the compaction threshold. Values outside (0, 1) fall back to the default.
    pub fn with_tombstone_ratio(mut self, ratio: f64) -> Self {
        self.tombstone_ratio = if ratio > 0.0 && ratio < 1.0 {
            ratio
        } else {
            DEFAULT_TOMBSTONE_RATIO
        };
        self
    }

    /// Set the flush attempt count (at least 1).
    pub fn with_flush_attempts(mut self, attempts: u32) -> Self {
        self.flush_attempts = attempts.max(1);
        self
    }
}
