//! # config
//!
//! why: keep every timing and batching knob of a node in one serde-friendly place
//! relations: read by node.rs (batch size, session timeout) and server.rs (timers)
//! what: RaftConfig with defaults, json loading, validation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Timing and batching configuration for a Raft node.
///
/// All durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound of the randomized election timeout
    pub election_timeout_max: u64,
    /// Interval between leader heartbeats
    pub heartbeat_interval: u64,
    /// Session timeout granted to clients that don't ask for one
    pub session_timeout: u64,
    /// Maximum number of entries shipped in a single append request
    pub max_entries_per_append: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            session_timeout: 5000,
            max_entries_per_append: 64,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("election timeout range is empty or inverted: {min}..={max}")]
    InvalidElectionRange { min: u64, max: u64 },
    #[error("heartbeat interval {heartbeat}ms must be below the election timeout {min}ms")]
    HeartbeatTooSlow { heartbeat: u64, min: u64 },
    #[error("max_entries_per_append must be at least 1")]
    EmptyBatch,
    #[error("session timeout must be non-zero")]
    ZeroSessionTimeout,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RaftConfig {
    /// Parse a config from json, filling omitted fields with defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: RaftConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout_min == 0 || self.election_timeout_min > self.election_timeout_max
        {
            return Err(ConfigError::InvalidElectionRange {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                min: self.election_timeout_min,
            });
        }
        if self.max_entries_per_append == 0 {
            return Err(ConfigError::EmptyBatch);
        }
        if self.session_timeout == 0 {
            return Err(ConfigError::ZeroSessionTimeout);
        }
        Ok(())
    }

    /// Pick a random election timeout within the configured range.
    ///
    /// An inverted range collapses to its lower bound.
    pub fn random_election_timeout(&self) -> Duration {
        let max = self.election_timeout_max.max(self.election_timeout_min);
        let millis = rand::rng().random_range(self.election_timeout_min..=max);
        Duration::from_millis(millis)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }
}
