//! Raft timing and batching parameters

use rand::Rng;
use std::time::Duration;
use tally_common::types::ClusterConfig;

use super::error::RaftError;

/// Configuration for Raft timing parameters
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between heartbeats sent by leader (default: 50ms)
    pub heartbeat_interval: Duration,
    /// Minimum election timeout (default: 150ms)
    pub election_timeout_min: Duration,
    /// Maximum election timeout (default: 300ms)
    pub election_timeout_max: Duration,
    /// Maximum number of entries carried by one AppendEntries (default: 64)
    pub max_append_entries: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            max_append_entries: 64,
        }
    }
}

impl RaftConfig {
    /// Create a new config with custom heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Create a new config with custom election timeout range
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    pub fn with_max_append_entries(mut self, max: usize) -> Self {
        self.max_append_entries = max;
        self
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        if self.election_timeout_min.is_zero() || self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::Configuration(format!(
                "invalid election timeout range {:?}..={:?}",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::Configuration(format!(
                "heartbeat interval {:?} must be non-zero and below the election timeout",
                self.heartbeat_interval
            )));
        }
        if self.max_append_entries == 0 {
            return Err(RaftError::Configuration(
                "max_append_entries must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Generate a random election timeout within the configured range
    pub fn random_election_timeout(&self) -> Duration {
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::rng().random_range(min_ms..=max_ms);
        Duration::from_millis(timeout_ms)
    }
}

impl From<&ClusterConfig> for RaftConfig {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            election_timeout_min: Duration::from_millis(config.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(config.election_timeout_max_ms),
            max_append_entries: config.max_append_entries,
        }
    }
}
