use crate::error::{Result, TallyError};
use crate::types::ClusterConfig;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Loads a cluster configuration from a JSON file.
pub fn load_config(path: impl AsRef<Path>) -> Result<ClusterConfig> {
    let data = fs::read_to_string(path)?;
    parse_config(&data)
}

/// Parses and validates a cluster configuration from JSON text.
pub fn parse_config(data: &str) -> Result<ClusterConfig> {
    let config: ClusterConfig = serde_json::from_str(data)?;
    validate(&config)?;
    Ok(config)
}

/// Checks the invariants the consensus layer relies on.
pub fn validate(config: &ClusterConfig) -> Result<()> {
    if config.nodes.is_empty() {
        return Err(TallyError::Config("cluster has no nodes".into()));
    }

    let mut seen = HashSet::new();
    for node in &config.nodes {
        if !seen.insert(node.node_id.as_str()) {
            return Err(TallyError::Config(format!(
                "duplicate node id `{}`",
                node.node_id
            )));
        }
    }

    if config.election_timeout_min_ms == 0
        || config.election_timeout_min_ms > config.election_timeout_max_ms
    {
        return Err(TallyError::Config(format!(
            "invalid election timeout range {}..={} ms",
            config.election_timeout_min_ms, config.election_timeout_max_ms
        )));
    }

    if config.heartbeat_interval_ms == 0
        || config.heartbeat_interval_ms >= config.election_timeout_min_ms
    {
        return Err(TallyError::Config(format!(
            "heartbeat interval {} ms must be non-zero and below the minimum election timeout",
            config.heartbeat_interval_ms
        )));
    }

    if config.max_append_entries == 0 {
        return Err(TallyError::Config(
            "max_append_entries must be at least 1".into(),
        ));
    }

    Ok(())
}
