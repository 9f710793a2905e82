//! Agent configuration.
//!
//! Everything is read from environment variables once at startup. Controller
//! enablement flags are copied into the catalog predicates and never re-read.

use crate::error::ControllerError;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Default address the query API listens on.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5005";

/// Runtime configuration for the cluster agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Run the `metadata` controller (node labels and pod service tags)
    pub collect_metadata_tags: bool,
    /// Run the `autoscalers` controller
    pub external_metrics_enabled: bool,
    /// Run the `services` and `endpoints` informers used by cluster checks
    pub cluster_checks_enabled: bool,
    /// Upper bound for each controller's initial cache sync
    pub cache_sync_timeout: Duration,
    /// Period of the leader-gated autoscaler refresh
    pub autoscaler_refresh_period: Duration,
    /// Query API listen address
    pub listen_addr: SocketAddr,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            collect_metadata_tags: true,
            external_metrics_enabled: false,
            cluster_checks_enabled: false,
            cache_sync_timeout: Duration::from_secs(5),
            autoscaler_refresh_period: Duration::from_secs(30),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5005)),
        }
    }
}

impl AgentConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    ///
    /// Unset keys fall back to [`AgentConfig::default`]; set but malformed
    /// values are rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let collect_metadata_tags = parse_bool(&lookup, "COLLECT_METADATA_TAGS")?
            .unwrap_or(defaults.collect_metadata_tags);
        let external_metrics_enabled = parse_bool(&lookup, "EXTERNAL_METRICS_ENABLED")?
            .unwrap_or(defaults.external_metrics_enabled);
        let cluster_checks_enabled = parse_bool(&lookup, "CLUSTER_CHECKS_ENABLED")?
            .unwrap_or(defaults.cluster_checks_enabled);
        let cache_sync_timeout = parse_seconds(&lookup, "CACHE_SYNC_TIMEOUT_SECONDS")?
            .unwrap_or(defaults.cache_sync_timeout);
        let autoscaler_refresh_period = parse_seconds(&lookup, "AUTOSCALER_REFRESH_SECONDS")?
            .unwrap_or(defaults.autoscaler_refresh_period);

        let listen_addr = match lookup("LISTEN_ADDR") {
            Some(raw) => raw.trim().parse::<SocketAddr>().map_err(|e| {
                ControllerError::InvalidConfig(format!("LISTEN_ADDR {:?}: {}", raw, e))
            })?,
            None => defaults.listen_addr,
        };

        Ok(Self {
            collect_metadata_tags,
            external_metrics_enabled,
            cluster_checks_enabled,
            cache_sync_timeout,
            autoscaler_refresh_period,
            listen_addr,
        })
    }
}

fn parse_bool<F>(lookup: &F, key: &str) -> Result<Option<bool>, ControllerError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(Some(true)),
        "false" | "0" | "no" => Ok(Some(false)),
        _ => Err(ControllerError::InvalidConfig(format!(
            "{} must be a boolean, got {:?}",
            key, raw
        ))),
    }
}

fn parse_seconds<F>(lookup: &F, key: &str) -> Result<Option<Duration>, ControllerError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let secs = raw.trim().parse::<u64>().map_err(|_| {
        ControllerError::InvalidConfig(format!("{} must be a number of seconds, got {:?}", key, raw))
    })?;
    if secs == 0 {
        return Err(ControllerError::InvalidConfig(format!("{} must be greater than zero", key)));
    }
    Ok(Some(Duration::from_secs(secs)))
}
