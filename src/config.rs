//! Node configuration
//!
//! Configuration comes from environment variables. Every knob has a default
//! so a bare `tenantcast` starts on a laptop; production deployments override
//! the region, node name and timers.

use std::time::Duration;

/// Node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Node name, unique within the cluster (e.g. "tenantcast@10.0.0.4")
    pub node_name: String,
    /// Region this node runs in (e.g. "us-east-1")
    pub region: String,
    /// Address other nodes use to reach this node's cluster RPC endpoint
    pub rpc_addr: String,
    /// Suffix appended to the replication slot name (isolates environments
    /// sharing one database)
    pub slot_name_suffix: Option<String>,
    /// Claim names that must be present in every session JWT
    pub jwt_claim_validators: Vec<String>,
    /// How often a Connect supervisor re-evaluates its region placement
    pub rebalance_check_interval: Duration,
    /// How often a Connect supervisor samples the connected-user count
    pub check_connected_user_interval: Duration,
    /// Timeout for inter-node RPC calls
    pub erpc_timeout: Duration,
    /// Timeout for the replication stream to come up
    pub replication_start_timeout: Duration,
    /// TTL for cached tenant records
    pub tenant_cache_ttl: Duration,
    /// Connections per tenant DB pool
    pub db_pool_size: usize,
    /// Timeout for checking a connection out of a tenant pool
    pub db_checkout_timeout: Duration,
}

impl Config {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_name =
            std::env::var("NODE_NAME").unwrap_or_else(|_| "tenantcast@127.0.0.1".to_string());
        let region = std::env::var("REGION").unwrap_or_else(|_| "us-east-1".to_string());
        let rpc_addr = std::env::var("RPC_ADDR").unwrap_or_else(|_| "127.0.0.1:4369".to_string());

        let slot_name_suffix = std::env::var("SLOT_NAME_SUFFIX")
            .ok()
            .filter(|s| !s.is_empty());

        let jwt_claim_validators = std::env::var("JWT_CLAIM_VALIDATORS")
            .map(|raw| {
                raw.split(',')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            node_name,
            region,
            rpc_addr,
            slot_name_suffix,
            jwt_claim_validators,
            rebalance_check_interval: env_duration_ms(
                "REBALANCE_CHECK_INTERVAL_IN_MS",
                Duration::from_secs(30),
            )?,
            check_connected_user_interval: env_duration_ms(
                "CHECK_CONNECTED_USER_INTERVAL",
                Duration::from_secs(50),
            )?,
            erpc_timeout: env_duration_ms("ERPC_TIMEOUT", Duration::from_secs(30))?,
            replication_start_timeout: env_duration_ms(
                "REPLICATION_START_TIMEOUT_IN_MS",
                Duration::from_secs(30),
            )?,
            tenant_cache_ttl: env_duration_ms("TENANT_CACHE_TTL_IN_MS", Duration::from_secs(30))?,
            db_pool_size: env_parse("DB_POOL_SIZE", 2)?,
            db_checkout_timeout: env_duration_ms(
                "DB_CHECKOUT_TIMEOUT_IN_MS",
                Duration::from_secs(5),
            )?,
        })
    }

    /// Replication slot name for this deployment
    pub fn replication_slot_name(&self) -> String {
        match &self.slot_name_suffix {
            Some(suffix) => format!("supabase_realtime_messages_replication_slot_{suffix}"),
            None => "supabase_realtime_messages_replication_slot".to_string(),
        }
    }
}

fn env_duration_ms(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidEnv(name, "expected milliseconds as u64")),
        Err(_) => Ok(default),
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidEnv(name, "failed to parse")),
        Err(_) => Ok(default),
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid environment variable {0}: {1}")]
    InvalidEnv(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_env().unwrap();
        assert_eq!(config.check_connected_user_interval, Duration::from_secs(50));
        assert_eq!(config.erpc_timeout, Duration::from_secs(30));
        assert_eq!(config.db_pool_size, 2);
    }

    #[test]
    fn test_slot_name_without_suffix() {
        let mut config = Config::from_env().unwrap();
        config.slot_name_suffix = None;
        assert_eq!(
            config.replication_slot_name(),
            "supabase_realtime_messages_replication_slot"
        );
    }

    #[test]
    fn test_slot_name_with_suffix() {
        let mut config = Config::from_env().unwrap();
        config.slot_name_suffix = Some("staging".to_string());
        assert_eq!(
            config.replication_slot_name(),
            "supabase_realtime_messages_replication_slot_staging"
        );
    }
}
