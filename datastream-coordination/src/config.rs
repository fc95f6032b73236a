use std::collections::HashMap;
use std::time::Duration;

use assignment_coordination::util::{validate_identifier, Backoff};
use envconfig::Envconfig;

use crate::coordinator::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::keys::Keyspace;
use crate::membership::MembershipConfig;
use crate::reconciler::ReconcilerConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // ── etcd ────────────────────────────────────────────────────────
    #[envconfig(default = "http://localhost:2379")]
    pub etcd_endpoints: String,

    #[envconfig(default = "/datastream/")]
    pub etcd_prefix: String,

    #[envconfig(default = "datastream-cluster")]
    pub cluster_name: String,

    #[envconfig(default = "5")]
    pub connect_timeout_secs: u64,

    // ── Membership ──────────────────────────────────────────────────
    #[envconfig(default = "30")]
    pub session_ttl_secs: i64,

    #[envconfig(default = "10")]
    pub keepalive_interval_secs: u64,

    #[envconfig(default = "500")]
    pub reregister_backoff_initial_ms: u64,

    #[envconfig(default = "30")]
    pub reregister_backoff_max_secs: u64,

    // ── Assignment ──────────────────────────────────────────────────
    #[envconfig(default = "250")]
    pub rebalance_debounce_interval_ms: u64,

    #[envconfig(default = "1000")]
    pub publish_retry_interval_ms: u64,

    #[envconfig(default = "5")]
    pub max_stale_write_retries: u32,

    // ── Tasks ───────────────────────────────────────────────────────
    #[envconfig(default = "10")]
    pub task_stop_timeout_secs: u64,

    #[envconfig(default = "30")]
    pub task_start_timeout_secs: u64,

    #[envconfig(default = "3")]
    pub task_start_max_attempts: u32,

    #[envconfig(default = "200")]
    pub task_start_backoff_ms: u64,

    /// Comma-separated connector types this worker runs.
    #[envconfig(default = "noop")]
    pub connector_types: String,

    /// Comma-separated `type=strategy` pairs. Unlisted types use broadcast.
    #[envconfig(default = "")]
    pub connector_strategies: String,

    // ── Observability ───────────────────────────────────────────────
    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "0.0.0.0:9102")]
    pub metrics_bind_address: String,

    /// `text` or `json`.
    #[envconfig(default = "text")]
    pub log_format: String,
}

impl Config {
    pub fn init_with_defaults() -> std::result::Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn etcd_endpoint_list(&self) -> Vec<String> {
        split_list(&self.etcd_endpoints)
    }

    pub fn connector_type_list(&self) -> Vec<String> {
        split_list(&self.connector_types)
    }

    pub fn connector_strategy_map(&self) -> Result<HashMap<String, String>> {
        let mut map = HashMap::new();
        for pair in split_list(&self.connector_strategies) {
            let Some((connector_type, strategy)) = pair.split_once('=') else {
                return Err(Error::configuration(format!(
                    "expected type=strategy in CONNECTOR_STRATEGIES, got {pair}"
                )));
            };
            let (connector_type, strategy) = (connector_type.trim(), strategy.trim());
            if connector_type.is_empty() || strategy.is_empty() {
                return Err(Error::configuration(format!(
                    "expected type=strategy in CONNECTOR_STRATEGIES, got {pair}"
                )));
            }
            map.insert(connector_type.to_string(), strategy.to_string());
        }
        Ok(map)
    }

    /// Key namespace of this cluster: `{etcd_prefix}{cluster_name}/`.
    pub fn cluster_prefix(&self) -> Result<Keyspace> {
        validate_identifier(&self.cluster_name)
            .map_err(|e| Error::configuration(format!("invalid CLUSTER_NAME: {e}")))?;
        let mut prefix = self.etcd_prefix.clone();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Ok(Keyspace::new(format!("{prefix}{}", self.cluster_name)))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn rebalance_debounce_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_debounce_interval_ms)
    }

    pub fn publish_retry_interval(&self) -> Duration {
        Duration::from_millis(self.publish_retry_interval_ms)
    }

    pub fn task_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.task_stop_timeout_secs)
    }

    pub fn task_start_timeout(&self) -> Duration {
        Duration::from_secs(self.task_start_timeout_secs)
    }

    pub fn reregister_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reregister_backoff_initial_ms),
            Duration::from_secs(self.reregister_backoff_max_secs),
        )
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            membership: MembershipConfig {
                session_ttl: self.session_ttl_secs,
                keepalive_interval: self.keepalive_interval(),
                debounce_interval: self.rebalance_debounce_interval(),
                reregister_backoff: self.reregister_backoff(),
            },
            rebalance_debounce_interval: self.rebalance_debounce_interval(),
            retry_backoff: self.reregister_backoff(),
            reconciler: ReconcilerConfig {
                stop_timeout: self.task_stop_timeout(),
                start_timeout: self.task_start_timeout(),
                start_attempts: self.task_start_max_attempts,
                start_backoff: Backoff::new(
                    Duration::from_millis(self.task_start_backoff_ms),
                    self.task_stop_timeout(),
                ),
            },
            publish_retry_interval: self.publish_retry_interval(),
            max_stale_write_retries: self.max_stale_write_retries,
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses() {
        let config = Config::init_with_defaults().expect("default config should parse");
        assert_eq!(config.session_ttl_secs, 30);
        assert_eq!(config.task_start_max_attempts, 3);
        assert_eq!(config.connector_type_list(), vec!["noop"]);
        assert!(config.connector_strategy_map().unwrap().is_empty());
        assert_eq!(config.log_format, "text");
    }

    #[test]
    fn etcd_endpoint_list_splits_comma_separated() {
        let mut config = Config::init_with_defaults().unwrap();
        config.etcd_endpoints = "http://a:2379, http://b:2379".to_string();
        assert_eq!(
            config.etcd_endpoint_list(),
            vec!["http://a:2379", "http://b:2379"]
        );
    }

    #[test]
    fn connector_strategies_parse_pairs() {
        let mut config = Config::init_with_defaults().unwrap();
        config.connector_strategies = "kafka=balanced-partition, webhook = broadcast".to_string();
        let map = config.connector_strategy_map().unwrap();
        assert_eq!(map["kafka"], "balanced-partition");
        assert_eq!(map["webhook"], "broadcast");
    }

    #[test]
    fn malformed_connector_strategy_is_rejected() {
        let mut config = Config::init_with_defaults().unwrap();
        for raw in ["kafka", "kafka=", "=broadcast"] {
            config.connector_strategies = raw.to_string();
            assert!(
                matches!(config.connector_strategy_map(), Err(Error::Configuration(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn cluster_prefix_joins_and_validates() {
        let mut config = Config::init_with_defaults().unwrap();
        config.etcd_prefix = "/datastream".to_string();
        config.cluster_name = "prod-east".to_string();
        assert_eq!(config.cluster_prefix().unwrap().prefix(), "/datastream/prod-east/");

        config.cluster_name = "../other".to_string();
        assert!(matches!(config.cluster_prefix(), Err(Error::Configuration(_))));
    }

    #[test]
    fn coordinator_config_carries_durations() {
        let config = Config::init_with_defaults().unwrap();
        let coordinator = config.coordinator_config();
        assert_eq!(coordinator.membership.session_ttl, 30);
        assert_eq!(coordinator.reconciler.stop_timeout, Duration::from_secs(10));
        assert_eq!(coordinator.rebalance_debounce_interval, Duration::from_millis(250));
        assert_eq!(coordinator.publish_retry_interval, Duration::from_secs(1));
    }
}
