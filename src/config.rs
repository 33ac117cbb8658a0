use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use crate::core_types::UserId;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub event_log: EventLogConfig,
    /// PostgreSQL connection URL. Absent → in-memory ledger.
    #[serde(default)]
    pub postgres_url: Option<String>,
    /// Seed prices written to the fast store at boot.
    #[serde(default)]
    pub prices: BTreeMap<String, Decimal>,
    /// Opening balances created in the ledger at boot. Existing users keep theirs.
    #[serde(default)]
    pub users: BTreeMap<UserId, Decimal>,
    /// Load balances and positions from the ledger into the fast store at boot.
    #[serde(default)]
    pub hydrate_from_ledger: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AdmissionConfig {
    pub queue_capacity: usize,
    pub workers: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 50_000,
            workers: 30,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StagingConfig {
    /// Guard misses tolerated before giving up with `Contention`.
    pub max_cas_retries: u32,
    pub lock_shards: usize,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            max_cas_retries: 3,
            lock_shards: 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BridgeConfig {
    pub workers: usize,
    pub stream: String,
    pub group: String,
    pub topic: String,
    pub read_count: usize,
    pub block_ms: u64,
    pub claim_idle_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            stream: "buy_stream".to_string(),
            group: "kafka_workers".to_string(),
            topic: "trade_events".to_string(),
            read_count: 10,
            block_ms: 5000,
            claim_idle_ms: 30_000,
        }
    }
}

impl BridgeConfig {
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn claim_idle(&self) -> Duration {
        Duration::from_millis(self.claim_idle_ms)
    }
}

/// What happens to a second event for a user already in the open batch.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Keep the first, drop and acknowledge the later one.
    #[default]
    DropLater,
    /// Carry the later one into the next batch.
    Defer,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerConfig {
    pub workers: usize,
    pub group: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub poll_ms: u64,
    pub tx_timeout_ms: u64,
    pub max_commit_attempts: u32,
    pub dedup_policy: DedupPolicy,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            workers: 15,
            group: "postgres-writer".to_string(),
            batch_size: 1000,
            flush_interval_ms: 1000,
            poll_ms: 100,
            tx_timeout_ms: 5000,
            max_commit_attempts: 3,
            dedup_policy: DedupPolicy::DropLater,
        }
    }
}

impl LedgerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn tx_timeout(&self) -> Duration {
        Duration::from_millis(self.tx_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct EventLogConfig {
    /// Directory for topic segments. Absent → memory only.
    pub data_dir: Option<String>,
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", config_path, e))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const MINIMAL: &str = r#"
log_level: info
log_dir: ./logs
log_file: settlement.log
use_json: false
rotation: never
gateway:
  host: 0.0.0.0
  port: 8080
"#;

    #[test]
    fn test_minimal_yaml_fills_defaults() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.admission.queue_capacity, 50_000);
        assert_eq!(config.admission.workers, 30);
        assert_eq!(config.bridge.stream, "buy_stream");
        assert_eq!(config.bridge.group, "kafka_workers");
        assert_eq!(config.ledger.group, "postgres-writer");
        assert_eq!(config.ledger.batch_size, 1000);
        assert_eq!(config.ledger.dedup_policy, DedupPolicy::DropLater);
        assert!(config.postgres_url.is_none());
        assert!(config.event_log.data_dir.is_none());
        assert!(config.prices.is_empty());
        assert!(config.users.is_empty());
    }

    #[test]
    fn test_overrides_and_prices() {
        let yaml = format!(
            "{}{}",
            MINIMAL,
            r#"
ledger:
  batch_size: 50
  dedup_policy: defer
prices:
  AAPL: "100"
  MSFT: "120.5"
users:
  7: "1000"
"#
        );
        let config = AppConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.ledger.batch_size, 50);
        assert_eq!(config.ledger.workers, 15);
        assert_eq!(config.ledger.dedup_policy, DedupPolicy::Defer);
        assert_eq!(config.prices.get("MSFT"), Some(&dec!(120.5)));
        assert_eq!(config.users.get(&7), Some(&dec!(1000)));
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(AppConfig::load("does-not-exist").is_err());
    }
}
