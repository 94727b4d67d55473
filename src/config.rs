use anyhow::Context;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::queue::QueueNames;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub http: HttpConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queues: QueueNames,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub worker: ConsumerConfig,
    #[serde(default)]
    pub logger: ConsumerConfig,
    #[serde(default)]
    pub health: HealthSettings,
    /// Accounts created at startup when missing
    #[serde(default)]
    pub accounts: Vec<AccountSeed>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AccountSeed {
    pub id: i64,
    pub balance: Decimal,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

/// Ledger store connection. `url: None` selects the in-memory ledger.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 20,
            acquire_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// `queue_messages` table in the ledger database
    Postgres,
    /// Process-local queue, only meaningful for the `all` role
    Memory,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub poll_interval_ms: u64,
    pub visibility_timeout_ms: u64,
    pub redelivery_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Memory,
            poll_interval_ms: 200,
            visibility_timeout_ms: 30_000,
            redelivery_delay_ms: 1000,
        }
    }
}

impl BrokerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }
}

/// Consumer pool settings shared by the worker and the audit logger
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConsumerConfig {
    pub consumers: usize,
    pub receive_wait_ms: u64,
    pub retry_backoff_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumers: 4,
            receive_wait_ms: 1000,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HealthSettings {
    pub interval_ms: u64,
    pub max_backoff_ms: u64,
    pub failure_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            max_backoff_ms: 30_000,
            failure_threshold: 5,
        }
    }
}

impl AppConfig {
    /// Load `config/{env}.yaml`, then apply environment overrides.
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let mut config: AppConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config yaml: {}", config_path))?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overrides: `DATABASE_URL`, `TRANSFER_QUEUE`, `AUDIT_QUEUE`, `HTTP_PORT`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Some(queue) = lookup("TRANSFER_QUEUE") {
            self.queues.transfer = queue;
        }
        if let Some(queue) = lookup("AUDIT_QUEUE") {
            self.queues.audit = queue;
        }
        if let Some(port) = lookup("HTTP_PORT") {
            self.http.port = port
                .parse()
                .with_context(|| format!("HTTP_PORT is not a valid port: {}", port))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
log_level: info
log_dir: ./logs
log_file: settlement.log
use_json: false
rotation: daily
http:
  host: 0.0.0.0
  port: 8080
"#;

    #[test]
    fn test_defaults_fill_optional_sections() {
        let config: AppConfig = serde_yaml::from_str(MINIMAL).unwrap();
        assert!(config.database.url.is_none());
        assert_eq!(config.broker.kind, BrokerKind::Memory);
        assert_eq!(config.queues.transfer, "transactions");
        assert_eq!(config.queues.audit, "transaction_logs");
        assert_eq!(config.health.failure_threshold, 5);
        assert!(config.accounts.is_empty());
    }

    #[test]
    fn test_account_seeds() {
        let yaml = format!(
            "{}accounts:\n  - {{ id: 1, balance: 100 }}\n  - {{ id: 2, balance: \"0.50\" }}\n",
            MINIMAL
        );
        let config: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            config.accounts,
            vec![
                AccountSeed {
                    id: 1,
                    balance: Decimal::from(100)
                },
                AccountSeed {
                    id: 2,
                    balance: Decimal::new(50, 2)
                },
            ]
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut config: AppConfig = serde_yaml::from_str(MINIMAL).unwrap();
        let env: HashMap<&str, &str> = [
            ("DATABASE_URL", "postgres://ledger@localhost/ledger"),
            ("AUDIT_QUEUE", "audit"),
            ("HTTP_PORT", "9090"),
        ]
        .into_iter()
        .collect();

        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(
            config.database.url.as_deref(),
            Some("postgres://ledger@localhost/ledger")
        );
        assert_eq!(config.queues.audit, "audit");
        assert_eq!(config.queues.transfer, "transactions");
        assert_eq!(config.http.port, 9090);
    }

    #[test]
    fn test_shipped_configs_parse() {
        for name in ["dev", "prod"] {
            let path = format!("{}/config/{}.yaml", env!("CARGO_MANIFEST_DIR"), name);
            let content = fs::read_to_string(&path).unwrap();
            let config: AppConfig = serde_yaml::from_str(&content).unwrap();
            assert!(config.worker.consumers > 0, "{}", path);
        }
    }

    #[test]
    fn test_invalid_port_override_is_rejected() {
        let mut config: AppConfig = serde_yaml::from_str(MINIMAL).unwrap();
        let result = config.apply_env_overrides(|key| {
            (key == "HTTP_PORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }
}
