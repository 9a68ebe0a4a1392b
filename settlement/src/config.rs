//! Configuration for settlement engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settlement engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Ledger store configuration
    pub ledger: ledger_core::Config,

    /// Saga execution
    pub saga: SagaConfig,

    /// Inventory allocation
    pub allocator: AllocatorConfig,

    /// Chargeback receivables
    pub receivables: ReceivableConfig,

    /// Withdrawals
    pub withdrawal: WithdrawalConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "settlement-engine".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            ledger: ledger_core::Config::default(),
            saga: SagaConfig::default(),
            allocator: AllocatorConfig::default(),
            receivables: ReceivableConfig::default(),
            withdrawal: WithdrawalConfig::default(),
        }
    }
}

/// Saga execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Bound on a single step (execute or compensate), in milliseconds
    pub step_timeout_ms: u64,

    /// Saga worker tasks
    pub workers: usize,

    /// Capacity of the saga queue
    pub queue_capacity: usize,

    /// Resume unfinished sagas at startup
    pub recover_on_start: bool,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 30_000,
            workers: 4,
            queue_capacity: 1024,
            recover_on_start: true,
        }
    }
}

/// Inventory allocation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// On reversal, return value to lots that are already exhausted instead
    /// of recording it as an inventory loss
    pub return_to_exhausted_lots: bool,
}

/// Receivable policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceivableConfig {
    /// Writing off the last open receivable also clears recovery mode
    pub write_off_clears_recovery: bool,
}

/// Withdrawal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WithdrawalConfig {
    /// Smallest withdrawal accepted, in paise
    pub min_amount_paise: i64,

    /// Interval of the stale-lock sweep in the server binary (seconds)
    pub sweep_interval_secs: u64,
}

impl Default for WithdrawalConfig {
    fn default() -> Self {
        Self {
            min_amount_paise: 100,
            sweep_interval_secs: 60,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `SETTLEMENT_*` and `LEDGER_*` environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        self.ledger.apply_env()?;

        if let Ok(dir) = std::env::var("SETTLEMENT_LEDGER_DIR") {
            self.ledger.data_dir = PathBuf::from(dir);
        }

        if let Ok(timeout) = std::env::var("SETTLEMENT_STEP_TIMEOUT_MS") {
            self.saga.step_timeout_ms = parse_env("SETTLEMENT_STEP_TIMEOUT_MS", &timeout)?;
        }

        if let Ok(workers) = std::env::var("SETTLEMENT_WORKERS") {
            self.saga.workers = parse_env("SETTLEMENT_WORKERS", &workers)?;
        }

        if let Ok(flag) = std::env::var("SETTLEMENT_WRITE_OFF_CLEARS_RECOVERY") {
            self.receivables.write_off_clears_recovery =
                parse_env("SETTLEMENT_WRITE_OFF_CLEARS_RECOVERY", &flag)?;
        }

        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.saga.workers == 0 {
            return Err(crate::Error::Config("saga.workers must be at least 1".into()));
        }
        if self.saga.queue_capacity == 0 {
            return Err(crate::Error::Config(
                "saga.queue_capacity must be at least 1".into(),
            ));
        }
        if self.saga.step_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "saga.step_timeout_ms must be positive".into(),
            ));
        }
        if self.withdrawal.min_amount_paise <= 0 {
            return Err(crate::Error::Config(
                "withdrawal.min_amount_paise must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| crate::Error::Config(format!("{}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(!config.receivables.write_off_clears_recovery);
        assert!(!config.allocator.return_to_exhausted_lots);
    }

    #[test]
    fn test_nested_toml() {
        let config: Config = toml::from_str(
            r#"
            [ledger]
            data_dir = "/var/lib/shareledger"

            [saga]
            step_timeout_ms = 1500
            workers = 2

            [receivables]
            write_off_clears_recovery = true
            "#,
        )
        .unwrap();

        assert_eq!(config.ledger.data_dir, PathBuf::from("/var/lib/shareledger"));
        assert_eq!(config.saga.step_timeout_ms, 1500);
        assert_eq!(config.saga.workers, 2);
        assert_eq!(config.saga.queue_capacity, 1024);
        assert!(config.receivables.write_off_clears_recovery);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = Config::default();
        config.saga.workers = 0;
        assert!(config.validate().is_err());
    }
}
