//! Settlement engine process
//!
//! Opens the store, resumes unfinished sagas and sweeps expired withdrawal
//! locks until interrupted.

use settlement::{Config, SettlementEngine};
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if std::env::var("SETTLEMENT_LOG_JSON").is_ok() {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Settlement engine starting...");

    let config = match std::env::var("SETTLEMENT_CONFIG") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::from_env()?,
    };
    let sweep_every = Duration::from_secs(config.withdrawal.sweep_interval_secs.max(1));

    info!(
        data_dir = %config.ledger.data_dir.display(),
        workers = config.saga.workers,
        "Configuration loaded"
    );

    let engine = SettlementEngine::new(config).await?;
    let report = engine.verify_invariants()?;
    if !report.is_clean() {
        for violation in &report.violations {
            tracing::error!(violation = %violation, "Invariant violation at startup");
        }
    }

    let mut sweep = tokio::time::interval(sweep_every);
    loop {
        tokio::select! {
            _ = sweep.tick() => {
                match engine.expire_stale_withdrawals().await {
                    Ok(0) => {}
                    Ok(expired) => info!(expired = expired, "Expired stale withdrawals"),
                    Err(e) => tracing::error!(error = %e, "Withdrawal sweep failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                break;
            }
        }
    }

    engine.shutdown().await?;
    info!("Settlement engine stopped");
    Ok(())
}
