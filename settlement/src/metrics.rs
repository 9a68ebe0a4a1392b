//! Settlement metrics
//!
//! - `settlement_sagas_started_total` / `_completed_total` / `_compensated_total`
//! - `settlement_sagas_manual_resolution_total` - Sagas waiting for an operator
//! - `settlement_allocations_total` / `settlement_inventory_shortfalls_total`
//! - `settlement_receivables_opened_total` / `settlement_recovered_paise_total`
//! - `settlement_step_duration_seconds` - Histogram of saga step latencies

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Settlement metrics collector
#[derive(Clone)]
pub struct SettlementMetrics {
    /// Sagas started
    pub sagas_started: IntCounter,
    /// Sagas completed
    pub sagas_completed: IntCounter,
    /// Sagas fully compensated
    pub sagas_compensated: IntCounter,
    /// Sagas parked for manual resolution
    pub sagas_manual: IntCounter,
    /// Allocations made
    pub allocations: IntCounter,
    /// Allocations refused for lack of inventory
    pub inventory_shortfalls: IntCounter,
    /// Receivables opened
    pub receivables_opened: IntCounter,
    /// Paise recovered from deposits
    pub recovered_paise: IntCounter,
    /// Step duration histogram
    pub step_duration: Histogram,
}

impl SettlementMetrics {
    /// Register on `registry`
    pub fn with_registry(registry: &Arc<Registry>) -> prometheus::Result<Self> {
        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let sagas_started = counter("settlement_sagas_started_total", "Sagas started")?;
        let sagas_completed = counter("settlement_sagas_completed_total", "Sagas completed")?;
        let sagas_compensated =
            counter("settlement_sagas_compensated_total", "Sagas fully compensated")?;
        let sagas_manual = counter(
            "settlement_sagas_manual_resolution_total",
            "Sagas parked for manual resolution",
        )?;
        let allocations = counter("settlement_allocations_total", "Inventory allocations made")?;
        let inventory_shortfalls = counter(
            "settlement_inventory_shortfalls_total",
            "Allocations refused for lack of inventory",
        )?;
        let receivables_opened =
            counter("settlement_receivables_opened_total", "Chargeback receivables opened")?;
        let recovered_paise = counter(
            "settlement_recovered_paise_total",
            "Paise recovered from deposits into receivables",
        )?;

        let step_duration = Histogram::with_opts(
            HistogramOpts::new(
                "settlement_step_duration_seconds",
                "Histogram of saga step latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0, 5.0]),
        )?;
        registry.register(Box::new(step_duration.clone()))?;

        Ok(Self {
            sagas_started,
            sagas_completed,
            sagas_compensated,
            sagas_manual,
            allocations,
            inventory_shortfalls,
            receivables_opened,
            recovered_paise,
            step_duration,
        })
    }

    /// Record step duration
    pub fn record_step_duration(&self, duration_seconds: f64) {
        self.step_duration.observe(duration_seconds);
    }
}

impl std::fmt::Debug for SettlementMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementMetrics")
            .field("sagas_started", &self.sagas_started.get())
            .field("sagas_completed", &self.sagas_completed.get())
            .field("sagas_compensated", &self.sagas_compensated.get())
            .field("allocations", &self.allocations.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shares_registry_with_ledger_metrics() {
        let registry = Arc::new(Registry::new());
        let ledger = ledger_core::Metrics::with_registry(registry.clone()).unwrap();
        let settlement = SettlementMetrics::with_registry(&registry).unwrap();

        ledger.record_posting();
        settlement.sagas_started.inc();

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"ledger_postings_total".to_string()));
        assert!(names.contains(&"settlement_sagas_started_total".to_string()));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Arc::new(Registry::new());
        SettlementMetrics::with_registry(&registry).unwrap();
        assert!(SettlementMetrics::with_registry(&registry).is_err());
    }
}
