//! Metrics collection for observability
//!
//! Prometheus metrics for the ledger, registered on a per-instance registry.
//!
//! # Metrics
//!
//! - `ledger_entries_total` - Wallet entries appended
//! - `ledger_postings_total` - Double-entry pairs posted
//! - `ledger_business_rejections_total` - Requests refused for business reasons
//! - `ledger_structural_errors_total` - Invariant/immutability failures
//! - `ledger_lock_timeouts_total` - Row lock acquisitions that timed out
//! - `ledger_commit_duration_seconds` - Histogram of atomic commit latencies

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

use crate::Error;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Wallet entries appended
    pub entries_total: IntCounter,

    /// Posting pairs written
    pub postings_total: IntCounter,

    /// Business rejections
    pub business_rejections: IntCounter,

    /// Structural errors
    pub structural_errors: IntCounter,

    /// Lock timeouts
    pub lock_timeouts: IntCounter,

    /// Commit duration histogram
    pub commit_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create collectors on a shared registry
    pub fn with_registry(registry: Arc<Registry>) -> prometheus::Result<Self> {
        let entries_total = IntCounter::new("ledger_entries_total", "Wallet entries appended")?;
        registry.register(Box::new(entries_total.clone()))?;

        let postings_total =
            IntCounter::new("ledger_postings_total", "Double-entry pairs posted")?;
        registry.register(Box::new(postings_total.clone()))?;

        let business_rejections = IntCounter::new(
            "ledger_business_rejections_total",
            "Requests refused for business reasons",
        )?;
        registry.register(Box::new(business_rejections.clone()))?;

        let structural_errors = IntCounter::new(
            "ledger_structural_errors_total",
            "Invariant or immutability failures",
        )?;
        registry.register(Box::new(structural_errors.clone()))?;

        let lock_timeouts = IntCounter::new(
            "ledger_lock_timeouts_total",
            "Row lock acquisitions that timed out",
        )?;
        registry.register(Box::new(lock_timeouts.clone()))?;

        let commit_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_commit_duration_seconds",
                "Histogram of atomic commit latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250]),
        )?;
        registry.register(Box::new(commit_duration.clone()))?;

        Ok(Self {
            entries_total,
            postings_total,
            business_rejections,
            structural_errors,
            lock_timeouts,
            commit_duration,
            registry,
        })
    }

    /// Record appended entries
    pub fn record_entries(&self, count: usize) {
        self.entries_total.inc_by(count as u64);
    }

    /// Record a posted pair
    pub fn record_posting(&self) {
        self.postings_total.inc();
    }

    /// Record commit duration
    pub fn record_commit_duration(&self, duration_seconds: f64) {
        self.commit_duration.observe(duration_seconds);
    }

    /// Classify and count a failed operation
    pub fn record_error(&self, error: &Error) {
        if error.is_business_outcome() {
            self.business_rejections.inc();
        } else if error.is_structural() {
            self.structural_errors.inc();
        } else if matches!(error, Error::LockTimeout(_)) {
            self.lock_timeouts.inc();
        }
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("entries_total", &self.entries_total.get())
            .field("postings_total", &self.postings_total.get())
            .finish()
    }
}
