use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::push::DispatchReport;

/// Counters for everything the pipeline has processed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    /// Envelopes taken from the queue
    pub envelopes: u64,
    /// Envelopes rejected because the body did not decode
    pub decode_rejects: u64,
    /// Of those, rejected without requeue
    pub dead_lettered: u64,
    /// Control events applied to the registries (live and backfill)
    pub control_updates: u64,
    pub not_admitted: u64,
    pub decrypt_failures: u64,
    /// Domain events by kind
    pub domain_by_kind: HashMap<u16, u64>,
    /// Domain events that matched at least one identity
    pub matched_events: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub no_destination: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dispatch(&mut self, report: &DispatchReport) {
        self.accepted += report.accepted() as u64;
        self.rejected += report.rejected() as u64;
        self.failed += report.failed() as u64;
        self.timed_out += report.timed_out() as u64;
        self.no_destination += report.no_destination.len() as u64;
    }

    pub fn domain_events(&self) -> u64 {
        self.domain_by_kind.values().sum()
    }

    /// Get list of kinds sorted by count (descending)
    pub fn kinds_by_count(&self) -> Vec<(u16, u64)> {
        let mut kinds: Vec<_> = self.domain_by_kind.iter().map(|(&k, &c)| (k, c)).collect();
        kinds.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        kinds
    }
}

/// Thread-safe wrapper for pipeline stats
#[derive(Debug, Clone, Default)]
pub struct SharedPipelineStats {
    inner: Arc<RwLock<PipelineStats>>,
}

impl SharedPipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, f: impl FnOnce(&mut PipelineStats)) {
        f(&mut self.inner.write());
    }

    pub fn record_domain(&self, kind: u16) {
        *self.inner.write().domain_by_kind.entry(kind).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> PipelineStats {
        self.inner.read().clone()
    }

    pub fn log_summary(&self) {
        let stats = self.snapshot();
        info!(
            envelopes = stats.envelopes,
            control_updates = stats.control_updates,
            not_admitted = stats.not_admitted,
            decrypt_failures = stats.decrypt_failures,
            decode_rejects = stats.decode_rejects,
            domain_events = stats.domain_events(),
            matched_events = stats.matched_events,
            accepted = stats.accepted,
            rejected = stats.rejected,
            failed = stats.failed,
            timed_out = stats.timed_out,
            "pipeline summary"
        );
        for (kind, count) in stats.kinds_by_count().into_iter().take(5) {
            info!(kind, count, "domain events by kind");
        }
    }
}
