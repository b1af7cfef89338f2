//! Collector statistics.

use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectorStats {
    /// Updates received from the adapters
    pub updates: u64,

    /// Records created for previously unseen tuples
    pub flows_created: u64,

    /// Records removed by aging
    pub flows_expired: u64,

    /// Records removed because their connection finished
    pub flows_closed: u64,

    /// Rule trace conflicts that started a new logical flow
    pub conflicts: u64,

    /// Export records delivered to the sink
    pub records_exported: u64,

    /// Export records lost to a closed sink
    pub records_dropped: u64,

    /// Live records at the time of the snapshot
    pub active_flows: usize,
}

impl CollectorStats {
    /// Fraction of updates that hit a rule conflict.
    pub fn conflict_rate(&self) -> f64 {
        if self.updates == 0 {
            0.0
        } else {
            self.conflicts as f64 / self.updates as f64
        }
    }
}

impl fmt::Display for CollectorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "active={} updates={} created={} expired={} closed={} conflicts={} ({:.2}%) exported={} dropped={}",
            self.active_flows,
            self.updates,
            self.flows_created,
            self.flows_expired,
            self.flows_closed,
            self.conflicts,
            self.conflict_rate() * 100.0,
            self.records_exported,
            self.records_dropped
        )
    }
}
