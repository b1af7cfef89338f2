//! Aggregation of denied traffic into the metrics registry.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use log::debug;

use super::MetricsRegistry;
use crate::data::Data;
use crate::types::{Counters, Direction, RuleAction};

type SeriesKey = (String, IpAddr);

pub struct DenyReporter {
    registry: Arc<dyn MetricsRegistry>,
    /// Series currently present in the registry.
    published: HashSet<SeriesKey>,
}

impl DenyReporter {
    pub fn new(registry: Arc<dyn MetricsRegistry>) -> Self {
        DenyReporter {
            registry,
            published: HashSet::new(),
        }
    }

    /// Recomputes the `(rule, source)` totals over `records` and publishes them.
    /// Series published earlier but absent from the new totals are deleted.
    /// Returns the number of series published.
    pub fn report<'a, I>(&mut self, records: I) -> usize
    where
        I: IntoIterator<Item = &'a Data>,
    {
        let mut totals: HashMap<SeriesKey, Counters> = HashMap::new();

        for data in records {
            let (direction, counters) = selected(data);
            let trace = data.trace(direction);
            if trace.action() != Some(RuleAction::Deny) {
                continue;
            }
            let Some(rule) = trace.rule_string() else {
                continue;
            };

            let entry = totals.entry((rule, data.tuple().src())).or_default();
            entry.packets = entry.packets.saturating_add(counters.packets);
            entry.bytes = entry.bytes.saturating_add(counters.bytes);
        }

        let mut removed = 0usize;
        for (rule, src) in self.published.iter().filter(|key| !totals.contains_key(*key)) {
            self.registry.delete(rule, *src);
            removed += 1;
        }
        for ((rule, src), counters) in &totals {
            self.registry.set(rule, *src, counters.packets, counters.bytes);
        }
        debug!(
            "Published {} denied-traffic series, removed {} stale",
            totals.len(),
            removed
        );

        let published = totals.len();
        self.published = totals.into_keys().collect();
        published
    }

    /// Removes the series tied to every denied direction of `data`.
    pub fn expire(&mut self, data: &Data) {
        let src = data.tuple().src();
        for direction in [Direction::Ingress, Direction::Egress] {
            let trace = data.trace(direction);
            if trace.action() != Some(RuleAction::Deny) {
                continue;
            }
            if let Some(rule) = trace.rule_string() {
                self.registry.delete(&rule, src);
                self.published.remove(&(rule, src));
            }
        }
    }
}

/// Ingress when the record has seen inbound packets, egress otherwise.
fn selected(data: &Data) -> (Direction, Counters) {
    if data.inbound().packets > 0 {
        (Direction::Ingress, data.inbound())
    } else {
        (Direction::Egress, data.outbound())
    }
}
