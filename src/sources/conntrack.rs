//! # Connection Adapter
//!
//! Polls the connection tracking table on a jittered interval and emits one
//! absolute-counter [`StatUpdate`] per local endpoint taking part in each
//! tracked connection.
//!
//! ## Endpoint-visible tuple
//! For destination-NATed connections the endpoint never sees the original
//! destination (a service address); it sees the translated one. The tuple is
//! therefore the original tuple with its destination replaced by the reply
//! tuple's source.
//!
//! ## Attribution
//! | Local side | Updates                                                     |
//! |------------|-------------------------------------------------------------|
//! | source     | tuple, out = original, in = reply                           |
//! | dest       | tuple, in = original, out = reply                           |
//! | both       | source update, plus mirrored tuple with in = original, out = reply |
//! | neither    | none                                                        |
//!
//! The mirrored tuple keeps the two endpoints' absolute counters on separate
//! records.
//!
//! ## Finished connections
//! TCP entries in `TIME_WAIT` or later are marked finished. The collector
//! then reports the record one last time and removes it instead of letting it
//! age out, and never creates a record for them.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::error::FlowError;
use crate::lookup::EndpointLookup;
use crate::sources::L4;
use crate::ticker::JitterTicker;
use crate::types::{CounterType, Counters, Direction, Tuple, PROTO_TCP};
use crate::update::StatUpdate;

// ================================================================================================
// RAW ENTRIES
// ================================================================================================

/// One direction of a tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtTuple {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub proto: u8,
    pub l4: L4,
}

impl CtTuple {
    pub fn to_tuple(&self) -> Tuple {
        match self.l4 {
            L4::Ports { src, dst } => Tuple::new(self.src, self.dst, self.proto, src, dst),
            L4::Icmp { id, icmp_type, code } => Tuple::icmp(self.src, self.dst, id, icmp_type, code),
        }
    }
}

/// TCP connection tracking state, in kernel order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TcpState {
    None,
    SynSent,
    SynRecv,
    Established,
    FinWait,
    CloseWait,
    LastAck,
    TimeWait,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtEntry {
    pub original: CtTuple,
    pub reply: CtTuple,
    pub original_counters: Counters,
    pub reply_counters: Counters,
    #[serde(default)]
    pub dnat: bool,
    #[serde(default)]
    pub snat: bool,
    #[serde(default)]
    pub tcp_state: Option<TcpState>,
}

impl CtEntry {
    /// TCP connection past `TIME_WAIT`.
    pub fn is_finished(&self) -> bool {
        self.original.proto == PROTO_TCP && self.tcp_state.is_some_and(|state| state >= TcpState::TimeWait)
    }

    /// The tuple as seen by the endpoint, undoing destination NAT.
    pub fn endpoint_tuple(&self) -> Tuple {
        if !self.dnat {
            return self.original.to_tuple();
        }

        let mut visible = self.original;
        visible.dst = self.reply.src;
        if let (L4::Ports { src, .. }, L4::Ports { src: reply_src, .. }) = (self.original.l4, self.reply.l4) {
            visible.l4 = L4::Ports { src, dst: reply_src };
        }
        visible.to_tuple()
    }
}

// ================================================================================================
// SNAPSHOT SOURCE
// ================================================================================================

/// Supplier of connection table snapshots.
pub trait ConntrackSource: Send + Sync {
    fn snapshot(&self) -> Result<Vec<CtEntry>, FlowError>;
}

/// In-memory source holding the most recently pushed table.
#[derive(Default)]
pub struct SnapshotSource {
    entries: Mutex<Vec<CtEntry>>,
}

impl SnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the table returned by subsequent snapshots.
    pub fn push(&self, entries: Vec<CtEntry>) {
        *self.entries.lock() = entries;
    }
}

impl ConntrackSource for SnapshotSource {
    fn snapshot(&self) -> Result<Vec<CtEntry>, FlowError> {
        Ok(self.entries.lock().clone())
    }
}

// ================================================================================================
// ADAPTER
// ================================================================================================

pub struct ConnectionAdapter {
    lookup: Arc<dyn EndpointLookup>,
    source: Arc<dyn ConntrackSource>,
    interval: Duration,
}

impl ConnectionAdapter {
    pub fn new(lookup: Arc<dyn EndpointLookup>, source: Arc<dyn ConntrackSource>, interval: Duration) -> Self {
        ConnectionAdapter {
            lookup,
            source,
            interval,
        }
    }

    /// Updates for one tracked connection. Empty if neither side is local.
    pub fn convert(&self, entry: &CtEntry) -> Vec<StatUpdate> {
        let tuple = entry.endpoint_tuple();
        let src_ep = self.lookup.resolve(tuple.src());
        let dst_ep = self.lookup.resolve(tuple.dst());

        let original = entry.original_counters;
        let reply = entry.reply_counters;

        let from_src = |endpoint| {
            StatUpdate::new(tuple, endpoint, reply, original, CounterType::Absolute, Direction::Egress, None)
        };

        let updates = match (src_ep, dst_ep) {
            (Some(src), None) => vec![from_src(src)],
            (None, Some(dst)) => vec![StatUpdate::new(
                tuple,
                dst,
                original,
                reply,
                CounterType::Absolute,
                Direction::Ingress,
                None,
            )],
            (Some(src), Some(dst)) => vec![
                from_src(src),
                StatUpdate::new(
                    tuple.reverse(),
                    dst,
                    original,
                    reply,
                    CounterType::Absolute,
                    Direction::Ingress,
                    None,
                ),
            ],
            (None, None) => Vec::new(),
        };

        if entry.is_finished() {
            updates.into_iter().map(StatUpdate::mark_finished).collect()
        } else {
            updates
        }
    }

    /// Polls until `shutdown` flips to true or the output closes.
    pub async fn run(self, out: mpsc::Sender<StatUpdate>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = JitterTicker::new(self.interval);
        info!(
            "Connection adapter started with {}ms polling interval",
            ticker.period().as_millis()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.poll(&out).await {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Connection adapter stopped");
    }

    /// Returns false once the output channel is closed.
    async fn poll(&self, out: &mpsc::Sender<StatUpdate>) -> bool {
        let entries = match self.source.snapshot() {
            Ok(entries) => entries,
            Err(e) => {
                error!("Skipping conntrack poll: {}", e);
                return true;
            }
        };

        let mut emitted = 0usize;
        for entry in &entries {
            for update in self.convert(entry) {
                if out.send(update).await.is_err() {
                    return false;
                }
                emitted += 1;
            }
        }
        debug!("Conntrack poll: {} entries, {} updates", entries.len(), emitted);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{EndpointKey, LookupCache, LookupUpdate};
    use crate::types::PROTO_TCP;

    fn host(endpoint: &str, addr: &str) -> LookupUpdate {
        LookupUpdate::HostEndpointUpdate {
            endpoint: endpoint.to_string(),
            addresses: vec![addr.to_string()],
            tiers: vec![],
        }
    }

    fn ct(src: &str, sport: u16, dst: &str, dport: u16) -> CtTuple {
        CtTuple {
            src: src.parse().unwrap(),
            dst: dst.parse().unwrap(),
            proto: PROTO_TCP,
            l4: L4::Ports { src: sport, dst: dport },
        }
    }

    fn entry(src: &str, dst: &str) -> CtEntry {
        CtEntry {
            original: ct(src, 40000, dst, 80),
            reply: ct(dst, 80, src, 40000),
            original_counters: Counters::new(10, 1000),
            reply_counters: Counters::new(8, 4000),
            dnat: false,
            snat: false,
            tcp_state: Some(TcpState::Established),
        }
    }

    fn adapter(locals: &[(&str, &str)]) -> ConnectionAdapter {
        let cache = LookupCache::new();
        for (name, addr) in locals {
            cache.on_update(host(name, addr));
        }
        ConnectionAdapter::new(Arc::new(cache), Arc::new(SnapshotSource::new()), Duration::from_secs(5))
    }

    #[test]
    fn test_source_local() {
        let adapter = adapter(&[("a", "10.0.0.1")]);
        let updates = adapter.convert(&entry("10.0.0.1", "8.8.8.8"));

        assert_eq!(updates.len(), 1);
        let update = &updates[0];
        assert_eq!(update.tuple.src(), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(update.outbound, Counters::new(10, 1000));
        assert_eq!(update.inbound, Counters::new(8, 4000));
        assert_eq!(update.counter_type, CounterType::Absolute);
        assert!(update.point.is_none());
    }

    #[test]
    fn test_destination_local() {
        let adapter = adapter(&[("b", "10.0.0.2")]);
        let updates = adapter.convert(&entry("8.8.8.8", "10.0.0.2"));

        assert_eq!(updates.len(), 1);
        let update = &updates[0];
        assert_eq!(update.tuple, entry("8.8.8.8", "10.0.0.2").original.to_tuple());
        assert_eq!(update.inbound, Counters::new(10, 1000));
        assert_eq!(update.outbound, Counters::new(8, 4000));
    }

    #[test]
    fn test_local_to_local_yields_two_mirrored_updates() {
        let adapter = adapter(&[("a", "10.0.0.1"), ("b", "10.0.0.2")]);
        let updates = adapter.convert(&entry("10.0.0.1", "10.0.0.2"));

        assert_eq!(updates.len(), 2);
        let (src, dst) = (&updates[0], &updates[1]);
        assert_eq!(src.endpoint, EndpointKey::Host { endpoint: "a".to_string() });
        assert_eq!(dst.endpoint, EndpointKey::Host { endpoint: "b".to_string() });
        assert_eq!(dst.tuple, src.tuple.reverse());
        assert_eq!(src.outbound, Counters::new(10, 1000));
        assert_eq!(dst.inbound, Counters::new(10, 1000));
        assert_eq!(dst.outbound, Counters::new(8, 4000));
    }

    #[test]
    fn test_neither_local_is_dropped() {
        let adapter = adapter(&[("a", "10.0.0.1")]);
        assert!(adapter.convert(&entry("8.8.8.8", "1.1.1.1")).is_empty());
    }

    #[test]
    fn test_dnat_uses_translated_destination() {
        let adapter = adapter(&[("backend", "10.0.0.5")]);
        let nat = CtEntry {
            original: ct("8.8.8.8", 40000, "10.96.0.10", 443),
            reply: ct("10.0.0.5", 8443, "8.8.8.8", 40000),
            original_counters: Counters::new(3, 300),
            reply_counters: Counters::new(2, 200),
            dnat: true,
            snat: false,
            tcp_state: None,
        };

        let tuple = nat.endpoint_tuple();
        assert_eq!(tuple.dst(), "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(tuple.l4_dst(), 8443);
        assert_eq!(tuple.l4_src(), 40000);

        let updates = adapter.convert(&nat);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].inbound, Counters::new(3, 300));
    }

    #[test]
    fn test_time_wait_and_later_mark_updates_finished() {
        let adapter = adapter(&[("a", "10.0.0.1"), ("b", "10.0.0.2")]);
        let mut closing = entry("10.0.0.1", "10.0.0.2");

        closing.tcp_state = Some(TcpState::LastAck);
        assert!(adapter.convert(&closing).iter().all(|update| !update.finished));

        for state in [TcpState::TimeWait, TcpState::Close] {
            closing.tcp_state = Some(state);
            let updates = adapter.convert(&closing);
            assert_eq!(updates.len(), 2);
            assert!(updates.iter().all(|update| update.finished));
        }
    }

    #[test]
    fn test_tcp_state_ignored_for_other_protocols() {
        let mut udp = entry("10.0.0.1", "8.8.8.8");
        udp.original.proto = 17;
        udp.tcp_state = Some(TcpState::Close);
        assert!(!udp.is_finished());

        let parsed: CtEntry = serde_json::from_str(
            r#"{"original":{"src":"10.0.0.1","dst":"8.8.8.8","proto":6,"l4":{"kind":"ports","src":1,"dst":2}},
                "reply":{"src":"8.8.8.8","dst":"10.0.0.1","proto":6,"l4":{"kind":"ports","src":2,"dst":1}},
                "original_counters":{"packets":1,"bytes":1},"reply_counters":{"packets":1,"bytes":1},
                "tcp_state":"time_wait"}"#,
        )
        .unwrap();
        assert!(parsed.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_and_stops_on_shutdown() {
        let cache = LookupCache::new();
        cache.on_update(host("a", "10.0.0.1"));
        let source = Arc::new(SnapshotSource::new());
        source.push(vec![entry("10.0.0.1", "8.8.8.8")]);

        let adapter = ConnectionAdapter::new(Arc::new(cache), source.clone(), Duration::from_secs(5));
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(adapter.run(out_tx, stop_rx));

        let update = out_rx.recv().await.unwrap();
        assert_eq!(update.outbound, Counters::new(10, 1000));

        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(out_rx.is_closed());
    }
}
