//! # Agent
//!
//! Wires the pipeline together:
//!
//! ```text
//! NflogPacket (ingress) -> DenyPathAdapter --\
//! NflogPacket (egress)  -> DenyPathAdapter ---+-> forwarders -> Collector -> ExportRecord
//! ConntrackSource       -> ConnectionAdapter -/
//! ```
//!
//! Each adapter writes to its own bounded queue; one forwarder per queue
//! relays into the collector inbox. The collector stops once every adapter
//! has stopped.

use std::sync::Arc;

use log::{error, info};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::collector::{spawn_forwarder, Collector, CollectorStats};
use crate::config::CollectorConfig;
use crate::dump::DumpWriter;
use crate::error::FlowError;
use crate::export::ExportRecord;
use crate::lookup::{EndpointLookup, LookupUpdate};
use crate::metrics::MetricsRegistry;
use crate::sources::{ConnectionAdapter, ConntrackSource, CtEntry, DenyPathAdapter, NflogPacket};
use crate::types::Direction;

/// One line of agent input.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InputEvent {
    Lookup { update: LookupUpdate },
    NflogIngress { packet: NflogPacket },
    NflogEgress { packet: NflogPacket },
    /// Full connection table; replaces the previous snapshot.
    Conntrack { entries: Vec<CtEntry> },
}

pub struct Agent {
    ingress: mpsc::Sender<NflogPacket>,
    egress: mpsc::Sender<NflogPacket>,
    dumps: mpsc::Sender<()>,
    shutdown: watch::Sender<bool>,
    adapters: Vec<JoinHandle<()>>,
    collector: JoinHandle<CollectorStats>,
}

impl Agent {
    /// Spawns adapters, forwarders and the collector. Returns the agent and
    /// the receiving end of the export channel.
    ///
    /// Fails only if the dump file cannot be created.
    pub fn start(
        config: CollectorConfig,
        lookup: Arc<dyn EndpointLookup>,
        conntrack: Arc<dyn ConntrackSource>,
        metrics: Arc<dyn MetricsRegistry>,
    ) -> Result<(Agent, mpsc::Receiver<ExportRecord>), FlowError> {
        let dump = DumpWriter::new(config.dump.clone())?;
        let capacity = config.queue_capacity;

        let (export_tx, export_rx) = mpsc::channel(config.export_capacity);
        let (inbox_tx, inbox_rx) = mpsc::channel(capacity);
        let (dump_tx, dump_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut adapters = Vec::new();

        let (ingress_tx, ingress_rx) = mpsc::channel(capacity);
        let (ingress_out, ingress_queue) = mpsc::channel(capacity);
        let ingress = DenyPathAdapter::new(Direction::Ingress, lookup.clone());
        adapters.push(tokio::spawn(ingress.run(ingress_rx, ingress_out)));
        adapters.push(spawn_forwarder(ingress_queue, inbox_tx.clone()));

        let (egress_tx, egress_rx) = mpsc::channel(capacity);
        let (egress_out, egress_queue) = mpsc::channel(capacity);
        let egress = DenyPathAdapter::new(Direction::Egress, lookup.clone());
        adapters.push(tokio::spawn(egress.run(egress_rx, egress_out)));
        adapters.push(spawn_forwarder(egress_queue, inbox_tx.clone()));

        let (ct_out, ct_queue) = mpsc::channel(capacity);
        let connections = ConnectionAdapter::new(lookup, conntrack, config.conntrack_interval);
        adapters.push(tokio::spawn(connections.run(ct_out, shutdown_rx)));
        adapters.push(spawn_forwarder(ct_queue, inbox_tx));

        let collector = Collector::new(config, export_tx, metrics, Some(dump));
        let collector = tokio::spawn(collector.run(inbox_rx, dump_rx));

        info!("Flow stats agent started");

        Ok((
            Agent {
                ingress: ingress_tx,
                egress: egress_tx,
                dumps: dump_tx,
                shutdown: shutdown_tx,
                adapters,
                collector,
            },
            export_rx,
        ))
    }

    /// Sender for notifications from the ingress log group.
    pub fn ingress(&self) -> mpsc::Sender<NflogPacket> {
        self.ingress.clone()
    }

    /// Sender for notifications from the egress log group.
    pub fn egress(&self) -> mpsc::Sender<NflogPacket> {
        self.egress.clone()
    }

    /// Asks the collector for a stats dump. A dump already pending absorbs this one.
    pub fn request_dump(&self) {
        if self.dumps.try_send(()).is_err() {
            info!("Stats dump already pending");
        }
    }

    /// Stops the adapters, waits for the collector to flush, and returns its
    /// final statistics.
    ///
    /// Sender clones handed out by [`ingress`](Self::ingress) and
    /// [`egress`](Self::egress) must be dropped first, and the export channel
    /// must keep draining until this returns.
    pub async fn shutdown(self) -> CollectorStats {
        let Agent {
            ingress,
            egress,
            dumps,
            shutdown,
            adapters,
            collector,
        } = self;

        drop(ingress);
        drop(egress);
        drop(dumps);
        let _ = shutdown.send(true);

        for handle in adapters {
            if let Err(e) = handle.await {
                error!("Adapter task failed: {}", e);
            }
        }

        match collector.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Collector task failed: {}", e);
                CollectorStats::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{LookupCache, TierInfo};
    use crate::metrics::PrometheusRegistry;
    use crate::sources::{SnapshotSource, L4};
    use crate::export::EndReason;
    use crate::types::RuleAction;
    use tempfile::tempdir;

    #[test]
    fn test_input_event_parsing() {
        let line = r#"{"event":"nflog_ingress","packet":{"src":"10.0.0.1","dst":"10.0.0.2","proto":6,"l4":{"kind":"ports","src":40000,"dst":80},"packets":1,"bytes":60,"prefix":"true/D/0/pol-a/tier1"}}"#;
        let event: InputEvent = serde_json::from_str(line).unwrap();
        match event {
            InputEvent::NflogIngress { packet } => {
                assert_eq!(packet.l4, L4::Ports { src: 40000, dst: 80 });
                assert_eq!(packet.prefix, "true/D/0/pol-a/tier1");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let line = r#"{"event":"conntrack","entries":[]}"#;
        assert_eq!(
            serde_json::from_str::<InputEvent>(line).unwrap(),
            InputEvent::Conntrack { entries: vec![] }
        );
    }

    #[tokio::test]
    async fn test_start_and_shutdown_exports_denied_flow() {
        let dir = tempdir().unwrap();
        let mut config = CollectorConfig::default();
        config.dump.path = dir.path().join("stats.log");

        let lookup = Arc::new(LookupCache::new());
        lookup.on_update(LookupUpdate::HostEndpointUpdate {
            endpoint: "eth0".to_string(),
            addresses: vec!["10.0.0.2".to_string()],
            tiers: vec![TierInfo {
                name: "tier1".to_string(),
                policies: vec!["pol-a".to_string()],
            }],
        });

        let (agent, mut exports) = Agent::start(
            config,
            lookup,
            Arc::new(SnapshotSource::new()),
            Arc::new(PrometheusRegistry::new()),
        )
        .unwrap();

        let ingress = agent.ingress();
        ingress
            .send(NflogPacket {
                src: "10.0.0.1".parse().unwrap(),
                dst: "10.0.0.2".parse().unwrap(),
                proto: 6,
                l4: L4::Ports { src: 40000, dst: 80 },
                packets: 1,
                bytes: 60,
                prefix: "true/D/0/pol-a/tier1".to_string(),
            })
            .await
            .unwrap();
        drop(ingress);
        agent.request_dump();

        let drain = tokio::spawn(async move {
            let mut records = Vec::new();
            while let Some(record) = exports.recv().await {
                records.push(record);
            }
            records
        });

        let stats = agent.shutdown().await;
        let records = drain.await.unwrap();

        assert_eq!(stats.flows_created, 1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].end_reason, EndReason::ForcedEnd);
        assert_eq!(records[0].path[0].action, RuleAction::Deny);
    }
}
