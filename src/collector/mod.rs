//! # Collector
//!
//! The single task that owns the live `Tuple -> Data` table.
//!
//! ## Wake conditions
//! The run loop waits on five sources and handles whichever is ready first:
//! 1. an update from the fan-in inbox
//! 2. the earliest age deadline
//! 3. the export tick (dirty, export-enabled records as `ActiveTimeout`)
//! 4. the metrics tick (denied-traffic aggregate)
//! 5. a dump request
//!
//! All table mutation happens on this task, so nothing here takes a lock.
//! Export records go to a bounded channel; a full channel blocks the loop.
//!
//! ## Conflicts
//! When an update's trace point conflicts with what the record already holds,
//! the connection is now matching different rules. The old logical flow is
//! exported as `ForcedEnd` (if enabled), its denied-traffic series are
//! removed, and the record restarts with zeroed counters, the new point and a
//! fresh flow id. The update's own counters are then applied to the new flow.
//!
//! ## Finished connections
//! An update flagged `finished` is applied to a live record, which is then
//! exported as `ForcedEnd` (if enabled) and removed. It never creates one.

pub mod aging;
pub mod stats;

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::config::CollectorConfig;
use crate::data::Data;
use crate::dump::DumpWriter;
use crate::export::{EndReason, ExportRecord};
use crate::metrics::{DenyReporter, MetricsRegistry};
use crate::rule_trace::InsertOutcome;
use crate::ticker::JitterTicker;
use crate::types::Tuple;
use crate::update::StatUpdate;

pub use aging::ExpiryQueue;
pub use stats::CollectorStats;

pub struct Collector {
    config: CollectorConfig,
    flows: HashMap<Tuple, Data>,
    expiry: ExpiryQueue,
    export_tx: mpsc::Sender<ExportRecord>,
    reporter: DenyReporter,
    dump: Option<DumpWriter>,
    stats: CollectorStats,
}

impl Collector {
    pub fn new(
        config: CollectorConfig,
        export_tx: mpsc::Sender<ExportRecord>,
        metrics: Arc<dyn MetricsRegistry>,
        dump: Option<DumpWriter>,
    ) -> Self {
        Collector {
            config,
            flows: HashMap::new(),
            expiry: ExpiryQueue::new(),
            export_tx,
            reporter: DenyReporter::new(metrics),
            dump,
            stats: CollectorStats::default(),
        }
    }

    pub fn get(&self, tuple: &Tuple) -> Option<&Data> {
        self.flows.get(tuple)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Earliest pending age deadline.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.expiry.next_deadline()
    }

    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            active_flows: self.flows.len(),
            ..self.stats.clone()
        }
    }

    // ============================================================================================
    // EVENT HANDLERS
    // ============================================================================================

    pub async fn handle_update(&mut self, update: StatUpdate) {
        self.stats.updates += 1;

        let Some(data) = self.flows.get_mut(&update.tuple) else {
            if update.finished {
                debug!("Ignoring finished connection {} with no live record", update.tuple);
                return;
            }
            let data = Data::from_update(&update, self.config.age_timeout);
            self.expiry.schedule(update.tuple, data.deadline());
            self.flows.insert(update.tuple, data);
            self.stats.flows_created += 1;
            return;
        };

        let mut superseded = Vec::new();
        if let Some(point) = update.point {
            if data.add_trace_point(point.clone(), update.direction) == InsertOutcome::Conflict {
                debug!(
                    "Rule conflict on {} ({}): {} replaces existing point",
                    update.tuple, update.direction, point
                );
                self.stats.conflicts += 1;
                if data.is_export_enabled() {
                    superseded = data.to_export_records(EndReason::ForcedEnd);
                }
                self.reporter.expire(data);
                data.reset_counters();
                data.replace_trace_point(point, update.direction);
                data.restart();
            }
        }
        data.apply_counters(update.inbound, update.outbound, update.counter_type);

        self.emit(superseded).await;

        if update.finished {
            self.close(&update.tuple).await;
        }
    }

    /// Reports and removes the record of a finished connection.
    async fn close(&mut self, tuple: &Tuple) {
        let Some(mut data) = self.flows.remove(tuple) else {
            return;
        };
        self.stats.flows_closed += 1;
        self.reporter.expire(&data);
        if data.is_export_enabled() {
            let records = data.to_export_records(EndReason::ForcedEnd);
            self.emit(records).await;
        }
    }

    /// Handles every age deadline due at `now`.
    pub async fn expire_due(&mut self, now: Instant) {
        while let Some((_, tuple)) = self.expiry.pop_due(now) {
            let Some(data) = self.flows.get(&tuple) else {
                continue;
            };

            // Touched since scheduling.
            if data.deadline() > now {
                self.expiry.schedule(tuple, data.deadline());
                continue;
            }

            let Some(mut data) = self.flows.remove(&tuple) else {
                continue;
            };
            self.stats.flows_expired += 1;
            self.reporter.expire(&data);
            if data.is_export_enabled() {
                let records = data.to_export_records(EndReason::IdleTimeout);
                self.emit(records).await;
            }
        }
    }

    /// Exports dirty, export-enabled records as `ActiveTimeout`.
    pub async fn export_tick(&mut self, now: Instant) {
        let delay = self.config.initial_export_delay;
        let mut records = Vec::new();
        for data in self.flows.values_mut() {
            if !data.is_dirty() || !data.is_export_enabled() || data.age(now) < delay {
                continue;
            }
            records.extend(data.to_export_records(EndReason::ActiveTimeout));
        }

        self.emit(records).await;
        debug!("Export tick: {}", self.stats());
    }

    pub fn metrics_tick(&mut self) {
        self.reporter.report(self.flows.values());
    }

    pub fn dump(&mut self) {
        let Some(writer) = self.dump.as_mut() else {
            info!("Stats dump requested but no dump file is configured");
            return;
        };

        match writer.write_snapshot(self.flows.values()) {
            Ok(written) => match writer.stats() {
                Some(stats) => info!(
                    "Stats dump of {} entries written to {:?} ({} dumps, {} bytes since rotation)",
                    written, stats.path, stats.dumps_written, stats.bytes_written
                ),
                None => info!("Stats dump of {} entries written to {:?}", written, writer.path()),
            },
            Err(e) => error!("Stats dump failed: {}", e),
        }
    }

    /// Exports every remaining export-enabled record as `ForcedEnd`.
    pub async fn shutdown(&mut self) -> CollectorStats {
        let mut records = Vec::new();
        for data in self.flows.values_mut() {
            if data.is_export_enabled() {
                records.extend(data.to_export_records(EndReason::ForcedEnd));
            }
        }
        self.emit(records).await;

        if let Some(writer) = self.dump.as_mut() {
            if let Err(e) = writer.flush() {
                error!("Failed to flush stats dump: {}", e);
            }
        }

        let stats = self.stats();
        info!("Collector stopped: {}", stats);
        stats
    }

    async fn emit(&mut self, records: Vec<ExportRecord>) {
        for record in records {
            if self.export_tx.send(record).await.is_err() {
                error!("Export sink closed, dropping record");
                self.stats.records_dropped += 1;
            } else {
                self.stats.records_exported += 1;
            }
        }
    }

    // ============================================================================================
    // RUN LOOP
    // ============================================================================================

    /// Runs until `inbox` closes, then shuts down and returns final statistics.
    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<StatUpdate>,
        mut dump_rx: mpsc::Receiver<()>,
    ) -> CollectorStats {
        let mut export_ticker = JitterTicker::new(self.config.export_interval);
        let mut metrics_ticker = JitterTicker::new(self.config.metrics_interval);
        info!(
            "Collector started: age timeout {}s, export every {}s, metrics every {}s",
            self.config.age_timeout.as_secs(),
            export_ticker.period().as_secs(),
            metrics_ticker.period().as_secs()
        );
        let mut dump_open = true;

        loop {
            let next_expiry = self.expiry.next_deadline();

            tokio::select! {
                update = inbox.recv() => match update {
                    Some(update) => self.handle_update(update).await,
                    None => break,
                },
                _ = sleep_until(next_expiry.unwrap_or_else(Instant::now)), if next_expiry.is_some() => {
                    self.expire_due(Instant::now()).await;
                }
                _ = export_ticker.tick() => {
                    self.export_tick(Instant::now()).await;
                }
                _ = metrics_ticker.tick() => {
                    self.metrics_tick();
                }
                request = dump_rx.recv(), if dump_open => match request {
                    Some(()) => self.dump(),
                    None => dump_open = false,
                },
            }
        }

        self.shutdown().await
    }
}

/// Relays one adapter queue into the collector inbox until either side closes.
pub fn spawn_forwarder(
    mut source: mpsc::Receiver<StatUpdate>,
    inbox: mpsc::Sender<StatUpdate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(update) = source.recv().await {
            if inbox.send(update).await.is_err() {
                break;
            }
        }
    })
}
