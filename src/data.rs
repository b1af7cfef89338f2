//! # Flow Record
//!
//! Per-connection accounting unit owned by the collector. A record carries
//! one [`RuleTrace`] per direction, inbound and outbound counters, and the
//! bookkeeping the collector needs for aging and periodic export.
//!
//! A record names one *logical* flow through `flow_id`. When a rule trace
//! conflict shows the connection is now matching different rules, the
//! collector starts a new logical flow on the same tuple via
//! [`Data::restart`].

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::export::{EndReason, ExportRecord, ForwardingStatus};
use crate::lookup::EndpointKey;
use crate::rule_trace::{InsertOutcome, RuleTrace, RuleTracePoint};
use crate::types::{CounterType, Counters, Direction, Tuple};
use crate::update::StatUpdate;

#[derive(Debug, Clone)]
pub struct Data {
    tuple: Tuple,
    endpoint: EndpointKey,
    flow_id: Uuid,
    ingress: RuleTrace,
    egress: RuleTrace,
    inbound: Counters,
    outbound: Counters,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    /// Monotonic creation time of the current logical flow.
    started: Instant,
    age_timeout: Duration,
    deadline: Instant,
    dirty: bool,
}

impl Data {
    pub fn new(tuple: Tuple, endpoint: EndpointKey, age_timeout: Duration) -> Self {
        let now = Utc::now();
        let started = Instant::now();
        Data {
            tuple,
            endpoint,
            flow_id: Uuid::new_v4(),
            ingress: RuleTrace::new(),
            egress: RuleTrace::new(),
            inbound: Counters::default(),
            outbound: Counters::default(),
            created_at: now,
            updated_at: now,
            started,
            age_timeout,
            deadline: started + age_timeout,
            dirty: true,
        }
    }

    /// Builds the record for the first update seen on a tuple.
    pub fn from_update(update: &StatUpdate, age_timeout: Duration) -> Self {
        let mut data = Data::new(update.tuple, update.endpoint.clone(), age_timeout);
        if let Some(point) = &update.point {
            let _ = data.add_trace_point(point.clone(), update.direction);
        }
        data.apply_counters(update.inbound, update.outbound, update.counter_type);
        data
    }

    pub fn tuple(&self) -> &Tuple {
        &self.tuple
    }

    pub fn endpoint(&self) -> &EndpointKey {
        &self.endpoint
    }

    pub fn flow_id(&self) -> Uuid {
        self.flow_id
    }

    pub fn trace(&self, direction: Direction) -> &RuleTrace {
        match direction {
            Direction::Ingress => &self.ingress,
            Direction::Egress => &self.egress,
        }
    }

    pub fn inbound(&self) -> Counters {
        self.inbound
    }

    pub fn outbound(&self) -> Counters {
        self.outbound
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Time since the current logical flow started.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// Pushes the age deadline out by a full timeout and stamps the update time.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.deadline = Instant::now() + self.age_timeout;
    }

    /// `Absolute` overwrites, `Delta` adds. Every update touches the record;
    /// only an actual change marks it dirty.
    pub fn apply_counters(&mut self, inbound: Counters, outbound: Counters, counter_type: CounterType) {
        let in_changed = self.inbound.apply(inbound, counter_type);
        let out_changed = self.outbound.apply(outbound, counter_type);
        if in_changed || out_changed {
            self.dirty = true;
        }
        self.touch();
    }

    pub fn add_trace_point(&mut self, point: RuleTracePoint, direction: Direction) -> InsertOutcome {
        let outcome = self.trace_mut(direction).insert(point);
        if outcome == InsertOutcome::Inserted {
            self.dirty = true;
            self.touch();
        }
        outcome
    }

    pub fn replace_trace_point(&mut self, point: RuleTracePoint, direction: Direction) {
        self.trace_mut(direction).replace(point);
        self.dirty = true;
        self.touch();
    }

    pub fn reset_counters(&mut self) {
        self.inbound = Counters::default();
        self.outbound = Counters::default();
    }

    /// Starts a new logical flow on the same tuple: fresh id and start time.
    pub fn restart(&mut self) {
        self.flow_id = Uuid::new_v4();
        self.created_at = Utc::now();
        self.started = Instant::now();
    }

    pub fn is_export_enabled(&self) -> bool {
        self.ingress.export() || self.egress.export()
    }

    /// One record per direction with a non-empty trace. Clears the dirty flag.
    pub fn to_export_records(&mut self, reason: EndReason) -> Vec<ExportRecord> {
        self.dirty = false;

        [Direction::Ingress, Direction::Egress]
            .into_iter()
            .filter(|direction| !self.trace(*direction).is_empty())
            .map(|direction| self.export_record(direction, reason))
            .collect()
    }

    fn export_record(&self, direction: Direction, reason: EndReason) -> ExportRecord {
        let trace = self.trace(direction);
        ExportRecord {
            flow_id: self.flow_id,
            start: self.created_at,
            end: self.updated_at,
            in_packets: self.inbound.packets,
            in_bytes: self.inbound.bytes,
            out_packets: self.outbound.packets,
            out_bytes: self.outbound.bytes,
            src: self.tuple.src(),
            dst: self.tuple.dst(),
            src_port: self.tuple.l4_src(),
            dst_port: self.tuple.l4_dst(),
            proto: self.tuple.proto(),
            forwarding_status: ForwardingStatus::from(trace.action()),
            end_reason: reason,
            direction,
            path: trace.path().map(Into::into).collect(),
        }
    }

    fn trace_mut(&mut self, direction: Direction) -> &mut RuleTrace {
        match direction {
            Direction::Ingress => &mut self.ingress,
            Direction::Egress => &mut self.egress,
        }
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flow={} {} endpoint={} in={} out={} ingress={{{}}} egress={{{}}} created={} updated={} dirty={}",
            self.flow_id,
            self.tuple,
            self.endpoint,
            self.inbound,
            self.outbound,
            self.ingress,
            self.egress,
            self.created_at.to_rfc3339(),
            self.updated_at.to_rfc3339(),
            self.dirty
        )
    }
}
