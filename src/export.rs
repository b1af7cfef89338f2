//! # Export Records
//!
//! The logical record handed to the downstream flow exporter. The wire
//! encoding is the exporter's concern; the agent binary emits these as JSON.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rule_trace::RuleTracePoint;
use crate::types::{Direction, RuleAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardingStatus {
    Forwarded,
    Dropped,
    Unknown,
}

impl From<Option<RuleAction>> for ForwardingStatus {
    fn from(action: Option<RuleAction>) -> Self {
        match action {
            Some(RuleAction::Allow) => ForwardingStatus::Forwarded,
            Some(RuleAction::Deny) => ForwardingStatus::Dropped,
            Some(RuleAction::NextTier) | None => ForwardingStatus::Unknown,
        }
    }
}

/// Why a record was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Periodic export of a still-active flow.
    ActiveTimeout,
    /// The flow aged out.
    IdleTimeout,
    /// The flow was superseded by a rule conflict or the collector shut down.
    ForcedEnd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedTracePoint {
    pub tier: String,
    pub policy: String,
    pub rule: String,
    pub action: RuleAction,
    pub index: usize,
}

impl From<&RuleTracePoint> for ExportedTracePoint {
    fn from(point: &RuleTracePoint) -> Self {
        ExportedTracePoint {
            tier: point.tier.clone(),
            policy: point.policy.clone(),
            rule: point.rule.clone(),
            action: point.action,
            index: point.index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub flow_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub in_packets: u64,
    pub in_bytes: u64,
    pub out_packets: u64,
    pub out_bytes: u64,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub forwarding_status: ForwardingStatus,
    pub end_reason: EndReason,
    pub direction: Direction,
    pub path: Vec<ExportedTracePoint>,
}
