//! # Deny-Path Adapter
//!
//! Translates per-packet rule-hit notifications into [`StatUpdate`]s.
//!
//! One adapter runs per direction. The ingress adapter attributes a packet to
//! the endpoint owning its destination address, the egress adapter to the one
//! owning its source address. Only denied packets carry counters; allowed
//! packets are accounted by the connection adapter instead.

use std::net::IpAddr;
use std::sync::Arc;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::FlowError;
use crate::lookup::{EndpointLookup, PolicyKey};
use crate::rule_trace::RuleTracePoint;
use crate::sources::prefix::RulePrefix;
use crate::sources::L4;
use crate::types::{CounterType, Counters, Direction, RuleAction, Tuple};
use crate::update::StatUpdate;

/// A rule-hit notification as delivered by the kernel log group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NflogPacket {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub proto: u8,
    pub l4: L4,
    /// Packets aggregated into this notification.
    pub packets: u64,
    pub bytes: u64,
    /// Rule prefix, `<export>/<action>/<rule>/<policy>[/<tier>]`.
    pub prefix: String,
}

impl NflogPacket {
    pub fn tuple(&self) -> Tuple {
        match self.l4 {
            L4::Ports { src, dst } => Tuple::new(self.src, self.dst, self.proto, src, dst),
            L4::Icmp { id, icmp_type, code } => Tuple::icmp(self.src, self.dst, id, icmp_type, code),
        }
    }
}

pub struct DenyPathAdapter {
    direction: Direction,
    lookup: Arc<dyn EndpointLookup>,
}

impl DenyPathAdapter {
    pub fn new(direction: Direction, lookup: Arc<dyn EndpointLookup>) -> Self {
        DenyPathAdapter { direction, lookup }
    }

    pub fn convert(&self, packet: &NflogPacket) -> Result<StatUpdate, FlowError> {
        let prefix = RulePrefix::parse(&packet.prefix)?;

        let local = match self.direction {
            Direction::Ingress => packet.dst,
            Direction::Egress => packet.src,
        };
        let endpoint = self
            .lookup
            .resolve(local)
            .ok_or_else(|| FlowError::UnknownEndpoint(local.to_string()))?;

        let policy = PolicyKey::new(prefix.tier.clone(), prefix.policy.clone());
        let index = self
            .lookup
            .resolve_rule_index(&endpoint, &policy)
            .ok_or_else(|| FlowError::UnknownPolicy {
                endpoint: endpoint.to_string(),
                tier: prefix.tier.clone(),
                policy: prefix.policy.clone(),
            })?;

        let hit = Counters::new(packet.packets, packet.bytes);
        let (inbound, outbound) = match (prefix.action, self.direction) {
            (RuleAction::Deny, Direction::Ingress) => (hit, Counters::default()),
            (RuleAction::Deny, Direction::Egress) => (Counters::default(), hit),
            _ => (Counters::default(), Counters::default()),
        };

        let point = RuleTracePoint {
            tier: prefix.tier,
            policy: prefix.policy,
            rule: prefix.rule,
            action: prefix.action,
            export: prefix.export,
            index,
        };

        Ok(StatUpdate::new(
            packet.tuple(),
            endpoint,
            inbound,
            outbound,
            CounterType::Delta,
            self.direction,
            Some(point),
        ))
    }

    /// Converts notifications until either side of the pipe closes.
    pub async fn run(self, mut raw: mpsc::Receiver<NflogPacket>, out: mpsc::Sender<StatUpdate>) {
        info!("Deny-path adapter ({}) started", self.direction);

        while let Some(packet) = raw.recv().await {
            let update = match self.convert(&packet) {
                Ok(update) => update,
                Err(e @ FlowError::MalformedPrefix { .. }) => {
                    error!("Dropping {} notification: {}", self.direction, e);
                    continue;
                }
                Err(e) => {
                    warn!("Dropping {} notification: {}", self.direction, e);
                    continue;
                }
            };

            if out.send(update).await.is_err() {
                break;
            }
        }

        info!("Deny-path adapter ({}) stopped", self.direction);
    }
}
