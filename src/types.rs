//! # Flow Types Module
//!
//! Core value types shared by the adapters, the collector and the exporter:
//! - Connection tuple (the live-map key)
//! - Traffic direction and counter semantics
//! - Rule actions as reported by the dataplane

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Protocol number for ICMP; its L4 selectors are id and type/code rather than ports.
pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

// ================================================================================================
// CONNECTION TUPLE
// ================================================================================================

/// A 5-tuple identifying one connection.
///
/// For ICMP the source selector holds the ICMP id and the destination selector
/// holds `type << 8 | code`, see [`Tuple::icmp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tuple {
    src: IpAddr,
    dst: IpAddr,
    proto: u8,
    l4_src: u16,
    l4_dst: u16,
}

impl Tuple {
    pub fn new(src: IpAddr, dst: IpAddr, proto: u8, l4_src: u16, l4_dst: u16) -> Self {
        Tuple {
            src,
            dst,
            proto,
            l4_src,
            l4_dst,
        }
    }

    /// Builds an ICMP tuple, folding type and code into the destination selector.
    pub fn icmp(src: IpAddr, dst: IpAddr, id: u16, icmp_type: u8, code: u8) -> Self {
        let l4_dst = (u16::from(icmp_type) << 8) | u16::from(code);
        Tuple::new(src, dst, PROTO_ICMP, id, l4_dst)
    }

    pub fn src(&self) -> IpAddr {
        self.src
    }

    pub fn dst(&self) -> IpAddr {
        self.dst
    }

    pub fn proto(&self) -> u8 {
        self.proto
    }

    pub fn l4_src(&self) -> u16 {
        self.l4_src
    }

    pub fn l4_dst(&self) -> u16 {
        self.l4_dst
    }

    /// Swaps addresses and L4 selectors. This is a mirror, not the conntrack reply tuple.
    pub fn reverse(&self) -> Tuple {
        Tuple::new(self.dst, self.src, self.proto, self.l4_dst, self.l4_src)
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "src={} dst={} proto={} sport={} dport={}",
            self.src, self.dst, self.proto, self.l4_src, self.l4_dst
        )
    }
}

// ================================================================================================
// DIRECTION & COUNTERS
// ================================================================================================

/// Traffic direction relative to the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Ingress,
    Egress,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Ingress => write!(f, "ingress"),
            Direction::Egress => write!(f, "egress"),
        }
    }
}

/// How the counters of a [`StatUpdate`](crate::update::StatUpdate) are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterType {
    /// Cumulative totals (conntrack). Overwrite the stored counters.
    Absolute,
    /// Increments (per-packet notifications). Add to the stored counters.
    Delta,
}

/// Packet and byte counters for one direction of a flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub packets: u64,
    pub bytes: u64,
}

impl Counters {
    pub fn new(packets: u64, bytes: u64) -> Self {
        Counters { packets, bytes }
    }

    pub fn is_zero(&self) -> bool {
        self.packets == 0 && self.bytes == 0
    }

    /// Applies `other` according to `counter_type`. Returns true if the value changed.
    pub fn apply(&mut self, other: Counters, counter_type: CounterType) -> bool {
        let before = *self;
        match counter_type {
            CounterType::Absolute => *self = other,
            CounterType::Delta => {
                self.packets = self.packets.saturating_add(other.packets);
                self.bytes = self.bytes.saturating_add(other.bytes);
            }
        }
        before != *self
    }
}

impl fmt::Display for Counters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{packets={} bytes={}}}", self.packets, self.bytes)
    }
}

// ================================================================================================
// RULE ACTIONS
// ================================================================================================

/// Action of a single matched rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Deny,
    /// Pass evaluation on to the next tier. Never a verdict by itself.
    NextTier,
}

impl RuleAction {
    /// True for actions that decide the fate of the packet.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RuleAction::NextTier)
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::Allow => write!(f, "allow"),
            RuleAction::Deny => write!(f, "deny"),
            RuleAction::NextTier => write!(f, "pass"),
        }
    }
}
