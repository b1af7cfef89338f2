//! Data source adapters
//!
//! Each adapter turns one kind of raw kernel notification into
//! [`StatUpdate`](crate::update::StatUpdate)s on its own bounded queue:
//! - `nflog`: per-packet rule hits on the deny path
//! - `conntrack`: periodic snapshots of tracked connections

pub mod conntrack;
pub mod nflog;
pub mod prefix;

use serde::{Deserialize, Serialize};

pub use conntrack::{ConnectionAdapter, ConntrackSource, CtEntry, CtTuple, SnapshotSource, TcpState};
pub use nflog::{DenyPathAdapter, NflogPacket};
pub use prefix::RulePrefix;

/// Layer-4 selectors of a packet or tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum L4 {
    Ports { src: u16, dst: u16 },
    Icmp { id: u16, icmp_type: u8, code: u8 },
}
