//! # Flow Stats Library
//!
//! Flow statistics collection and accounting for a host network-policy
//! dataplane: rule-hit and connection-tracking events in, aged and
//! exportable per-connection records out.

// Core modules
pub mod agent;
pub mod collector;
pub mod config;
pub mod data;
pub mod dump;
pub mod error;
pub mod export;
pub mod lookup;
pub mod metrics;
pub mod rule_trace;
pub mod sources;
pub mod ticker;
pub mod types;
pub mod update;

// Re-export commonly used types
pub use agent::{Agent, InputEvent};
pub use collector::{Collector, CollectorStats};
pub use config::{CollectorConfig, DumpConfig, RotationPolicy};
pub use data::Data;
pub use error::FlowError;
pub use export::{EndReason, ExportRecord, ForwardingStatus};
pub use lookup::{EndpointKey, EndpointLookup, LookupCache, LookupUpdate, PolicyKey, TierInfo};
pub use rule_trace::{InsertOutcome, RuleTrace, RuleTracePoint};
pub use types::{CounterType, Counters, Direction, RuleAction, Tuple};
pub use update::StatUpdate;
