//! Denied-traffic metrics
//!
//! The collector publishes a per-rule, per-source-address aggregate of denied
//! traffic through the [`MetricsRegistry`] seam. [`DenyReporter`] owns the
//! aggregation and deletion logic; [`PrometheusRegistry`] is the production
//! backend.

pub mod prometheus;
pub mod reporter;

use std::net::IpAddr;

pub use self::prometheus::PrometheusRegistry;
pub use reporter::DenyReporter;

/// Sink for the denied-traffic aggregate.
///
/// Methods take `&self`; implementations use interior mutability so one
/// handle can be shared between the collector and whoever renders it.
pub trait MetricsRegistry: Send + Sync {
    /// Publishes the current totals for `(rule, src)`.
    fn set(&self, rule: &str, src: IpAddr, packets: u64, bytes: u64);

    /// Drops the series for `(rule, src)`. Unknown keys are ignored.
    fn delete(&self, rule: &str, src: IpAddr);
}
