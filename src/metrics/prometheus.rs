//! `prometheus-client` backend for the denied-traffic aggregate.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use parking_lot::RwLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use super::MetricsRegistry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DenyLabels {
    /// Rule string, `<tier>/<policy>/<rule>/<action>`.
    pub policy: String,
    pub src_ip: String,
}

impl DenyLabels {
    fn new(rule: &str, src: IpAddr) -> Self {
        DenyLabels {
            policy: rule.to_string(),
            src_ip: src.to_string(),
        }
    }
}

pub struct PrometheusRegistry {
    registry: Registry,
    packets: Family<DenyLabels, Gauge>,
    bytes: Family<DenyLabels, Gauge>,
    /// Last published `(packets, bytes)` per series.
    current: RwLock<HashMap<DenyLabels, (u64, u64)>>,
}

impl Default for PrometheusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let packets = Family::<DenyLabels, Gauge>::default();
        let bytes = Family::<DenyLabels, Gauge>::default();

        registry.register(
            "flow_denied_packets",
            "Packets denied per rule and source address",
            packets.clone(),
        );
        registry.register(
            "flow_denied_bytes",
            "Bytes denied per rule and source address",
            bytes.clone(),
        );

        PrometheusRegistry {
            registry,
            packets,
            bytes,
            current: RwLock::new(HashMap::new()),
        }
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<String, fmt::Error> {
        let mut out = String::new();
        encode(&mut out, &self.registry)?;
        Ok(out)
    }

    /// Current `(packets, bytes)` for a series, if it exists.
    pub fn get(&self, rule: &str, src: IpAddr) -> Option<(u64, u64)> {
        self.current.read().get(&DenyLabels::new(rule, src)).copied()
    }
}

impl MetricsRegistry for PrometheusRegistry {
    fn set(&self, rule: &str, src: IpAddr, packets: u64, bytes: u64) {
        let labels = DenyLabels::new(rule, src);
        self.packets
            .get_or_create(&labels)
            .set(i64::try_from(packets).unwrap_or(i64::MAX));
        self.bytes
            .get_or_create(&labels)
            .set(i64::try_from(bytes).unwrap_or(i64::MAX));
        self.current.write().insert(labels, (packets, bytes));
    }

    fn delete(&self, rule: &str, src: IpAddr) {
        let labels = DenyLabels::new(rule, src);
        self.packets.remove(&labels);
        self.bytes.remove(&labels);
        self.current.write().remove(&labels);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let registry = PrometheusRegistry::new();
        let src: IpAddr = "10.0.0.1".parse().unwrap();

        registry.set("tier1/pol-a/0/deny", src, 3, 180);
        assert_eq!(registry.get("tier1/pol-a/0/deny", src), Some((3, 180)));

        registry.set("tier1/pol-a/0/deny", src, 4, 240);
        assert_eq!(registry.get("tier1/pol-a/0/deny", src), Some((4, 240)));

        registry.delete("tier1/pol-a/0/deny", src);
        assert_eq!(registry.get("tier1/pol-a/0/deny", src), None);
        assert!(!registry.render().unwrap().contains("pol-a"));

        registry.delete("tier1/never/0/deny", src);
    }

    #[test]
    fn test_render_contains_series() {
        let registry = PrometheusRegistry::new();
        registry.set("tier1/pol-a/0/deny", "10.0.0.1".parse().unwrap(), 2, 120);

        let text = registry.render().unwrap();
        assert!(text.contains("flow_denied_packets"));
        assert!(text.contains("policy=\"tier1/pol-a/0/deny\""));
        assert!(text.contains("src_ip=\"10.0.0.1\""));
    }
}
