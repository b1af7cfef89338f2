//! # Endpoint Lookup
//!
//! Maps addresses to local endpoints and `(tier, policy)` pairs to absolute
//! rule-trace indices for a given endpoint.
//!
//! ## Index numbering
//! Policies are numbered consecutively in tier order, then policy order within
//! a tier. The profile tier has no policies of its own and maps to the slot
//! directly after the last tiered policy:
//!
//! ```text
//! tier1: [a, b]   -> 0, 1
//! tier2: [c]      -> 2
//! profile         -> 3
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use log::{debug, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::rule_trace::PROFILE_TIER;

// ================================================================================================
// KEYS
// ================================================================================================

/// Opaque identifier of a local endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndpointKey {
    Workload {
        orchestrator: String,
        workload: String,
        endpoint: String,
    },
    Host {
        endpoint: String,
    },
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKey::Workload {
                orchestrator,
                workload,
                endpoint,
            } => write!(f, "{}/{}/{}", orchestrator, workload, endpoint),
            EndpointKey::Host { endpoint } => write!(f, "host/{}", endpoint),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyKey {
    pub tier: String,
    pub name: String,
}

impl PolicyKey {
    pub fn new(tier: impl Into<String>, name: impl Into<String>) -> Self {
        PolicyKey {
            tier: tier.into(),
            name: name.into(),
        }
    }
}

// ================================================================================================
// UPDATES
// ================================================================================================

/// Ordered policies applied to an endpoint within one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierInfo {
    pub name: String,
    pub policies: Vec<String>,
}

/// Endpoint state pushed by the policy layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LookupUpdate {
    EndpointUpdate {
        orchestrator: String,
        workload: String,
        endpoint: String,
        /// Plain addresses or CIDR strings (`10.0.0.1/32`).
        addresses: Vec<String>,
        tiers: Vec<TierInfo>,
    },
    EndpointRemove {
        orchestrator: String,
        workload: String,
        endpoint: String,
    },
    HostEndpointUpdate {
        endpoint: String,
        addresses: Vec<String>,
        tiers: Vec<TierInfo>,
    },
    HostEndpointRemove {
        endpoint: String,
    },
}

// ================================================================================================
// LOOKUP
// ================================================================================================

pub trait EndpointLookup: Send + Sync {
    /// Local endpoint owning `addr`, if any.
    fn resolve(&self, addr: IpAddr) -> Option<EndpointKey>;

    /// Absolute rule index of `policy` on `endpoint`.
    fn resolve_rule_index(&self, endpoint: &EndpointKey, policy: &PolicyKey) -> Option<usize>;
}

#[derive(Default)]
struct CacheState {
    by_addr: HashMap<IpAddr, EndpointKey>,
    /// Reverse of `by_addr`, so removals do not scan every address.
    addrs_by_endpoint: HashMap<EndpointKey, Vec<IpAddr>>,
    tiers: HashMap<EndpointKey, Vec<TierInfo>>,
}

/// Thread-safe [`EndpointLookup`] fed by [`LookupUpdate`] messages.
#[derive(Default)]
pub struct LookupCache {
    state: RwLock<CacheState>,
}

impl LookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_update(&self, update: LookupUpdate) {
        match update {
            LookupUpdate::EndpointUpdate {
                orchestrator,
                workload,
                endpoint,
                addresses,
                tiers,
            } => {
                let key = EndpointKey::Workload {
                    orchestrator,
                    workload,
                    endpoint,
                };
                self.upsert(key, &addresses, tiers);
            }
            LookupUpdate::EndpointRemove {
                orchestrator,
                workload,
                endpoint,
            } => {
                self.remove(&EndpointKey::Workload {
                    orchestrator,
                    workload,
                    endpoint,
                });
            }
            LookupUpdate::HostEndpointUpdate {
                endpoint,
                addresses,
                tiers,
            } => {
                self.upsert(EndpointKey::Host { endpoint }, &addresses, tiers);
            }
            LookupUpdate::HostEndpointRemove { endpoint } => {
                self.remove(&EndpointKey::Host { endpoint });
            }
        }
    }

    /// Number of known endpoints.
    pub fn len(&self) -> usize {
        self.state.read().tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn upsert(&self, key: EndpointKey, addresses: &[String], tiers: Vec<TierInfo>) {
        let parsed: Vec<IpAddr> = addresses
            .iter()
            .filter_map(|raw| match parse_addr(raw) {
                Some(addr) => Some(addr),
                None => {
                    warn!("Skipping unparsable address {:?} for endpoint {}", raw, key);
                    None
                }
            })
            .collect();

        let mut state = self.state.write();
        if let Some(old) = state.addrs_by_endpoint.remove(&key) {
            for addr in old {
                if state.by_addr.get(&addr) == Some(&key) {
                    state.by_addr.remove(&addr);
                }
            }
        }
        for addr in &parsed {
            state.by_addr.insert(*addr, key.clone());
        }
        debug!("Endpoint {} updated: {} addresses, {} tiers", key, parsed.len(), tiers.len());
        state.addrs_by_endpoint.insert(key.clone(), parsed);
        state.tiers.insert(key, tiers);
    }

    fn remove(&self, key: &EndpointKey) {
        let mut state = self.state.write();
        if let Some(addrs) = state.addrs_by_endpoint.remove(key) {
            for addr in addrs {
                if state.by_addr.get(&addr) == Some(key) {
                    state.by_addr.remove(&addr);
                }
            }
        }
        state.tiers.remove(key);
        debug!("Endpoint {} removed", key);
    }
}

impl EndpointLookup for LookupCache {
    fn resolve(&self, addr: IpAddr) -> Option<EndpointKey> {
        self.state.read().by_addr.get(&addr).cloned()
    }

    fn resolve_rule_index(&self, endpoint: &EndpointKey, policy: &PolicyKey) -> Option<usize> {
        let state = self.state.read();
        let tiers = state.tiers.get(endpoint)?;

        let mut index = 0;
        for tier in tiers {
            if policy.tier != PROFILE_TIER && tier.name == policy.tier {
                return tier
                    .policies
                    .iter()
                    .position(|name| *name == policy.name)
                    .map(|pos| index + pos);
            }
            index += tier.policies.len();
        }

        // Profiles sit after every tiered policy.
        (policy.tier == PROFILE_TIER).then_some(index)
    }
}

/// Accepts `10.0.0.1` as well as `10.0.0.1/32`.
fn parse_addr(raw: &str) -> Option<IpAddr> {
    let host = raw.split('/').next().unwrap_or(raw);
    host.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiers() -> Vec<TierInfo> {
        vec![
            TierInfo {
                name: "tier1".to_string(),
                policies: vec!["pol-a".to_string(), "pol-b".to_string()],
            },
            TierInfo {
                name: "tier2".to_string(),
                policies: vec!["pol-c".to_string()],
            },
        ]
    }

    fn workload_update(addresses: &[&str]) -> LookupUpdate {
        LookupUpdate::EndpointUpdate {
            orchestrator: "k8s".to_string(),
            workload: "default/web".to_string(),
            endpoint: "eth0".to_string(),
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            tiers: tiers(),
        }
    }

    fn workload_key() -> EndpointKey {
        EndpointKey::Workload {
            orchestrator: "k8s".to_string(),
            workload: "default/web".to_string(),
            endpoint: "eth0".to_string(),
        }
    }

    #[test]
    fn test_resolve_plain_and_cidr_addresses() {
        let cache = LookupCache::new();
        cache.on_update(workload_update(&["10.0.0.1", "fd00::1/128", "garbage"]));

        assert_eq!(cache.resolve("10.0.0.1".parse().unwrap()), Some(workload_key()));
        assert_eq!(cache.resolve("fd00::1".parse().unwrap()), Some(workload_key()));
        assert_eq!(cache.resolve("10.0.0.2".parse().unwrap()), None);
    }

    #[test]
    fn test_rule_index_numbering() {
        let cache = LookupCache::new();
        cache.on_update(workload_update(&["10.0.0.1"]));
        let key = workload_key();

        assert_eq!(cache.resolve_rule_index(&key, &PolicyKey::new("tier1", "pol-a")), Some(0));
        assert_eq!(cache.resolve_rule_index(&key, &PolicyKey::new("tier1", "pol-b")), Some(1));
        assert_eq!(cache.resolve_rule_index(&key, &PolicyKey::new("tier2", "pol-c")), Some(2));
        assert_eq!(cache.resolve_rule_index(&key, &PolicyKey::new("profile", "kns.default")), Some(3));
        assert_eq!(cache.resolve_rule_index(&key, &PolicyKey::new("tier2", "pol-a")), None);
        assert_eq!(cache.resolve_rule_index(&key, &PolicyKey::new("tier9", "pol-a")), None);
    }

    #[test]
    fn test_update_replaces_addresses() {
        let cache = LookupCache::new();
        cache.on_update(workload_update(&["10.0.0.1"]));
        cache.on_update(workload_update(&["10.0.0.9"]));

        assert_eq!(cache.resolve("10.0.0.1".parse().unwrap()), None);
        assert_eq!(cache.resolve("10.0.0.9".parse().unwrap()), Some(workload_key()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_drops_addresses_and_tiers() {
        let cache = LookupCache::new();
        cache.on_update(workload_update(&["10.0.0.1"]));
        cache.on_update(LookupUpdate::HostEndpointUpdate {
            endpoint: "eth1".to_string(),
            addresses: vec!["192.168.1.1".to_string()],
            tiers: vec![],
        });

        cache.on_update(LookupUpdate::EndpointRemove {
            orchestrator: "k8s".to_string(),
            workload: "default/web".to_string(),
            endpoint: "eth0".to_string(),
        });

        assert_eq!(cache.resolve("10.0.0.1".parse().unwrap()), None);
        assert_eq!(
            cache.resolve_rule_index(&workload_key(), &PolicyKey::new("tier1", "pol-a")),
            None
        );
        assert_eq!(
            cache.resolve("192.168.1.1".parse().unwrap()),
            Some(EndpointKey::Host {
                endpoint: "eth1".to_string()
            })
        );

        cache.on_update(LookupUpdate::HostEndpointRemove {
            endpoint: "eth1".to_string(),
        });
        assert!(cache.is_empty());
    }

    #[test]
    fn test_update_deserializes_from_json() {
        let json = r#"{"type":"host_endpoint_update","endpoint":"eth0","addresses":["10.1.1.1"],"tiers":[{"name":"tier1","policies":["p"]}]}"#;
        let update: LookupUpdate = serde_json::from_str(json).unwrap();
        assert!(matches!(update, LookupUpdate::HostEndpointUpdate { .. }));
    }
}
