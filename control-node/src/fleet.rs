//! Backend fleet model: static descriptors and the authoritative runtime
//! state mutated by the scaling controller.
//!
//! Tier rank orders every selection: ascending for power-on, descending for
//! power-off. Within a tier (which does not occur in the reference
//! deployment) ascending name breaks the tie.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Static capacity of a backend server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCapacity {
    /// CPU core count
    pub cores: u32,
    /// Memory in gigabytes
    pub memory_gb: u32,
}

/// Static description of one physical backend, configured once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Stable name known to the virtualization host
    pub name: String,
    /// Private address, also the key used by the metrics store
    pub address: String,
    /// Tier rank; 1 is the smallest server
    pub tier: u32,
    /// Capacity used for replacement selection
    pub capacity: ServerCapacity,
}

/// Mutable per-server runtime status, mirrored to the front node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub name: String,
    pub ip: String,
    pub active: bool,
    pub draining: bool,
    pub healthy: bool,
}

/// Authoritative fleet state owned by the scaling controller.
///
/// Invariants: `draining` implies `active`; the controller never voluntarily
/// shrinks the serving set (active and not draining) below one server.
#[derive(Debug, Clone)]
pub struct FleetState {
    /// Descriptors sorted by (tier, name)
    descriptors: Vec<ServerDescriptor>,
    /// Status keyed by address
    status: BTreeMap<String, ServerStatus>,
    /// Addresses refused for selection until a successful reprobe
    blacklist: HashSet<String>,
}

impl FleetState {
    pub fn new(mut descriptors: Vec<ServerDescriptor>) -> Self {
        descriptors.sort_by(|a, b| a.tier.cmp(&b.tier).then_with(|| a.name.cmp(&b.name)));

        let status = descriptors
            .iter()
            .map(|d| {
                (
                    d.address.clone(),
                    ServerStatus {
                        name: d.name.clone(),
                        ip: d.address.clone(),
                        active: false,
                        draining: false,
                        healthy: true,
                    },
                )
            })
            .collect();

        Self {
            descriptors,
            status,
            blacklist: HashSet::new(),
        }
    }

    pub fn descriptors(&self) -> &[ServerDescriptor] {
        &self.descriptors
    }

    pub fn descriptor_by_address(&self, address: &str) -> Option<&ServerDescriptor> {
        self.descriptors.iter().find(|d| d.address == address)
    }

    pub fn descriptor_by_name(&self, name: &str) -> Option<&ServerDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    pub fn status_of(&self, address: &str) -> Option<&ServerStatus> {
        self.status.get(address)
    }

    /// Servers believed to be powered on
    pub fn active_addresses(&self) -> Vec<String> {
        self.status
            .values()
            .filter(|s| s.active)
            .map(|s| s.ip.clone())
            .collect()
    }

    /// Active and not draining: the set eligible for new flows
    pub fn serving_addresses(&self) -> Vec<String> {
        self.status
            .values()
            .filter(|s| s.active && !s.draining)
            .map(|s| s.ip.clone())
            .collect()
    }

    pub fn serving_count(&self) -> usize {
        self.status
            .values()
            .filter(|s| s.active && !s.draining)
            .count()
    }

    /// Align the active set with the set of servers reporting metrics.
    /// Draining flags survive only for servers that are still active.
    pub fn reconcile(&mut self, reporting: &HashSet<String>) {
        for status in self.status.values_mut() {
            status.active = reporting.contains(&status.ip);
            if !status.active {
                status.draining = false;
            }
        }
    }

    pub fn set_active(&mut self, address: &str, active: bool) {
        if let Some(status) = self.status.get_mut(address) {
            status.active = active;
            if !active {
                status.draining = false;
            }
        }
    }

    pub fn set_draining(&mut self, address: &str, draining: bool) {
        if let Some(status) = self.status.get_mut(address) {
            status.draining = draining && status.active;
        }
    }

    pub fn set_healthy(&mut self, address: &str, healthy: bool) {
        if let Some(status) = self.status.get_mut(address) {
            status.healthy = healthy;
        }
    }

    pub fn blacklist_add(&mut self, address: &str) {
        self.blacklist.insert(address.to_string());
        self.set_healthy(address, false);
    }

    pub fn blacklist_remove(&mut self, address: &str) {
        self.blacklist.remove(address);
        self.set_healthy(address, true);
    }

    pub fn is_blacklisted(&self, address: &str) -> bool {
        self.blacklist.contains(address)
    }

    pub fn blacklist(&self) -> &HashSet<String> {
        &self.blacklist
    }

    /// Next candidate for power-on: ascending tier, inactive, not blacklisted
    pub fn next_to_power_on(&self) -> Option<&ServerDescriptor> {
        self.descriptors.iter().find(|d| {
            let inactive = self
                .status
                .get(&d.address)
                .map(|s| !s.active)
                .unwrap_or(false);
            inactive && !self.blacklist.contains(&d.address)
        })
    }

    /// Next candidate for power-off: descending tier among serving servers,
    /// never the last one.
    pub fn next_to_power_off(&self) -> Option<&ServerDescriptor> {
        if self.serving_count() <= 1 {
            return None;
        }
        self.descriptors.iter().rev().find(|d| {
            self.status
                .get(&d.address)
                .map(|s| s.active && !s.draining)
                .unwrap_or(false)
        })
    }

    /// Replacement for a failed server: prefer an exact capacity match,
    /// otherwise the smallest inactive server meeting or exceeding the failed
    /// capacity. Blacklisted servers are never considered.
    pub fn find_replacement(&self, failed: &ServerDescriptor) -> Option<&ServerDescriptor> {
        let mut candidates: Vec<&ServerDescriptor> = self
            .descriptors
            .iter()
            .filter(|d| {
                let inactive = self
                    .status
                    .get(&d.address)
                    .map(|s| !s.active)
                    .unwrap_or(false);
                inactive && !self.blacklist.contains(&d.address)
            })
            .collect();
        candidates.sort_by_key(|d| (d.capacity.cores, d.capacity.memory_gb));

        if let Some(exact) = candidates.iter().find(|d| d.capacity == failed.capacity) {
            return Some(*exact);
        }
        candidates
            .into_iter()
            .find(|d| {
                d.capacity.cores >= failed.capacity.cores
                    && d.capacity.memory_gb >= failed.capacity.memory_gb
            })
    }

    /// Snapshot for publication, keyed by address
    pub fn snapshot(&self) -> BTreeMap<String, ServerStatus> {
        self.status.clone()
    }

    /// Restore flags from a persisted snapshot; servers recorded unhealthy
    /// seed the blacklist before the first reconciliation.
    pub fn restore(&mut self, snapshot: &BTreeMap<String, ServerStatus>) {
        for (address, persisted) in snapshot {
            if let Some(status) = self.status.get_mut(address) {
                status.active = persisted.active;
                status.draining = persisted.draining && persisted.active;
                status.healthy = persisted.healthy;
            }
            if !persisted.healthy {
                self.blacklist.insert(address.clone());
            }
        }
    }
}
