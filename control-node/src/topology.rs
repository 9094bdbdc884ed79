//! Runtime view of the leaf-spine fabric: directed routes, their redundant
//! spine paths, and canonical path names.
//!
//! A canonical name places the lexicographically smaller leaf first
//! (`leaf1-spine2-leaf6`), so the forward and reverse directions of a route
//! share one name and one prediction history.

use std::collections::BTreeSet;

use crate::config::TopologyConfig;
use crate::error::{ControlError, Result};

/// One hop of a path: the device and the egress port whose counters the hop
/// contributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathHop {
    /// SDN device id
    pub device: String,
    pub port: u32,
}

/// One of a route's redundant paths
#[derive(Debug, Clone)]
pub struct SpinePath {
    /// Spine name, e.g. `spine1`
    pub via_spine: String,
    /// Canonical direction-agnostic name
    pub canonical_name: String,
    pub hops: Vec<PathHop>,
}

/// An ordered leaf pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub src: String,
    pub dst: String,
}

impl Route {
    /// Route key used in the publication, `src->dst`
    pub fn key(&self) -> String {
        format!("{}->{}", self.src, self.dst)
    }
}

/// All routes with their paths, in configuration order
#[derive(Debug, Clone)]
pub struct PathTopology {
    routes: Vec<(Route, Vec<SpinePath>)>,
}

/// Canonical direction-agnostic path name
pub fn canonical_path_name(src: &str, dst: &str, spine: &str) -> String {
    if src <= dst {
        format!("{src}-{spine}-{dst}")
    } else {
        format!("{dst}-{spine}-{src}")
    }
}

impl PathTopology {
    pub fn from_config(config: &TopologyConfig) -> Result<Self> {
        let mut routes = Vec::with_capacity(config.routes.len());

        for route_cfg in &config.routes {
            let route = Route {
                src: route_cfg.src.clone(),
                dst: route_cfg.dst.clone(),
            };

            let mut paths = Vec::with_capacity(route_cfg.paths.len());
            for path_cfg in &route_cfg.paths {
                let hops = path_cfg
                    .hops
                    .iter()
                    .map(|hop| {
                        config
                            .devices
                            .get(&hop.device)
                            .map(|id| PathHop {
                                device: id.clone(),
                                port: hop.port,
                            })
                            .ok_or_else(|| {
                                ControlError::Config(format!(
                                    "unknown device {} in route {}",
                                    hop.device,
                                    route.key()
                                ))
                            })
                    })
                    .collect::<Result<Vec<_>>>()?;

                paths.push(SpinePath {
                    via_spine: path_cfg.spine.clone(),
                    canonical_name: canonical_path_name(
                        &route_cfg.src,
                        &route_cfg.dst,
                        &path_cfg.spine,
                    ),
                    hops,
                });
            }

            routes.push((route, paths));
        }

        Ok(Self { routes })
    }

    pub fn routes(&self) -> &[(Route, Vec<SpinePath>)] {
        &self.routes
    }

    /// All distinct canonical path names, sorted
    pub fn canonical_names(&self) -> Vec<String> {
        let set: BTreeSet<String> = self
            .routes
            .iter()
            .flat_map(|(_, paths)| paths.iter().map(|p| p.canonical_name.clone()))
            .collect();
        set.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_name_collapses_directions() {
        assert_eq!(
            canonical_path_name("leaf1", "leaf6", "spine1"),
            "leaf1-spine1-leaf6"
        );
        assert_eq!(
            canonical_path_name("leaf6", "leaf1", "spine1"),
            "leaf1-spine1-leaf6"
        );
    }

    #[test]
    fn test_testbed_topology_builds() {
        let topology = PathTopology::from_config(&TopologyConfig::testbed()).unwrap();
        assert_eq!(topology.routes().len(), 12);
        // 6 leaf pairs x 2 spines
        assert_eq!(topology.canonical_names().len(), 12);

        let (route, paths) = &topology.routes()[0];
        assert_eq!(route.key(), "leaf1->leaf6");
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].via_spine, "spine1");
        assert_eq!(paths[0].canonical_name, "leaf1-spine1-leaf6");
        assert_eq!(paths[0].hops.len(), 2);
    }

    #[test]
    fn test_forward_and_reverse_share_canonical_names() {
        let topology = PathTopology::from_config(&TopologyConfig::testbed()).unwrap();
        let forward = topology
            .routes()
            .iter()
            .find(|(r, _)| r.key() == "leaf1->leaf6")
            .unwrap();
        let reverse = topology
            .routes()
            .iter()
            .find(|(r, _)| r.key() == "leaf6->leaf1")
            .unwrap();
        assert_eq!(
            forward.1[0].canonical_name,
            reverse.1[0].canonical_name
        );
    }
}
