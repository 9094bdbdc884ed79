//! Scenario tests for the control plane's decision logic:
//! - proactive sizing from a forecast (tier policy + fleet diff ordering)
//! - sustained-load reactive decisions over the sample windows
//! - heal/replace candidate selection
//! - path-weight ratio laws and the warmup gate
//! - publication and ledger invariants

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use control_node::alerts::{AlertFilter, AlertLedger};
use control_node::config::{TierBracket, TopologyConfig};
use control_node::fleet::{FleetState, ServerCapacity, ServerDescriptor, ServerStatus};
use control_node::forecast::{forecast_expiry, TierPolicy};
use control_node::load::{LoadSample, LoadThresholds, LoadWindow, ScaleSignal, ThresholdKind};
use control_node::pathweights::{ratios_from_costs, PathHistoryStore};
use control_node::state::StateStore;
use control_node::topology::PathTopology;
use control_node::usage::{IntervalUsage, PortCounterSnapshot, PortCounters};

fn testbed_servers() -> Vec<ServerDescriptor> {
    vec![
        ServerDescriptor {
            name: "ubuntu-guest".to_string(),
            address: "192.168.6.2".to_string(),
            tier: 1,
            capacity: ServerCapacity {
                cores: 1,
                memory_gb: 1,
            },
        },
        ServerDescriptor {
            name: "apache-vm-1".to_string(),
            address: "192.168.6.3".to_string(),
            tier: 2,
            capacity: ServerCapacity {
                cores: 2,
                memory_gb: 2,
            },
        },
        ServerDescriptor {
            name: "apache-vm-2".to_string(),
            address: "192.168.6.4".to_string(),
            tier: 3,
            capacity: ServerCapacity {
                cores: 4,
                memory_gb: 4,
            },
        },
    ]
}

const THRESHOLDS: LoadThresholds = LoadThresholds {
    cpu_high_pct: 90.0,
    mem_high_pct: 90.0,
    cpu_low_pct: 3.0,
    mem_low_pct: 20.0,
};

/// Proactive scale-up: a 250k req/h forecast against a small-range tier
/// table requires all three servers, powered on in ascending tier order.
#[test]
fn proactive_scale_up_orders_small_servers_first() {
    let policy = TierPolicy::new(vec![
        TierBracket {
            upto: 26_681,
            servers: 1,
        },
        TierBracket {
            upto: 53_341,
            servers: 2,
        },
        TierBracket {
            upto: 80_001,
            servers: 3,
        },
    ])
    .unwrap();
    let required = policy.required_servers(250_000);
    assert_eq!(required, 3);

    let mut fleet = FleetState::new(testbed_servers());
    fleet.set_active("192.168.6.2", true);

    // want \ have in ascending tier order
    let want: Vec<&ServerDescriptor> = fleet.descriptors().iter().take(required).collect();
    let to_power_on: Vec<&str> = want
        .iter()
        .filter(|d| !fleet.status_of(&d.address).unwrap().active)
        .map(|d| d.name.as_str())
        .collect();
    assert_eq!(to_power_on, vec!["apache-vm-1", "apache-vm-2"]);
}

/// Sustained high load: the 60th high sample fires the signal and the next
/// power-on candidate is the tier-2 server.
#[test]
fn sustained_high_load_picks_next_tier() {
    let mut window = LoadWindow::new(372, 60);
    let start = chrono::Local::now();
    for i in 0..60 {
        window.push(LoadSample {
            at: start + chrono::Duration::seconds(5 * i),
            cpu_pct: 92.0,
            mem_pct: 40.0,
        });
    }
    match window.evaluate(&THRESHOLDS, 60, 360, 1) {
        ScaleSignal::Up { trigger, .. } => assert_eq!(trigger, ThresholdKind::Cpu),
        other => panic!("expected scale-up, got {other:?}"),
    }

    let mut fleet = FleetState::new(testbed_servers());
    fleet.set_active("192.168.6.2", true);
    assert_eq!(fleet.next_to_power_on().unwrap().name, "apache-vm-1");
}

/// Draining scale-down: with {A, B} active and sustained low load, B (the
/// larger tier) drains first, and the state transitions keep the invariant
/// `draining implies active`.
#[test]
fn sustained_low_load_drains_largest_active() {
    let mut window = LoadWindow::new(372, 60);
    let start = chrono::Local::now();
    for i in 0..360 {
        window.push(LoadSample {
            at: start + chrono::Duration::seconds(5 * i),
            cpu_pct: 1.5,
            mem_pct: 12.0,
        });
    }
    assert!(matches!(
        window.evaluate(&THRESHOLDS, 60, 360, 2),
        ScaleSignal::Down { .. }
    ));

    let mut fleet = FleetState::new(testbed_servers());
    fleet.set_active("192.168.6.2", true);
    fleet.set_active("192.168.6.3", true);

    let target = fleet.next_to_power_off().unwrap().clone();
    assert_eq!(target.name, "apache-vm-1");

    fleet.set_draining(&target.address, true);
    assert!(fleet.status_of(&target.address).unwrap().draining);
    assert_eq!(fleet.serving_count(), 1);

    fleet.set_active(&target.address, false);
    let after = fleet.status_of(&target.address).unwrap();
    assert!(!after.active);
    assert!(!after.draining);
}

/// Failover: when the tier-2 server fails its probe and the reboot does not
/// heal it, the replacement is the smallest spare meeting its capacity, and
/// the blacklist keeps the failed server out of every later selection.
#[test]
fn failover_selects_smallest_sufficient_spare() {
    let mut fleet = FleetState::new(testbed_servers());
    fleet.set_active("192.168.6.2", true);
    fleet.set_active("192.168.6.3", true);

    let failed = fleet.descriptor_by_name("apache-vm-1").unwrap().clone();

    // Isolation: draining + blacklist.
    fleet.set_draining(&failed.address, true);
    fleet.blacklist_add(&failed.address);
    assert!(!fleet.status_of(&failed.address).unwrap().healthy);

    // Probe still failing after reboot: power off and replace.
    fleet.set_active(&failed.address, false);
    let replacement = fleet.find_replacement(&failed).unwrap().clone();
    assert_eq!(replacement.name, "apache-vm-2");

    fleet.set_active(&replacement.address, true);
    assert_eq!(fleet.serving_count(), 2);

    // The blacklisted server is not a power-on candidate.
    assert_ne!(
        fleet.next_to_power_on().map(|d| d.name.clone()),
        Some(failed.name)
    );
}

/// Path-weight real mode: 10 MB vs 40 MB over one minute gives ratios
/// 0.8 / 0.2 via inverse weighting, and every route's ratios sum to one.
#[test]
fn path_weights_real_mode_ratios() {
    let topology = PathTopology::from_config(&TopologyConfig::testbed()).unwrap();
    let (route, paths) = &topology.routes()[0];
    assert_eq!(route.key(), "leaf1->leaf6");

    let mb = |n: u64| n * 1_048_576;
    let mut start_devices: std::collections::HashMap<
        String,
        std::collections::HashMap<u32, PortCounters>,
    > = Default::default();
    let mut end_devices = start_devices.clone();

    for (path, bytes) in paths.iter().zip([mb(10), mb(40)]) {
        let per_hop = bytes / path.hops.len() as u64;
        for hop in &path.hops {
            start_devices
                .entry(hop.device.clone())
                .or_default()
                .insert(hop.port, PortCounters::default());
            end_devices.entry(hop.device.clone()).or_default().insert(
                hop.port,
                PortCounters {
                    bytes_sent: per_hop,
                    bytes_received: 0,
                },
            );
        }
    }

    let usage = IntervalUsage::between(
        &PortCounterSnapshot {
            taken_at: chrono::Local::now(),
            devices: start_devices,
        },
        &PortCounterSnapshot {
            taken_at: chrono::Local::now(),
            devices: end_devices,
        },
    );

    let costs: BTreeMap<usize, f64> = paths
        .iter()
        .enumerate()
        .map(|(i, path)| {
            let cost: u64 = path
                .hops
                .iter()
                .map(|h| usage.port_bytes(&h.device, h.port).unwrap())
                .sum();
            (i, cost as f64)
        })
        .collect();

    let ratios = ratios_from_costs(&costs);
    assert!((ratios[&0] - 0.8).abs() < 1e-6);
    assert!((ratios[&1] - 0.2).abs() < 1e-6);
    assert!((ratios.values().sum::<f64>() - 1.0).abs() <= 1e-9);
}

/// Predictor warmup: the blending mode is honoured only once every path has
/// ten history entries.
#[test]
fn prediction_gate_waits_for_full_history() {
    let dir = tempfile::tempdir().unwrap();
    let names: Vec<String> = PathTopology::from_config(&TopologyConfig::testbed())
        .unwrap()
        .canonical_names();
    let mut store = PathHistoryStore::load(dir.path().join("history.json"), 10, &names);

    for round in 0..3 {
        for name in &names {
            store.append(name, (round * 1_000) as f64);
        }
    }
    assert!(!store.all_warm(10), "iteration 3 of 10 must stay real");

    for round in 3..10 {
        for name in &names {
            store.append(name, (round * 1_000) as f64);
        }
    }
    assert!(store.all_warm(10), "iteration 10 activates the mode");
}

/// A forecast written at hh:17 is valid until (hh+1):00.
#[test]
fn forecast_expiry_is_top_of_next_hour() {
    use chrono::TimeZone;
    let written = chrono::Local.with_ymd_and_hms(2025, 6, 1, 9, 17, 3).unwrap();
    assert_eq!(
        forecast_expiry(written),
        chrono::Local.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap()
    );
}

/// After every mutation the status file matches the in-memory snapshot, and
/// publishing twice changes nothing (idempotence).
#[tokio::test]
async fn state_publication_is_exact_and_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(AlertLedger::open(dir.path().join("alerts.json"), 100, 24));
    let status_path = dir.path().join("active_servers_status.json");
    let store = StateStore::open(testbed_servers(), status_path.clone(), None, ledger);

    let reporting: HashSet<String> =
        HashSet::from(["192.168.6.2".to_string(), "192.168.6.3".to_string()]);
    store.mutate(|f| f.reconcile(&reporting)).await;

    let on_disk: BTreeMap<String, ServerStatus> =
        serde_json::from_slice(&std::fs::read(&status_path).unwrap()).unwrap();
    assert_eq!(on_disk, store.snapshot().await);
    assert!(on_disk["192.168.6.2"].active);
    assert!(!on_disk["192.168.6.4"].active);

    let before = std::fs::read(&status_path).unwrap();
    store.republish().await;
    store.republish().await;
    assert_eq!(before, std::fs::read(&status_path).unwrap());
}

/// Ledger retention: the count cap keeps the newest records and the ledger
/// survives reopening.
#[test]
fn ledger_retention_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("system_alerts.json");
    {
        let ledger = AlertLedger::open(path.clone(), 100, 24);
        for i in 0..120 {
            ledger.forecast_failed(&format!("event {i}"));
        }
        assert_eq!(ledger.counts().total, 100);
    }

    let reopened = AlertLedger::open(path, 100, 24);
    assert_eq!(reopened.list(&AlertFilter::all()).len(), 100);

    let limited = reopened.list(&AlertFilter {
        limit: Some(50),
        ..AlertFilter::all()
    });
    assert_eq!(limited.len(), 50);
    assert!(limited[0].message.contains("event 119"));
}
