//! Dynamic weighted random selection (DWRS) of backend servers.
//!
//! A pure function used by the front node: live per-server telemetry maps to
//! a comprehensive load score, the score to an integer weight, and a weighted
//! random draw picks the target. The input ordering is the published
//! ordering; it determines the distribution under ties and must be stable
//! across calls within a tick.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// CPU share of the comprehensive load score
pub const CPU_WEIGHT: f64 = 0.55;
/// Memory share of the comprehensive load score
pub const MEMORY_WEIGHT: f64 = 0.45;

/// Live telemetry for one server
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServerTelemetry {
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub cores: u32,
    pub total_memory_gb: f64,
}

/// A server with its computed load and selection weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedServer {
    pub address: String,
    pub telemetry: ServerTelemetry,
    pub load: f64,
    pub weight: u32,
}

/// Weighted average of CPU and memory usage, clamped at 100.
pub fn comprehensive_load(telemetry: &ServerTelemetry) -> f64 {
    let load = telemetry.cpu_pct * CPU_WEIGHT + telemetry.mem_pct * MEMORY_WEIGHT;
    load.min(100.0)
}

/// `max(1, 100 - floor(load))`: a loaded server keeps a floor weight of one
/// so it can still be drawn.
pub fn load_to_weight(load: f64) -> u32 {
    if load >= 100.0 {
        return 1;
    }
    (100 - load.floor() as i64).max(1) as u32
}

/// Weigh servers in the given (stable) order.
pub fn weigh_servers<I>(telemetry: I) -> Vec<WeightedServer>
where
    I: IntoIterator<Item = (String, ServerTelemetry)>,
{
    telemetry
        .into_iter()
        .map(|(address, telemetry)| {
            let load = comprehensive_load(&telemetry);
            WeightedServer {
                address,
                telemetry,
                load,
                weight: load_to_weight(load),
            }
        })
        .collect()
}

/// Weighted random draw.
///
/// A single server is returned directly. A zero total weight falls back to a
/// uniform draw. Otherwise an integer in `[1, total]` is drawn and the list
/// walked accumulating weights until the cumulative weight reaches the draw.
pub fn select<'a, R: Rng>(servers: &'a [WeightedServer], rng: &mut R) -> Option<&'a WeightedServer> {
    match servers {
        [] => None,
        [only] => Some(only),
        _ => {
            let total: u64 = servers.iter().map(|s| s.weight as u64).sum();
            if total == 0 {
                return servers.get(rng.gen_range(0..servers.len()));
            }

            let draw = rng.gen_range(1..=total);
            let mut cumulative = 0u64;
            for server in servers {
                cumulative += server.weight as u64;
                if cumulative >= draw {
                    return Some(server);
                }
            }
            servers.last()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn telemetry(cpu: f64, mem: f64) -> ServerTelemetry {
        ServerTelemetry {
            cpu_pct: cpu,
            mem_pct: mem,
            cores: 2,
            total_memory_gb: 2.0,
        }
    }

    #[test]
    fn test_comprehensive_load_weighting() {
        let t = telemetry(80.0, 40.0);
        // 0.55 * 80 + 0.45 * 40 = 62
        assert!((comprehensive_load(&t) - 62.0).abs() < 1e-9);
    }

    #[test]
    fn test_load_clamps_at_100() {
        let t = telemetry(100.0, 120.0);
        assert_eq!(comprehensive_load(&t), 100.0);
    }

    #[test]
    fn test_weight_floor_is_one() {
        assert_eq!(load_to_weight(100.0), 1);
        assert_eq!(load_to_weight(120.0), 1);
        assert_eq!(load_to_weight(99.5), 1);
    }

    #[test]
    fn test_weight_of_idle_server() {
        assert_eq!(load_to_weight(0.0), 100);
        assert_eq!(load_to_weight(37.2), 63);
    }

    #[test]
    fn test_single_server_is_always_selected() {
        let servers = weigh_servers(vec![(
            "192.168.6.2".to_string(),
            telemetry(95.0, 95.0),
        )]);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10 {
            assert_eq!(
                select(&servers, &mut rng).unwrap().address,
                "192.168.6.2"
            );
        }
    }

    #[test]
    fn test_empty_list_selects_nothing() {
        let mut rng = StdRng::seed_from_u64(7);
        assert!(select(&[], &mut rng).is_none());
    }

    #[test]
    fn test_zero_total_weight_falls_back_to_uniform() {
        let mut servers = weigh_servers(vec![
            ("a".to_string(), telemetry(100.0, 100.0)),
            ("b".to_string(), telemetry(100.0, 100.0)),
        ]);
        for server in &mut servers {
            server.weight = 0;
        }
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            seen.insert(select(&servers, &mut rng).unwrap().address.clone());
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_draw_walk_respects_cumulative_weights() {
        // Weights 75 and 25: draws 1..=75 hit the first server.
        let servers = vec![
            WeightedServer {
                address: "a".to_string(),
                telemetry: telemetry(25.0, 25.0),
                load: 25.0,
                weight: 75,
            },
            WeightedServer {
                address: "b".to_string(),
                telemetry: telemetry(75.0, 75.0),
                load: 75.0,
                weight: 25,
            },
        ];

        // Deterministic check over many seeded draws: empirical frequency
        // approaches weight share.
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts: HashMap<String, u32> = HashMap::new();
        let draws = 20_000;
        for _ in 0..draws {
            let selected = select(&servers, &mut rng).unwrap();
            *counts.entry(selected.address.clone()).or_default() += 1;
        }

        let share_a = counts["a"] as f64 / draws as f64;
        assert!((share_a - 0.75).abs() < 0.02, "share_a = {share_a}");
    }

    #[test]
    fn test_less_loaded_server_is_preferred() {
        let servers = weigh_servers(vec![
            ("idle".to_string(), telemetry(5.0, 5.0)),
            ("busy".to_string(), telemetry(95.0, 95.0)),
        ]);
        assert!(servers[0].weight > servers[1].weight);

        let mut rng = StdRng::seed_from_u64(1);
        let mut idle_hits = 0;
        for _ in 0..1_000 {
            if select(&servers, &mut rng).unwrap().address == "idle" {
                idle_hits += 1;
            }
        }
        assert!(idle_hits > 800);
    }
}
