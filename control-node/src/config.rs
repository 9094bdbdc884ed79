//! Control-plane configuration: serde-deserialised TOML with an
//! environment-variable overlay. Validation is fatal at startup; the
//! controller refuses to run with a malformed tier table or an empty fleet.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ControlError, Result};
use crate::fleet::{ServerCapacity, ServerDescriptor};

/// Path-weight blending mode selected at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightMode {
    /// Use measured costs directly
    Real,
    /// Use one-step-ahead predictions where available
    Predicted,
    /// Blend predictions with measurements
    Hybrid,
}

impl WeightMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WeightMode::Real => "real",
            WeightMode::Predicted => "predicted",
            WeightMode::Hybrid => "hybrid",
        }
    }
}

/// Main configuration for the control node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Metrics-store access
    pub telemetry: TelemetryConfig,
    /// SDN controller access
    pub sdn: SdnConfig,
    /// Virtualization host command channel
    pub power: PowerConfig,
    /// Scaling-loop timing and thresholds
    pub scaling: ScalingConfig,
    /// Traffic forecasting
    pub forecast: ForecastConfig,
    /// Path-weight loop
    pub path_weights: PathWeightsConfig,
    /// Server-status publication to the front node
    pub sync: SyncConfig,
    /// Alert ledger retention
    pub alerts: AlertsConfig,
    /// HTTP surface
    pub api: ApiConfig,
    /// Logging
    pub logging: LoggingConfig,
    /// Backend server inventory
    pub servers: Vec<ServerDescriptor>,
    /// Request-per-hour brackets driving proactive sizing
    pub tiers: Vec<TierBracket>,
    /// Leaf-spine fabric topology
    pub topology: TopologyConfig,
}

/// Metrics-store (Prometheus-compatible) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Base URL of the metrics store
    pub url: String,
    /// Query timeout in seconds
    pub query_timeout_seconds: u64,
    /// Job label of the per-server node exporters
    pub node_job: String,
    /// Job label of the request-counting exporters
    pub request_job: String,
    /// Seconds a freshly booted server is excluded from decisions
    pub boot_grace_seconds: u64,
}

/// SDN controller REST access
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdnConfig {
    /// Base URL, e.g. http://127.0.0.1:8181
    pub url: String,
    pub username: String,
    pub password: String,
    /// Statistics request timeout in seconds
    pub timeout_seconds: u64,
}

/// Virtualization host command channel.
///
/// The command line is templated: `{server}` and `{state}` are substituted
/// before execution, mirroring how the host's own tooling is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub command_timeout_seconds: u64,
    /// Gap between off and on during a restart
    pub restart_gap_seconds: u64,
}

/// Scaling-loop timing and thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// Tick period in seconds
    pub tick_seconds: u64,
    /// Quiescence after a power-up
    pub stabilization_seconds: u64,
    /// Connection draining window before power-off
    pub drain_seconds: u64,
    /// Wait after issuing a heal reboot before reprobing
    pub reboot_wait_seconds: u64,
    /// Sustained high-load thresholds (percent)
    pub cpu_high_pct: f64,
    pub mem_high_pct: f64,
    /// Sustained low-load thresholds (percent)
    pub cpu_low_pct: f64,
    pub mem_low_pct: f64,
    /// Evaluation windows in seconds
    pub high_load_window_seconds: u64,
    pub low_load_window_seconds: u64,
    /// Synthetic probe settings
    pub probe_timeout_seconds: u64,
    pub probe_port: u16,
    pub probe_path: String,
}

impl ScalingConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_seconds)
    }

    pub fn stabilization(&self) -> Duration {
        Duration::from_secs(self.stabilization_seconds)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_seconds)
    }

    pub fn reboot_wait(&self) -> Duration {
        Duration::from_secs(self.reboot_wait_seconds)
    }

    /// Samples needed for the high-load evaluation
    pub fn high_load_samples(&self) -> usize {
        (self.high_load_window_seconds / self.tick_seconds.max(1)) as usize
    }

    /// Samples needed for the low-load evaluation
    pub fn low_load_samples(&self) -> usize {
        (self.low_load_window_seconds / self.tick_seconds.max(1)) as usize
    }
}

/// Traffic forecasting collaborator and local caches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// Base URL of the traffic predictor service
    pub predictor_url: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// Persisted forecast entry, survives restarts
    pub cache_file: PathBuf,
    /// Append-only hourly traffic history (model retraining feed)
    pub traffic_history_file: PathBuf,
}

/// Path-weight loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathWeightsConfig {
    /// Blending mode
    pub mode: WeightMode,
    /// Prediction share in hybrid mode
    pub hybrid_prediction_weight: f64,
    /// History entries required per path before predictions are honoured
    pub min_history_iterations: usize,
    /// Collection interval in seconds (minute-aligned)
    pub collection_interval_seconds: u64,
    /// Base URL of the per-path predictor service (predicted/hybrid modes)
    pub predictor_url: Option<String>,
    /// Predictor request timeout in seconds
    pub predictor_timeout_seconds: u64,
    /// Local artefact path
    pub artefact_file: PathBuf,
    /// Persisted per-path history buffers
    pub history_file: PathBuf,
    /// Append-only interval bandwidth log (model retraining feed)
    pub bandwidth_log_file: PathBuf,
    /// Per-route congestion alert threshold in megabytes per interval
    pub congestion_threshold_mb: f64,
    /// Delivery into the SDN controller's filesystem
    pub remote: RemoteCopyConfig,
}

/// Shell-invoked file transfer to a collaborator host.
///
/// `{local}` and `{remote}` are substituted into the argument list. Only the
/// file-at-a-known-path contract matters; the transport is an operational
/// choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCopyConfig {
    pub enabled: bool,
    pub command: String,
    pub args: Vec<String>,
    /// Destination path on the remote side
    pub destination: String,
    pub timeout_seconds: u64,
}

/// Server-status publication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Local status file, the authoritative on-disk record
    pub status_file: PathBuf,
    pub remote: RemoteCopyConfig,
}

/// Alert ledger retention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    pub file: PathBuf,
    pub max_records: usize,
    pub retention_hours: i64,
}

/// HTTP surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub listen_addr: String,
    /// Operational metrics exporter
    pub metrics_enabled: bool,
    pub metrics_listen_addr: String,
}

impl ApiConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .map_err(|e| ControlError::Config(format!("invalid api.listen_addr: {e}")))
    }

    pub fn metrics_listen_addr(&self) -> Result<SocketAddr> {
        self.metrics_listen_addr
            .parse()
            .map_err(|e| ControlError::Config(format!("invalid api.metrics_listen_addr: {e}")))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
}

/// One request-per-hour bracket: traffic strictly below `upto` requires
/// `servers` powered-on servers. Brackets must ascend and counts must be
/// monotone non-decreasing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierBracket {
    pub upto: u64,
    pub servers: usize,
}

/// Fabric topology as configured: named devices plus directed routes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Device name -> SDN device id
    pub devices: HashMap<String, String>,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub src: String,
    pub dst: String,
    pub paths: Vec<PathConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Spine this path traverses, used in canonical names
    pub spine: String,
    /// Hops as (device name, egress port)
    pub hops: Vec<HopConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopConfig {
    pub device: String,
    pub port: u32,
}

impl ControlConfig {
    /// Load configuration from file with a `CONTROL`-prefixed environment
    /// overlay.
    pub fn from_file(path: &str) -> std::result::Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("CONTROL"))
            .build()?;

        settings.try_deserialize()
    }

    /// Save configuration to file
    #[allow(dead_code)]
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| ControlError::Serialization(e.to_string()))?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Validate the configuration. Any error here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(ControlError::Config(
                "at least one server descriptor is required".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        let mut addresses = std::collections::HashSet::new();
        let mut tiers = std::collections::HashSet::new();
        for server in &self.servers {
            if !names.insert(server.name.as_str()) {
                return Err(ControlError::Config(format!(
                    "duplicate server name: {}",
                    server.name
                )));
            }
            if !addresses.insert(server.address.as_str()) {
                return Err(ControlError::Config(format!(
                    "duplicate server address: {}",
                    server.address
                )));
            }
            if !tiers.insert(server.tier) {
                return Err(ControlError::Config(format!(
                    "duplicate server tier: {}",
                    server.tier
                )));
            }
        }

        if self.tiers.is_empty() {
            return Err(ControlError::Config(
                "at least one tier bracket is required".to_string(),
            ));
        }
        for pair in self.tiers.windows(2) {
            if pair[1].upto <= pair[0].upto {
                return Err(ControlError::Config(
                    "tier brackets must have ascending bounds".to_string(),
                ));
            }
            if pair[1].servers < pair[0].servers {
                return Err(ControlError::Config(
                    "tier server counts must be non-decreasing".to_string(),
                ));
            }
        }
        if self.tiers.iter().any(|t| t.servers == 0) {
            return Err(ControlError::Config(
                "tier server counts must be at least one".to_string(),
            ));
        }
        if self
            .tiers
            .iter()
            .any(|t| t.servers > self.servers.len())
        {
            return Err(ControlError::Config(
                "a tier bracket requires more servers than are configured".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.path_weights.hybrid_prediction_weight) {
            return Err(ControlError::Config(
                "path_weights.hybrid_prediction_weight must be within [0, 1]".to_string(),
            ));
        }
        if self.path_weights.mode != WeightMode::Real
            && self.path_weights.predictor_url.is_none()
        {
            return Err(ControlError::Config(
                "predicted/hybrid path-weight modes require path_weights.predictor_url"
                    .to_string(),
            ));
        }
        if self.path_weights.collection_interval_seconds == 0 {
            return Err(ControlError::Config(
                "path_weights.collection_interval_seconds cannot be 0".to_string(),
            ));
        }

        if self.scaling.tick_seconds == 0 {
            return Err(ControlError::Config(
                "scaling.tick_seconds cannot be 0".to_string(),
            ));
        }

        for route in &self.topology.routes {
            for path in &route.paths {
                for hop in &path.hops {
                    if !self.topology.devices.contains_key(&hop.device) {
                        return Err(ControlError::Config(format!(
                            "route {}->{} references unknown device {}",
                            route.src, route.dst, hop.device
                        )));
                    }
                }
            }
        }

        self.api.listen_addr()?;
        if self.api.metrics_enabled {
            self.api.metrics_listen_addr()?;
        }

        Ok(())
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            telemetry: TelemetryConfig {
                url: "http://127.0.0.1:9090".to_string(),
                query_timeout_seconds: 10,
                node_job: "node_exporter".to_string(),
                request_job: "apache_exporter".to_string(),
                boot_grace_seconds: 80,
            },
            sdn: SdnConfig {
                url: "http://127.0.0.1:8181".to_string(),
                username: "onos".to_string(),
                password: "rocks".to_string(),
                timeout_seconds: 10,
            },
            power: PowerConfig {
                command: "virt-power".to_string(),
                args: vec!["{server}".to_string(), "{state}".to_string()],
                command_timeout_seconds: 60,
                restart_gap_seconds: 20,
            },
            scaling: ScalingConfig {
                tick_seconds: 5,
                stabilization_seconds: 80,
                drain_seconds: 30,
                reboot_wait_seconds: 15,
                cpu_high_pct: 90.0,
                mem_high_pct: 90.0,
                cpu_low_pct: 3.0,
                mem_low_pct: 20.0,
                high_load_window_seconds: 5 * 60,
                low_load_window_seconds: 30 * 60,
                probe_timeout_seconds: 3,
                probe_port: 80,
                probe_path: "/index.html".to_string(),
            },
            forecast: ForecastConfig {
                predictor_url: "http://127.0.0.1:7070".to_string(),
                timeout_seconds: 10,
                cache_file: PathBuf::from("data/forecast_cache.json"),
                traffic_history_file: PathBuf::from("data/traffic_history.json"),
            },
            path_weights: PathWeightsConfig {
                mode: WeightMode::Real,
                hybrid_prediction_weight: 0.3,
                min_history_iterations: 10,
                collection_interval_seconds: 60,
                predictor_url: None,
                predictor_timeout_seconds: 10,
                artefact_file: PathBuf::from("data/onos-path-selection.json"),
                history_file: PathBuf::from("data/path_history.json"),
                bandwidth_log_file: PathBuf::from("data/path_bandwidth_log.json"),
                congestion_threshold_mb: 500.0,
                remote: RemoteCopyConfig {
                    enabled: false,
                    command: "scp".to_string(),
                    args: vec!["{local}".to_string(), "{remote}".to_string()],
                    destination: "sdn-host:/opt/onos/config/onos-path-selection.json"
                        .to_string(),
                    timeout_seconds: 30,
                },
            },
            sync: SyncConfig {
                status_file: PathBuf::from("data/active_servers_status.json"),
                remote: RemoteCopyConfig {
                    enabled: false,
                    command: "scp".to_string(),
                    args: vec!["{local}".to_string(), "{remote}".to_string()],
                    destination: "front-node:/opt/dlb/active_servers_status.json".to_string(),
                    timeout_seconds: 30,
                },
            },
            alerts: AlertsConfig {
                file: PathBuf::from("data/system_alerts.json"),
                max_records: 100,
                retention_hours: 24,
            },
            api: ApiConfig {
                listen_addr: "127.0.0.1:8090".to_string(),
                metrics_enabled: true,
                metrics_listen_addr: "127.0.0.1:9091".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            servers: vec![
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
            ],
            tiers: vec![
                TierBracket {
                    upto: 140_000,
                    servers: 1,
                },
                TierBracket {
                    upto: 420_000,
                    servers: 2,
                },
                TierBracket {
                    upto: 1_000_000,
                    servers: 3,
                },
            ],
            topology: TopologyConfig::testbed(),
        }
    }
}

impl TopologyConfig {
    /// Reference leaf-spine testbed: four leaves, two spines, two paths per
    /// route.
    pub fn testbed() -> Self {
        let devices = HashMap::from([
            ("leaf1".to_string(), "of:000072ecfb3ccb4c".to_string()),
            ("leaf2".to_string(), "of:000042b1a1405d41".to_string()),
            ("leaf3".to_string(), "of:000032095cbf1043".to_string()),
            ("leaf6".to_string(), "of:0000ca44716bdf4b".to_string()),
            ("spine1".to_string(), "of:0000d6dee87ca841".to_string()),
            ("spine2".to_string(), "of:00000ac352fff34c".to_string()),
        ]);

        // (src, dst, [(spine1 hops), (spine2 hops)])
        let table: [(&str, &str, [(u32, u32); 2]); 12] = [
            ("leaf1", "leaf6", [(1, 2), (5, 4)]),
            ("leaf6", "leaf1", [(1, 1), (2, 1)]),
            ("leaf1", "leaf2", [(1, 3), (5, 2)]),
            ("leaf2", "leaf1", [(3, 1), (1, 1)]),
            ("leaf1", "leaf3", [(1, 4), (5, 3)]),
            ("leaf3", "leaf1", [(1, 1), (2, 1)]),
            ("leaf2", "leaf3", [(3, 4), (1, 3)]),
            ("leaf3", "leaf2", [(1, 3), (2, 2)]),
            ("leaf2", "leaf6", [(3, 2), (1, 4)]),
            ("leaf6", "leaf2", [(1, 3), (2, 2)]),
            ("leaf3", "leaf6", [(1, 2), (2, 4)]),
            ("leaf6", "leaf3", [(1, 4), (2, 3)]),
        ];

        let routes = table
            .iter()
            .map(|(src, dst, ports)| RouteConfig {
                src: src.to_string(),
                dst: dst.to_string(),
                paths: vec![
                    PathConfig {
                        spine: "spine1".to_string(),
                        hops: vec![
                            HopConfig {
                                device: src.to_string(),
                                port: ports[0].0,
                            },
                            HopConfig {
                                device: "spine1".to_string(),
                                port: ports[0].1,
                            },
                        ],
                    },
                    PathConfig {
                        spine: "spine2".to_string(),
                        hops: vec![
                            HopConfig {
                                device: src.to_string(),
                                port: ports[1].0,
                            },
                            HopConfig {
                                device: "spine2".to_string(),
                                port: ports[1].1,
                            },
                        ],
                    },
                ],
            })
            .collect();

        Self { devices, routes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ControlConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_fleet_is_rejected() {
        let mut config = ControlConfig::default();
        config.servers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_tier_table_is_rejected() {
        let mut config = ControlConfig::default();
        config.tiers[1].upto = config.tiers[0].upto;
        assert!(config.validate().is_err());

        let mut config = ControlConfig::default();
        config.tiers[2].servers = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_predicted_mode_requires_predictor_url() {
        let mut config = ControlConfig::default();
        config.path_weights.mode = WeightMode::Predicted;
        assert!(config.validate().is_err());

        config.path_weights.predictor_url = Some("http://127.0.0.1:7071".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_topology_device_is_rejected() {
        let mut config = ControlConfig::default();
        config.topology.routes[0].paths[0].hops[0].device = "leaf9".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_sample_windows() {
        let config = ControlConfig::default();
        assert_eq!(config.scaling.high_load_samples(), 60);
        assert_eq!(config.scaling.low_load_samples(), 360);
    }
}
