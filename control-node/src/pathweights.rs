//! Path-weight controller: minute-aligned collection of cumulative port
//! counters, per-route path costs, inverse-cost selection ratios, optional
//! prediction blending, and atomic publication for the SDN controller.

use chrono::{DateTime, Duration as ChronoDuration, Local, Timelike};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::alerts::AlertLedger;
use crate::config::WeightMode;
use crate::error::Result;
use crate::fsio::write_atomic;
use crate::predictor::PathPredictor;
use crate::remote::RemoteCopier;
use crate::sdn::SdnClient;
use crate::shutdown::ShutdownSignal;
use crate::topology::{PathTopology, SpinePath};
use crate::usage::{IntervalUsage, PortCounterSnapshot};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Where a published cost came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostSource {
    Realtime,
    Prediction,
    Hybrid,
}

impl CostSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CostSource::Realtime => "realtime",
            CostSource::Prediction => "prediction",
            CostSource::Hybrid => "hybrid",
        }
    }
}

/// Published per-path cost
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BandwidthCost {
    pub bytes: u64,
    pub megabytes: f64,
    pub source: String,
}

/// Published per-path entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathDetail {
    pub via_spine: String,
    pub selection_ratio: f64,
    pub bandwidth_cost: BandwidthCost,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteWeights {
    pub path_details: BTreeMap<String, PathDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicationMetadata {
    pub timestamp_unix: i64,
    pub iteration: u64,
    pub interval_seconds: u64,
    pub total_traffic_mb: f64,
    pub mode: String,
    pub using_predictions: bool,
}

/// The artefact consumed by the SDN application and the front node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathWeightPublication {
    pub metadata: PublicationMetadata,
    pub path_selection_weights: BTreeMap<String, RouteWeights>,
}

/// Inverse-cost ratios: `weight = 1/(cost+1)` normalised to sum 1. All-zero
/// costs distribute equally. Paths with no cost are absent from the input and
/// stay absent from the output.
pub fn ratios_from_costs(costs: &BTreeMap<usize, f64>) -> BTreeMap<usize, f64> {
    if costs.is_empty() {
        return BTreeMap::new();
    }
    if costs.values().all(|c| *c == 0.0) {
        let share = 1.0 / costs.len() as f64;
        return costs.keys().map(|k| (*k, share)).collect();
    }

    let weights: BTreeMap<usize, f64> = costs
        .iter()
        .map(|(k, cost)| (*k, 1.0 / (cost + 1.0)))
        .collect();
    let total: f64 = weights.values().sum();
    weights.iter().map(|(k, w)| (*k, w / total)).collect()
}

/// Per-canonical-path history of interval bytes feeding the predictor.
/// Capacity ten, oldest dropped; persisted so restarts keep their warmup.
#[derive(Debug)]
pub struct PathHistoryStore {
    path: PathBuf,
    capacity: usize,
    buffers: BTreeMap<String, VecDeque<f64>>,
}

impl PathHistoryStore {
    pub fn load(path: PathBuf, capacity: usize, canonical_names: &[String]) -> Self {
        let mut buffers: BTreeMap<String, VecDeque<f64>> = canonical_names
            .iter()
            .map(|name| (name.clone(), VecDeque::with_capacity(capacity)))
            .collect();

        if let Ok(bytes) = std::fs::read(&path) {
            match serde_json::from_slice::<BTreeMap<String, Vec<f64>>>(&bytes) {
                Ok(persisted) => {
                    for (name, values) in persisted {
                        if let Some(buffer) = buffers.get_mut(&name) {
                            for value in values.into_iter().rev().take(capacity).rev() {
                                buffer.push_back(value);
                            }
                        }
                    }
                    info!(path = %path.display(), "Loaded path history buffers");
                }
                Err(e) => warn!(error = %e, "Path history file unreadable, starting cold"),
            }
        }

        Self {
            path,
            capacity,
            buffers,
        }
    }

    pub fn append(&mut self, name: &str, bytes: f64) {
        if let Some(buffer) = self.buffers.get_mut(name) {
            if buffer.len() == self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(bytes);
        }
    }

    pub fn depth(&self, name: &str) -> usize {
        self.buffers.get(name).map(VecDeque::len).unwrap_or(0)
    }

    /// True once every path has at least `min` entries; the blending mode is
    /// only honoured past this point.
    pub fn all_warm(&self, min: usize) -> bool {
        !self.buffers.is_empty() && self.buffers.values().all(|b| b.len() >= min)
    }

    pub fn persist(&self) -> Result<()> {
        let serialisable: BTreeMap<&String, Vec<f64>> = self
            .buffers
            .iter()
            .map(|(k, v)| (k, v.iter().copied().collect()))
            .collect();
        let bytes = serde_json::to_vec_pretty(&serialisable)?;
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }
}

/// Append-only per-interval bandwidth log, the per-path model retraining
/// feed. Capped to a week of minutes, newest kept.
#[derive(Debug)]
pub struct PathBandwidthLog {
    path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthLogRecord {
    pub at: DateTime<Local>,
    pub paths: BTreeMap<String, f64>,
}

const BANDWIDTH_LOG_CAP: usize = 7 * 24 * 60;

impl PathBandwidthLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn append(&self, at: DateTime<Local>, paths: BTreeMap<String, f64>) -> Result<()> {
        let mut records: Vec<BandwidthLogRecord> = match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        records.push(BandwidthLogRecord { at, paths });
        if records.len() > BANDWIDTH_LOG_CAP {
            let excess = records.len() - BANDWIDTH_LOG_CAP;
            records.drain(..excess);
        }
        let bytes = serde_json::to_vec(&records)?;
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }
}

/// Atomic local write plus best-effort delivery into the SDN host. Shared
/// with the HTTP surface for `force-sync`.
pub struct ArtefactPublisher {
    path: PathBuf,
    copier: Option<RemoteCopier>,
    ledger: Arc<AlertLedger>,
}

impl ArtefactPublisher {
    pub fn new(path: PathBuf, copier: Option<RemoteCopier>, ledger: Arc<AlertLedger>) -> Self {
        Self {
            path,
            copier,
            ledger,
        }
    }

    /// Idempotent: writing the same artefact twice has no ill effect.
    pub async fn publish(&self, publication: &PathWeightPublication) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(publication)?;
        if let Err(e) = write_atomic(&self.path, &bytes) {
            self.ledger.publication_failed(&e.to_string());
            return Err(e.into());
        }

        if let Some(copier) = &self.copier {
            if let Err(e) = copier.copy(&self.path).await {
                self.ledger.publication_failed(&e.to_string());
                return Err(e);
            }
        }

        counter!("control_path_weight_publications_total", 1);
        Ok(())
    }
}

/// The minute-aligned controller
pub struct PathWeightController {
    topology: PathTopology,
    sdn: SdnClient,
    predictor: Option<Arc<dyn PathPredictor>>,
    mode: WeightMode,
    hybrid_weight: f64,
    min_history: usize,
    interval: Duration,
    congestion_threshold_mb: f64,
    history: PathHistoryStore,
    bandwidth_log: PathBandwidthLog,
    publisher: Arc<ArtefactPublisher>,
    published: Arc<RwLock<Option<PathWeightPublication>>>,
    ledger: Arc<AlertLedger>,
    iteration: u64,
}

#[allow(clippy::too_many_arguments)]
impl PathWeightController {
    pub fn new(
        topology: PathTopology,
        sdn: SdnClient,
        predictor: Option<Arc<dyn PathPredictor>>,
        mode: WeightMode,
        hybrid_weight: f64,
        min_history: usize,
        interval: Duration,
        congestion_threshold_mb: f64,
        history: PathHistoryStore,
        bandwidth_log: PathBandwidthLog,
        publisher: Arc<ArtefactPublisher>,
        published: Arc<RwLock<Option<PathWeightPublication>>>,
        ledger: Arc<AlertLedger>,
    ) -> Self {
        Self {
            topology,
            sdn,
            predictor,
            mode,
            hybrid_weight,
            min_history,
            interval,
            congestion_threshold_mb,
            history,
            bandwidth_log,
            publisher,
            published,
            ledger,
            iteration: 0,
        }
    }

    /// Run until shutdown. Blocks to the next wall-clock minute for the first
    /// snapshot, then produces one publication per closed minute.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        info!(
            mode = self.mode.as_str(),
            interval_seconds = self.interval.as_secs(),
            min_history = self.min_history,
            "Starting path-weight controller"
        );

        if let Some(predictor) = &self.predictor {
            if let Err(e) = predictor.warmup().await {
                warn!(error = %e, "Path predictor warmup failed");
            }
        }

        // Baseline snapshot at the first minute boundary.
        let mut baseline: Option<PortCounterSnapshot> = None;

        loop {
            if !sleep_to_minute_boundary(&mut shutdown).await {
                break;
            }

            match self.sdn.port_counters().await {
                Ok(snapshot) => {
                    if let Some(start) = baseline.take() {
                        let closed_minute =
                            snapshot.taken_at - ChronoDuration::seconds(self.interval.as_secs() as i64);
                        let usage = IntervalUsage::between(&start, &snapshot);
                        self.iteration += 1;
                        if let Err(e) = self.process_interval(&usage, closed_minute).await {
                            warn!(error = %e, "Path-weight cycle failed");
                        }
                    }
                    baseline = Some(snapshot);
                }
                Err(e) => {
                    // Baseline is preserved; this cycle is skipped.
                    warn!(error = %e, "Port counter snapshot failed");
                    self.ledger
                        .sdn_connection_failed(self.sdn.base_url(), &e.to_string());
                    counter!("control_snapshot_failures_total", 1);
                }
            }
        }

        info!("Path-weight controller stopped");
    }

    async fn process_interval(
        &mut self,
        usage: &IntervalUsage,
        closed_minute: DateTime<Local>,
    ) -> Result<()> {
        // Measured cost per directed route path.
        let measured = self.measured_costs(usage);

        // History side effect: canonical paths accumulate both directions.
        let mut canonical_bytes: BTreeMap<String, f64> = BTreeMap::new();
        for costs in measured.values() {
            for (path, cost) in costs {
                *canonical_bytes
                    .entry(path.canonical_name.clone())
                    .or_default() += *cost;
            }
        }
        for (name, bytes) in &canonical_bytes {
            self.history.append(name, *bytes);
        }
        if let Err(e) = self.history.persist() {
            warn!(error = %e, "Failed to persist path history");
        }
        if let Err(e) = self.bandwidth_log.append(closed_minute, canonical_bytes) {
            warn!(error = %e, "Failed to append bandwidth log");
        }

        let warm = self.history.all_warm(self.min_history);
        let predictions_wanted = self.mode != WeightMode::Real && warm;

        let mut routes: BTreeMap<String, RouteWeights> = BTreeMap::new();
        let mut using_predictions = false;

        for (route, _) in self.topology.routes() {
            let key = route.key();
            let Some(costs) = measured.get(&key) else {
                continue;
            };
            if costs.is_empty() {
                continue;
            }

            let (resolved, source) = if predictions_wanted {
                self.resolve_with_predictions(costs).await
            } else {
                (
                    costs.iter().map(|(_, c)| *c).collect::<Vec<f64>>(),
                    CostSource::Realtime,
                )
            };
            if source != CostSource::Realtime {
                using_predictions = true;
            }

            let indexed: BTreeMap<usize, f64> = costs
                .iter()
                .enumerate()
                .map(|(i, (path, _))| (path.index, resolved[i]))
                .collect();
            let ratios = ratios_from_costs(&indexed);

            let mut details = BTreeMap::new();
            for (i, (path, _)) in costs.iter().enumerate() {
                let bytes = resolved[i].max(0.0);
                details.insert(
                    format!("path_{}", path.index),
                    PathDetail {
                        via_spine: path.via_spine.clone(),
                        selection_ratio: *ratios.get(&path.index).unwrap_or(&0.0),
                        bandwidth_cost: BandwidthCost {
                            bytes: bytes as u64,
                            megabytes: bytes / BYTES_PER_MB,
                            source: source.as_str().to_string(),
                        },
                    },
                );
            }
            routes.insert(key.clone(), RouteWeights {
                path_details: details,
            });

            let route_total_mb: f64 =
                costs.iter().map(|(_, c)| *c).sum::<f64>() / BYTES_PER_MB;
            if route_total_mb > self.congestion_threshold_mb {
                self.ledger
                    .high_path_congestion(&key, route_total_mb, self.congestion_threshold_mb);
            }
        }

        let total_traffic_mb = usage.total_bytes() as f64 / BYTES_PER_MB;
        gauge!("control_interval_traffic_mb", total_traffic_mb);

        let publication = PathWeightPublication {
            metadata: PublicationMetadata {
                timestamp_unix: closed_minute.timestamp(),
                iteration: self.iteration,
                interval_seconds: self.interval.as_secs(),
                total_traffic_mb,
                mode: self.mode.as_str().to_string(),
                using_predictions,
            },
            path_selection_weights: routes,
        };

        debug!(
            iteration = self.iteration,
            routes = publication.path_selection_weights.len(),
            using_predictions,
            "Publishing path weights"
        );

        // Retain for the HTTP surface before attempting delivery so
        // force-sync always has the latest artefact.
        {
            let mut published = self.published.write().await;
            *published = Some(publication.clone());
        }

        // Failure is recorded and does not block the next tick.
        let _ = self.publisher.publish(&publication).await;

        Ok(())
    }

    /// Measured per-path costs per route key. A path with any hop missing
    /// from the interval is skipped for this interval.
    fn measured_costs(&self, usage: &IntervalUsage) -> BTreeMap<String, Vec<(RoutePathRef, f64)>> {
        let mut out: BTreeMap<String, Vec<(RoutePathRef, f64)>> = BTreeMap::new();

        for (route, paths) in self.topology.routes() {
            let mut costs = Vec::new();
            for (index, path) in paths.iter().enumerate() {
                if let Some(cost) = path_cost(path, usage) {
                    costs.push((
                        RoutePathRef {
                            index,
                            via_spine: path.via_spine.clone(),
                            canonical_name: path.canonical_name.clone(),
                        },
                        cost as f64,
                    ));
                }
            }
            out.insert(route.key(), costs);
        }

        out
    }

    /// Replace or blend measured costs with predictions. If any path in the
    /// route lacks a prediction the whole route falls back to measured data;
    /// that is the expected warmup condition, not an error.
    async fn resolve_with_predictions(
        &self,
        costs: &[(RoutePathRef, f64)],
    ) -> (Vec<f64>, CostSource) {
        let measured: Vec<f64> = costs.iter().map(|(_, c)| *c).collect();
        let Some(predictor) = &self.predictor else {
            return (measured, CostSource::Realtime);
        };

        let mut predicted = Vec::with_capacity(costs.len());
        for (path, _) in costs {
            match predictor.predict(&path.canonical_name).await {
                Ok(Some(bytes)) => predicted.push(bytes as f64),
                Ok(None) => return (measured, CostSource::Realtime),
                Err(e) => {
                    debug!(path = %path.canonical_name, error = %e, "Prediction unavailable");
                    return (measured, CostSource::Realtime);
                }
            }
        }

        match self.mode {
            WeightMode::Predicted => (predicted, CostSource::Prediction),
            WeightMode::Hybrid => {
                let w = self.hybrid_weight;
                let blended = predicted
                    .iter()
                    .zip(&measured)
                    .map(|(p, m)| w * p + (1.0 - w) * m)
                    .collect();
                (blended, CostSource::Hybrid)
            }
            WeightMode::Real => (measured, CostSource::Realtime),
        }
    }
}

/// A path's position and names within its route
#[derive(Debug, Clone)]
struct RoutePathRef {
    index: usize,
    via_spine: String,
    canonical_name: String,
}

/// Sum of interval bytes over every hop; `None` if any hop is missing.
fn path_cost(path: &SpinePath, usage: &IntervalUsage) -> Option<u64> {
    let mut total = 0u64;
    for hop in &path.hops {
        total = total.saturating_add(usage.port_bytes(&hop.device, hop.port)?);
    }
    Some(total)
}

/// Sleep to the next wall-clock minute boundary; `false` on shutdown.
async fn sleep_to_minute_boundary(shutdown: &mut ShutdownSignal) -> bool {
    let now = Local::now();
    let into_minute =
        now.second() as u64 * 1_000 + (now.timestamp_subsec_millis() as u64).min(999);
    let mut wait = 60_000 - into_minute;
    if wait == 0 {
        wait = 60_000;
    }
    shutdown.sleep(Duration::from_millis(wait)).await
}
