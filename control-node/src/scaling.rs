//! Server-scaling controller: one logical loop on a five-second tick running
//! forecast-gated proactive sizing, synthetic health probing with
//! heal-by-reboot and cold-standby replacement, and sustained-load reactive
//! sizing.
//!
//! Any phase may declare a stabilisation delay that short-circuits the rest
//! of the tick; stabilisation is the only state that consumes wall-clock
//! sleep outside draining and reboot waits. Every alert is written before
//! the sleep associated with it.

use chrono::{Duration as ChronoDuration, Local};
use metrics::{counter, gauge};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::alerts::AlertLedger;
use crate::config::ScalingConfig;
use crate::error::Result;
use crate::fleet::ServerDescriptor;
use crate::forecast::{hour_floor, ForecastCache, TierPolicy, TrafficHistory};
use crate::load::{LoadSample, LoadThresholds, LoadWindow, ScaleSignal};
use crate::power::PowerController;
use crate::predictor::{ForecastOutcome, TrafficForecaster};
use crate::shutdown::ShutdownSignal;
use crate::state::StateStore;
use crate::telemetry::MetricsClient;

/// What a tick decided to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    /// Resume normal ticking
    Continue,
    /// Quiesce for the given period before the next decision
    Stabilize(Duration),
}

/// Synthetic probe: one HTTP GET with a short timeout. A 5xx response or a
/// transport error is unhealthy; everything else (including 4xx) proves the
/// server is alive and serving.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    http: reqwest::Client,
    port: u16,
    path: String,
}

impl HealthProbe {
    pub fn new(timeout: Duration, port: u16, path: String) -> crate::error::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::error::ControlError::Other(format!("probe client: {e}")))?;
        Ok(Self { http, port, path })
    }

    /// `Ok(())` when healthy, `Err(detail)` otherwise.
    pub async fn check(&self, address: &str) -> std::result::Result<(), String> {
        let url = format!("http://{}:{}{}", address, self.port, self.path);
        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_server_error() => {
                Err(format!("status {}", response.status()))
            }
            Ok(_) => Ok(()),
            Err(e) => Err(format!("connection error: {e}")),
        }
    }
}

pub struct ScalingController {
    cfg: ScalingConfig,
    thresholds: LoadThresholds,
    policy: TierPolicy,
    telemetry: MetricsClient,
    power: PowerController,
    probe: HealthProbe,
    state: Arc<StateStore>,
    ledger: Arc<AlertLedger>,
    forecaster: Arc<dyn TrafficForecaster>,
    forecast: ForecastCache,
    traffic_history: TrafficHistory,
    window: LoadWindow,
    /// Retraining-in-progress latch so start/complete events fire once
    retraining: bool,
}

#[allow(clippy::too_many_arguments)]
impl ScalingController {
    pub fn new(
        cfg: ScalingConfig,
        policy: TierPolicy,
        telemetry: MetricsClient,
        power: PowerController,
        probe: HealthProbe,
        state: Arc<StateStore>,
        ledger: Arc<AlertLedger>,
        forecaster: Arc<dyn TrafficForecaster>,
        forecast: ForecastCache,
        traffic_history: TrafficHistory,
    ) -> Self {
        let thresholds = LoadThresholds {
            cpu_high_pct: cfg.cpu_high_pct,
            mem_high_pct: cfg.mem_high_pct,
            cpu_low_pct: cfg.cpu_low_pct,
            mem_low_pct: cfg.mem_low_pct,
        };
        // Sized for the 30-minute window plus one stabilisation of slack,
        // trimmed to a one-hour horizon.
        let window = LoadWindow::new(cfg.low_load_samples() + 12, 60);

        Self {
            cfg,
            thresholds,
            policy,
            telemetry,
            power,
            probe,
            state,
            ledger,
            forecaster,
            forecast,
            traffic_history,
            window,
            retraining: false,
        }
    }

    /// Run until shutdown.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        info!(
            tick_seconds = self.cfg.tick_seconds,
            stabilization_seconds = self.cfg.stabilization_seconds,
            "Starting scaling controller"
        );

        self.exporter_preflight().await;

        loop {
            if !shutdown.sleep(self.cfg.tick()).await {
                break;
            }

            match self.tick(&mut shutdown).await {
                Ok(TickOutcome::Continue) => {}
                Ok(TickOutcome::Stabilize(period)) => {
                    debug!(seconds = period.as_secs(), "Entering stabilisation");
                    if !shutdown.sleep(period).await {
                        break;
                    }
                    // Final synchronisation after the quiet period.
                    self.state.republish().await;
                }
                Err(e) => warn!(error = %e, "Tick failed"),
            }
        }

        info!("Scaling controller stopped");
    }

    /// Emit a warning per request-count exporter that is down at startup.
    async fn exporter_preflight(&self) {
        match self.telemetry.exporter_up().await {
            Ok(status) => {
                for (ip, up) in status {
                    if !up {
                        self.ledger.exporter_down(&ip);
                    }
                }
            }
            Err(e) => warn!(error = %e, "Could not check exporter liveness"),
        }
    }

    async fn tick(&mut self, shutdown: &mut ShutdownSignal) -> Result<TickOutcome> {
        let now = Local::now();

        // Phase A+B: forecast gate and proactive sizing.
        if self.forecast.current(now).is_none() {
            if let Some(outcome) = self.forecast_gate(shutdown).await? {
                return Ok(outcome);
            }
        }

        // Phase C: telemetry and health.
        let metrics = match self.telemetry.server_metrics().await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(error = %e, "Telemetry fetch failed, skipping tick");
                self.ledger
                    .telemetry_connection_failed(self.telemetry.base_url(), &e.to_string());
                counter!("control_telemetry_failures_total", 1);
                return Ok(TickOutcome::Continue);
            }
        };

        let reporting: HashSet<String> = metrics.keys().cloned().collect();
        self.state.mutate(|f| f.reconcile(&reporting)).await;
        gauge!("control_active_servers", reporting.len() as f64);

        let serving = self.state.read(|f| f.serving_addresses()).await;
        for address in &serving {
            if let Err(detail) = self.probe.check(address).await {
                return self.heal_or_replace(address, &detail, shutdown).await;
            }
        }

        // Phase D: sustained-load evaluation over servers past boot grace.
        let stable = match self.telemetry.stable_servers().await {
            Ok(stable) => stable,
            Err(e) => {
                warn!(error = %e, "Uptime query failed, using all reporting servers");
                reporting.clone()
            }
        };

        let eligible: Vec<&String> = serving.iter().filter(|a| stable.contains(*a)).collect();
        if eligible.is_empty() {
            debug!("No server past boot grace, no load sample this tick");
            return Ok(TickOutcome::Continue);
        }

        let (mut cpu_sum, mut mem_sum) = (0.0, 0.0);
        for address in &eligible {
            if let Some(m) = metrics.get(*address) {
                cpu_sum += m.cpu_pct;
                mem_sum += m.mem_pct;
            }
        }
        let n = eligible.len() as f64;
        let sample = LoadSample {
            at: now,
            cpu_pct: cpu_sum / n,
            mem_pct: mem_sum / n,
        };
        self.window.push(sample);

        let serving_count = self.state.read(|f| f.serving_count()).await;
        let signal = self.window.evaluate(
            &self.thresholds,
            self.cfg.high_load_samples(),
            self.cfg.low_load_samples(),
            serving_count,
        );

        match signal {
            ScaleSignal::Up {
                avg_cpu,
                avg_mem,
                trigger,
            } => {
                self.threshold_alerts(avg_cpu, avg_mem, &eligible, &metrics)
                    .await;
                self.reactive_scale_up(avg_cpu, avg_mem, trigger.as_str(), serving_count)
                    .await
            }
            ScaleSignal::Down { avg_cpu, avg_mem } => {
                self.ledger.low_utilization(avg_cpu, avg_mem);
                self.reactive_scale_down(avg_cpu, avg_mem, shutdown).await
            }
            ScaleSignal::None => Ok(TickOutcome::Continue),
        }
    }

    /// Phase A: refresh the forecast, reconcile state, persist the previous
    /// hour's traffic, then proactively resize. Returns `None` when the
    /// remaining phases should still run this tick.
    async fn forecast_gate(
        &mut self,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Option<TickOutcome>> {
        let now = Local::now();

        let metrics = match self.telemetry.server_metrics().await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(error = %e, "Telemetry fetch failed during forecast gate, skipping cycle");
                self.ledger
                    .telemetry_connection_failed(self.telemetry.base_url(), &e.to_string());
                return Ok(Some(TickOutcome::Continue));
            }
        };
        let reporting: HashSet<String> = metrics.keys().cloned().collect();
        self.state.mutate(|f| f.reconcile(&reporting)).await;

        // Measure the hour that just closed and feed the retraining history.
        match self.telemetry.hourly_request_count(1).await {
            Ok(requests) => {
                let hour_start = hour_floor(now - ChronoDuration::hours(1));
                info!(requests, "Measured previous hour's traffic");
                if let Ok(per_server) = self.telemetry.request_count_per_server(1).await {
                    for (address, count) in per_server {
                        debug!(address = %address, count, "Per-server request share");
                    }
                }
                if let Err(e) = self.traffic_history.append(hour_start, requests) {
                    warn!(error = %e, "Failed to persist traffic history");
                }
            }
            Err(e) => warn!(error = %e, "Could not measure previous hour's traffic"),
        }

        let predicted = match self.forecaster.predict_next_hour().await {
            Ok(ForecastOutcome::Predicted(requests)) => {
                self.retraining = false;
                Some(requests)
            }
            Ok(ForecastOutcome::Retrained { requests, metrics }) => {
                self.ledger
                    .model_retraining_complete(metrics.r2, metrics.smape, metrics.accuracy);
                self.retraining = false;
                Some(requests)
            }
            Ok(ForecastOutcome::Retraining) => {
                if !self.retraining {
                    self.ledger.model_retraining_started();
                    self.retraining = true;
                }
                match self.forecast.last() {
                    Some(entry) => info!(
                        requests = entry.requests,
                        "Traffic model retraining; continuing with last known forecast"
                    ),
                    None => info!("Traffic model retraining; skipping proactive sizing"),
                }
                None
            }
            Err(e) => {
                warn!(error = %e, "Forecast failed");
                self.ledger.forecast_failed(&e.to_string());
                None
            }
        };

        // No scaling action on a failed forecast; reactive phases still run.
        let Some(requests) = predicted else {
            return Ok(None);
        };

        if let Err(e) = self.forecast.store(requests, now) {
            warn!(error = %e, "Could not persist forecast cache");
        }
        let required = self.policy.required_servers(requests);
        info!(requests, required, "New forecast recorded");

        self.proactive_resize(required, requests, shutdown)
            .await
            .map(|outcome| match outcome {
                TickOutcome::Continue => None,
                other => Some(other),
            })
    }

    /// Phase B: power the want/have difference, small servers first up,
    /// large servers first down.
    async fn proactive_resize(
        &mut self,
        required: usize,
        predicted: u64,
        shutdown: &mut ShutdownSignal,
    ) -> Result<TickOutcome> {
        let (to_power_on, to_power_off) = self
            .state
            .read(|fleet| {
                let want: Vec<ServerDescriptor> =
                    fleet.descriptors().iter().take(required).cloned().collect();
                let want_addrs: HashSet<&String> = want.iter().map(|d| &d.address).collect();

                let on: Vec<ServerDescriptor> = want
                    .iter()
                    .filter(|d| {
                        let inactive = fleet
                            .status_of(&d.address)
                            .map(|s| !s.active)
                            .unwrap_or(false);
                        inactive && !fleet.is_blacklisted(&d.address)
                    })
                    .cloned()
                    .collect();

                let off: Vec<ServerDescriptor> = fleet
                    .descriptors()
                    .iter()
                    .rev()
                    .filter(|d| {
                        let serving = fleet
                            .status_of(&d.address)
                            .map(|s| s.active && !s.draining)
                            .unwrap_or(false);
                        serving && !want_addrs.contains(&d.address)
                    })
                    .cloned()
                    .collect();

                (on, off)
            })
            .await;

        if to_power_on.is_empty() && to_power_off.is_empty() {
            debug!("Fleet already matches the required tier");
            return Ok(TickOutcome::Continue);
        }

        let mut powered_on = false;
        for descriptor in &to_power_on {
            match self.power.power_on(&descriptor.name).await {
                Ok(()) => {
                    self.state
                        .mutate(|f| f.set_active(&descriptor.address, true))
                        .await;
                    self.ledger
                        .proactive_scale_up(&descriptor.name, &descriptor.address, predicted);
                    counter!("control_proactive_scale_ups_total", 1);
                    powered_on = true;
                }
                // A power-on failure cancels only this transition; the
                // sizing decision recurs next hour.
                Err(e) => warn!(server = %descriptor.name, error = %e, "Power-on failed"),
            }
        }

        let mut powered_off = false;
        for descriptor in &to_power_off {
            let floor_ok = self
                .state
                .read(|f| {
                    f.serving_count() > 1
                        && f.status_of(&descriptor.address)
                            .map(|s| s.active && !s.draining)
                            .unwrap_or(false)
                })
                .await;
            if !floor_ok {
                warn!(
                    server = %descriptor.name,
                    "Dropping proactive power-off: last serving server"
                );
                continue;
            }
            if self.drain_and_power_off(descriptor, shutdown).await {
                self.ledger
                    .proactive_scale_down(&descriptor.name, &descriptor.address, predicted);
                counter!("control_proactive_scale_downs_total", 1);
                powered_off = true;
            }
            if shutdown.is_triggered() {
                return Ok(TickOutcome::Continue);
            }
        }

        if powered_on || powered_off {
            self.window.reset();
        }
        if powered_on {
            return Ok(TickOutcome::Stabilize(self.cfg.stabilization()));
        }
        if powered_off {
            return Ok(TickOutcome::Stabilize(self.cfg.tick()));
        }
        Ok(TickOutcome::Continue)
    }

    /// Phase C escalation: isolate, reboot, reprobe; power off and replace
    /// from the spare pool if the reboot did not heal.
    async fn heal_or_replace(
        &mut self,
        address: &str,
        detail: &str,
        shutdown: &mut ShutdownSignal,
    ) -> Result<TickOutcome> {
        let Some(descriptor) = self
            .state
            .read(|f| f.descriptor_by_address(address).cloned())
            .await
        else {
            warn!(address, "Probe failure for unknown server");
            return Ok(TickOutcome::Continue);
        };

        warn!(server = %descriptor.name, detail, "Synthetic probe failed, isolating");
        self.ledger
            .health_check_failed(&descriptor.name, address, detail);
        counter!("control_probe_failures_total", 1);

        // Isolate immediately: drain, blacklist, publish.
        self.state
            .mutate(|f| {
                f.set_draining(address, true);
                f.blacklist_add(address);
            })
            .await;
        self.ledger.server_blacklisted(&descriptor.name, address);

        // Heal attempt: hard reboot, wait, reprobe.
        let rebooted = match self.power.restart(&descriptor.name).await {
            Ok(()) => true,
            Err(e) => {
                warn!(server = %descriptor.name, error = %e, "Reboot command failed");
                false
            }
        };

        if rebooted {
            if !shutdown.sleep(self.cfg.reboot_wait()).await {
                return Ok(TickOutcome::Continue);
            }
            if self.probe.check(address).await.is_ok() {
                info!(server = %descriptor.name, "Server healed by reboot");
                self.state
                    .mutate(|f| {
                        f.set_draining(address, false);
                        f.blacklist_remove(address);
                    })
                    .await;
                self.ledger.server_recovered(&descriptor.name, address);
                counter!("control_heals_total", 1);
                self.window.reset();
                return Ok(TickOutcome::Stabilize(self.cfg.stabilization()));
            }
            warn!(server = %descriptor.name, "Still unhealthy after reboot, replacing");
        }

        self.replace_failed(&descriptor).await;
        self.window.reset();
        Ok(TickOutcome::Stabilize(self.cfg.stabilization()))
    }

    async fn replace_failed(&mut self, failed: &ServerDescriptor) {
        match self.power.power_off(&failed.name).await {
            Ok(()) => {
                self.state
                    .mutate(|f| f.set_active(&failed.address, false))
                    .await;
            }
            // Leaving the server draining is safe: draining servers are
            // excluded from serving. The power-off recurs with the decision.
            Err(e) => warn!(server = %failed.name, error = %e, "Power-off of failed server failed"),
        }

        let replacement = self
            .state
            .read(|f| f.find_replacement(failed).cloned())
            .await;

        match replacement {
            Some(spare) => {
                self.ledger
                    .failover_initiated(&failed.name, &failed.address, &spare.name);
                match self.power.power_on(&spare.name).await {
                    Ok(()) => {
                        self.state
                            .mutate(|f| {
                                f.set_active(&spare.address, true);
                                f.blacklist_remove(&spare.address);
                            })
                            .await;
                        self.ledger
                            .failover_complete(&failed.name, &spare.name, &spare.address);
                        counter!("control_failovers_total", 1);
                    }
                    Err(e) => {
                        warn!(server = %spare.name, error = %e, "Replacement power-on failed")
                    }
                }
            }
            None => {
                warn!(server = %failed.name, "No replacement available, fleet stays smaller");
                self.ledger
                    .no_replacement_available(&failed.name, &failed.address);
            }
        }
    }

    /// Resource-threshold alerts accompanying a sustained high-load signal.
    async fn threshold_alerts(
        &self,
        avg_cpu: f64,
        avg_mem: f64,
        eligible: &[&String],
        metrics: &std::collections::HashMap<String, crate::telemetry::ServerMetrics>,
    ) {
        let single = if eligible.len() == 1 {
            let address = eligible[0].clone();
            self.state
                .read(|f| f.descriptor_by_address(&address).map(|d| d.name.clone()))
                .await
                .map(|name| (name, address))
        } else {
            None
        };

        if avg_cpu > self.thresholds.cpu_high_pct {
            match &single {
                Some((name, address)) => {
                    let current = metrics.get(address).map(|m| m.cpu_pct).unwrap_or(avg_cpu);
                    self.ledger.high_cpu(
                        current,
                        self.thresholds.cpu_high_pct,
                        1,
                        Some((name.as_str(), address.as_str())),
                    );
                }
                None => self.ledger.high_cpu(
                    avg_cpu,
                    self.thresholds.cpu_high_pct,
                    eligible.len(),
                    None,
                ),
            }
        }
        if avg_mem > self.thresholds.mem_high_pct {
            match &single {
                Some((name, address)) => {
                    let current = metrics.get(address).map(|m| m.mem_pct).unwrap_or(avg_mem);
                    self.ledger.high_memory(
                        current,
                        self.thresholds.mem_high_pct,
                        1,
                        Some((name.as_str(), address.as_str())),
                    );
                }
                None => self.ledger.high_memory(
                    avg_mem,
                    self.thresholds.mem_high_pct,
                    eligible.len(),
                    None,
                ),
            }
        }
    }

    async fn reactive_scale_up(
        &mut self,
        avg_cpu: f64,
        avg_mem: f64,
        trigger: &str,
        serving_count: usize,
    ) -> Result<TickOutcome> {
        let candidate = self.state.read(|f| f.next_to_power_on().cloned()).await;
        let Some(descriptor) = candidate else {
            warn!("Cannot scale up: every available server is already active");
            return Ok(TickOutcome::Continue);
        };

        match self.power.power_on(&descriptor.name).await {
            Ok(()) => {
                self.state
                    .mutate(|f| f.set_active(&descriptor.address, true))
                    .await;
                self.ledger.reactive_scale_up(
                    &descriptor.name,
                    &descriptor.address,
                    avg_cpu,
                    avg_mem,
                    trigger,
                    serving_count,
                );
                counter!("control_reactive_scale_ups_total", 1);
                self.window.reset();
                Ok(TickOutcome::Stabilize(self.cfg.stabilization()))
            }
            Err(e) => {
                warn!(server = %descriptor.name, error = %e, "Reactive power-on failed");
                Ok(TickOutcome::Continue)
            }
        }
    }

    async fn reactive_scale_down(
        &mut self,
        avg_cpu: f64,
        avg_mem: f64,
        shutdown: &mut ShutdownSignal,
    ) -> Result<TickOutcome> {
        let candidate = self.state.read(|f| f.next_to_power_off().cloned()).await;
        let Some(descriptor) = candidate else {
            debug!("Scale-down signal with only one serving server, nothing to do");
            return Ok(TickOutcome::Continue);
        };

        if self.drain_and_power_off(&descriptor, shutdown).await {
            self.ledger
                .reactive_scale_down(&descriptor.name, &descriptor.address, avg_cpu, avg_mem);
            counter!("control_reactive_scale_downs_total", 1);
            self.window.reset();
            return Ok(TickOutcome::Stabilize(self.cfg.tick()));
        }
        Ok(TickOutcome::Continue)
    }

    /// The draining discipline shared by proactive and reactive power-downs:
    /// mark draining and publish, let connections complete, power off,
    /// publish again. Returns `true` once the server is off.
    async fn drain_and_power_off(
        &self,
        descriptor: &ServerDescriptor,
        shutdown: &mut ShutdownSignal,
    ) -> bool {
        self.state
            .mutate(|f| f.set_draining(&descriptor.address, true))
            .await;
        self.ledger
            .draining_started(&descriptor.name, &descriptor.address);

        if !shutdown.sleep(self.cfg.drain()).await {
            // Shutdown during draining: the server stays draining, which is
            // safe because draining servers are excluded from serving.
            return false;
        }
        self.ledger
            .draining_complete(&descriptor.name, &descriptor.address);

        match self.power.power_off(&descriptor.name).await {
            Ok(()) => {
                self.state
                    .mutate(|f| f.set_active(&descriptor.address, false))
                    .await;
                self.ledger
                    .graceful_shutdown(&descriptor.name, &descriptor.address);
                true
            }
            Err(e) => {
                warn!(server = %descriptor.name, error = %e, "Power-off failed, server stays draining");
                false
            }
        }
    }
}
