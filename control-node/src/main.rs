use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use control_node::alerts::AlertLedger;
use control_node::api::{self, ApiState};
use control_node::config::{ControlConfig, WeightMode};
use control_node::forecast::{ForecastCache, TierPolicy, TrafficHistory};
use control_node::pathweights::{
    ArtefactPublisher, PathBandwidthLog, PathHistoryStore, PathWeightController,
};
use control_node::power::PowerController;
use control_node::predictor::{HttpPathPredictor, HttpTrafficForecaster, PathPredictor};
use control_node::remote::RemoteCopier;
use control_node::scaling::{HealthProbe, ScalingController};
use control_node::sdn::SdnClient;
use control_node::shutdown::shutdown_channel;
use control_node::state::StateStore;
use control_node::telemetry::MetricsClient;
use control_node::topology::PathTopology;

const DEFAULT_CONFIG_PATH: &str = "config/control.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;

    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("control_node={}", config.logging.level).into()),
        )
        .with_target(false)
        .with_line_number(true)
        .init();

    info!(
        "Starting control node v{} - scaling and path-weight control plane",
        env!("CARGO_PKG_VERSION")
    );

    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Configuration rejected")?;

    if config.api.metrics_enabled {
        let addr = config
            .api
            .metrics_listen_addr()
            .map_err(|e| anyhow::anyhow!(e))?;
        if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
        {
            warn!(error = %e, "Could not start metrics exporter, continuing without");
        } else {
            info!(metrics_addr = %addr, "Metrics exporter started");
        }
    }

    let ledger = Arc::new(AlertLedger::open(
        config.alerts.file.clone(),
        config.alerts.max_records,
        config.alerts.retention_hours,
    ));

    // Shared server state, restored from the persisted status file.
    let status_copier = RemoteCopier::from_config(&config.sync.remote);
    let store = Arc::new(StateStore::open(
        config.servers.clone(),
        config.sync.status_file.clone(),
        status_copier,
        ledger.clone(),
    ));

    // Scaling loop collaborators.
    let telemetry = MetricsClient::new(
        config.telemetry.url.clone(),
        Duration::from_secs(config.telemetry.query_timeout_seconds),
        config.telemetry.node_job.clone(),
        config.telemetry.request_job.clone(),
        config.telemetry.boot_grace_seconds,
    )
    .map_err(|e| anyhow::anyhow!(e))?;
    let power = PowerController::new(
        config.power.command.clone(),
        config.power.args.clone(),
        Duration::from_secs(config.power.command_timeout_seconds),
        Duration::from_secs(config.power.restart_gap_seconds),
    );
    let probe = HealthProbe::new(
        Duration::from_secs(config.scaling.probe_timeout_seconds),
        config.scaling.probe_port,
        config.scaling.probe_path.clone(),
    )
    .map_err(|e| anyhow::anyhow!(e))?;
    let forecaster = Arc::new(
        HttpTrafficForecaster::new(
            config.forecast.predictor_url.clone(),
            Duration::from_secs(config.forecast.timeout_seconds),
        )
        .map_err(|e| anyhow::anyhow!(e))?,
    );
    let forecast_cache = ForecastCache::load(config.forecast.cache_file.clone());
    let traffic_history = TrafficHistory::new(config.forecast.traffic_history_file.clone());
    let policy = TierPolicy::new(config.tiers.clone()).map_err(|e| anyhow::anyhow!(e))?;

    let scaling = ScalingController::new(
        config.scaling.clone(),
        policy,
        telemetry,
        power,
        probe,
        store.clone(),
        ledger.clone(),
        forecaster,
        forecast_cache,
        traffic_history,
    );

    // Path-weight loop collaborators.
    let topology =
        PathTopology::from_config(&config.topology).map_err(|e| anyhow::anyhow!(e))?;
    let sdn = SdnClient::new(
        config.sdn.url.clone(),
        config.sdn.username.clone(),
        config.sdn.password.clone(),
        Duration::from_secs(config.sdn.timeout_seconds),
    )
    .map_err(|e| anyhow::anyhow!(e))?;
    let path_predictor: Option<Arc<dyn PathPredictor>> = match (
        config.path_weights.mode,
        &config.path_weights.predictor_url,
    ) {
        (WeightMode::Real, _) => None,
        (_, Some(url)) => Some(Arc::new(
            HttpPathPredictor::new(
                url.clone(),
                Duration::from_secs(config.path_weights.predictor_timeout_seconds),
            )
            .map_err(|e| anyhow::anyhow!(e))?,
        )),
        (_, None) => None,
    };
    let history = PathHistoryStore::load(
        config.path_weights.history_file.clone(),
        config.path_weights.min_history_iterations,
        &topology.canonical_names(),
    );
    let bandwidth_log = PathBandwidthLog::new(config.path_weights.bandwidth_log_file.clone());
    let artefact_copier = RemoteCopier::from_config(&config.path_weights.remote);
    let publisher = Arc::new(ArtefactPublisher::new(
        config.path_weights.artefact_file.clone(),
        artefact_copier,
        ledger.clone(),
    ));
    let published = Arc::new(RwLock::new(None));

    let path_weights = PathWeightController::new(
        topology,
        sdn,
        path_predictor,
        config.path_weights.mode,
        config.path_weights.hybrid_prediction_weight,
        config.path_weights.min_history_iterations,
        Duration::from_secs(config.path_weights.collection_interval_seconds),
        config.path_weights.congestion_threshold_mb,
        history,
        bandwidth_log,
        publisher.clone(),
        published.clone(),
        ledger.clone(),
    );

    // Spawn both loops with a shared cooperative shutdown.
    let (shutdown_handle, scaling_signal) = shutdown_channel();
    let path_signal = shutdown_handle.subscribe();

    let scaling_task = tokio::spawn(scaling.run(scaling_signal));
    let path_task = tokio::spawn(path_weights.run(path_signal));

    // HTTP surface.
    let api_state = ApiState {
        store: store.clone(),
        ledger: ledger.clone(),
        published,
        publisher,
    };
    let app = api::router(api_state);
    let listen_addr = config.api.listen_addr().map_err(|e| anyhow::anyhow!(e))?;
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {listen_addr}"))?;
    info!(listen_addr = %listen_addr, "Starting HTTP surface");

    let server = axum::serve(listener, app).with_graceful_shutdown(wait_for_signal());

    if let Err(e) = server.await {
        error!(error = %e, "HTTP surface error");
    }

    // Drain both loops.
    info!("Shutdown requested, draining control loops");
    shutdown_handle.trigger();
    let _ = scaling_task.await;
    let _ = path_task.await;

    info!("Control node stopped");
    Ok(())
}

fn load_config() -> Result<ControlConfig> {
    match std::env::args().nth(1) {
        Some(path) => ControlConfig::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {path}")),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            ControlConfig::from_file(DEFAULT_CONFIG_PATH)
                .with_context(|| format!("Failed to load {DEFAULT_CONFIG_PATH}"))
        }
        None => Ok(ControlConfig::default()),
    }
}

/// SIGINT or SIGTERM drains both loops.
async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
