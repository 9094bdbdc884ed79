//! HTTP surface: status reads, the alert ledger, and manual re-sync.
//!
//! Handlers run concurrently with the control loops but only read published
//! artefacts under a reader lock; they never mutate controller state.
//! `force-sync` re-reads the most recent artefact and invokes the publication
//! routine again.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, instrument};

use crate::alerts::{AlertCategory, AlertCounts, AlertFilter, AlertLedger, AlertRecord, AlertSeverity};
use crate::pathweights::{ArtefactPublisher, PathWeightPublication};
use crate::state::StateStore;

/// Shared read-only view for the handlers
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<StateStore>,
    pub ledger: Arc<AlertLedger>,
    pub published: Arc<RwLock<Option<PathWeightPublication>>>,
    pub publisher: Arc<ArtefactPublisher>,
}

/// Build the router with all endpoints.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/current-weights", get(current_weights))
        .route("/stats", get(stats))
        .route("/force-sync", post(force_sync))
        .route("/alerts", get(list_alerts).delete(clear_alerts))
        .route("/alerts/counts", get(alert_counts))
        .route("/alerts/:id/acknowledge", post(acknowledge_alert))
        .route("/alerts/:id", delete(delete_alert))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[instrument]
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[instrument(skip(state))]
async fn current_weights(
    State(state): State<ApiState>,
) -> Result<Json<PathWeightPublication>, StatusCode> {
    match state.published.read().await.clone() {
        Some(publication) => Ok(Json(publication)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[instrument(skip(state))]
async fn stats(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let servers = state.store.snapshot().await;
    let serving = servers
        .values()
        .filter(|s| s.active && !s.draining)
        .count();
    let weights_metadata = state
        .published
        .read()
        .await
        .as_ref()
        .map(|p| p.metadata.clone());

    Json(serde_json::json!({
        "servers": servers,
        "serving_count": serving,
        "alerts": state.ledger.counts(),
        "weights": weights_metadata,
    }))
}

#[instrument(skip(state))]
async fn force_sync(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, StatusCode> {
    let publication = match state.published.read().await.clone() {
        Some(publication) => publication,
        None => return Err(StatusCode::NOT_FOUND),
    };

    match state.publisher.publish(&publication).await {
        Ok(()) => Ok(Json(serde_json::json!({
            "synced": true,
            "iteration": publication.metadata.iteration,
        }))),
        Err(e) => {
            error!(error = %e, "Manual re-sync failed");
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    category: Option<AlertCategory>,
    severity: Option<AlertSeverity>,
    #[serde(default)]
    unacknowledged_only: bool,
    limit: Option<usize>,
}

#[instrument(skip(state))]
async fn list_alerts(
    State(state): State<ApiState>,
    Query(query): Query<AlertsQuery>,
) -> Json<Vec<AlertRecord>> {
    let filter = AlertFilter {
        category: query.category,
        severity: query.severity,
        include_acknowledged: !query.unacknowledged_only,
        limit: query.limit.or(Some(50)),
    };
    Json(state.ledger.list(&filter))
}

#[instrument(skip(state))]
async fn alert_counts(State(state): State<ApiState>) -> Json<AlertCounts> {
    Json(state.ledger.counts())
}

#[instrument(skip(state))]
async fn acknowledge_alert(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> StatusCode {
    if state.ledger.acknowledge(&id) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

#[instrument(skip(state))]
async fn delete_alert(State(state): State<ApiState>, Path(id): Path<String>) -> StatusCode {
    if state.ledger.delete(&id) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

#[instrument(skip(state))]
async fn clear_alerts(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let cleared = state.ledger.clear();
    Json(serde_json::json!({ "cleared": cleared }))
}
