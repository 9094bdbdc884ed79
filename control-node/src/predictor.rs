//! Narrow predictor collaborators. The neural models are opaque to the core:
//! the traffic forecaster answers "requests next hour", the path predictor
//! answers "bytes next minute for this canonical path". Retraining is the
//! predictor's own concern; the core only records its progress.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{ControlError, Result};
use crate::forecast::ModelMetrics;

/// Outcome of asking the traffic forecaster for the next hour
#[derive(Debug, Clone, Copy)]
pub enum ForecastOutcome {
    /// A usable prediction
    Predicted(u64),
    /// The model is retraining; no fresh prediction yet
    Retraining,
    /// Retraining just finished; prediction plus accuracy metrics
    Retrained {
        requests: u64,
        metrics: ModelMetrics,
    },
}

#[async_trait]
pub trait TrafficForecaster: Send + Sync {
    async fn predict_next_hour(&self) -> Result<ForecastOutcome>;
}

#[async_trait]
pub trait PathPredictor: Send + Sync {
    /// One-step-ahead byte estimate for a canonical path. `None` means the
    /// model has no answer yet (warmup), which is an expected condition, not
    /// an error.
    async fn predict(&self, path: &str) -> Result<Option<u64>>;

    /// Ask the service to preload its models.
    async fn warmup(&self) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct TrafficPredictionBody {
    status: String,
    #[serde(default)]
    requests: Option<u64>,
    #[serde(default)]
    r2: Option<f64>,
    #[serde(default)]
    smape: Option<f64>,
    #[serde(default)]
    accuracy: Option<f64>,
}

/// HTTP-backed traffic forecaster
#[derive(Debug, Clone)]
pub struct HttpTrafficForecaster {
    http: reqwest::Client,
    base_url: String,
}

impl HttpTrafficForecaster {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ControlError::Predictor(format!("client build failed: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TrafficForecaster for HttpTrafficForecaster {
    async fn predict_next_hour(&self) -> Result<ForecastOutcome> {
        let url = format!("{}/predict", self.base_url);
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| ControlError::Predictor(format!("forecast request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ControlError::Predictor(format!(
                "forecast returned {}",
                response.status()
            )));
        }

        let body: TrafficPredictionBody = response
            .json()
            .await
            .map_err(|e| ControlError::Predictor(format!("forecast body unreadable: {e}")))?;

        match body.status.as_str() {
            "retraining" => Ok(ForecastOutcome::Retraining),
            "retrained" => {
                let requests = body.requests.ok_or_else(|| {
                    ControlError::Predictor("retrained response missing requests".to_string())
                })?;
                match (body.r2, body.smape, body.accuracy) {
                    (Some(r2), Some(smape), Some(accuracy)) => Ok(ForecastOutcome::Retrained {
                        requests,
                        metrics: ModelMetrics {
                            r2,
                            smape,
                            accuracy,
                        },
                    }),
                    _ => Ok(ForecastOutcome::Predicted(requests)),
                }
            }
            "ok" => body
                .requests
                .map(ForecastOutcome::Predicted)
                .ok_or_else(|| {
                    ControlError::Predictor("ok response missing requests".to_string())
                }),
            other => Err(ControlError::Predictor(format!(
                "unexpected forecast status {other}"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PathPredictionBody {
    #[serde(default)]
    bytes: Option<u64>,
    #[serde(default)]
    warming_up: bool,
}

/// HTTP-backed per-path predictor
#[derive(Debug, Clone)]
pub struct HttpPathPredictor {
    http: reqwest::Client,
    base_url: String,
}

impl HttpPathPredictor {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ControlError::Predictor(format!("client build failed: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PathPredictor for HttpPathPredictor {
    async fn predict(&self, path: &str) -> Result<Option<u64>> {
        let url = format!("{}/predict/{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ControlError::Predictor(format!("path prediction failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ControlError::Predictor(format!(
                "path prediction returned {}",
                response.status()
            )));
        }

        let body: PathPredictionBody = response
            .json()
            .await
            .map_err(|e| ControlError::Predictor(format!("prediction body unreadable: {e}")))?;

        if body.warming_up {
            return Ok(None);
        }
        Ok(body.bytes)
    }

    async fn warmup(&self) -> Result<()> {
        let url = format!("{}/warmup", self.base_url);
        self.http
            .post(&url)
            .send()
            .await
            .map_err(|e| ControlError::Predictor(format!("warmup request failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traffic_body_parsing() {
        let ok: TrafficPredictionBody =
            serde_json::from_str(r#"{"status":"ok","requests":250000}"#).unwrap();
        assert_eq!(ok.requests, Some(250_000));

        let retraining: TrafficPredictionBody =
            serde_json::from_str(r#"{"status":"retraining"}"#).unwrap();
        assert_eq!(retraining.status, "retraining");

        let retrained: TrafficPredictionBody = serde_json::from_str(
            r#"{"status":"retrained","requests":90000,"r2":0.91,"smape":12.5,"accuracy":93.75}"#,
        )
        .unwrap();
        assert_eq!(retrained.accuracy, Some(93.75));
    }

    #[test]
    fn test_path_body_parsing() {
        let warm: PathPredictionBody =
            serde_json::from_str(r#"{"bytes":1048576,"warming_up":false}"#).unwrap();
        assert_eq!(warm.bytes, Some(1_048_576));
        assert!(!warm.warming_up);

        let cold: PathPredictionBody = serde_json::from_str(r#"{"warming_up":true}"#).unwrap();
        assert!(cold.warming_up);
    }
}
