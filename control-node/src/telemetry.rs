//! Metrics-store adapter: instant queries against the scrape store,
//! normalised into the shapes the controllers consume.
//!
//! Every result is a list of `{metric labels, [timestamp, value]}`; the
//! `instance` label is `address:port` and the address part keys everything.
//! A server missing from a result set is simply not reporting and is excluded
//! from decisions.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::error::{ControlError, Result};

/// Live per-server telemetry used by the scaling loop and the DWRS selector
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ServerMetrics {
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub cores: u32,
    pub total_mem_gb: f64,
}

/// One instant-query sample
#[derive(Debug, Clone)]
pub struct InstantSample {
    pub labels: HashMap<String, String>,
    pub value: f64,
}

impl InstantSample {
    /// Address part of the `instance` label
    pub fn instance_address(&self) -> Option<&str> {
        self.labels
            .get("instance")
            .map(|i| i.split(':').next().unwrap_or(i.as_str()))
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<QueryResult>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    metric: HashMap<String, String>,
    /// `[unix_timestamp, "value"]`
    value: (f64, String),
}

/// Read-only client for the metrics store
#[derive(Debug, Clone)]
pub struct MetricsClient {
    http: reqwest::Client,
    base_url: String,
    node_job: String,
    request_job: String,
    boot_grace_seconds: u64,
}

impl MetricsClient {
    pub fn new(
        base_url: String,
        query_timeout: Duration,
        node_job: String,
        request_job: String,
        boot_grace_seconds: u64,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(query_timeout)
            .build()
            .map_err(|e| ControlError::Telemetry(format!("client build failed: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            node_job,
            request_job,
            boot_grace_seconds,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run one instant query and flatten the result vector.
    pub async fn query(&self, promql: &str) -> Result<Vec<InstantSample>> {
        let url = format!("{}/api/v1/query", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("query", promql)])
            .send()
            .await
            .map_err(|e| ControlError::Telemetry(format!("query request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ControlError::Telemetry(format!(
                "query returned {}",
                response.status()
            )));
        }

        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| ControlError::Telemetry(format!("query body unreadable: {e}")))?;

        if body.status != "success" {
            return Err(ControlError::Telemetry(format!(
                "query status {}",
                body.status
            )));
        }

        let results = body.data.map(|d| d.result).unwrap_or_default();
        Ok(results
            .into_iter()
            .filter_map(|r| {
                r.value.1.parse::<f64>().ok().map(|value| InstantSample {
                    labels: r.metric,
                    value,
                })
            })
            .collect())
    }

    /// Instantaneous CPU/memory/capacity per reporting server.
    pub async fn server_metrics(&self) -> Result<HashMap<String, ServerMetrics>> {
        let cpu_query = format!(
            "avg by (instance) ((1 - irate(node_cpu_seconds_total{{job=\"{}\",mode=\"idle\"}}[5s])) * 100)",
            self.node_job
        );
        let mem_query = format!(
            "(1 - (node_memory_MemAvailable_bytes{{job=\"{job}\"}} / node_memory_MemTotal_bytes{{job=\"{job}\"}})) * 100",
            job = self.node_job
        );
        let cores_query = format!(
            "count(node_cpu_seconds_total{{job=\"{}\",mode=\"idle\"}}) by (instance)",
            self.node_job
        );
        let total_mem_query = format!("node_memory_MemTotal_bytes{{job=\"{}\"}}", self.node_job);

        let cpu = self.query(&cpu_query).await?;
        if cpu.is_empty() {
            // No server reporting CPU means no server is reporting at all.
            return Ok(HashMap::new());
        }
        let mem = self.query(&mem_query).await?;
        let cores = self.query(&cores_query).await?;
        let total_mem = self.query(&total_mem_query).await?;

        let mut metrics: HashMap<String, ServerMetrics> = HashMap::new();
        for sample in &cpu {
            if let Some(address) = sample.instance_address() {
                metrics.insert(
                    address.to_string(),
                    ServerMetrics {
                        cpu_pct: sample.value,
                        ..Default::default()
                    },
                );
            }
        }
        for sample in &mem {
            if let Some(entry) = sample
                .instance_address()
                .and_then(|a| metrics.get_mut(a))
            {
                entry.mem_pct = sample.value;
            }
        }
        for sample in &cores {
            if let Some(entry) = sample
                .instance_address()
                .and_then(|a| metrics.get_mut(a))
            {
                entry.cores = sample.value as u32;
            }
        }
        for sample in &total_mem {
            if let Some(entry) = sample
                .instance_address()
                .and_then(|a| metrics.get_mut(a))
            {
                entry.total_mem_gb = sample.value / (1024.0 * 1024.0 * 1024.0);
            }
        }

        Ok(metrics)
    }

    /// Addresses whose uptime exceeds the boot grace period. Freshly powered
    /// servers stay out of scaling decisions until they pass it.
    pub async fn stable_servers(&self) -> Result<HashSet<String>> {
        let query = format!(
            "time() - node_boot_time_seconds{{job=\"{}\"}} > {}",
            self.node_job, self.boot_grace_seconds
        );
        let samples = self.query(&query).await?;
        Ok(samples
            .iter()
            .filter_map(|s| s.instance_address().map(str::to_string))
            .collect())
    }

    /// Total HTTP requests across the fleet over the lookback window.
    /// Aggregated centrally, so it survives server power transitions.
    pub async fn hourly_request_count(&self, lookback_hours: u32) -> Result<u64> {
        let query = format!(
            "sum(increase(apache_accesses_total{{job=\"{}\"}}[{}h]))",
            self.request_job, lookback_hours
        );
        let samples = self.query(&query).await?;
        Ok(samples.first().map(|s| s.value.max(0.0) as u64).unwrap_or(0))
    }

    /// Per-server request counts over the lookback window.
    pub async fn request_count_per_server(
        &self,
        lookback_hours: u32,
    ) -> Result<HashMap<String, u64>> {
        let query = format!(
            "increase(apache_accesses_total{{job=\"{}\"}}[{}h])",
            self.request_job, lookback_hours
        );
        let samples = self.query(&query).await?;
        Ok(samples
            .iter()
            .filter_map(|s| {
                s.instance_address()
                    .map(|a| (a.to_string(), s.value.max(0.0) as u64))
            })
            .collect())
    }

    /// Liveness of the request-counting exporters.
    pub async fn exporter_up(&self) -> Result<HashMap<String, bool>> {
        let query = format!("up{{job=\"{}\"}}", self.request_job);
        let samples = self.query(&query).await?;
        Ok(samples
            .iter()
            .filter_map(|s| {
                s.instance_address()
                    .map(|a| (a.to_string(), s.value as i64 == 1))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_address_strips_port() {
        let sample = InstantSample {
            labels: HashMap::from([(
                "instance".to_string(),
                "192.168.6.2:9100".to_string(),
            )]),
            value: 1.0,
        };
        assert_eq!(sample.instance_address(), Some("192.168.6.2"));
    }

    #[test]
    fn test_instance_address_without_port() {
        let sample = InstantSample {
            labels: HashMap::from([("instance".to_string(), "192.168.6.2".to_string())]),
            value: 1.0,
        };
        assert_eq!(sample.instance_address(), Some("192.168.6.2"));
    }

    #[test]
    fn test_query_response_parsing() {
        let body = r#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"instance": "192.168.6.2:9100"}, "value": [1712000000.1, "42.5"]},
                    {"metric": {"instance": "192.168.6.3:9100"}, "value": [1712000000.1, "bogus"]}
                ]
            }
        }"#;
        let parsed: QueryResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.status, "success");
        let results = parsed.data.unwrap().result;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].value.1, "42.5");
    }
}
