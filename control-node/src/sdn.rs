//! SDN controller adapter: cumulative port statistics over the controller's
//! REST surface with basic auth.

use chrono::Local;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{ControlError, Result};
use crate::usage::{PortCounterSnapshot, PortCounters};

#[derive(Debug, Deserialize)]
struct PortStatisticsResponse {
    #[serde(default)]
    statistics: Vec<DeviceStatistics>,
}

#[derive(Debug, Deserialize)]
struct DeviceStatistics {
    device: String,
    #[serde(default)]
    ports: Vec<PortStatistics>,
}

#[derive(Debug, Deserialize)]
struct PortStatistics {
    port: serde_json::Value,
    #[serde(rename = "bytesSent", default)]
    bytes_sent: u64,
    #[serde(rename = "bytesReceived", default)]
    bytes_received: u64,
}

impl PortStatistics {
    /// Ports are numeric in practice but the controller also reports
    /// pseudo-ports such as "local"; those carry no path traffic.
    fn port_number(&self) -> Option<u32> {
        match &self.port {
            serde_json::Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Read/write client for the SDN controller; the control plane only reads.
#[derive(Debug, Clone)]
pub struct SdnClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl SdnClient {
    pub fn new(
        base_url: String,
        username: String,
        password: String,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ControlError::Sdn(format!("client build failed: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch cumulative port counters for every device.
    pub async fn port_counters(&self) -> Result<PortCounterSnapshot> {
        let url = format!("{}/onos/v1/statistics/ports", self.base_url);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| ControlError::Sdn(format!("statistics request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ControlError::Sdn(format!(
                "statistics returned {}",
                response.status()
            )));
        }

        let body: PortStatisticsResponse = response
            .json()
            .await
            .map_err(|e| ControlError::Sdn(format!("statistics body unreadable: {e}")))?;

        let mut devices: HashMap<String, HashMap<u32, PortCounters>> = HashMap::new();
        for device in body.statistics {
            let ports = devices.entry(device.device).or_default();
            for port in device.ports {
                if let Some(number) = port.port_number() {
                    ports.insert(
                        number,
                        PortCounters {
                            bytes_sent: port.bytes_sent,
                            bytes_received: port.bytes_received,
                        },
                    );
                }
            }
        }

        Ok(PortCounterSnapshot {
            taken_at: Local::now(),
            devices,
        })
    }
}
