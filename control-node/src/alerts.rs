//! Append-mostly alert ledger with an on-disk JSON representation.
//!
//! The ledger is the sole user-visible record of controller events. Retention
//! is enforced lazily on writes: records older than the age cap are dropped
//! and the newest `max_records` are kept. A failed ledger write is logged and
//! swallowed; the ledger must never break the controller.

use chrono::{DateTime, Duration, Local};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::fsio::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Critical,
    Warning,
    Success,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    ServerPower,
    ServerHealth,
    Model,
    Draining,
    ResourceThreshold,
    SystemTelemetry,
    NetworkPath,
}

/// One categorised event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub severity: AlertSeverity,
    pub category: AlertCategory,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Local>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ip: Option<String>,
    #[serde(default)]
    pub additional_data: serde_json::Value,
    #[serde(default)]
    pub acknowledged: bool,
}

/// On-disk representation: `{alerts: [...], last_cleanup: ...}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerFile {
    alerts: Vec<AlertRecord>,
    #[serde(default)]
    last_cleanup: Option<DateTime<Local>>,
}

/// Filter for [`AlertLedger::list`]
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub category: Option<AlertCategory>,
    pub severity: Option<AlertSeverity>,
    pub include_acknowledged: bool,
    pub limit: Option<usize>,
}

impl AlertFilter {
    pub fn all() -> Self {
        Self {
            include_acknowledged: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertCounts {
    pub total: usize,
    pub critical: usize,
    pub warning: usize,
    pub success: usize,
    pub info: usize,
    pub unacknowledged: usize,
}

pub struct AlertLedger {
    path: PathBuf,
    max_records: usize,
    retention: Duration,
    inner: Mutex<LedgerFile>,
}

impl AlertLedger {
    /// Open the ledger, loading any existing file. A corrupt or missing file
    /// starts an empty ledger rather than failing the controller.
    pub fn open(path: PathBuf, max_records: usize, retention_hours: i64) -> Self {
        let inner = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                error!(error = %e, path = %path.display(), "Ledger file unreadable, starting empty");
                LedgerFile::default()
            }),
            Err(_) => LedgerFile::default(),
        };

        Self {
            path,
            max_records,
            retention: Duration::hours(retention_hours),
            inner: Mutex::new(inner),
        }
    }

    /// Append a record, enforce retention, persist. Returns the alert id.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &self,
        severity: AlertSeverity,
        category: AlertCategory,
        title: &str,
        message: String,
        server_name: Option<&str>,
        server_ip: Option<&str>,
        additional_data: serde_json::Value,
    ) -> String {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(8);

        let record = AlertRecord {
            id: id.clone(),
            severity,
            category,
            title: title.to_string(),
            message,
            timestamp: Local::now(),
            server_name: server_name.map(str::to_string),
            server_ip: server_ip.map(str::to_string),
            additional_data,
            acknowledged: false,
        };

        let mut file = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        // Most recent first
        file.alerts.insert(0, record);
        self.cleanup(&mut file);
        self.persist(&file);

        info!(alert_id = %id, title = title, severity = ?severity, "Alert recorded");
        id
    }

    fn cleanup(&self, file: &mut LedgerFile) {
        let cutoff = Local::now() - self.retention;
        let before = file.alerts.len();
        file.alerts.retain(|a| a.timestamp > cutoff);
        if file.alerts.len() > self.max_records {
            file.alerts.truncate(self.max_records);
        }
        let removed = before - file.alerts.len();
        if removed > 0 {
            debug!(removed, "Dropped alerts past retention");
        }
        file.last_cleanup = Some(Local::now());
    }

    fn persist(&self, file: &LedgerFile) {
        match serde_json::to_vec_pretty(file) {
            Ok(bytes) => {
                if let Err(e) = write_atomic(&self.path, &bytes) {
                    error!(error = %e, path = %self.path.display(), "Failed to persist alert ledger");
                }
            }
            Err(e) => error!(error = %e, "Failed to serialize alert ledger"),
        }
    }

    pub fn list(&self, filter: &AlertFilter) -> Vec<AlertRecord> {
        let file = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let iter = file.alerts.iter().filter(|a| {
            filter.category.map(|c| a.category == c).unwrap_or(true)
                && filter.severity.map(|s| a.severity == s).unwrap_or(true)
                && (filter.include_acknowledged || !a.acknowledged)
        });
        match filter.limit {
            Some(limit) => iter.take(limit).cloned().collect(),
            None => iter.cloned().collect(),
        }
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        let mut file = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let found = match file.alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        };
        if found {
            self.persist(&file);
        }
        found
    }

    pub fn delete(&self, id: &str) -> bool {
        let mut file = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = file.alerts.len();
        file.alerts.retain(|a| a.id != id);
        let deleted = file.alerts.len() < before;
        if deleted {
            self.persist(&file);
        }
        deleted
    }

    pub fn clear(&self) -> usize {
        let mut file = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let count = file.alerts.len();
        file.alerts.clear();
        file.last_cleanup = Some(Local::now());
        self.persist(&file);
        count
    }

    pub fn counts(&self) -> AlertCounts {
        let file = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut counts = AlertCounts {
            total: file.alerts.len(),
            critical: 0,
            warning: 0,
            success: 0,
            info: 0,
            unacknowledged: 0,
        };
        for alert in &file.alerts {
            match alert.severity {
                AlertSeverity::Critical => counts.critical += 1,
                AlertSeverity::Warning => counts.warning += 1,
                AlertSeverity::Success => counts.success += 1,
                AlertSeverity::Info => counts.info += 1,
            }
            if !alert.acknowledged {
                counts.unacknowledged += 1;
            }
        }
        counts
    }

    // --- Event catalogue ------------------------------------------------
    // Thin constructors so call sites in the controllers stay one line.

    pub fn proactive_scale_up(&self, name: &str, ip: &str, predicted: u64) {
        self.add(
            AlertSeverity::Info,
            AlertCategory::ServerPower,
            "Proactive Scale-Up",
            format!("Powered on {name} for a forecast of {predicted} requests/hour"),
            Some(name),
            Some(ip),
            json!({ "predicted_requests": predicted }),
        );
    }

    pub fn proactive_scale_down(&self, name: &str, ip: &str, predicted: u64) {
        self.add(
            AlertSeverity::Info,
            AlertCategory::ServerPower,
            "Proactive Scale-Down",
            format!("Powered off {name}; forecast of {predicted} requests/hour needs fewer servers"),
            Some(name),
            Some(ip),
            json!({ "predicted_requests": predicted }),
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn reactive_scale_up(
        &self,
        name: &str,
        ip: &str,
        avg_cpu: f64,
        avg_mem: f64,
        threshold_type: &str,
        serving: usize,
    ) {
        self.add(
            AlertSeverity::Warning,
            AlertCategory::ServerPower,
            "Reactive Scale-Up",
            format!(
                "Sustained high load (cpu {avg_cpu:.1}%, mem {avg_mem:.1}% across {serving} server(s)); powering on {name}"
            ),
            Some(name),
            Some(ip),
            json!({ "avg_cpu": avg_cpu, "avg_mem": avg_mem, "threshold_type": threshold_type }),
        );
    }

    pub fn reactive_scale_down(&self, name: &str, ip: &str, avg_cpu: f64, avg_mem: f64) {
        self.add(
            AlertSeverity::Info,
            AlertCategory::ServerPower,
            "Reactive Scale-Down",
            format!(
                "Sustained low load (cpu {avg_cpu:.1}%, mem {avg_mem:.1}%); powered off {name}"
            ),
            Some(name),
            Some(ip),
            json!({ "avg_cpu": avg_cpu, "avg_mem": avg_mem }),
        );
    }

    pub fn health_check_failed(&self, name: &str, ip: &str, detail: &str) {
        self.add(
            AlertSeverity::Critical,
            AlertCategory::ServerHealth,
            "Health Check Failed",
            format!("Synthetic probe against {name} failed: {detail}"),
            Some(name),
            Some(ip),
            serde_json::Value::Null,
        );
    }

    pub fn server_blacklisted(&self, name: &str, ip: &str) {
        self.add(
            AlertSeverity::Warning,
            AlertCategory::ServerHealth,
            "Server Blacklisted",
            format!("{name} excluded from selection until it passes a probe"),
            Some(name),
            Some(ip),
            serde_json::Value::Null,
        );
    }

    pub fn server_recovered(&self, name: &str, ip: &str) {
        self.add(
            AlertSeverity::Success,
            AlertCategory::ServerHealth,
            "Server Recovered",
            format!("{name} healthy again after reboot"),
            Some(name),
            Some(ip),
            serde_json::Value::Null,
        );
    }

    pub fn failover_initiated(&self, failed: &str, ip: &str, replacement: &str) {
        self.add(
            AlertSeverity::Critical,
            AlertCategory::ServerHealth,
            "Failover Initiated",
            format!("Replacing failed server {failed} with {replacement}"),
            Some(failed),
            Some(ip),
            json!({ "replacement": replacement }),
        );
    }

    pub fn failover_complete(&self, failed: &str, replacement: &str, ip: &str) {
        self.add(
            AlertSeverity::Success,
            AlertCategory::ServerHealth,
            "Failover Complete",
            format!("{replacement} activated in place of {failed}"),
            Some(replacement),
            Some(ip),
            json!({ "failed_server": failed }),
        );
    }

    pub fn no_replacement_available(&self, name: &str, ip: &str) {
        self.add(
            AlertSeverity::Critical,
            AlertCategory::ServerHealth,
            "No Replacement Available",
            format!("No healthy spare meets the capacity of failed server {name}"),
            Some(name),
            Some(ip),
            serde_json::Value::Null,
        );
    }

    pub fn draining_started(&self, name: &str, ip: &str) {
        self.add(
            AlertSeverity::Info,
            AlertCategory::Draining,
            "Connection Draining Started",
            format!("{name} excluded from new flows, waiting for connections to complete"),
            Some(name),
            Some(ip),
            serde_json::Value::Null,
        );
    }

    pub fn draining_complete(&self, name: &str, ip: &str) {
        self.add(
            AlertSeverity::Info,
            AlertCategory::Draining,
            "Connection Draining Complete",
            format!("{name} finished draining"),
            Some(name),
            Some(ip),
            serde_json::Value::Null,
        );
    }

    pub fn graceful_shutdown(&self, name: &str, ip: &str) {
        self.add(
            AlertSeverity::Success,
            AlertCategory::Draining,
            "Graceful Shutdown",
            format!("{name} powered off after draining"),
            Some(name),
            Some(ip),
            serde_json::Value::Null,
        );
    }

    pub fn high_cpu(&self, avg: f64, threshold: f64, serving: usize, server: Option<(&str, &str)>) {
        let message = match server {
            Some((name, _)) => {
                format!("CPU at {avg:.1}% on {name} (threshold {threshold:.0}%)")
            }
            None => format!(
                "Average CPU at {avg:.1}% across {serving} servers (threshold {threshold:.0}%)"
            ),
        };
        self.add(
            AlertSeverity::Warning,
            AlertCategory::ResourceThreshold,
            "High CPU Usage",
            message,
            server.map(|(n, _)| n),
            server.map(|(_, ip)| ip),
            json!({ "average": avg, "threshold": threshold }),
        );
    }

    pub fn high_memory(
        &self,
        avg: f64,
        threshold: f64,
        serving: usize,
        server: Option<(&str, &str)>,
    ) {
        let message = match server {
            Some((name, _)) => {
                format!("Memory at {avg:.1}% on {name} (threshold {threshold:.0}%)")
            }
            None => format!(
                "Average memory at {avg:.1}% across {serving} servers (threshold {threshold:.0}%)"
            ),
        };
        self.add(
            AlertSeverity::Warning,
            AlertCategory::ResourceThreshold,
            "High Memory Usage",
            message,
            server.map(|(n, _)| n),
            server.map(|(_, ip)| ip),
            json!({ "average": avg, "threshold": threshold }),
        );
    }

    pub fn low_utilization(&self, avg_cpu: f64, avg_mem: f64) {
        self.add(
            AlertSeverity::Info,
            AlertCategory::ResourceThreshold,
            "Low Utilization",
            format!("30-minute averages cpu {avg_cpu:.1}%, mem {avg_mem:.1}%; scale-down candidate"),
            None,
            None,
            json!({ "avg_cpu": avg_cpu, "avg_mem": avg_mem }),
        );
    }

    pub fn forecast_failed(&self, detail: &str) {
        self.add(
            AlertSeverity::Warning,
            AlertCategory::Model,
            "Forecast Failed",
            format!("Traffic forecast unavailable: {detail}"),
            None,
            None,
            serde_json::Value::Null,
        );
    }

    pub fn model_retraining_started(&self) {
        self.add(
            AlertSeverity::Info,
            AlertCategory::Model,
            "Model Retraining Started",
            "Traffic model is retraining for the current week".to_string(),
            None,
            None,
            serde_json::Value::Null,
        );
    }

    pub fn model_retraining_complete(&self, r2: f64, smape: f64, accuracy: f64) {
        self.add(
            AlertSeverity::Success,
            AlertCategory::Model,
            "Model Retraining Complete",
            format!("Traffic model retrained (R² {r2:.3}, SMAPE {smape:.2}%, accuracy {accuracy:.2}%)"),
            None,
            None,
            json!({ "r2": r2, "smape": smape, "accuracy": accuracy }),
        );
    }

    pub fn telemetry_connection_failed(&self, url: &str, detail: &str) {
        self.add(
            AlertSeverity::Critical,
            AlertCategory::SystemTelemetry,
            "Metrics Store Unreachable",
            format!("Query against {url} failed: {detail}"),
            None,
            None,
            serde_json::Value::Null,
        );
    }

    pub fn sdn_connection_failed(&self, url: &str, detail: &str) {
        self.add(
            AlertSeverity::Critical,
            AlertCategory::SystemTelemetry,
            "SDN Controller Unreachable",
            format!("Port statistics request against {url} failed: {detail}"),
            None,
            None,
            serde_json::Value::Null,
        );
    }

    pub fn exporter_down(&self, ip: &str) {
        self.add(
            AlertSeverity::Warning,
            AlertCategory::SystemTelemetry,
            "Request Exporter Down",
            format!("Request-count exporter on {ip} is not reporting"),
            None,
            Some(ip),
            serde_json::Value::Null,
        );
    }

    pub fn status_sync_failed(&self, detail: &str) {
        self.add(
            AlertSeverity::Warning,
            AlertCategory::SystemTelemetry,
            "Status Sync Failed",
            format!("Could not copy server status to the front node: {detail}"),
            None,
            None,
            serde_json::Value::Null,
        );
    }

    pub fn publication_failed(&self, detail: &str) {
        self.add(
            AlertSeverity::Warning,
            AlertCategory::NetworkPath,
            "Path Weight Publication Failed",
            format!("Could not deliver path-selection weights: {detail}"),
            None,
            None,
            serde_json::Value::Null,
        );
    }

    pub fn high_path_congestion(&self, route: &str, total_mb: f64, threshold_mb: f64) {
        self.add(
            AlertSeverity::Warning,
            AlertCategory::NetworkPath,
            "High Path Congestion",
            format!("Route {route} carried {total_mb:.1} MB this interval (threshold {threshold_mb:.0} MB)"),
            None,
            None,
            json!({ "route": route, "total_mb": total_mb, "threshold_mb": threshold_mb }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ledger(dir: &tempfile::TempDir) -> AlertLedger {
        AlertLedger::open(dir.path().join("system_alerts.json"), 100, 24)
    }

    #[test]
    fn test_add_and_list_most_recent_first() {
        let dir = tempdir().unwrap();
        let ledger = ledger(&dir);

        ledger.forecast_failed("first");
        ledger.forecast_failed("second");

        let alerts = ledger.list(&AlertFilter::all());
        assert_eq!(alerts.len(), 2);
        assert!(alerts[0].message.contains("second"));
    }

    #[test]
    fn test_count_cap_keeps_newest() {
        let dir = tempdir().unwrap();
        let ledger = AlertLedger::open(dir.path().join("alerts.json"), 5, 24);

        for i in 0..8 {
            ledger.forecast_failed(&format!("event {i}"));
        }

        let alerts = ledger.list(&AlertFilter::all());
        assert_eq!(alerts.len(), 5);
        assert!(alerts[0].message.contains("event 7"));
        assert!(alerts[4].message.contains("event 3"));
    }

    #[test]
    fn test_acknowledge_and_counts() {
        let dir = tempdir().unwrap();
        let ledger = ledger(&dir);

        let id = ledger.add(
            AlertSeverity::Critical,
            AlertCategory::ServerHealth,
            "Health Check Failed",
            "probe timed out".to_string(),
            Some("apache-vm-1"),
            Some("192.168.6.3"),
            serde_json::Value::Null,
        );
        ledger.forecast_failed("stale model");

        assert!(ledger.acknowledge(&id));
        assert!(!ledger.acknowledge("missing"));

        let counts = ledger.counts();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.critical, 1);
        assert_eq!(counts.warning, 1);
        assert_eq!(counts.unacknowledged, 1);
    }

    #[test]
    fn test_filters() {
        let dir = tempdir().unwrap();
        let ledger = ledger(&dir);

        ledger.draining_started("apache-vm-1", "192.168.6.3");
        ledger.forecast_failed("no data");

        let drains = ledger.list(&AlertFilter {
            category: Some(AlertCategory::Draining),
            ..AlertFilter::all()
        });
        assert_eq!(drains.len(), 1);

        let warnings = ledger.list(&AlertFilter {
            severity: Some(AlertSeverity::Warning),
            ..AlertFilter::all()
        });
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("no data"));
    }

    #[test]
    fn test_delete_and_clear() {
        let dir = tempdir().unwrap();
        let ledger = ledger(&dir);

        let id = ledger.add(
            AlertSeverity::Info,
            AlertCategory::ServerPower,
            "Proactive Scale-Up",
            "test".to_string(),
            None,
            None,
            serde_json::Value::Null,
        );
        ledger.forecast_failed("x");

        assert!(ledger.delete(&id));
        assert_eq!(ledger.counts().total, 1);
        assert_eq!(ledger.clear(), 1);
        assert_eq!(ledger.counts().total, 0);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alerts.json");
        {
            let ledger = AlertLedger::open(path.clone(), 100, 24);
            ledger.server_recovered("apache-vm-1", "192.168.6.3");
        }
        let reopened = AlertLedger::open(path, 100, 24);
        let alerts = reopened.list(&AlertFilter::all());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].server_ip.as_deref(), Some("192.168.6.3"));
    }
}
