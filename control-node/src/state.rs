//! Owner of the authoritative server runtime state.
//!
//! A single mutex guards the fleet; every mutation publishes while still
//! holding it, so the on-disk file and the front node always observe
//! mutations in the order they happened. Remote delivery is best-effort:
//! failure raises an alert but never blocks the local mutation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::alerts::AlertLedger;
use crate::error::Result;
use crate::fleet::{FleetState, ServerDescriptor, ServerStatus};
use crate::fsio::write_atomic;
use crate::remote::RemoteCopier;

pub struct StateStore {
    fleet: Mutex<FleetState>,
    status_path: PathBuf,
    copier: Option<RemoteCopier>,
    ledger: Arc<AlertLedger>,
}

impl StateStore {
    /// Build the store, restoring persisted flags. Servers recorded unhealthy
    /// enter the blacklist before the first reconciliation.
    pub fn open(
        descriptors: Vec<ServerDescriptor>,
        status_path: PathBuf,
        copier: Option<RemoteCopier>,
        ledger: Arc<AlertLedger>,
    ) -> Self {
        let mut fleet = FleetState::new(descriptors);

        if let Ok(bytes) = std::fs::read(&status_path) {
            match serde_json::from_slice::<BTreeMap<String, ServerStatus>>(&bytes) {
                Ok(snapshot) => {
                    fleet.restore(&snapshot);
                    let blacklisted = fleet.blacklist().len();
                    if blacklisted > 0 {
                        info!(blacklisted, "Seeded blacklist from persisted status");
                    }
                }
                Err(e) => warn!(error = %e, "Persisted status unreadable, starting fresh"),
            }
        }

        Self {
            fleet: Mutex::new(fleet),
            status_path,
            copier,
            ledger,
        }
    }

    /// Apply a mutation and publish the resulting state before releasing the
    /// lock. Returns whatever the mutation closure returns.
    pub async fn mutate<T>(&self, f: impl FnOnce(&mut FleetState) -> T) -> T {
        let mut fleet = self.fleet.lock().await;
        let out = f(&mut fleet);
        self.publish_locked(&fleet).await;
        out
    }

    /// Read-only access without publication.
    pub async fn read<T>(&self, f: impl FnOnce(&FleetState) -> T) -> T {
        let fleet = self.fleet.lock().await;
        f(&fleet)
    }

    /// Current snapshot for the HTTP surface.
    pub async fn snapshot(&self) -> BTreeMap<String, ServerStatus> {
        self.fleet.lock().await.snapshot()
    }

    /// Re-publish the current state unchanged. Publication is idempotent.
    pub async fn republish(&self) {
        let fleet = self.fleet.lock().await;
        self.publish_locked(&fleet).await;
    }

    async fn publish_locked(&self, fleet: &FleetState) {
        if let Err(e) = self.write_local(fleet) {
            warn!(error = %e, "Failed to write server status file");
            self.ledger.status_sync_failed(&e.to_string());
            return;
        }

        if let Some(copier) = &self.copier {
            if let Err(e) = copier.copy(&self.status_path).await {
                warn!(error = %e, "Failed to copy server status to front node");
                self.ledger.status_sync_failed(&e.to_string());
            }
        }
    }

    fn write_local(&self, fleet: &FleetState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&fleet.snapshot())?;
        write_atomic(&self.status_path, &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::ServerCapacity;
    use tempfile::tempdir;

    fn descriptors() -> Vec<ServerDescriptor> {
        vec![
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
        ]
    }

    fn ledger(dir: &tempfile::TempDir) -> Arc<AlertLedger> {
        Arc::new(AlertLedger::open(dir.path().join("alerts.json"), 100, 24))
    }

    #[tokio::test]
    async fn test_mutation_publishes_matching_file() {
        let dir = tempdir().unwrap();
        let status_path = dir.path().join("active_servers_status.json");
        let store = StateStore::open(descriptors(), status_path.clone(), None, ledger(&dir));

        store
            .mutate(|fleet| fleet.set_active("192.168.6.2", true))
            .await;

        let on_disk: BTreeMap<String, ServerStatus> =
            serde_json::from_slice(&std::fs::read(&status_path).unwrap()).unwrap();
        assert_eq!(on_disk, store.snapshot().await);
        assert!(on_disk.get("192.168.6.2").unwrap().active);
    }

    #[tokio::test]
    async fn test_republish_is_idempotent() {
        let dir = tempdir().unwrap();
        let status_path = dir.path().join("status.json");
        let store = StateStore::open(descriptors(), status_path.clone(), None, ledger(&dir));

        store
            .mutate(|fleet| fleet.set_active("192.168.6.3", true))
            .await;
        let first = std::fs::read(&status_path).unwrap();
        store.republish().await;
        let second = std::fs::read(&status_path).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unhealthy_record_seeds_blacklist_on_open() {
        let dir = tempdir().unwrap();
        let status_path = dir.path().join("status.json");
        {
            let store =
                StateStore::open(descriptors(), status_path.clone(), None, ledger(&dir));
            store
                .mutate(|fleet| {
                    fleet.set_active("192.168.6.3", true);
                    fleet.blacklist_add("192.168.6.3");
                })
                .await;
        }

        let reopened = StateStore::open(descriptors(), status_path, None, ledger(&dir));
        assert!(reopened.read(|f| f.is_blacklisted("192.168.6.3")).await);
        assert!(!reopened.read(|f| f.is_blacklisted("192.168.6.2")).await);
    }

    #[tokio::test]
    async fn test_remote_failure_alerts_but_does_not_block() {
        let dir = tempdir().unwrap();
        let status_path = dir.path().join("status.json");
        let ledger = ledger(&dir);
        let copier = RemoteCopier::from_config(&crate::config::RemoteCopyConfig {
            enabled: true,
            command: "false".to_string(),
            args: vec![],
            destination: "front:/tmp/status.json".to_string(),
            timeout_seconds: 5,
        });

        let store = StateStore::open(descriptors(), status_path.clone(), copier, ledger.clone());
        store
            .mutate(|fleet| fleet.set_active("192.168.6.2", true))
            .await;

        // Local write succeeded, alert recorded for the failed copy.
        assert!(status_path.exists());
        let counts = ledger.counts();
        assert!(counts.warning >= 1);
    }
}
