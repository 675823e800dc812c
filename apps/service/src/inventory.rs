//! File-backed device inventory.
//!
//! The file is re-read on every poll and diffed against the previous
//! snapshot so the scheduler only sees what changed.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use pingwatch::{DeviceId, MonitoredTarget, MonitoringScheduler, SchedulerError};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("failed to read inventory {}: {source}", path.display())]
    Read { path: PathBuf, source: std::io::Error },

    #[error("failed to parse inventory {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
}

/// TOML layout: one `[[device]]` table per device
#[derive(Debug, Default, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    device: Vec<MonitoredTarget>,
}

/// Parse an inventory document. `.json` files hold an array of devices,
/// everything else is read as TOML.
pub fn parse(path: &Path, contents: &str) -> Result<Vec<MonitoredTarget>, InventoryError> {
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    let parsed = if is_json {
        serde_json::from_str::<Vec<MonitoredTarget>>(contents).map_err(|e| e.to_string())
    } else {
        toml::from_str::<InventoryFile>(contents).map(|file| file.device).map_err(|e| e.to_string())
    };
    parsed.map_err(|reason| InventoryError::Parse { path: path.to_path_buf(), reason })
}

/// Changes between two inventory snapshots
#[derive(Debug, Default, PartialEq)]
pub struct InventoryDiff {
    pub upserts: Vec<MonitoredTarget>,
    pub removals: Vec<DeviceId>,
    pub invalid: usize,
}

impl InventoryDiff {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }

    /// Push the changes into the scheduler
    pub fn apply(&self, scheduler: &MonitoringScheduler) -> Result<(), SchedulerError> {
        for device_id in &self.removals {
            scheduler.remove_target(device_id)?;
        }
        for target in &self.upserts {
            scheduler.upsert_target(target.clone())?;
        }
        Ok(())
    }
}

pub struct Inventory {
    path: PathBuf,
    known: HashMap<DeviceId, MonitoredTarget>,
}

impl Inventory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), known: HashMap::new() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// Re-read the file and diff it against the last snapshot.
    /// On error the snapshot is left untouched.
    pub async fn reload(&mut self) -> Result<InventoryDiff, InventoryError> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| InventoryError::Read { path: self.path.clone(), source })?;
        let records = parse(&self.path, &contents)?;
        let diff = self.diff(records);
        if !diff.is_empty() || diff.invalid > 0 {
            info!(
                path = %self.path.display(),
                upserts = diff.upserts.len(),
                removals = diff.removals.len(),
                invalid = diff.invalid,
                "Inventory changed"
            );
        }
        Ok(diff)
    }

    /// Replace the snapshot with `records` and report what changed.
    ///
    /// Invalid records are skipped; a device whose record turns invalid keeps
    /// its previous configuration instead of being removed. Later duplicates
    /// win over earlier ones.
    pub fn diff(&mut self, records: Vec<MonitoredTarget>) -> InventoryDiff {
        let mut diff = InventoryDiff::default();
        let mut next: HashMap<DeviceId, MonitoredTarget> = HashMap::new();
        let mut broken: HashSet<DeviceId> = HashSet::new();

        for record in records {
            if let Err(e) = record.validate() {
                warn!(device_id = %record.device_id, error = %e, "Skipping invalid inventory record");
                diff.invalid += 1;
                broken.insert(record.device_id.clone());
                continue;
            }
            if next.insert(record.device_id.clone(), record).is_some() {
                debug!("Duplicate inventory record, keeping the last one");
            }
        }

        for device_id in broken {
            if next.contains_key(&device_id) {
                continue;
            }
            if let Some(previous) = self.known.get(&device_id) {
                next.insert(device_id, previous.clone());
            }
        }

        let mut removals: Vec<DeviceId> =
            self.known.keys().filter(|id| !next.contains_key(*id)).cloned().collect();
        removals.sort();

        let mut upserts: Vec<MonitoredTarget> = next
            .values()
            .filter(|target| self.known.get(&target.device_id) != Some(*target))
            .cloned()
            .collect();
        upserts.sort_by(|a, b| a.device_id.cmp(&b.device_id));

        diff.removals = removals;
        diff.upserts = upserts;
        self.known = next;
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pingwatch::ProbeKind;
    use tempfile::tempdir;

    const INVENTORY: &str = r#"
[[device]]
device_id = "core-sw"
device_name = "Core switch"
ip_address = "10.0.0.2"
probe_interval_ms = 5000

[[device]]
device_id = "nas"
ip_address = "10.0.0.20"
hostname = "nas.lan"
probe_interval_ms = 10000
probe = { type = "tcp", port = 445 }

[[device]]
device_id = "printer"
ip_address = "10.0.0.40"
probe_interval_ms = 60000
monitored = false
"#;

    #[test]
    fn parses_toml_inventory() {
        let devices = parse(Path::new("devices.toml"), INVENTORY).unwrap();
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].device_name, "Core switch");
        assert_eq!(devices[1].probe, ProbeKind::Tcp { port: 445 });
        assert_eq!(devices[1].host(), "nas.lan");
        assert!(!devices[2].monitored);
        assert!(devices[0].monitored);
    }

    #[test]
    fn parses_json_inventory() {
        let json = r#"[{"device_id":"ap-1","ip_address":"10.0.1.1","probe_interval_ms":2000,
                        "probe":{"type":"http","url":"http://10.0.1.1/status"}}]"#;
        let devices = parse(Path::new("devices.json"), json).unwrap();
        assert_eq!(devices.len(), 1);
        assert!(matches!(devices[0].probe, ProbeKind::Http { url: Some(_) }));
    }

    #[test]
    fn malformed_document_is_an_error() {
        let err = parse(Path::new("devices.toml"), "[[device]]\nip_address = 7").unwrap_err();
        assert!(matches!(err, InventoryError::Parse { .. }));
    }

    #[test]
    fn diff_reports_adds_changes_and_removals() {
        let mut inventory = Inventory::new("unused.toml");
        let a = MonitoredTarget::new("a", "10.0.0.1", 1000);
        let b = MonitoredTarget::new("b", "10.0.0.2", 1000);

        let first = inventory.diff(vec![a.clone(), b.clone()]);
        assert_eq!(first.upserts.len(), 2);
        assert!(first.removals.is_empty());

        let unchanged = inventory.diff(vec![a.clone(), b.clone()]);
        assert!(unchanged.is_empty());

        let changed_a = a.clone().with_monitored(false);
        let second = inventory.diff(vec![changed_a.clone()]);
        assert_eq!(second.upserts, vec![changed_a]);
        assert_eq!(second.removals, vec![DeviceId::from("b")]);
        assert_eq!(inventory.len(), 1);
    }

    #[test]
    fn invalid_record_keeps_previous_configuration() {
        let mut inventory = Inventory::new("unused.toml");
        let a = MonitoredTarget::new("a", "10.0.0.1", 1000);
        inventory.diff(vec![a.clone()]);

        let broken = MonitoredTarget::new("a", "10.0.0.1", 0);
        let diff = inventory.diff(vec![broken, MonitoredTarget::new("", "10.0.0.3", 1000)]);

        assert_eq!(diff.invalid, 2);
        assert!(diff.is_empty());
        assert_eq!(inventory.len(), 1);
    }

    #[tokio::test]
    async fn reload_reads_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("devices.toml");
        tokio::fs::write(&path, INVENTORY).await.unwrap();

        let mut inventory = Inventory::new(&path);
        let diff = inventory.reload().await.unwrap();
        assert_eq!(diff.upserts.len(), 3);
        assert!(inventory.reload().await.unwrap().is_empty());

        tokio::fs::remove_file(&path).await.unwrap();
        assert!(matches!(inventory.reload().await, Err(InventoryError::Read { .. })));
        assert_eq!(inventory.len(), 3);
    }
}
