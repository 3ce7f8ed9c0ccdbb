//! Instance registry: which processes are sharing the state directory.
//!
//! Each process writes `instances/<id>.json` on start and rewrites it on
//! every heartbeat. A record whose heartbeat is older than the dead-instance
//! threshold belongs to a crashed or hung process and is purged; locks it
//! held are left to expire through the normal TTL path.

use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Coordinator, CoordinatorError};
use crate::persist::{epoch_ms_now, file_age, write_json_atomic};

/// On-disk instance record. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub pid: u32,
    pub started_at: u64,
    pub last_heartbeat: u64,
}

impl InstanceRecord {
    /// Silent for longer than `threshold_ms`.
    pub const fn is_dead_at(&self, now_ms: u64, threshold_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_heartbeat) > threshold_ms
    }
}

impl Coordinator {
    fn instance_path(&self, instance_id: &str) -> PathBuf {
        self.instances_dir().join(format!("{instance_id}.json"))
    }

    fn own_record(&self) -> InstanceRecord {
        InstanceRecord {
            instance_id: self.instance_id().to_string(),
            pid: std::process::id(),
            started_at: self.started_at,
            last_heartbeat: epoch_ms_now(),
        }
    }

    /// Announce this process.
    pub async fn register(&self) -> Result<InstanceRecord, CoordinatorError> {
        let record = self.own_record();
        write_json_atomic(&self.instance_path(self.instance_id()), &record).await?;
        info!(instance_id = %record.instance_id, pid = record.pid, "Instance registered");
        Ok(record)
    }

    /// Refresh this process's heartbeat, re-creating the record if another
    /// process purged it.
    pub async fn heartbeat(&self) -> Result<(), CoordinatorError> {
        let path = self.instance_path(self.instance_id());
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            info!(instance_id = self.instance_id(), "Instance record missing, re-registering");
        }
        write_json_atomic(&path, &self.own_record()).await?;
        debug!(instance_id = self.instance_id(), "Instance heartbeat");
        Ok(())
    }

    /// Remove this process's record. Returns whether it existed.
    pub async fn unregister(&self) -> Result<bool, CoordinatorError> {
        match tokio::fs::remove_file(self.instance_path(self.instance_id())).await {
            Ok(()) => {
                info!(instance_id = self.instance_id(), "Instance unregistered");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// All parsable instance records, oldest first.
    pub async fn list_instances(&self) -> Result<Vec<InstanceRecord>, CoordinatorError> {
        let mut records: Vec<InstanceRecord> = self
            .scan_instances()
            .await?
            .into_iter()
            .filter_map(|(_, record)| record)
            .collect();
        records.sort_by_key(|r| (r.started_at, r.instance_id.clone()));
        Ok(records)
    }

    /// Delete records of instances silent past the threshold, and corrupt
    /// records at least that old. Never purges this process. Returns the ids
    /// (or file names, for corrupt records) removed.
    pub async fn purge_dead_instances(&self) -> Result<Vec<String>, CoordinatorError> {
        let threshold_ms = self.config().dead_instance_threshold_ms;
        let now = epoch_ms_now();
        let mut purged = Vec::new();

        for (path, record) in self.scan_instances().await? {
            let label = match &record {
                Some(r) if r.instance_id == self.instance_id() => continue,
                Some(r) if r.is_dead_at(now, threshold_ms) => r.instance_id.clone(),
                Some(_) => continue,
                None => {
                    let stale = file_age(&path)
                        .await
                        .is_some_and(|age| age.as_millis() > u128::from(threshold_ms));
                    if !stale {
                        continue;
                    }
                    path.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default()
                }
            };
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    warn!(instance = %label, "Purged dead instance");
                    purged.push(label);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(purged)
    }

    /// Instances with a fresh heartbeat, counting this one at least once.
    pub async fn live_instance_count(&self) -> Result<usize, CoordinatorError> {
        let threshold_ms = self.config().dead_instance_threshold_ms;
        let now = epoch_ms_now();
        let live = self
            .scan_instances()
            .await?
            .into_iter()
            .filter_map(|(_, record)| record)
            .filter(|r| !r.is_dead_at(now, threshold_ms))
            .count();
        Ok(live.max(1))
    }

    async fn scan_instances(&self) -> Result<Vec<(PathBuf, Option<InstanceRecord>)>, CoordinatorError> {
        let mut entries = match tokio::fs::read_dir(self.instances_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let record = match tokio::fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<InstanceRecord>(&bytes).ok(),
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if record.is_none() {
                debug!(path = %path.display(), "Unparsable instance record");
            }
            found.push((path, record));
        }
        Ok(found)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use agentgate_core::config::CoordinatorConfig;
    use std::path::Path;
    use std::time::{Duration, SystemTime};

    fn coordinator(dir: &Path, id: &str) -> Coordinator {
        let config = CoordinatorConfig {
            dead_instance_threshold_ms: 60_000,
            ..CoordinatorConfig::default()
        };
        Coordinator::with_instance_id(dir, id, config)
    }

    fn write_record(c: &Coordinator, id: &str, last_heartbeat: u64) {
        std::fs::create_dir_all(c.instances_dir()).unwrap();
        let record = InstanceRecord {
            instance_id: id.to_string(),
            pid: 1,
            started_at: 0,
            last_heartbeat,
        };
        std::fs::write(
            c.instances_dir().join(format!("{id}.json")),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn register_list_unregister() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = coordinator(dir.path(), "a");
        let b = coordinator(dir.path(), "b");
        assert!(a.list_instances().await.unwrap().is_empty());

        let record = a.register().await.unwrap();
        assert_eq!(record.pid, std::process::id());
        b.register().await.unwrap();

        let ids: Vec<String> = a
            .list_instances()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.instance_id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()) && ids.contains(&"b".to_string()));
        assert_eq!(a.live_instance_count().await.unwrap(), 2);

        assert!(b.unregister().await.unwrap());
        assert!(!b.unregister().await.unwrap());
        assert_eq!(a.live_instance_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn heartbeat_recreates_purged_record() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = coordinator(dir.path(), "a");
        a.register().await.unwrap();
        std::fs::remove_file(a.instances_dir().join("a.json")).unwrap();

        a.heartbeat().await.unwrap();
        assert_eq!(a.list_instances().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn purge_removes_only_silent_instances() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = coordinator(dir.path(), "a");
        a.register().await.unwrap();

        let now = epoch_ms_now();
        write_record(&a, "dead", now - 120_000);
        write_record(&a, "alive", now - 5_000);

        assert_eq!(a.live_instance_count().await.unwrap(), 2);
        let purged = a.purge_dead_instances().await.unwrap();
        assert_eq!(purged, vec!["dead".to_string()]);
        assert_eq!(a.list_instances().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn purge_never_removes_self() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = coordinator(dir.path(), "a");
        write_record(&a, "a", 0);
        assert!(a.purge_dead_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn old_corrupt_records_are_purged() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = coordinator(dir.path(), "a");
        std::fs::create_dir_all(a.instances_dir()).unwrap();
        let fresh = a.instances_dir().join("fresh.json");
        let old = a.instances_dir().join("old.json");
        std::fs::write(&fresh, b"garbage").unwrap();
        std::fs::write(&old, b"garbage").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(120))
            .unwrap();

        let purged = a.purge_dead_instances().await.unwrap();
        assert_eq!(purged, vec!["old.json".to_string()]);
        assert!(fresh.exists());
    }
}
