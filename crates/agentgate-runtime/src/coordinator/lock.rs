//! File-backed named locks.

use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Coordinator, CoordinatorError};
use crate::persist::{duration_ms, epoch_ms_now, file_age};

/// Unparsable lock files younger than this may still be being written by
/// their creator and are treated as held.
pub const CORRUPT_GRACE: Duration = Duration::from_secs(2);

/// Expired or corrupt locks reclaimed per acquisition before falling back to
/// the normal backoff.
const MAX_RECLAIMS: u32 = 3;

const BASE_BACKOFF: Duration = Duration::from_millis(10);

/// Longest encoded file name we create (leaves room for suffixes within the
/// usual 255-byte limit).
const MAX_FILE_NAME: usize = 200;

/// On-disk lock record. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub lock_id: String,
    pub owner_instance_id: String,
    pub resource: String,
    pub acquired_at: u64,
    pub expires_at: u64,
}

impl LockRecord {
    pub const fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }
}

/// A held lock. Pass it back to [`Coordinator::release_lock`].
#[derive(Debug, Clone)]
pub struct LockHandle {
    record: LockRecord,
    path: PathBuf,
}

impl LockHandle {
    pub fn resource(&self) -> &str {
        &self.record.resource
    }

    pub fn lock_id(&self) -> &str {
        &self.record.lock_id
    }

    pub const fn expires_at_ms(&self) -> u64 {
        self.record.expires_at
    }

    pub const fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// What [`Coordinator::release_lock`] did. Release never fails loudly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The file now belongs to another lock id (ours expired and was taken).
    NotOwner,
    Missing,
    /// The file could not be read or removed; see the logged warning.
    Failed,
}

/// Result of one [`Coordinator::cleanup_expired_locks`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Resources whose expired lock was removed.
    pub removed: Vec<String>,
    /// Corrupt lock files removed.
    pub corrupted: usize,
}

#[derive(Debug)]
enum LockFile {
    Missing,
    Corrupt,
    Valid(LockRecord),
}

#[derive(Debug, PartialEq, Eq)]
enum Taken {
    Removed,
    Restored,
    Missing,
}

/// File name for `resource`: ASCII alphanumerics, `-`, `_` and `.` are kept,
/// every other byte is percent-encoded, so distinct resources never share a
/// file.
pub fn lock_file_name(resource: &str) -> String {
    let mut name = String::with_capacity(resource.len() + 5);
    for byte in resource.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            name.push(char::from(byte));
        } else {
            let _ = write!(name, "%{byte:02X}");
        }
    }
    name.push_str(".lock");
    name
}

async fn read_lock_file(path: &Path) -> std::io::Result<LockFile> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).map_or(LockFile::Corrupt, LockFile::Valid)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(LockFile::Missing),
        Err(e) => Err(e),
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove file");
    }
}

/// Exclusive-create the lock file. `Ok(false)` if it already exists.
async fn create_lock_file(path: &Path, record: &LockRecord) -> std::io::Result<bool> {
    let json = serde_json::to_vec(record).map_err(std::io::Error::other)?;
    let mut file = match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e),
    };
    let written = match file.write_all(&json).await {
        Ok(()) => file.sync_all().await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        drop(file);
        remove_quietly(path).await;
        return Err(e);
    }
    Ok(true)
}

/// Move the lock file aside and delete it if `remove` still agrees with its
/// contents; otherwise put it back.
///
/// The rename makes the check-then-delete safe against a concurrent
/// reclaimer: only one process can move a given file, and whatever it moved
/// is re-checked before being deleted.
async fn take_if(path: &Path, remove: impl Fn(&LockFile) -> bool) -> std::io::Result<Taken> {
    let tombstone = path.with_extension(format!("stale-{}", Uuid::new_v4().simple()));
    match tokio::fs::rename(path, &tombstone).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Taken::Missing),
        Err(e) => return Err(e),
    }

    let content = read_lock_file(&tombstone).await?;
    if remove(&content) {
        remove_quietly(&tombstone).await;
        return Ok(Taken::Removed);
    }

    // Someone else's lock: restore it unless a newer one already appeared.
    match tokio::fs::hard_link(&tombstone, path).await {
        Ok(()) => remove_quietly(&tombstone).await,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            warn!(path = %path.display(), "Lock replaced while being inspected, dropping displaced record");
            remove_quietly(&tombstone).await;
        }
        Err(_) => tokio::fs::rename(&tombstone, path).await?,
    }
    Ok(Taken::Restored)
}

async fn past_grace(path: &Path) -> bool {
    file_age(path).await.is_some_and(|age| age >= CORRUPT_GRACE)
}

fn lock_lost(handle: &LockHandle, reason: &str) -> CoordinatorError {
    warn!(resource = handle.resource(), lock_id = handle.lock_id(), "{reason}");
    CoordinatorError::LockLost {
        resource: handle.record.resource.clone(),
    }
}

impl Coordinator {
    fn lock_path(&self, resource: &str) -> Result<PathBuf, CoordinatorError> {
        if resource.is_empty() {
            return Err(CoordinatorError::InvalidResource(resource.to_string()));
        }
        let name = lock_file_name(resource);
        if name.len() > MAX_FILE_NAME {
            return Err(CoordinatorError::InvalidResource(resource.to_string()));
        }
        Ok(self.locks_dir().join(name))
    }

    /// Try to take `resource` for `ttl`.
    ///
    /// An existing lock past its expiry is removed and creation retried at
    /// once. A live one is retried after 10ms, 20ms, 40ms, ... up to
    /// `max_retries` times. `Ok(None)` means "not acquired".
    pub async fn try_acquire_lock(
        &self,
        resource: &str,
        ttl: Duration,
        max_retries: u32,
    ) -> Result<Option<LockHandle>, CoordinatorError> {
        let path = self.lock_path(resource)?;
        tokio::fs::create_dir_all(self.locks_dir()).await?;

        let mut attempt = 0u32;
        let mut reclaims = 0u32;
        loop {
            let now = epoch_ms_now();
            let record = LockRecord {
                lock_id: Uuid::new_v4().to_string(),
                owner_instance_id: self.instance_id().to_string(),
                resource: resource.to_string(),
                acquired_at: now,
                expires_at: now.saturating_add(duration_ms(ttl)),
            };
            if create_lock_file(&path, &record).await? {
                debug!(resource, lock_id = %record.lock_id, attempt, "Lock acquired");
                return Ok(Some(LockHandle { record, path }));
            }

            let reclaimed = match read_lock_file(&path).await? {
                // Released between our create and read.
                LockFile::Missing => true,
                LockFile::Valid(existing) if existing.is_expired_at(epoch_ms_now()) => {
                    info!(
                        resource,
                        holder = %existing.owner_instance_id,
                        expired_ms_ago = epoch_ms_now().saturating_sub(existing.expires_at),
                        "Reclaiming expired lock"
                    );
                    let stale = existing.lock_id;
                    let taken = take_if(&path, |c| matches!(c, LockFile::Valid(r) if r.lock_id == stale)).await?;
                    taken != Taken::Restored
                }
                LockFile::Corrupt => {
                    if past_grace(&path).await {
                        warn!(resource, "Removing corrupt lock file");
                        let taken = take_if(&path, |c| matches!(c, LockFile::Corrupt)).await?;
                        taken != Taken::Restored
                    } else {
                        false
                    }
                }
                LockFile::Valid(_) => false,
            };
            if reclaimed && reclaims < MAX_RECLAIMS {
                reclaims += 1;
                continue;
            }

            if attempt >= max_retries {
                debug!(resource, attempts = attempt + 1, "Lock not acquired");
                return Ok(None);
            }
            let delay = BASE_BACKOFF.saturating_mul(1u32 << attempt.min(16));
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Release a lock we hold. Never raises: a lock that is gone or now
    /// belongs to someone else is logged and left alone.
    pub async fn release_lock(&self, handle: LockHandle) -> ReleaseOutcome {
        let resource = handle.resource();
        let lock_id = handle.lock_id();

        let current = match read_lock_file(handle.path()).await {
            Ok(current) => current,
            Err(e) => {
                warn!(resource, error = %e, "Failed to read lock on release");
                return ReleaseOutcome::Failed;
            }
        };
        match current {
            LockFile::Missing => {
                warn!(resource, lock_id, "Lock already gone on release");
                return ReleaseOutcome::Missing;
            }
            LockFile::Valid(r) if r.lock_id == lock_id => {}
            LockFile::Valid(r) => {
                warn!(resource, lock_id, holder = %r.owner_instance_id, "Lock owned by another holder, not releasing");
                return ReleaseOutcome::NotOwner;
            }
            LockFile::Corrupt => {
                warn!(resource, lock_id, "Lock file unreadable, not releasing");
                return ReleaseOutcome::NotOwner;
            }
        }

        match take_if(handle.path(), |c| matches!(c, LockFile::Valid(r) if r.lock_id == lock_id)).await {
            Ok(Taken::Removed) => {
                debug!(resource, lock_id, "Lock released");
                ReleaseOutcome::Released
            }
            Ok(Taken::Missing) => {
                warn!(resource, lock_id, "Lock already gone on release");
                ReleaseOutcome::Missing
            }
            Ok(Taken::Restored) => {
                warn!(resource, lock_id, "Lock changed hands during release, not releasing");
                ReleaseOutcome::NotOwner
            }
            Err(e) => {
                warn!(resource, lock_id, error = %e, "Failed to release lock");
                ReleaseOutcome::Failed
            }
        }
    }

    /// Extend a held lock to `now + ttl`.
    ///
    /// Fails with [`CoordinatorError::LockLost`] if the file no longer
    /// carries our id or the lease already expired. The old record is moved
    /// aside and the renewed one exclusive-created in its place, so a
    /// reclaimer that got there first keeps the lock.
    pub async fn renew_lock(&self, handle: &mut LockHandle, ttl: Duration) -> Result<(), CoordinatorError> {
        let lock_id = handle.record.lock_id.clone();
        let ours_and_live =
            |c: &LockFile| matches!(c, LockFile::Valid(r) if r.lock_id == lock_id && !r.is_expired_at(epoch_ms_now()));

        if !ours_and_live(&read_lock_file(handle.path()).await?) {
            return Err(lock_lost(handle, "Lock lost or expired before renewal"));
        }
        if take_if(handle.path(), ours_and_live).await? != Taken::Removed {
            return Err(lock_lost(handle, "Lock changed hands during renewal"));
        }

        let mut renewed = handle.record.clone();
        renewed.expires_at = epoch_ms_now().saturating_add(duration_ms(ttl));
        if !create_lock_file(handle.path(), &renewed).await? {
            return Err(lock_lost(handle, "Lock reclaimed during renewal"));
        }
        debug!(resource = %renewed.resource, expires_at = renewed.expires_at, "Lock renewed");
        handle.record = renewed;
        Ok(())
    }

    /// Every parsable lock currently on disk, expired or not.
    pub async fn list_locks(&self) -> Result<Vec<LockRecord>, CoordinatorError> {
        let mut entries = match tokio::fs::read_dir(self.locks_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut locks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "lock") {
                continue;
            }
            match read_lock_file(&path).await? {
                LockFile::Valid(record) => locks.push(record),
                LockFile::Corrupt => debug!(path = %path.display(), "Skipping corrupt lock file"),
                LockFile::Missing => {}
            }
        }
        locks.sort_by(|a, b| a.resource.cmp(&b.resource));
        Ok(locks)
    }

    /// Delete every expired lock, corrupt lock files past the write-grace
    /// window, and leftovers of interrupted writes.
    pub async fn cleanup_expired_locks(&self) -> Result<CleanupReport, CoordinatorError> {
        let mut report = CleanupReport::default();
        let mut entries = match tokio::fs::read_dir(self.locks_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_lock = path.extension().is_some_and(|ext| ext == "lock");
            if !is_lock {
                let leftover = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.starts_with("stale-") || ext.starts_with("tmp-"));
                if leftover && past_grace(&path).await {
                    remove_quietly(&path).await;
                }
                continue;
            }

            match read_lock_file(&path).await? {
                LockFile::Valid(record) if record.is_expired_at(epoch_ms_now()) => {
                    let stale = record.lock_id;
                    if take_if(&path, |c| matches!(c, LockFile::Valid(r) if r.lock_id == stale)).await?
                        == Taken::Removed
                    {
                        debug!(resource = %record.resource, holder = %record.owner_instance_id, "Expired lock removed");
                        report.removed.push(record.resource);
                    }
                }
                LockFile::Corrupt => {
                    if past_grace(&path).await
                        && take_if(&path, |c| matches!(c, LockFile::Corrupt)).await? == Taken::Removed
                    {
                        warn!(path = %path.display(), "Corrupt lock file removed");
                        report.corrupted += 1;
                    }
                }
                LockFile::Valid(_) | LockFile::Missing => {}
            }
        }

        if !report.removed.is_empty() || report.corrupted > 0 {
            info!(
                removed = report.removed.len(),
                corrupted = report.corrupted,
                "Lock cleanup finished"
            );
        }
        Ok(report)
    }
}
