//! LockManager — per-volume file-lock mutual exclusion plus the
//! process-wide operation-class semaphore triple.
//!
//! Two-level design: a `hw-pvc-lock-<id>` file under a fixed directory
//! guards one volume across processes (including a CSI driver restart);
//! a `tokio::sync::Semaphore` per operation class caps how many
//! connect/disconnect/extend pipelines run concurrently within this
//! process. `lock()` acquires the file lock first and only then the
//! semaphore, releasing the file lock again if the semaphore wait times
//! out, so a blocked semaphore wait never strands an unrelated volume's
//! lock file.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs as tokio_fs;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::{ConnectorError, OperationClass, Result};

const LOCK_FILE_PREFIX: &str = "hw-pvc-lock-";
const LOCK_POLL_INTERVAL: Duration = Duration::from_secs(5);
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the lock directory and the three named semaphores
/// (`connect`/`disconnect`/`extend`), constructed once by the caller and
/// passed by reference into every attacher rather than kept as a
/// module-level singleton.
pub struct ConcurrencyGovernor {
    lock_dir: PathBuf,
    /// Serializes the existence-test-then-create step of `acquire`, so two
    /// in-process callers racing on the same identifier never both observe
    /// "absent" and both create the file.
    file_mutex: Mutex<()>,
    connect: Arc<Semaphore>,
    disconnect: Arc<Semaphore>,
    extend: Arc<Semaphore>,
    /// Permits currently checked out, purely so `release_semaphore` can
    /// tell a genuine double-release apart from a legitimate release.
    held: Mutex<HashSet<(String, OperationClassKey)>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum OperationClassKey {
    Connect,
    Disconnect,
    Extend,
}

impl From<OperationClass> for OperationClassKey {
    fn from(c: OperationClass) -> Self {
        match c {
            OperationClass::Connect => OperationClassKey::Connect,
            OperationClass::Disconnect => OperationClassKey::Disconnect,
            OperationClass::Extend => OperationClassKey::Extend,
        }
    }
}

/// A held combination of file lock + semaphore permit for one volume.
/// Dropping this without calling `unlock` is a programmer error in this
/// crate (the permit would never be recorded as released); callers always
/// route through `ConcurrencyGovernor::unlock`.
pub struct Held {
    id: String,
    class: OperationClass,
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGovernor {
    /// Construct the governor and run the startup lock-file sweep: any
    /// lock files present at initialization are reclaimed, since they can
    /// only be left over from a previous process instance.
    pub async fn new(lock_dir: impl Into<PathBuf>, connector_threads: u32) -> Result<Self> {
        let lock_dir = lock_dir.into();
        tokio_fs::create_dir_all(&lock_dir)
            .await
            .map_err(ConnectorError::Io)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o755);
            let _ = std::fs::set_permissions(&lock_dir, perms);
        }

        let governor = Self {
            lock_dir,
            file_mutex: Mutex::new(()),
            connect: Arc::new(Semaphore::new(connector_threads as usize)),
            disconnect: Arc::new(Semaphore::new(connector_threads as usize)),
            extend: Arc::new(Semaphore::new(connector_threads as usize)),
            held: Mutex::new(HashSet::new()),
        };
        governor.sweep_stale_locks().await?;
        Ok(governor)
    }

    async fn sweep_stale_locks(&self) -> Result<()> {
        let mut entries = tokio_fs::read_dir(&self.lock_dir)
            .await
            .map_err(ConnectorError::Io)?;
        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await.map_err(ConnectorError::Io)? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(LOCK_FILE_PREFIX) {
                if let Err(e) = tokio_fs::remove_file(entry.path()).await {
                    warn!(file = %name, error = %e, "failed to remove stale lock file at startup");
                } else {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(count = removed, "swept stale lock files at startup");
        }
        Ok(())
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.lock_dir.join(format!("{LOCK_FILE_PREFIX}{id}"))
    }

    /// Polls every 5s up to 30s for the lock file to be absent, then
    /// creates it.
    async fn acquire_file_lock(&self, id: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + LOCK_TIMEOUT;
        loop {
            {
                let _guard = self.file_mutex.lock().await;
                let path = self.lock_path(id);
                if !path.exists() {
                    tokio_fs::write(&path, id.as_bytes())
                        .await
                        .map_err(ConnectorError::Io)?;
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        let perms = std::fs::Permissions::from_mode(0o644);
                        let _ = std::fs::set_permissions(&path, perms);
                    }
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ConnectorError::LockTimeout(id.to_string()));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(
                deadline.saturating_duration_since(tokio::time::Instant::now()),
            ))
            .await;
        }
    }

    async fn release_file_lock(&self, id: &str) -> Result<()> {
        let _guard = self.file_mutex.lock().await;
        let path = self.lock_path(id);
        match tokio_fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConnectorError::Io(e)),
        }
    }

    fn semaphore_for(&self, class: OperationClass) -> Arc<Semaphore> {
        match class {
            OperationClass::Connect => self.connect.clone(),
            OperationClass::Disconnect => self.disconnect.clone(),
            OperationClass::Extend => self.extend.clone(),
        }
    }

    /// `lock(id, class)` — acquire the file lock, then the semaphore; on
    /// semaphore timeout the file lock is released before the error
    /// propagates.
    pub async fn lock(&self, id: &str, class: OperationClass, timeout: Duration) -> Result<Held> {
        self.acquire_file_lock(id).await?;

        let sem = self.semaphore_for(class);
        let permit = match tokio::time::timeout(timeout, sem.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                let _ = self.release_file_lock(id).await;
                return Err(ConnectorError::SemaphoreTimeout(class));
            }
            Err(_) => {
                let _ = self.release_file_lock(id).await;
                return Err(ConnectorError::SemaphoreTimeout(class));
            }
        };

        self.held
            .lock()
            .await
            .insert((id.to_string(), class.into()));

        Ok(Held {
            id: id.to_string(),
            class,
            _permit: permit,
        })
    }

    /// `unlock(id, class)` — release the semaphore, then the file lock.
    pub async fn unlock(&self, held: Held) -> Result<()> {
        let key = (held.id.clone(), held.class.into());
        let was_held = self.held.lock().await.remove(&key);
        if !was_held {
            // A missing permit is a hard error rather than a silently
            // ignored condition: it means the bookkeeping itself is wrong.
            return Err(ConnectorError::MissingPermit(held.class));
        }
        // Dropping `held` releases the semaphore permit.
        let id = held.id.clone();
        drop(held);
        self.release_file_lock(&id).await
    }
}
