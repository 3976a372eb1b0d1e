//! Shared digest index and per-digest locking.
//!
//! The index maps `(project, digest)` to the list of stage IDs known at
//! that digest. It is advisory: entries may be stale, and consumers must
//! tolerate indexed stages that are no longer retrievable from the
//! backend. Updates for one digest are serialized through the
//! `LockManager`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use stagedock_core::{DockError, Result, StageId};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

/// Handle to a held per-digest lock, returned by
/// [`LockManager::lock_stage_cache`] and consumed by
/// [`LockManager::unlock`].
pub struct LockHandle {
    name: String,
    _guard: Option<OwnedMutexGuard<()>>,
}

impl LockHandle {
    pub fn new(name: impl Into<String>, guard: Option<OwnedMutexGuard<()>>) -> Self {
        Self {
            name: name.into(),
            _guard: guard,
        }
    }

    /// Name of the locked resource.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Grants locks serializing index updates per `(project, digest)`.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire the stage cache lock for one digest of a project.
    async fn lock_stage_cache(
        &self,
        token: &CancellationToken,
        project: &str,
        digest: &str,
    ) -> Result<LockHandle>;

    /// Release a previously acquired lock.
    async fn unlock(&self, handle: LockHandle) -> Result<()>;
}

/// The shared stages storage cache: `(project, digest)` → stage IDs.
#[async_trait]
pub trait StagesStorageCache: Send + Sync {
    /// Identity of the cache for log lines.
    fn describe(&self) -> String;

    /// All stage IDs recorded for the project, or `None` when the
    /// project has no record at all.
    async fn get_all_stages(
        &self,
        token: &CancellationToken,
        project: &str,
    ) -> Result<Option<Vec<StageId>>>;

    /// Stage IDs recorded at one digest, or `None` on a cache miss.
    async fn get_stages_by_digest(
        &self,
        token: &CancellationToken,
        project: &str,
        digest: &str,
    ) -> Result<Option<Vec<StageId>>>;

    /// Atomically replace the record at one digest.
    async fn store_stages_by_digest(
        &self,
        token: &CancellationToken,
        project: &str,
        digest: &str,
        stage_ids: Vec<StageId>,
    ) -> Result<()>;

    /// Drop the record at one digest.
    async fn delete_stages_by_digest(
        &self,
        token: &CancellationToken,
        project: &str,
        digest: &str,
    ) -> Result<()>;

    /// Drop every record of the project.
    async fn delete_all_stages(&self, token: &CancellationToken, project: &str) -> Result<()>;
}

/// Process-local stages storage cache.
#[derive(Default)]
pub struct MemoryStagesStorageCache {
    // project → digest → stage IDs
    entries: RwLock<HashMap<String, HashMap<String, Vec<StageId>>>>,
}

impl MemoryStagesStorageCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StagesStorageCache for MemoryStagesStorageCache {
    fn describe(&self) -> String {
        "memory stages storage cache".to_string()
    }

    async fn get_all_stages(
        &self,
        _token: &CancellationToken,
        project: &str,
    ) -> Result<Option<Vec<StageId>>> {
        let entries = self.entries.read().await;
        Ok(entries.get(project).map(|digests| {
            digests.values().flat_map(|ids| ids.iter().cloned()).collect()
        }))
    }

    async fn get_stages_by_digest(
        &self,
        _token: &CancellationToken,
        project: &str,
        digest: &str,
    ) -> Result<Option<Vec<StageId>>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(project)
            .and_then(|digests| digests.get(digest))
            .cloned())
    }

    async fn store_stages_by_digest(
        &self,
        _token: &CancellationToken,
        project: &str,
        digest: &str,
        stage_ids: Vec<StageId>,
    ) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries
            .entry(project.to_string())
            .or_default()
            .insert(digest.to_string(), stage_ids);
        Ok(())
    }

    async fn delete_stages_by_digest(
        &self,
        _token: &CancellationToken,
        project: &str,
        digest: &str,
    ) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(digests) = entries.get_mut(project) {
            digests.remove(digest);
        }
        Ok(())
    }

    async fn delete_all_stages(&self, _token: &CancellationToken, project: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(project);
        Ok(())
    }
}

/// Process-local lock manager keeping one mutex per `(project, digest)`.
#[derive(Default)]
pub struct MemoryLockManager {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_name(project: &str, digest: &str) -> String {
        format!("stage-cache/{}/{}", project, digest)
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn lock_stage_cache(
        &self,
        token: &CancellationToken,
        project: &str,
        digest: &str,
    ) -> Result<LockHandle> {
        let name = Self::lock_name(project, digest);

        let mutex = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(name.clone()).or_default())
        };

        tokio::select! {
            guard = mutex.lock_owned() => Ok(LockHandle::new(name, Some(guard))),
            _ = token.cancelled() => Err(DockError::Cancelled),
        }
    }

    async fn unlock(&self, handle: LockHandle) -> Result<()> {
        drop(handle);
        Ok(())
    }
}
