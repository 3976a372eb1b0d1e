//! Shared host locks on local image names.
//!
//! Concurrent fetchers of the same image take a shared file lock and
//! rendezvous on the idempotent backend fetch; an exclusive writer (host
//! cleanup) takes the same file exclusively and waits them out. Handles
//! are recorded for the process lifetime — there is no release API, so a
//! build never churns through re-acquisition of the same lock.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use stagedock_core::{DockError, Result};
use tokio_util::sync::CancellationToken;

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct HeldLock {
    image_name: String,
    _file: File,
}

/// Registry of shared host locks held by this process.
pub struct HostImagesLocks {
    locks_dir: PathBuf,
    held: Mutex<Vec<HeldLock>>,
}

impl HostImagesLocks {
    pub fn new(locks_dir: impl Into<PathBuf>) -> Self {
        Self {
            locks_dir: locks_dir.into(),
            held: Mutex::new(Vec::new()),
        }
    }

    /// Acquire a shared host lock on the image name and record the
    /// handle. Returns immediately when this process already holds the
    /// lock. The lock lives until process exit.
    pub async fn lock_image_shared(
        &self,
        token: &CancellationToken,
        image_name: &str,
    ) -> Result<()> {
        {
            let held = self
                .held
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if held.iter().any(|lock| lock.image_name == image_name) {
                return Ok(());
            }
        }

        let path = self.lock_path(image_name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DockError::LockError(format!(
                    "failed to create locks directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                DockError::LockError(format!(
                    "failed to open lock file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        // Shared acquisition only contends with an exclusive holder.
        // Poll instead of blocking the async worker thread.
        loop {
            match file.try_lock_shared() {
                Ok(()) => break,
                Err(std::fs::TryLockError::WouldBlock) => {
                    if token.is_cancelled() {
                        return Err(DockError::Cancelled);
                    }
                    tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
                }
                Err(err) => {
                    return Err(DockError::LockError(format!(
                        "failed to lock {} shared: {}",
                        path.display(),
                        err
                    )));
                }
            }
        }

        tracing::debug!(image = %image_name, lock = %path.display(), "acquired shared host image lock");

        let mut held = self
            .held
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        held.push(HeldLock {
            image_name: image_name.to_string(),
            _file: file,
        });

        Ok(())
    }

    /// Number of locks held by this process.
    pub fn held_count(&self) -> usize {
        self.held
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether this process holds the lock for the image name.
    pub fn holds(&self, image_name: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .any(|lock| lock.image_name == image_name)
    }

    fn lock_path(&self, image_name: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", sanitize(image_name)))
    }
}

/// Make an image name safe as a file name.
fn sanitize(image_name: &str) -> String {
    image_name.replace(['/', ':'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn lock_file_exists(locks_dir: &Path, image_name: &str) -> bool {
        locks_dir
            .join(format!("{}.lock", sanitize(image_name)))
            .exists()
    }

    #[tokio::test]
    async fn test_lock_creates_directory_and_records_handle() {
        let tmp = TempDir::new().unwrap();
        let locks = HostImagesLocks::new(tmp.path().join("locks"));
        let token = CancellationToken::new();

        locks
            .lock_image_shared(&token, "registry.local/proj:a-1")
            .await
            .unwrap();

        assert_eq!(locks.held_count(), 1);
        assert!(locks.holds("registry.local/proj:a-1"));
        assert!(lock_file_exists(
            &tmp.path().join("locks"),
            "registry.local/proj:a-1"
        ));
    }

    #[tokio::test]
    async fn test_reacquisition_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let locks = HostImagesLocks::new(tmp.path());
        let token = CancellationToken::new();

        locks.lock_image_shared(&token, "proj:a-1").await.unwrap();
        locks.lock_image_shared(&token, "proj:a-1").await.unwrap();

        assert_eq!(locks.held_count(), 1);
    }

    #[tokio::test]
    async fn test_shared_locks_coexist_across_registries() {
        let tmp = TempDir::new().unwrap();
        let first = HostImagesLocks::new(tmp.path());
        let second = HostImagesLocks::new(tmp.path());
        let token = CancellationToken::new();

        // Two processes fetching the same image rendezvous on shared locks.
        first.lock_image_shared(&token, "proj:a-1").await.unwrap();
        second.lock_image_shared(&token, "proj:a-1").await.unwrap();

        assert_eq!(first.held_count(), 1);
        assert_eq!(second.held_count(), 1);
    }

    #[tokio::test]
    async fn test_distinct_images_get_distinct_lock_files() {
        let tmp = TempDir::new().unwrap();
        let locks = HostImagesLocks::new(tmp.path());
        let token = CancellationToken::new();

        locks.lock_image_shared(&token, "proj:a-1").await.unwrap();
        locks.lock_image_shared(&token, "proj:b-2").await.unwrap();

        assert_eq!(locks.held_count(), 2);
        assert!(lock_file_exists(tmp.path(), "proj:a-1"));
        assert!(lock_file_exists(tmp.path(), "proj:b-2"));
    }

    #[test]
    fn test_sanitize_strips_path_separators() {
        assert_eq!(sanitize("registry.local/proj:a-1"), "registry.local_proj_a-1");
    }
}
