//! Advisory LRU access tracker for local stage images.
//!
//! Records the last access time of each image name touched by the
//! manager. Host-side cleanup reads these timestamps to evict cold
//! images. Advisory only: a touch never fails a build.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::Mutex;

/// Tracks last-access timestamps of local images.
#[derive(Default)]
pub struct LruImagesCache {
    accessed: Mutex<HashMap<String, i64>>,
}

impl LruImagesCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an access to the image, timestamped now.
    pub async fn access_image(&self, image_name: &str) {
        let mut accessed = self.accessed.lock().await;
        accessed.insert(image_name.to_string(), Utc::now().timestamp_millis());
        tracing::debug!(image = %image_name, "recorded image access");
    }

    /// Last recorded access time in unix milliseconds, if any.
    pub async fn accessed_at(&self, image_name: &str) -> Option<i64> {
        self.accessed.lock().await.get(image_name).copied()
    }

    /// Number of tracked images.
    pub async fn len(&self) -> usize {
        self.accessed.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.accessed.lock().await.is_empty()
    }
}
