//! Process-local manifest cache.
//!
//! Caches image info keyed by `(backend address, image name)` so repeated
//! descriptor lookups skip the backend. The image-name half of the key is
//! always the tier's canonical constructed name (see
//! `StagesStorage::construct_stage_image_name`): writers pass it
//! explicitly instead of re-deriving it from the stored info, so a
//! description whose `name` drifts from the canonical form cannot strand
//! an entry readers will never find. Pure lookup accelerator:
//! correctness never depends on a hit.

use std::collections::HashMap;

use stagedock_core::ImageInfo;
use tokio::sync::RwLock;

/// In-process cache of image info per backend.
#[derive(Default)]
pub struct ManifestCache {
    entries: RwLock<HashMap<(String, String), ImageInfo>>,
}

impl ManifestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up cached info for an image of one backend.
    ///
    /// `image_name` must be the tier's canonical constructed name — the
    /// same key writes are stored under.
    pub async fn get_image_info(
        &self,
        storage_address: &str,
        image_name: &str,
    ) -> Option<ImageInfo> {
        let entries = self.entries.read().await;
        let info = entries
            .get(&(storage_address.to_string(), image_name.to_string()))
            .cloned();

        if info.is_some() {
            tracing::debug!(image = %image_name, storage = %storage_address, "manifest cache hit");
        } else {
            tracing::debug!(image = %image_name, storage = %storage_address, "manifest cache miss");
        }

        info
    }

    /// Record info for an image of one backend.
    ///
    /// `image_name` is the lookup key and must be the tier's canonical
    /// constructed name, matching what readers pass to
    /// [`get_image_info`](Self::get_image_info); it is taken explicitly
    /// rather than read from `info.name` so the read/write symmetry is
    /// enforced by the caller that derived the name.
    pub async fn store_image_info(&self, storage_address: &str, image_name: &str, info: ImageInfo) {
        let mut entries = self.entries.write().await;
        entries.insert(
            (storage_address.to_string(), image_name.to_string()),
            info,
        );
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
