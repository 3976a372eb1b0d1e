//! Stage descriptor resolution across tiers.
//!
//! Locates a stage description for a target tier, consulting the
//! manifest cache and any cache tiers before the tier itself, and
//! normalizes whatever was found to the target tier's naming. A broken
//! or vanished image on the target tier surfaces the index-reset policy.

use std::sync::Arc;

use stagedock_core::{DockError, ImageInfo, Result, StageDescription, StageId};
use tokio_util::sync::CancellationToken;

use crate::manifest_cache::ManifestCache;
use crate::tier::StagesStorage;

/// Options for [`get_stage_description`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetStageDescriptionOptions {
    /// Translate broken/vanished stages on the target tier into
    /// `ShouldResetStorageCache` (rejecting broken images on the way).
    pub allow_storage_cache_reset: bool,

    /// Consult and populate the in-process manifest cache.
    pub with_manifest_cache: bool,
}

/// Produce a description of the same stage adjusted to another tier.
///
/// The stage ID is preserved bit-for-bit; only the presentation fields
/// (`name`, `repository`) are rewritten to the target tier's scheme.
pub fn rebrand_description_for_storage(
    description: &StageDescription,
    storage: &dyn StagesStorage,
    project: &str,
) -> StageDescription {
    let stage_id = description.stage_id.clone();
    StageDescription {
        info: ImageInfo {
            name: storage.construct_stage_image_name(
                project,
                &stage_id.digest,
                stage_id.unique_id,
            ),
            repository: storage.address(),
            tag: description.info.tag.clone(),
            repo_digest: description.info.repo_digest.clone(),
            id: description.info.id.clone(),
            parent_id: description.info.parent_id.clone(),
            labels: description.info.labels.clone(),
            size: description.info.size,
            created_at_unix_nano: description.info.created_at_unix_nano,
        },
        stage_id,
    }
}

async fn get_description_from_manifest_cache(
    manifest_cache: &ManifestCache,
    project: &str,
    stage_id: &StageId,
    storage: &dyn StagesStorage,
) -> Option<StageDescription> {
    let image_name =
        storage.construct_stage_image_name(project, &stage_id.digest, stage_id.unique_id);

    manifest_cache
        .get_image_info(&storage.address(), &image_name)
        .await
        .map(|info| StageDescription::new(stage_id.clone(), info))
}

/// Store a tier-scoped description into the manifest cache, keyed by the
/// tier's canonical constructed name so lookups through
/// [`get_description_from_manifest_cache`] find it again.
pub(crate) async fn store_description_into_manifest_cache(
    manifest_cache: &ManifestCache,
    storage: &dyn StagesStorage,
    project: &str,
    description: &StageDescription,
) {
    let image_name = storage.construct_stage_image_name(
        project,
        &description.stage_id.digest,
        description.stage_id.unique_id,
    );
    manifest_cache
        .store_image_info(&storage.address(), &image_name, description.info.clone())
        .await;
}

/// Resolve a stage description for `storage`, trying the manifest cache
/// and `cache_storages` first.
///
/// `Ok(None)` means the stage is absent (and resets were not allowed);
/// `Err(ShouldResetStorageCache)` reports a stale index entry.
pub async fn get_stage_description(
    token: &CancellationToken,
    project: &str,
    stage_id: &StageId,
    storage: &Arc<dyn StagesStorage>,
    cache_storages: &[Arc<dyn StagesStorage>],
    manifest_cache: &ManifestCache,
    opts: GetStageDescriptionOptions,
) -> Result<Option<StageDescription>> {
    if opts.with_manifest_cache {
        if let Some(description) =
            get_description_from_manifest_cache(manifest_cache, project, stage_id, storage.as_ref())
                .await
        {
            return Ok(Some(description));
        }
    }

    for cache_storage in cache_storages {
        if opts.with_manifest_cache {
            if let Some(description) = get_description_from_manifest_cache(
                manifest_cache,
                project,
                stage_id,
                cache_storage.as_ref(),
            )
            .await
            {
                return Ok(Some(rebrand_description_for_storage(
                    &description,
                    storage.as_ref(),
                    project,
                )));
            }
        }

        // Cache tiers are accelerators: any failure here downgrades to a
        // warning and the next tier is tried.
        match cache_storage
            .get_stage_description(token, project, stage_id)
            .await
        {
            Ok(Some(description)) => {
                if opts.with_manifest_cache {
                    store_description_into_manifest_cache(
                        manifest_cache,
                        cache_storage.as_ref(),
                        project,
                        &description,
                    )
                    .await;
                }

                return Ok(Some(rebrand_description_for_storage(
                    &description,
                    storage.as_ref(),
                    project,
                )));
            }
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(
                    stage_id = %stage_id,
                    storage = %cache_storage.address(),
                    error = %err,
                    "unable to get stage description from cache stages storage"
                );
                continue;
            }
        }
    }

    tracing::debug!(
        stage_id = %stage_id,
        storage = %storage.address(),
        "getting stage description from storage"
    );

    match storage.get_stage_description(token, project, stage_id).await {
        Ok(Some(description)) => {
            if opts.with_manifest_cache {
                store_description_into_manifest_cache(
                    manifest_cache,
                    storage.as_ref(),
                    project,
                    &description,
                )
                .await;
            }
            Ok(Some(description))
        }
        Ok(None) => {
            if opts.allow_storage_cache_reset {
                let image_name = storage.construct_stage_image_name(
                    project,
                    &stage_id.digest,
                    stage_id.unique_id,
                );
                tracing::error!(
                    image = %image_name,
                    storage = %storage.address(),
                    project = %project,
                    "stage is no longer available in the stages storage, \
                     the stages storage cache should be reset"
                );
                Err(DockError::ShouldResetStorageCache)
            } else {
                Ok(None)
            }
        }
        Err(err) if err.is_broken_image() => {
            if opts.allow_storage_cache_reset {
                let image_name = storage.construct_stage_image_name(
                    project,
                    &stage_id.digest,
                    stage_id.unique_id,
                );
                tracing::error!(
                    image = %image_name,
                    storage = %storage.address(),
                    project = %project,
                    "stage image is broken, marking it rejected; the stages \
                     storage cache should be reset"
                );

                storage.reject_stage(token, project, stage_id).await?;

                Err(DockError::ShouldResetStorageCache)
            } else {
                Ok(None)
            }
        }
        Err(err) => Err(err),
    }
}
