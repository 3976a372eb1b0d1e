//! The storage manager.
//!
//! Orchestrates where each stage image lives: resolves candidates through
//! the shared digest index, materializes stages locally through the cache
//! tier hierarchy, promotes shippable stages to the final repo, and
//! drives bulk deletions over the bounded worker engine.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use stagedock_core::{
    parse_repository_and_tag, DockError, ImageInfoGetter, Result, StageDescription, StageId,
    StorageConfig,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::host_lock::HostImagesLocks;
use crate::index::{LockManager, StagesStorageCache};
use crate::lru::LruImagesCache;
use crate::manifest_cache::ManifestCache;
use crate::parallel::{self, DoTasksOptions};
use crate::resolve::{
    self, rebrand_description_for_storage, store_description_into_manifest_cache,
    GetStageDescriptionOptions,
};
use crate::runtime::{ContainerRuntime, RuntimeImage};
use crate::select::{dump_stage_description, BuildStage};
use crate::tier::{ForEachDeleteStageOptions, ImportMetadata, StagesStorage, LOCAL_STORAGE_ADDRESS};

/// Mutex-guarded set of stage IDs known to live in the final repo.
///
/// Extended only by successful replications in this process; foreign
/// writes may be under-reported, which is tolerated because redundant
/// replication is a no-op.
pub struct StagesList {
    stage_ids: std::sync::Mutex<Vec<StageId>>,
}

impl StagesList {
    pub fn new(stage_ids: Vec<StageId>) -> Self {
        Self {
            stage_ids: std::sync::Mutex::new(stage_ids),
        }
    }

    pub fn get_stage_ids(&self) -> Vec<StageId> {
        self.stage_ids
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn contains(&self, stage_id: &StageId) -> bool {
        self.stage_ids
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .any(|id| id == stage_id)
    }

    /// Append a stage ID unless it is already recorded.
    pub fn add_stage_id(&self, stage_id: StageId) {
        let mut stage_ids = self
            .stage_ids
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !stage_ids.iter().any(|id| *id == stage_id) {
            stage_ids.push(stage_id);
        }
    }
}

/// Orchestrates stage image placement across storage tiers.
pub struct StorageManager {
    project_name: String,

    parallel: bool,
    parallel_tasks_limit: usize,

    lock_manager: Arc<dyn LockManager>,
    stages_storage_cache: Arc<dyn StagesStorageCache>,

    stages_storage: Arc<dyn StagesStorage>,
    final_stages_storage: Option<Arc<dyn StagesStorage>>,
    cache_stages_storage_list: Vec<Arc<dyn StagesStorage>>,
    secondary_stages_storage_list: Vec<Arc<dyn StagesStorage>>,

    manifest_cache: ManifestCache,
    lru_images_cache: LruImagesCache,
    host_images_locks: HostImagesLocks,

    final_stages_list: Mutex<Option<Arc<StagesList>>>,
}

impl StorageManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_name: impl Into<String>,
        stages_storage: Arc<dyn StagesStorage>,
        final_stages_storage: Option<Arc<dyn StagesStorage>>,
        secondary_stages_storage_list: Vec<Arc<dyn StagesStorage>>,
        cache_stages_storage_list: Vec<Arc<dyn StagesStorage>>,
        lock_manager: Arc<dyn LockManager>,
        stages_storage_cache: Arc<dyn StagesStorageCache>,
        config: &StorageConfig,
    ) -> Self {
        Self {
            project_name: project_name.into(),
            parallel: config.parallel.enabled,
            parallel_tasks_limit: config.parallel.tasks_limit,
            lock_manager,
            stages_storage_cache,
            stages_storage,
            final_stages_storage,
            cache_stages_storage_list,
            secondary_stages_storage_list,
            manifest_cache: ManifestCache::new(),
            lru_images_cache: LruImagesCache::new(),
            host_images_locks: HostImagesLocks::new(config.locks_dir.clone()),
            final_stages_list: Mutex::new(None),
        }
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn stages_storage(&self) -> &Arc<dyn StagesStorage> {
        &self.stages_storage
    }

    pub fn final_stages_storage(&self) -> Option<&Arc<dyn StagesStorage>> {
        self.final_stages_storage.as_ref()
    }

    pub fn secondary_stages_storage_list(&self) -> &[Arc<dyn StagesStorage>] {
        &self.secondary_stages_storage_list
    }

    pub fn cache_stages_storage_list(&self) -> &[Arc<dyn StagesStorage>] {
        &self.cache_stages_storage_list
    }

    pub fn manifest_cache(&self) -> &ManifestCache {
        &self.manifest_cache
    }

    pub fn lru_images_cache(&self) -> &LruImagesCache {
        &self.lru_images_cache
    }

    pub fn host_images_locks(&self) -> &HostImagesLocks {
        &self.host_images_locks
    }

    /// Warm the lazily-built caches (currently the final stages list).
    pub async fn init_cache(&self, token: &CancellationToken) -> Result<()> {
        tracing::info!("initializing storage manager cache");

        if self.final_stages_storage.is_some() {
            self.get_or_create_final_stages_list(token).await?;
        }

        Ok(())
    }

    pub fn enable_parallel(&mut self, parallel_tasks_limit: usize) {
        self.parallel = true;
        self.parallel_tasks_limit = parallel_tasks_limit;
    }

    pub fn max_workers(&self) -> usize {
        if self.parallel && self.parallel_tasks_limit > 0 {
            self.parallel_tasks_limit
        } else {
            1
        }
    }

    fn with_manifest_cache_option(&self) -> bool {
        self.stages_storage.address() != LOCAL_STORAGE_ADDRESS
    }

    fn resolve_options(&self, allow_storage_cache_reset: bool) -> GetStageDescriptionOptions {
        GetStageDescriptionOptions {
            allow_storage_cache_reset,
            with_manifest_cache: self.with_manifest_cache_option(),
        }
    }

    /// Wipe every index record of the project.
    pub async fn reset_stages_storage_cache(&self, token: &CancellationToken) -> Result<()> {
        tracing::info!(
            cache = %self.stages_storage_cache.describe(),
            project = %self.project_name,
            "resetting stages storage cache"
        );
        self.stages_storage_cache
            .delete_all_stages(token, &self.project_name)
            .await
    }

    /// Acquire (and keep for the process lifetime) the shared host lock
    /// on a local image name.
    pub async fn lock_stage_image(
        &self,
        token: &CancellationToken,
        image_name: &str,
    ) -> Result<()> {
        self.host_images_locks
            .lock_image_shared(token, image_name)
            .await
    }

    /// Presentation names for a built stage image, preferring the final
    /// repo naming when a final repo is configured.
    pub fn get_image_info_getter(
        &self,
        image_name: &str,
        stage: &dyn BuildStage,
    ) -> Result<ImageInfoGetter> {
        let description = stage.stage_description().ok_or_else(|| {
            DockError::StorageError(format!(
                "stage {} has no description",
                stage.log_detailed_name()
            ))
        })?;
        let stage_id = &description.stage_id;

        if let Some(final_storage) = &self.final_stages_storage {
            let final_image_name = final_storage.construct_stage_image_name(
                &self.project_name,
                &stage_id.digest,
                stage_id.unique_id,
            );
            let (_, tag) = parse_repository_and_tag(&final_image_name);
            return Ok(ImageInfoGetter::new(image_name, final_image_name, tag));
        }

        Ok(ImageInfoGetter::new(
            image_name,
            description.info.name.clone(),
            description.info.tag.clone(),
        ))
    }

    /// Fresh unique ID (unix milliseconds) plus the primary-tier image
    /// name it yields, advanced past any collision within `stages`.
    ///
    /// True uniqueness is enforced by the index's per-digest
    /// serialization when the caller stores the new entry.
    pub fn generate_stage_unique_id(
        &self,
        digest: &str,
        stages: &[StageDescription],
    ) -> (String, i64) {
        let mut unique_id = Utc::now().timestamp_millis();

        loop {
            let image_name = self.stages_storage.construct_stage_image_name(
                &self.project_name,
                digest,
                unique_id,
            );

            if !stages.iter().any(|stage| stage.info.name == image_name) {
                return (image_name, unique_id);
            }
            unique_id += 1;
        }
    }

    // --- descriptor listing -------------------------------------------------

    /// All stage descriptions of the project, resolved against the
    /// primary tier (index-backed when the index has a record).
    pub async fn get_stage_description_list(
        &self,
        token: &CancellationToken,
    ) -> Result<Vec<StageDescription>> {
        let stage_ids = match self
            .stages_storage_cache
            .get_all_stages(token, &self.project_name)
            .await
            .map_err(|err| {
                DockError::CacheError(format!(
                    "error getting stage ids from the stages storage cache: {}",
                    err
                ))
            })? {
            Some(stage_ids) => stage_ids,
            None => {
                self.stages_storage
                    .get_stage_ids(token, &self.project_name)
                    .await?
            }
        };

        self.resolve_description_list(
            token,
            stage_ids,
            &self.stages_storage,
            &self.cache_stages_storage_list,
            self.resolve_options(true),
        )
        .await
    }

    /// All stage descriptions present in the final repo.
    pub async fn get_final_stage_description_list(
        &self,
        token: &CancellationToken,
    ) -> Result<Vec<StageDescription>> {
        let final_storage = self.require_final_storage()?.clone();
        let stages_list = self.get_or_create_final_stages_list(token).await?;
        let stage_ids = stages_list.get_stage_ids();

        self.resolve_description_list(
            token,
            stage_ids,
            &final_storage,
            &[],
            GetStageDescriptionOptions {
                allow_storage_cache_reset: true,
                with_manifest_cache: true,
            },
        )
        .await
    }

    async fn resolve_description_list(
        &self,
        token: &CancellationToken,
        stage_ids: Vec<StageId>,
        storage: &Arc<dyn StagesStorage>,
        cache_storages: &[Arc<dyn StagesStorage>],
        opts: GetStageDescriptionOptions,
    ) -> Result<Vec<StageDescription>> {
        let stages = Mutex::new(Vec::with_capacity(stage_ids.len()));

        let stage_ids = &stage_ids;
        let stages_ref = &stages;
        parallel::do_tasks(
            token,
            stage_ids.len(),
            DoTasksOptions {
                max_workers: self.max_workers(),
                init_worker_resources: false,
            },
            |task_id| async move {
                let stage_id = &stage_ids[task_id];

                match resolve::get_stage_description(
                    token,
                    &self.project_name,
                    stage_id,
                    storage,
                    cache_storages,
                    &self.manifest_cache,
                    opts,
                )
                .await?
                {
                    Some(description) => {
                        stages_ref.lock().await.push(description);
                    }
                    None => {
                        tracing::warn!(
                            stage_id = %stage_id,
                            storage = %storage.address(),
                            "ignoring stage: cannot get stage description"
                        );
                    }
                }

                Ok(())
            },
        )
        .await?;

        Ok(stages.into_inner())
    }

    // --- digest index -------------------------------------------------------

    /// Stage descriptions at one digest, via the shared index; a cache
    /// miss refreshes from the primary tier under the per-digest lock.
    pub async fn get_stages_by_digest(
        &self,
        token: &CancellationToken,
        stage_name: &str,
        stage_digest: &str,
    ) -> Result<Vec<StageDescription>> {
        tracing::info!(
            stage = stage_name,
            digest = stage_digest,
            "getting stage images by digest from the stages storage cache"
        );

        if let Some(stage_ids) = self
            .stages_storage_cache
            .get_stages_by_digest(token, &self.project_name, stage_digest)
            .await
            .map_err(|err| {
                DockError::CacheError(format!(
                    "error getting project {} stage {} record from the stages storage cache: {}",
                    self.project_name, stage_digest, err
                ))
            })?
        {
            let mut stages = Vec::with_capacity(stage_ids.len());
            for stage_id in &stage_ids {
                match resolve::get_stage_description(
                    token,
                    &self.project_name,
                    stage_id,
                    &self.stages_storage,
                    &self.cache_stages_storage_list,
                    &self.manifest_cache,
                    self.resolve_options(true),
                )
                .await?
                {
                    Some(description) => stages.push(description),
                    None => {
                        tracing::warn!(
                            stage_id = %stage_id,
                            storage = %self.stages_storage.address(),
                            "ignoring indexed stage: cannot get stage description"
                        );
                    }
                }
            }
            return Ok(stages);
        }

        tracing::debug!(
            stage = stage_name,
            digest = stage_digest,
            "no record in the stages storage cache, requesting fresh stages \
             from the stages storage and repopulating the record"
        );
        self.atomic_get_stages_by_digest_with_cache_store(token, stage_name, stage_digest)
            .await
    }

    /// Stage descriptions at one digest straight from a storage tier,
    /// bypassing the index.
    pub async fn get_stages_by_digest_from_stages_storage(
        &self,
        token: &CancellationToken,
        stage_name: &str,
        stage_digest: &str,
        stages_storage: &Arc<dyn StagesStorage>,
    ) -> Result<Vec<StageDescription>> {
        tracing::info!(
            stage = stage_name,
            digest = stage_digest,
            storage = %stages_storage.address(),
            "getting stage images by digest from the stages storage"
        );

        let stage_ids = stages_storage
            .get_stage_ids_by_digest(token, &self.project_name, stage_digest)
            .await?;

        self.get_stages_descriptions(token, &stage_ids, stages_storage)
            .await
    }

    /// Atomically replace the index record at one digest.
    pub async fn atomic_store_stages_by_digest_to_cache(
        &self,
        token: &CancellationToken,
        stage_name: &str,
        stage_digest: &str,
        stage_ids: Vec<StageId>,
    ) -> Result<()> {
        let lock = self
            .lock_manager
            .lock_stage_cache(token, &self.project_name, stage_digest)
            .await?;

        tracing::info!(
            stage = stage_name,
            digest = stage_digest,
            "storing stage images by digest into the stages storage cache"
        );

        let store_result = self
            .stages_storage_cache
            .store_stages_by_digest(token, &self.project_name, stage_digest, stage_ids)
            .await
            .map_err(|err| {
                DockError::CacheError(format!(
                    "error storing stage {} images by digest {} into the stages storage cache: {}",
                    stage_name, stage_digest, err
                ))
            });

        self.lock_manager.unlock(lock).await?;
        store_result
    }

    async fn atomic_get_stages_by_digest_with_cache_store(
        &self,
        token: &CancellationToken,
        stage_name: &str,
        stage_digest: &str,
    ) -> Result<Vec<StageDescription>> {
        // The per-digest lock also covers the refresh so concurrent
        // missers do not stampede the primary tier.
        let lock = self
            .lock_manager
            .lock_stage_cache(token, &self.project_name, stage_digest)
            .await?;

        let refresh_result = self
            .refresh_stages_by_digest(token, stage_name, stage_digest)
            .await;

        self.lock_manager.unlock(lock).await?;
        refresh_result
    }

    async fn refresh_stages_by_digest(
        &self,
        token: &CancellationToken,
        stage_name: &str,
        stage_digest: &str,
    ) -> Result<Vec<StageDescription>> {
        let stage_ids = self
            .stages_storage
            .get_stage_ids_by_digest(token, &self.project_name, stage_digest)
            .await?;

        let valid_stages = self
            .get_stages_descriptions(token, &stage_ids, &self.stages_storage)
            .await?;

        let valid_stage_ids: Vec<StageId> = valid_stages
            .iter()
            .map(|stage| stage.stage_id.clone())
            .collect();

        tracing::info!(
            stage = stage_name,
            digest = stage_digest,
            count = valid_stage_ids.len(),
            "storing refreshed stage images by digest into the stages storage cache"
        );

        self.stages_storage_cache
            .store_stages_by_digest(token, &self.project_name, stage_digest, valid_stage_ids)
            .await
            .map_err(|err| {
                DockError::CacheError(format!(
                    "error storing stage {} images by digest {} into the stages storage cache: {}",
                    stage_name, stage_digest, err
                ))
            })?;

        Ok(valid_stages)
    }

    /// Resolve each ID against the storage, skipping (with a warning)
    /// stages whose descriptions cannot be retrieved.
    async fn get_stages_descriptions(
        &self,
        token: &CancellationToken,
        stage_ids: &[StageId],
        stages_storage: &Arc<dyn StagesStorage>,
    ) -> Result<Vec<StageDescription>> {
        let mut stages = Vec::with_capacity(stage_ids.len());

        for stage_id in stage_ids {
            match resolve::get_stage_description(
                token,
                &self.project_name,
                stage_id,
                stages_storage,
                &self.cache_stages_storage_list,
                &self.manifest_cache,
                self.resolve_options(false),
            )
            .await?
            {
                Some(description) => stages.push(description),
                None => {
                    tracing::warn!(
                        stage_id = %stage_id,
                        storage = %stages_storage.address(),
                        "ignoring stage: cannot get stage description"
                    );
                }
            }
        }

        Ok(stages)
    }

    // --- selection ----------------------------------------------------------

    /// Delegate suitability to the stage's policy over a candidate set
    /// sharing its digest.
    pub async fn select_suitable_stage(
        &self,
        token: &CancellationToken,
        stage: &dyn BuildStage,
        stages: &[StageDescription],
    ) -> Result<Option<StageDescription>> {
        if stages.is_empty() {
            return Ok(None);
        }

        tracing::info!(
            stage = stage.name(),
            digest = stage.digest(),
            "selecting suitable image for stage by digest"
        );

        let selected = stage.select_suitable_stage(token, stages).await?;

        if let Some(description) = &selected {
            tracing::debug!(
                stage = stage.name(),
                description = %dump_stage_description(description),
                "selected cache image"
            );
        }

        Ok(selected)
    }

    // --- fetch pipeline -----------------------------------------------------

    /// Materialize the stage image locally.
    ///
    /// Holds the shared host lock for the image, prefers cache tiers in
    /// the configured order, falls back to the primary tier, and refills
    /// every cache tier that missed.
    pub async fn fetch_stage(
        &self,
        token: &CancellationToken,
        container_runtime: &dyn ContainerRuntime,
        stage: &dyn BuildStage,
    ) -> Result<()> {
        tracing::debug!(stage = %stage.log_detailed_name(), "fetching stage");

        let stage_description = self.described(stage)?;
        let stage_id = stage_description.stage_id.clone();

        self.lock_stage_image(token, &stage_description.info.name)
            .await?;

        let mut primary_image = RuntimeImage::from_description(stage_description.clone());

        let should_fetch = self
            .stages_storage
            .should_fetch_image(token, &primary_image)
            .await?;
        if !should_fetch {
            let image_name = self.stages_storage.construct_stage_image_name(
                &self.project_name,
                &stage_id.digest,
                stage_id.unique_id,
            );

            tracing::info!(image = %image_name, "image exists locally, will not perform fetch");

            if self.with_manifest_cache_option() {
                store_description_into_manifest_cache(
                    &self.manifest_cache,
                    self.stages_storage.as_ref(),
                    &self.project_name,
                    &stage_description,
                )
                .await;
            }
            self.lru_images_cache.access_image(&image_name).await;

            return Ok(());
        }

        let mut storages_to_refill: Vec<Arc<dyn StagesStorage>> = Vec::new();
        let mut fetched_image: Option<RuntimeImage> = None;

        for cache_storage in &self.cache_stages_storage_list {
            match self
                .fetch_stage_from_cache(token, cache_storage, &stage_id)
                .await
            {
                Ok(mut cache_image) => {
                    if cache_image.description().is_none() {
                        cache_image.set_description(rebrand_description_for_storage(
                            &stage_description,
                            cache_storage.as_ref(),
                            &self.project_name,
                        ));
                    }

                    match self
                        .prepare_cache_stage_as_primary(token, container_runtime, cache_image)
                        .await
                    {
                        Ok(image) => {
                            fetched_image = Some(image);
                            break;
                        }
                        Err(err) => {
                            tracing::warn!(
                                stage_id = %stage_id,
                                storage = %cache_storage.address(),
                                error = %err,
                                "unable to prepare stage fetched from the cache stages storage as primary"
                            );
                            storages_to_refill.push(Arc::clone(cache_storage));
                        }
                    }
                }
                Err(err) => {
                    if err.is_stage_not_found() {
                        tracing::info!(
                            stage_id = %stage_id,
                            storage = %cache_storage.address(),
                            "stage not found in the cache stages storage"
                        );
                    } else {
                        tracing::warn!(
                            stage_id = %stage_id,
                            storage = %cache_storage.address(),
                            error = %err,
                            "unable to fetch stage from the cache stages storage"
                        );
                    }
                    storages_to_refill.push(Arc::clone(cache_storage));
                }
            }
        }

        let mut fetched_image = match fetched_image {
            Some(image) => image,
            None => {
                tracing::info!(
                    stage = %stage.log_detailed_name(),
                    storage = %self.stages_storage.address(),
                    "fetching stage from the stages storage"
                );

                match self
                    .do_fetch_stage(token, &self.stages_storage, &stage_id, &mut primary_image)
                    .await
                {
                    Ok(()) => {}
                    Err(err) if err.is_stage_not_found() => {
                        tracing::error!(
                            stage = %stage.log_detailed_name(),
                            image = %primary_image.name(),
                            storage = %self.stages_storage.address(),
                            project = %self.project_name,
                            "stage is no longer available in the stages storage, \
                             the stages storage cache should be reset"
                        );
                        return Err(DockError::ShouldResetStorageCache);
                    }
                    Err(err) if err.is_broken_image() => {
                        tracing::error!(
                            stage = %stage.log_detailed_name(),
                            image = %primary_image.name(),
                            storage = %self.stages_storage.address(),
                            project = %self.project_name,
                            "stage image is broken, marking it rejected; the \
                             stages storage cache should be reset"
                        );

                        self.stages_storage
                            .reject_stage(token, &self.project_name, &stage_id)
                            .await?;

                        return Err(DockError::ShouldResetStorageCache);
                    }
                    Err(err) => return Err(err),
                }

                if self.with_manifest_cache_option() {
                    if let Some(description) = primary_image.description() {
                        store_description_into_manifest_cache(
                            &self.manifest_cache,
                            self.stages_storage.as_ref(),
                            &self.project_name,
                            description,
                        )
                        .await;
                    }
                }
                self.lru_images_cache
                    .access_image(primary_image.name())
                    .await;

                primary_image
            }
        };

        for cache_storage in &storages_to_refill {
            tracing::info!(
                stage = %stage.log_detailed_name(),
                storage = %cache_storage.address(),
                "copying stage into the cache stages storage"
            );

            if let Err(err) = self
                .copy_stage_into_stages_storage(
                    token,
                    &mut fetched_image,
                    cache_storage,
                    container_runtime,
                )
                .await
            {
                tracing::warn!(
                    stage_id = %stage_id,
                    storage = %cache_storage.address(),
                    error = %err,
                    "unable to copy stage into the cache stages storage"
                );
            }
        }

        Ok(())
    }

    /// Refresh the description from the storage and pull the image.
    async fn do_fetch_stage(
        &self,
        token: &CancellationToken,
        stages_storage: &Arc<dyn StagesStorage>,
        stage_id: &StageId,
        image: &mut RuntimeImage,
    ) -> Result<()> {
        tracing::debug!(image = %image.name(), "checking manifest availability");

        let fresh_description = stages_storage
            .get_stage_description(token, &self.project_name, stage_id)
            .await?
            .ok_or_else(|| DockError::StageNotFound {
                image_name: image.name().to_string(),
            })?;

        image.set_description(fresh_description);

        tracing::debug!(
            image = %image.name(),
            storage = %stages_storage.address(),
            "fetching image"
        );
        stages_storage.fetch_image(token, image).await
    }

    async fn fetch_stage_from_cache(
        &self,
        token: &CancellationToken,
        cache_storage: &Arc<dyn StagesStorage>,
        stage_id: &StageId,
    ) -> Result<RuntimeImage> {
        let image_name = cache_storage.construct_stage_image_name(
            &self.project_name,
            &stage_id.digest,
            stage_id.unique_id,
        );
        let mut image = RuntimeImage::new(image_name);

        let should_fetch = cache_storage.should_fetch_image(token, &image).await?;
        if should_fetch {
            tracing::info!(
                image = %image.name(),
                storage = %cache_storage.address(),
                "cache repo image does not exist locally, will perform fetch"
            );

            self.do_fetch_stage(token, cache_storage, stage_id, &mut image)
                .await?;

            if let Some(description) = image.description() {
                store_description_into_manifest_cache(
                    &self.manifest_cache,
                    cache_storage.as_ref(),
                    &self.project_name,
                    description,
                )
                .await;
            }
        } else {
            tracing::info!(
                image = %image.name(),
                storage = %cache_storage.address(),
                "cache repo image exists locally, will not perform fetch"
            );
        }

        self.lru_images_cache.access_image(image.name()).await;

        Ok(image)
    }

    /// Rename a cache-tier image to the primary canonical name and
    /// refresh the runtime's view of it.
    async fn prepare_cache_stage_as_primary(
        &self,
        token: &CancellationToken,
        container_runtime: &dyn ContainerRuntime,
        mut cache_image: RuntimeImage,
    ) -> Result<RuntimeImage> {
        let description = cache_image.description().cloned().ok_or_else(|| {
            DockError::StorageError(format!(
                "image {} has no stage description",
                cache_image.name()
            ))
        })?;
        let stage_id = &description.stage_id;

        let primary_image_name = self.stages_storage.construct_stage_image_name(
            &self.project_name,
            &stage_id.digest,
            stage_id.unique_id,
        );

        container_runtime
            .rename_image(token, &mut cache_image, &primary_image_name)
            .await?;
        container_runtime
            .refresh_image_object(token, &mut cache_image)
            .await?;

        let primary_description = rebrand_description_for_storage(
            &description,
            self.stages_storage.as_ref(),
            &self.project_name,
        );
        store_description_into_manifest_cache(
            &self.manifest_cache,
            self.stages_storage.as_ref(),
            &self.project_name,
            &primary_description,
        )
        .await;
        cache_image.set_description(primary_description);

        self.lru_images_cache
            .access_image(&primary_image_name)
            .await;

        Ok(cache_image)
    }

    /// Rename the local image to the destination's canonical name and
    /// store it there, updating the manifest cache and LRU tracker.
    async fn copy_stage_into_stages_storage(
        &self,
        token: &CancellationToken,
        image: &mut RuntimeImage,
        destination: &Arc<dyn StagesStorage>,
        container_runtime: &dyn ContainerRuntime,
    ) -> Result<()> {
        let source_description = image.description().cloned().ok_or_else(|| {
            DockError::StorageError(format!("image {} has no stage description", image.name()))
        })?;
        let stage_id = &source_description.stage_id;

        let target_image_name = destination.construct_stage_image_name(
            &self.project_name,
            &stage_id.digest,
            stage_id.unique_id,
        );

        container_runtime
            .rename_image(token, image, &target_image_name)
            .await?;

        destination.store_image(token, image).await.map_err(|err| {
            DockError::StorageError(format!(
                "unable to store stage {} into the stages storage {}: {}",
                stage_id,
                destination.address(),
                err
            ))
        })?;

        let rebranded = rebrand_description_for_storage(
            &source_description,
            destination.as_ref(),
            &self.project_name,
        );
        store_description_into_manifest_cache(
            &self.manifest_cache,
            destination.as_ref(),
            &self.project_name,
            &rebranded,
        )
        .await;

        self.lru_images_cache.access_image(&target_image_name).await;

        Ok(())
    }

    // --- replication --------------------------------------------------------

    /// Write the stage into every configured cache tier. Failures are
    /// warnings: cache tiers are accelerators.
    pub async fn copy_stage_into_cache(
        &self,
        token: &CancellationToken,
        stage: &dyn BuildStage,
        container_runtime: &dyn ContainerRuntime,
    ) -> Result<()> {
        let stage_description = self.described(stage)?;

        for cache_storage in &self.cache_stages_storage_list {
            tracing::info!(
                stage = %stage.log_detailed_name(),
                storage = %cache_storage.address(),
                "copying stage into the cache stages storage"
            );

            let mut image = RuntimeImage::from_description(stage_description.clone());
            if let Err(err) = self
                .copy_stage_into_stages_storage(token, &mut image, cache_storage, container_runtime)
                .await
            {
                tracing::warn!(
                    stage_id = %stage_description.stage_id,
                    storage = %cache_storage.address(),
                    error = %err,
                    "unable to copy stage into the cache stages storage"
                );
            }
        }

        Ok(())
    }

    async fn get_or_create_final_stages_list(
        &self,
        token: &CancellationToken,
    ) -> Result<Arc<StagesList>> {
        let final_storage = self.require_final_storage()?.clone();

        let mut cached = self.final_stages_list.lock().await;
        if let Some(stages_list) = cached.as_ref() {
            return Ok(Arc::clone(stages_list));
        }

        let stage_ids = final_storage
            .get_stage_ids(token, &self.project_name)
            .await
            .map_err(|err| {
                DockError::StorageError(format!(
                    "unable to get the final repo {} stages list: {}",
                    final_storage.address(),
                    err
                ))
            })?;

        let stages_list = Arc::new(StagesList::new(stage_ids));
        *cached = Some(Arc::clone(&stages_list));

        Ok(stages_list)
    }

    /// Promote the stage into the final repo.
    ///
    /// A stage already recorded in the final stages list is reused
    /// without verifying the remote entry against what would be stored;
    /// a tampered final-tier entry will not self-heal.
    pub async fn copy_stage_into_final_repo(
        &self,
        token: &CancellationToken,
        stage: &dyn BuildStage,
        container_runtime: &dyn ContainerRuntime,
    ) -> Result<()> {
        let final_storage = self.require_final_storage()?.clone();
        let stages_list = self.get_or_create_final_stages_list(token).await?;

        let stage_description = self.described(stage)?;
        let stage_id = stage_description.stage_id.clone();

        let final_image_name = final_storage.construct_stage_image_name(
            &self.project_name,
            &stage_id.digest,
            stage_id.unique_id,
        );

        if stages_list.contains(&stage_id) {
            tracing::info!(
                stage_id = %stage_id,
                storage = %final_storage.address(),
                "stage already exists in the final repo, skipping"
            );
            tracing::info!(
                stage = %stage.log_detailed_name(),
                image = %final_image_name,
                "use cache final image"
            );
            return Ok(());
        }

        self.fetch_stage(token, container_runtime, stage).await?;

        tracing::info!(
            stage = %stage.log_detailed_name(),
            storage = %final_storage.address(),
            "copying stage into the final repo"
        );

        let mut image = RuntimeImage::from_description(stage_description);
        self.copy_stage_into_stages_storage(token, &mut image, &final_storage, container_runtime)
            .await?;

        tracing::info!(image = %final_image_name, "copied stage into the final repo");

        stages_list.add_stage_id(stage_id);

        Ok(())
    }

    /// Copy one suitable stage between two tiers and return its
    /// description as the destination sees it.
    pub async fn copy_suitable_by_digest_stage(
        &self,
        token: &CancellationToken,
        stage_description: &StageDescription,
        source_storage: &Arc<dyn StagesStorage>,
        destination_storage: &Arc<dyn StagesStorage>,
        container_runtime: &dyn ContainerRuntime,
    ) -> Result<Option<StageDescription>> {
        let mut image = RuntimeImage::from_description(stage_description.clone());

        tracing::info!(
            image = %image.name(),
            storage = %source_storage.address(),
            "fetching image"
        );
        source_storage.fetch_image(token, &image).await.map_err(|err| {
            DockError::StorageError(format!(
                "unable to fetch {} from the stages storage {}: {}",
                stage_description.info.name,
                source_storage.address(),
                err
            ))
        })?;

        self.copy_stage_into_stages_storage(
            token,
            &mut image,
            destination_storage,
            container_runtime,
        )
        .await?;

        resolve::get_stage_description(
            token,
            &self.project_name,
            &stage_description.stage_id,
            destination_storage,
            &self.cache_stages_storage_list,
            &self.manifest_cache,
            self.resolve_options(true),
        )
        .await
    }

    // --- bulk iteration -----------------------------------------------------

    /// Delete stages from the primary tier (and every cache tier) with
    /// bounded parallelism.
    ///
    /// Reuse filtering runs first on capable primaries, then every
    /// affected digest is purged from the index before any worker
    /// spawns. Cache-tier failures are warnings; the primary-tier result
    /// flows to `f`, whose return decides whether iteration continues.
    pub async fn for_each_delete_stage<F>(
        &self,
        token: &CancellationToken,
        opts: ForEachDeleteStageOptions,
        stages_descriptions: Vec<StageDescription>,
        f: F,
    ) -> Result<()>
    where
        F: Fn(&StageDescription, Result<()>) -> Result<()> + Send + Sync,
    {
        let stages_descriptions = if self.stages_storage.supports_reuse_filtering() {
            self.stages_storage
                .filter_stages_and_process_related_data(token, stages_descriptions, opts.filter)
                .await
                .map_err(|err| {
                    DockError::StorageError(format!(
                        "error filtering stages of the stages storage {}: {}",
                        self.stages_storage.address(),
                        err
                    ))
                })?
        } else {
            stages_descriptions
        };

        for description in &stages_descriptions {
            self.stages_storage_cache
                .delete_stages_by_digest(token, &self.project_name, &description.stage_id.digest)
                .await
                .map_err(|err| {
                    DockError::CacheError(format!(
                        "unable to delete the stages storage cache record ({}): {}",
                        description.stage_id.digest, err
                    ))
                })?;
        }

        let descriptions = &stages_descriptions;
        let f = &f;
        parallel::do_tasks(
            token,
            descriptions.len(),
            DoTasksOptions {
                max_workers: self.max_workers(),
                init_worker_resources: true,
            },
            |task_id| async move {
                let description = &descriptions[task_id];

                for cache_storage in &self.cache_stages_storage_list {
                    if let Err(err) = cache_storage
                        .delete_stage(token, description, opts.delete)
                        .await
                    {
                        tracing::warn!(
                            stage_id = %description.stage_id,
                            storage = %cache_storage.address(),
                            error = %err,
                            "unable to delete stage from the cache stages storage"
                        );
                    }
                }

                let result = self
                    .stages_storage
                    .delete_stage(token, description, opts.delete)
                    .await;
                f(description, result)
            },
        )
        .await
    }

    /// Delete stages from the final repo with bounded parallelism.
    pub async fn for_each_delete_final_stage<F>(
        &self,
        token: &CancellationToken,
        opts: ForEachDeleteStageOptions,
        stages_descriptions: Vec<StageDescription>,
        f: F,
    ) -> Result<()>
    where
        F: Fn(&StageDescription, Result<()>) -> Result<()> + Send + Sync,
    {
        let final_storage = self.require_final_storage()?.clone();

        let descriptions = &stages_descriptions;
        let f = &f;
        let final_storage = &final_storage;
        parallel::do_tasks(
            token,
            descriptions.len(),
            DoTasksOptions {
                max_workers: self.max_workers(),
                init_worker_resources: true,
            },
            |task_id| async move {
                let description = &descriptions[task_id];
                let result = final_storage
                    .delete_stage(token, description, opts.delete)
                    .await;
                f(description, result)
            },
        )
        .await
    }

    /// Remove image metadata records for every `(stage ID, commit)` pair.
    pub async fn for_each_rm_image_metadata<F>(
        &self,
        token: &CancellationToken,
        project_name: &str,
        image_name_or_id: &str,
        stage_id_commit_list: &HashMap<String, Vec<String>>,
        f: F,
    ) -> Result<()>
    where
        F: Fn(&str, &str, Result<()>) -> Result<()> + Send + Sync,
    {
        let mut tasks: Vec<(&str, &str)> = Vec::new();
        for (stage_id, commits) in stage_id_commit_list {
            for commit in commits {
                tasks.push((commit.as_str(), stage_id.as_str()));
            }
        }

        let tasks = &tasks;
        let f = &f;
        parallel::do_tasks(
            token,
            tasks.len(),
            DoTasksOptions {
                max_workers: self.max_workers(),
                init_worker_resources: false,
            },
            |task_id| async move {
                let (commit, stage_id) = tasks[task_id];
                let result = self
                    .stages_storage
                    .rm_image_metadata(token, project_name, image_name_or_id, commit, stage_id)
                    .await;
                f(commit, stage_id, result)
            },
        )
        .await
    }

    /// Remove managed image records.
    pub async fn for_each_rm_managed_image<F>(
        &self,
        token: &CancellationToken,
        project_name: &str,
        managed_images: &[String],
        f: F,
    ) -> Result<()>
    where
        F: Fn(&str, Result<()>) -> Result<()> + Send + Sync,
    {
        let f = &f;
        parallel::do_tasks(
            token,
            managed_images.len(),
            DoTasksOptions {
                max_workers: self.max_workers(),
                init_worker_resources: false,
            },
            |task_id| async move {
                let managed_image = &managed_images[task_id];
                let result = self
                    .stages_storage
                    .rm_managed_image(token, project_name, managed_image)
                    .await;
                f(managed_image, result)
            },
        )
        .await
    }

    /// Read import metadata for every ID.
    pub async fn for_each_get_import_metadata<F>(
        &self,
        token: &CancellationToken,
        project_name: &str,
        ids: &[String],
        f: F,
    ) -> Result<()>
    where
        F: Fn(&str, Result<Option<ImportMetadata>>) -> Result<()> + Send + Sync,
    {
        let f = &f;
        parallel::do_tasks(
            token,
            ids.len(),
            DoTasksOptions {
                max_workers: self.max_workers(),
                init_worker_resources: false,
            },
            |task_id| async move {
                let id = &ids[task_id];
                let result = self
                    .stages_storage
                    .get_import_metadata(token, project_name, id)
                    .await;
                f(id, result)
            },
        )
        .await
    }

    /// Remove import metadata for every ID.
    pub async fn for_each_rm_import_metadata<F>(
        &self,
        token: &CancellationToken,
        project_name: &str,
        ids: &[String],
        f: F,
    ) -> Result<()>
    where
        F: Fn(&str, Result<()>) -> Result<()> + Send + Sync,
    {
        let f = &f;
        parallel::do_tasks(
            token,
            ids.len(),
            DoTasksOptions {
                max_workers: self.max_workers(),
                init_worker_resources: false,
            },
            |task_id| async move {
                let id = &ids[task_id];
                let result = self
                    .stages_storage
                    .rm_import_metadata(token, project_name, id)
                    .await;
                f(id, result)
            },
        )
        .await
    }

    // --- helpers ------------------------------------------------------------

    fn require_final_storage(&self) -> Result<&Arc<dyn StagesStorage>> {
        self.final_stages_storage.as_ref().ok_or_else(|| {
            DockError::StorageError("no final stages storage configured".to_string())
        })
    }

    fn described(&self, stage: &dyn BuildStage) -> Result<StageDescription> {
        stage.stage_description().ok_or_else(|| {
            DockError::StorageError(format!(
                "stage {} has no description",
                stage.log_detailed_name()
            ))
        })
    }
}
