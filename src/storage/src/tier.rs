//! Storage tier contract.
//!
//! A tier is one backend holding stage images for a project: the
//! authoritative primary, the optional final repo shippable stages are
//! promoted to, read-only secondaries, and read-through/write-back cache
//! tiers. The manager only ever talks to this trait; registry clients and
//! the local docker daemon driver implement it elsewhere.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagedock_core::{Result, StageDescription, StageId};
use tokio_util::sync::CancellationToken;

use crate::runtime::RuntimeImage;

/// Address of the local-daemon storage tier.
///
/// A primary tier at this address keeps images directly in the local
/// container runtime, which makes the in-process manifest cache
/// redundant.
pub const LOCAL_STORAGE_ADDRESS: &str = ":local";

/// Options for deleting a stage image from a tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteImageOptions {
    /// Also remove containers that reference the image.
    pub rm_containers_that_use_image: bool,
    /// Force removal even when the image carries multiple tags.
    pub rm_force: bool,
}

/// Options for reuse filtering on local-daemon tiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterStagesOptions {
    /// Skip stages whose images are in use by running containers.
    pub skip_used_images: bool,
}

/// Combined options for for-each-delete iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForEachDeleteStageOptions {
    pub delete: DeleteImageOptions,
    pub filter: FilterStagesOptions,
}

/// Metadata recorded for an image import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportMetadata {
    pub import_source_id: String,
    pub source_image_id: String,
    pub checksum: String,
}

/// A storage backend holding stage images.
///
/// Implementations must be safe under concurrent calls and must honor
/// the cancellation token on every operation. `reject_stage` is
/// idempotent: once rejected, a stage is never returned again.
#[async_trait]
pub trait StagesStorage: Send + Sync {
    /// Stable backend address. Doubles as the manifest cache key and the
    /// tier identity in log lines.
    fn address(&self) -> String;

    /// Canonical image name for a stage in this tier's naming scheme.
    fn construct_stage_image_name(&self, project: &str, digest: &str, unique_id: i64) -> String;

    /// All stage IDs recorded for the project.
    async fn get_stage_ids(
        &self,
        token: &CancellationToken,
        project: &str,
    ) -> Result<Vec<StageId>>;

    /// Stage IDs recorded for the project at one digest.
    async fn get_stage_ids_by_digest(
        &self,
        token: &CancellationToken,
        project: &str,
        digest: &str,
    ) -> Result<Vec<StageId>>;

    /// Full description of one stage, or `None` when absent.
    ///
    /// Returns `DockError::BrokenImage` when the stored image exists but
    /// is unusable.
    async fn get_stage_description(
        &self,
        token: &CancellationToken,
        project: &str,
        stage_id: &StageId,
    ) -> Result<Option<StageDescription>>;

    /// Whether the image must be fetched into the local runtime.
    async fn should_fetch_image(
        &self,
        token: &CancellationToken,
        image: &RuntimeImage,
    ) -> Result<bool>;

    /// Fetch the image bytes into the local runtime.
    async fn fetch_image(&self, token: &CancellationToken, image: &RuntimeImage) -> Result<()>;

    /// Store the local image into this tier. Must be idempotent for
    /// concurrent stores of the same stage.
    async fn store_image(&self, token: &CancellationToken, image: &RuntimeImage) -> Result<()>;

    /// Delete a stage image from this tier.
    async fn delete_stage(
        &self,
        token: &CancellationToken,
        description: &StageDescription,
        opts: DeleteImageOptions,
    ) -> Result<()>;

    /// Mark a stage image as broken so it is never returned again.
    async fn reject_stage(
        &self,
        token: &CancellationToken,
        project: &str,
        stage_id: &StageId,
    ) -> Result<()>;

    /// Whether this tier rewrites deletion sets to account for image
    /// reuse. Only local-daemon-backed tiers do.
    fn supports_reuse_filtering(&self) -> bool {
        false
    }

    /// Rewrite a deletion set to account for image reuse and process the
    /// related runtime data. Identity for tiers without reuse filtering.
    async fn filter_stages_and_process_related_data(
        &self,
        _token: &CancellationToken,
        descriptions: Vec<StageDescription>,
        _opts: FilterStagesOptions,
    ) -> Result<Vec<StageDescription>> {
        Ok(descriptions)
    }

    /// Remove the commit metadata record binding an image to a stage.
    async fn rm_image_metadata(
        &self,
        token: &CancellationToken,
        project: &str,
        image_name_or_id: &str,
        commit: &str,
        stage_id: &str,
    ) -> Result<()>;

    /// Remove a managed image record.
    async fn rm_managed_image(
        &self,
        token: &CancellationToken,
        project: &str,
        image_name: &str,
    ) -> Result<()>;

    /// Read import metadata by ID.
    async fn get_import_metadata(
        &self,
        token: &CancellationToken,
        project: &str,
        id: &str,
    ) -> Result<Option<ImportMetadata>>;

    /// Remove import metadata by ID.
    async fn rm_import_metadata(
        &self,
        token: &CancellationToken,
        project: &str,
        id: &str,
    ) -> Result<()>;
}
