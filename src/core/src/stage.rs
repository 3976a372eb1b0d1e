//! Stage identity and image description model.
//!
//! A build divides a project into an ordered sequence of stages; each
//! produced stage is an immutable image addressed by a content-derived
//! digest plus a numeric unique ID. The same logical stage has distinct
//! image names in different storage tiers, so descriptions are always
//! backend-scoped.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identity of a produced stage image.
///
/// `digest` is the content-derived identifier of the stage's build
/// inputs; `unique_id` is a millisecond-since-epoch disambiguator that
/// allows several images to coexist at the same digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageId {
    pub digest: String,
    pub unique_id: i64,
}

impl StageId {
    pub fn new(digest: impl Into<String>, unique_id: i64) -> Self {
        Self {
            digest: digest.into(),
            unique_id,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.digest, self.unique_id)
    }
}

/// Backend-scoped description of a stage image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Backend-qualified image name (e.g., "registry.local/proj:abc-17").
    pub name: String,
    /// Repository part of the name.
    pub repository: String,
    /// Tag part of the name.
    pub tag: String,
    /// Digest of the image as stored in the repository.
    pub repo_digest: String,
    /// Image ID as reported by the backend.
    pub id: String,
    /// Parent image ID, if any.
    pub parent_id: String,
    /// Image labels.
    pub labels: HashMap<String, String>,
    /// Image size in bytes.
    pub size: u64,
    /// Creation timestamp in nanoseconds since the Unix epoch.
    pub created_at_unix_nano: u64,
}

/// A stage image as described by one storage tier.
///
/// Rebranding a description for another tier preserves `stage_id`
/// bit-for-bit and rewrites only the presentation fields of `info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescription {
    pub stage_id: StageId,
    pub info: ImageInfo,
}

impl StageDescription {
    pub fn new(stage_id: StageId, info: ImageInfo) -> Self {
        Self { stage_id, info }
    }
}

/// Presentation names for a built stage image.
///
/// Carries the logical image name alongside the backend-qualified name
/// and tag a consumer should reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInfoGetter {
    image_name: String,
    name: String,
    tag: String,
}

impl ImageInfoGetter {
    pub fn new(
        image_name: impl Into<String>,
        name: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            image_name: image_name.into(),
            name: name.into(),
            tag: tag.into(),
        }
    }

    /// Logical image name within the build.
    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    /// Backend-qualified image name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tag part of the backend-qualified name.
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

/// Split a full image name into repository and tag.
///
/// The tag is everything after the last ':' provided it contains no '/',
/// so registry ports ("registry.local:5000/proj") are not mistaken for
/// tags.
pub fn parse_repository_and_tag(image_name: &str) -> (String, String) {
    match image_name.rsplit_once(':') {
        Some((repository, tag)) if !tag.contains('/') => {
            (repository.to_string(), tag.to_string())
        }
        _ => (image_name.to_string(), String::new()),
    }
}
