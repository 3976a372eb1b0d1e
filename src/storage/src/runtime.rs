//! Container runtime contract.
//!
//! The runtime owns the local image store: it pulls nothing itself (tiers
//! do), but renames local images between tier naming schemes and
//! refreshes its view of an image object after such a rename.

use async_trait::async_trait;
use stagedock_core::{Result, StageDescription};
use tokio_util::sync::CancellationToken;

/// Mutable handle to an image inside the local container runtime.
///
/// Carries the current local name plus, once known, the stage description
/// the image was fetched under.
#[derive(Debug, Clone)]
pub struct RuntimeImage {
    name: String,
    description: Option<StageDescription>,
}

impl RuntimeImage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }

    /// Build a handle named after the description's backend-qualified name.
    pub fn from_description(description: StageDescription) -> Self {
        Self {
            name: description.info.name.clone(),
            description: Some(description),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn description(&self) -> Option<&StageDescription> {
        self.description.as_ref()
    }

    pub fn set_description(&mut self, description: StageDescription) {
        self.description = Some(description);
    }
}

/// Operations the storage manager requires from a container runtime.
///
/// Implementations must be safe under concurrent calls and must honor the
/// cancellation token.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Rename a local image and update the handle's name.
    async fn rename_image(
        &self,
        token: &CancellationToken,
        image: &mut RuntimeImage,
        new_name: &str,
    ) -> Result<()>;

    /// Refresh the runtime's view of the image object behind the handle.
    async fn refresh_image_object(
        &self,
        token: &CancellationToken,
        image: &mut RuntimeImage,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagedock_core::{ImageInfo, StageId};

    #[test]
    fn test_from_description_takes_backend_name() {
        let desc = StageDescription::new(
            StageId::new("abc", 7),
            ImageInfo {
                name: "registry.local/proj:abc-7".to_string(),
                ..Default::default()
            },
        );
        let image = RuntimeImage::from_description(desc);
        assert_eq!(image.name(), "registry.local/proj:abc-7");
        assert!(image.description().is_some());
    }

    #[test]
    fn test_set_name_keeps_description() {
        let desc = StageDescription::new(StageId::new("abc", 7), ImageInfo::default());
        let mut image = RuntimeImage::from_description(desc);
        image.set_name("elsewhere/proj:abc-7");
        assert_eq!(image.name(), "elsewhere/proj:abc-7");
        assert_eq!(image.description().unwrap().stage_id, StageId::new("abc", 7));
    }
}
