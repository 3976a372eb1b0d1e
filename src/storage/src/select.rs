//! Per-stage suitability selection.
//!
//! Which candidate at a digest suits a stage is stage-specific policy
//! (base-image identity, git commit ancestry, and so on). The manager
//! delegates the decision through [`BuildStage`] and contributes only
//! logging plus a debug dump of the chosen descriptor.

use async_trait::async_trait;
use stagedock_core::{Result, StageDescription};
use tokio_util::sync::CancellationToken;

/// The build driver's view of one logical stage.
///
/// Implemented by the build graph; the storage manager uses it to name
/// stages in logs, to reach the stage's current image description, and
/// to delegate suitability decisions.
#[async_trait]
pub trait BuildStage: Send + Sync {
    /// Logical stage name within the build graph.
    fn name(&self) -> &str;

    /// Content digest of the stage's build inputs.
    fn digest(&self) -> &str;

    /// Human-oriented stage name for log lines.
    fn log_detailed_name(&self) -> String {
        self.name().to_string()
    }

    /// Description of the stage image currently associated with this
    /// stage, if one has been assigned.
    fn stage_description(&self) -> Option<StageDescription>;

    /// Pick the candidate satisfying this stage's suitability policy,
    /// or `None` when no candidate fits.
    async fn select_suitable_stage(
        &self,
        token: &CancellationToken,
        candidates: &[StageDescription],
    ) -> Result<Option<StageDescription>>;
}

/// Dump the chosen descriptor for debug logs.
pub(crate) fn dump_stage_description(description: &StageDescription) -> String {
    serde_yaml::to_string(description).unwrap_or_else(|err| format!("<undumpable: {}>", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagedock_core::{ImageInfo, StageId};

    #[test]
    fn test_dump_names_the_stage() {
        let description = StageDescription::new(
            StageId::new("abc", 42),
            ImageInfo {
                name: "registry.local/proj:abc-42".to_string(),
                ..Default::default()
            },
        );

        let dump = dump_stage_description(&description);
        assert!(dump.contains("abc"));
        assert!(dump.contains("registry.local/proj:abc-42"));
    }
}
