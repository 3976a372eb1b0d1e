use thiserror::Error;

/// Stagedock error types.
///
/// The storage sentinels (`StageNotFound`, `BrokenImage`,
/// `ShouldResetStorageCache`) are part of the cross-module contract: they
/// survive `?`-propagation as variants, so callers classify them with the
/// `is_*` helpers instead of inspecting error text.
#[derive(Error, Debug)]
pub enum DockError {
    /// A stage descriptor is absent where an ID said it should be.
    #[error("stage not found: {image_name}")]
    StageNotFound { image_name: String },

    /// A backend reported the stored image as unusable.
    #[error("broken image: {image_name}")]
    BrokenImage { image_name: String },

    /// The stages storage cache is known to be stale; the caller must
    /// reset it and retry.
    #[error("should reset stages storage cache")]
    ShouldResetStorageCache,

    /// Storage backend failure
    #[error("storage error: {0}")]
    StorageError(String),

    /// Stages storage cache or manifest cache failure
    #[error("cache error: {0}")]
    CacheError(String),

    /// Lock manager or host lock failure
    #[error("lock error: {0}")]
    LockError(String),

    /// Container runtime failure
    #[error("runtime error: {0}")]
    RuntimeError(String),

    /// The operation's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl DockError {
    /// Whether this error is the stage-not-found sentinel.
    pub fn is_stage_not_found(&self) -> bool {
        matches!(self, DockError::StageNotFound { .. })
    }

    /// Whether this error is the broken-image sentinel.
    pub fn is_broken_image(&self) -> bool {
        matches!(self, DockError::BrokenImage { .. })
    }

    /// Whether this error demands a stages storage cache reset.
    pub fn is_should_reset_storage_cache(&self) -> bool {
        matches!(self, DockError::ShouldResetStorageCache)
    }
}

impl From<serde_json::Error> for DockError {
    fn from(err: serde_json::Error) -> Self {
        DockError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for DockError {
    fn from(err: serde_yaml::Error) -> Self {
        DockError::SerializationError(err.to_string())
    }
}

/// Result type alias for stagedock operations
pub type Result<T> = std::result::Result<T, DockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_classification() {
        let err = DockError::StageNotFound {
            image_name: "repo:a-1".to_string(),
        };
        assert!(err.is_stage_not_found());
        assert!(!err.is_broken_image());
        assert!(!err.is_should_reset_storage_cache());

        let err = DockError::BrokenImage {
            image_name: "repo:a-1".to_string(),
        };
        assert!(err.is_broken_image());

        assert!(DockError::ShouldResetStorageCache.is_should_reset_storage_cache());
    }

    #[test]
    fn test_sentinels_survive_propagation() {
        fn inner() -> Result<()> {
            Err(DockError::ShouldResetStorageCache)
        }
        fn outer() -> Result<()> {
            inner()?;
            Ok(())
        }
        let err = outer().unwrap_err();
        assert!(err.is_should_reset_storage_cache());
    }

    #[test]
    fn test_display_names_the_image() {
        let err = DockError::BrokenImage {
            image_name: "registry.local/proj:d-42".to_string(),
        };
        assert!(err.to_string().contains("registry.local/proj:d-42"));
    }
}
