//! Stagedock Core - Foundational Types and Abstractions
//!
//! This module provides the foundational types shared across the
//! stagedock stage storage subsystem: the error taxonomy, configuration,
//! and the stage/image data model.

pub mod config;
pub mod error;
pub mod stage;

// Re-export commonly used types
pub use config::{ParallelConfig, StorageConfig};
pub use error::{DockError, Result};
pub use stage::{
    parse_repository_and_tag, ImageInfo, ImageInfoGetter, StageDescription, StageId,
};

/// Stagedock version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
