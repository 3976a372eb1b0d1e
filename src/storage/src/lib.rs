//! Stagedock Storage - Stage storage manager.
//!
//! The manager orchestrates where each build stage image lives across a
//! multi-tier storage hierarchy (primary, final, secondary read-only,
//! cache tiers, in-process manifest cache), keeps the shared
//! digest-to-stages index consistent under concurrent workers, and
//! bounds parallel per-stage I/O.

pub mod host_lock;
pub mod index;
pub mod lru;
pub mod manager;
pub mod manifest_cache;
pub mod parallel;
pub mod resolve;
pub mod runtime;
pub mod select;
pub mod tier;

// Re-export common types
pub use host_lock::HostImagesLocks;
pub use index::{
    LockHandle, LockManager, MemoryLockManager, MemoryStagesStorageCache, StagesStorageCache,
};
pub use lru::LruImagesCache;
pub use manager::{StagesList, StorageManager};
pub use manifest_cache::ManifestCache;
pub use parallel::{do_tasks, DoTasksOptions};
pub use resolve::{
    get_stage_description, rebrand_description_for_storage, GetStageDescriptionOptions,
};
pub use runtime::{ContainerRuntime, RuntimeImage};
pub use select::BuildStage;
pub use tier::{
    DeleteImageOptions, FilterStagesOptions, ForEachDeleteStageOptions, ImportMetadata,
    StagesStorage, LOCAL_STORAGE_ADDRESS,
};

/// Stagedock version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
