//! obs-client: Open Build Service integration for klp-build
//!
//! This crate owns every conversation with the remote build service:
//! project search, metadata, binary listings and downloads, build results,
//! logs and source commits.
//!
//! ## Key Components
//!
//! - `BuildService`: the async seam the orchestration engine programs against
//! - `ObsClient`: reqwest implementation of `BuildService`
//! - `fakes::MemoryBuildService`: in-memory implementation for tests

pub mod client;
pub mod config;
mod error;
pub mod fakes;
pub mod model;
pub mod service;

pub use client::ObsClient;
pub use config::ObsConfig;
pub use error::ObsError;
pub use model::{ArchResult, ProjectEntry, ProjectMeta, RepositoryEntry, RepositoryPath};
pub use service::{BuildService, DeleteOutcome, DownloadOutcome};

/// Result type for build service operations
pub type ObsResult<T> = std::result::Result<T, ObsError>;
