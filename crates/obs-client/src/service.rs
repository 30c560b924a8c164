//! The build-service seam.
//!
//! Every remote interaction of klp-build goes through [`BuildService`]. The
//! HTTP implementation lives in [`crate::client`]; an in-memory fake for tests
//! lives in [`crate::fakes`].

use std::path::Path;

use async_trait::async_trait;

use crate::model::{ArchResult, ProjectEntry, ProjectMeta};
use crate::ObsResult;

/// Outcome of a project deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The project did not exist; the desired state already holds.
    NotFound,
}

/// Outcome of a binary download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded,
    /// The destination file was already there; nothing was transferred.
    AlreadyPresent,
}

/// Remote build service operations used by the orchestration engine.
///
/// Implementations must be safe to call from many tasks at once; callers are
/// responsible for serializing mutations where the service requires it.
#[async_trait]
pub trait BuildService: Send + Sync {
    /// Projects whose name starts with `prefix`.
    async fn search_projects(&self, prefix: &str) -> ObsResult<Vec<ProjectEntry>>;

    /// File names of the binaries built for one package.
    async fn binary_list(
        &self,
        project: &str,
        repo: &str,
        arch: &str,
        package: &str,
    ) -> ObsResult<Vec<String>>;

    /// Store `filename` as `dest_dir/filename`.
    ///
    /// Returns [`DownloadOutcome::AlreadyPresent`] without touching the
    /// network when the destination file exists.
    async fn download_binary(
        &self,
        project: &str,
        repo: &str,
        arch: &str,
        package: &str,
        filename: &str,
        dest_dir: &Path,
    ) -> ObsResult<DownloadOutcome>;

    async fn build_log(
        &self,
        project: &str,
        repo: &str,
        arch: &str,
        package: &str,
    ) -> ObsResult<String>;

    async fn build_results(&self, project: &str) -> ObsResult<Vec<ArchResult>>;

    /// Force-delete a project, reporting a missing project as `NotFound`.
    async fn delete_project(&self, project: &str) -> ObsResult<DeleteOutcome>;

    async fn set_project_meta(&self, meta: &ProjectMeta) -> ObsResult<()>;

    async fn set_package_meta(
        &self,
        project: &str,
        package: &str,
        title: &str,
        description: &str,
    ) -> ObsResult<()>;

    /// Stage one source file for the next [`BuildService::commit`].
    async fn upload_file(
        &self,
        project: &str,
        package: &str,
        name: &str,
        content: Vec<u8>,
    ) -> ObsResult<()>;

    async fn commit(&self, project: &str, package: &str, message: &str) -> ObsResult<()>;
}
