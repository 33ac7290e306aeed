//! Forge API traits.
//!
//! The engine only talks to a forge through these two traits: the
//! destination side (project lookup/creation and package upload) and the
//! source side (pipelines, jobs, artifact archives). `GitLabClient` and
//! `fakes::MemoryForge` implement both.

use std::path::Path;

use async_trait::async_trait;

use crate::types::{CreateProject, Job, NamespaceInfo, PackageInfo, Pipeline, ProjectInfo};
use crate::ForgeResult;

/// Operations against the forge receiving the transfer.
#[async_trait]
pub trait DestinationApi: Send + Sync {
    /// Look up a project by full path. `Ok(None)` when it does not exist.
    async fn find_project(&self, path: &str) -> ForgeResult<Option<ProjectInfo>>;

    /// Look up a namespace by full path. `Ok(None)` when it does not exist.
    async fn find_namespace(&self, path: &str) -> ForgeResult<Option<NamespaceInfo>>;

    /// Create a project. Callers check existence first.
    async fn create_project(&self, request: &CreateProject) -> ForgeResult<ProjectInfo>;

    /// Upload `file` as a generic package `name`/`version` on `project_id`.
    async fn upload_generic_package(
        &self,
        project_id: u64,
        package_name: &str,
        version: &str,
        file: &Path,
    ) -> ForgeResult<PackageInfo>;
}

/// Operations against the forge a repository is packed from.
#[async_trait]
pub trait SourceApi: Send + Sync {
    /// Numeric id of the project at `path`.
    async fn project_id(&self, path: &str) -> ForgeResult<u64>;

    /// Latest successful pipeline for `git_ref`, or for the default branch.
    async fn latest_successful_pipeline(
        &self,
        project_id: u64,
        git_ref: Option<&str>,
    ) -> ForgeResult<Option<Pipeline>>;

    /// Jobs of `pipeline_id` that produced artifacts.
    async fn pipeline_jobs_with_artifacts(
        &self,
        project_id: u64,
        pipeline_id: u64,
    ) -> ForgeResult<Vec<Job>>;

    /// Stream a job's artifact archive to `dest`, returning bytes written.
    async fn download_job_artifacts(
        &self,
        project_id: u64,
        job_id: u64,
        dest: &Path,
    ) -> ForgeResult<u64>;
}
