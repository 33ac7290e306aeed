//! In-memory forge (testing only)
//!
//! `MemoryForge` implements both forge traits against a `Mutex`-guarded
//! model of projects, namespaces, packages, pipelines and jobs, records how
//! often each mutating call was made, and can be told to fail calls.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::api::{DestinationApi, SourceApi};
use crate::error::ForgeError;
use crate::types::{CreateProject, Job, NamespaceInfo, PackageInfo, Pipeline, ProjectInfo};
use crate::ForgeResult;

/// Call kinds that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForgeOp {
    FindProject,
    FindNamespace,
    CreateProject,
    Upload,
    LatestPipeline,
    PipelineJobs,
    Download,
}

/// A package recorded by the fake, with the uploaded bytes.
#[derive(Debug, Clone)]
pub struct StoredPackage {
    pub info: PackageInfo,
    pub content: Vec<u8>,
}

#[derive(Default)]
struct ForgeState {
    next_id: u64,
    namespaces: BTreeMap<String, u64>,
    projects: BTreeMap<String, ProjectInfo>,
    packages: Vec<StoredPackage>,
    pipelines: HashMap<u64, Vec<Pipeline>>,
    jobs: HashMap<u64, Vec<Job>>,
    artifacts: HashMap<u64, Vec<u8>>,
    create_calls: usize,
    upload_calls: usize,
    denied: HashMap<ForgeOp, String>,
    failures: HashMap<ForgeOp, VecDeque<ForgeError>>,
    failing_packages: HashSet<String>,
    upload_delay: Option<Duration>,
}

impl ForgeState {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check(&mut self, op: ForgeOp) -> ForgeResult<()> {
        if let Some(capability) = self.denied.get(&op) {
            return Err(ForgeError::Forbidden {
                capability: capability.clone(),
            });
        }
        if let Some(err) = self.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(())
    }
}

/// In-memory forge.
pub struct MemoryForge {
    base_url: String,
    state: Mutex<ForgeState>,
}

impl Default for MemoryForge {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryForge {
    pub fn new() -> Self {
        Self::with_base_url("memory://forge")
    }

    pub fn with_base_url(base_url: &str) -> Self {
        MemoryForge {
            base_url: base_url.trim_end_matches('/').to_string(),
            state: Mutex::new(ForgeState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ForgeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn project_info(&self, id: u64, path: &str) -> ProjectInfo {
        ProjectInfo {
            id,
            path_with_namespace: path.to_string(),
            clone_url: format!("{}/{}.git", self.base_url, path),
            web_url: format!("{}/{}", self.base_url, path),
        }
    }

    // -----------------------------------------------------------------------
    // Seeding
    // -----------------------------------------------------------------------

    /// Register a namespace, returning its id.
    pub fn add_namespace(&self, path: &str) -> u64 {
        let mut s = self.lock();
        if let Some(id) = s.namespaces.get(path) {
            return *id;
        }
        let id = s.alloc_id();
        s.namespaces.insert(path.to_string(), id);
        id
    }

    /// Register an existing project (and its namespace).
    pub fn add_project(&self, path: &str) -> ProjectInfo {
        if let Some((ns, _)) = path.rsplit_once('/') {
            self.add_namespace(ns);
        }
        let mut s = self.lock();
        let id = s.alloc_id();
        let info = self.project_info(id, path);
        s.projects.insert(path.to_string(), info.clone());
        info
    }

    /// Register a successful pipeline on the project at `project_path`.
    pub fn add_pipeline(&self, project_path: &str, pipeline: Pipeline) {
        let existing = self.lock().projects.get(project_path).map(|p| p.id);
        let project_id = match existing {
            Some(id) => id,
            None => self.add_project(project_path).id,
        };
        self.lock()
            .pipelines
            .entry(project_id)
            .or_default()
            .push(pipeline);
    }

    /// Register a job with an artifact archive under `pipeline_id`.
    pub fn add_job(&self, pipeline_id: u64, job: Job, archive: Vec<u8>) {
        let mut s = self.lock();
        s.artifacts.insert(job.id, archive);
        s.jobs.entry(pipeline_id).or_default().push(job);
    }

    // -----------------------------------------------------------------------
    // Failure injection
    // -----------------------------------------------------------------------

    /// Every `op` call fails with `Forbidden { capability }`.
    pub fn deny(&self, op: ForgeOp, capability: &str) {
        self.lock().denied.insert(op, capability.to_string());
    }

    /// The next `op` call fails with `err`; queued errors are consumed in order.
    pub fn fail_next(&self, op: ForgeOp, err: ForgeError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    /// Uploads of `package_name` always fail with a server error.
    pub fn fail_uploads_of(&self, package_name: &str) {
        self.lock()
            .failing_packages
            .insert(package_name.to_string());
    }

    /// Hold each upload for `delay` after it has been counted.
    pub fn set_upload_delay(&self, delay: Duration) {
        self.lock().upload_delay = Some(delay);
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    pub fn upload_calls(&self) -> usize {
        self.lock().upload_calls
    }

    pub fn project(&self, path: &str) -> Option<ProjectInfo> {
        self.lock().projects.get(path).cloned()
    }

    pub fn packages(&self) -> Vec<StoredPackage> {
        self.lock().packages.clone()
    }
}

#[async_trait]
impl DestinationApi for MemoryForge {
    async fn find_project(&self, path: &str) -> ForgeResult<Option<ProjectInfo>> {
        let mut s = self.lock();
        s.check(ForgeOp::FindProject)?;
        Ok(s.projects.get(path).cloned())
    }

    async fn find_namespace(&self, path: &str) -> ForgeResult<Option<NamespaceInfo>> {
        let mut s = self.lock();
        s.check(ForgeOp::FindNamespace)?;
        Ok(s.namespaces.get(path).map(|id| NamespaceInfo {
            id: *id,
            full_path: path.to_string(),
        }))
    }

    async fn create_project(&self, request: &CreateProject) -> ForgeResult<ProjectInfo> {
        let mut s = self.lock();
        s.create_calls += 1;
        s.check(ForgeOp::CreateProject)?;

        let ns_path = s
            .namespaces
            .iter()
            .find(|(_, id)| **id == request.namespace_id)
            .map(|(p, _)| p.clone())
            .ok_or_else(|| ForgeError::NotFound(format!("namespace id {}", request.namespace_id)))?;
        let full_path = format!("{ns_path}/{}", request.path);
        if s.projects.contains_key(&full_path) {
            return Err(ForgeError::Api {
                status: 400,
                message: "has already been taken".to_string(),
            });
        }
        let id = s.alloc_id();
        let info = self.project_info(id, &full_path);
        s.projects.insert(full_path, info.clone());
        Ok(info)
    }

    async fn upload_generic_package(
        &self,
        project_id: u64,
        package_name: &str,
        version: &str,
        file: &Path,
    ) -> ForgeResult<PackageInfo> {
        let delay = {
            let mut s = self.lock();
            s.upload_calls += 1;
            s.check(ForgeOp::Upload)?;
            if s.failing_packages.contains(package_name) {
                return Err(ForgeError::Api {
                    status: 400,
                    message: format!("package '{package_name}' rejected"),
                });
            }
            if !s.projects.values().any(|p| p.id == project_id) {
                return Err(ForgeError::NotFound(format!("project id {project_id}")));
            }
            s.upload_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let content = tokio::fs::read(file).await?;
        let info = PackageInfo {
            project_id,
            package_name: package_name.to_string(),
            version: version.to_string(),
            file_name: file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size: content.len() as u64,
        };
        self.lock().packages.push(StoredPackage {
            info: info.clone(),
            content,
        });
        Ok(info)
    }
}

#[async_trait]
impl SourceApi for MemoryForge {
    async fn project_id(&self, path: &str) -> ForgeResult<u64> {
        let mut s = self.lock();
        s.check(ForgeOp::FindProject)?;
        s.projects
            .get(path)
            .map(|p| p.id)
            .ok_or_else(|| ForgeError::NotFound(format!("project '{path}'")))
    }

    async fn latest_successful_pipeline(
        &self,
        project_id: u64,
        git_ref: Option<&str>,
    ) -> ForgeResult<Option<Pipeline>> {
        let mut s = self.lock();
        s.check(ForgeOp::LatestPipeline)?;
        Ok(s.pipelines.get(&project_id).and_then(|ps| {
            ps.iter()
                .filter(|p| git_ref.map(|r| p.git_ref == r).unwrap_or(true))
                .max_by_key(|p| p.id)
                .cloned()
        }))
    }

    async fn pipeline_jobs_with_artifacts(
        &self,
        _project_id: u64,
        pipeline_id: u64,
    ) -> ForgeResult<Vec<Job>> {
        let mut s = self.lock();
        s.check(ForgeOp::PipelineJobs)?;
        Ok(s.jobs.get(&pipeline_id).cloned().unwrap_or_default())
    }

    async fn download_job_artifacts(
        &self,
        _project_id: u64,
        job_id: u64,
        dest: &Path,
    ) -> ForgeResult<u64> {
        let bytes = {
            let mut s = self.lock();
            s.check(ForgeOp::Download)?;
            s.artifacts
                .get(&job_id)
                .cloned()
                .ok_or_else(|| ForgeError::NotFound(format!("artifacts of job {job_id}")))?
        };
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }
}
