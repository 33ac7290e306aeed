//! CI artifact transfer.
//!
//! Pack side: find the latest successful pipeline and download every job
//! archive into `artifacts/<job_name>/artifacts.zip`. Ingest side: publish
//! archives as generic packages (`job_name` / `pipeline_id`) and/or copy
//! the `artifacts/` tree to a local directory.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use forge_client::{DestinationApi, PackageInfo, ProjectInfo, SourceApi};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, TransferError};
use crate::manifest::ArtifactRef;
use crate::naming::sanitize_component;
use crate::retry::RetryPolicy;

/// File name used for every downloaded job archive.
pub const ARCHIVE_FILE: &str = "artifacts.zip";

/// Artifacts downloaded at pack time.
#[derive(Debug, Clone, Default)]
pub struct DownloadOutcome {
    pub artifacts: Vec<ArtifactRef>,
    pub warnings: Vec<String>,
}

/// What a local extraction wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractSummary {
    pub files: u64,
    pub bytes: u64,
}

impl ExtractSummary {
    fn add(&mut self, other: ExtractSummary) {
        self.files += other.files;
        self.bytes += other.bytes;
    }
}

/// Download the artifacts of the latest successful pipeline into
/// `<bundle_root>/artifacts/`.
///
/// Returns [`TransferError::NoArtifacts`] when there is no successful
/// pipeline or no job produced artifacts; callers treat that as a warning.
/// A failed download of a single job is recorded in `warnings`.
pub async fn download_artifacts(
    source: &dyn SourceApi,
    project_path: &str,
    git_ref: Option<&str>,
    bundle_root: &Path,
    retry: &RetryPolicy,
) -> Result<DownloadOutcome> {
    let project_id = retry
        .run("project lookup", || source.project_id(project_path))
        .await?;

    let pipeline = retry
        .run("pipeline lookup", || {
            source.latest_successful_pipeline(project_id, git_ref)
        })
        .await?
        .ok_or_else(|| {
            TransferError::NoArtifacts(format!(
                "no successful pipeline for {project_path} on {}",
                git_ref.unwrap_or("the default branch")
            ))
        })?;

    let jobs = retry
        .run("job listing", || {
            source.pipeline_jobs_with_artifacts(project_id, pipeline.id)
        })
        .await?;
    if jobs.is_empty() {
        return Err(TransferError::NoArtifacts(format!(
            "pipeline {} of {project_path} has no jobs with artifacts",
            pipeline.id
        )));
    }
    info!(
        project = %project_path,
        pipeline_id = pipeline.id,
        jobs = jobs.len(),
        "downloading artifacts"
    );

    let mut outcome = DownloadOutcome::default();
    let mut taken = HashSet::new();
    for job in jobs {
        let job_name = unique_job_dir(&job.name, job.id, &mut taken);
        let dir = bundle_root.join("artifacts").join(&job_name);
        tokio::fs::create_dir_all(&dir).await?;
        let dest = dir.join(ARCHIVE_FILE);

        let result = retry
            .run("artifact download", || {
                source.download_job_artifacts(project_id, job.id, &dest)
            })
            .await;
        match result {
            Ok(file_size) => {
                debug!(job = %job.name, bytes = file_size, "artifact downloaded");
                outcome.artifacts.push(ArtifactRef {
                    job_id: job.id,
                    job_name,
                    file_name: ARCHIVE_FILE.to_string(),
                    file_size,
                    pipeline_id: pipeline.id,
                    git_ref: pipeline.git_ref.clone(),
                });
            }
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&dir).await;
                let warning = format!("artifact download for job '{}' failed: {e}", job.name);
                warn!(job_id = job.id, error = %e, "artifact download failed");
                outcome.warnings.push(warning);
            }
        }
    }
    Ok(outcome)
}

/// Directory name for a job's archive. Distinct job names can sanitize to
/// the same string (`build:linux`, `build_linux`); later ones get the job id.
fn unique_job_dir(name: &str, job_id: u64, taken: &mut HashSet<String>) -> String {
    let base = sanitize_component(name);
    let mut candidate = base.clone();
    let mut n = 0u32;
    while !taken.insert(candidate.clone()) {
        candidate = if n == 0 {
            format!("{base}_{job_id}")
        } else {
            format!("{base}_{job_id}_{n}")
        };
        n += 1;
    }
    candidate
}

/// Fail unless `path` is a regular file; symlinks are not followed.
fn require_regular_file(path: &Path, missing: &str) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_file() => Ok(()),
        Ok(_) => Err(TransferError::CorruptBundle {
            path: path.to_path_buf(),
            detail: "artifact archive is not a regular file".to_string(),
        }),
        Err(_) => Err(TransferError::CorruptBundle {
            path: path.to_path_buf(),
            detail: missing.to_string(),
        }),
    }
}

/// Upload one artifact archive as a generic package on `project`.
pub async fn publish(
    dest: &dyn DestinationApi,
    artifact: &ArtifactRef,
    bundle_root: &Path,
    project: &ProjectInfo,
    retry: &RetryPolicy,
) -> Result<PackageInfo> {
    let file = bundle_root.join(artifact.bundle_path());
    require_regular_file(&file, "artifact archive listed in manifest is missing")?;
    let version = artifact.package_version();
    let package = retry
        .run("package upload", || {
            dest.upload_generic_package(project.id, artifact.package_name(), &version, &file)
        })
        .await?;
    info!(
        project = %project.path_with_namespace,
        package = %package.package_name,
        version = %package.version,
        size = package.size,
        "artifact published"
    );
    Ok(package)
}

/// Copy one artifact archive to `out/<job_name>/<file_name>`.
pub async fn extract_local(
    artifact: &ArtifactRef,
    bundle_root: &Path,
    out: &Path,
) -> Result<ExtractSummary> {
    let rel = artifact
        .bundle_path()
        .strip_prefix("artifacts")
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| artifact.bundle_path());
    let src = bundle_root.join(artifact.bundle_path());
    let dst = out.join(rel);
    tokio::task::spawn_blocking(move || -> Result<ExtractSummary> {
        require_regular_file(&src, "artifact archive listed in manifest is missing")?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = fs::copy(&src, &dst)?;
        Ok(ExtractSummary { files: 1, bytes })
    })
    .await?
}

/// Copy the whole `artifacts_dir` tree into `out`, preserving relative paths.
pub async fn extract_all(artifacts_dir: &Path, out: &Path) -> Result<ExtractSummary> {
    let src = artifacts_dir.to_path_buf();
    let dst = out.to_path_buf();
    let summary = tokio::task::spawn_blocking(move || copy_tree(&src, &dst)).await??;
    info!(
        out = %out.display(),
        files = summary.files,
        bytes = summary.bytes,
        "artifacts extracted"
    );
    Ok(summary)
}

fn copy_tree(src: &Path, dst: &Path) -> Result<ExtractSummary> {
    let mut summary = ExtractSummary::default();
    fs::create_dir_all(dst)?;
    let mut entries: Vec<PathBuf> = fs::read_dir(src)?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    entries.sort();
    for path in entries {
        let Some(name) = path.file_name() else {
            continue;
        };
        let target = dst.join(name);
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            summary.add(copy_tree(&path, &target)?);
        } else if meta.is_file() {
            let bytes = fs::copy(&path, &target)?;
            summary.add(ExtractSummary { files: 1, bytes });
        } else {
            debug!(path = %path.display(), "skipping non-regular file");
        }
    }
    Ok(summary)
}
