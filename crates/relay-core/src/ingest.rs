//! Per-bundle ingest job.
//!
//! A job walks a fixed state machine:
//!
//! ```text
//! Pending -> Resolving -> Provisioning -> Mirroring -> PublishingArtifacts -> Recording -> Done
//!    \____________\______________\____________\_______________\-> Failed -> Recording
//! ```
//!
//! Failed jobs are still recorded, so every job that is not abandoned
//! leaves exactly one history entry. Cancellation is observed at every
//! state boundary; a job cancelled at a boundary is abandoned and not
//! recorded. A job whose last step finished is recorded even if the batch
//! was cancelled meanwhile.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use forge_client::{DestinationApi, GitLabClient, PackageInfo, ProjectInfo};
use relay_state::{HistoryEntry, HistoryLedger, JsonHistoryLedger, MappingStore};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use crate::artifacts::{self, ExtractSummary};
use crate::bundle::{open_bundle, OpenedBundle, BUNDLE_SUFFIX};
use crate::config::IngestConfig;
use crate::error::{Result, TransferError};
use crate::mirror::{GitProcessTransport, MirrorBlob, MirrorTransport, PushResult, PushTarget};
use crate::naming::derive_repo_name;
use crate::obs;
use crate::provision::Provisioner;
use crate::resolver::{NameResolver, SubmoduleMap};

/// File name of the history ledger inside the config directory.
pub const HISTORY_FILE: &str = "history.json";

/// Lifecycle state of an ingest job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Resolving,
    Provisioning,
    Mirroring,
    PublishingArtifacts,
    Recording,
    Done,
    Failed,
    Abandoned,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Resolving => "resolving",
            JobState::Provisioning => "provisioning",
            JobState::Mirroring => "mirroring",
            JobState::PublishingArtifacts => "publishing_artifacts",
            JobState::Recording => "recording",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Abandoned)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one submodule's provisioning and mirror.
#[derive(Debug, Clone, Serialize)]
pub struct SubmoduleOutcome {
    pub path: String,
    pub source_url: String,
    pub target_path: String,
    pub created: bool,
    pub push: Option<PushResult>,
    pub error: Option<String>,
}

/// Everything a job did, returned to the orchestrator and printed by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub bundle: PathBuf,
    pub bundle_name: String,
    pub state: JobState,
    /// External repository name from the manifest
    pub source_repo: String,
    /// Destination project path
    pub target_repo: String,
    pub created: bool,
    pub push: Option<PushResult>,
    pub submodules: Vec<SubmoduleOutcome>,
    /// Submodule source URL -> destination project path
    pub url_map: BTreeMap<String, String>,
    pub packages: Vec<PackageInfo>,
    pub extracted: Option<ExtractSummary>,
    pub warnings: Vec<String>,
    /// Mutations a dry run would have performed
    pub planned: Vec<String>,
    pub error: Option<String>,
    pub duration: Duration,
    /// Whether a history entry was written
    pub recorded: bool,
}

impl JobReport {
    pub fn new(bundle: &Path) -> Self {
        let mut job_id = uuid::Uuid::new_v4().simple().to_string();
        job_id.truncate(8);
        Self {
            job_id,
            bundle: bundle.to_path_buf(),
            bundle_name: bundle
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            state: JobState::Pending,
            source_repo: String::new(),
            target_repo: String::new(),
            created: false,
            push: None,
            submodules: Vec::new(),
            url_map: BTreeMap::new(),
            packages: Vec::new(),
            extracted: None,
            warnings: Vec::new(),
            planned: Vec::new(),
            error: None,
            duration: Duration::ZERO,
            recorded: false,
        }
    }

    /// Report for a job that never started.
    pub fn abandoned(bundle: &Path) -> Self {
        let mut report = Self::new(bundle);
        report.state = JobState::Abandoned;
        report.error = Some(TransferError::Cancelled.to_string());
        report
    }

    pub fn succeeded(&self) -> bool {
        self.state == JobState::Done
    }

    /// Number of artifacts delivered: extracted files, else published packages.
    pub fn artifacts_count(&self) -> u64 {
        match self.extracted {
            Some(summary) => summary.files,
            None => self.packages.len() as u64,
        }
    }
}

/// Shared, read-only collaborators for every job in a batch.
#[derive(Clone)]
pub struct IngestContext {
    pub config: Arc<IngestConfig>,
    pub resolver: Arc<NameResolver>,
    pub submodule_map: Arc<SubmoduleMap>,
    pub destination: Arc<dyn DestinationApi>,
    pub transport: Arc<dyn MirrorTransport>,
    pub ledger: Arc<dyn HistoryLedger>,
}

impl IngestContext {
    pub fn new(
        config: IngestConfig,
        resolver: NameResolver,
        destination: Arc<dyn DestinationApi>,
        transport: Arc<dyn MirrorTransport>,
        ledger: Arc<dyn HistoryLedger>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            resolver: Arc::new(resolver),
            submodule_map: Arc::new(SubmoduleMap::default()),
            destination,
            transport,
            ledger,
        }
    }

    pub fn with_submodule_map(mut self, map: SubmoduleMap) -> Self {
        self.submodule_map = Arc::new(map);
        self
    }

    /// Build the production context: the profile's mapping table from
    /// `config_dir`, the REST client, `git`, and the JSON history ledger.
    pub async fn connect(config: IngestConfig, config_dir: &Path) -> Result<Self> {
        let store = MappingStore::open(config_dir)?;
        let table = store.load(&config.profile)?;
        debug!(profile = %config.profile, mappings = table.len(), "mapping table loaded");
        let resolver = NameResolver::new(table).with_namespace(config.destination.namespace.clone());

        let submodule_map = match &config.submodule_mapping_file {
            Some(path) => SubmoduleMap::load(path)?,
            None => SubmoduleMap::default(),
        };

        let forge = GitLabClient::new(config.destination.forge_config(config.call_timeout))?;
        let transport = GitProcessTransport::new()
            .with_timeout(config.git_timeout)
            .with_verify_tls(config.destination.verify_tls);
        let ledger = JsonHistoryLedger::open(config_dir.join(HISTORY_FILE)).await?;

        Ok(Self::new(
            config,
            resolver,
            Arc::new(forge),
            Arc::new(transport),
            Arc::new(ledger),
        )
        .with_submodule_map(submodule_map))
    }
}

/// Run one bundle through the whole state machine.
pub async fn run_job(ctx: &IngestContext, bundle: &Path, cancel: &CancellationToken) -> JobReport {
    let report = JobReport::new(bundle);
    let span = obs::job_span(&report.job_id, &report.bundle_name);
    let job = IngestJob {
        ctx,
        cancel,
        report,
        started: Instant::now(),
    };
    job.run().instrument(span).await
}

struct IngestJob<'a> {
    ctx: &'a IngestContext,
    cancel: &'a CancellationToken,
    report: JobReport,
    started: Instant,
}

impl IngestJob<'_> {
    async fn run(mut self) -> JobReport {
        obs::emit_job_started(&self.report.job_id, &self.report.bundle_name, self.ctx.config.dry_run);
        let result = self.execute().await;
        self.finish(result).await
    }

    /// Fail with `Cancelled` once the batch has been cancelled.
    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    fn transition(&mut self, to: JobState) -> Result<()> {
        self.checkpoint()?;
        self.set_state(to);
        Ok(())
    }

    fn set_state(&mut self, to: JobState) {
        obs::emit_job_transition(&self.report.job_id, self.report.state, to);
        self.report.state = to;
    }

    fn warn(&mut self, warning: String) {
        obs::emit_job_warning(&self.report.job_id, &warning);
        self.report.warnings.push(warning);
    }

    fn plan(&mut self, action: String) {
        debug!(action = %action, "dry run");
        self.report.planned.push(action);
    }

    async fn execute(&mut self) -> Result<()> {
        let config = self.ctx.config.clone();
        let scratch = match &config.work_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                tempfile::Builder::new().prefix("relay-job-").tempdir_in(dir)?
            }
            None => tempfile::Builder::new().prefix("relay-job-").tempdir()?,
        };

        self.transition(JobState::Resolving)?;
        let opened = open_bundle(&self.report.bundle, scratch.path()).await?;
        let source_repo = opened.manifest.repository_name()?;
        self.report.source_repo = source_repo.clone();
        let target = match &config.target_path {
            Some(path) => path.clone(),
            None => self.ctx.resolver.target_path(&source_repo)?,
        };
        self.report.target_repo = target.clone();

        self.transition(JobState::Provisioning)?;
        let provisioner = Provisioner::new(self.ctx.destination.clone(), config.retry)
            .with_dry_run(config.dry_run);
        let (project, created) = provisioner.ensure_project(&target, config.visibility).await?;
        self.report.created = created;
        if config.dry_run && created {
            self.plan(format!("create project {target} ({})", config.visibility));
        }

        self.transition(JobState::Mirroring)?;
        let blob = MirrorBlob::new(opened.repository_mirror(&source_repo)?);
        self.report.push = self.mirror(&blob, &project, &target).await?;
        self.mirror_submodules(&opened, &provisioner, &target).await?;

        self.transition(JobState::PublishingArtifacts)?;
        self.deliver_artifacts(&opened, &project).await?;
        Ok(())
    }

    fn push_target(&self, project: &ProjectInfo) -> PushTarget {
        let destination = &self.ctx.config.destination;
        let url = if project.clone_url.is_empty() {
            destination
                .forge_config(self.ctx.config.call_timeout)
                .clone_url(&project.path_with_namespace)
        } else {
            project.clone_url.clone()
        };
        PushTarget {
            url,
            credentials: destination.git_credentials(),
        }
    }

    async fn mirror(
        &mut self,
        blob: &MirrorBlob,
        project: &ProjectInfo,
        target: &str,
    ) -> Result<Option<PushResult>> {
        let config = self.ctx.config.clone();
        if config.dry_run {
            let refs = self.ctx.transport.list_refs(blob).await?;
            self.plan(format!(
                "mirror {} ref(s) to {target} ({:?})",
                refs.len(),
                config.force_policy
            ));
            return Ok(None);
        }
        let push_target = self.push_target(project);
        let transport = self.ctx.transport.clone();
        let push = config
            .retry
            .run("mirror push", || {
                transport.apply_mirror(blob, &push_target, config.force_policy)
            })
            .await?;
        Ok(Some(push))
    }

    async fn mirror_submodules(
        &mut self,
        opened: &OpenedBundle,
        provisioner: &Provisioner,
        parent_target: &str,
    ) -> Result<()> {
        let parent_namespace = parent_target
            .rsplit_once('/')
            .map(|(ns, _)| ns.to_string())
            .unwrap_or_default();

        for sub in &opened.manifest.submodules {
            self.checkpoint()?;
            let target_path = match self.ctx.submodule_map.get(&sub.path) {
                Some(mapped) => mapped.to_string(),
                None => format!("{parent_namespace}/{}", derive_repo_name(&sub.url)),
            };
            self.report
                .url_map
                .insert(sub.url.clone(), target_path.clone());

            let mut outcome = SubmoduleOutcome {
                path: sub.path.clone(),
                source_url: sub.url.clone(),
                target_path: target_path.clone(),
                created: false,
                push: None,
                error: None,
            };
            let result = async {
                let (project, created) = provisioner
                    .ensure_project(&target_path, self.ctx.config.visibility)
                    .await?;
                outcome.created = created;
                let blob = MirrorBlob::new(opened.submodule_mirror(sub));
                if !blob.path.is_dir() {
                    return Err(TransferError::CorruptBundle {
                        path: blob.path.clone(),
                        detail: format!("mirror of submodule '{}' is missing", sub.path),
                    });
                }
                self.mirror(&blob, &project, &target_path).await
            }
            .await;

            match result {
                Ok(push) => outcome.push = push,
                Err(TransferError::Cancelled) => return Err(TransferError::Cancelled),
                Err(e) => {
                    warn!(submodule = %sub.path, target = %target_path, error = %e, "submodule transfer failed");
                    outcome.error = Some(e.to_string());
                    self.warn(format!("submodule '{}' -> {target_path}: {e}", sub.path));
                }
            }
            self.report.submodules.push(outcome);
        }
        Ok(())
    }

    async fn deliver_artifacts(&mut self, opened: &OpenedBundle, project: &ProjectInfo) -> Result<()> {
        let config = self.ctx.config.clone();
        if config.skip_artifacts {
            debug!("artifact delivery skipped");
            return Ok(());
        }
        if !opened.has_artifacts() {
            if !opened.manifest.artifacts.is_empty() {
                self.warn("manifest lists artifacts but the bundle has no artifacts/ directory".to_string());
            }
            return Ok(());
        }

        if let Some(out) = &config.artifacts_output_dir {
            let out = out.join(self.artifacts_subdir());
            if config.dry_run {
                self.plan(format!("extract artifacts to {}", out.display()));
            } else {
                self.report.extracted = Some(artifacts::extract_all(&opened.artifacts_dir(), &out).await?);
            }
            if !config.publish_artifacts {
                return Ok(());
            }
        }

        for artifact in &opened.manifest.artifacts {
            self.checkpoint()?;
            if config.dry_run {
                self.plan(format!(
                    "publish package {}/{} to {}",
                    artifact.package_name(),
                    artifact.package_version(),
                    project.path_with_namespace
                ));
                continue;
            }
            match artifacts::publish(
                self.ctx.destination.as_ref(),
                artifact,
                &opened.root,
                project,
                &config.retry,
            )
            .await
            {
                Ok(package) => self.report.packages.push(package),
                Err(e) => self.warn(format!(
                    "package {}/{} not published: {e}",
                    artifact.package_name(),
                    artifact.package_version()
                )),
            }
        }
        Ok(())
    }

    /// Per-job directory under the artifacts output root, named after the
    /// bundle so parallel jobs never write to the same files.
    fn artifacts_subdir(&self) -> String {
        let name = &self.report.bundle_name;
        name.strip_suffix(BUNDLE_SUFFIX).unwrap_or(name).to_string()
    }

    async fn finish(mut self, result: Result<()>) -> JobReport {
        let config = self.ctx.config.clone();
        let failed = match result {
            Ok(()) => None,
            Err(TransferError::Cancelled) => {
                return self.abandon();
            }
            Err(e) => {
                self.set_state(JobState::Failed);
                Some(e.to_string())
            }
        };
        self.report.error = failed.clone();

        self.set_state(JobState::Recording);
        self.report.duration = self.started.elapsed();

        if config.dry_run {
            debug!("dry run, history not recorded");
        } else {
            let entry = match &failed {
                None => HistoryEntry::success(
                    &self.report.bundle_name,
                    &self.report.source_repo,
                    &self.report.target_repo,
                    &config.profile,
                    self.report.artifacts_count(),
                    self.report.duration,
                ),
                Some(message) => HistoryEntry::failure(
                    &self.report.bundle_name,
                    &self.report.source_repo,
                    &self.report.target_repo,
                    &config.profile,
                    message.as_str(),
                    self.report.duration,
                ),
            };
            match self.ctx.ledger.append(entry).await {
                Ok(()) => self.report.recorded = true,
                Err(e) => self.warn(format!("history entry not written: {e}")),
            }
        }

        let terminal = if failed.is_some() {
            JobState::Failed
        } else {
            JobState::Done
        };
        self.set_state(terminal);
        obs::emit_job_finished(
            &self.report.job_id,
            terminal,
            &self.report.target_repo,
            self.report.duration.as_millis() as u64,
            self.report.warnings.len(),
        );
        self.report
    }

    fn abandon(mut self) -> JobReport {
        self.set_state(JobState::Abandoned);
        self.report.error = Some(TransferError::Cancelled.to_string());
        self.report.duration = self.started.elapsed();
        obs::emit_job_finished(
            &self.report.job_id,
            JobState::Abandoned,
            &self.report.target_repo,
            self.report.duration.as_millis() as u64,
            self.report.warnings.len(),
        );
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(JobState::PublishingArtifacts.to_string(), "publishing_artifacts");
        assert_eq!(
            serde_json::to_value(JobState::Recording).unwrap(),
            serde_json::json!("recording")
        );
        assert!(JobState::Abandoned.is_terminal());
        assert!(!JobState::Recording.is_terminal());
    }

    #[test]
    fn test_artifacts_count_prefers_extraction() {
        let mut r = JobReport::new(Path::new("/b/x.tar.gz"));
        assert_eq!(r.bundle_name, "x.tar.gz");
        assert_eq!(r.job_id.len(), 8);
        r.packages.push(PackageInfo {
            project_id: 1,
            package_name: "build".to_string(),
            version: "77".to_string(),
            file_name: "artifacts.zip".to_string(),
            size: 3,
        });
        assert_eq!(r.artifacts_count(), 1);
        r.extracted = Some(ExtractSummary { files: 4, bytes: 10 });
        assert_eq!(r.artifacts_count(), 4);
    }

    #[test]
    fn test_abandoned_report() {
        let r = JobReport::abandoned(Path::new("/b/app-20240101T000000.tar.gz"));
        assert_eq!(r.state, JobState::Abandoned);
        assert!(!r.recorded);
        assert_eq!(r.error.as_deref(), Some(TransferError::Cancelled.to_string().as_str()));
    }
}
