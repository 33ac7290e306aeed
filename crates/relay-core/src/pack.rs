//! Pack pipeline: source repository (+ submodules, + CI artifacts) to bundle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use forge_client::{GitLabClient, SourceApi};
use tracing::{info, warn};

use crate::artifacts::download_artifacts;
use crate::bundle::{write_bundle, BUNDLE_SUFFIX};
use crate::config::{PackRequest, PackSource};
use crate::error::{Result, TransferError};
use crate::manifest::{self, Manifest, SubmoduleRef, FORMAT_VERSION, MANIFEST_FILE};
use crate::mirror::{GitCredentials, GitProcessTransport, MirrorBlob, MirrorTransport};
use crate::naming::{derive_repo_name, redact_url, resolve_submodule_url, sanitize_component};

/// Result of a pack run.
#[derive(Debug, Clone)]
pub struct PackOutcome {
    pub bundle_path: PathBuf,
    pub manifest: Manifest,
    pub warnings: Vec<String>,
}

/// Compact UTC timestamp used in manifests and bundle names.
pub fn compact_timestamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

/// Packs repositories using injected transport and source API.
pub struct Packer {
    transport: Arc<dyn MirrorTransport>,
    source_api: Option<Arc<dyn SourceApi>>,
}

impl Packer {
    pub fn new(transport: Arc<dyn MirrorTransport>) -> Self {
        Self {
            transport,
            source_api: None,
        }
    }

    pub fn with_source_api(mut self, api: Arc<dyn SourceApi>) -> Self {
        self.source_api = Some(api);
        self
    }

    /// Packer backed by `git` and, for forge sources, the forge REST API.
    pub fn connect(request: &PackRequest) -> Result<Self> {
        let transport = GitProcessTransport::new()
            .with_timeout(request.git_timeout)
            .with_verify_tls(request.verify_tls);
        let mut packer = Self::new(Arc::new(transport));
        if let PackSource::Forge { forge, .. } = &request.source {
            let config = forge.clone().with_verify_tls(request.verify_tls);
            packer = packer.with_source_api(Arc::new(GitLabClient::new(config)?));
        }
        Ok(packer)
    }

    async fn clone_into(
        &self,
        url: &str,
        credentials: Option<&GitCredentials>,
        dest: &Path,
        request: &PackRequest,
    ) -> Result<MirrorBlob> {
        request
            .retry
            .run("mirror clone", || async move {
                if tokio::fs::metadata(dest).await.is_ok() {
                    tokio::fs::remove_dir_all(dest).await?;
                }
                self.transport.create_mirror(url, credentials, dest).await
            })
            .await
    }

    /// Mirror, collect and archive one repository.
    pub async fn pack(&self, request: &PackRequest) -> Result<PackOutcome> {
        request.validate()?;
        let source_url = request.source.clone_url();
        let credentials = request.source.credentials();
        let name = match &request.repo_name {
            Some(n) => sanitize_component(n),
            None => derive_repo_name(&source_url),
        };
        let mut warnings = Vec::new();

        let staging = match &request.work_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                tempfile::Builder::new().prefix("relay-pack-").tempdir_in(dir)?
            }
            None => tempfile::Builder::new().prefix("relay-pack-").tempdir()?,
        };
        let root = staging.path().join(&name);
        tokio::fs::create_dir_all(&root).await?;

        info!(source = %redact_url(&source_url), name = %name, "packing repository");
        let blob = self
            .clone_into(&source_url, credentials.as_ref(), &root.join(format!("{name}.git")), request)
            .await?;

        let mut submodules = Vec::new();
        if request.with_submodules {
            submodules = self
                .mirror_submodules(&blob, &source_url, credentials.as_ref(), &root, request, &mut warnings)
                .await?;
        }

        let mut artifacts = Vec::new();
        if request.with_artifacts {
            match (&request.source, &self.source_api) {
                (PackSource::Forge { repo_path, .. }, Some(api)) => {
                    match download_artifacts(
                        api.as_ref(),
                        repo_path,
                        request.artifacts_ref.as_deref(),
                        &root,
                        &request.retry,
                    )
                    .await
                    {
                        Ok(outcome) => {
                            artifacts = outcome.artifacts;
                            warnings.extend(outcome.warnings);
                        }
                        Err(TransferError::NoArtifacts(msg)) => {
                            warn!(reason = %msg, "no artifacts to pack");
                            warnings.push(msg);
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ => warnings.push("artifacts requested but no forge API is available".to_string()),
            }
            if artifacts.is_empty() {
                let _ = tokio::fs::remove_dir_all(root.join("artifacts")).await;
            }
        }

        let created_at = compact_timestamp();
        let (repo_path, source_forge) = match &request.source {
            PackSource::Forge { forge, repo_path } => {
                (Some(repo_path.clone()), Some(forge.base_url.clone()))
            }
            PackSource::Url { .. } => (None, None),
        };
        let manifest = Manifest {
            format_version: Some(FORMAT_VERSION),
            repo_url: redact_url(&source_url),
            repo_name: name.clone(),
            repo_path,
            source_url: source_forge,
            created_at: created_at.clone(),
            vcs_version: self.transport.version().await?,
            with_submodules: !submodules.is_empty(),
            submodules,
            with_artifacts: !artifacts.is_empty(),
            artifacts,
        };
        manifest.validate()?;
        tokio::fs::write(root.join(MANIFEST_FILE), manifest::encode(&manifest)?).await?;

        let file_name = format!("{name}-{created_at}{BUNDLE_SUFFIX}");
        let bundle_path = write_bundle(&root, &request.output_dir, &file_name).await?;
        info!(
            bundle = %bundle_path.display(),
            submodules = manifest.submodules.len(),
            artifacts = manifest.artifacts.len(),
            warnings = warnings.len(),
            "pack complete"
        );
        Ok(PackOutcome {
            bundle_path,
            manifest,
            warnings,
        })
    }

    async fn mirror_submodules(
        &self,
        blob: &MirrorBlob,
        parent_url: &str,
        credentials: Option<&GitCredentials>,
        root: &Path,
        request: &PackRequest,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<SubmoduleRef>> {
        let modules = self.transport.read_gitmodules(blob).await?;
        if modules.is_empty() {
            warnings.push("submodules requested but the repository has none".to_string());
            return Ok(Vec::new());
        }

        let mut refs = Vec::new();
        for module in modules {
            let url = resolve_submodule_url(parent_url, &module.url);
            let mirror = format!("submodules/{}.git", sanitize_component(&module.path));
            match self.clone_into(&url, credentials, &root.join(&mirror), request).await {
                Ok(_) => refs.push(SubmoduleRef {
                    path: module.path,
                    url: redact_url(&url),
                    mirror,
                }),
                Err(e) => {
                    warn!(submodule = %module.path, error = %e, "submodule mirror failed");
                    warnings.push(format!("submodule '{}' skipped: {e}", module.path));
                }
            }
        }
        Ok(refs)
    }
}

/// Pack with the process-backed transport and the forge REST client.
pub async fn pack_repository(request: &PackRequest) -> Result<PackOutcome> {
    Packer::connect(request)?.pack(request).await
}
