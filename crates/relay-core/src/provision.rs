//! Destination project provisioning.
//!
//! `ensure_project` is create-if-absent: an existing project is returned as
//! is and no create call is ever issued for it.

use std::sync::Arc;

use forge_client::{CreateProject, DestinationApi, ProjectInfo, Visibility};
use tracing::{debug, info, warn};

use crate::error::{Result, TransferError};
use crate::retry::RetryPolicy;

/// Ensures destination projects exist before mirroring.
#[derive(Clone)]
pub struct Provisioner {
    api: Arc<dyn DestinationApi>,
    retry: RetryPolicy,
    dry_run: bool,
}

impl Provisioner {
    pub fn new(api: Arc<dyn DestinationApi>, retry: RetryPolicy) -> Self {
        Self {
            api,
            retry,
            dry_run: false,
        }
    }

    /// Run lookups but never create.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    async fn find(&self, path: &str) -> Result<Option<ProjectInfo>> {
        Ok(self
            .retry
            .run("project lookup", || self.api.find_project(path))
            .await?)
    }

    /// Return the project at `target_path`, creating it when absent.
    ///
    /// The boolean is `true` when the project was (or, in dry-run mode,
    /// would have been) created.
    pub async fn ensure_project(
        &self,
        target_path: &str,
        visibility: Visibility,
    ) -> Result<(ProjectInfo, bool)> {
        let (namespace, name) = target_path.rsplit_once('/').ok_or_else(|| {
            TransferError::InvalidConfig(format!(
                "target path '{target_path}' must be <namespace>/<project>"
            ))
        })?;
        if namespace.is_empty() || name.is_empty() {
            return Err(TransferError::InvalidConfig(format!(
                "target path '{target_path}' must be <namespace>/<project>"
            )));
        }

        if let Some(existing) = self.find(target_path).await? {
            debug!(target = %target_path, id = existing.id, "project exists");
            return Ok((existing, false));
        }

        let ns = self
            .retry
            .run("namespace lookup", || self.api.find_namespace(namespace))
            .await?
            .ok_or_else(|| TransferError::NamespaceNotFound(namespace.to_string()))?;

        if self.dry_run {
            info!(target = %target_path, namespace_id = ns.id, "would create project");
            return Ok((
                ProjectInfo {
                    id: 0,
                    path_with_namespace: target_path.to_string(),
                    clone_url: String::new(),
                    web_url: String::new(),
                },
                true,
            ));
        }

        let request = CreateProject {
            name: name.to_string(),
            path: name.to_string(),
            namespace_id: ns.id,
            visibility,
        };
        // Not retried: a create that reached the server but timed out would
        // turn into a spurious conflict.
        match self.api.create_project(&request).await {
            Ok(project) => {
                info!(
                    target = %target_path,
                    id = project.id,
                    visibility = %visibility,
                    "project created"
                );
                Ok((project, true))
            }
            Err(err) => {
                let err = TransferError::from(err);
                // Another job may have created it concurrently.
                if let Ok(Some(existing)) = self.find(target_path).await {
                    warn!(target = %target_path, error = %err, "create failed but project now exists");
                    return Ok((existing, false));
                }
                Err(err)
            }
        }
    }
}
