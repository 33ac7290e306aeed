//! Engine configuration value objects.
//!
//! Everything a batch run needs travels in one immutable [`IngestConfig`]
//! (or [`PackRequest`] on the pack side); the engine reads no globals.

use std::path::PathBuf;
use std::time::Duration;

use forge_client::{ForgeConfig, Visibility};
use relay_state::DEFAULT_PROFILE;

use crate::error::{Result, TransferError};
use crate::mirror::git::DEFAULT_GIT_TIMEOUT;
use crate::mirror::{ForcePolicy, GitCredentials};
use crate::retry::RetryPolicy;

/// Default bound on a single forge API call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Destination forge connection settings.
#[derive(Clone)]
pub struct DestinationConfig {
    /// Base URL, e.g. `https://gitlab.internal`
    pub url: String,
    pub token: Option<String>,
    /// Namespace prefixed to unqualified internal names
    pub namespace: Option<String>,
    pub verify_tls: bool,
}

impl std::fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("namespace", &self.namespace)
            .field("verify_tls", &self.verify_tls)
            .finish()
    }
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self::new("")
    }
}

impl DestinationConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            token: None,
            namespace: None,
            verify_tls: true,
        }
    }

    /// Read `RELAY_TARGET_URL`, `RELAY_TARGET_TOKEN` and `RELAY_NAMESPACE`.
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let mut config = Self::new(&non_empty("RELAY_TARGET_URL").unwrap_or_default());
        config.token = non_empty("RELAY_TARGET_TOKEN");
        config.namespace = non_empty("RELAY_NAMESPACE");
        config
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    /// Forge client settings for this destination.
    pub fn forge_config(&self, timeout: Duration) -> ForgeConfig {
        let mut config = ForgeConfig::new(&self.url)
            .with_verify_tls(self.verify_tls)
            .with_timeout(timeout);
        if let Some(token) = &self.token {
            config = config.with_token(token);
        }
        config
    }

    /// Credentials git pushes with.
    pub fn git_credentials(&self) -> Option<GitCredentials> {
        self.token
            .as_deref()
            .map(|token| GitCredentials::new("oauth2", token))
    }
}

/// Configuration for an ingest batch.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub destination: DestinationConfig,
    /// Explicit destination path; bypasses the name resolver
    pub target_path: Option<String>,
    pub visibility: Visibility,
    /// Profile whose mapping table resolves names
    pub profile: String,
    /// Submodule path -> destination path overrides
    pub submodule_mapping_file: Option<PathBuf>,
    pub force_policy: ForcePolicy,
    pub dry_run: bool,
    pub skip_artifacts: bool,
    /// Copy `artifacts/` under `<dir>/<bundle>/` instead of publishing packages
    pub artifacts_output_dir: Option<PathBuf>,
    /// With an output directory set, publish packages as well
    pub publish_artifacts: bool,
    /// Maximum jobs in flight
    pub parallelism: usize,
    pub retry: RetryPolicy,
    pub call_timeout: Duration,
    pub git_timeout: Duration,
    /// Parent of per-job scratch directories (system temp dir when unset)
    pub work_dir: Option<PathBuf>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            destination: DestinationConfig::default(),
            target_path: None,
            visibility: Visibility::Private,
            profile: DEFAULT_PROFILE.to_string(),
            submodule_mapping_file: None,
            force_policy: ForcePolicy::AllowForce,
            dry_run: false,
            skip_artifacts: false,
            artifacts_output_dir: None,
            publish_artifacts: false,
            parallelism: 1,
            retry: RetryPolicy::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            git_timeout: DEFAULT_GIT_TIMEOUT,
            work_dir: None,
        }
    }
}

impl IngestConfig {
    pub fn new(destination: DestinationConfig) -> Self {
        Self {
            destination,
            ..Self::default()
        }
    }

    pub fn with_target_path(mut self, path: &str) -> Self {
        self.target_path = Some(path.trim_matches('/').to_string());
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_profile(mut self, profile: &str) -> Self {
        self.profile = profile.to_string();
        self
    }

    pub fn with_submodule_mapping_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.submodule_mapping_file = Some(path.into());
        self
    }

    pub fn with_force_policy(mut self, policy: ForcePolicy) -> Self {
        self.force_policy = policy;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_skip_artifacts(mut self, skip: bool) -> Self {
        self.skip_artifacts = skip;
        self
    }

    pub fn with_artifacts_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts_output_dir = Some(dir.into());
        self
    }

    pub fn with_publish_artifacts(mut self, publish: bool) -> Self {
        self.publish_artifacts = publish;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_git_timeout(mut self, timeout: Duration) -> Self {
        self.git_timeout = timeout;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Check the configuration before any job starts.
    ///
    /// `jobs` is the number of bundles in the batch; a target path override
    /// only makes sense for a single bundle.
    pub fn validate(&self, jobs: usize) -> Result<()> {
        let url = &self.destination.url;
        if url.is_empty() {
            return Err(invalid("destination URL is not set (RELAY_TARGET_URL)"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://") || url.starts_with("memory://"))
        {
            return Err(invalid(&format!("destination URL '{url}' must be http(s)")));
        }
        if self.destination.token.is_none() && !self.dry_run {
            return Err(invalid("destination token is not set (RELAY_TARGET_TOKEN)"));
        }
        if self.parallelism == 0 {
            return Err(invalid("parallelism must be at least 1"));
        }
        if self.profile.is_empty() {
            return Err(invalid("profile name is empty"));
        }
        if let Some(path) = &self.target_path {
            if jobs > 1 {
                return Err(invalid(
                    "a target path override applies to a single bundle, not a batch",
                ));
            }
            if !path.contains('/') {
                return Err(invalid(&format!(
                    "target path '{path}' must be <namespace>/<project>"
                )));
            }
        }
        if self.call_timeout.is_zero() || self.git_timeout.is_zero() {
            return Err(invalid("timeouts must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> TransferError {
    TransferError::InvalidConfig(msg.to_string())
}

/// Where a repository is packed from.
#[derive(Debug, Clone)]
pub enum PackSource {
    /// Any clone URL (https, ssh, local path)
    Url {
        url: String,
        credentials: Option<GitCredentials>,
    },
    /// A project on a forge; enables artifact download
    Forge {
        forge: ForgeConfig,
        repo_path: String,
    },
}

impl PackSource {
    /// Clone URL without credentials.
    pub fn clone_url(&self) -> String {
        match self {
            PackSource::Url { url, .. } => url.clone(),
            PackSource::Forge { forge, repo_path } => forge.clone_url(repo_path),
        }
    }

    pub fn credentials(&self) -> Option<GitCredentials> {
        match self {
            PackSource::Url { credentials, .. } => credentials.clone(),
            PackSource::Forge { forge, .. } => forge
                .git_credentials()
                .map(|(user, secret)| GitCredentials::new(&user, &secret)),
        }
    }
}

/// A request to pack one repository into a bundle.
#[derive(Debug, Clone)]
pub struct PackRequest {
    pub source: PackSource,
    /// Repository name override; derived from the source when unset
    pub repo_name: Option<String>,
    pub output_dir: PathBuf,
    pub with_submodules: bool,
    pub with_artifacts: bool,
    /// Ref whose latest successful pipeline supplies artifacts
    pub artifacts_ref: Option<String>,
    pub verify_tls: bool,
    pub git_timeout: Duration,
    pub retry: RetryPolicy,
    pub work_dir: Option<PathBuf>,
}

impl PackRequest {
    pub fn new(source: PackSource, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            repo_name: None,
            output_dir: output_dir.into(),
            with_submodules: false,
            with_artifacts: false,
            artifacts_ref: None,
            verify_tls: true,
            git_timeout: DEFAULT_GIT_TIMEOUT,
            retry: RetryPolicy::default(),
            work_dir: None,
        }
    }

    /// Pack from a plain clone URL.
    pub fn from_url(url: &str, output_dir: impl Into<PathBuf>) -> Self {
        Self::new(
            PackSource::Url {
                url: url.to_string(),
                credentials: None,
            },
            output_dir,
        )
    }

    pub fn with_repo_name(mut self, name: &str) -> Self {
        self.repo_name = Some(name.to_string());
        self
    }

    pub fn with_submodules(mut self, on: bool) -> Self {
        self.with_submodules = on;
        self
    }

    pub fn with_artifacts(mut self, on: bool, git_ref: Option<&str>) -> Self {
        self.with_artifacts = on;
        self.artifacts_ref = git_ref.map(str::to_string);
        self
    }

    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    pub fn with_git_timeout(mut self, timeout: Duration) -> Self {
        self.git_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.clone_url().trim().is_empty() {
            return Err(invalid("source URL is empty"));
        }
        if self.with_artifacts && !matches!(self.source, PackSource::Forge { .. }) {
            return Err(invalid(
                "artifact download needs a forge source (base URL and project path)",
            ));
        }
        if let Some(name) = &self.repo_name {
            if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                return Err(invalid(&format!("invalid repository name '{name}'")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest() -> DestinationConfig {
        DestinationConfig::new("https://gitlab.internal/")
            .with_token("glpat-x")
            .with_namespace("sec")
    }

    #[test]
    fn test_defaults() {
        let c = IngestConfig::new(dest());
        assert_eq!(c.parallelism, 1);
        assert_eq!(c.profile, "default");
        assert_eq!(c.visibility, Visibility::Private);
        assert_eq!(c.force_policy, ForcePolicy::AllowForce);
        assert_eq!(c.call_timeout, Duration::from_secs(120));
        assert_eq!(c.retry.max_retries, 3);
        assert_eq!(c.destination.url, "https://gitlab.internal");
        c.validate(5).unwrap();
    }

    #[test]
    fn test_target_override_is_single_bundle_only() {
        let c = IngestConfig::new(dest()).with_target_path("sec/alpha");
        c.validate(1).unwrap();
        assert!(matches!(c.validate(2), Err(TransferError::InvalidConfig(_))));
        let c = IngestConfig::new(dest()).with_target_path("alpha");
        assert!(c.validate(1).is_err());
    }

    #[test]
    fn test_missing_token_only_allowed_in_dry_run() {
        let mut d = dest();
        d.token = None;
        assert!(IngestConfig::new(d.clone()).validate(1).is_err());
        IngestConfig::new(d).with_dry_run(true).validate(1).unwrap();
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        assert!(IngestConfig::new(dest()).with_parallelism(0).validate(1).is_err());
    }

    #[test]
    fn test_token_is_redacted_in_debug() {
        assert!(!format!("{:?}", dest()).contains("glpat-x"));
        assert_eq!(
            dest().git_credentials(),
            Some(GitCredentials::new("oauth2", "glpat-x"))
        );
    }

    #[test]
    fn test_pack_request_validation() {
        let r = PackRequest::from_url("https://g/x/app.git", "/tmp/out").with_artifacts(true, None);
        assert!(r.validate().is_err());

        let forge = ForgeConfig::new("https://g").with_token("t");
        let r = PackRequest::new(
            PackSource::Forge {
                forge,
                repo_path: "x/app".to_string(),
            },
            "/tmp/out",
        )
        .with_artifacts(true, Some("main"));
        r.validate().unwrap();
        assert_eq!(r.source.clone_url(), "https://g/x/app.git");
        assert_eq!(r.source.credentials().unwrap().username, "oauth2");
    }

    #[test]
    fn test_destination_from_env() {
        std::env::set_var("RELAY_TARGET_URL", "https://gitlab.internal/");
        std::env::set_var("RELAY_TARGET_TOKEN", "glpat-env");
        std::env::set_var("RELAY_NAMESPACE", "  ");
        let d = DestinationConfig::from_env();
        std::env::remove_var("RELAY_TARGET_URL");
        std::env::remove_var("RELAY_TARGET_TOKEN");
        std::env::remove_var("RELAY_NAMESPACE");

        assert_eq!(d.url, "https://gitlab.internal");
        assert_eq!(d.token.as_deref(), Some("glpat-env"));
        assert_eq!(d.namespace, None);
        assert!(d.verify_tls);
        assert!(!format!("{d:?}").contains("glpat-env"));
    }
}
