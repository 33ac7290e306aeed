//! Repository mirror transport.
//!
//! A transport produces a complete bare mirror of a source repository at
//! pack time and re-applies it to a destination at ingest time. Two
//! implementations exist:
//!
//! - [`git::GitProcessTransport`] shells out to the `git` binary
//! - [`memory::MemoryMirrorTransport`] models repositories as commit graphs
//!   serialized into the mirror directory, for tests

pub mod git;
pub mod memory;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use git::GitProcessTransport;
pub use memory::MemoryMirrorTransport;

/// Credentials git uses over HTTPS.
#[derive(Clone, PartialEq, Eq)]
pub struct GitCredentials {
    pub username: String,
    pub secret: String,
}

impl GitCredentials {
    pub fn new(username: &str, secret: &str) -> Self {
        Self {
            username: username.to_string(),
            secret: secret.to_string(),
        }
    }
}

impl std::fmt::Debug for GitCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GitCredentials({}, ***)", self.username)
    }
}

/// Handle to a bare mirror directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorBlob {
    pub path: PathBuf,
}

impl MirrorBlob {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Where `apply_mirror` pushes to.
#[derive(Debug, Clone)]
pub struct PushTarget {
    /// Clone URL without credentials
    pub url: String,
    pub credentials: Option<GitCredentials>,
}

/// How to treat destination refs that are not ancestors of the incoming tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcePolicy {
    /// Overwrite diverged refs
    #[default]
    AllowForce,
    /// Fail with `DivergedRef` before pushing anything
    FailOnDiverge,
}

/// What a mirror application changed on the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResult {
    pub refs_pushed: usize,
    pub commits_pushed: u64,
}

/// One `[submodule "..."]` section of `.gitmodules`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitModule {
    pub name: String,
    pub path: String,
    pub url: String,
}

/// How a destination ref relates to the incoming tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefUpdate {
    Create,
    UpToDate,
    FastForward,
    Diverged,
}

impl RefUpdate {
    pub fn needs_push(self) -> bool {
        !matches!(self, RefUpdate::UpToDate)
    }
}

/// Refs carried by a mirror: branches and tags only.
pub fn is_mirrored_ref(refname: &str) -> bool {
    refname.starts_with("refs/heads/") || refname.starts_with("refs/tags/")
}

/// Backend that creates and applies repository mirrors.
#[async_trait]
pub trait MirrorTransport: Send + Sync {
    /// Mirror-clone `source_url` into `dest`.
    async fn create_mirror(
        &self,
        source_url: &str,
        credentials: Option<&GitCredentials>,
        dest: &Path,
    ) -> Result<MirrorBlob>;

    /// Push every branch and tag of `blob` to `target`.
    async fn apply_mirror(
        &self,
        blob: &MirrorBlob,
        target: &PushTarget,
        policy: ForcePolicy,
    ) -> Result<PushResult>;

    /// `.gitmodules` entries at the mirror's HEAD; empty when absent.
    async fn read_gitmodules(&self, blob: &MirrorBlob) -> Result<Vec<GitModule>>;

    /// `(refname, object id)` for every branch and tag in the mirror.
    async fn list_refs(&self, blob: &MirrorBlob) -> Result<Vec<(String, String)>>;

    /// Version string of the underlying tool.
    async fn version(&self) -> Result<String>;
}

/// Parse `.gitmodules` contents. Sections missing `path` or `url` are skipped.
pub fn parse_gitmodules(text: &str) -> Vec<GitModule> {
    let mut modules = Vec::new();
    let mut current: Option<(String, Option<String>, Option<String>)> = None;

    let mut flush = |cur: &mut Option<(String, Option<String>, Option<String>)>| {
        if let Some((name, Some(path), Some(url))) = cur.take() {
            modules.push(GitModule { name, path, url });
        }
    };

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') {
            flush(&mut current);
            current = line
                .strip_prefix("[submodule")
                .and_then(|rest| rest.trim().strip_suffix(']'))
                .map(|name| (name.trim().trim_matches('"').to_string(), None, None));
            continue;
        }
        let Some((_, path, url)) = current.as_mut() else {
            continue;
        };
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "path" => *path = Some(value),
                "url" => *url = Some(value),
                _ => {}
            }
        }
    }
    flush(&mut current);
    modules
}
