//! Bundle manifest codec.
//!
//! `manifest.json` sits at the root of every bundle and describes what the
//! bundle carries: the source repository, its submodule mirrors and the CI
//! artifacts downloaded alongside it.
//!
//! Decoding is lenient with top-level fields (older bundles omit several of
//! them) but strict with nested submodule and artifact records, whose fields
//! are all required.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TransferError};
use crate::naming::derive_repo_name;

/// File name of the manifest inside a bundle root.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Manifest format version written by this crate.
pub const FORMAT_VERSION: u64 = 1;

/// A submodule whose mirror is carried in the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmoduleRef {
    /// Path of the submodule inside the superproject
    pub path: String,
    /// Source URL from `.gitmodules`
    pub url: String,
    /// Mirror location relative to the bundle root, e.g. `submodules/lib.git`
    pub mirror: String,
}

/// A CI artifact archive carried in the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub job_id: u64,
    pub job_name: String,
    pub file_name: String,
    pub file_size: u64,
    pub pipeline_id: u64,
    #[serde(rename = "ref")]
    pub git_ref: String,
}

impl ArtifactRef {
    /// Generic-package name on the destination.
    pub fn package_name(&self) -> &str {
        &self.job_name
    }

    /// Generic-package version on the destination.
    pub fn package_version(&self) -> String {
        self.pipeline_id.to_string()
    }

    /// Location of the archive relative to the bundle root.
    pub fn bundle_path(&self) -> PathBuf {
        Path::new("artifacts").join(&self.job_name).join(&self.file_name)
    }
}

/// Bundle metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_version: Option<u64>,
    /// Source clone URL, credentials stripped
    #[serde(default)]
    pub repo_url: String,
    #[serde(default)]
    pub repo_name: String,
    /// Project path on the source forge, when packed from one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_path: Option<String>,
    /// Source forge base URL, when packed from one
    #[serde(default, alias = "source_gitlab_url", skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// Compact UTC timestamp, `YYYYMMDDTHHMMSSZ`
    #[serde(default)]
    pub created_at: String,
    #[serde(default, alias = "git_version")]
    pub vcs_version: String,
    #[serde(default)]
    pub with_submodules: bool,
    #[serde(default)]
    pub submodules: Vec<SubmoduleRef>,
    #[serde(default)]
    pub with_artifacts: bool,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
}

impl Manifest {
    /// Canonical repository name: `repo_name`, or one derived from `repo_url`.
    pub fn repository_name(&self) -> Result<String> {
        if !self.repo_name.is_empty() {
            return Ok(self.repo_name.clone());
        }
        if !self.repo_url.is_empty() {
            return Ok(derive_repo_name(&self.repo_url));
        }
        Err(TransferError::MalformedManifest(
            "neither repo_name nor repo_url is set".to_string(),
        ))
    }

    /// Check the structural invariants `decode` enforces.
    pub fn validate(&self) -> Result<()> {
        if self.with_submodules && self.submodules.is_empty() {
            return Err(malformed("with_submodules is true but submodules is empty"));
        }
        if self.with_artifacts && self.artifacts.is_empty() {
            return Err(malformed("with_artifacts is true but artifacts is empty"));
        }
        if !self.repo_name.is_empty() && !is_plain_name(&self.repo_name) {
            return Err(malformed(&format!("invalid repo_name '{}'", self.repo_name)));
        }

        let mut seen = HashSet::new();
        for sub in &self.submodules {
            if !seen.insert(sub.path.as_str()) {
                return Err(malformed(&format!("duplicate submodule path '{}'", sub.path)));
            }
            if !is_relative_inside(&sub.path) || !is_relative_inside(&sub.mirror) {
                return Err(malformed(&format!(
                    "submodule '{}' has a path escaping the bundle",
                    sub.path
                )));
            }
        }
        for art in &self.artifacts {
            if !is_plain_name(&art.job_name) || !is_plain_name(&art.file_name) {
                return Err(malformed(&format!(
                    "artifact of job {} has an unsafe job_name or file_name",
                    art.job_id
                )));
            }
        }
        Ok(())
    }
}

fn malformed(msg: &str) -> TransferError {
    TransferError::MalformedManifest(msg.to_string())
}

/// A single path component with no separators or traversal.
fn is_plain_name(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains('/') && !s.contains('\\')
}

fn is_relative_inside(s: &str) -> bool {
    let p = Path::new(s);
    !s.is_empty() && p.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Decode a manifest, enforcing its invariants.
pub fn decode(bytes: &[u8]) -> Result<Manifest> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| malformed(&format!("invalid JSON: {e}")))?;
    let Value::Object(ref obj) = value else {
        return Err(malformed("manifest must be a JSON object"));
    };

    match obj.get("format_version") {
        None | Some(Value::Null) => {}
        Some(Value::Number(n)) if n.as_u64() == Some(FORMAT_VERSION) => {}
        Some(other) => return Err(TransferError::UnsupportedVersion(other.to_string())),
    }

    let manifest: Manifest =
        serde_json::from_value(value).map_err(|e| malformed(&e.to_string()))?;
    manifest.validate()?;
    Ok(manifest)
}

/// Encode a manifest as pretty-printed JSON.
pub fn encode(manifest: &Manifest) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(manifest)?)
}
