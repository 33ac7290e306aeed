//! Typed records exchanged with a forge.
//!
//! These are the crate's public view of projects, packages, pipelines and
//! jobs. Wire shapes from the REST API are translated into them in
//! [`crate::gitlab`] and never leak past the crate boundary.

use serde::{Deserialize, Serialize};

/// Destination-side project identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    /// Numeric id (`0` for a project planned in dry-run mode)
    pub id: u64,
    /// Full path including namespace, e.g. `sec/team/alpha`
    pub path_with_namespace: String,
    /// HTTPS clone URL, without credentials
    pub clone_url: String,
    pub web_url: String,
}

/// A namespace (group or user) that can own projects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub id: u64,
    pub full_path: String,
}

/// Generic-package identity produced by an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub project_id: u64,
    pub package_name: String,
    pub version: String,
    pub file_name: String,
    pub size: u64,
}

/// Project visibility level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Internal,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Internal => "internal",
            Visibility::Public => "public",
        }
    }
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "private" => Ok(Visibility::Private),
            "internal" => Ok(Visibility::Internal),
            "public" => Ok(Visibility::Public),
            other => Err(format!("unknown visibility '{other}'")),
        }
    }
}

/// Request to create a project under an existing namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateProject {
    pub name: String,
    pub path: String,
    pub namespace_id: u64,
    pub visibility: Visibility,
}

/// A CI pipeline on the source forge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: u64,
    /// Branch or tag the pipeline ran for
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub sha: String,
}

/// A pipeline job that produced an artifact archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub stage: String,
    /// Total size of the job's artifact files as reported by the forge
    #[serde(default)]
    pub artifacts_size: u64,
}
