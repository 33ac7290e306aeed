//! Forge-Client: REST access to source and destination forges
//!
//! The engine needs a small slice of a GitLab-compatible API:
//!
//! - **destination**: find/create projects, resolve namespaces, upload
//!   generic packages
//! - **source**: find the latest successful pipeline, list its jobs with
//!   artifacts, download artifact archives
//!
//! Both sides are traits ([`DestinationApi`], [`SourceApi`]) so the engine
//! can run against [`fakes::MemoryForge`] in tests.

pub mod api;
pub mod config;
mod error;
pub mod fakes;
pub mod gitlab;
pub mod types;

pub use api::{DestinationApi, SourceApi};
pub use config::{ForgeAuth, ForgeConfig};
pub use error::ForgeError;
pub use gitlab::GitLabClient;
pub use types::{CreateProject, Job, NamespaceInfo, PackageInfo, Pipeline, ProjectInfo, Visibility};

/// Result type for forge operations
pub type ForgeResult<T> = std::result::Result<T, ForgeError>;
