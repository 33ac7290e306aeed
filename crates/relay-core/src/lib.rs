//! Relay Core: the airgap-relay transfer engine
//!
//! Packs a repository (full history, submodules, CI artifacts) into a
//! self-describing bundle, and re-applies bundles to a destination forge:
//! name resolution, project provisioning, mirror push, artifact delivery
//! and history recording, for one bundle or a bounded-parallel batch.

pub mod artifacts;
pub mod bundle;
pub mod config;
mod error;
pub mod ingest;
pub mod manifest;
pub mod mirror;
pub mod naming;
pub mod obs;
pub mod orchestrator;
pub mod pack;
pub mod provision;
pub mod resolver;
pub mod retry;
pub mod telemetry;

pub use error::{Result, TransferError};

pub use artifacts::{download_artifacts, extract_all, extract_local, publish, ExtractSummary};
pub use bundle::{open_bundle, peek_manifest, scan_bundles, write_bundle, OpenedBundle};
pub use config::{DestinationConfig, IngestConfig, PackRequest, PackSource};
pub use ingest::{run_job, IngestContext, JobReport, JobState, SubmoduleOutcome};
pub use manifest::{ArtifactRef, Manifest, SubmoduleRef};
pub use mirror::{
    ForcePolicy, GitCredentials, GitProcessTransport, MemoryMirrorTransport, MirrorBlob,
    MirrorTransport, PushResult, PushTarget,
};
pub use orchestrator::{BatchReport, BundleSource, Orchestrator};
pub use pack::{pack_repository, PackOutcome, Packer};
pub use provision::Provisioner;
pub use resolver::{NameResolver, SubmoduleMap};
pub use retry::RetryPolicy;

pub use forge_client::Visibility;
pub use tokio_util::sync::CancellationToken;
