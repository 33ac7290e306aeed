//! Relay-State: persistence layer for airgap-relay
//!
//! This crate owns the two tables that outlive a single transfer job:
//!
//! - the **history ledger**, an append-only record of every ingest attempt
//! - the **mapping tables**, one per profile, translating external repository
//!   names into internal (security-controlled) names
//!
//! ## Key Components
//!
//! - `HistoryLedger`: async, backend-agnostic ledger trait
//! - `JsonHistoryLedger`: single-file JSON backend with atomic rewrites
//! - `MappingTable` / `MappingStore`: profile-scoped mapping files with backups,
//!   plus the profile registry (create, delete, export, import)
//! - `fakes`: in-memory implementations for tests

mod error;
pub mod fakes;
pub mod history;
pub mod mapping;
mod persist;
pub mod storage_traits;

pub use error::StateError;
pub use history::JsonHistoryLedger;
pub use mapping::{
    MappingEntry, MappingStore, MappingTable, Profile, ProfileExport, DEFAULT_PROFILE, PROFILES_FILE,
};
pub use storage_traits::{HistoryEntry, HistoryLedger, HistoryStatus, StateResult};
