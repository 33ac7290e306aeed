//! Storage trait definitions for airgap-relay
//!
//! `HistoryLedger` is the append-only record of ingest attempts. It is async
//! and backend-agnostic; an in-memory fake lives in the `fakes` module.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// Result type for storage operations
pub type StateResult<T> = std::result::Result<T, StateError>;

// ---------------------------------------------------------------------------
// HistoryEntry
// ---------------------------------------------------------------------------

/// Terminal status of an ingest attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Success,
    Failed,
}

impl std::fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryStatus::Success => f.write_str("success"),
            HistoryStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Immutable record of a single ingest attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Short random identifier (12 hex chars)
    pub id: String,
    /// When the attempt finished
    pub timestamp: DateTime<Utc>,
    /// File name of the ingested bundle
    pub bundle_name: String,
    /// External repository name read from the manifest
    #[serde(default)]
    pub source_repo: String,
    /// Resolved internal target path
    #[serde(default)]
    pub target_repo: String,
    /// Profile whose mapping table was in effect
    pub profile: String,
    pub status: HistoryStatus,
    /// Human-readable failure detail, present when `status == Failed`
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub artifacts_count: u64,
    #[serde(default)]
    pub duration_seconds: f64,
}

impl HistoryEntry {
    /// Create a successful entry stamped with a fresh id and the current time.
    pub fn success(
        bundle_name: impl Into<String>,
        source_repo: impl Into<String>,
        target_repo: impl Into<String>,
        profile: impl Into<String>,
        artifacts_count: u64,
        duration: Duration,
    ) -> Self {
        Self {
            id: new_entry_id(),
            timestamp: Utc::now(),
            bundle_name: bundle_name.into(),
            source_repo: source_repo.into(),
            target_repo: target_repo.into(),
            profile: profile.into(),
            status: HistoryStatus::Success,
            error_message: None,
            artifacts_count,
            duration_seconds: round_seconds(duration),
        }
    }

    /// Create a failed entry carrying `error_message`.
    pub fn failure(
        bundle_name: impl Into<String>,
        source_repo: impl Into<String>,
        target_repo: impl Into<String>,
        profile: impl Into<String>,
        error_message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            id: new_entry_id(),
            timestamp: Utc::now(),
            bundle_name: bundle_name.into(),
            source_repo: source_repo.into(),
            target_repo: target_repo.into(),
            profile: profile.into(),
            status: HistoryStatus::Failed,
            error_message: Some(error_message.into()),
            artifacts_count: 0,
            duration_seconds: round_seconds(duration),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == HistoryStatus::Success
    }
}

fn new_entry_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

fn round_seconds(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// HistoryLedger
// ---------------------------------------------------------------------------

/// Append-only history of ingest attempts.
///
/// Guarantees:
/// - `append` is durable before it returns and safe under concurrent callers.
/// - `query` returns entries most recent first.
/// - Existing entries are never mutated; only `clear` removes them.
#[async_trait]
pub trait HistoryLedger: Send + Sync {
    /// Durably record one entry.
    async fn append(&self, entry: HistoryEntry) -> StateResult<()>;

    /// Return at most `limit` entries, most recent first.
    async fn query(&self, limit: usize) -> StateResult<Vec<HistoryEntry>>;

    /// Look up a single entry by id.
    async fn get(&self, id: &str) -> StateResult<Option<HistoryEntry>>;

    /// Remove every entry.
    async fn clear(&self) -> StateResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_ids_are_short_and_unique() {
        let a = HistoryEntry::success("a.tar.gz", "a", "sec/a", "default", 0, Duration::ZERO);
        let b = HistoryEntry::success("b.tar.gz", "b", "sec/b", "default", 0, Duration::ZERO);
        assert_eq!(a.id.len(), 12);
        assert!(a.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_duration_rounded_to_centiseconds() {
        let e = HistoryEntry::success(
            "x.tar.gz",
            "x",
            "sec/x",
            "default",
            2,
            Duration::from_millis(45_218),
        );
        assert_eq!(e.duration_seconds, 45.22);
    }

    #[test]
    fn test_failure_carries_message_and_status() {
        let e = HistoryEntry::failure(
            "x.tar.gz",
            "x",
            "",
            "team-a",
            "no mapping for 'x'",
            Duration::from_secs(1),
        );
        assert_eq!(e.status, HistoryStatus::Failed);
        assert_eq!(e.error_message.as_deref(), Some("no mapping for 'x'"));
        assert!(!e.is_success());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let v = serde_json::to_value(HistoryStatus::Failed).unwrap();
        assert_eq!(v, serde_json::json!("failed"));
    }
}
