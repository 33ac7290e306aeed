//! JSON-file history ledger.
//!
//! Layout: a single `history.json` holding `{"entries": [...]}` with the most
//! recent entry first. Every append rewrites the whole file atomically while
//! holding an async mutex, so concurrent jobs in a batch never interleave
//! writes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StateError;
use crate::persist::write_json_atomic;
use crate::storage_traits::{HistoryEntry, HistoryLedger, StateResult};

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    #[serde(default)]
    entries: Vec<HistoryEntry>,
}

/// History ledger persisted to a single JSON file.
pub struct JsonHistoryLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonHistoryLedger {
    /// Open (creating if needed) the ledger file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> StateResult<Self> {
        let path = path.as_ref().to_path_buf();
        if tokio::fs::metadata(&path).await.is_err() {
            let init = path.clone();
            tokio::task::spawn_blocking(move || {
                write_json_atomic(&init, &HistoryFile::default())
            })
            .await??;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> StateResult<HistoryFile> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HistoryFile::default())
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| StateError::Corrupt {
            path: self.path.clone(),
            detail: e.to_string(),
        })
    }

    async fn save(&self, file: HistoryFile) -> StateResult<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_json_atomic(&path, &file)).await?
    }
}

#[async_trait]
impl HistoryLedger for JsonHistoryLedger {
    async fn append(&self, entry: HistoryEntry) -> StateResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load().await?;
        debug!(id = %entry.id, bundle = %entry.bundle_name, "appending history entry");
        file.entries.insert(0, entry);
        self.save(file).await
    }

    async fn query(&self, limit: usize) -> StateResult<Vec<HistoryEntry>> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load().await?;
        file.entries.truncate(limit);
        Ok(file.entries)
    }

    async fn get(&self, id: &str) -> StateResult<Option<HistoryEntry>> {
        let _guard = self.write_lock.lock().await;
        let file = self.load().await?;
        Ok(file.entries.into_iter().find(|e| e.id == id))
    }

    async fn clear(&self) -> StateResult<()> {
        let _guard = self.write_lock.lock().await;
        self.save(HistoryFile::default()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_traits::HistoryStatus;
    use std::sync::Arc;
    use std::time::Duration;

    fn entry(bundle: &str) -> HistoryEntry {
        HistoryEntry::success(bundle, "ext", "sec/ext", "default", 1, Duration::from_secs(3))
    }

    #[tokio::test]
    async fn open_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg").join("history.json");
        let ledger = JsonHistoryLedger::open(&path).await.unwrap();

        assert!(path.exists());
        assert!(ledger.query(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn query_returns_most_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JsonHistoryLedger::open(dir.path().join("history.json"))
            .await
            .unwrap();

        ledger.append(entry("first.tar.gz")).await.unwrap();
        ledger.append(entry("second.tar.gz")).await.unwrap();
        ledger.append(entry("third.tar.gz")).await.unwrap();

        let got = ledger.query(2).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].bundle_name, "third.tar.gz");
        assert_eq!(got[1].bundle_name, "second.tar.gz");
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let e = entry("persisted.tar.gz");
        let id = e.id.clone();
        {
            let ledger = JsonHistoryLedger::open(&path).await.unwrap();
            ledger.append(e).await.unwrap();
        }

        let reopened = JsonHistoryLedger::open(&path).await.unwrap();
        let got = reopened.get(&id).await.unwrap().expect("entry present");
        assert_eq!(got.bundle_name, "persisted.tar.gz");
        assert_eq!(got.status, HistoryStatus::Success);
    }

    #[tokio::test]
    async fn concurrent_appends_are_all_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(
            JsonHistoryLedger::open(dir.path().join("history.json"))
                .await
                .unwrap(),
        );

        let mut tasks = Vec::new();
        for i in 0..16 {
            let ledger = Arc::clone(&ledger);
            tasks.push(tokio::spawn(async move {
                ledger.append(entry(&format!("b{i}.tar.gz"))).await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        assert_eq!(ledger.query(100).await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JsonHistoryLedger::open(dir.path().join("history.json"))
            .await
            .unwrap();
        ledger.append(entry("a.tar.gz")).await.unwrap();
        ledger.clear().await.unwrap();
        assert!(ledger.query(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reads_legacy_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(
            &path,
            r#"{"entries":[{"id":"abc123abc123","timestamp":"2024-12-24T14:30:00+00:00",
            "bundle_name":"project-20241224T143000Z.tar.gz","source_repo":"external-project",
            "target_repo":"internal/project","profile":"team-alpha","status":"success",
            "error_message":null,"artifacts_count":3,"duration_seconds":45.2}]}"#,
        )
        .unwrap();

        let ledger = JsonHistoryLedger::open(&path).await.unwrap();
        let got = ledger.query(10).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].target_repo, "internal/project");
        assert_eq!(got[0].artifacts_count, 3);
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, b"not json").unwrap();

        let ledger = JsonHistoryLedger::open(&path).await.unwrap();
        let err = ledger.query(1).await.unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
    }
}
