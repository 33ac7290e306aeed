//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryHistoryLedger`, which satisfies the `HistoryLedger`
//! contract without touching the filesystem.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryHistoryLedger
// ---------------------------------------------------------------------------

/// In-memory history ledger backed by a `Vec`, most recent entry first.
#[derive(Debug, Default)]
pub struct MemoryHistoryLedger {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl MemoryHistoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every recorded entry.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<HistoryEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl HistoryLedger for MemoryHistoryLedger {
    async fn append(&self, entry: HistoryEntry) -> StateResult<()> {
        self.lock().insert(0, entry);
        Ok(())
    }

    async fn query(&self, limit: usize) -> StateResult<Vec<HistoryEntry>> {
        Ok(self.lock().iter().take(limit).cloned().collect())
    }

    async fn get(&self, id: &str) -> StateResult<Option<HistoryEntry>> {
        Ok(self.lock().iter().find(|e| e.id == id).cloned())
    }

    async fn clear(&self) -> StateResult<()> {
        self.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_memory_ledger_contract() {
        let ledger = MemoryHistoryLedger::new();
        let a = HistoryEntry::success("a.tar.gz", "a", "sec/a", "default", 0, Duration::ZERO);
        let b = HistoryEntry::failure("b.tar.gz", "b", "", "default", "boom", Duration::ZERO);
        let b_id = b.id.clone();

        ledger.append(a).await.unwrap();
        ledger.append(b).await.unwrap();

        let recent = ledger.query(1).await.unwrap();
        assert_eq!(recent[0].bundle_name, "b.tar.gz");
        assert_eq!(ledger.get(&b_id).await.unwrap().unwrap().status, HistoryStatus::Failed);
        assert!(ledger.get("missing").await.unwrap().is_none());

        ledger.clear().await.unwrap();
        assert!(ledger.is_empty());
    }
}
