// Test doubles for engine and scheduler tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use pulse_common::{
    parse_config, CanonicalRecord, CursorPosition, FileConfig, IngestCursor, IngestError,
    NaturalKey, Result, Revision, SourceId,
};
use pulse_store::{CanonicalStore, CasOutcome, CommitOutcome, CursorStore};

pub use pulse_sources::testing::ScriptedAdapter;

/// Parse a TOML snippet into a config, panicking on bad input.
pub fn config(toml: &str) -> FileConfig {
    match parse_config(toml) {
        Ok(config) => config,
        Err(e) => panic!("invalid test config: {e:#}"),
    }
}

/// Canonical store that misbehaves on demand.
/// Builder pattern: `.fail_after_writes()`, `.with_conflicts()`.
pub struct FlakyCanonicalStore {
    inner: Arc<dyn CanonicalStore>,
    fail_after: AtomicUsize,
    applied: AtomicUsize,
    conflicts: AtomicUsize,
}

impl FlakyCanonicalStore {
    pub fn new(inner: Arc<dyn CanonicalStore>) -> Self {
        Self {
            inner,
            fail_after: AtomicUsize::new(usize::MAX),
            applied: AtomicUsize::new(0),
            conflicts: AtomicUsize::new(0),
        }
    }

    /// Writes fail with a storage error once `n` writes have been applied.
    pub fn fail_after_writes(self, n: usize) -> Self {
        self.fail_after.store(n, Ordering::SeqCst);
        self
    }

    /// Report the next `n` compare-and-swaps as lost.
    pub fn with_conflicts(self, n: usize) -> Self {
        self.conflicts.store(n, Ordering::SeqCst);
        self
    }

    /// Stop failing writes.
    pub fn heal(&self) {
        self.fail_after.store(usize::MAX, Ordering::SeqCst);
    }

    pub fn applied_writes(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }

    pub fn remaining_conflicts(&self) -> usize {
        self.conflicts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CanonicalStore for FlakyCanonicalStore {
    async fn get(&self, source: &SourceId, key: &NaturalKey) -> Result<Option<CanonicalRecord>> {
        self.inner.get(source, key).await
    }

    async fn compare_and_swap(
        &self,
        expected: Option<Revision>,
        record: &CanonicalRecord,
    ) -> Result<CasOutcome> {
        let forced = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            return Ok(CasOutcome::Conflict);
        }
        if self.applied.load(Ordering::SeqCst) >= self.fail_after.load(Ordering::SeqCst) {
            return Err(IngestError::Storage("canonical store unavailable".to_string()));
        }
        let outcome = self.inner.compare_and_swap(expected, record).await?;
        if outcome == CasOutcome::Applied {
            self.applied.fetch_add(1, Ordering::SeqCst);
        }
        Ok(outcome)
    }

    async fn scan(
        &self,
        source: &SourceId,
        merged_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CanonicalRecord>> {
        self.inner.scan(source, merged_since).await
    }
}

/// Cursor store that misbehaves on demand.
/// Builder pattern: `.failing_reads()`; commits toggle with `set_failing_commits`.
pub struct FlakyCursorStore {
    inner: Arc<dyn CursorStore>,
    fail_reads: AtomicBool,
    fail_commits: AtomicBool,
    reads: AtomicUsize,
}

impl FlakyCursorStore {
    pub fn new(inner: Arc<dyn CursorStore>) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_commits: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        }
    }

    /// Every cursor read fails with a storage error.
    pub fn failing_reads(self) -> Self {
        self.fail_reads.store(true, Ordering::SeqCst);
        self
    }

    /// While set, every cursor commit fails with a storage error.
    pub fn set_failing_commits(&self, failing: bool) {
        self.fail_commits.store(failing, Ordering::SeqCst);
    }

    /// Stop failing reads and commits.
    pub fn heal(&self) {
        self.fail_reads.store(false, Ordering::SeqCst);
        self.fail_commits.store(false, Ordering::SeqCst);
    }

    pub fn attempted_reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

fn unavailable() -> IngestError {
    IngestError::Storage("cursor store unavailable".to_string())
}

#[async_trait]
impl CursorStore for FlakyCursorStore {
    async fn get_cursor(&self, source: &SourceId) -> Result<Option<IngestCursor>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.get_cursor(source).await
    }

    async fn commit_cursor(
        &self,
        source: &SourceId,
        position: &CursorPosition,
        run_id: Uuid,
    ) -> Result<CommitOutcome> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.commit_cursor(source, position, run_id).await
    }

    async fn reset_cursor(&self, source: &SourceId, to: Option<&CursorPosition>) -> Result<()> {
        self.inner.reset_cursor(source, to).await
    }

    async fn list_cursors(&self) -> Result<Vec<IngestCursor>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.list_cursors().await
    }
}
