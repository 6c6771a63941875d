use async_trait::async_trait;
use uuid::Uuid;

use pulse_common::{CursorPosition, IngestCursor, Result, SourceId};

/// Result of a cursor commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The stored position moved forward.
    Advanced,
    /// The same position was already stored. No-op.
    Unchanged,
    /// The stored position is ahead of the committed one. Left untouched.
    Stale,
}

/// Persists per-source fetch progress.
///
/// Commits are atomic and monotonic: a cursor never moves backwards except
/// through [`CursorStore::reset_cursor`], which is an operator action.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get_cursor(&self, source: &SourceId) -> Result<Option<IngestCursor>>;

    /// Record `position` as the new progress for `source`.
    /// Callers must only do this after the run's merge fully succeeded.
    async fn commit_cursor(
        &self,
        source: &SourceId,
        position: &CursorPosition,
        run_id: Uuid,
    ) -> Result<CommitOutcome>;

    /// Operator-triggered backfill: move the cursor to `to`, or forget it
    /// entirely when `to` is `None`.
    async fn reset_cursor(&self, source: &SourceId, to: Option<&CursorPosition>) -> Result<()>;

    async fn list_cursors(&self) -> Result<Vec<IngestCursor>>;
}

/// Shared monotonic comparison used by every backend.
pub(crate) fn classify_commit(
    current: Option<&CursorPosition>,
    proposed: &CursorPosition,
) -> CommitOutcome {
    match current {
        None => CommitOutcome::Advanced,
        Some(cur) if proposed > cur => CommitOutcome::Advanced,
        Some(cur) if proposed == cur => CommitOutcome::Unchanged,
        Some(_) => CommitOutcome::Stale,
    }
}
