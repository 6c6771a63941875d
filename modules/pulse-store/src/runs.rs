use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use pulse_common::{FetchRun, Result, SourceId};

/// History of fetch runs, one row per adapter execution.
#[async_trait]
pub trait RunLog: Send + Sync {
    async fn open(&self, run: &FetchRun) -> Result<()>;

    /// Persist the run's terminal status.
    async fn close(&self, run: &FetchRun) -> Result<()>;

    async fn get(&self, run_id: Uuid) -> Result<Option<FetchRun>>;

    /// Most recent runs for `source`, newest first.
    async fn recent(&self, source: &SourceId, limit: usize) -> Result<Vec<FetchRun>>;

    /// Succeeded runs completed before `before` whose landed objects still exist.
    async fn purgeable(&self, before: DateTime<Utc>) -> Result<Vec<FetchRun>>;

    /// Record that the run's landed objects were deleted.
    async fn mark_purged(&self, run_id: Uuid, at: DateTime<Utc>) -> Result<()>;
}
