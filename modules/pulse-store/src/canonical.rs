use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pulse_common::{CanonicalRecord, NaturalKey, Result, Revision, SourceId};

/// Outcome of a single-row compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// The row changed (or appeared) since it was read.
    Conflict,
}

/// The deduplicated record set, one logical table per source.
///
/// Writes are scoped to one `(source_id, natural_key)` row and guarded by the
/// row's [`Revision`], so writers touching distinct keys never contend and
/// writers racing on the same key cannot lose updates.
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    async fn get(&self, source: &SourceId, key: &NaturalKey) -> Result<Option<CanonicalRecord>>;

    /// Insert `record` when `expected` is `None` and the row is absent, or
    /// replace the row when its current revision equals `expected`.
    async fn compare_and_swap(
        &self,
        expected: Option<Revision>,
        record: &CanonicalRecord,
    ) -> Result<CasOutcome>;

    /// Rows of `source`, optionally only those merged at or after `merged_since`.
    async fn scan(
        &self,
        source: &SourceId,
        merged_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CanonicalRecord>>;
}
