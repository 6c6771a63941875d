//! Freshness-gated reconciliation of landed records into the canonical store.
//!
//! A candidate replaces the stored row only when its version key
//! `(freshness_time, observed_at, tie_breaker_id, fingerprint)` is strictly
//! greater. Because that order is total, merging the same or overlapping
//! record sets in any order converges to the same canonical state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, error, warn};

use pulse_common::{CanonicalRecord, CursorPosition, IngestError, NaturalKey, RawRecord, Result};
use pulse_store::{CanonicalStore, CasOutcome};

const DEFAULT_MAX_CAS_ATTEMPTS: u32 = 5;
const DEFAULT_CONCURRENCY: usize = 16;

/// Counts from merging one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Distinct natural keys in the input.
    pub candidates: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Equal freshness with differing content, settled by the version key.
    pub tie_conflicts: usize,
    /// Greatest `(observed_at, tie_breaker_id)` across every input record.
    pub cursor_position: Option<CursorPosition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyOutcome {
    Inserted,
    Updated,
    Unchanged,
}

pub struct MergeEngine {
    canonical: Arc<dyn CanonicalStore>,
    max_cas_attempts: u32,
    concurrency: usize,
}

impl MergeEngine {
    pub fn new(canonical: Arc<dyn CanonicalStore>) -> Self {
        Self {
            canonical,
            max_cas_attempts: DEFAULT_MAX_CAS_ATTEMPTS,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_max_cas_attempts(mut self, attempts: u32) -> Self {
        self.max_cas_attempts = attempts.max(1);
        self
    }

    /// Keys merged in parallel. Distinct keys never contend.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Merge every record of one run. Fails on the first key that cannot be
    /// written; keys already applied stay applied, and re-merging is a no-op
    /// for them.
    pub async fn merge(&self, records: &[RawRecord], now: DateTime<Utc>) -> Result<MergeReport> {
        let (candidates, in_run_ties) = select_candidates(records);
        let mut report = MergeReport {
            candidates: candidates.len(),
            tie_conflicts: in_run_ties,
            cursor_position: records.iter().map(RawRecord::cursor_position).max(),
            ..MergeReport::default()
        };

        let outcomes: Vec<(KeyOutcome, bool)> = stream::iter(candidates)
            .map(|candidate| self.merge_one(candidate, now))
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        for (outcome, tie) in outcomes {
            match outcome {
                KeyOutcome::Inserted => report.inserted += 1,
                KeyOutcome::Updated => report.updated += 1,
                KeyOutcome::Unchanged => report.unchanged += 1,
            }
            if tie {
                report.tie_conflicts += 1;
            }
        }

        debug!(
            candidates = report.candidates,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            "Merge complete"
        );
        Ok(report)
    }

    /// Read, compare, compare-and-swap. A lost swap re-reads and decides again.
    async fn merge_one(
        &self,
        candidate: &RawRecord,
        now: DateTime<Utc>,
    ) -> Result<(KeyOutcome, bool)> {
        for attempt in 1..=self.max_cas_attempts {
            let existing = self
                .canonical
                .get(&candidate.source_id, &candidate.natural_key)
                .await?;

            let tie = existing
                .as_ref()
                .is_some_and(|row| is_freshness_tie(row, candidate));
            if tie {
                warn!(
                    signal = "freshness_tie",
                    natural_key = %candidate.natural_key,
                    freshness_time = %candidate.freshness_time,
                    "Equal freshness with differing content"
                );
            }

            let (expected, next, outcome) = match existing {
                None => (
                    None,
                    CanonicalRecord::first_sighting(candidate, now),
                    KeyOutcome::Inserted,
                ),
                Some(row) if candidate.version() > row.version() => (
                    Some(row.revision()),
                    row.superseded_by(candidate, now),
                    KeyOutcome::Updated,
                ),
                Some(_) => return Ok((KeyOutcome::Unchanged, tie)),
            };

            match self.canonical.compare_and_swap(expected, &next).await? {
                CasOutcome::Applied => return Ok((outcome, tie)),
                CasOutcome::Conflict => {
                    debug!(
                        natural_key = %candidate.natural_key,
                        attempt,
                        "Canonical row changed underneath merge, re-reading"
                    );
                }
            }
        }

        error!(
            signal = "merge_conflict",
            natural_key = %candidate.natural_key,
            attempts = self.max_cas_attempts,
            "Compare-and-swap kept losing"
        );
        Err(IngestError::MergeConflict {
            natural_key: candidate.natural_key.to_string(),
            message: format!("gave up after {} attempts", self.max_cas_attempts),
        })
    }
}

fn is_freshness_tie(row: &CanonicalRecord, candidate: &RawRecord) -> bool {
    row.freshness_time == candidate.freshness_time && row.fingerprint != candidate.fingerprint
}

/// The greatest version per natural key, in key order, plus the number of
/// keys whose winning freshness was shared by differing content.
fn select_candidates(records: &[RawRecord]) -> (Vec<&RawRecord>, usize) {
    let mut groups: HashMap<&NaturalKey, Vec<&RawRecord>> = HashMap::new();
    for record in records {
        groups.entry(&record.natural_key).or_default().push(record);
    }

    let mut ties = 0;
    let mut candidates = Vec::with_capacity(groups.len());
    for (key, group) in groups {
        let Some(winner) = group.iter().copied().max_by(|a, b| a.version().cmp(&b.version())) else {
            continue;
        };
        let tied = group.iter().any(|r| {
            r.freshness_time == winner.freshness_time && r.fingerprint != winner.fingerprint
        });
        if tied {
            ties += 1;
            warn!(
                signal = "freshness_tie",
                natural_key = %key,
                freshness_time = %winner.freshness_time,
                "Run carries differing versions with equal freshness"
            );
        }
        candidates.push(winner);
    }

    candidates.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
    (candidates, ties)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pulse_common::SourceId;
    use pulse_store::InMemoryStore;
    use serde_json::json;
    use uuid::Uuid;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, h, m, 0).unwrap()
    }

    fn rec(key: &str, observed: DateTime<Utc>, fresh: DateTime<Utc>, body: &str) -> RawRecord {
        let source = SourceId::new("reddit");
        RawRecord {
            natural_key: NaturalKey::derive(&source, key),
            source_id: source,
            observed_at: observed,
            freshness_time: fresh,
            tie_breaker_id: key.to_string(),
            fingerprint: pulse_common::content_fingerprint(body),
            payload: json!({"body": body}),
            fetch_run_id: Uuid::nil(),
        }
    }

    #[test]
    fn selection_keeps_freshest_version_per_key() {
        let records = vec![
            rec("a", at(10, 0), at(10, 0), "v1"),
            rec("a", at(10, 0), at(11, 0), "v2"),
            rec("b", at(9, 0), at(9, 0), "only"),
        ];
        let (candidates, ties) = select_candidates(&records);
        assert_eq!(ties, 0);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].payload["body"], "v2");
        assert_eq!(candidates[1].payload["body"], "only");
    }

    #[test]
    fn equal_freshness_is_settled_by_version_order_and_counted() {
        let x = rec("a", at(10, 0), at(11, 0), "left");
        let y = rec("a", at(10, 0), at(11, 0), "right");
        let expected = if x.version() > y.version() { "left" } else { "right" };

        let forward = [x.clone(), y.clone()];
        let backward = [y, x];
        let (c1, t1) = select_candidates(&forward);
        let (c2, t2) = select_candidates(&backward);
        assert_eq!(c1[0].payload["body"], expected);
        assert_eq!(c2[0].payload["body"], expected);
        assert_eq!((t1, t2), (1, 1));
    }

    #[test]
    fn superseded_tie_is_not_reported() {
        let records = vec![
            rec("a", at(10, 0), at(11, 0), "left"),
            rec("a", at(10, 0), at(11, 0), "right"),
            rec("a", at(10, 0), at(12, 0), "final"),
        ];
        let (candidates, ties) = select_candidates(&records);
        assert_eq!(candidates[0].payload["body"], "final");
        assert_eq!(ties, 0);
    }

    #[tokio::test]
    async fn report_counts_inserts_updates_and_noops() {
        let store = Arc::new(InMemoryStore::new());
        let engine = MergeEngine::new(store.clone());

        let first = engine
            .merge(&[rec("a", at(10, 0), at(10, 0), "v1")], at(12, 0))
            .await
            .unwrap();
        assert_eq!((first.inserted, first.updated, first.unchanged), (1, 0, 0));

        let second = engine
            .merge(
                &[
                    rec("a", at(10, 0), at(10, 30), "v2"),
                    rec("b", at(10, 15), at(10, 15), "new"),
                ],
                at(13, 0),
            )
            .await
            .unwrap();
        assert_eq!((second.inserted, second.updated, second.unchanged), (1, 1, 0));
        assert_eq!(
            second.cursor_position,
            Some(CursorPosition::new(at(10, 15), "b"))
        );

        let again = engine
            .merge(&[rec("a", at(10, 0), at(10, 30), "v2")], at(14, 0))
            .await
            .unwrap();
        assert_eq!(again.unchanged, 1);
    }

    #[tokio::test]
    async fn empty_input_has_no_cursor() {
        let engine = MergeEngine::new(Arc::new(InMemoryStore::new()));
        let report = engine.merge(&[], at(0, 0)).await.unwrap();
        assert_eq!(report, MergeReport::default());
    }
}
