// In-process stores. Used by tests and by local runs without DATABASE_URL.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use pulse_common::{
    CanonicalRecord, CursorPosition, FetchRun, IngestCursor, IngestError, NaturalKey, Result,
    Revision, RunStatus, SourceId,
};

use crate::canonical::{CanonicalStore, CasOutcome};
use crate::cursor::{classify_commit, CommitOutcome, CursorStore};
use crate::runs::RunLog;

/// Cursor, canonical and run-log stores backed by process memory.
#[derive(Default)]
pub struct InMemoryStore {
    cursors: Mutex<HashMap<SourceId, IngestCursor>>,
    canonical: Mutex<HashMap<(SourceId, NaturalKey), CanonicalRecord>>,
    runs: Mutex<HashMap<Uuid, FetchRun>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of canonical rows for `source`.
    pub fn canonical_len(&self, source: &SourceId) -> usize {
        self.canonical
            .lock()
            .map(|rows| rows.keys().filter(|(s, _)| s == source).count())
            .unwrap_or(0)
    }
}

fn poisoned<T>(_: T) -> IngestError {
    IngestError::Storage("in-memory store lock poisoned".to_string())
}

#[async_trait]
impl CursorStore for InMemoryStore {
    async fn get_cursor(&self, source: &SourceId) -> Result<Option<IngestCursor>> {
        let cursors = self.cursors.lock().map_err(poisoned)?;
        Ok(cursors.get(source).cloned())
    }

    async fn commit_cursor(
        &self,
        source: &SourceId,
        position: &CursorPosition,
        run_id: Uuid,
    ) -> Result<CommitOutcome> {
        let mut cursors = self.cursors.lock().map_err(poisoned)?;
        let current = cursors.get(source).map(|c| c.position());
        let outcome = classify_commit(current.as_ref(), position);
        if outcome == CommitOutcome::Advanced {
            cursors.insert(
                source.clone(),
                IngestCursor {
                    source_id: source.clone(),
                    cursor_timestamp: position.timestamp,
                    tie_breaker_id: position.tie_breaker_id.clone(),
                    updated_at: Utc::now(),
                    last_run_id: Some(run_id),
                },
            );
        }
        Ok(outcome)
    }

    async fn reset_cursor(&self, source: &SourceId, to: Option<&CursorPosition>) -> Result<()> {
        let mut cursors = self.cursors.lock().map_err(poisoned)?;
        match to {
            Some(position) => {
                cursors.insert(
                    source.clone(),
                    IngestCursor {
                        source_id: source.clone(),
                        cursor_timestamp: position.timestamp,
                        tie_breaker_id: position.tie_breaker_id.clone(),
                        updated_at: Utc::now(),
                        last_run_id: None,
                    },
                );
            }
            None => {
                cursors.remove(source);
            }
        }
        Ok(())
    }

    async fn list_cursors(&self) -> Result<Vec<IngestCursor>> {
        let cursors = self.cursors.lock().map_err(poisoned)?;
        let mut all: Vec<_> = cursors.values().cloned().collect();
        all.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(all)
    }
}

#[async_trait]
impl CanonicalStore for InMemoryStore {
    async fn get(&self, source: &SourceId, key: &NaturalKey) -> Result<Option<CanonicalRecord>> {
        let rows = self.canonical.lock().map_err(poisoned)?;
        Ok(rows.get(&(source.clone(), key.clone())).cloned())
    }

    async fn compare_and_swap(
        &self,
        expected: Option<Revision>,
        record: &CanonicalRecord,
    ) -> Result<CasOutcome> {
        let mut rows = self.canonical.lock().map_err(poisoned)?;
        let id = (record.source_id.clone(), record.natural_key.clone());
        let current = rows.get(&id).map(|r| r.revision());
        if current != expected {
            return Ok(CasOutcome::Conflict);
        }
        rows.insert(id, record.clone());
        Ok(CasOutcome::Applied)
    }

    async fn scan(
        &self,
        source: &SourceId,
        merged_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CanonicalRecord>> {
        let rows = self.canonical.lock().map_err(poisoned)?;
        let mut out: Vec<_> = rows
            .values()
            .filter(|r| &r.source_id == source)
            .filter(|r| merged_since.map_or(true, |since| r.last_merged_at >= since))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
        Ok(out)
    }
}

#[async_trait]
impl RunLog for InMemoryStore {
    async fn open(&self, run: &FetchRun) -> Result<()> {
        let mut runs = self.runs.lock().map_err(poisoned)?;
        runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn close(&self, run: &FetchRun) -> Result<()> {
        let mut runs = self.runs.lock().map_err(poisoned)?;
        runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<FetchRun>> {
        let runs = self.runs.lock().map_err(poisoned)?;
        Ok(runs.get(&run_id).cloned())
    }

    async fn recent(&self, source: &SourceId, limit: usize) -> Result<Vec<FetchRun>> {
        let runs = self.runs.lock().map_err(poisoned)?;
        let mut out: Vec<_> = runs
            .values()
            .filter(|r| &r.source_id == source)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn purgeable(&self, before: DateTime<Utc>) -> Result<Vec<FetchRun>> {
        let runs = self.runs.lock().map_err(poisoned)?;
        let mut out: Vec<_> = runs
            .values()
            .filter(|r| r.status == RunStatus::Succeeded && r.landing_purged_at.is_none())
            .filter(|r| r.completed_at.is_some_and(|done| done < before))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.completed_at.cmp(&b.completed_at));
        Ok(out)
    }

    async fn mark_purged(&self, run_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut runs = self.runs.lock().map_err(poisoned)?;
        match runs.get_mut(&run_id) {
            Some(run) => {
                run.landing_purged_at = Some(at);
                Ok(())
            }
            None => Err(IngestError::Storage(format!("unknown fetch run {run_id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pulse_common::{FetchWindow, RawRecord};
    use serde_json::json;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, h, 0, 0).unwrap()
    }

    fn record(key: &str, freshness: DateTime<Utc>) -> RawRecord {
        let source = SourceId::new("src");
        RawRecord {
            natural_key: NaturalKey::derive(&source, key),
            source_id: source,
            observed_at: freshness,
            freshness_time: freshness,
            tie_breaker_id: key.to_string(),
            fingerprint: "f".to_string(),
            payload: json!({"k": key}),
            fetch_run_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn cursor_commit_is_idempotent_and_monotonic() {
        let store = InMemoryStore::new();
        let src = SourceId::new("reddit");
        let run = Uuid::new_v4();
        let p1 = CursorPosition::new(at(10), "a");
        let p0 = CursorPosition::new(at(9), "z");

        assert_eq!(store.commit_cursor(&src, &p1, run).await.unwrap(), CommitOutcome::Advanced);
        assert_eq!(store.commit_cursor(&src, &p1, run).await.unwrap(), CommitOutcome::Unchanged);
        assert_eq!(store.commit_cursor(&src, &p0, run).await.unwrap(), CommitOutcome::Stale);
        assert_eq!(store.get_cursor(&src).await.unwrap().unwrap().position(), p1);
    }

    #[tokio::test]
    async fn reset_moves_cursor_backwards() {
        let store = InMemoryStore::new();
        let src = SourceId::new("cfpb");
        store
            .commit_cursor(&src, &CursorPosition::new(at(10), "a"), Uuid::new_v4())
            .await
            .unwrap();
        store
            .reset_cursor(&src, Some(&CursorPosition::new(at(1), "")))
            .await
            .unwrap();
        assert_eq!(store.get_cursor(&src).await.unwrap().unwrap().cursor_timestamp, at(1));

        store.reset_cursor(&src, None).await.unwrap();
        assert!(store.get_cursor(&src).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cas_rejects_stale_revision() {
        let store = InMemoryStore::new();
        let first = CanonicalRecord::first_sighting(&record("k", at(10)), at(10));

        assert_eq!(store.compare_and_swap(None, &first).await.unwrap(), CasOutcome::Applied);
        // A second insert attempt loses.
        assert_eq!(store.compare_and_swap(None, &first).await.unwrap(), CasOutcome::Conflict);

        let second = first.superseded_by(&record("k", at(11)), at(11));
        assert_eq!(
            store.compare_and_swap(Some(first.revision()), &second).await.unwrap(),
            CasOutcome::Applied
        );
        // Writer still holding the old revision loses.
        assert_eq!(
            store.compare_and_swap(Some(first.revision()), &second).await.unwrap(),
            CasOutcome::Conflict
        );
        assert_eq!(store.canonical_len(&SourceId::new("src")), 1);
    }

    #[tokio::test]
    async fn recent_runs_newest_first() {
        let store = InMemoryStore::new();
        let src = SourceId::new("trends");
        let window = FetchWindow::new(at(0), at(1));
        let mut older = FetchRun::open(src.clone(), window, at(1));
        let newer = FetchRun::open(src.clone(), window, at(2));
        store.open(&older).await.unwrap();
        store.open(&newer).await.unwrap();
        older.close(RunStatus::Succeeded, at(3), None);
        store.close(&older).await.unwrap();

        let recent = store.recent(&src, 10).await.unwrap();
        assert_eq!(recent[0].run_id, newer.run_id);
        assert_eq!(recent[1].status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn purgeable_runs_are_old_succeeded_and_unpurged() {
        let store = InMemoryStore::new();
        let src = SourceId::new("cfpb");
        let window = FetchWindow::new(at(0), at(1));

        let mut old = FetchRun::open(src.clone(), window, at(1));
        old.close(RunStatus::Succeeded, at(2), None);
        let mut failed = FetchRun::open(src.clone(), window, at(1));
        failed.close(RunStatus::FailedTransient, at(2), Some("timeout".into()));
        let mut fresh = FetchRun::open(src.clone(), window, at(5));
        fresh.close(RunStatus::Succeeded, at(6), None);
        let running = FetchRun::open(src.clone(), window, at(1));
        for run in [&old, &failed, &fresh, &running] {
            store.open(run).await.unwrap();
        }

        let due = store.purgeable(at(4)).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].run_id, old.run_id);

        store.mark_purged(old.run_id, at(4)).await.unwrap();
        assert!(store.purgeable(at(4)).await.unwrap().is_empty());
        assert_eq!(RunLog::get(&store, old.run_id).await.unwrap().unwrap().landing_purged_at, Some(at(4)));
        assert!(store.mark_purged(Uuid::new_v4(), at(4)).await.is_err());
    }
}
