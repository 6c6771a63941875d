// Postgres-backed cursor, canonical and run-log stores.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use pulse_common::{
    CanonicalRecord, CursorPosition, FetchRun, IngestCursor, IngestError, NaturalKey, Result,
    Revision, RunStatus, SourceId,
};

use crate::canonical::{CanonicalStore, CasOutcome};
use crate::cursor::{classify_commit, CommitOutcome, CursorStore};
use crate::runs::RunLog;

fn db(err: sqlx::Error) -> IngestError {
    IngestError::Storage(err.to_string())
}

/// Postgres keeps microseconds. Truncate before comparing against stored values.
fn micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(db)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| IngestError::Storage(format!("migration failed: {e}")))?;
        info!("Ingest store migrations applied");
        Ok(())
    }
}

// --- Rows ---

#[derive(sqlx::FromRow)]
struct CursorRow {
    source_id: String,
    cursor_ts: DateTime<Utc>,
    tie_breaker_id: String,
    updated_at: DateTime<Utc>,
    last_run_id: Option<Uuid>,
}

impl From<CursorRow> for IngestCursor {
    fn from(row: CursorRow) -> Self {
        IngestCursor {
            source_id: SourceId::new(row.source_id),
            cursor_timestamp: row.cursor_ts,
            tie_breaker_id: row.tie_breaker_id,
            updated_at: row.updated_at,
            last_run_id: row.last_run_id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CanonicalRow {
    source_id: String,
    natural_key: String,
    payload: serde_json::Value,
    freshness_time: DateTime<Utc>,
    observed_at: DateTime<Utc>,
    tie_breaker_id: String,
    fingerprint: String,
    first_seen_at: DateTime<Utc>,
    last_merged_at: DateTime<Utc>,
    merge_count: i64,
    last_run_id: Uuid,
}

impl From<CanonicalRow> for CanonicalRecord {
    fn from(row: CanonicalRow) -> Self {
        CanonicalRecord {
            natural_key: NaturalKey::from_stored(row.natural_key),
            source_id: SourceId::new(row.source_id),
            payload: row.payload,
            freshness_time: row.freshness_time,
            observed_at: row.observed_at,
            tie_breaker_id: row.tie_breaker_id,
            fingerprint: row.fingerprint,
            first_seen_at: row.first_seen_at,
            last_merged_at: row.last_merged_at,
            merge_count: row.merge_count,
            last_run_id: row.last_run_id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: Uuid,
    source_id: String,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    status: String,
    error: Option<String>,
    landing_purged_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunRow> for FetchRun {
    type Error = IngestError;

    fn try_from(row: RunRow) -> Result<Self> {
        let status: RunStatus = row.status.parse().map_err(IngestError::Storage)?;
        Ok(FetchRun {
            run_id: row.run_id,
            source_id: SourceId::new(row.source_id),
            window_start: row.window_start,
            window_end: row.window_end,
            started_at: row.started_at,
            completed_at: row.completed_at,
            status,
            error: row.error,
            landing_purged_at: row.landing_purged_at,
        })
    }
}

// --- Cursor ---

#[async_trait]
impl CursorStore for PgStore {
    async fn get_cursor(&self, source: &SourceId) -> Result<Option<IngestCursor>> {
        let row = sqlx::query_as::<_, CursorRow>(
            "SELECT source_id, cursor_ts, tie_breaker_id, updated_at, last_run_id
             FROM ingest_cursors WHERE source_id = $1",
        )
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        Ok(row.map(Into::into))
    }

    async fn commit_cursor(
        &self,
        source: &SourceId,
        position: &CursorPosition,
        run_id: Uuid,
    ) -> Result<CommitOutcome> {
        let ts = micros(position.timestamp);

        // Single statement: the row only moves when the new position is strictly ahead.
        let result = sqlx::query(
            r#"
            INSERT INTO ingest_cursors (source_id, cursor_ts, tie_breaker_id, updated_at, last_run_id)
            VALUES ($1, $2, $3, now(), $4)
            ON CONFLICT (source_id) DO UPDATE
               SET cursor_ts = EXCLUDED.cursor_ts,
                   tie_breaker_id = EXCLUDED.tie_breaker_id,
                   updated_at = now(),
                   last_run_id = EXCLUDED.last_run_id
             WHERE (ingest_cursors.cursor_ts, ingest_cursors.tie_breaker_id)
                 < (EXCLUDED.cursor_ts, EXCLUDED.tie_breaker_id)
            "#,
        )
        .bind(source.as_str())
        .bind(ts)
        .bind(&position.tie_breaker_id)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 1 {
            return Ok(CommitOutcome::Advanced);
        }

        let current = self.get_cursor(source).await?.map(|c| c.position());
        let proposed = CursorPosition::new(ts, position.tie_breaker_id.clone());
        Ok(match classify_commit(current.as_ref(), &proposed) {
            // Lost a race to an equal or later commit.
            CommitOutcome::Advanced => CommitOutcome::Stale,
            other => other,
        })
    }

    async fn reset_cursor(&self, source: &SourceId, to: Option<&CursorPosition>) -> Result<()> {
        match to {
            Some(position) => {
                sqlx::query(
                    "INSERT INTO ingest_cursors (source_id, cursor_ts, tie_breaker_id, updated_at, last_run_id)
                     VALUES ($1, $2, $3, now(), NULL)
                     ON CONFLICT (source_id) DO UPDATE
                        SET cursor_ts = EXCLUDED.cursor_ts,
                            tie_breaker_id = EXCLUDED.tie_breaker_id,
                            updated_at = now(),
                            last_run_id = NULL",
                )
                .bind(source.as_str())
                .bind(micros(position.timestamp))
                .bind(&position.tie_breaker_id)
                .execute(&self.pool)
                .await
                .map_err(db)?;
            }
            None => {
                sqlx::query("DELETE FROM ingest_cursors WHERE source_id = $1")
                    .bind(source.as_str())
                    .execute(&self.pool)
                    .await
                    .map_err(db)?;
            }
        }
        Ok(())
    }

    async fn list_cursors(&self) -> Result<Vec<IngestCursor>> {
        let rows = sqlx::query_as::<_, CursorRow>(
            "SELECT source_id, cursor_ts, tie_breaker_id, updated_at, last_run_id
             FROM ingest_cursors ORDER BY source_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// --- Canonical ---

const CANONICAL_COLUMNS: &str = "source_id, natural_key, payload, freshness_time, observed_at, \
     tie_breaker_id, fingerprint, first_seen_at, last_merged_at, merge_count, last_run_id";

#[async_trait]
impl CanonicalStore for PgStore {
    async fn get(&self, source: &SourceId, key: &NaturalKey) -> Result<Option<CanonicalRecord>> {
        let sql = format!(
            "SELECT {CANONICAL_COLUMNS} FROM canonical_records
             WHERE source_id = $1 AND natural_key = $2"
        );
        let row = sqlx::query_as::<_, CanonicalRow>(&sql)
            .bind(source.as_str())
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        Ok(row.map(Into::into))
    }

    async fn compare_and_swap(
        &self,
        expected: Option<Revision>,
        record: &CanonicalRecord,
    ) -> Result<CasOutcome> {
        let result = match expected {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO canonical_records
                        (source_id, natural_key, payload, freshness_time, observed_at,
                         tie_breaker_id, fingerprint, first_seen_at, last_merged_at,
                         merge_count, last_run_id)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    ON CONFLICT (source_id, natural_key) DO NOTHING
                    "#,
                )
                .bind(record.source_id.as_str())
                .bind(record.natural_key.as_str())
                .bind(&record.payload)
                .bind(record.freshness_time)
                .bind(record.observed_at)
                .bind(&record.tie_breaker_id)
                .bind(&record.fingerprint)
                .bind(record.first_seen_at)
                .bind(record.last_merged_at)
                .bind(record.merge_count)
                .bind(record.last_run_id)
                .execute(&self.pool)
                .await
            }
            Some(rev) => {
                sqlx::query(
                    r#"
                    UPDATE canonical_records
                       SET payload = $3,
                           freshness_time = $4,
                           observed_at = $5,
                           tie_breaker_id = $6,
                           fingerprint = $7,
                           last_merged_at = $8,
                           merge_count = $9,
                           last_run_id = $10
                     WHERE source_id = $1 AND natural_key = $2
                       AND freshness_time = $11 AND merge_count = $12
                    "#,
                )
                .bind(record.source_id.as_str())
                .bind(record.natural_key.as_str())
                .bind(&record.payload)
                .bind(record.freshness_time)
                .bind(record.observed_at)
                .bind(&record.tie_breaker_id)
                .bind(&record.fingerprint)
                .bind(record.last_merged_at)
                .bind(record.merge_count)
                .bind(record.last_run_id)
                .bind(rev.freshness_time)
                .bind(rev.merge_count)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(db)?;

        Ok(if result.rows_affected() == 1 {
            CasOutcome::Applied
        } else {
            CasOutcome::Conflict
        })
    }

    async fn scan(
        &self,
        source: &SourceId,
        merged_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CanonicalRecord>> {
        let sql = format!(
            "SELECT {CANONICAL_COLUMNS} FROM canonical_records
             WHERE source_id = $1 AND ($2::timestamptz IS NULL OR last_merged_at >= $2)
             ORDER BY natural_key"
        );
        let rows = sqlx::query_as::<_, CanonicalRow>(&sql)
            .bind(source.as_str())
            .bind(merged_since)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// --- Run log ---

const RUN_COLUMNS: &str = "run_id, source_id, window_start, window_end, started_at, completed_at, \
     status, error, landing_purged_at";

#[async_trait]
impl RunLog for PgStore {
    async fn open(&self, run: &FetchRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO fetch_runs
                (run_id, source_id, window_start, window_end, started_at, completed_at, status, error)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(run.run_id)
        .bind(run.source_id.as_str())
        .bind(run.window_start)
        .bind(run.window_end)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.status.as_str())
        .bind(&run.error)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn close(&self, run: &FetchRun) -> Result<()> {
        sqlx::query(
            "UPDATE fetch_runs SET completed_at = $2, status = $3, error = $4 WHERE run_id = $1",
        )
        .bind(run.run_id)
        .bind(run.completed_at)
        .bind(run.status.as_str())
        .bind(&run.error)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<FetchRun>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM fetch_runs WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.map(FetchRun::try_from).transpose()
    }

    async fn recent(&self, source: &SourceId, limit: usize) -> Result<Vec<FetchRun>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM fetch_runs WHERE source_id = $1
             ORDER BY started_at DESC
             LIMIT $2"
        ))
        .bind(source.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.into_iter().map(FetchRun::try_from).collect()
    }

    async fn purgeable(&self, before: DateTime<Utc>) -> Result<Vec<FetchRun>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM fetch_runs
             WHERE status = 'succeeded' AND landing_purged_at IS NULL AND completed_at < $1
             ORDER BY completed_at"
        ))
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.into_iter().map(FetchRun::try_from).collect()
    }

    async fn mark_purged(&self, run_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let done = sqlx::query("UPDATE fetch_runs SET landing_purged_at = $2 WHERE run_id = $1")
            .bind(run_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        if done.rows_affected() == 0 {
            return Err(IngestError::Storage(format!("unknown fetch run {run_id}")));
        }
        Ok(())
    }
}
