use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Identifiers ---

/// Identifier of one configured external source (e.g. "reddit", "cfpb").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Stable, source-prefixed identity of a logical record.
///
/// Always `{source_id}:{native_key}` so two sources can never collide,
/// even when their native identifiers overlap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
    /// Derive the canonical key for a native identifier of `source`.
    pub fn derive(source: &SourceId, native: &str) -> Self {
        Self(format!("{}:{}", source, native.trim()))
    }

    /// Wrap a key that was already derived (e.g. loaded from storage).
    pub fn from_stored(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Cursor ---

/// A `(timestamp, tie-breaker)` pair marking fetch progress.
/// Ordered by timestamp first, then tie-breaker id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CursorPosition {
    pub timestamp: DateTime<Utc>,
    pub tie_breaker_id: String,
}

impl CursorPosition {
    pub fn new(timestamp: DateTime<Utc>, tie_breaker_id: impl Into<String>) -> Self {
        Self {
            timestamp,
            tie_breaker_id: tie_breaker_id.into(),
        }
    }
}

/// Persisted per-source progress. One row per source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestCursor {
    pub source_id: SourceId,
    pub cursor_timestamp: DateTime<Utc>,
    pub tie_breaker_id: String,
    pub updated_at: DateTime<Utc>,
    /// Run whose merge justified the last advance.
    pub last_run_id: Option<Uuid>,
}

impl IngestCursor {
    pub fn position(&self) -> CursorPosition {
        CursorPosition::new(self.cursor_timestamp, self.tie_breaker_id.clone())
    }

    /// How far `updated_at` trails wall-clock time. The primary health signal:
    /// a stuck pipeline shows up as a growing lag.
    pub fn lag(&self, now: DateTime<Utc>) -> Duration {
        now - self.updated_at
    }
}

// --- Fetch window ---

/// Inclusive time range an adapter fetches in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FetchWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Trailing window of `span` ending at `now`.
    pub fn trailing(now: DateTime<Utc>, span: Duration) -> Self {
        Self {
            start: now - span,
            end: now,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

// --- Records ---

/// Total order used to pick between two versions of the same natural key.
///
/// Freshness dominates; `observed_at`, the tie-breaker id and finally the
/// content fingerprint settle exact freshness ties deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionKey<'a> {
    pub freshness_time: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
    pub tie_breaker_id: &'a str,
    pub fingerprint: &'a str,
}

/// A normalized record landed by one fetch run. Immutable once landed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source_id: SourceId,
    pub natural_key: NaturalKey,
    /// Value of the source's cursor field (creation/received/sample time).
    pub observed_at: DateTime<Utc>,
    pub freshness_time: DateTime<Utc>,
    pub tie_breaker_id: String,
    /// Content hash for change-detection telemetry. Never used for identity.
    pub fingerprint: String,
    pub payload: serde_json::Value,
    pub fetch_run_id: Uuid,
}

impl RawRecord {
    pub fn version(&self) -> VersionKey<'_> {
        VersionKey {
            freshness_time: self.freshness_time,
            observed_at: self.observed_at,
            tie_breaker_id: &self.tie_breaker_id,
            fingerprint: &self.fingerprint,
        }
    }

    pub fn cursor_position(&self) -> CursorPosition {
        CursorPosition::new(self.observed_at, self.tie_breaker_id.clone())
    }
}

/// Compare-and-swap token for a canonical row.
///
/// `merge_count` disambiguates successive overwrites that share a freshness time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision {
    pub freshness_time: DateTime<Utc>,
    pub merge_count: i64,
}

/// The deduplicated, authoritative version of a logical record.
/// At most one per `(source_id, natural_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub natural_key: NaturalKey,
    pub source_id: SourceId,
    pub payload: serde_json::Value,
    pub freshness_time: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
    pub tie_breaker_id: String,
    pub fingerprint: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_merged_at: DateTime<Utc>,
    pub merge_count: i64,
    pub last_run_id: Uuid,
}

impl CanonicalRecord {
    /// First sighting of a key.
    pub fn first_sighting(record: &RawRecord, now: DateTime<Utc>) -> Self {
        Self {
            natural_key: record.natural_key.clone(),
            source_id: record.source_id.clone(),
            payload: record.payload.clone(),
            freshness_time: record.freshness_time,
            observed_at: record.observed_at,
            tie_breaker_id: record.tie_breaker_id.clone(),
            fingerprint: record.fingerprint.clone(),
            first_seen_at: now,
            last_merged_at: now,
            merge_count: 1,
            last_run_id: record.fetch_run_id,
        }
    }

    /// The row after `record` supersedes it. Identity and `first_seen_at` are kept.
    pub fn superseded_by(&self, record: &RawRecord, now: DateTime<Utc>) -> Self {
        Self {
            natural_key: self.natural_key.clone(),
            source_id: self.source_id.clone(),
            payload: record.payload.clone(),
            freshness_time: record.freshness_time,
            observed_at: record.observed_at,
            tie_breaker_id: record.tie_breaker_id.clone(),
            fingerprint: record.fingerprint.clone(),
            first_seen_at: self.first_seen_at,
            last_merged_at: now,
            merge_count: self.merge_count + 1,
            last_run_id: record.fetch_run_id,
        }
    }

    pub fn version(&self) -> VersionKey<'_> {
        VersionKey {
            freshness_time: self.freshness_time,
            observed_at: self.observed_at,
            tie_breaker_id: &self.tie_breaker_id,
            fingerprint: &self.fingerprint,
        }
    }

    pub fn revision(&self) -> Revision {
        Revision {
            freshness_time: self.freshness_time,
            merge_count: self.merge_count,
        }
    }
}

// --- Fetch runs ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    /// Retryable failure; the cursor was left untouched.
    FailedTransient,
    /// Needs an operator (bad credentials, malformed responses, storage down).
    FailedFatal,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::FailedTransient => "failed_transient",
            RunStatus::FailedFatal => "failed_fatal",
            RunStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed_transient" => Ok(RunStatus::FailedTransient),
            "failed_fatal" => Ok(RunStatus::FailedFatal),
            "aborted" => Ok(RunStatus::Aborted),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One adapter execution. Scopes landed records and enables replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRun {
    pub run_id: Uuid,
    pub source_id: SourceId,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error: Option<String>,
    /// Set once retention has deleted the run's landed objects.
    #[serde(default)]
    pub landing_purged_at: Option<DateTime<Utc>>,
}

impl FetchRun {
    pub fn open(source_id: SourceId, window: FetchWindow, now: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source_id,
            window_start: window.start,
            window_end: window.end,
            started_at: now,
            completed_at: None,
            status: RunStatus::Running,
            error: None,
            landing_purged_at: None,
        }
    }

    pub fn window(&self) -> FetchWindow {
        FetchWindow::new(self.window_start, self.window_end)
    }

    pub fn close(&mut self, status: RunStatus, now: DateTime<Utc>, error: Option<String>) {
        self.status = status;
        self.completed_at = Some(now);
        self.error = error;
    }
}

// --- Audit ---

/// Advisory duplicate ratio for a set of rows. Never mutates canonical state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateAuditResult {
    pub source_id: SourceId,
    pub run_id: Option<Uuid>,
    pub total_rows: u64,
    pub unique_keys: u64,
    pub duplicate_pct: f64,
    pub checked_at: DateTime<Utc>,
}

impl DuplicateAuditResult {
    pub fn from_counts(
        source_id: SourceId,
        run_id: Option<Uuid>,
        total_rows: u64,
        unique_keys: u64,
        checked_at: DateTime<Utc>,
    ) -> Self {
        let duplicate_pct = if total_rows == 0 {
            0.0
        } else {
            (total_rows - unique_keys) as f64 / total_rows as f64
        };
        Self {
            source_id,
            run_id,
            total_rows,
            unique_keys,
            duplicate_pct,
            checked_at,
        }
    }
}
