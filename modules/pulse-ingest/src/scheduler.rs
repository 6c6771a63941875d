//! Drives fetch runs: one lease per source, many sources at once.
//!
//! A run reads the cursor, fetches, normalizes, lands, merges and only then
//! commits the cursor. Any failure or abort before that last step leaves the
//! cursor where it was, so the next run simply starts over from it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

use pulse_common::{
    CursorPosition, DuplicateAuditResult, FetchRun, FetchWindow, FileConfig, IngestCursor,
    IngestError, Result, RunStatus, SourceId,
};
use pulse_sources::{CursorMode, Normalizer, SourceAdapter};
use pulse_store::{
    CanonicalStore, CommitOutcome, CursorStore, InMemoryStore, LandingStore, MemoryLandingStore,
    PgStore, RunLog,
};

use crate::audit::DuplicateAuditor;
use crate::landing::LandingBuffer;
use crate::merge::{MergeEngine, MergeReport};

/// The four persistence seams a scheduler needs.
#[derive(Clone)]
pub struct Stores {
    pub cursors: Arc<dyn CursorStore>,
    pub canonical: Arc<dyn CanonicalStore>,
    pub runs: Arc<dyn RunLog>,
    pub landing: Arc<dyn LandingStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self {
            cursors: store.clone(),
            canonical: store.clone(),
            runs: store,
            landing: Arc::new(MemoryLandingStore::new()),
        }
    }

    pub fn postgres(pg: PgStore, landing: Arc<dyn LandingStore>) -> Self {
        let pg = Arc::new(pg);
        Self {
            cursors: pg.clone(),
            canonical: pg.clone(),
            runs: pg,
            landing,
        }
    }
}

/// What one run did.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub source_id: SourceId,
    pub run_id: Uuid,
    pub status: RunStatus,
    pub window: FetchWindow,
    pub fetched: usize,
    pub landed: usize,
    pub dropped: usize,
    pub merge: Option<MergeReport>,
    pub cursor: Option<CommitOutcome>,
    pub audit: Option<DuplicateAuditResult>,
    pub error: Option<String>,
}

/// Result of re-merging a landed run.
#[derive(Debug, Clone)]
pub struct ReplaySummary {
    pub source_id: SourceId,
    pub run_id: Uuid,
    pub records: usize,
    pub merge: MergeReport,
    pub cursor: Option<CommitOutcome>,
}

/// Per-source health, as shown by `pulse status`.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source_id: SourceId,
    pub cursor: Option<CursorPosition>,
    pub cursor_updated_at: Option<DateTime<Utc>>,
    pub lag_seconds: Option<i64>,
    pub stale: bool,
    pub last_run_id: Option<Uuid>,
    pub last_run_status: Option<RunStatus>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Default)]
struct Executed {
    fetched: usize,
    landed: usize,
    dropped: usize,
    merge: Option<MergeReport>,
    cursor: Option<CommitOutcome>,
    audit: Option<DuplicateAuditResult>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Exclusive right to run one source. Released on drop, including when the
/// run's future is cancelled.
struct Lease<'a> {
    held: &'a Mutex<HashSet<SourceId>>,
    source: SourceId,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        lock(self.held).remove(&self.source);
    }
}

/// Resolves once shutdown is signalled. Never resolves without a sender.
async fn shutdown_requested(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

pub struct Scheduler {
    adapters: BTreeMap<SourceId, Arc<dyn SourceAdapter>>,
    stores: Stores,
    normalizer: Normalizer,
    merge: MergeEngine,
    auditor: DuplicateAuditor,
    tick_interval: StdDuration,
    run_timeout: StdDuration,
    escalate_after: u32,
    stale_after: Duration,
    retention: Duration,
    leases: Mutex<HashSet<SourceId>>,
    failures: Mutex<HashMap<SourceId, u32>>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(adapters: Vec<Arc<dyn SourceAdapter>>, stores: Stores, config: &FileConfig) -> Self {
        let adapters = adapters
            .into_iter()
            .map(|a| (a.source_id().clone(), a))
            .collect();
        let (_, shutdown) = watch::channel(false);
        Self {
            adapters,
            normalizer: Normalizer::new(config.normalizer.min_text_len),
            merge: MergeEngine::new(stores.canonical.clone()),
            auditor: DuplicateAuditor::new(
                stores.landing.clone(),
                stores.canonical.clone(),
                &config.audit,
            ),
            stores,
            tick_interval: StdDuration::from_secs(config.scheduler.tick_interval_secs),
            run_timeout: StdDuration::from_secs(config.scheduler.run_timeout_secs),
            escalate_after: config.scheduler.escalate_after_failures,
            stale_after: Duration::hours(config.scheduler.stale_after_hours),
            retention: Duration::days(config.landing.retention_days),
            leases: Mutex::new(HashSet::new()),
            failures: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// In-flight runs abort, and `run_forever` returns, once `rx` turns true.
    pub fn with_shutdown(mut self, rx: watch::Receiver<bool>) -> Self {
        self.shutdown = rx;
        self
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn auditor(&self) -> &DuplicateAuditor {
        &self.auditor
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        self.adapters.keys().cloned().collect()
    }

    pub fn consecutive_failures(&self, source: &SourceId) -> u32 {
        lock(&self.failures).get(source).copied().unwrap_or(0)
    }

    fn adapter(&self, source: &SourceId) -> Result<Arc<dyn SourceAdapter>> {
        self.adapters
            .get(source)
            .cloned()
            .ok_or_else(|| IngestError::Config(format!("unknown or disabled source: {source}")))
    }

    fn lease(&self, source: &SourceId) -> Result<Lease<'_>> {
        if !lock(&self.leases).insert(source.clone()) {
            return Err(IngestError::RunInProgress(source.clone()));
        }
        Ok(Lease {
            held: &self.leases,
            source: source.clone(),
        })
    }

    /// Tick until shutdown.
    pub async fn run_forever(&self) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            sources = self.adapters.len(),
            interval_secs = self.tick_interval.as_secs(),
            "Scheduler started"
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown_requested(self.shutdown.clone()) => {
                    info!("Shutdown requested, scheduler stopping");
                    break;
                }
            }
        }
    }

    /// One run per configured source, concurrently, then housekeeping.
    pub async fn tick(&self) -> Vec<(SourceId, Result<RunSummary>)> {
        let runs = self.adapters.keys().map(|source| async move {
            (source.clone(), self.run_source(source).await)
        });
        let results = futures::future::join_all(runs).await;

        for (source, result) in &results {
            if let Err(e) = result {
                warn!(source = %source, error = %e, "Run not started");
            }
        }

        let now = Utc::now();
        if let Err(e) = self.purge_landing(now).await {
            warn!(error = %e, "Landing retention cleanup failed");
        }
        match self.status(now).await {
            Ok(statuses) => {
                for s in statuses.iter().filter(|s| s.stale) {
                    warn!(
                        signal = "stale_cursor",
                        source = %s.source_id,
                        lag_seconds = ?s.lag_seconds,
                        "Cursor has not advanced recently"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Failed to read cursor status"),
        }
        results
    }

    /// Execute one fetch run for `source`.
    ///
    /// Returns `Err` only when no run could be started (unknown source, lease
    /// held, stores unreachable). A run that started always yields a summary
    /// carrying its terminal status. Store failures before the run opens still
    /// count toward escalation.
    pub async fn run_source(&self, source: &SourceId) -> Result<RunSummary> {
        let adapter = self.adapter(source)?;
        let _lease = self.lease(source)?;

        let mut run = match self.open_run(adapter.as_ref(), Utc::now()).await {
            Ok(run) => run,
            Err(e) => {
                error!(source = %source, error = %e, "Could not open fetch run");
                self.record_outcome(source, failure_status(&e), Some(&e));
                return Err(e);
            }
        };
        let window = run.window();
        info!(
            source = %source,
            run_id = %run.run_id,
            window_start = %window.start,
            window_end = %window.end,
            "Fetch run started"
        );

        let outcome = tokio::select! {
            result = tokio::time::timeout(self.run_timeout, self.execute(adapter.as_ref(), &run)) => {
                Some(result.unwrap_or_else(|_| {
                    Err(IngestError::Timeout(format!(
                        "run exceeded {}s",
                        self.run_timeout.as_secs()
                    )))
                }))
            }
            _ = shutdown_requested(self.shutdown.clone()) => None,
        };

        let (status, executed, error) = match outcome {
            Some(Ok(executed)) => (RunStatus::Succeeded, executed, None),
            Some(Err(e)) => (failure_status(&e), Executed::default(), Some(e)),
            None => (RunStatus::Aborted, Executed::default(), None),
        };

        let message = match (&error, status) {
            (Some(e), _) => Some(e.to_string()),
            (None, RunStatus::Aborted) => Some("aborted by shutdown".to_string()),
            _ => None,
        };
        run.close(status, Utc::now(), message.clone());
        if let Err(e) = self.stores.runs.close(&run).await {
            error!(source = %source, run_id = %run.run_id, error = %e, "Failed to record run status");
        }
        match (&error, status) {
            (_, RunStatus::Aborted) => {
                warn!(source = %source, run_id = %run.run_id, "Fetch run aborted, cursor untouched");
            }
            (Some(e), _) if e.needs_operator() => {
                error!(source = %source, run_id = %run.run_id, error = %e, "Fetch run failed");
            }
            (Some(e), _) => {
                warn!(source = %source, run_id = %run.run_id, error = %e, "Fetch run failed, will retry next tick");
            }
            (None, _) => {}
        }
        self.record_outcome(source, status, error.as_ref());

        Ok(RunSummary {
            source_id: source.clone(),
            run_id: run.run_id,
            status,
            window,
            fetched: executed.fetched,
            landed: executed.landed,
            dropped: executed.dropped,
            merge: executed.merge,
            cursor: executed.cursor,
            audit: executed.audit,
            error: message,
        })
    }

    /// Plan the window from the committed cursor and record the run as started.
    async fn open_run(&self, adapter: &dyn SourceAdapter, now: DateTime<Utc>) -> Result<FetchRun> {
        let source = adapter.source_id();
        let cursor = self.stores.cursors.get_cursor(source).await?;
        let position = cursor.as_ref().map(|c| c.position());
        let window = adapter.plan_window(position.as_ref(), now);

        let run = FetchRun::open(source.clone(), window, now);
        self.stores.runs.open(&run).await?;
        Ok(run)
    }

    async fn execute(&self, adapter: &dyn SourceAdapter, run: &FetchRun) -> Result<Executed> {
        let source = &run.source_id;
        let window = run.window();

        let items = adapter.fetch_window(&window).await?;
        let fetched = items.len();

        let normalized = self.normalizer.normalize(adapter, items, run.run_id);
        let dropped = normalized.dropped();
        let mut buffer = LandingBuffer::new(run);
        buffer.extend(normalized.records)?;
        let landed = buffer.land(self.stores.landing.as_ref()).await?;

        let audit = self
            .auditor
            .audit_records(source, Some(run.run_id), &landed.records, Utc::now());
        let merge = self.merge.merge(&landed.records, Utc::now()).await?;

        let target = match adapter.cursor_mode() {
            CursorMode::Incremental => merge.cursor_position.clone(),
            CursorMode::Stateless => Some(CursorPosition::new(window.end, run.run_id.to_string())),
        };
        let cursor = match target {
            Some(position) => Some(
                self.stores
                    .cursors
                    .commit_cursor(source, &position, run.run_id)
                    .await?,
            ),
            None => None,
        };

        info!(
            source = %source,
            run_id = %run.run_id,
            fetched,
            landed = landed.records.len(),
            dropped,
            inserted = merge.inserted,
            updated = merge.updated,
            unchanged = merge.unchanged,
            cursor = ?cursor,
            "Fetch run succeeded"
        );

        Ok(Executed {
            fetched,
            landed: landed.records.len(),
            dropped,
            merge: Some(merge),
            cursor,
            audit: Some(audit),
        })
    }

    /// Track consecutive failures and raise operator signals.
    fn record_outcome(&self, source: &SourceId, status: RunStatus, error: Option<&IngestError>) {
        let failures = {
            let mut counts = lock(&self.failures);
            let count = counts.entry(source.clone()).or_insert(0);
            match status {
                RunStatus::Succeeded => *count = 0,
                RunStatus::FailedTransient | RunStatus::FailedFatal => *count += 1,
                RunStatus::Running | RunStatus::Aborted => {}
            }
            *count
        };

        if let Some(e) = error.filter(|e| matches!(e, IngestError::Auth { .. })) {
            error!(
                signal = "auth_failure",
                source = %source,
                error = %e,
                "Credentials rejected, rotation required"
            );
        }

        if failures >= self.escalate_after && failures > 0 {
            error!(
                signal = "source_escalated",
                source = %source,
                consecutive_failures = failures,
                "Source keeps failing"
            );
        }
    }

    /// Re-merge the records a past run landed, without contacting the source.
    pub async fn replay_run(&self, source: &SourceId, run_id: Uuid) -> Result<ReplaySummary> {
        let _lease = self.lease(source)?;

        let mut run = self
            .stores
            .runs
            .get(run_id)
            .await?
            .filter(|r| &r.source_id == source)
            .ok_or_else(|| IngestError::Config(format!("no run {run_id} recorded for {source}")))?;
        if let Some(purged_at) = run.landing_purged_at {
            return Err(IngestError::Config(format!(
                "landed records of run {run_id} were purged at {purged_at}"
            )));
        }

        let records = self.stores.landing.load_run(source, run_id).await?;
        if records.is_empty() && run.status != RunStatus::Succeeded {
            return Err(IngestError::Config(format!(
                "run {run_id} ({}) landed nothing to replay",
                run.status
            )));
        }
        let merge = self.merge.merge(&records, Utc::now()).await?;

        let mode = self
            .adapters
            .get(source)
            .map_or(CursorMode::Incremental, |a| a.cursor_mode());
        let target = match mode {
            CursorMode::Incremental => merge.cursor_position.clone(),
            CursorMode::Stateless => Some(CursorPosition::new(run.window_end, run_id.to_string())),
        };
        let cursor = match target {
            Some(position) => Some(
                self.stores
                    .cursors
                    .commit_cursor(source, &position, run_id)
                    .await?,
            ),
            None => None,
        };

        if run.status != RunStatus::Succeeded {
            run.close(RunStatus::Succeeded, Utc::now(), None);
            self.stores.runs.close(&run).await?;
        }

        info!(
            source = %source,
            run_id = %run_id,
            records = records.len(),
            inserted = merge.inserted,
            updated = merge.updated,
            cursor = ?cursor,
            "Replayed landed run"
        );
        Ok(ReplaySummary {
            source_id: source.clone(),
            run_id,
            records: records.len(),
            merge,
            cursor,
        })
    }

    /// Operator backfill: move the cursor back to `to`, or forget it.
    pub async fn reset_cursor(&self, source: &SourceId, to: Option<DateTime<Utc>>) -> Result<()> {
        let _lease = self.lease(source)?;
        // An empty tie-breaker sorts before every id at that instant.
        let position = to.map(|t| CursorPosition::new(t, ""));
        self.stores
            .cursors
            .reset_cursor(source, position.as_ref())
            .await?;
        warn!(
            signal = "cursor_reset",
            source = %source,
            to = ?to,
            "Cursor reset by operator"
        );
        Ok(())
    }

    /// Cursor lag and last run for every configured source.
    pub async fn status(&self, now: DateTime<Utc>) -> Result<Vec<SourceStatus>> {
        let mut cursors: HashMap<SourceId, IngestCursor> = self
            .stores
            .cursors
            .list_cursors()
            .await?
            .into_iter()
            .map(|c| (c.source_id.clone(), c))
            .collect();
        let mut out = Vec::with_capacity(self.adapters.len());
        for source in self.adapters.keys() {
            let cursor = cursors.remove(source);
            let last_run = self.stores.runs.recent(source, 1).await?.into_iter().next();
            let lag = cursor.as_ref().map(|c| c.lag(now));
            out.push(SourceStatus {
                source_id: source.clone(),
                cursor: cursor.as_ref().map(|c| c.position()),
                cursor_updated_at: cursor.as_ref().map(|c| c.updated_at),
                lag_seconds: lag.map(|l| l.num_seconds()),
                stale: lag.map_or(true, |l| l > self.stale_after),
                last_run_id: last_run.as_ref().map(|r| r.run_id),
                last_run_status: last_run.map(|r| r.status),
                consecutive_failures: self.consecutive_failures(source),
            });
        }
        Ok(out)
    }

    /// Delete landed objects of runs that succeeded more than `retention` ago.
    /// Failed runs keep theirs until a replay succeeds.
    pub async fn purge_landing(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.stores.runs.purgeable(now - self.retention).await?;
        let mut purged = 0;
        for run in &due {
            purged += self
                .stores
                .landing
                .delete_run(&run.source_id, run.run_id)
                .await?;
            self.stores.runs.mark_purged(run.run_id, now).await?;
        }
        if !due.is_empty() {
            info!(runs = due.len(), objects = purged, "Purged expired landing objects");
        }
        Ok(purged)
    }
}

fn failure_status(e: &IngestError) -> RunStatus {
    if e.is_transient() {
        RunStatus::FailedTransient
    } else {
        RunStatus::FailedFatal
    }
}
