use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use pulse_common::{AuditConfig, DuplicateAuditResult, RawRecord, Result, SourceId};
use pulse_store::{CanonicalStore, LandingStore};

/// Read-only duplicate-ratio checks over landed or canonical rows.
///
/// A high ratio in landing data is expected (windows overlap); a non-zero
/// ratio in canonical data points at a key-derivation bug.
pub struct DuplicateAuditor {
    landing: Arc<dyn LandingStore>,
    canonical: Arc<dyn CanonicalStore>,
    threshold_pct: f64,
    window: Duration,
}

impl DuplicateAuditor {
    pub fn new(
        landing: Arc<dyn LandingStore>,
        canonical: Arc<dyn CanonicalStore>,
        config: &AuditConfig,
    ) -> Self {
        Self {
            landing,
            canonical,
            threshold_pct: config.threshold_pct,
            window: Duration::hours(config.window_hours),
        }
    }

    /// Counts over an in-hand record set.
    pub fn audit_records(
        &self,
        source: &SourceId,
        run_id: Option<Uuid>,
        records: &[RawRecord],
        now: DateTime<Utc>,
    ) -> DuplicateAuditResult {
        let unique: HashSet<_> = records.iter().map(|r| &r.natural_key).collect();
        let result = DuplicateAuditResult::from_counts(
            source.clone(),
            run_id,
            records.len() as u64,
            unique.len() as u64,
            now,
        );
        self.report(&result, "run");
        result
    }

    /// One landed run.
    pub async fn audit_run(
        &self,
        source: &SourceId,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<DuplicateAuditResult> {
        let records = self.landing.load_run(source, run_id).await?;
        Ok(self.audit_records(source, Some(run_id), &records, now))
    }

    /// Every landing object inside the audit window.
    pub async fn audit_landing(
        &self,
        source: &SourceId,
        now: DateTime<Utc>,
    ) -> Result<DuplicateAuditResult> {
        let since = (now - self.window).date_naive();
        let records = self.landing.load_since(source, since).await?;
        let unique: HashSet<_> = records.iter().map(|r| &r.natural_key).collect();
        let result = DuplicateAuditResult::from_counts(
            source.clone(),
            None,
            records.len() as u64,
            unique.len() as u64,
            now,
        );
        self.report(&result, "landing");
        Ok(result)
    }

    /// Canonical rows merged inside the audit window.
    pub async fn audit_canonical(
        &self,
        source: &SourceId,
        now: DateTime<Utc>,
    ) -> Result<DuplicateAuditResult> {
        let rows = self.canonical.scan(source, Some(now - self.window)).await?;
        let unique: HashSet<_> = rows.iter().map(|r| &r.natural_key).collect();
        let result = DuplicateAuditResult::from_counts(
            source.clone(),
            None,
            rows.len() as u64,
            unique.len() as u64,
            now,
        );
        self.report(&result, "canonical");
        Ok(result)
    }

    fn report(&self, result: &DuplicateAuditResult, scope: &str) {
        if result.duplicate_pct > self.threshold_pct {
            warn!(
                signal = "duplicate_ratio",
                source = %result.source_id,
                scope,
                total_rows = result.total_rows,
                unique_keys = result.unique_keys,
                duplicate_pct = result.duplicate_pct,
                threshold_pct = self.threshold_pct,
                "Duplicate ratio above threshold"
            );
        } else {
            info!(
                source = %result.source_id,
                scope,
                total_rows = result.total_rows,
                duplicate_pct = result.duplicate_pct,
                "Duplicate audit"
            );
        }
    }
}
