use chrono::{DateTime, SubsecRound, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use pulse_common::{content_fingerprint, payload_fingerprint, IngestError, NaturalKey, RawRecord};

use crate::adapter::{NativeItem, SourceAdapter};

/// Result of normalizing one run's items.
#[derive(Debug, Default)]
pub struct NormalizeOutcome {
    pub records: Vec<RawRecord>,
    /// Items missing a key, cursor time or freshness time.
    pub dropped_invalid: usize,
    /// Items whose text is below the length floor.
    pub dropped_short: usize,
}

impl NormalizeOutcome {
    pub fn dropped(&self) -> usize {
        self.dropped_invalid + self.dropped_short
    }
}

/// Maps source-native items to landed records.
///
/// Per-item problems are counted and logged, never raised: one bad item must
/// not fail the run.
#[derive(Debug, Clone)]
pub struct Normalizer {
    min_text_len: usize,
}

impl Normalizer {
    pub fn new(min_text_len: usize) -> Self {
        Self { min_text_len }
    }

    pub fn normalize(
        &self,
        adapter: &dyn SourceAdapter,
        items: Vec<NativeItem>,
        run_id: Uuid,
    ) -> NormalizeOutcome {
        let mut outcome = NormalizeOutcome::default();
        for item in items {
            match self.normalize_one(adapter, item, run_id) {
                Ok(record) => outcome.records.push(record),
                Err(Rejection::Invalid(e)) => {
                    debug!(source = %adapter.source_id(), error = %e, "Dropping invalid item");
                    outcome.dropped_invalid += 1;
                }
                Err(Rejection::Short) => outcome.dropped_short += 1,
            }
        }

        if outcome.dropped() > 0 {
            warn!(
                source = %adapter.source_id(),
                kept = outcome.records.len(),
                dropped_invalid = outcome.dropped_invalid,
                dropped_short = outcome.dropped_short,
                "Normalizer dropped items"
            );
        }
        outcome
    }

    fn normalize_one(
        &self,
        adapter: &dyn SourceAdapter,
        item: NativeItem,
        run_id: Uuid,
    ) -> Result<RawRecord, Rejection> {
        let source = adapter.source_id();
        let native = adapter
            .natural_key(&item)
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| invalid("missing natural key"))?;
        let observed_at = adapter
            .observed_at(&item)
            .ok_or_else(|| invalid(format!("{native}: missing observation time")))?;
        let freshness_time = adapter
            .freshness(&item)
            .ok_or_else(|| invalid(format!("{native}: missing freshness time")))?;

        let text = adapter.text(&item);
        if adapter.requires_text() {
            let len = text.as_deref().map_or(0, |t| t.trim().chars().count());
            if len < self.min_text_len {
                return Err(Rejection::Short);
            }
        }
        let fingerprint = match &text {
            Some(t) => content_fingerprint(t),
            None => payload_fingerprint(&item.payload),
        };
        let tie_breaker_id = adapter
            .tie_breaker(&item)
            .unwrap_or_else(|| native.clone());

        Ok(RawRecord {
            source_id: source.clone(),
            natural_key: NaturalKey::derive(source, &native),
            observed_at: stored_precision(observed_at),
            freshness_time: stored_precision(freshness_time),
            tie_breaker_id,
            fingerprint,
            payload: item.payload,
            fetch_run_id: run_id,
        })
    }
}

enum Rejection {
    Invalid(IngestError),
    Short,
}

fn invalid(message: impl Into<String>) -> Rejection {
    Rejection::Invalid(IngestError::Validation(message.into()))
}

/// Canonical stores keep microseconds; normalizing here keeps re-merges exact.
fn stored_precision(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(6)
}
