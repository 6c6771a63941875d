use tracing::info;
use uuid::Uuid;

use pulse_common::{FetchRun, IngestError, RawRecord, Result, SourceId};
use pulse_store::LandingStore;

/// Accumulates one run's normalized records before they are written to the
/// landing zone. Every record must belong to the buffer's run.
pub struct LandingBuffer {
    run: FetchRun,
    records: Vec<RawRecord>,
}

/// Records written for one run, plus the objects that now hold them.
#[derive(Debug, Clone)]
pub struct LandedRun {
    pub run_id: Uuid,
    pub source_id: SourceId,
    pub records: Vec<RawRecord>,
    pub objects: Vec<String>,
}

impl LandingBuffer {
    pub fn new(run: &FetchRun) -> Self {
        Self {
            run: run.clone(),
            records: Vec::new(),
        }
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = RawRecord>) -> Result<()> {
        for record in records {
            if record.source_id != self.run.source_id {
                return Err(IngestError::Validation(format!(
                    "record {} belongs to {}, not {}",
                    record.natural_key, record.source_id, self.run.source_id
                )));
            }
            if record.fetch_run_id != self.run.run_id {
                return Err(IngestError::Validation(format!(
                    "record {} was produced by run {}, not {}",
                    record.natural_key, record.fetch_run_id, self.run.run_id
                )));
            }
            self.records.push(record);
        }
        Ok(())
    }

    /// Write the buffer as immutable landing objects. Nothing is merged
    /// until this returns.
    pub async fn land(self, store: &dyn LandingStore) -> Result<LandedRun> {
        let objects = store.put_run(&self.run, &self.records).await?;
        info!(
            source = %self.run.source_id,
            run_id = %self.run.run_id,
            records = self.records.len(),
            objects = objects.len(),
            "Landed run"
        );
        Ok(LandedRun {
            run_id: self.run.run_id,
            source_id: self.run.source_id,
            records: self.records,
            objects,
        })
    }
}
