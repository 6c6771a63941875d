//! Ingestion engine: lands fetched records, merges them into the canonical
//! store under a freshness gate, and advances source cursors only after a
//! run's merge fully succeeds.

pub mod audit;
pub mod landing;
pub mod merge;
pub mod scheduler;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use audit::DuplicateAuditor;
pub use landing::{LandedRun, LandingBuffer};
pub use merge::{MergeEngine, MergeReport};
pub use scheduler::{ReplaySummary, RunSummary, Scheduler, SourceStatus, Stores};
