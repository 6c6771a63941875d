//! Persistence seams for the ingestion engine.
//!
//! Every store is a trait so the engine can run against Postgres in
//! production and against [`InMemoryStore`] in tests and local runs.

pub mod canonical;
pub mod cursor;
pub mod landing;
pub mod memory;
pub mod postgres;
pub mod runs;

pub use canonical::{CanonicalStore, CasOutcome};
pub use cursor::{CommitOutcome, CursorStore};
pub use landing::{FsLandingStore, LandingObjectKey, LandingStore, MemoryLandingStore};
pub use memory::InMemoryStore;
pub use postgres::PgStore;
pub use runs::RunLog;
