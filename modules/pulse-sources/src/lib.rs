//! Source adapters for the ingestion engine.
//!
//! Each adapter fetches a time window from one external API through a
//! per-source rate limiter and retry policy. The [`Normalizer`] turns what
//! they return into landed [`pulse_common::RawRecord`]s.

pub mod adapter;
pub mod cfpb;
pub mod glassdoor;
pub mod http;
pub mod normalizer;
pub mod rate_limit;
pub mod reddit;
pub mod retry;
pub mod trends;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use adapter::{build_adapter, CursorMode, NativeItem, SourceAdapter};
pub use cfpb::ComplaintRegistryAdapter;
pub use glassdoor::EmployeeReviewAdapter;
pub use http::SourceHttp;
pub use normalizer::{NormalizeOutcome, Normalizer};
pub use rate_limit::SourceRateLimiter;
pub use reddit::SocialPostAdapter;
pub use retry::RetryPolicy;
pub use trends::TrendSampleAdapter;
