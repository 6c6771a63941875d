pub mod config;
pub mod error;
pub mod file_config;
pub mod fingerprint;
pub mod types;

pub use config::AppConfig;
pub use error::{IngestError, Result};
pub use file_config::{
    load_config, parse_config, AuditConfig, ComplaintRegistrySettings, EmployeeReviewSettings,
    FileConfig, LandingConfig, NormalizerConfig, RetryConfig, SchedulerConfig, SocialPostSettings,
    SourceConfig, SourceKind, SourceSettings, TrendSampleSettings,
};
pub use fingerprint::{content_fingerprint, payload_fingerprint};
pub use types::*;
