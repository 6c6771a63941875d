use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::types::SourceId;

/// TOML-backed configuration loaded from disk.
/// Secrets (API keys, DB URL) stay as env vars.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub landing: LandingConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// Consecutive failed runs before every further failure is escalated.
    #[serde(default = "default_escalate_after")]
    pub escalate_after_failures: u32,
    /// Cursor lag beyond which `status` flags a source as stale.
    #[serde(default = "default_stale_after_hours")]
    pub stale_after_hours: i64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            run_timeout_secs: default_run_timeout_secs(),
            escalate_after_failures: default_escalate_after(),
            stale_after_hours: default_stale_after_hours(),
            retry: RetryConfig::default(),
        }
    }
}

/// Bounded retry parameters applied around every adapter request.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of each delay added as random jitter (0.0 disables).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// Duplicate ratio above which the auditor warns (0.05 = 5%).
    #[serde(default = "default_audit_threshold")]
    pub threshold_pct: f64,
    #[serde(default = "default_audit_window_hours")]
    pub window_hours: i64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            threshold_pct: default_audit_threshold(),
            window_hours: default_audit_window_hours(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LandingConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for LandingConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NormalizerConfig {
    #[serde(default = "default_min_text_len")]
    pub min_text_len: usize,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            min_text_len: default_min_text_len(),
        }
    }
}

/// The closed set of source variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    SocialPost,
    ComplaintRegistry,
    TrendSample,
    EmployeeReview,
}

/// One `[[sources]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: SourceId,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(flatten)]
    pub settings: SourceSettings,
}

impl SourceConfig {
    pub fn kind(&self) -> SourceKind {
        match self.settings {
            SourceSettings::SocialPost(_) => SourceKind::SocialPost,
            SourceSettings::ComplaintRegistry(_) => SourceKind::ComplaintRegistry,
            SourceSettings::TrendSample(_) => SourceKind::TrendSample,
            SourceSettings::EmployeeReview(_) => SourceKind::EmployeeReview,
        }
    }

    fn validate(&self) -> Result<()> {
        match &self.settings {
            SourceSettings::SocialPost(s) => {
                check_range("overlap_hours", s.overlap_hours, 0..=MAX_HOURS)?;
                check_range("initial_days", s.initial_days, 1..=MAX_DAYS)?;
                check_pages(s.max_pages)
            }
            SourceSettings::ComplaintRegistry(s) => {
                check_range("lookback_days", s.lookback_days, 1..=MAX_DAYS)?;
                check_range("initial_days", s.initial_days, 1..=MAX_DAYS)?;
                if s.page_size == 0 {
                    bail!("page_size must be > 0");
                }
                check_pages(s.max_pages)
            }
            SourceSettings::TrendSample(s) => {
                check_range("trailing_days", s.trailing_days, 1..=MAX_DAYS)
            }
            SourceSettings::EmployeeReview(s) => {
                check_range("overlap_days", s.overlap_days, 0..=MAX_DAYS)?;
                check_range("initial_days", s.initial_days, 1..=MAX_DAYS)?;
                check_pages(s.max_pages)
            }
        }
    }
}

fn check_pages(max_pages: u32) -> Result<()> {
    if max_pages == 0 {
        bail!("max_pages must be > 0");
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSettings {
    SocialPost(SocialPostSettings),
    ComplaintRegistry(ComplaintRegistrySettings),
    TrendSample(TrendSampleSettings),
    EmployeeReview(EmployeeReviewSettings),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SocialPostSettings {
    pub subreddits: Vec<String>,
    pub terms: Vec<String>,
    #[serde(default = "default_overlap_hours")]
    pub overlap_hours: i64,
    #[serde(default = "default_initial_days")]
    pub initial_days: i64,
    #[serde(default = "default_comments_per_post")]
    pub comments_per_post: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComplaintRegistrySettings {
    /// Entity id -> company names exactly as the registry spells them.
    pub companies: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "default_complaint_initial_days")]
    pub initial_days: i64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrendSampleSettings {
    /// Entity id -> keywords tracked for that entity.
    pub keywords: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_geos")]
    pub geos: Vec<String>,
    #[serde(default = "default_trailing_days")]
    pub trailing_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmployeeReviewSettings {
    /// Entity id -> review-site company id.
    pub company_ids: BTreeMap<String, String>,
    #[serde(default = "default_review_overlap_days")]
    pub overlap_days: i64,
    #[serde(default = "default_complaint_initial_days")]
    pub initial_days: i64,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_tick_interval_secs() -> u64 {
    900
}
fn default_run_timeout_secs() -> u64 {
    600
}
fn default_escalate_after() -> u32 {
    3
}
fn default_stale_after_hours() -> i64 {
    6
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter() -> f64 {
    0.25
}
fn default_audit_threshold() -> f64 {
    0.05
}
fn default_audit_window_hours() -> i64 {
    72
}
fn default_retention_days() -> i64 {
    14
}
fn default_min_text_len() -> usize {
    10
}
fn default_enabled() -> bool {
    true
}
fn default_requests_per_minute() -> u32 {
    100
}
fn default_overlap_hours() -> i64 {
    2
}
fn default_initial_days() -> i64 {
    7
}
fn default_comments_per_post() -> u32 {
    10
}
fn default_max_pages() -> u32 {
    5
}
fn default_lookback_days() -> i64 {
    7
}
fn default_complaint_initial_days() -> i64 {
    30
}
fn default_page_size() -> u32 {
    100
}
fn default_geos() -> Vec<String> {
    vec!["US".to_string()]
}
fn default_trailing_days() -> i64 {
    90
}
fn default_review_overlap_days() -> i64 {
    1
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config = parse_config(&content)
        .with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate TOML config text.
pub fn parse_config(content: &str) -> Result<FileConfig> {
    let config: FileConfig = toml::from_str(content).context("Failed to parse config as TOML")?;
    config.validate()?;
    Ok(config)
}

/// Longest span any duration setting may cover: ten years.
const MAX_DAYS: i64 = 3650;
const MAX_HOURS: i64 = MAX_DAYS * 24;

fn check_range(name: &str, value: i64, range: RangeInclusive<i64>) -> Result<()> {
    if !range.contains(&value) {
        bail!(
            "{name} must be within {}..={}, got {value}",
            range.start(),
            range.end()
        );
    }
    Ok(())
}

impl FileConfig {
    fn validate(&self) -> Result<()> {
        let scheduler = &self.scheduler;
        if scheduler.tick_interval_secs == 0 {
            bail!("scheduler.tick_interval_secs must be > 0");
        }
        if scheduler.run_timeout_secs == 0 {
            bail!("scheduler.run_timeout_secs must be > 0");
        }
        check_range("scheduler.stale_after_hours", scheduler.stale_after_hours, 1..=MAX_HOURS)?;
        if scheduler.retry.max_attempts == 0 {
            bail!("scheduler.retry.max_attempts must be >= 1");
        }
        if scheduler.retry.base_delay_ms > scheduler.retry.max_delay_ms {
            bail!("scheduler.retry.base_delay_ms must not exceed max_delay_ms");
        }
        if !(0.0..=1.0).contains(&self.audit.threshold_pct) {
            bail!("audit.threshold_pct must be within 0.0..=1.0");
        }
        check_range("audit.window_hours", self.audit.window_hours, 1..=MAX_HOURS)?;
        check_range("landing.retention_days", self.landing.retention_days, 1..=MAX_DAYS)?;

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.id.clone()) {
                bail!("duplicate source id: {}", source.id);
            }
            if source.requests_per_minute == 0 {
                bail!("source {}: requests_per_minute must be > 0", source.id);
            }
            source
                .validate()
                .with_context(|| format!("source {}", source.id))?;
        }
        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[scheduler]
tick_interval_secs = 60

[scheduler.retry]
max_attempts = 3
jitter = 0.0

[[sources]]
id = "reddit"
kind = "social_post"
subreddits = ["personalfinance"]
terms = ["Chase"]

[[sources]]
id = "cfpb"
kind = "complaint_registry"
requests_per_minute = 30
lookback_days = 5

[sources.companies]
chase = ["JPMORGAN CHASE & CO."]

[[sources]]
id = "trends"
kind = "trend_sample"
enabled = false

[sources.keywords]
chase = ["Chase Bank"]
"#;

    #[test]
    fn parses_sources_with_defaults() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.scheduler.tick_interval_secs, 60);
        assert_eq!(config.scheduler.run_timeout_secs, 600);
        assert_eq!(config.scheduler.retry.max_attempts, 3);
        assert_eq!(config.audit.threshold_pct, 0.05);
        assert_eq!(config.sources.len(), 3);

        let reddit = &config.sources[0];
        assert_eq!(reddit.kind(), SourceKind::SocialPost);
        assert_eq!(reddit.requests_per_minute, 100);
        match &reddit.settings {
            SourceSettings::SocialPost(s) => assert_eq!(s.overlap_hours, 2),
            other => panic!("unexpected settings: {other:?}"),
        }

        let cfpb = &config.sources[1];
        assert_eq!(cfpb.kind(), SourceKind::ComplaintRegistry);
        assert_eq!(cfpb.requests_per_minute, 30);

        let enabled: Vec<_> = config.enabled_sources().map(|s| s.id.as_str()).collect();
        assert_eq!(enabled, vec!["reddit", "cfpb"]);
    }

    #[test]
    fn rejects_duplicate_source_ids() {
        let text = r#"
[[sources]]
id = "a"
kind = "trend_sample"
[sources.keywords]

[[sources]]
id = "a"
kind = "trend_sample"
[sources.keywords]
"#;
        assert!(parse_config(text).is_err());
    }

    #[test]
    fn rejects_unknown_top_level_keys() {
        assert!(parse_config("[bogus]\nx = 1\n").is_err());
    }

    #[test]
    fn rejects_zero_tick_interval() {
        let err = parse_config("[scheduler]\ntick_interval_secs = 0\n").unwrap_err();
        assert!(format!("{err:#}").contains("tick_interval_secs"));
        assert!(parse_config("[scheduler]\nrun_timeout_secs = 0\n").is_err());
    }

    #[test]
    fn rejects_out_of_range_durations() {
        for text in [
            "[scheduler]\nstale_after_hours = -1\n",
            "[audit]\nwindow_hours = 0\n",
            "[landing]\nretention_days = 0\n",
            "[landing]\nretention_days = 9223372036854775807\n",
        ] {
            assert!(parse_config(text).is_err(), "{text}");
        }
    }

    #[test]
    fn rejects_bad_source_windows() {
        let negative_overlap = r#"
[[sources]]
id = "reddit"
kind = "social_post"
subreddits = ["a"]
terms = ["b"]
overlap_hours = -3
"#;
        let err = parse_config(negative_overlap).unwrap_err();
        assert!(format!("{err:#}").contains("source reddit"));

        let huge_trailing = r#"
[[sources]]
id = "trends"
kind = "trend_sample"
trailing_days = 100000
[sources.keywords]
"#;
        assert!(parse_config(huge_trailing).is_err());

        let no_pages = r#"
[[sources]]
id = "cfpb"
kind = "complaint_registry"
max_pages = 0
[sources.companies]
"#;
        assert!(parse_config(no_pages).is_err());
    }

    #[test]
    fn shipped_config_parses() {
        let config = parse_config(include_str!("../../../pulse.toml")).unwrap();
        let kinds: Vec<_> = config.sources.iter().map(|s| s.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                SourceKind::SocialPost,
                SourceKind::ComplaintRegistry,
                SourceKind::TrendSample,
                SourceKind::EmployeeReview,
            ]
        );
        assert_eq!(config.enabled_sources().count(), 3);
    }
}
