use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use pulse_common::{
    AppConfig, CursorPosition, FetchWindow, IngestError, Result, SourceConfig, SourceId,
    SourceKind, SourceSettings,
};

use crate::cfpb::ComplaintRegistryAdapter;
use crate::glassdoor::EmployeeReviewAdapter;
use crate::http::SourceHttp;
use crate::rate_limit::SourceRateLimiter;
use crate::reddit::SocialPostAdapter;
use crate::retry::RetryPolicy;
use crate::trends::TrendSampleAdapter;

/// One source-native item as returned by an adapter, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeItem {
    pub payload: Value,
    pub fetched_at: DateTime<Utc>,
}

impl NativeItem {
    pub fn new(payload: Value, fetched_at: DateTime<Utc>) -> Self {
        Self {
            payload,
            fetched_at,
        }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn time_field(&self, key: &str) -> Option<DateTime<Utc>> {
        self.str_field(key)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// How the committed cursor relates to the next fetch window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMode {
    /// The next window starts from the cursor minus an overlap.
    Incremental,
    /// Every run refetches a fixed trailing window; the cursor only tracks liveness.
    Stateless,
}

/// A fetchable external source.
///
/// Variants differ in how they fetch a window, derive a natural key and
/// compute freshness. Everything else (landing, merge, cursor commit) is
/// shared. Adapters may return items already seen in earlier runs.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &SourceId;

    fn kind(&self) -> SourceKind;

    fn cursor_mode(&self) -> CursorMode {
        CursorMode::Incremental
    }

    /// Window to fetch given the last committed cursor.
    fn plan_window(&self, cursor: Option<&CursorPosition>, now: DateTime<Utc>) -> FetchWindow;

    /// Fetch every item in `window`, paginating internally.
    async fn fetch_window(&self, window: &FetchWindow) -> Result<Vec<NativeItem>>;

    /// Source-native identifier, before source prefixing.
    fn natural_key(&self, item: &NativeItem) -> Option<String>;

    /// Value of the cursor field: creation, received or sample time.
    fn observed_at(&self, item: &NativeItem) -> Option<DateTime<Utc>>;

    /// Timestamp deciding whether this version supersedes a stored one.
    fn freshness(&self, item: &NativeItem) -> Option<DateTime<Utc>>;

    /// Text subject to the minimum length floor and used for the fingerprint.
    /// `None` fingerprints the whole payload.
    fn text(&self, item: &NativeItem) -> Option<String>;

    /// Whether records without enough text are dropped.
    fn requires_text(&self) -> bool {
        true
    }

    /// Orders records sharing an `observed_at`. Defaults to the native key.
    fn tie_breaker(&self, item: &NativeItem) -> Option<String> {
        self.natural_key(item)
    }
}

/// Build the adapter for one `[[sources]]` entry.
pub fn build_adapter(
    source: &SourceConfig,
    app: &AppConfig,
    client: reqwest::Client,
    retry: RetryPolicy,
) -> Result<Arc<dyn SourceAdapter>> {
    let limiter = Arc::new(SourceRateLimiter::per_minute(source.requests_per_minute)?);
    let http = SourceHttp::new(source.id.clone(), client, limiter, retry);

    let adapter: Arc<dyn SourceAdapter> = match &source.settings {
        SourceSettings::SocialPost(settings) => {
            let (client_id, client_secret) = app
                .reddit_credentials()
                .map_err(|e| IngestError::Config(format!("{}: {e}", source.id)))?;
            Arc::new(SocialPostAdapter::new(
                http,
                settings.clone(),
                client_id,
                client_secret,
                app.reddit_user_agent.clone(),
            ))
        }
        SourceSettings::ComplaintRegistry(settings) => {
            Arc::new(ComplaintRegistryAdapter::new(http, settings.clone()))
        }
        SourceSettings::TrendSample(settings) => {
            let api_key = app.serpapi_key.clone().ok_or_else(|| {
                IngestError::Config(format!("{}: SERPAPI_KEY required", source.id))
            })?;
            Arc::new(TrendSampleAdapter::new(http, settings.clone(), api_key))
        }
        SourceSettings::EmployeeReview(settings) => {
            let key = app.rapidapi_key.clone().ok_or_else(|| {
                IngestError::Config(format!("{}: RAPIDAPI_KEY required", source.id))
            })?;
            let host = app.rapidapi_host.clone().ok_or_else(|| {
                IngestError::Config(format!("{}: RAPIDAPI_HOST required", source.id))
            })?;
            Arc::new(EmployeeReviewAdapter::new(http, settings.clone(), key, host))
        }
    };

    tracing::info!(
        source = %source.id,
        kind = ?adapter.kind(),
        requests_per_minute = source.requests_per_minute,
        "Adapter ready"
    );
    Ok(adapter)
}

/// Parse the timestamp shapes sources use: RFC 3339, naive datetimes, bare dates.
/// Log when pagination ran out of pages before the source ran out of results.
/// Items older than the last page read are not fetched this run.
pub(crate) fn page_cap_reached(source: &SourceId, scope: &str, max_pages: u32, exhausted: bool) -> bool {
    if exhausted {
        return false;
    }
    warn!(
        signal = "page_cap_reached",
        source = %source,
        scope,
        max_pages,
        "Pagination stopped at the page cap before reaching the window start"
    );
    true
}

pub fn parse_source_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(t) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(t.and_utc());
        }
    }
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}

/// RFC 3339 with second precision, the form adapters store in payloads.
pub fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_common_source_time_shapes() {
        let want = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
        assert_eq!(parse_source_time("2025-01-15"), Some(want));
        assert_eq!(parse_source_time("2025-01-15T00:00:00Z"), Some(want));
        assert_eq!(parse_source_time("2025-01-15T00:00:00"), Some(want));
        assert_eq!(
            parse_source_time("2025-01-15T05:00:00+05:00"),
            Some(want)
        );
        assert_eq!(parse_source_time("yesterday"), None);
    }

    #[test]
    fn native_item_reads_rfc3339_fields() {
        let item = NativeItem::new(
            serde_json::json!({"created": "2025-01-15T10:00:00Z", "n": 1}),
            Utc::now(),
        );
        assert_eq!(
            item.time_field("created"),
            Some(Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap())
        );
        assert_eq!(item.time_field("n"), None);
        assert_eq!(item.str_field("missing"), None);
    }

    #[test]
    fn page_cap_only_reported_when_results_remain() {
        let source = SourceId::new("reddit");
        assert!(page_cap_reached(&source, "r/banking chase", 5, false));
        assert!(!page_cap_reached(&source, "r/banking chase", 5, true));
    }
}
