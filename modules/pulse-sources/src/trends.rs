//! Trend-sample source: search-interest time series via SerpApi Google Trends.
//!
//! Historical points get revised, so every run refetches the full trailing
//! window and stamps each point with the fetch time as its freshness. A newer
//! fetch therefore always supersedes the stored value for the same point.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};
use serde_json::{json, Value};
use tracing::{debug, info};

use pulse_common::{
    CursorPosition, FetchWindow, IngestError, Result, SourceId, SourceKind, TrendSampleSettings,
};

use crate::adapter::{format_time, CursorMode, NativeItem, SourceAdapter};
use crate::http::SourceHttp;

const API_URL: &str = "https://serpapi.com/search.json";

pub struct TrendSampleAdapter {
    http: SourceHttp,
    settings: TrendSampleSettings,
    api_key: String,
}

impl TrendSampleAdapter {
    pub fn new(http: SourceHttp, settings: TrendSampleSettings, api_key: String) -> Self {
        Self {
            http,
            settings,
            api_key,
        }
    }

    async fn series(&self, keyword: &str, geo: &str, window: &FetchWindow) -> Result<Value> {
        let date = format!(
            "{} {}",
            window.start.format("%Y-%m-%d"),
            window.end.format("%Y-%m-%d")
        );
        self.http
            .json("timeseries", |client| {
                client.get(API_URL).query(&[
                    ("engine", "google_trends"),
                    ("data_type", "TIMESERIES"),
                    ("q", keyword),
                    ("geo", geo),
                    ("date", date.as_str()),
                    ("api_key", self.api_key.as_str()),
                ])
            })
            .await
    }
}

#[async_trait]
impl SourceAdapter for TrendSampleAdapter {
    fn source_id(&self) -> &SourceId {
        self.http.source_id()
    }

    fn kind(&self) -> SourceKind {
        SourceKind::TrendSample
    }

    fn cursor_mode(&self) -> CursorMode {
        CursorMode::Stateless
    }

    /// Always the trailing window; the cursor is ignored.
    fn plan_window(&self, _cursor: Option<&CursorPosition>, now: DateTime<Utc>) -> FetchWindow {
        FetchWindow::trailing(now, Duration::days(self.settings.trailing_days))
    }

    async fn fetch_window(&self, window: &FetchWindow) -> Result<Vec<NativeItem>> {
        let source = self.http.source_id().clone();
        let mut items = Vec::new();

        for (entity, keywords) in &self.settings.keywords {
            for keyword in keywords {
                for geo in &self.settings.geos {
                    let body = self.series(keyword, geo, window).await?;
                    let fetched_at = Utc::now();
                    let points = parse_timeline(&source, &body, keyword)?;
                    debug!(source = %source, keyword = %keyword, geo = %geo, points = points.len(), "Trend series");
                    items.extend(points.into_iter().map(|(sample_time, value)| {
                        NativeItem::new(
                            trend_payload(entity, keyword, geo, sample_time, value, fetched_at),
                            fetched_at,
                        )
                    }));
                }
            }
        }

        info!(source = %source, items = items.len(), "Fetched trend samples");
        Ok(items)
    }

    fn natural_key(&self, item: &NativeItem) -> Option<String> {
        let entity = item.str_field("entity")?;
        let keyword = item.str_field("keyword")?;
        let geo = item.str_field("geo")?;
        let sample = item.time_field("sample_time")?;
        Some(format!("{entity}|{keyword}|{geo}|{}", sample_label(sample)))
    }

    fn observed_at(&self, item: &NativeItem) -> Option<DateTime<Utc>> {
        item.time_field("sample_time")
    }

    fn freshness(&self, item: &NativeItem) -> Option<DateTime<Utc>> {
        Some(item.fetched_at)
    }

    /// The sampled value, so the fingerprint changes only when a point is revised.
    fn text(&self, item: &NativeItem) -> Option<String> {
        item.payload.get("value").map(|v| v.to_string())
    }

    fn requires_text(&self) -> bool {
        false
    }
}

/// Day-resolution label for daily and weekly points, full timestamp otherwise.
fn sample_label(t: DateTime<Utc>) -> String {
    if t.hour() == 0 && t.minute() == 0 && t.second() == 0 {
        t.format("%Y-%m-%d").to_string()
    } else {
        format_time(t)
    }
}

/// `(sample_time, value)` pairs for `keyword` from a TIMESERIES response.
pub(crate) fn parse_timeline(
    source: &SourceId,
    body: &Value,
    keyword: &str,
) -> Result<Vec<(DateTime<Utc>, i64)>> {
    if let Some(err) = body.get("error").and_then(Value::as_str) {
        return Err(IngestError::malformed(source, format!("api error: {err}")));
    }
    let timeline = body
        .pointer("/interest_over_time/timeline_data")
        .and_then(Value::as_array)
        .ok_or_else(|| IngestError::malformed(source, "response without timeline_data"))?;

    let mut points = Vec::with_capacity(timeline.len());
    for point in timeline {
        let Some(sample_time) = point
            .get("timestamp")
            .and_then(|t| match t {
                Value::String(s) => s.parse::<i64>().ok(),
                other => other.as_i64(),
            })
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
        else {
            continue;
        };
        let values = point.get("values").and_then(Value::as_array);
        let value = values
            .and_then(|vs| {
                vs.iter()
                    .find(|v| v.get("query").and_then(Value::as_str) == Some(keyword))
                    .or_else(|| vs.first())
            })
            .and_then(|v| v.get("extracted_value"))
            .and_then(Value::as_i64);
        if let Some(value) = value {
            points.push((sample_time, value));
        }
    }
    Ok(points)
}

fn trend_payload(
    entity: &str,
    keyword: &str,
    geo: &str,
    sample_time: DateTime<Utc>,
    value: i64,
    fetched_at: DateTime<Utc>,
) -> Value {
    json!({
        "entity": entity,
        "keyword": keyword,
        "geo": geo,
        "sample_time": format_time(sample_time),
        "value": value,
        "fetched_at": format_time(fetched_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::SourceRateLimiter;
    use crate::retry::RetryPolicy;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn adapter() -> TrendSampleAdapter {
        let http = SourceHttp::new(
            SourceId::new("trends"),
            reqwest::Client::new(),
            Arc::new(SourceRateLimiter::per_minute(60).unwrap()),
            RetryPolicy::immediate(1),
        );
        TrendSampleAdapter::new(
            http,
            TrendSampleSettings {
                keywords: BTreeMap::from([("chase".to_string(), vec!["Chase Bank".to_string()])]),
                geos: vec!["US".to_string()],
                trailing_days: 90,
            },
            "key".to_string(),
        )
    }

    fn fixture() -> Value {
        serde_json::from_str(include_str!("../tests/fixtures/trends_timeseries.json")).unwrap()
    }

    #[test]
    fn window_ignores_cursor() {
        let now = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        let cursor = CursorPosition::new(now - Duration::hours(1), "run");
        let a = adapter();
        let w = a.plan_window(Some(&cursor), now);
        assert_eq!(w, a.plan_window(None, now));
        assert_eq!(w.start, now - Duration::days(90));
        assert_eq!(a.cursor_mode(), CursorMode::Stateless);
    }

    #[test]
    fn timeline_points_become_keyed_samples() {
        let src = SourceId::new("trends");
        let points = parse_timeline(&src, &fixture(), "Chase Bank").unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0], (Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(), 54));

        let a = adapter();
        let fetched = Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap();
        let (t, v) = points[0];
        let item = NativeItem::new(trend_payload("chase", "Chase Bank", "US", t, v, fetched), fetched);
        assert_eq!(a.natural_key(&item).as_deref(), Some("chase|Chase Bank|US|2025-01-01"));
        assert_eq!(a.freshness(&item), Some(fetched));
        assert_eq!(a.observed_at(&item), Some(t));
        assert_eq!(a.text(&item).as_deref(), Some("54"));
    }

    #[test]
    fn api_error_is_malformed() {
        let src = SourceId::new("trends");
        let body = json!({"error": "Invalid API key."});
        assert!(matches!(
            parse_timeline(&src, &body, "x"),
            Err(IngestError::MalformedResponse { .. })
        ));
    }
}
