//! Complaint-registry source: the CFPB consumer complaint search API.
//!
//! The registry batches and back-dates entries, so every window reaches back
//! `lookback_days` (3 to 7) before the cursor. Complaints are queried per
//! configured company name and tagged with the entity they belong to.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::{debug, info};

use pulse_common::{
    ComplaintRegistrySettings, CursorPosition, FetchWindow, IngestError, Result, SourceId,
    SourceKind,
};

use crate::adapter::{format_time, page_cap_reached, parse_source_time, NativeItem, SourceAdapter};
use crate::http::SourceHttp;

const API_URL: &str =
    "https://www.consumerfinance.gov/data-research/consumer-complaints/search/api/v1/";

const MIN_LOOKBACK_DAYS: i64 = 3;
const MAX_LOOKBACK_DAYS: i64 = 7;

pub struct ComplaintRegistryAdapter {
    http: SourceHttp,
    settings: ComplaintRegistrySettings,
}

impl ComplaintRegistryAdapter {
    pub fn new(http: SourceHttp, settings: ComplaintRegistrySettings) -> Self {
        Self { http, settings }
    }

    fn lookback(&self) -> Duration {
        Duration::days(
            self.settings
                .lookback_days
                .clamp(MIN_LOOKBACK_DAYS, MAX_LOOKBACK_DAYS),
        )
    }

    async fn page(&self, company: &str, window: &FetchWindow, offset: u32) -> Result<Value> {
        let min = window.start.format("%Y-%m-%d").to_string();
        let max = window.end.format("%Y-%m-%d").to_string();
        let size = self.settings.page_size.to_string();
        let frm = offset.to_string();
        self.http
            .json("complaints", |client| {
                client.get(API_URL).query(&[
                    ("company", company),
                    ("date_received_min", min.as_str()),
                    ("date_received_max", max.as_str()),
                    ("size", size.as_str()),
                    ("frm", frm.as_str()),
                    ("sort", "created_date_desc"),
                    ("no_aggs", "true"),
                    ("format", "json"),
                ])
            })
            .await
    }
}

#[async_trait]
impl SourceAdapter for ComplaintRegistryAdapter {
    fn source_id(&self) -> &SourceId {
        self.http.source_id()
    }

    fn kind(&self) -> SourceKind {
        SourceKind::ComplaintRegistry
    }

    fn plan_window(&self, cursor: Option<&CursorPosition>, now: DateTime<Utc>) -> FetchWindow {
        let start = match cursor {
            Some(c) => c.timestamp - self.lookback(),
            None => now - Duration::days(self.settings.initial_days),
        };
        FetchWindow::new(start.min(now), now)
    }

    async fn fetch_window(&self, window: &FetchWindow) -> Result<Vec<NativeItem>> {
        let source = self.http.source_id().clone();
        let mut items = Vec::new();

        for (entity, companies) in &self.settings.companies {
            for company in companies {
                let mut offset = 0u32;
                let mut exhausted = false;
                for page in 0..self.settings.max_pages {
                    let body = self.page(company, window, offset).await?;
                    let hits = parse_hits(&source, &body)?;
                    let fetched_at = Utc::now();
                    let count = hits.len();
                    debug!(source = %source, company = %company, page, hits = count, "Complaint page");

                    items.extend(
                        hits.iter()
                            .map(|hit| complaint_payload(entity, hit))
                            .map(|p| NativeItem::new(p, fetched_at)),
                    );

                    if count < self.settings.page_size as usize {
                        exhausted = true;
                        break;
                    }
                    offset += self.settings.page_size;
                }
                page_cap_reached(&source, company, self.settings.max_pages, exhausted);
            }
        }

        info!(source = %source, items = items.len(), "Fetched complaints");
        Ok(items)
    }

    fn natural_key(&self, item: &NativeItem) -> Option<String> {
        item.str_field("complaint_id")
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }

    fn observed_at(&self, item: &NativeItem) -> Option<DateTime<Utc>> {
        item.time_field("date_received")
    }

    fn freshness(&self, item: &NativeItem) -> Option<DateTime<Utc>> {
        let received = item.time_field("date_received")?;
        if final_response(item).is_none() {
            return Some(received);
        }
        let sent = item
            .time_field("date_sent_to_company")
            .map_or(received, |s| s.max(received));
        Some(sent + final_response_lag())
    }

    /// Complaint text plus the company response, so a response change is
    /// visible in the fingerprint.
    fn text(&self, item: &NativeItem) -> Option<String> {
        let text = item.str_field("text").filter(|t| !t.is_empty())?;
        Some(match final_response(item) {
            Some(response) => format!("{text} | Response: {response}"),
            None => text.to_string(),
        })
    }
}

const IN_PROGRESS: &str = "In progress";

/// The registry publishes no timestamp for a company's final response. A
/// final response is dated one day after the complaint reached the company,
/// which ranks it above every in-progress version of the same complaint.
fn final_response_lag() -> Duration {
    Duration::days(1)
}

/// The company's closing response, if it has given one.
fn final_response(item: &NativeItem) -> Option<&str> {
    item.str_field("company_response")
        .map(str::trim)
        .filter(|r| !r.is_empty() && !r.eq_ignore_ascii_case(IN_PROGRESS))
}

/// The `_source` objects of a search response.
pub(crate) fn parse_hits(source: &SourceId, body: &Value) -> Result<Vec<Value>> {
    let hits = body
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .ok_or_else(|| IngestError::malformed(source, "response without hits.hits"))?;
    Ok(hits
        .iter()
        .filter_map(|h| h.get("_source").cloned())
        .collect())
}

fn str_of<'a>(hit: &'a Value, key: &str) -> Option<&'a str> {
    hit.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Complaint ids arrive as strings or numbers depending on the endpoint.
fn complaint_id(hit: &Value) -> Option<String> {
    match hit.get("complaint_id")? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// "Issue: … | Sub-issue: … | Complaint: … | Product: …", skipping absent parts.
fn complaint_text(hit: &Value) -> String {
    let narrative = str_of(hit, "complaint_what_happened")
        .or_else(|| str_of(hit, "consumer_complaint_narrative"));
    [
        ("Issue", str_of(hit, "issue")),
        ("Sub-issue", str_of(hit, "sub_issue")),
        ("Complaint", narrative),
        ("Product", str_of(hit, "product")),
    ]
    .into_iter()
    .filter_map(|(label, value)| value.map(|v| format!("{label}: {v}")))
    .collect::<Vec<_>>()
    .join(" | ")
}

pub(crate) fn complaint_payload(entity: &str, hit: &Value) -> Value {
    let time = |key: &str| str_of(hit, key).and_then(parse_source_time).map(format_time);
    json!({
        "complaint_id": complaint_id(hit),
        "entity": entity,
        "company": str_of(hit, "company"),
        "product": str_of(hit, "product"),
        "sub_product": str_of(hit, "sub_product"),
        "issue": str_of(hit, "issue"),
        "sub_issue": str_of(hit, "sub_issue"),
        "state": str_of(hit, "state"),
        "company_response": str_of(hit, "company_response"),
        "timely": str_of(hit, "timely"),
        "date_received": time("date_received"),
        "date_sent_to_company": time("date_sent_to_company"),
        "text": complaint_text(hit),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::SourceHttp;
    use crate::rate_limit::SourceRateLimiter;
    use crate::retry::RetryPolicy;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn adapter(lookback_days: i64) -> ComplaintRegistryAdapter {
        let http = SourceHttp::new(
            SourceId::new("cfpb"),
            reqwest::Client::new(),
            Arc::new(SourceRateLimiter::per_minute(60).unwrap()),
            RetryPolicy::immediate(1),
        );
        ComplaintRegistryAdapter::new(
            http,
            ComplaintRegistrySettings {
                companies: BTreeMap::from([("chase".to_string(), vec!["JPMORGAN CHASE & CO.".to_string()])]),
                lookback_days,
                initial_days: 30,
                page_size: 100,
                max_pages: 5,
            },
        )
    }

    fn fixture() -> Value {
        serde_json::from_str(include_str!("../tests/fixtures/cfpb_search.json")).unwrap()
    }

    fn items() -> Vec<NativeItem> {
        let hits = parse_hits(&SourceId::new("cfpb"), &fixture()).unwrap();
        hits.iter()
            .map(|h| NativeItem::new(complaint_payload("chase", h), Utc::now()))
            .collect()
    }

    #[test]
    fn lookback_is_clamped() {
        let now = Utc.with_ymd_and_hms(2025, 2, 20, 0, 0, 0).unwrap();
        let cursor = CursorPosition::new(Utc.with_ymd_and_hms(2025, 2, 15, 0, 0, 0).unwrap(), "1");

        let w = adapter(30).plan_window(Some(&cursor), now);
        assert_eq!(w.start, cursor.timestamp - Duration::days(7));

        let w = adapter(1).plan_window(Some(&cursor), now);
        assert_eq!(w.start, cursor.timestamp - Duration::days(3));

        let w = adapter(5).plan_window(None, now);
        assert_eq!(w.start, now - Duration::days(30));
        assert_eq!(w.end, now);
    }

    #[test]
    fn parses_hits_into_tagged_payloads() {
        let items = items();
        assert_eq!(items.len(), 2);
        let a = adapter(7);

        let first = &items[0];
        assert_eq!(a.natural_key(first).as_deref(), Some("9100001"));
        assert_eq!(first.payload["entity"], "chase");
        assert_eq!(
            a.text(first).unwrap(),
            "Issue: Managing an account | Sub-issue: Deposits and withdrawals | \
             Complaint: My deposit was held for ten days. | Product: Checking or savings account | \
             Response: Closed with explanation"
        );
    }

    #[test]
    fn freshness_follows_company_response() {
        let items = items();
        let a = adapter(7);

        // Closed: a day after it was sent to the company.
        assert_eq!(
            a.freshness(&items[0]),
            Some(Utc.with_ymd_and_hms(2025, 2, 13, 0, 0, 0).unwrap())
        );
        assert_eq!(
            a.observed_at(&items[0]),
            Some(Utc.with_ymd_and_hms(2025, 2, 10, 0, 0, 0).unwrap())
        );
        // Still in progress: received date.
        assert_eq!(
            a.freshness(&items[1]),
            Some(Utc.with_ymd_and_hms(2025, 2, 11, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn closing_a_complaint_makes_it_strictly_fresher() {
        let a = adapter(7);
        let version = |response: &str| {
            NativeItem::new(
                json!({
                    "complaint_id": "9100002",
                    "company_response": response,
                    "date_received": "2025-02-11T00:00:00Z",
                    "date_sent_to_company": "2025-02-11T00:00:00Z",
                    "text": "Issue: Problem with a purchase shown on your statement",
                }),
                Utc::now(),
            )
        };
        let open = version("In progress");
        let closed = version("Closed with monetary relief");
        let other = version("Closed with explanation");

        assert!(a.freshness(&closed) > a.freshness(&open));
        assert_ne!(a.text(&closed), a.text(&open));
        // Two different final responses share freshness but not content.
        assert_eq!(a.freshness(&closed), a.freshness(&other));
        assert_ne!(a.text(&closed), a.text(&other));
    }

    #[test]
    fn missing_hits_is_malformed() {
        let err = parse_hits(&SourceId::new("cfpb"), &json!({"took": 3})).unwrap_err();
        assert!(matches!(err, IngestError::MalformedResponse { .. }));
    }
}
