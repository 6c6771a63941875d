//! Employee-review source: company reviews through a RapidAPI-hosted endpoint.
//!
//! Pages are sorted newest first; paging stops at a short page, a review older
//! than the window, or the page cap.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::{debug, info};

use pulse_common::{
    CursorPosition, EmployeeReviewSettings, FetchWindow, IngestError, Result, SourceId, SourceKind,
};

use crate::adapter::{format_time, page_cap_reached, parse_source_time, NativeItem, SourceAdapter};
use crate::http::SourceHttp;

/// Largest page the endpoint serves.
const PAGE_SIZE: usize = 50;

pub struct EmployeeReviewAdapter {
    http: SourceHttp,
    settings: EmployeeReviewSettings,
    api_key: String,
    api_host: String,
}

impl EmployeeReviewAdapter {
    pub fn new(
        http: SourceHttp,
        settings: EmployeeReviewSettings,
        api_key: String,
        api_host: String,
    ) -> Self {
        Self {
            http,
            settings,
            api_key,
            api_host,
        }
    }

    async fn page(&self, company_id: &str, page: u32) -> Result<Value> {
        let url = format!("https://{}/company-reviews", self.api_host);
        let page = page.to_string();
        let limit = PAGE_SIZE.to_string();
        self.http
            .json("company_reviews", |client| {
                client
                    .get(&url)
                    .header("X-RapidAPI-Key", &self.api_key)
                    .header("X-RapidAPI-Host", &self.api_host)
                    .query(&[
                        ("company_id", company_id),
                        ("page", page.as_str()),
                        ("limit", limit.as_str()),
                        ("sort", "date"),
                    ])
            })
            .await
    }
}

#[async_trait]
impl SourceAdapter for EmployeeReviewAdapter {
    fn source_id(&self) -> &SourceId {
        self.http.source_id()
    }

    fn kind(&self) -> SourceKind {
        SourceKind::EmployeeReview
    }

    fn plan_window(&self, cursor: Option<&CursorPosition>, now: DateTime<Utc>) -> FetchWindow {
        let start = match cursor {
            Some(c) => c.timestamp - Duration::days(self.settings.overlap_days),
            None => now - Duration::days(self.settings.initial_days),
        };
        FetchWindow::new(start.min(now), now)
    }

    async fn fetch_window(&self, window: &FetchWindow) -> Result<Vec<NativeItem>> {
        let source = self.http.source_id().clone();
        let mut items = Vec::new();

        for (entity, company_id) in &self.settings.company_ids {
            let mut exhausted = false;
            for page in 1..=self.settings.max_pages {
                let body = self.page(company_id, page).await?;
                let reviews = parse_reviews(&source, &body)?;
                let fetched_at = Utc::now();
                debug!(source = %source, company_id = %company_id, page, reviews = reviews.len(), "Review page");

                let mut reached_window_start = false;
                for review in &reviews {
                    let payload = review_payload(entity, company_id, review);
                    let Some(date) = payload
                        .get("review_date")
                        .and_then(Value::as_str)
                        .and_then(parse_source_time)
                    else {
                        // Undated reviews are passed through; the normalizer drops them.
                        items.push(NativeItem::new(payload, fetched_at));
                        continue;
                    };
                    if date < window.start {
                        reached_window_start = true;
                        continue;
                    }
                    if date <= window.end {
                        items.push(NativeItem::new(payload, fetched_at));
                    }
                }

                if reached_window_start || reviews.len() < PAGE_SIZE {
                    exhausted = true;
                    break;
                }
            }
            page_cap_reached(&source, company_id, self.settings.max_pages, exhausted);
        }

        info!(source = %source, items = items.len(), "Fetched employee reviews");
        Ok(items)
    }

    fn natural_key(&self, item: &NativeItem) -> Option<String> {
        item.str_field("review_id")
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }

    fn observed_at(&self, item: &NativeItem) -> Option<DateTime<Utc>> {
        item.time_field("review_date")
    }

    fn freshness(&self, item: &NativeItem) -> Option<DateTime<Utc>> {
        let reviewed = item.time_field("review_date")?;
        Some(
            item.time_field("updated_at")
                .map_or(reviewed, |u| u.max(reviewed)),
        )
    }

    fn text(&self, item: &NativeItem) -> Option<String> {
        item.str_field("review_text")
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }
}

/// Review objects of a `{status: "OK", data: [...]}` response.
pub(crate) fn parse_reviews(source: &SourceId, body: &Value) -> Result<Vec<Value>> {
    let status = body.get("status").and_then(Value::as_str);
    if status != Some("OK") {
        return Err(IngestError::malformed(
            source,
            format!("unexpected status {status:?}"),
        ));
    }
    match body.get("data") {
        Some(Value::Array(reviews)) => Ok(reviews.clone()),
        // Some plans nest the list one level down.
        Some(data) => data
            .get("reviews")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| IngestError::malformed(source, "data without reviews")),
        None => Err(IngestError::malformed(source, "response without data")),
    }
}

fn first_str<'a>(review: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| review.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

fn first_f64(review: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| match review.get(*k)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn review_id(review: &Value) -> Option<String> {
    ["review_id", "id"].iter().find_map(|k| match review.get(*k)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Title, pros, cons and advice joined for downstream text analysis.
fn combined_text(review: &Value) -> String {
    [
        ("Title", first_str(review, &["title", "headline", "summary"])),
        ("Pros", first_str(review, &["pros"])),
        ("Cons", first_str(review, &["cons"])),
        ("Advice", first_str(review, &["advice_to_management", "advice_to_mgmt"])),
    ]
    .into_iter()
    .filter_map(|(label, value)| value.map(|v| format!("{label}: {v}")))
    .collect::<Vec<_>>()
    .join(" | ")
}

pub(crate) fn review_payload(entity: &str, company_id: &str, review: &Value) -> Value {
    let time = |keys: &[&str]| first_str(review, keys).and_then(parse_source_time).map(format_time);
    json!({
        "review_id": review_id(review),
        "entity": entity,
        "company_id": company_id,
        "review_date": time(&["review_date", "date", "created_at"]),
        "updated_at": time(&["updated_at", "review_updated_at"]),
        "overall_rating": first_f64(review, &["rating", "overall_rating"]),
        "job_title": first_str(review, &["job_title", "position"]),
        "location": first_str(review, &["location", "employee_location"]),
        "employment_status": first_str(review, &["employment_status", "employee_status"]),
        "review_text": combined_text(review),
    })
}
