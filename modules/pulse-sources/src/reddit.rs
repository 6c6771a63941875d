//! Social-post source: community search over the Reddit API.
//!
//! Posts and their newest comments are keyed by platform fullname (`t3_…`,
//! `t1_…`). The cursor is creation time and each window reaches back
//! `overlap_hours` before it so late-indexed posts and clock skew are absorbed.

use std::collections::HashSet;
use std::time::{Duration as StdDuration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::header::USER_AGENT;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use pulse_common::{
    CursorPosition, FetchWindow, IngestError, Result, SocialPostSettings, SourceId, SourceKind,
};

use crate::adapter::{format_time, page_cap_reached, NativeItem, SourceAdapter};
use crate::http::SourceHttp;

const TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";
const API_BASE: &str = "https://oauth.reddit.com";
const PAGE_LIMIT: &str = "100";
/// Refresh the app token this long before it expires.
const TOKEN_SLACK: StdDuration = StdDuration::from_secs(60);

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct SocialPostAdapter {
    http: SourceHttp,
    settings: SocialPostSettings,
    client_id: String,
    client_secret: String,
    user_agent: String,
    token: Mutex<Option<CachedToken>>,
}

impl SocialPostAdapter {
    pub fn new(
        http: SourceHttp,
        settings: SocialPostSettings,
        client_id: String,
        client_secret: String,
        user_agent: String,
    ) -> Self {
        Self {
            http,
            settings,
            client_id,
            client_secret,
            user_agent,
            token: Mutex::new(None),
        }
    }

    /// App-only bearer token, fetched with client credentials and cached.
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + TOKEN_SLACK < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let resp: TokenResponse = self
            .http
            .json("access_token", |client| {
                client
                    .post(TOKEN_URL)
                    .basic_auth(&self.client_id, Some(&self.client_secret))
                    .header(USER_AGENT, &self.user_agent)
                    .form(&[("grant_type", "client_credentials")])
            })
            .await?;

        debug!(source = %self.http.source_id(), expires_in = resp.expires_in, "Obtained app token");
        *cached = Some(CachedToken {
            value: resp.access_token.clone(),
            expires_at: Instant::now() + StdDuration::from_secs(resp.expires_in),
        });
        Ok(resp.access_token)
    }

    async fn forget_token(&self) {
        *self.token.lock().await = None;
    }

    async fn search_page(
        &self,
        token: &str,
        subreddit: &str,
        term: &str,
        after: Option<&str>,
    ) -> Result<Value> {
        let url = format!("{API_BASE}/r/{subreddit}/search");
        self.http
            .json("search", |client| {
                let mut req = client
                    .get(&url)
                    .bearer_auth(token)
                    .header(USER_AGENT, &self.user_agent)
                    .query(&[
                        ("q", term),
                        ("restrict_sr", "1"),
                        ("sort", "new"),
                        ("t", "month"),
                        ("limit", PAGE_LIMIT),
                    ]);
                if let Some(after) = after {
                    req = req.query(&[("after", after)]);
                }
                req
            })
            .await
    }

    async fn comments(&self, token: &str, subreddit: &str, post_id: &str) -> Result<Value> {
        let url = format!("{API_BASE}/r/{subreddit}/comments/{post_id}");
        let limit = self.settings.comments_per_post.to_string();
        self.http
            .json("comments", |client| {
                client
                    .get(&url)
                    .bearer_auth(token)
                    .header(USER_AGENT, &self.user_agent)
                    .query(&[("sort", "new"), ("depth", "1"), ("limit", limit.as_str())])
            })
            .await
    }

    async fn fetch_inner(&self, window: &FetchWindow) -> Result<Vec<NativeItem>> {
        let source = self.http.source_id().clone();
        let token = self.access_token().await?;
        let mut seen: HashSet<String> = HashSet::new();
        let mut items = Vec::new();

        for subreddit in &self.settings.subreddits {
            for term in &self.settings.terms {
                let mut after: Option<String> = None;
                let mut exhausted = false;
                for page in 0..self.settings.max_pages {
                    let body = self
                        .search_page(&token, subreddit, term, after.as_deref())
                        .await?;
                    let listing = parse_listing(&source, &body, window)?;
                    let fetched_at = Utc::now();
                    debug!(
                        source = %source,
                        subreddit = %subreddit,
                        term = %term,
                        page,
                        posts = listing.posts.len(),
                        "Search page"
                    );

                    for post in listing.posts {
                        let Some(fullname) = post.get("fullname").and_then(Value::as_str) else {
                            continue;
                        };
                        if !seen.insert(fullname.to_string()) {
                            continue;
                        }
                        if self.settings.comments_per_post > 0 {
                            if let Some(id) = post.get("native_id").and_then(Value::as_str) {
                                let body = self.comments(&token, subreddit, id).await?;
                                for comment in parse_comments(
                                    &body,
                                    window,
                                    self.settings.comments_per_post as usize,
                                ) {
                                    items.push(NativeItem::new(comment, fetched_at));
                                }
                            }
                        }
                        let mut post = post;
                        post["search_term"] = json!(term);
                        items.push(NativeItem::new(post, fetched_at));
                    }

                    if listing.reached_window_start || listing.after.is_none() {
                        exhausted = true;
                        break;
                    }
                    after = listing.after;
                }
                let scope = format!("r/{subreddit} {term}");
                page_cap_reached(&source, &scope, self.settings.max_pages, exhausted);
            }
        }

        Ok(items)
    }
}

#[async_trait]
impl SourceAdapter for SocialPostAdapter {
    fn source_id(&self) -> &SourceId {
        self.http.source_id()
    }

    fn kind(&self) -> SourceKind {
        SourceKind::SocialPost
    }

    fn plan_window(&self, cursor: Option<&CursorPosition>, now: DateTime<Utc>) -> FetchWindow {
        let start = match cursor {
            Some(c) => c.timestamp - Duration::hours(self.settings.overlap_hours),
            None => now - Duration::days(self.settings.initial_days),
        };
        FetchWindow::new(start.min(now), now)
    }

    async fn fetch_window(&self, window: &FetchWindow) -> Result<Vec<NativeItem>> {
        match self.fetch_inner(window).await {
            Ok(items) => {
                info!(source = %self.http.source_id(), items = items.len(), "Fetched social posts");
                Ok(items)
            }
            Err(e) => {
                if matches!(e, IngestError::Auth { .. }) {
                    self.forget_token().await;
                }
                Err(e)
            }
        }
    }

    fn natural_key(&self, item: &NativeItem) -> Option<String> {
        item.str_field("fullname").map(str::to_string)
    }

    fn observed_at(&self, item: &NativeItem) -> Option<DateTime<Utc>> {
        item.time_field("created_at")
    }

    fn freshness(&self, item: &NativeItem) -> Option<DateTime<Utc>> {
        let created = item.time_field("created_at")?;
        Some(match item.time_field("edited_at") {
            Some(edited) => edited.max(created),
            None => created,
        })
    }

    fn text(&self, item: &NativeItem) -> Option<String> {
        let title = item.str_field("title").unwrap_or_default();
        let body = item.str_field("body").unwrap_or_default();
        let text = format!("{title}\n{body}");
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

// --- Response parsing ---

#[derive(Debug)]
pub(crate) struct Listing {
    pub posts: Vec<Value>,
    pub after: Option<String>,
    /// A post older than the window was seen; later pages are older still.
    pub reached_window_start: bool,
}

fn epoch(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let secs = value?.as_f64()?;
    DateTime::from_timestamp(secs as i64, 0)
}

/// `edited` is `false` or an epoch timestamp.
fn edited_at(data: &Value) -> Option<DateTime<Utc>> {
    match data.get("edited") {
        Some(Value::Number(_)) => epoch(data.get("edited")),
        _ => None,
    }
}

fn thing_payload(kind: &str, data: &Value, created: DateTime<Utc>) -> Value {
    let edited = edited_at(data).map(format_time);
    let body_key = if kind == "post" { "selftext" } else { "body" };
    json!({
        "fullname": data.get("name").cloned().unwrap_or(Value::Null),
        "native_id": data.get("id").cloned().unwrap_or(Value::Null),
        "kind": kind,
        "subreddit": data.get("subreddit").cloned().unwrap_or(Value::Null),
        "author": data.get("author").cloned().unwrap_or(Value::Null),
        "title": data.get("title").cloned().unwrap_or(Value::Null),
        "body": data.get(body_key).cloned().unwrap_or(Value::Null),
        "score": data.get("score").cloned().unwrap_or(Value::Null),
        "num_comments": data.get("num_comments").cloned().unwrap_or(Value::Null),
        "permalink": data.get("permalink").cloned().unwrap_or(Value::Null),
        "parent_id": data.get("link_id").cloned().unwrap_or(Value::Null),
        "created_at": format_time(created),
        "edited_at": edited,
    })
}

/// Parse one search listing page, keeping posts created inside `window`.
pub(crate) fn parse_listing(source: &SourceId, body: &Value, window: &FetchWindow) -> Result<Listing> {
    let data = body
        .get("data")
        .ok_or_else(|| IngestError::malformed(source, "listing without data"))?;
    let children = data
        .get("children")
        .and_then(Value::as_array)
        .ok_or_else(|| IngestError::malformed(source, "listing without children"))?;

    let mut posts = Vec::new();
    let mut reached_window_start = false;
    for child in children {
        if child.get("kind").and_then(Value::as_str) != Some("t3") {
            continue;
        }
        let Some(thing) = child.get("data") else {
            continue;
        };
        let Some(created) = epoch(thing.get("created_utc")) else {
            continue;
        };
        if created < window.start {
            reached_window_start = true;
            continue;
        }
        if created > window.end {
            continue;
        }
        posts.push(thing_payload("post", thing, created));
    }

    let after = data
        .get("after")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(Listing {
        posts,
        after,
        reached_window_start,
    })
}

/// Parse a comments response (`[post listing, comment listing]`), keeping up to
/// `limit` top-level comments created inside `window`.
pub(crate) fn parse_comments(body: &Value, window: &FetchWindow, limit: usize) -> Vec<Value> {
    let Some(children) = body
        .get(1)
        .and_then(|l| l.pointer("/data/children"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    children
        .iter()
        .filter(|c| c.get("kind").and_then(Value::as_str) == Some("t1"))
        .filter_map(|c| c.get("data"))
        .filter_map(|data| {
            let created = epoch(data.get("created_utc"))?;
            window
                .contains(created)
                .then(|| thing_payload("comment", data, created))
        })
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> FetchWindow {
        FetchWindow::new(
            Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 11, 0, 0, 0).unwrap(),
        )
    }

    fn search_fixture() -> Value {
        serde_json::from_str(include_str!("../tests/fixtures/reddit_search.json")).unwrap()
    }

    #[test]
    fn listing_keeps_posts_in_window_and_flags_older_ones() {
        let src = SourceId::new("reddit");
        let listing = parse_listing(&src, &search_fixture(), &window()).unwrap();

        let names: Vec<_> = listing
            .posts
            .iter()
            .map(|p| p["fullname"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["t3_new1", "t3_edit2"]);
        assert!(listing.reached_window_start);
        assert_eq!(listing.after.as_deref(), Some("t3_old3"));
    }

    #[test]
    fn listing_without_children_is_malformed() {
        let src = SourceId::new("reddit");
        let err = parse_listing(&src, &json!({"data": {}}), &window()).unwrap_err();
        assert!(matches!(err, IngestError::MalformedResponse { .. }));
    }

    #[test]
    fn edited_posts_take_edit_time_as_freshness() {
        let src = SourceId::new("reddit");
        let listing = parse_listing(&src, &search_fixture(), &window()).unwrap();
        let edited = &listing.posts[1];
        assert_eq!(edited["created_at"], "2025-01-10T08:00:00Z");
        assert_eq!(edited["edited_at"], "2025-01-10T12:00:00Z");
        assert_eq!(listing.posts[0]["edited_at"], Value::Null);
    }

    #[test]
    fn comments_are_limited_and_windowed() {
        let body = json!([
            {"data": {"children": []}},
            {"data": {"children": [
                {"kind": "t1", "data": {"name": "t1_c1", "id": "c1", "body": "first comment here", "created_utc": 1736496000.0, "edited": false}},
                {"kind": "t1", "data": {"name": "t1_c2", "id": "c2", "body": "too old to keep", "created_utc": 1700000000.0, "edited": false}},
                {"kind": "more", "data": {"count": 4}},
                {"kind": "t1", "data": {"name": "t1_c3", "id": "c3", "body": "third comment", "created_utc": 1736499600.0, "edited": 1736503200.0}}
            ]}}
        ]);
        let all = parse_comments(&body, &window(), 10);
        let names: Vec<_> = all.iter().map(|c| c["fullname"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["t1_c1", "t1_c3"]);
        assert_eq!(all[1]["kind"], "comment");

        assert_eq!(parse_comments(&body, &window(), 1).len(), 1);
        assert!(parse_comments(&json!({}), &window(), 5).is_empty());
    }
}
