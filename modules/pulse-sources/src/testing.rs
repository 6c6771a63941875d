// Scripted adapter for engine and normalizer tests.
//
// Items use a fixed payload shape: {id, created_at, edited_at, text}.
// `created_at` is the cursor field, freshness is max(edited_at, created_at).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use pulse_common::{CursorPosition, FetchWindow, IngestError, Result, SourceId, SourceKind};

use crate::adapter::{format_time, CursorMode, NativeItem, SourceAdapter};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Adapter that replays queued fetch results in order, then returns nothing.
/// Builder pattern: `.then_return()`, `.then_fail()`, `.stateless()`.
pub struct ScriptedAdapter {
    source_id: SourceId,
    mode: CursorMode,
    requires_text: bool,
    overlap: Duration,
    initial: Duration,
    delay: Option<StdDuration>,
    script: Mutex<VecDeque<Result<Vec<NativeItem>>>>,
    windows: Mutex<Vec<FetchWindow>>,
    calls: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: SourceId::new(source_id),
            mode: CursorMode::Incremental,
            requires_text: true,
            overlap: Duration::hours(2),
            initial: Duration::days(7),
            delay: None,
            script: Mutex::new(VecDeque::new()),
            windows: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Trailing-window source whose cursor never narrows the fetch.
    pub fn stateless(mut self) -> Self {
        self.mode = CursorMode::Stateless;
        self.requires_text = false;
        self
    }

    pub fn without_text_floor(mut self) -> Self {
        self.requires_text = false;
        self
    }

    pub fn with_overlap(mut self, overlap: Duration) -> Self {
        self.overlap = overlap;
        self
    }

    /// Sleep this long inside every fetch.
    pub fn with_delay(mut self, delay: StdDuration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn then_return(self, items: Vec<NativeItem>) -> Self {
        lock(&self.script).push_back(Ok(items));
        self
    }

    pub fn then_fail(self, err: IngestError) -> Self {
        lock(&self.script).push_back(Err(err));
        self
    }

    /// Queue another result on an adapter already shared with an engine.
    pub fn push(&self, result: Result<Vec<NativeItem>>) {
        lock(&self.script).push_back(result);
    }

    pub fn fetch_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Windows requested so far, in call order.
    pub fn windows(&self) -> Vec<FetchWindow> {
        lock(&self.windows).clone()
    }

    /// One item in the scripted payload shape.
    pub fn item(
        id: &str,
        created_at: DateTime<Utc>,
        edited_at: Option<DateTime<Utc>>,
        text: &str,
    ) -> NativeItem {
        NativeItem::new(
            json!({
                "id": id,
                "created_at": format_time(created_at),
                "edited_at": edited_at.map(format_time),
                "text": text,
            }),
            Utc::now(),
        )
    }

    /// Item whose freshness is its fetch time, like a trend sample.
    pub fn sample(id: &str, sample_time: DateTime<Utc>, value: i64, fetched_at: DateTime<Utc>) -> NativeItem {
        NativeItem::new(
            json!({
                "id": id,
                "created_at": format_time(sample_time),
                "edited_at": format_time(fetched_at),
                "text": value.to_string(),
            }),
            fetched_at,
        )
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        match self.mode {
            CursorMode::Incremental => SourceKind::SocialPost,
            CursorMode::Stateless => SourceKind::TrendSample,
        }
    }

    fn cursor_mode(&self) -> CursorMode {
        self.mode
    }

    fn plan_window(&self, cursor: Option<&CursorPosition>, now: DateTime<Utc>) -> FetchWindow {
        match (self.mode, cursor) {
            (CursorMode::Incremental, Some(c)) => {
                FetchWindow::new((c.timestamp - self.overlap).min(now), now)
            }
            _ => FetchWindow::trailing(now, self.initial),
        }
    }

    async fn fetch_window(&self, window: &FetchWindow) -> Result<Vec<NativeItem>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.windows).push(*window);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = lock(&self.script).pop_front();
        next.unwrap_or_else(|| Ok(Vec::new()))
    }

    fn natural_key(&self, item: &NativeItem) -> Option<String> {
        item.str_field("id").map(str::to_string)
    }

    fn observed_at(&self, item: &NativeItem) -> Option<DateTime<Utc>> {
        item.time_field("created_at")
    }

    fn freshness(&self, item: &NativeItem) -> Option<DateTime<Utc>> {
        let created = item.time_field("created_at")?;
        Some(item.time_field("edited_at").map_or(created, |e| e.max(created)))
    }

    fn text(&self, item: &NativeItem) -> Option<String> {
        item.str_field("text").map(str::to_string)
    }

    fn requires_text(&self) -> bool {
        self.requires_text
    }
}
