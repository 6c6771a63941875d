// Shared request plumbing for adapters: every call goes through the source's
// rate limiter and retry policy, and every failure is classified into the
// ingest error taxonomy.

use std::sync::Arc;

use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use pulse_common::{IngestError, Result, SourceId};

use crate::rate_limit::SourceRateLimiter;
use crate::retry::RetryPolicy;

/// Longest slice of an error body kept in error messages.
const BODY_PREVIEW: usize = 300;

#[derive(Clone)]
pub struct SourceHttp {
    source_id: SourceId,
    client: reqwest::Client,
    limiter: Arc<SourceRateLimiter>,
    retry: RetryPolicy,
}

impl SourceHttp {
    pub fn new(
        source_id: SourceId,
        client: reqwest::Client,
        limiter: Arc<SourceRateLimiter>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source_id,
            client,
            limiter,
            retry,
        }
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    /// Send the request produced by `build` and decode a JSON body.
    ///
    /// `build` runs once per attempt; each attempt waits for a rate-limit permit.
    pub async fn json<T, F>(&self, label: &str, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        self.retry
            .run(label, || async {
                if self.limiter.acquire().await {
                    debug!(source = %self.source_id, request = label, "Waited for rate limit slot");
                }
                debug!(source = %self.source_id, request = label, "Sending request");
                let resp = build(&self.client)
                    .send()
                    .await
                    .map_err(|e| transport_error(&self.source_id, e))?;

                let status = resp.status();
                let body = resp
                    .text()
                    .await
                    .map_err(|e| transport_error(&self.source_id, e))?;
                if !status.is_success() {
                    return Err(classify_status(&self.source_id, status, &body));
                }
                decode_body(&self.source_id, label, &body)
            })
            .await
    }
}

/// Map a non-success HTTP status to the ingest error taxonomy.
pub fn classify_status(source: &SourceId, status: StatusCode, body: &str) -> IngestError {
    let message = format!("HTTP {}: {}", status.as_u16(), preview(body));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => IngestError::Auth {
            source_id: source.clone(),
            message,
        },
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            IngestError::transient(source, Some(status.as_u16()), message)
        }
        s if s.is_server_error() => IngestError::transient(source, Some(s.as_u16()), message),
        _ => IngestError::malformed(source, message),
    }
}

fn transport_error(source: &SourceId, err: reqwest::Error) -> IngestError {
    if err.is_timeout() {
        IngestError::Timeout(format!("{source}: {err}"))
    } else {
        IngestError::transient(source, err.status().map(|s| s.as_u16()), err.to_string())
    }
}

/// Decode a JSON body, classifying failures as malformed responses.
pub fn decode_body<T: DeserializeOwned>(source: &SourceId, label: &str, body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| {
        IngestError::malformed(source, format!("{label}: {e}; body: {}", preview(body)))
    })
}

fn preview(body: &str) -> &str {
    match body.char_indices().nth(BODY_PREVIEW) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
