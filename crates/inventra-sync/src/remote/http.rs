//! # HTTP Backend
//!
//! [`RemoteBackend`] over a PostgREST-style REST API.
//!
//! ## Request Shapes
//! ```text
//! page     GET  {base}/variants?select=*&order=id.asc&offset=2000&limit=1000
//! changed  GET  {base}/variants?select=*&updated_at=gte.<ts>&order=updated_at.asc,id.asc&offset=0&limit=1000
//!          (stock_movements filter on created_at)
//! one      GET  {base}/variants?select=*&id=eq.v1&limit=1
//! count    GET  {base}/variants?select=id&limit=1        Prefer: count=exact → Content-Range: 0-0/2500
//! upsert   POST {base}/variants?on_conflict=code         Idempotency-Key: <key>
//!                                                        Prefer: resolution=merge-duplicates
//! ```
//!
//! ## Status Mapping
//! ```text
//! 2xx      → ok (Idempotent-Replayed: true → duplicate ack)
//! 429      → RateLimited { retry_after }
//! 401/403  → Auth
//! 409      → Conflict
//! 400/422  → Validation
//! 5xx      → Network (retryable)
//! other    → Rejected
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::{change_column, conflict_key, RemoteBackend, UpsertAck};
use crate::error::{SyncError, SyncResult};
use inventra_core::{EntityKind, MutationOp, QueuedMutation};

const IDEMPOTENCY_KEY: &str = "Idempotency-Key";
const IDEMPOTENT_REPLAYED: &str = "Idempotent-Replayed";

/// REST implementation of [`RemoteBackend`].
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base: Url,
}

impl HttpBackend {
    /// Creates a backend for `base_url`.
    ///
    /// `timeout` bounds every request; `api_key` is sent both as `apikey` and
    /// as a bearer token.
    pub fn new(base_url: &str, api_key: Option<&str>, timeout: Duration) -> SyncResult<Self> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            let apikey = HeaderValue::from_str(key)
                .map_err(|e| SyncError::InvalidConfig(format!("api key: {e}")))?;
            let bearer = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| SyncError::InvalidConfig(format!("api key: {e}")))?;
            headers.insert("apikey", apikey);
            headers.insert(AUTHORIZATION, bearer);
        }

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(HttpBackend { client, base })
    }

    fn collection_url(&self, kind: EntityKind) -> SyncResult<Url> {
        Ok(self.base.join(kind.collection())?)
    }

    fn one_request(&self, kind: EntityKind, id: &str) -> SyncResult<RequestBuilder> {
        Ok(self.client.get(self.collection_url(kind)?).query(&[
            ("select", "*".to_string()),
            ("id", format!("eq.{id}")),
            ("limit", "1".to_string()),
        ]))
    }

    async fn fetch_rows(&self, kind: EntityKind, request: RequestBuilder) -> SyncResult<Vec<Value>> {
        let response = check(request.send().await?, kind.collection()).await?;
        let rows = response.json::<Vec<Value>>().await.map_err(|e| {
            SyncError::Schema(format!("{}: expected a JSON array of rows: {e}", kind.collection()))
        })?;
        Ok(rows)
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn fetch_page(
        &self,
        kind: EntityKind,
        offset: usize,
        limit: usize,
    ) -> SyncResult<Vec<Value>> {
        debug!(collection = kind.collection(), offset, limit, "GET page");
        let request = self.client.get(self.collection_url(kind)?).query(&[
            ("select", "*".to_string()),
            ("order", "id.asc".to_string()),
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
        ]);
        self.fetch_rows(kind, request).await
    }

    async fn fetch_changed(
        &self,
        kind: EntityKind,
        since: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> SyncResult<Vec<Value>> {
        let column = change_column(kind);
        debug!(collection = kind.collection(), %since, offset, limit, "GET changed");
        let request = self.client.get(self.collection_url(kind)?).query(&[
            ("select", "*".to_string()),
            (column, format!("gte.{}", since.to_rfc3339_opts(SecondsFormat::Micros, true))),
            ("order", format!("{column}.asc,id.asc")),
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
        ]);
        self.fetch_rows(kind, request).await
    }

    async fn fetch_one(&self, kind: EntityKind, id: &str) -> SyncResult<Option<Value>> {
        debug!(collection = kind.collection(), id, "GET one");
        let rows = self.fetch_rows(kind, self.one_request(kind, id)?).await?;
        Ok(rows.into_iter().next())
    }

    async fn count(&self, kind: EntityKind) -> SyncResult<Option<usize>> {
        let request = self
            .client
            .get(self.collection_url(kind)?)
            .query(&[("select", "id"), ("limit", "1")])
            .header("Prefer", "count=exact");
        let response = check(request.send().await?, kind.collection()).await?;

        let total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);
        if total.is_none() {
            warn!(collection = kind.collection(), "Backend did not report a row count");
        }
        Ok(total)
    }

    async fn upsert(&self, mutation: &QueuedMutation) -> SyncResult<UpsertAck> {
        let kind = mutation.target.kind;
        let prefer = match mutation.op {
            MutationOp::Upsert => "resolution=merge-duplicates,return=minimal",
            MutationOp::AppendEvent => "resolution=ignore-duplicates,return=minimal",
        };

        let request = self
            .client
            .post(self.collection_url(kind)?)
            .query(&[("on_conflict", conflict_key(kind))])
            .header(IDEMPOTENCY_KEY, mutation.idempotency_key.as_str())
            .header("Prefer", prefer)
            .json(&mutation.payload);

        let response = check(request.send().await?, &mutation.target.to_string()).await?;
        let duplicate = response
            .headers()
            .get(IDEMPOTENT_REPLAYED)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        debug!(
            mutation_id = %mutation.id,
            entity = %mutation.target,
            duplicate,
            "Upsert acknowledged"
        );
        Ok(UpsertAck { duplicate })
    }
}

// =============================================================================
// Response Handling
// =============================================================================

async fn check(response: Response, entity: &str) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();

    Err(status_error(status.as_u16(), retry_after, body, entity))
}

/// Maps a non-success HTTP status to a [`SyncError`].
fn status_error(status: u16, retry_after: Option<Duration>, body: String, entity: &str) -> SyncError {
    let message = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        body
    };

    match status {
        429 => SyncError::RateLimited { retry_after },
        401 | 403 => SyncError::Auth(message),
        409 => SyncError::Conflict {
            entity: entity.to_string(),
            message,
        },
        400 | 422 => SyncError::Validation(format!("{entity}: {message}")),
        500..=599 => SyncError::Network(format!("server error {status}: {message}")),
        _ => SyncError::Rejected { status, message },
    }
}

/// Parses the total out of `Content-Range: 0-0/2500` (`*/0` for empty).
fn parse_content_range(value: &str) -> Option<usize> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let backend =
            HttpBackend::new("https://api.example.com/rest/v1", None, Duration::from_secs(5)).unwrap();
        let url = backend.collection_url(EntityKind::Event).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/rest/v1/stock_movements");
    }

    #[test]
    fn test_single_row_request() {
        let backend =
            HttpBackend::new("https://api.example.com/rest/v1", None, Duration::from_secs(5)).unwrap();
        let request = backend.one_request(EntityKind::Variant, "v1").unwrap().build().unwrap();
        assert_eq!(request.url().path(), "/rest/v1/variants");
        assert_eq!(request.url().query(), Some("select=*&id=eq.v1&limit=1"));
    }

    #[test]
    fn test_invalid_base_url() {
        let err = HttpBackend::new("not a url", None, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, SyncError::InvalidUrl(_)));
    }

    #[test]
    fn test_status_mapping() {
        let rate = status_error(429, Some(Duration::from_secs(7)), String::new(), "variant/v1");
        assert!(matches!(rate, SyncError::RateLimited { retry_after: Some(d) } if d.as_secs() == 7));
        assert!(rate.is_retryable());

        assert!(matches!(status_error(401, None, String::new(), "x"), SyncError::Auth(_)));
        assert!(matches!(status_error(409, None, "stale".into(), "product/p1"), SyncError::Conflict { .. }));
        assert!(matches!(status_error(422, None, "bad code".into(), "x"), SyncError::Validation(_)));

        let server = status_error(503, None, String::new(), "x");
        assert!(server.is_retryable());

        let other = status_error(404, None, String::new(), "x");
        assert!(matches!(other, SyncError::Rejected { status: 404, .. }));
        assert!(other.is_structural());
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("0-0/2500"), Some(2500));
        assert_eq!(parse_content_range("*/0"), Some(0));
        assert_eq!(parse_content_range("0-0/*"), None);
        assert_eq!(parse_content_range("garbage"), None);
    }
}
