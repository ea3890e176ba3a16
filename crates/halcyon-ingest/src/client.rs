//! HTTP client for the Halcyon REST API
//!
//! Every call goes through [`HalcyonClient::get_json`], which attaches the
//! bearer token, retries transient failures with exponential backoff and
//! jitter, and replays a request once after a token refresh when the API
//! answers 401/403.

use crate::auth::{RefreshingToken, StaticToken, TokenSource};
use crate::config::{ApiSettings, CollectionSettings, RetrySettings};
use crate::error::{IngestError, Result};
use crate::object_types::ObjectTypeSpec;
use crate::pagination::{decode_page, Page, PageCursor, RawRecord};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RETRY_AFTER};
use reqwest::{Client, Proxy, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// ============================================================================
// API Client Constants
// ============================================================================

/// Query parameters that carry the requested page size.
pub const PAGE_SIZE_PARAMS: &[&str] = &["limit", "pageSize", "perPage"];

/// Query parameters that carry a continuation token.
pub const CURSOR_PARAMS: &[&str] = &["cursor", "nextCursor", "next_cursor"];

/// Longest error body kept in a [`IngestError::Client`].
const MAX_ERROR_BODY: usize = 500;

/// Identity probe used by `validate`.
pub const CURRENT_USER_PATH: &str = "/v2/users/me";

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter: Duration::from_millis(settings.jitter_ms),
        }
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based).
    ///
    /// A server-supplied `Retry-After` raises the computed delay, never lowers
    /// it. The result is capped at `max_delay`.
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        let computed = self.base_delay.saturating_mul(factor).saturating_add(jitter);
        computed
            .max(retry_after.unwrap_or(Duration::ZERO))
            .min(self.max_delay)
    }
}

/// Identity returned by the validation probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: Option<String>,
    pub email: Option<String>,
    pub role: Option<String>,
}

/// Authenticated client for the Halcyon REST API.
pub struct HalcyonClient {
    http: Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
    retry: RetryPolicy,
    page_size: u32,
    max_pages: u32,
}

impl HalcyonClient {
    /// Build from settings, choosing a refreshing token source when a refresh
    /// endpoint is configured.
    pub fn new(api: &ApiSettings, collection: &CollectionSettings) -> Result<Self> {
        let http = build_http_client(api)?;

        let tokens: Arc<dyn TokenSource> = match (&api.refresh_url, &api.refresh_token) {
            (Some(url), Some(refresh)) => Arc::new(RefreshingToken::new(
                http.clone(),
                url.clone(),
                api.token.clone(),
                refresh.clone(),
            )),
            _ => Arc::new(StaticToken::new(api.token.clone())),
        };

        Ok(Self {
            http,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            tokens,
            retry: RetryPolicy::from_settings(&api.retry),
            page_size: collection.page_size,
            max_pages: collection.max_pages,
        })
    }

    /// Replace the token source.
    pub fn with_token_source(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// GET `url` and decode the JSON body, with retry and token refresh.
    pub async fn get_json(&self, url: &str, query: &[(String, String)]) -> Result<Value> {
        let mut attempt = 0u32;
        let mut refreshed = false;

        loop {
            attempt += 1;
            let token = self.tokens.token().await?;

            let sent = self
                .http
                .get(url)
                .bearer_auth(&token)
                .query(query)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    let err = IngestError::from(e);
                    if err.is_retryable() && attempt < self.retry.max_attempts {
                        let delay = self.retry.backoff(attempt, None);
                        warn!(
                            url,
                            attempt,
                            max_attempts = self.retry.max_attempts,
                            error = %err,
                            "Request failed, retrying in {:?}",
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(err);
                },
            };

            let status = response.status();

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                if refreshed {
                    return Err(IngestError::auth(format!(
                        "HTTP {} from {url} after token refresh",
                        status.as_u16()
                    )));
                }
                warn!(url, status = status.as_u16(), "API rejected token, refreshing");
                self.tokens.refresh(&token).await?;
                refreshed = true;
                // the replay does not count against the retry budget
                attempt -= 1;
                continue;
            }

            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if attempt < self.retry.max_attempts {
                    let delay = self
                        .retry
                        .backoff(attempt, retry_after(response.headers()));
                    warn!(
                        url,
                        status = status.as_u16(),
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        "Transient HTTP status, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(IngestError::transient(format!(
                    "HTTP {} from {url} after {attempt} attempts",
                    status.as_u16()
                )));
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(IngestError::Client {
                    status: status.as_u16(),
                    url: url.to_string(),
                    body: truncate(&body, MAX_ERROR_BODY),
                });
            }

            let bytes = match response.bytes().await {
                Ok(bytes) => bytes,
                Err(e) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt, None);
                    warn!(url, attempt, error = %e, "Reading response body failed, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                },
                Err(e) => return Err(IngestError::from(e)),
            };

            if bytes.iter().all(u8::is_ascii_whitespace) {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_slice(&bytes)?);
        }
    }

    /// Fetch one page of `spec`, starting at `cursor` (first page when `None`).
    ///
    /// `filter` carries incremental query parameters such as `after` or
    /// `since`; it is not re-sent when following an absolute next link.
    pub async fn fetch_page(
        &self,
        spec: &ObjectTypeSpec,
        filter: &[(String, String)],
        cursor: Option<&PageCursor>,
    ) -> Result<Page> {
        let started = Instant::now();

        let (url, query) = match cursor {
            Some(PageCursor::Url(next)) => (next.clone(), Vec::new()),
            other => {
                let size = self.page_size.to_string();
                let mut query: Vec<(String, String)> = PAGE_SIZE_PARAMS
                    .iter()
                    .map(|p| (p.to_string(), size.clone()))
                    .collect();
                query.extend(filter.iter().cloned());
                match other {
                    Some(PageCursor::Token(token)) => query.extend(
                        CURSOR_PARAMS
                            .iter()
                            .map(|p| (p.to_string(), token.clone())),
                    ),
                    Some(PageCursor::Page(page)) => query.push(("page".into(), page.to_string())),
                    Some(PageCursor::Offset(offset)) => {
                        query.push(("offset".into(), offset.to_string()))
                    },
                    _ => {},
                }
                (self.url_for(&spec.path), query)
            },
        };

        debug!(object_type = %spec.name, url = %url, cursor = ?cursor, "Fetching page");
        let payload = self.get_json(&url, &query).await?;

        let (records, next_cursor) = decode_page(
            spec.pagination,
            payload,
            spec.list_keys,
            cursor,
            self.page_size,
        );

        Ok(Page {
            records,
            next_cursor,
            latency: started.elapsed(),
        })
    }

    /// Page through `spec` starting from the first page.
    pub fn paginate<'a>(
        &'a self,
        spec: &'a ObjectTypeSpec,
        filter: Vec<(String, String)>,
    ) -> Paginator<'a> {
        Paginator {
            client: self,
            spec,
            filter,
            next: None,
            done: false,
            seen: HashSet::new(),
            pages: 0,
            truncated: false,
        }
    }

    /// Every record of `spec`, pages concatenated in API order.
    pub async fn fetch_all(
        &self,
        spec: &ObjectTypeSpec,
        filter: Vec<(String, String)>,
    ) -> Result<Vec<RawRecord>> {
        let mut pages = self.paginate(spec, filter);
        let mut records = Vec::new();
        while let Some(page) = pages.next_page().await? {
            records.extend(page.records);
        }
        Ok(records)
    }

    /// Identity behind the configured token.
    pub async fn current_user(&self) -> Result<CurrentUser> {
        let payload = self.get_json(&self.url_for(CURRENT_USER_PATH), &[]).await?;
        let user = payload
            .get("data")
            .filter(|d| d.is_object())
            .unwrap_or(&payload);

        fn field(user: &Value, keys: &[&str]) -> Option<String> {
            keys.iter().find_map(|k| match user.get(*k) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
        }

        Ok(CurrentUser {
            id: field(user, &["id", "userId", "uuid"]),
            email: field(user, &["email", "emailAddress"]),
            role: field(user, &["role", "roleName"]),
        })
    }
}

/// Stateful walk over the pages of one object type.
///
/// Stops on an empty next cursor, on a cursor seen before, or after the
/// client's page cap.
pub struct Paginator<'a> {
    client: &'a HalcyonClient,
    spec: &'a ObjectTypeSpec,
    filter: Vec<(String, String)>,
    next: Option<PageCursor>,
    done: bool,
    seen: HashSet<PageCursor>,
    pages: u32,
    truncated: bool,
}

impl Paginator<'_> {
    /// Fetch the next page, or `None` once pagination has ended.
    pub async fn next_page(&mut self) -> Result<Option<Page>> {
        if self.done {
            return Ok(None);
        }

        if self.pages >= self.client.max_pages {
            warn!(
                object_type = %self.spec.name,
                max_pages = self.client.max_pages,
                "Page cap reached, remaining pages deferred to the next run"
            );
            self.truncated = true;
            self.done = true;
            return Ok(None);
        }

        let cursor = self.next.take();
        let page = self
            .client
            .fetch_page(self.spec, &self.filter, cursor.as_ref())
            .await?;
        self.pages += 1;

        match &page.next_cursor {
            None => self.done = true,
            Some(next) if !self.seen.insert(next.clone()) => {
                warn!(object_type = %self.spec.name, cursor = %next, "Cursor repeated, stopping");
                self.done = true;
            },
            Some(next) => self.next = Some(next.clone()),
        }

        Ok(Some(page))
    }

    /// Pages fetched so far.
    pub fn pages(&self) -> u32 {
        self.pages
    }

    /// Whether the page cap cut pagination short.
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

/// Build the shared reqwest client from API settings.
pub fn build_http_client(api: &ApiSettings) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let mut builder = Client::builder()
        .timeout(api.timeout())
        .user_agent(api.user_agent.as_str())
        .default_headers(headers)
        .danger_accept_invalid_certs(!api.verify_tls);

    if let Some(proxy_url) = api.proxy.url() {
        let mut proxy = Proxy::all(proxy_url)
            .map_err(|e| IngestError::config(format!("invalid proxy URL: {e}")))?;
        if let Some(username) = api.proxy.username.as_deref().filter(|u| !u.is_empty()) {
            proxy = proxy.basic_auth(username, api.proxy.password.as_deref().unwrap_or(""));
        }
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| IngestError::config(format!("cannot build HTTP client: {e}")))
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| *secs >= 0.0)
        // out of range values still mean "wait as long as allowed"
        .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
}

fn truncate(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
