//! Authenticated, paginated HTTP access to the upstream inventory source.
//!
//! All upstream payloads are decoded into typed rows at this boundary; every
//! nested sub-object is optional so a missing key can never panic downstream.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "aim-client";

/// Hard page-size cap imposed by the upstream listing endpoints.
pub const SOURCE_PAGE_CAP: u32 = 100;

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

/// Listing envelope shared by the hardware and users endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct PageEnvelope<T> {
    #[serde(default)]
    pub total: Option<i64>,
    #[serde(default = "Vec::new")]
    pub rows: Vec<T>,
}

/// A relational sub-object carrying an id and a display name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NamedRef {
    pub id: Option<i64>,
    pub name: Option<String>,
}

/// Status sub-object on a hardware row.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusRef {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub status_type: Option<String>,
}

/// The entity an asset is checked out to. `kind` is the upstream `type` tag:
/// `"user"`, `"department"`, or anything else (treated as unassigned).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssignmentTarget {
    pub id: Option<i64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Warranty expiry arrives either as a plain date string or as an object
/// carrying a `date` key; both forms collapse to one optional date.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WarrantyExpiry {
    Plain(String),
    Structured { date: Option<String> },
}

impl WarrantyExpiry {
    pub fn date(&self) -> Option<&str> {
        match self {
            WarrantyExpiry::Plain(s) => Some(s.as_str()),
            WarrantyExpiry::Structured { date } => date.as_deref(),
        }
    }
}

/// Nested creation timestamp; only the opaque `datetime` string is consumed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreatedTimestamp {
    pub datetime: Option<String>,
    pub formatted: Option<String>,
}

/// One hardware record as returned by the upstream listing API.
#[derive(Debug, Clone, Deserialize)]
pub struct HardwareRow {
    pub id: i64,
    pub name: Option<String>,
    #[serde(default, deserialize_with = "tag_as_string")]
    pub asset_tag: Option<String>,
    pub serial: Option<String>,
    pub model: Option<NamedRef>,
    pub model_number: Option<String>,
    pub status_label: Option<StatusRef>,
    pub category: Option<NamedRef>,
    pub manufacturer: Option<NamedRef>,
    pub location: Option<NamedRef>,
    pub company: Option<NamedRef>,
    pub assigned_to: Option<AssignmentTarget>,
    pub warranty_months: Option<i64>,
    pub warranty_expires: Option<WarrantyExpiry>,
    pub created_at: Option<CreatedTimestamp>,
}

/// One directory user as returned by the upstream users API.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryUserRow {
    pub id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub country: Option<String>,
    pub department: Option<NamedRef>,
    pub location: Option<NamedRef>,
    pub assets_count: Option<i64>,
    pub licenses_count: Option<i64>,
}

/// Asset tags come back as strings or bare numbers depending on how the
/// upstream record was created; carry both as strings.
fn tag_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }))
}

/// Acknowledgment envelope returned by the upstream write endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct AckEnvelope {
    pub status: String,
    #[serde(default)]
    pub messages: serde_json::Value,
}

/// Fields accepted by the hardware create/update endpoints.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HardwareWrite {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Errors and retry classification
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding {context} response: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("source rejected {operation}: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },
    #[error("page fetch task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// Request pacing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct PacerConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Token bucket guarding the upstream's request throttle.
#[derive(Debug)]
pub struct RequestPacer {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<PacerState>,
}

#[derive(Debug, Clone, Copy)]
struct PacerState {
    tokens: u32,
    last_refill: Instant,
}

impl RequestPacer {
    pub fn new(config: PacerConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_every: config.refill_every,
            state: Mutex::new(PacerState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn admit(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if self.refill_every.as_millis() > 0 && elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }
            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }
            let wait = self.refill_every;
            drop(state);
            tokio::time::sleep(wait).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
    /// Optional PEM trust bundle for intercepting proxies on managed networks.
    pub ca_bundle: Option<PathBuf>,
    pub backoff: BackoffPolicy,
    pub pacer: Option<PacerConfig>,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            timeout: Duration::from_secs(30),
            ca_bundle: None,
            backoff: BackoffPolicy::default(),
            pacer: None,
        }
    }
}

/// Read/write access to the upstream inventory service. Read-only listing
/// pages feed the sync engine; the write operations are shared with the CRUD
/// layer and use the same auth and retry stack.
#[derive(Debug)]
pub struct InventoryClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    backoff: BackoffPolicy,
    pacer: Option<Arc<RequestPacer>>,
}

impl InventoryClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(path) = &config.ca_bundle {
            let pem = std::fs::read(path)
                .with_context(|| format!("reading CA bundle {}", path.display()))?;
            let certs = reqwest::Certificate::from_pem_bundle(&pem)
                .with_context(|| format!("parsing CA bundle {}", path.display()))?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }

        let http = builder.build().context("building reqwest client")?;
        let pacer = config.pacer.map(|c| Arc::new(RequestPacer::new(c)));

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
            backoff: config.backoff,
            pacer,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request with bearer auth, pacing, and capped-exponential retry
    /// on transient failures. Non-retryable statuses surface immediately.
    async fn execute<B>(&self, build: B) -> Result<reqwest::Response, SourceError>
    where
        B: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            if let Some(pacer) = &self.pacer {
                pacer.admit().await;
            }

            let request = build()
                .bearer_auth(&self.token)
                .header(reqwest::header::ACCEPT, "application/json");

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    let url = resp.url().to_string();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(%url, status = status.as_u16(), ?delay, "retrying page fetch");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(SourceError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(error = %err, ?delay, "retrying after transport error");
                        last_request_error = Some(err);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(SourceError::Request(err));
                }
            }
        }

        Err(SourceError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        path: &str,
        expand: &str,
        offset: u32,
        limit: u32,
        context: &'static str,
    ) -> Result<(Vec<T>, bool), SourceError> {
        let limit = limit.clamp(1, SOURCE_PAGE_CAP);
        let url = self.url(path);
        let resp = self
            .execute(|| {
                self.http.get(&url).query(&[
                    ("limit", limit.to_string()),
                    ("offset", offset.to_string()),
                    ("expand", expand.to_string()),
                ])
            })
            .await?;

        let envelope: PageEnvelope<T> = resp
            .json()
            .await
            .map_err(|source| SourceError::Decode { context, source })?;
        let has_more = envelope.rows.len() as u32 == limit;
        Ok((envelope.rows, has_more))
    }

    async fn post_ack<P: Serialize>(
        &self,
        path: &str,
        payload: &P,
        operation: &'static str,
    ) -> Result<(), SourceError> {
        let url = self.url(path);
        let resp = self
            .execute(|| self.http.post(&url).json(payload))
            .await?;
        let ack: AckEnvelope = resp.json().await.map_err(|source| SourceError::Decode {
            context: operation,
            source,
        })?;
        if ack.status != "success" {
            return Err(SourceError::Rejected {
                operation,
                message: ack.messages.to_string(),
            });
        }
        Ok(())
    }

    /// Create a hardware record upstream.
    pub async fn create_hardware(&self, payload: &HardwareWrite) -> Result<(), SourceError> {
        self.post_ack("/hardware", payload, "create_hardware").await
    }

    /// Patch fields on an existing hardware record.
    pub async fn update_hardware(
        &self,
        id: i64,
        payload: &HardwareWrite,
    ) -> Result<(), SourceError> {
        let url = self.url(&format!("/hardware/{id}"));
        let resp = self
            .execute(|| self.http.patch(&url).json(payload))
            .await?;
        let ack: AckEnvelope = resp.json().await.map_err(|source| SourceError::Decode {
            context: "update_hardware",
            source,
        })?;
        if ack.status != "success" {
            return Err(SourceError::Rejected {
                operation: "update_hardware",
                message: ack.messages.to_string(),
            });
        }
        Ok(())
    }

    /// Check a hardware record out to a user.
    pub async fn checkout_hardware(&self, id: i64, user_id: i64) -> Result<(), SourceError> {
        #[derive(Serialize)]
        struct Checkout {
            checkout_to_type: &'static str,
            assigned_user: i64,
        }
        self.post_ack(
            &format!("/hardware/{id}/checkout"),
            &Checkout {
                checkout_to_type: "user",
                assigned_user: user_id,
            },
            "checkout_hardware",
        )
        .await
    }
}

/// Page-level read access to the upstream source; the seam the sync engine is
/// driven through, so tests can substitute scripted sources.
#[async_trait]
pub trait InventorySource: Send + Sync {
    /// Fetch one hardware page. `has_more` is true iff the page came back
    /// full; a short or empty page terminates pagination and is not an error.
    async fn fetch_hardware_page(
        &self,
        offset: u32,
        limit: u32,
    ) -> Result<(Vec<HardwareRow>, bool), SourceError>;

    /// Fetch one directory users page; same termination rule.
    async fn fetch_users_page(
        &self,
        offset: u32,
        limit: u32,
    ) -> Result<(Vec<DirectoryUserRow>, bool), SourceError>;
}

#[async_trait]
impl InventorySource for InventoryClient {
    async fn fetch_hardware_page(
        &self,
        offset: u32,
        limit: u32,
    ) -> Result<(Vec<HardwareRow>, bool), SourceError> {
        self.get_page("/hardware", "company,assigned_to", offset, limit, "hardware")
            .await
    }

    async fn fetch_users_page(
        &self,
        offset: u32,
        limit: u32,
    ) -> Result<(Vec<DirectoryUserRow>, bool), SourceError> {
        self.get_page("/users", "department", offset, limit, "users")
            .await
    }
}

// ---------------------------------------------------------------------------
// Concurrent page streaming
// ---------------------------------------------------------------------------

/// Drive paginated fetches with up to `window` requests in flight against
/// distinct offsets, delivering pages in offset order over a bounded channel.
///
/// Scheduling stops at the first short page; requests already in flight past
/// the end are discarded. Peak memory is bounded by `window` pages.
pub fn stream_pages<T, F, Fut>(
    fetch: F,
    limit: u32,
    window: usize,
) -> mpsc::Receiver<Result<Vec<T>, SourceError>>
where
    T: Send + 'static,
    F: Fn(u32, u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(Vec<T>, bool), SourceError>> + Send + 'static,
{
    let window = window.max(1);
    let (tx, rx) = mpsc::channel(window);

    tokio::spawn(async move {
        let fetch = Arc::new(fetch);
        let mut in_flight: VecDeque<tokio::task::JoinHandle<Result<(Vec<T>, bool), SourceError>>> =
            VecDeque::new();
        let mut next_offset = 0u32;
        let mut scheduling = true;

        loop {
            while scheduling && in_flight.len() < window {
                let fetch = Arc::clone(&fetch);
                let offset = next_offset;
                in_flight.push_back(tokio::spawn(async move { fetch(offset, limit).await }));
                next_offset += limit;
            }

            let Some(head) = in_flight.pop_front() else {
                break;
            };
            match head.await {
                Ok(Ok((rows, has_more))) => {
                    if !has_more {
                        scheduling = false;
                    }
                    if !rows.is_empty() && tx.send(Ok(rows)).await.is_err() {
                        break;
                    }
                    if !scheduling {
                        for stale in in_flight.drain(..) {
                            stale.abort();
                        }
                        break;
                    }
                }
                Ok(Err(err)) => {
                    let _ = tx.send(Err(err)).await;
                    for stale in in_flight.drain(..) {
                        stale.abort();
                    }
                    break;
                }
                Err(join_err) => {
                    warn!(error = %join_err, "page fetch task aborted");
                    let _ = tx.send(Err(SourceError::Task(join_err.to_string()))).await;
                    for stale in in_flight.drain(..) {
                        stale.abort();
                    }
                    break;
                }
            }
        }
    });

    rx
}

pub fn stream_hardware_pages<C>(
    source: Arc<C>,
    limit: u32,
    window: usize,
) -> mpsc::Receiver<Result<Vec<HardwareRow>, SourceError>>
where
    C: InventorySource + ?Sized + 'static,
{
    stream_pages(
        move |offset, limit| {
            let source = Arc::clone(&source);
            async move { source.fetch_hardware_page(offset, limit).await }
        },
        limit,
        window,
    )
}

pub fn stream_users_pages<C>(
    source: Arc<C>,
    limit: u32,
    window: usize,
) -> mpsc::Receiver<Result<Vec<DirectoryUserRow>, SourceError>>
where
    C: InventorySource + ?Sized + 'static,
{
    stream_pages(
        move |offset, limit| {
            let source = Arc::clone(&source);
            async move { source.fetch_users_page(offset, limit).await }
        },
        limit,
        window,
    )
}
