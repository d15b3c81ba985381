//! HTTP fetch with retry, plus the candidate and mapping stores.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, CONTENT_DISPOSITION, CONTENT_TYPE, LINK};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

mod memory;
mod pg;
mod store;

pub use memory::MemoryStore;
pub use pg::PgStore;
pub use store::{
    CandidateStore, MappingStore, PageCommit, ProjectionRefresh, StageStatus, StoreError,
    TransferStore,
};

pub const CRATE_NAME: &str = "hrsync-storage";

/// How a failed call should be treated by [`retry_call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Rate limiting or server trouble: exponential backoff.
    Backoff,
    /// Connection-level trouble: fixed pause.
    FixedDelay,
    Abort,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Backoff
    } else {
        RetryDisposition::Abort
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if let Some(status) = err.status() {
        return classify_status(status);
    }
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::FixedDelay
    } else {
        RetryDisposition::Abort
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub jitter_step: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            base_delay: Duration::from_secs(1),
            jitter_step: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// `base * 2^attempt + jitter_step * (attempt + 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let jitter_factor = u32::try_from(attempt_index + 1).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .saturating_mul(factor)
            .saturating_add(self.jitter_step.saturating_mul(jitter_factor));
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub backoff: BackoffPolicy,
    pub connection_retries: usize,
    pub connection_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            connection_retries: 3,
            connection_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// Default classification used by the fetcher and the reference resolver.
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::Abort),
            FetchError::Decode { .. }
            | FetchError::InvalidUrl { .. }
            | FetchError::RetriesExhausted { .. } => RetryDisposition::Abort,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Run `call` until it succeeds, `classify` says abort, or a retry cap is hit.
///
/// Backoff and fixed-delay retries are counted separately against their own
/// caps in `policy`.
pub async fn retry_call<T, F, Fut, C>(
    policy: &RetryPolicy,
    classify: C,
    mut call: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
    C: Fn(&FetchError) -> RetryDisposition,
{
    let mut backoff_retries = 0usize;
    let mut connection_retries = 0usize;

    loop {
        let err = match call().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let attempts = backoff_retries + connection_retries + 1;

        let delay = match classify(&err) {
            RetryDisposition::Abort => return Err(err),
            RetryDisposition::Backoff => {
                if backoff_retries >= policy.backoff.max_retries {
                    return Err(FetchError::RetriesExhausted {
                        attempts,
                        last: Box::new(err),
                    });
                }
                let delay = policy.backoff.delay_for_attempt(backoff_retries);
                backoff_retries += 1;
                delay
            }
            RetryDisposition::FixedDelay => {
                if connection_retries >= policy.connection_retries {
                    return Err(FetchError::RetriesExhausted {
                        attempts,
                        last: Box::new(err),
                    });
                }
                connection_retries += 1;
                policy.connection_delay
            }
        };

        warn!(
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying call"
        );
        tokio::time::sleep(delay).await;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Sent as the Basic-auth username with an empty password.
    pub basic_auth_user: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            basic_auth_user: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// First page (url plus query params) or a continuation url returned by the
/// previous page. Params are never resent with a continuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    Start {
        url: String,
        params: Vec<(String, String)>,
    },
    Next(String),
}

impl PageRequest {
    pub fn url(&self) -> &str {
        match self {
            PageRequest::Start { url, .. } => url,
            PageRequest::Next(url) => url,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Value>,
    pub next: Option<String>,
}

/// Body and naming headers of one downloaded file.
#[derive(Debug, Clone, Default)]
pub struct FetchedFile {
    pub url: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    basic_auth_user: Option<String>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            basic_auth_user: config.basic_auth_user,
            retry: config.retry,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Fetch one page of a JSON array endpoint, following the retry policy.
    pub async fn fetch_page(&self, request: &PageRequest) -> Result<Page, FetchError> {
        let span = info_span!("http_fetch", url = request.url());
        retry_call(&self.retry, FetchError::disposition, || {
            let builder = self.request_builder(request);
            async move { read_page(builder).await }
        })
        .instrument(span)
        .await
    }

    /// Download `url` in full, following the retry policy. Basic auth is only
    /// sent when this fetcher was configured with a user.
    pub async fn fetch_file(&self, url: &str) -> Result<FetchedFile, FetchError> {
        let span = info_span!("http_download", url);
        retry_call(&self.retry, FetchError::disposition, || {
            let builder = self.request_builder(&PageRequest::Next(url.to_string()));
            async move { read_file(builder).await }
        })
        .instrument(span)
        .await
    }

    fn request_builder(&self, request: &PageRequest) -> RequestBuilder {
        let builder = match request {
            PageRequest::Start { url, params } => self.client.get(url).query(params),
            PageRequest::Next(url) => self.client.get(url),
        };
        match &self.basic_auth_user {
            Some(user) => builder.basic_auth(user, Some("")),
            None => builder,
        }
    }
}

async fn read_page(builder: RequestBuilder) -> Result<Page, FetchError> {
    let resp = builder.send().await?;
    let status = resp.status();
    let url = resp.url().to_string();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url,
        });
    }

    let next = next_link(resp.headers());
    let body = resp.bytes().await?;
    let items: Vec<Value> =
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode { url, source })?;
    Ok(Page { items, next })
}

async fn read_file(builder: RequestBuilder) -> Result<FetchedFile, FetchError> {
    let resp = builder.send().await?;
    let status = resp.status();
    let url = resp.url().to_string();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url,
        });
    }

    let header = |name: HeaderName| {
        resp.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let content_type = header(CONTENT_TYPE);
    let content_disposition = header(CONTENT_DISPOSITION);
    let bytes = resp.bytes().await?.to_vec();
    Ok(FetchedFile {
        url,
        bytes,
        content_type,
        content_disposition,
    })
}

/// Target of the `rel="next"` entry of a `Link` header, if any.
pub fn next_link(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(|entry| {
            let mut parts = entry.split(';');
            let target = parts.next()?.trim();
            let is_next = parts.any(|param| {
                let param = param.trim().replace(' ', "");
                param == "rel=\"next\"" || param == "rel=next"
            });
            if !is_next {
                return None;
            }
            target
                .strip_prefix('<')?
                .strip_suffix('>')
                .map(str::to_string)
        })
}
