//! Network access for the offline engine.
//!
//! Everything that talks to the network goes through the `Fetcher` trait so
//! the router, the download coordinator and the sync engine can run against
//! an in-memory fetcher in tests. `HttpClient` is the production
//! implementation on top of `reqwest`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use tracing::{debug, warn};

use super::message::{CacheMode, Request, Response, ResponseHead};
use super::NetworkError;

// ============================================================================
// Constants
// ============================================================================

/// Default HTTP request timeout in seconds.
/// A hung request only stalls one worker slot, so fail it reasonably fast.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

const USER_AGENT: &str = concat!("trailmap/", env!("CARGO_PKG_VERSION"));

/// Performs a single request and buffers the whole response.
///
/// Any HTTP status is a successful fetch; only transport failures
/// (unreachable host, timeout, malformed request) are errors.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// HTTP fetcher backed by reqwest.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Create a new HTTP client with the given request timeout
    pub fn new(timeout: Duration) -> Result<Self, NetworkError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self { client })
    }

    fn build_headers(request: &Request) -> Result<header::HeaderMap, NetworkError> {
        let mut headers = header::HeaderMap::new();
        for (name, value) in &request.headers {
            let name = header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| NetworkError::InvalidRequest(e.to_string()))?;
            let value = header::HeaderValue::from_str(value)
                .map_err(|e| NetworkError::InvalidRequest(e.to_string()))?;
            headers.insert(name, value);
        }
        if request.cache_mode == CacheMode::NoStore {
            headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-store"));
            headers.insert(header::PRAGMA, header::HeaderValue::from_static("no-cache"));
        }
        Ok(headers)
    }

    async fn capture(response: reqwest::Response) -> Result<Response, NetworkError> {
        let status = response.status();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            match value.to_str() {
                Ok(v) => {
                    headers.insert(name.as_str().to_string(), v.to_string());
                }
                Err(_) => debug!(header = %name, "Skipping non-ASCII response header"),
            }
        }
        let body = response.bytes().await?;

        Ok(Response {
            head: ResponseHead {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
                headers,
            },
            body,
        })
    }
}

#[async_trait]
impl Fetcher for HttpClient {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self
                .client
                .request(request.method.clone(), request.url.clone())
                .headers(Self::build_headers(request)?)
                .send()
                .await?;

            if response.status().as_u16() != 429 || retries >= MAX_RATE_LIMIT_RETRIES {
                return Self::capture(response).await;
            }

            retries += 1;
            warn!(url = %request.url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms *= 2; // Exponential backoff
        }
    }
}
