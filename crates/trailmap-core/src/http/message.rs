//! Request and response values passed between the router, the caches and
//! the network.
//!
//! Responses are fully buffered: bodies are `Bytes`, so cloning a response
//! to store one copy and return the other is cheap.

use std::borrow::Cow;
use std::collections::BTreeMap;

use bytes::Bytes;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// Body of the synthesized response used when neither network nor cache
/// can satisfy a request.
pub const OFFLINE_BODY: &str = "Offline - this resource is not available";

/// How the network layer should treat intermediate HTTP caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Default,
    /// Always go to the origin (used for the sync manifest).
    NoStore,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    /// Header names are stored lowercase.
    pub headers: BTreeMap<String, String>,
    pub cache_mode: CacheMode,
}

impl Request {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: BTreeMap::new(),
            cache_mode: CacheMode::Default,
        }
    }

    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            ..Self::get(url)
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn no_store(mut self) -> Self {
        self.cache_mode = CacheMode::NoStore;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// True when the `Accept` header asks for an HTML document.
    pub fn accepts_html(&self) -> bool {
        self.header("accept")
            .map(|accept| accept.contains("text/html"))
            .unwrap_or(false)
    }
}

/// Status line and headers of a captured response, persisted next to the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub head: ResponseHead,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            head: ResponseHead {
                status,
                status_text: String::new(),
                headers: BTreeMap::new(),
            },
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.head
            .headers
            .insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// The universal terminal fallback: 503 with a fixed plain-text body.
    pub fn offline() -> Self {
        let mut response =
            Self::new(503, Bytes::from_static(OFFLINE_BODY.as_bytes())).with_header("content-type", "text/plain");
        response.head.status_text = "Service Unavailable".to_string();
        response
    }

    pub fn status(&self) -> u16 {
        self.head.status
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head
            .headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// 2xx, the `ok` range used for tile downloads and the manifest.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.head.status)
    }

    /// Responses in [200, 400) are worth keeping.
    pub fn is_cacheable(&self) -> bool {
        is_cacheable_status(self.head.status)
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

pub fn is_cacheable_status(status: u16) -> bool {
    (200..400).contains(&status)
}

/// Cache key for a URL: the full URL without its fragment.
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.to_string()
}

/// Cache key with the query string removed, for `ignoreSearch` style matching.
pub fn cache_key_without_query(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.set_query(None);
    url.to_string()
}
