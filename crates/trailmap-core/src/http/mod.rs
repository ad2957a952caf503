//! HTTP plumbing for the offline engine.
//!
//! This module provides the buffered `Request`/`Response` values, the
//! `Fetcher` seam and the reqwest-backed `HttpClient`.

pub mod client;
pub mod error;
pub mod message;

pub use client::{Fetcher, HttpClient, DEFAULT_TIMEOUT_SECS};
pub use error::NetworkError;
pub use message::{CacheMode, Request, Response, ResponseHead, OFFLINE_BODY};
