//! Pooled HTTP(S) transport with wire byte accounting
//!
//! Every request goes through one shared `reqwest::Client`. Bytes are counted
//! as the request head and body leave and as the response head and body
//! chunks arrive, independent of how the request is later classified.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONNECTION, CONTENT_LENGTH, COOKIE,
};
use reqwest::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::TransportConfig;
use crate::error::{LoadGenError, Result};
use crate::source::{HttpMethod, UrlSpec};
use crate::stats::ThroughputCounters;

/// How one exchange ended at the HTTP level
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Connect, TLS, timeout or body read failure
    Network(String),
    /// A complete response
    Response { status: u16, body: Vec<u8> },
}

/// One timed request/response exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub elapsed_ms: u64,
    pub outcome: Outcome,
}

/// Counter a finished exchange is booked under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Success,
    NetworkFailed,
    BadFailed,
    Mismatched,
}

/// Classify an exchange. Only `200 OK` can succeed; with a pattern, the body
/// must contain it.
pub fn classify(outcome: &Outcome, expect: Option<&str>) -> Classification {
    match outcome {
        Outcome::Network(_) => Classification::NetworkFailed,
        Outcome::Response { status, .. } if *status != StatusCode::OK.as_u16() => {
            Classification::BadFailed
        }
        Outcome::Response { body, .. } => match expect {
            Some(pattern) if !contains(body, pattern.as_bytes()) => Classification::Mismatched,
            _ => Classification::Success,
        },
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// Shared HTTP client for all workers of a run
#[derive(Clone, Debug)]
pub struct Transport {
    client: reqwest::Client,
    headers: HeaderMap,
    request_timeout: Duration,
    throughput: Arc<ThroughputCounters>,
}

impl Transport {
    pub fn new(config: &TransportConfig, throughput: Arc<ThroughputCounters>) -> Result<Self> {
        let write_timeout = Duration::from_millis(config.write_timeout_ms);
        let read_timeout = Duration::from_millis(config.read_timeout_ms);

        let idle_per_host = if config.keep_alive {
            config.pool_size.max(1)
        } else {
            0
        };
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(idle_per_host)
            .connect_timeout(write_timeout)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;

        let mut headers = HeaderMap::new();
        headers.insert(
            CONNECTION,
            HeaderValue::from_static(if config.keep_alive { "keep-alive" } else { "close" }),
        );
        // Same value the client would add on its own, kept here so it is counted
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        if let Some((name, value)) = config.cookie_pair()? {
            let cookie = format!("{}={}", name, value);
            let value = HeaderValue::from_str(&cookie)
                .map_err(|_| LoadGenError::InvalidCookie(cookie.clone()))?;
            headers.insert(COOKIE, value);
        }
        if let Some(auth) = &config.auth_header {
            let value = HeaderValue::from_str(auth)
                .map_err(|_| LoadGenError::InvalidHeader("Authorization".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        Ok(Self {
            client,
            headers,
            request_timeout: write_timeout + read_timeout,
            throughput,
        })
    }

    pub fn throughput(&self) -> &Arc<ThroughputCounters> {
        &self.throughput
    }

    /// Send `spec` once and time it in whole milliseconds
    pub async fn execute(&self, spec: &UrlSpec) -> Exchange {
        let start = Instant::now();
        let outcome = self.send(spec).await;
        Exchange {
            elapsed_ms: start.elapsed().as_millis() as u64,
            outcome,
        }
    }

    fn build_request(&self, spec: &UrlSpec) -> reqwest::Result<Request> {
        let method = match spec.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
        };
        let mut builder = self
            .client
            .request(method, spec.target.as_str())
            .headers(self.headers.clone())
            .timeout(self.request_timeout);
        if let Some(body) = &spec.body {
            builder = builder.body(body.clone());
        }
        builder.build()
    }

    async fn send(&self, spec: &UrlSpec) -> Outcome {
        let request = match self.build_request(spec) {
            Ok(request) => request,
            Err(e) => return Outcome::Network(e.to_string()),
        };
        let written = request_size(&request);

        let mut response = match self.client.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                // A refused connection never put the request on the wire.
                if !e.is_connect() {
                    self.throughput.add_written(written);
                }
                return Outcome::Network(e.to_string());
            }
        };
        self.throughput.add_written(written);
        self.throughput.add_read(response_head_size(&response));

        let status = response.status().as_u16();
        let mut body = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    self.throughput.add_read(chunk.len() as u64);
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => return Outcome::Network(e.to_string()),
            }
        }

        Outcome::Response { status, body }
    }
}

fn headers_size(headers: &HeaderMap) -> u64 {
    headers
        .iter()
        .map(|(name, value)| (name.as_str().len() + 2 + value.len() + 2) as u64)
        .sum()
}

/// Size of the HTTP/1.1 request as written: request line, headers, body.
/// `host` and a non-empty body's `content-length` are added by the
/// connection when the request is sent.
pub fn request_size(request: &Request) -> u64 {
    let url = request.url();
    let target_len = url.path().len() + url.query().map(|q| q.len() + 1).unwrap_or(0);
    let host_len = url.host_str().map(str::len).unwrap_or(0)
        + url.port().map(|p| p.to_string().len() + 1).unwrap_or(0);
    let body_len = request
        .body()
        .and_then(|b| b.as_bytes())
        .map(|b| b.len())
        .unwrap_or(0);

    // "<METHOD> <target> HTTP/1.1\r\n" + "host: <host>\r\n" + headers + "\r\n"
    let line = request.method().as_str().len() + 1 + target_len + 11;
    let host = 6 + host_len + 2;
    let content_length = if body_len > 0 && !request.headers().contains_key(CONTENT_LENGTH) {
        // "content-length: <len>\r\n"
        16 + body_len.to_string().len() + 2
    } else {
        0
    };
    (line + host + content_length + 2 + body_len) as u64 + headers_size(request.headers())
}

/// Size of the status line and headers of a response
pub fn response_head_size(response: &Response) -> u64 {
    let status = response.status();
    let reason = status.canonical_reason().unwrap_or("");
    // "HTTP/1.1 200 OK\r\n" ... "\r\n"
    (8 + 1 + 3 + 1 + reason.len() + 2 + 2) as u64 + headers_size(response.headers())
}
