//! Transport abstraction and retry handling for the pipeline's POSTs.

use std::fmt::Debug;
use std::thread;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use thiserror::Error;

use atlas_metrics::atlas_log;

/// Transport failures. Everything in here is considered retryable; HTTP
/// status handling happens above this layer.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Connect failures, timeouts, DNS problems.
    #[error("transport error: {0}")]
    Transport(String),
    /// The request could not even be constructed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Minimal client interface for the publish, eval and subscription
/// endpoints, so users can bring the HTTP stack their runtime prefers.
#[async_trait]
pub trait HttpClient: Debug + Send + Sync {
    /// Send a request and return the full response body.
    async fn send(&self, request: Request<Vec<u8>>) -> Result<Response<Bytes>, HttpError>;
}

#[cfg(feature = "reqwest-client")]
#[async_trait]
impl HttpClient for reqwest::Client {
    async fn send(&self, request: Request<Vec<u8>>) -> Result<Response<Bytes>, HttpError> {
        let (parts, body) = request.into_parts();
        let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;
        let mut builder = self.request(method, parts.uri.to_string());
        for (name, value) in &parts.headers {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        let response = builder
            .body(body)
            .send()
            .await
            .map_err(|e| HttpError::Transport(e.to_string()))?;
        into_http_response(
            response.status().as_u16(),
            response
                .headers()
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), v.as_bytes().to_vec()))
                .collect(),
            response
                .bytes()
                .await
                .map_err(|e| HttpError::Transport(e.to_string()))?,
        )
    }
}

#[cfg(feature = "reqwest-blocking-client")]
#[async_trait]
impl HttpClient for reqwest::blocking::Client {
    async fn send(&self, request: Request<Vec<u8>>) -> Result<Response<Bytes>, HttpError> {
        let (parts, body) = request.into_parts();
        let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;
        let mut builder = self.request(method, parts.uri.to_string());
        for (name, value) in &parts.headers {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        let response = builder
            .body(body)
            .send()
            .map_err(|e| HttpError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.as_bytes().to_vec()))
            .collect();
        let body = response
            .bytes()
            .map_err(|e| HttpError::Transport(e.to_string()))?;
        into_http_response(status, headers, body)
    }
}

#[cfg(any(feature = "reqwest-client", feature = "reqwest-blocking-client"))]
fn into_http_response(
    status: u16,
    headers: Vec<(String, Vec<u8>)>,
    body: Bytes,
) -> Result<Response<Bytes>, HttpError> {
    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        builder = builder.header(name.as_str(), value.as_slice());
    }
    builder
        .body(body)
        .map_err(|e| HttpError::InvalidRequest(e.to_string()))
}

/// Exponential backoff with jitter across a bounded server list.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: usize,
    /// First backoff delay.
    pub initial_delay: Duration,
    /// Cap on the backoff delay.
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to each delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_millis(250),
        }
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    Duration::from_millis(nanos % (max_ms + 1))
}

fn retry_after(response: &Response<Bytes>) -> Option<Duration> {
    response
        .headers()
        .get(http::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// True for status codes where a retry can help.
fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Send a request built per server, walking the server list with
/// exponential backoff between attempts. `429` and `503` honor
/// `Retry-After`; other server errors use the computed backoff; any other
/// status is returned to the caller without further attempts.
///
/// The call blocks the scheduler thread it runs on, which is the intended
/// execution model for the pipeline's background tasks.
pub fn send_with_retry(
    client: &dyn HttpClient,
    servers: &[String],
    policy: &RetryPolicy,
    build: impl Fn(&str) -> Result<Request<Vec<u8>>, HttpError>,
) -> Result<Response<Bytes>, HttpError> {
    if servers.is_empty() {
        return Err(HttpError::InvalidRequest("empty server list".to_string()));
    }
    let mut delay = policy.initial_delay;
    let mut last_error = None;
    for attempt in 0..=policy.max_retries {
        let server = &servers[attempt % servers.len()];
        let outcome = build(server)
            .and_then(|request| futures_executor::block_on(client.send(request)));
        let retry_in = match outcome {
            Ok(response) => {
                let status = response.status();
                if !is_retryable_status(status) || attempt == policy.max_retries {
                    return Ok(response);
                }
                let backoff = match status {
                    StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                        retry_after(&response).unwrap_or(delay)
                    }
                    _ => delay,
                };
                atlas_log!(debug,
                    name: "HttpRetry.status",
                    server = server.clone(),
                    status = status.as_u16(),
                    attempt = attempt
                );
                backoff
            }
            Err(e) => {
                atlas_log!(warn,
                    name: "HttpRetry.transport",
                    server = server.clone(),
                    error = e.to_string(),
                    attempt = attempt
                );
                let backoff = delay;
                last_error = Some(e);
                if attempt == policy.max_retries {
                    break;
                }
                backoff
            }
        };
        thread::sleep(retry_in + jitter(policy.jitter));
        delay = (delay * 2).min(policy.max_delay);
    }
    Err(last_error.unwrap_or_else(|| HttpError::Transport("retries exhausted".to_string())))
}
