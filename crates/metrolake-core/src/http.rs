//! HTTP and async runtime plumbing.
//!
//! Source adapters and the object store client are async underneath, but
//! the orchestrator drives them from rayon workers through a sync
//! interface. Every call is bounded by `tokio::time::timeout`.

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use thiserror::Error;

use crate::retry::Retryable;

/// Connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of body bytes kept in an HTTP error message
const ERROR_BODY_LIMIT: usize = 200;

/// Error types for HTTP operations
#[derive(Debug, Clone, Error)]
pub enum HttpError {
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("request timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl HttpError {
    /// Create error from reqwest error
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout { secs: 0 }
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Status {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl Retryable for HttpError {
    fn is_retryable(&self) -> bool {
        match self {
            // 408 request timeout, 429 rate limited, 5xx server errors
            Self::Status { status, .. } => matches!(status, 408 | 429 | 500..=599),
            Self::Timeout { .. } | Self::Transport(_) => true,
            Self::Decode(_) => false,
        }
    }
}

/// Shared async HTTP client with connection pooling.
static SHARED_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(8)
        .user_agent(concat!("metrolake/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("failed to build HTTP client")
});

/// Get shared HTTP client.
pub fn http_client() -> &'static reqwest::Client {
    &SHARED_CLIENT
}

/// Shared tokio runtime for network operations.
pub static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

/// Run a future to completion on the shared runtime, giving up after `timeout`.
///
/// Returns `None` on expiry. Must not be called from inside the runtime.
pub fn block_on_timeout<F: Future>(timeout: Duration, fut: F) -> Option<F::Output> {
    SHARED_RUNTIME
        .handle()
        .block_on(async { tokio::time::timeout(timeout, fut).await.ok() })
}

/// HTTP GET → JSON, bounded by `timeout`.
pub fn get_json(
    url: &str,
    query: &[(String, String)],
    headers: &[(&str, &str)],
    timeout: Duration,
) -> Result<serde_json::Value, HttpError> {
    let fut = async {
        let mut req = http_client().get(url).query(query);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        let resp = req.send().await.map_err(|e| HttpError::from_reqwest(&e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(HttpError::Status {
                status: status.as_u16(),
                message: truncate(&body, ERROR_BODY_LIMIT),
            });
        }

        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| HttpError::Decode(e.to_string()))
    };

    block_on_timeout(timeout, fut).unwrap_or(Err(HttpError::Timeout {
        secs: timeout.as_secs(),
    }))
}

fn truncate(s: &str, limit: usize) -> String {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
