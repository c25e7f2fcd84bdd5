//! Error taxonomy at the HTTP boundary.

use reqwest::StatusCode;
use thiserror::Error;

/// Phrases the edge/anti-bot layer puts in its block pages.
const BLOCK_MARKERS: [&str; 3] = ["cloudflare", "enable cookies", "been blocked"];

/// Errors from the data API or the order book API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// 403-class block from the venue's edge layer
    #[error("blocked by edge protection: {0}")]
    Blocked(String),

    /// The venue refused the request (bad order, no liquidity, auth)
    #[error("rejected: {0}")]
    Rejected(String),

    /// Timeouts, connection resets, 429 and 5xx; safe to retry
    #[error("transient failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, ApiError::Blocked(_))
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = format!("{} - {}", status, truncate(body, 200));
        if status == StatusCode::FORBIDDEN || looks_blocked(body) {
            ApiError::Blocked(detail)
        } else if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            ApiError::Transient(detail)
        } else {
            ApiError::Rejected(detail)
        }
    }

    /// Classify a free-form error message (e.g. an order response's `errorMsg`).
    pub fn from_message(message: &str) -> Self {
        if message.contains("403") && looks_blocked(message) {
            ApiError::Blocked(truncate(message, 200))
        } else {
            ApiError::Rejected(truncate(message, 200))
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return ApiError::from_status(status, &e.to_string());
        }
        if e.is_timeout() || e.is_connect() || e.is_request() {
            ApiError::Transient(e.to_string())
        } else {
            ApiError::Other(e.into())
        }
    }
}

fn looks_blocked(text: &str) -> bool {
    let lower = text.to_lowercase();
    BLOCK_MARKERS.iter().any(|m| lower.contains(m))
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
