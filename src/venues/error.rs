//! Venue error taxonomy.
//!
//! Classifies external-call failures so the retry layer can decide what to
//! do: transient infra and rate limits are retried, auth and client errors
//! are not, trading rejections propagate to the calling phase.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum VenueError {
    /// Timeouts, 5xx, connection resets. Retried per policy.
    #[error("network error: {0}")]
    Network(String),

    /// HTTP 429. Short backoff then retry.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Authentication or signing failure. Never retried.
    #[error("auth error: {0}")]
    Auth(String),

    /// Other 4xx / malformed request. Never retried.
    #[error("client error: {0}")]
    Client(String),

    /// The venue accepted the request but rejected the trade
    /// (fill rejected, capacity gone, signer refusal).
    #[error("rejected: {0}")]
    Rejected(String),
}

impl VenueError {
    /// Whether the retry policy may re-attempt this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VenueError::Network(_) | VenueError::RateLimited(_))
    }

    /// Map an HTTP status + body into the taxonomy.
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        if status.as_u16() == 429 {
            VenueError::RateLimited(body)
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            VenueError::Auth(format!("{}: {}", status, body))
        } else if status.is_client_error() {
            VenueError::Client(format!("{}: {}", status, body))
        } else {
            VenueError::Network(format!("{}: {}", status, body))
        }
    }
}

impl From<reqwest::Error> for VenueError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_status() {
            let status = err.status().expect("status error carries a status");
            VenueError::from_status(status, err.to_string())
        } else {
            // Timeouts, connect failures, body/decode interruptions.
            VenueError::Network(err.to_string())
        }
    }
}

pub type VenueResult<T> = Result<T, VenueError>;
