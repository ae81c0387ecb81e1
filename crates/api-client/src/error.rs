use thiserror::Error;

/// Delivery failure taxonomy, matched to how the sync dispatcher reacts:
/// transient errors back off and retry, auth expiry goes through one token
/// refresh, conflicts are authoritative, rejections park immediately.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Connection failure, timeout, or a 5xx response. Retryable.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// 401-class response; the token-exchange collaborator must refresh.
    #[error("authentication expired")]
    AuthExpired,

    /// The remote authority reports the target already ended or does not
    /// exist (404/409/410). Treated as authoritative, never retried.
    #[error("remote conflict (HTTP {status}): {body}")]
    Conflict { status: u16, body: String },

    /// Any other 4xx. Not retryable; parked with this error.
    #[error("request rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
}

impl ApiError {
    /// Classifies a non-2xx response status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 => ApiError::AuthExpired,
            404 | 409 | 410 => ApiError::Conflict { status, body },
            500..=599 => ApiError::Transient(format!("HTTP {status}: {body}")),
            _ => ApiError::Rejected { status, body },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        // Connect errors and timeouts are retryable; anything else at this
        // layer (body decode, redirect loops) is not worth retrying either,
        // but reqwest only surfaces those after a response arrived.
        ApiError::Transient(e.to_string())
    }
}
