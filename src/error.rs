//! Error contract shared by the mailbox, CRM and classifier adapters.
//!
//! Adapters report *what* went wrong; the pipeline only cares whether a retry
//! can help, which is what [`AdapterError::class`] answers.
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry eligible: network, timeout, rate limit, garbled response.
    Transient,
    /// Retrying cannot help.
    Permanent,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl AdapterError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AdapterError::Timeout(_)
            | AdapterError::RateLimited(_)
            | AdapterError::Unavailable(_)
            | AdapterError::Malformed(_) => ErrorClass::Transient,
            AdapterError::Rejected(_) | AdapterError::Invalid(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Map a non-success HTTP status (and its body) to an adapter error.
    pub fn from_status(service: &str, status: StatusCode, body: &str) -> Self {
        let detail = format!("{} {}: {}", service, status, truncate(body, 300));
        if status == StatusCode::TOO_MANY_REQUESTS {
            AdapterError::RateLimited(detail)
        } else if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            // expired credentials get rotated by the operator, not by us
            || status == StatusCode::UNAUTHORIZED
        {
            AdapterError::Unavailable(detail)
        } else if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
            AdapterError::Invalid(detail)
        } else {
            AdapterError::Rejected(detail)
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AdapterError::Unavailable(format!("request timed out: {err}"))
        } else if err.is_decode() {
            AdapterError::Malformed(err.to_string())
        } else if err.is_builder() {
            AdapterError::Invalid(err.to_string())
        } else if let Some(status) = err.status() {
            AdapterError::from_status("http", status, &err.to_string())
        } else {
            AdapterError::Unavailable(err.to_string())
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_classifies_retryability() {
        let err = AdapterError::from_status("crm", StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(err, AdapterError::RateLimited(_)));
        assert!(err.is_transient());

        let err = AdapterError::from_status("crm", StatusCode::BAD_GATEWAY, "");
        assert_eq!(err.class(), ErrorClass::Transient);

        let err = AdapterError::from_status("openai", StatusCode::FORBIDDEN, "policy");
        assert_eq!(err.class(), ErrorClass::Permanent);

        let err = AdapterError::from_status("gmail", StatusCode::BAD_REQUEST, "bad raw");
        assert!(matches!(err, AdapterError::Invalid(_)));
    }

    #[test]
    fn malformed_is_retryable() {
        assert!(AdapterError::Malformed("not json".into()).is_transient());
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(1000);
        let err = AdapterError::from_status("crm", StatusCode::NOT_IMPLEMENTED, &body);
        assert!(err.to_string().len() < 400);
    }
}
