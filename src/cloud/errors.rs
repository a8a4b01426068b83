//! Cloud Backend Error Types
//!
//! Structured errors surfaced by `CloudBackend` implementations.
//! Every variant carries an HTTP-status-like code so the core can decide
//! between retrying, treating an operation as already satisfied, or failing.

/// Backend error tagged with an HTTP-status-like code
#[derive(Debug, Clone, thiserror::Error)]
pub enum CloudError {
    #[error("Authentication expired, token needs refresh")]
    AuthExpired,

    #[error("Rate limited, try again after backoff")]
    RateLimited,

    #[error("Proxy authentication required")]
    ProxyAuthRequired,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Request error: {0}")]
    Request(String),
}

impl CloudError {
    /// HTTP-status-like code of this error
    pub fn status(&self) -> u16 {
        match self {
            CloudError::AuthExpired => 401,
            CloudError::RateLimited => 429,
            CloudError::ProxyAuthRequired => 407,
            CloudError::NotFound(_) => 404,
            CloudError::Forbidden(_) => 403,
            CloudError::Conflict(_) => 409,
            CloudError::Network(_) => 503,
            CloudError::Server(code, _) => *code,
            CloudError::Timeout => 408,
            CloudError::Request(_) => 400,
        }
    }

    /// Map the error to an appropriate libc errno
    pub fn to_errno(&self) -> i32 {
        match self {
            CloudError::AuthExpired => libc::EACCES,
            CloudError::RateLimited => libc::EAGAIN,
            CloudError::ProxyAuthRequired => libc::EACCES,
            CloudError::NotFound(_) => libc::ENOENT,
            CloudError::Forbidden(_) => libc::EACCES,
            CloudError::Conflict(_) => libc::EEXIST,
            CloudError::Network(_) => libc::EIO,
            CloudError::Server(_, _) => libc::EIO,
            CloudError::Timeout => libc::ETIMEDOUT,
            CloudError::Request(_) => libc::EIO,
        }
    }

    /// Whether this error is transient and worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CloudError::RateLimited
                | CloudError::ProxyAuthRequired
                | CloudError::Timeout
                | CloudError::Network(_)
                | CloudError::Server(_, _)
                | CloudError::AuthExpired
        )
    }

    /// Whether a delete/trash that failed with this error has in fact
    /// already happened (node gone or link already removed)
    pub fn is_already_satisfied(&self) -> bool {
        matches!(self, CloudError::NotFound(_) | CloudError::Conflict(_))
    }

    /// Create a CloudError from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => CloudError::AuthExpired,
            403 => CloudError::Forbidden(body.to_string()),
            404 => CloudError::NotFound(body.to_string()),
            407 => CloudError::ProxyAuthRequired,
            408 => CloudError::Timeout,
            409 => CloudError::Conflict(body.to_string()),
            429 => CloudError::RateLimited,
            500..=599 => CloudError::Server(status, body.to_string()),
            _ => CloudError::Request(format!("HTTP {}: {}", status, body)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_round_trips_code() {
        for code in [401u16, 403, 404, 407, 408, 409, 429, 500, 503] {
            assert_eq!(CloudError::from_status(code, "body").status(), code);
        }
        assert_eq!(CloudError::from_status(418, "teapot").status(), 400);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CloudError::RateLimited.is_retryable());
        assert!(CloudError::ProxyAuthRequired.is_retryable());
        assert!(CloudError::Server(502, String::new()).is_retryable());
        assert!(!CloudError::NotFound("x".into()).is_retryable());
        assert!(!CloudError::Conflict("x".into()).is_retryable());
    }

    #[test]
    fn test_already_satisfied() {
        assert!(CloudError::NotFound("gone".into()).is_already_satisfied());
        assert!(CloudError::Conflict("dup".into()).is_already_satisfied());
        assert!(!CloudError::Forbidden("no".into()).is_already_satisfied());
    }
}
