/// Error type for remote data service calls
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Transport failure: unreachable host, timeout, connection reset
    Network(String),
    /// Missing, invalid or expired credential (HTTP 401)
    Unauthorized(String),
    /// Payload exceeds the upload cap; retrying will never succeed
    PayloadTooLarge { size: usize, limit: usize },
    /// The server rejected the request as malformed (400, 405, 422)
    BadRequest(String),
    NotFound(String),
    Server { status: u16, message: String },
    /// The selected backend cannot perform this operation
    Unsupported(String),
    /// Response body could not be understood
    Decode(String),
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteError::Network(msg) => write!(f, "Network error: {}", msg),
            RemoteError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            RemoteError::PayloadTooLarge { size, limit } => write!(
                f,
                "Payload too large: {} bytes (limit {} bytes)",
                size, limit
            ),
            RemoteError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            RemoteError::NotFound(msg) => write!(f, "Not found: {}", msg),
            RemoteError::Server { status, message } => {
                write!(f, "Server error {}: {}", status, message)
            }
            RemoteError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
            RemoteError::Decode(msg) => write!(f, "Decode error: {}", msg),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::Decode(err.to_string())
    }
}

impl RemoteError {
    /// Maps a non-success HTTP status to an error kind
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => RemoteError::Unauthorized(message),
            404 => RemoteError::NotFound(message),
            413 => RemoteError::PayloadTooLarge { size: 0, limit: 0 },
            400 | 405 | 422 => RemoteError::BadRequest(message),
            status => RemoteError::Server { status, message },
        }
    }

    /// The credential is no longer accepted
    pub fn is_auth(&self) -> bool {
        matches!(self, RemoteError::Unauthorized(_))
    }

    /// Retrying the same request can never succeed
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RemoteError::PayloadTooLarge { .. }
                | RemoteError::BadRequest(_)
                | RemoteError::Unsupported(_)
        )
    }

    /// Worth retrying on the next drain
    pub fn is_transient(&self) -> bool {
        !self.is_auth() && !self.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(RemoteError::from_status(401, "expired").is_auth());
        assert!(RemoteError::from_status(413, "").is_terminal());
        assert!(RemoteError::from_status(400, "bad").is_terminal());
        assert!(RemoteError::from_status(405, "").is_terminal());
        assert!(RemoteError::from_status(500, "boom").is_transient());
        assert!(RemoteError::from_status(503, "").is_transient());
        assert!(RemoteError::Network("down".into()).is_transient());
    }

    #[test]
    fn test_not_found_is_retried() {
        let err = RemoteError::from_status(404, "Session not found");
        assert!(!err.is_terminal());
        assert!(err.is_transient());
    }
}
