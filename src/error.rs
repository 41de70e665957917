use booth_cloud::RemoteError;
use booth_store::StoreError;
use std::fmt;

/// Errors surfaced by the sync engine to the UI layer
#[derive(Debug)]
pub enum SyncError {
    /// Local persistence failed
    Store(StoreError),
    /// The remote data service rejected or could not serve a call
    Remote(RemoteError),
    /// The operation needs a signed-in user
    NotAuthenticated,
    /// Invalid or unreadable configuration
    Config(String),
    /// General error
    Other(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyncError::Store(e) => write!(f, "Local store error: {}", e),
            SyncError::Remote(e) => write!(f, "Remote error: {}", e),
            SyncError::NotAuthenticated => write!(f, "Not authenticated"),
            SyncError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SyncError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Store(e) => Some(e),
            SyncError::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e)
    }
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        SyncError::Remote(e)
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Config(e.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(e: toml::de::Error) -> Self {
        SyncError::Config(e.to_string())
    }
}

/// User-friendly error messages for notifications
impl SyncError {
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Store(StoreError::QuotaExceeded { .. }) => {
                "Storage is full. Delete some photos and try again.".to_string()
            }
            SyncError::Store(_) => "A storage error occurred. Please try again.".to_string(),
            SyncError::Remote(e) if e.is_auth() => {
                "Your sign-in has expired. Please sign in again.".to_string()
            }
            SyncError::Remote(RemoteError::Network(_)) => {
                "Could not reach the server. Check your connection.".to_string()
            }
            SyncError::Remote(RemoteError::PayloadTooLarge { limit, .. }) => format!(
                "The file is too large to upload (limit {} MB).",
                limit / (1024 * 1024)
            ),
            SyncError::Remote(RemoteError::Unsupported(msg)) => msg.clone(),
            SyncError::Remote(_) => "The server could not complete the request.".to_string(),
            SyncError::NotAuthenticated => "Please sign in first.".to_string(),
            SyncError::Config(msg) => format!("Invalid configuration: {}", msg),
            SyncError::Other(msg) => msg.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages() {
        let expired = SyncError::from(RemoteError::Unauthorized("Invalid token".to_string()));
        assert!(expired.user_message().contains("sign in again"));

        let too_large = SyncError::from(RemoteError::PayloadTooLarge {
            size: 6 * 1024 * 1024,
            limit: 5 * 1024 * 1024,
        });
        assert!(too_large.user_message().contains("5 MB"));

        assert_eq!(SyncError::NotAuthenticated.to_string(), "Not authenticated");
    }
}
