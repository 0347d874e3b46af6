use std::fmt;

use crate::storage::StorageError;

/// Failure of a single remote request.
#[derive(Debug)]
pub enum RemoteError {
    /// The object does not exist (HTTP 404).
    NotFound(String),
    /// Non-success HTTP status other than 404.
    Status { code: u16, body: String },
    /// Transport failure: connect, timeout, TLS.
    Http(reqwest::Error),
    /// Credentials missing, unreadable or rejected.
    Auth(String),
    /// Response did not have the expected shape.
    Decode(String),
}

impl RemoteError {
    /// Whether repeating the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Http(_) => true,
            RemoteError::Status { code, .. } => matches!(code, 401 | 408 | 429 | 500..=599),
            RemoteError::NotFound(_) | RemoteError::Auth(_) | RemoteError::Decode(_) => false,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::NotFound(what) => write!(f, "not found: {}", what),
            RemoteError::Status { code, body } => write!(f, "HTTP {}: {}", code, body),
            RemoteError::Http(e) => write!(f, "request failed: {}", e),
            RemoteError::Auth(msg) => write!(f, "authentication failed: {}", msg),
            RemoteError::Decode(msg) => write!(f, "unexpected response: {}", msg),
        }
    }
}

impl std::error::Error for RemoteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RemoteError::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        RemoteError::Http(e)
    }
}

/// Why a sync cycle, or one hardware type within it, did not complete.
#[derive(Debug)]
pub enum SyncError {
    Auth(RemoteError),
    Folder(RemoteError),
    Remote(RemoteError),
    Local(StorageError),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Auth(e) => write!(f, "authentication: {}", e),
            SyncError::Folder(e) => write!(f, "device folder: {}", e),
            SyncError::Remote(e) => write!(f, "remote: {}", e),
            SyncError::Local(e) => write!(f, "local: {}", e),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Auth(e) | SyncError::Folder(e) | SyncError::Remote(e) => Some(e),
            SyncError::Local(e) => Some(e),
        }
    }
}

impl From<StorageError> for SyncError {
    fn from(e: StorageError) -> Self {
        SyncError::Local(e)
    }
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        SyncError::Remote(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let status = |code| RemoteError::Status {
            code,
            body: String::new(),
        };
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(status(401).is_transient());
        assert!(!status(403).is_transient());
        assert!(!status(400).is_transient());
        assert!(!RemoteError::NotFound("x".into()).is_transient());
        assert!(!RemoteError::Auth("bad key".into()).is_transient());
    }
}
