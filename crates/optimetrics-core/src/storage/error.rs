use std::fmt;
use std::io;

/// Local file failures: tabular files, rolling files and state records.
#[derive(Debug)]
pub enum StorageError {
    Io(io::Error),
    Csv(csv::Error),
    Json(serde_json::Error),
    /// Compressed copy did not decompress to the original bytes.
    Verify(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "io error: {}", e),
            StorageError::Csv(e) => write!(f, "csv error: {}", e),
            StorageError::Json(e) => write!(f, "json error: {}", e),
            StorageError::Verify(msg) => write!(f, "verification failed: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            StorageError::Csv(e) => Some(e),
            StorageError::Json(e) => Some(e),
            StorageError::Verify(_) => None,
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<csv::Error> for StorageError {
    fn from(e: csv::Error) -> Self {
        StorageError::Csv(e)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Json(e)
    }
}
