use crate::sync::error::RemoteError;

/// Remote object store holding one folder per device and one CSV file per
/// hardware type inside it.
///
/// `download` must return [`RemoteError::NotFound`] when the file is gone so
/// the engine can tell absence apart from a failed request.
pub trait RemoteStore: Send {
    fn authenticate(&self) -> Result<(), RemoteError>;

    /// `Ok(false)` when the folder was deleted or trashed.
    fn folder_exists(&self, folder_id: &str) -> Result<bool, RemoteError>;

    fn find_folder(&self, parent_id: &str, name: &str) -> Result<Option<String>, RemoteError>;

    fn create_folder(&self, parent_id: &str, name: &str) -> Result<String, RemoteError>;

    fn find_file(&self, folder_id: &str, name: &str) -> Result<Option<String>, RemoteError>;

    fn download(&self, file_id: &str) -> Result<Vec<u8>, RemoteError>;

    /// Creates a file and returns its id.
    fn create_file(&self, folder_id: &str, name: &str, content: &[u8]) -> Result<String, RemoteError>;

    /// Replaces the content of an existing file.
    fn update_file(&self, file_id: &str, content: &[u8]) -> Result<(), RemoteError>;
}
