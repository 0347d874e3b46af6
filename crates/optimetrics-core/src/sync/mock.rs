//! In-memory remote store for tests and dry runs.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::sync::error::RemoteError;
use crate::sync::remote::RemoteStore;

/// Remote operation names used for failure injection and call logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    Authenticate,
    FolderExists,
    FindFolder,
    CreateFolder,
    FindFile,
    Download,
    CreateFile,
    UpdateFile,
}

/// Kind of failure to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    NotFound,
    /// HTTP 503.
    Transient,
    /// HTTP 403.
    Permanent,
}

impl Failure {
    fn into_error(self, what: &str) -> RemoteError {
        match self {
            Failure::NotFound => RemoteError::NotFound(what.to_string()),
            Failure::Transient => RemoteError::Status {
                code: 503,
                body: "backend unavailable".into(),
            },
            Failure::Permanent => RemoteError::Status {
                code: 403,
                body: "forbidden".into(),
            },
        }
    }
}

#[derive(Debug, Default)]
struct RemoteFile {
    folder: String,
    name: String,
    content: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    /// id -> (parent, name)
    folders: BTreeMap<String, (String, String)>,
    files: BTreeMap<String, RemoteFile>,
    next_id: u64,
    failures: BTreeMap<Op, VecDeque<Failure>>,
    calls: Vec<Op>,
}

impl State {
    fn new_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn enter(&mut self, op: Op, what: &str) -> Result<(), RemoteError> {
        self.calls.push(op);
        match self.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(failure) => Err(failure.into_error(what)),
            None => Ok(()),
        }
    }
}

/// Remote store kept in memory. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<State>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues `failure` for the next `times` calls of `op`.
    pub fn fail_next(&self, op: Op, failure: Failure, times: usize) {
        let mut state = self.lock();
        let queue = state.failures.entry(op).or_default();
        queue.extend(std::iter::repeat_n(failure, times));
    }

    /// Adds a shared root folder that exists before any sync.
    pub fn add_folder(&self, id: &str, parent: &str, name: &str) {
        self.lock()
            .folders
            .insert(id.to_string(), (parent.to_string(), name.to_string()));
    }

    pub fn delete_folder(&self, id: &str) {
        let mut state = self.lock();
        state.folders.remove(id);
        state.files.retain(|_, f| f.folder != id);
    }

    pub fn delete_file(&self, id: &str) {
        self.lock().files.remove(id);
    }

    pub fn folder_count(&self) -> usize {
        self.lock().folders.len()
    }

    /// Content of the file called `name` in `folder`.
    pub fn content(&self, folder: &str, name: &str) -> Option<String> {
        self.lock()
            .files
            .values()
            .find(|f| f.folder == folder && f.name == name)
            .map(|f| String::from_utf8_lossy(&f.content).into_owned())
    }

    pub fn file_id(&self, folder: &str, name: &str) -> Option<String> {
        self.lock()
            .files
            .iter()
            .find(|(_, f)| f.folder == folder && f.name == name)
            .map(|(id, _)| id.clone())
    }

    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|c| **c == op).count()
    }
}

impl RemoteStore for MemoryRemote {
    fn authenticate(&self) -> Result<(), RemoteError> {
        self.lock().enter(Op::Authenticate, "credentials")
    }

    fn folder_exists(&self, folder_id: &str) -> Result<bool, RemoteError> {
        let mut state = self.lock();
        state.enter(Op::FolderExists, folder_id)?;
        Ok(state.folders.contains_key(folder_id))
    }

    fn find_folder(&self, parent_id: &str, name: &str) -> Result<Option<String>, RemoteError> {
        let mut state = self.lock();
        state.enter(Op::FindFolder, name)?;
        Ok(state
            .folders
            .iter()
            .find(|(_, (parent, n))| parent == parent_id && n == name)
            .map(|(id, _)| id.clone()))
    }

    fn create_folder(&self, parent_id: &str, name: &str) -> Result<String, RemoteError> {
        let mut state = self.lock();
        state.enter(Op::CreateFolder, name)?;
        let id = state.new_id("folder");
        state
            .folders
            .insert(id.clone(), (parent_id.to_string(), name.to_string()));
        Ok(id)
    }

    fn find_file(&self, folder_id: &str, name: &str) -> Result<Option<String>, RemoteError> {
        let mut state = self.lock();
        state.enter(Op::FindFile, name)?;
        Ok(state
            .files
            .iter()
            .find(|(_, f)| f.folder == folder_id && f.name == name)
            .map(|(id, _)| id.clone()))
    }

    fn download(&self, file_id: &str) -> Result<Vec<u8>, RemoteError> {
        let mut state = self.lock();
        state.enter(Op::Download, file_id)?;
        state
            .files
            .get(file_id)
            .map(|f| f.content.clone())
            .ok_or_else(|| RemoteError::NotFound(file_id.to_string()))
    }

    fn create_file(&self, folder_id: &str, name: &str, content: &[u8]) -> Result<String, RemoteError> {
        let mut state = self.lock();
        state.enter(Op::CreateFile, name)?;
        if !state.folders.contains_key(folder_id) {
            return Err(RemoteError::NotFound(folder_id.to_string()));
        }
        let id = state.new_id("file");
        state.files.insert(
            id.clone(),
            RemoteFile {
                folder: folder_id.to_string(),
                name: name.to_string(),
                content: content.to_vec(),
            },
        );
        Ok(id)
    }

    fn update_file(&self, file_id: &str, content: &[u8]) -> Result<(), RemoteError> {
        let mut state = self.lock();
        state.enter(Op::UpdateFile, file_id)?;
        match state.files.get_mut(file_id) {
            Some(file) => {
                file.content = content.to_vec();
                Ok(())
            }
            None => Err(RemoteError::NotFound(file_id.to_string())),
        }
    }
}
