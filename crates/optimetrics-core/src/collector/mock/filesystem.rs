//! In-memory mock filesystem for testing adapters without real `/proc` and `/sys`.
//!
//! `MockFs` clones share their contents, so a test can hand one clone to an
//! adapter and keep rewriting counters through another between ticks.

use crate::collector::traits::FileSystem;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct Tree {
    /// Map from path to file contents.
    files: HashMap<PathBuf, String>,
    /// Set of directories (for read_dir support).
    directories: HashSet<PathBuf>,
}

impl Tree {
    fn add_parents(&mut self, path: &Path) {
        let mut parent = path.parent();
        while let Some(p) = parent {
            if !p.as_os_str().is_empty() {
                self.directories.insert(p.to_path_buf());
            }
            parent = p.parent();
        }
    }
}

/// In-memory filesystem for testing.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    tree: Arc<RwLock<Tree>>,
}

impl MockFs {
    /// Creates a new empty mock filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tree> {
        self.tree.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tree> {
        self.tree.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds or replaces a file with the given content.
    ///
    /// Parent directories are automatically created.
    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        let mut tree = self.write();
        tree.add_parents(&path);
        tree.files.insert(path, content.into());
    }

    /// Adds an empty directory.
    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let mut tree = self.write();
        tree.add_parents(&path);
        tree.directories.insert(path);
    }

    /// Removes a file, simulating a sensor that vanished.
    pub fn remove_file(&self, path: impl AsRef<Path>) {
        self.write().files.remove(path.as_ref());
    }

    /// Registers a whole block device under `/sys/block`.
    pub fn add_block_device(&self, name: &str) {
        self.add_dir(format!("/sys/block/{}", name));
    }

    /// Registers a network interface under `/sys/class/net`.
    pub fn add_net_interface(&self, name: &str, operstate: &str, speed_mbps: i64) {
        let base = PathBuf::from(format!("/sys/class/net/{}", name));
        self.add_file(base.join("operstate"), format!("{}\n", operstate));
        self.add_file(base.join("speed"), format!("{}\n", speed_mbps));
    }

    /// Loads a mock filesystem from a directory snapshot mounted at `virtual_root`.
    ///
    /// This is useful for regression tests with real `/proc` or `/sys` captures.
    pub fn from_snapshot(dir: &Path, virtual_root: &Path) -> io::Result<Self> {
        let fs = Self::new();
        load_directory_recursive(&fs, dir, virtual_root)?;
        Ok(fs)
    }
}

fn load_directory_recursive(fs: &MockFs, real_path: &Path, virtual_path: &Path) -> io::Result<()> {
    fs.add_dir(virtual_path);

    for entry in std::fs::read_dir(real_path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let real_child = entry.path();
        let virtual_child = virtual_path.join(entry.file_name());

        if file_type.is_dir() {
            load_directory_recursive(fs, &real_child, &virtual_child)?;
        } else if file_type.is_file() {
            // Skip binary files
            if let Ok(content) = std::fs::read_to_string(&real_child) {
                fs.add_file(&virtual_child, content);
            }
        }
    }
    Ok(())
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.read().files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found: {:?}", path),
            )
        })
    }

    fn exists(&self, path: &Path) -> bool {
        let tree = self.read();
        tree.files.contains_key(path) || tree.directories.contains(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let tree = self.read();
        if !tree.directories.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("directory not found: {:?}", path),
            ));
        }

        let mut entries = HashSet::new();
        for file_path in tree.files.keys() {
            if file_path.parent().is_some_and(|parent| parent == path) {
                entries.insert(file_path.clone());
            }
        }
        for dir_path in &tree.directories {
            if dir_path.parent().is_some_and(|parent| parent == path) && dir_path != path {
                entries.insert(dir_path.clone());
            }
        }

        let mut entries: Vec<PathBuf> = entries.into_iter().collect();
        entries.sort();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_fs_add_file() {
        let fs = MockFs::new();
        fs.add_file("/proc/meminfo", "MemTotal: 16384 kB\n");

        assert!(fs.exists(Path::new("/proc/meminfo")));
        assert!(fs.exists(Path::new("/proc")));

        let content = fs.read_to_string(Path::new("/proc/meminfo")).unwrap();
        assert_eq!(content, "MemTotal: 16384 kB\n");
    }

    #[test]
    fn test_mock_fs_clones_share_contents() {
        let fs = MockFs::new();
        let handle = fs.clone();
        handle.add_file("/proc/stat", "ctxt 1\n");
        assert_eq!(fs.read_line(Path::new("/proc/stat")).unwrap(), "ctxt 1");

        handle.add_file("/proc/stat", "ctxt 2\n");
        assert_eq!(fs.read_line(Path::new("/proc/stat")).unwrap(), "ctxt 2");

        handle.remove_file("/proc/stat");
        assert!(!fs.exists(Path::new("/proc/stat")));
    }

    #[test]
    fn test_mock_fs_read_dir() {
        let fs = MockFs::new();
        fs.add_block_device("sda");
        fs.add_block_device("nvme0n1");
        fs.add_net_interface("eth0", "up", 1000);

        let blocks = fs.read_dir(Path::new("/sys/block")).unwrap();
        assert_eq!(blocks.len(), 2);

        let eth0 = fs.read_dir(Path::new("/sys/class/net/eth0")).unwrap();
        assert_eq!(eth0.len(), 2); // operstate and speed
    }

    #[test]
    fn test_mock_fs_not_found() {
        let fs = MockFs::new();
        let result = fs.read_to_string(Path::new("/nonexistent"));
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotFound);
        assert!(fs.read_dir(Path::new("/nonexistent")).is_err());
    }
}
