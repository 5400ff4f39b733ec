//! File existence and file content capability
//!
//! The engine only reads or writes files of a working tree through this trait
//! (version files of the target repository, the clone directories of the
//! cache). [`RealFileSystem`] is used in production, [`MemoryFileSystem`] keeps
//! everything in a map and is handy for tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

pub trait FileSystem: Send + Sync {
    fn directory_exists(&self, path: &Path) -> bool;

    fn file_exists(&self, path: &Path) -> bool;

    /// Returns `None` when the file does not exist.
    fn read_to_string(&self, path: &Path) -> Result<Option<String>>;

    /// Writes the file, creating parent directories as needed.
    fn write(&self, path: &Path, content: &str) -> Result<()>;
}

/// [`FileSystem`] backed by the host filesystem
#[derive(Debug, Default, Clone)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn directory_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn read_to_string(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }
}

/// In-memory [`FileSystem`]
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: Mutex<HashMap<PathBuf, String>>,
    directories: Mutex<HashSet<PathBuf>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a directory (and its ancestors) as existing.
    pub fn add_directory<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut directories = self.lock_directories()?;
        for ancestor in path.as_ref().ancestors() {
            if !ancestor.as_os_str().is_empty() {
                directories.insert(ancestor.to_path_buf());
            }
        }
        Ok(())
    }

    /// Forgets a directory and everything below it.
    pub fn remove_directory<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.lock_directories()?.retain(|d| !d.starts_with(path));
        self.lock_files()?.retain(|f, _| !f.starts_with(path));
        Ok(())
    }

    /// Paths of all files, sorted.
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = self.lock_files()?.keys().cloned().collect();
        files.sort();
        Ok(files)
    }

    fn lock_files(&self) -> Result<std::sync::MutexGuard<'_, HashMap<PathBuf, String>>> {
        self.files.lock().map_err(|_| Error::LockPoisoned {
            context: "memory filesystem files".to_string(),
        })
    }

    fn lock_directories(&self) -> Result<std::sync::MutexGuard<'_, HashSet<PathBuf>>> {
        self.directories.lock().map_err(|_| Error::LockPoisoned {
            context: "memory filesystem directories".to_string(),
        })
    }
}

impl FileSystem for MemoryFileSystem {
    fn directory_exists(&self, path: &Path) -> bool {
        self.lock_directories()
            .map(|directories| directories.contains(path))
            .unwrap_or(false)
    }

    fn file_exists(&self, path: &Path) -> bool {
        self.lock_files()
            .map(|files| files.contains_key(path))
            .unwrap_or(false)
    }

    fn read_to_string(&self, path: &Path) -> Result<Option<String>> {
        Ok(self.lock_files()?.get(path).cloned())
    }

    fn write(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.add_directory(parent)?;
        }
        self.lock_files()?
            .insert(path.to_path_buf(), content.to_string());
        Ok(())
    }
}
