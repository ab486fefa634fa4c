//! Process-wide registry of open storage paths.
//!
//! Two storages mapping the same file in one process would hand out two different `Page`
//! objects for the same bytes, so every open path is registered here until it is closed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::error::{StorageError, StorageResult};

fn open_paths() -> &'static Mutex<HashSet<PathBuf>> {
    static OPEN_PATHS: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    OPEN_PATHS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Registration of one open path; the path is released when this is dropped.
#[derive(Debug)]
pub(crate) struct OpenRegistration {
    path: PathBuf,
}

impl OpenRegistration {
    /// Register `path`, failing if a live storage already holds it.
    pub(crate) fn acquire(path: &Path) -> StorageResult<Self> {
        let mut paths = open_paths().lock();
        if !paths.insert(path.to_path_buf()) {
            return Err(StorageError::AlreadyOpen(path.to_path_buf()));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for OpenRegistration {
    fn drop(&mut self) {
        open_paths().lock().remove(&self.path);
    }
}

/// Number of currently registered (open) storages.
pub(crate) fn open_count() -> usize {
    open_paths().lock().len()
}

/// Whether `path` is currently held by a live storage.
pub(crate) fn is_registered(path: &Path) -> bool {
    open_paths().lock().contains(path)
}
