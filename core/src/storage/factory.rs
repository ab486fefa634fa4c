//! Factory that opens [`MappedFileStorage`] instances.
//!
//! Opening runs in a fixed order so that nothing is touched before the path is known to be
//! exclusively ours:
//!
//! 1. validate configuration, check/create the parent directory
//! 2. open (or create) the file and register its canonical path
//! 3. reconcile region allocations a crash left unfinished
//! 4. apply the alignment policy to whatever misalignment is left
//!
//! Any failure releases the registration, so no half-opened storage is reachable.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::mapped::MappedFileStorage;
use super::region_lock::RegionAllocationAtomicityLock;
use super::registry::OpenRegistration;
use crate::config::{DEFAULT_PAGE_SIZE, IfNotPageAligned, StorageConfig};
use crate::error::{StorageError, StorageResult};

/// Zero-fill chunk used when reconciling interrupted allocations.
const ZERO_CHUNK: usize = 64 * 1024;

/// Builds [`MappedFileStorage`] instances from configuration.
///
/// # Example
/// ```rust
/// use mapped_storage::{IfNotPageAligned, MappedFileStorageFactory};
///
/// let dir = tempfile::tempdir().unwrap();
/// let storage = MappedFileStorageFactory::default()
///     .page_size(4096)
///     .create_parent_directories(true)
///     .if_file_is_not_page_aligned(IfNotPageAligned::ExpandFile)
///     .open(dir.path().join("indexes/names.dat"))
///     .unwrap();
///
/// storage.page_by_offset(10_000).unwrap().write_bytes(0, b"hello").unwrap();
/// assert_eq!(storage.actual_file_size().unwrap(), 3 * 4096);
/// storage.close().unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct MappedFileStorageFactory {
    config: StorageConfig,
}

impl MappedFileStorageFactory {
    /// Factory with the 1MB default page size.
    pub fn with_default_page_size() -> Self {
        Self::default().page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn from_config(config: StorageConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Page size used for the storage; must be a power of two.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.config.page_size = Some(page_size);
        self
    }

    pub fn create_parent_directories(mut self, create: bool) -> Self {
        self.config.create_parent_directories = create;
        self
    }

    pub fn if_file_is_not_page_aligned(mut self, policy: IfNotPageAligned) -> Self {
        self.config.if_file_is_not_page_aligned = policy;
        self
    }

    /// Open (or create) the storage at `path`.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> StorageResult<MappedFileStorage> {
        let path = path.as_ref();
        let page_size = self.config.validated_page_size()?;

        self.prepare_parent_directory(path)?;

        // Registered before the file is touched, and held across the remaining steps; dropped
        // (unregistered) on any error
        let canonical = canonical_storage_path(path)?;
        let registration = OpenRegistration::acquire(&canonical)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&canonical)?;

        let allocation_lock = RegionAllocationAtomicityLock::default_lock(&canonical)?;
        let length =
            recover_unfinished_allocations(&file, &allocation_lock, page_size, &canonical)?;
        let length = self.apply_alignment_policy(&file, length, page_size, &canonical)?;

        Ok(MappedFileStorage::new(
            canonical,
            file,
            page_size,
            length,
            allocation_lock,
            registration,
        ))
    }

    fn prepare_parent_directory(&self, path: &Path) -> StorageResult<()> {
        let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(());
        };
        if parent.is_dir() {
            return Ok(());
        }
        if self.config.create_parent_directories {
            debug!(dir = %parent.display(), "creating parent directories");
            fs::create_dir_all(parent)?;
            return Ok(());
        }
        Err(StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!(
                "parent directory {} does not exist and creation is disabled",
                parent.display()
            ),
        )))
    }

    fn apply_alignment_policy(
        &self,
        file: &File,
        length: u64,
        page_size: usize,
        path: &Path,
    ) -> StorageResult<u64> {
        let page = page_size as u64;
        if length % page == 0 {
            return Ok(length);
        }

        match self.config.if_file_is_not_page_aligned {
            IfNotPageAligned::ThrowException => Err(StorageError::NotPageAligned {
                path: path.to_path_buf(),
                length,
                page_size,
            }),
            IfNotPageAligned::ExpandFile => {
                let expanded = length.next_multiple_of(page);
                warn!(
                    path = %path.display(),
                    from = length,
                    to = expanded,
                    "file is not page-aligned, expanding"
                );
                file.set_len(expanded)?;
                Ok(expanded)
            }
            IfNotPageAligned::Clean => {
                warn!(
                    path = %path.display(),
                    length,
                    "file is not page-aligned, discarding its content"
                );
                file.set_len(0)?;
                Ok(0)
            }
        }
    }
}

/// Canonical form of `path`, which need not exist yet; its parent directory must.
fn canonical_storage_path(path: &Path) -> StorageResult<PathBuf> {
    match fs::canonicalize(path) {
        Ok(canonical) => return Ok(canonical),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let name = path.file_name().ok_or_else(|| {
        StorageError::InvalidInput(format!("{} does not name a file", path.display()))
    })?;
    let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => fs::canonicalize(parent)?,
        None => std::env::current_dir()?,
    };
    Ok(parent.join(name))
}

/// Reconcile region allocations that were started but never finished.
///
/// Bytes of an unfinished region that made it into the file are zeroed, and a misaligned tail
/// covered by such a region is extended to the next page boundary. Returns the resulting file
/// length. Running this twice leaves the file unchanged the second time.
fn recover_unfinished_allocations(
    file: &File,
    lock: &RegionAllocationAtomicityLock,
    page_size: usize,
    path: &Path,
) -> StorageResult<u64> {
    let mut length = file.metadata()?.len();
    let unfinished = lock.unfinished_regions();
    if unfinished.is_empty() {
        return Ok(length);
    }

    info!(
        path = %path.display(),
        regions = unfinished.len(),
        length,
        "recovering interrupted region allocations"
    );

    for &(offset, region_length) in &unfinished {
        let end = offset.saturating_add(region_length).min(length);
        if offset < end {
            zero_file_range(file, offset, end)?;
        }
    }

    let page = page_size as u64;
    let tail_start = length - length % page;
    if tail_start != length && lock.region(tail_start, length - tail_start).is_unfinished() {
        let expanded = length.next_multiple_of(page);
        debug!(from = length, to = expanded, "completing interrupted growth");
        file.set_len(expanded)?;
        length = expanded;
    }
    file.sync_all()?;

    for &(offset, region_length) in &unfinished {
        lock.region(offset, region_length).finish()?;
    }
    Ok(length)
}

fn zero_file_range(mut file: &File, start: u64, end: u64) -> StorageResult<()> {
    let zeros = [0u8; ZERO_CHUNK];
    file.seek(SeekFrom::Start(start))?;
    let mut remaining = end - start;
    while remaining > 0 {
        let n = remaining.min(ZERO_CHUNK as u64) as usize;
        file.write_all(&zeros[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}
