//! Memory-mapped, page-oriented file storage.
//!
//! `MappedFileStorage` owns one growable file and hands out [`Page`] handles over it. Pages are
//! created lazily on first access and cached in a concurrent page table, so every caller that
//! asks for index `i` gets the very same `Arc<Page>` for the life of the storage.
//!
//! ## Growth
//!
//! Accessing a page past the end of the file grows the file first:
//!
//! ```text
//! 1. new length = (index + 1) * page_size
//! 2. region [old length, new length) marked "in progress" in the allocation lock file
//! 3. set_len(new length)           -- new bytes read as zero
//! 4. region marked resolved
//! 5. new length published          -- pages below it may now be mapped
//! ```
//!
//! Growth is serialized by a mutex with a double-checked length, so racing threads extend each
//! boundary exactly once. Lookups of pages below the current length never touch that mutex.
//!
//! ## Unmapping
//!
//! `close()` drops the storage's references to its pages; a mapping is released when the last
//! `Arc<Page>` goes away. `close_and_unsafely_unmap()` skips the wait and unmaps every page the
//! storage ever created, after which those pages report [`StorageError::Unmapped`].

use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::page::Page;
use super::region_lock::RegionAllocationAtomicityLock;
use super::registry::{self, OpenRegistration};
use crate::error::{StorageError, StorageResult};

/// How many times a transiently failing fsync is attempted before giving up.
const FSYNC_ATTEMPTS: u32 = 3;

/// Backoff between fsync attempts.
const FSYNC_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Growable file accessed through fixed-size memory-mapped pages.
pub struct MappedFileStorage {
    /// Canonical path of the backing file.
    path: PathBuf,
    page_size: usize,
    page_size_bits: u32,
    file: File,
    /// Current file length; always a multiple of `page_size`.
    file_length: AtomicU64,
    /// Page index -> page, populated on first access.
    pages: DashMap<u64, Arc<Page>>,
    /// Pages released by `close()`, kept so a later forced unmap can still reach them.
    retired: Mutex<Vec<Weak<Page>>>,
    /// Serializes file growth.
    growth: Mutex<()>,
    allocation_lock: RegionAllocationAtomicityLock,
    open: AtomicBool,
    /// Held while open; dropping it releases the path in the process-wide registry.
    registration: Mutex<Option<OpenRegistration>>,
}

impl MappedFileStorage {
    /// Wrap an already validated, page-aligned file. Used by the factory.
    pub(crate) fn new(
        path: PathBuf,
        file: File,
        page_size: usize,
        file_length: u64,
        allocation_lock: RegionAllocationAtomicityLock,
        registration: OpenRegistration,
    ) -> Self {
        debug_assert!(page_size.is_power_of_two());
        debug_assert_eq!(file_length % page_size as u64, 0);

        debug!(
            path = %path.display(),
            page_size,
            file_length,
            "opened mapped storage"
        );

        Self {
            path,
            page_size,
            page_size_bits: page_size.trailing_zeros(),
            file,
            file_length: AtomicU64::new(file_length),
            pages: DashMap::new(),
            retired: Mutex::new(Vec::new()),
            growth: Mutex::new(()),
            allocation_lock,
            open: AtomicBool::new(true),
            registration: Mutex::new(Some(registration)),
        }
    }

    /// Number of storages currently open in this process.
    pub fn opened_storages_count() -> usize {
        registry::open_count()
    }

    /// Whether some live storage in this process holds `path`.
    pub fn is_path_open<P: AsRef<Path>>(path: P) -> bool {
        match fs::canonicalize(path.as_ref()) {
            Ok(canonical) => registry::is_registered(&canonical),
            Err(_) => false,
        }
    }

    /// Path of the backing file.
    pub fn storage_path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Length of the backing file as reported by the file system.
    pub fn actual_file_size(&self) -> StorageResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Number of pages currently in the page table.
    pub fn mapped_pages_count(&self) -> usize {
        self.pages.len()
    }

    /// Index of the page containing `file_offset`.
    #[inline]
    pub fn page_index_by_offset(&self, file_offset: u64) -> u64 {
        file_offset >> self.page_size_bits
    }

    /// Offset of `file_offset` within its page.
    #[inline]
    pub fn to_offset_in_page(&self, file_offset: u64) -> usize {
        (file_offset & (self.page_size as u64 - 1)) as usize
    }

    /// Get the page containing `file_offset`, growing the file if needed.
    pub fn page_by_offset(&self, file_offset: u64) -> StorageResult<Arc<Page>> {
        self.page_by_index(self.page_index_by_offset(file_offset))
    }

    /// Get page `index`, growing the file if needed.
    pub fn page_by_index(&self, index: u64) -> StorageResult<Arc<Page>> {
        self.ensure_open()?;

        if let Some(page) = self.pages.get(&index) {
            return Ok(Arc::clone(page.value()));
        }

        let page_end = index
            .checked_add(1)
            .and_then(|n| n.checked_mul(self.page_size as u64))
            .ok_or_else(|| {
                StorageError::OutOfBounds(format!("page index {index} is beyond addressable range"))
            })?;
        self.ensure_file_length(page_end)?;

        // The entry lock makes first access race-free: one thread maps, everyone shares it
        let entry = self
            .pages
            .entry(index)
            .or_try_insert_with(|| Page::map(&self.file, index, self.page_size).map(Arc::new))?;
        Ok(Arc::clone(entry.value()))
    }

    /// Grow the file so that it is at least `required` bytes long.
    fn ensure_file_length(&self, required: u64) -> StorageResult<()> {
        if self.file_length.load(Ordering::Acquire) >= required {
            return Ok(());
        }

        let _growth = self.growth.lock();
        let current = self.file_length.load(Ordering::Acquire);
        if current >= required {
            // Another thread grew it while we waited
            return Ok(());
        }

        let region = self.allocation_lock.region(current, required - current);
        region.start()?;
        // On failure the region stays in progress and the old length stays published, so no
        // page in the range is handed out before the growth is durable. A retry resolves it.
        self.file.set_len(required)?;
        region.finish()?;
        self.file_length.store(required, Ordering::Release);

        debug!(
            path = %self.path.display(),
            from = current,
            to = required,
            "grew mapped storage"
        );
        Ok(())
    }

    /// Zero every byte in `[start_inclusive, end_inclusive]`, across page boundaries.
    pub fn zeroize_region(&self, start_inclusive: u64, end_inclusive: u64) -> StorageResult<()> {
        if start_inclusive > end_inclusive {
            return Err(StorageError::InvalidInput(format!(
                "zeroize range start {start_inclusive} > end {end_inclusive}"
            )));
        }

        let mut offset = start_inclusive;
        loop {
            let page = self.page_by_offset(offset)?;
            let page_start = page.offset_in_file();
            let page_last = page_start + (self.page_size as u64 - 1);

            let from = (offset - page_start) as usize;
            let to = (end_inclusive.min(page_last) - page_start) as usize;
            page.raw_buffer()?.zero(from..to + 1)?;

            if end_inclusive <= page_last {
                return Ok(());
            }
            offset = page_last + 1;
        }
    }

    /// Zero everything from `start_offset` to the current end of file.
    pub fn zeroize_till_eof(&self, start_offset: u64) -> StorageResult<()> {
        self.ensure_open()?;
        let length = self.file_length.load(Ordering::Acquire);
        if start_offset >= length {
            return Ok(());
        }
        self.zeroize_region(start_offset, length - 1)
    }

    /// Force all dirty mapped pages and the file itself to the storage medium.
    ///
    /// Some platforms occasionally fail this with a transient "resource busy" error; such
    /// failures are retried a few times before being returned.
    pub fn fsync(&self) -> StorageResult<()> {
        self.ensure_open()?;

        let mut attempt = 1;
        loop {
            match self.force_to_disk() {
                Ok(()) => return Ok(()),
                Err(e) if is_transient(&e) && attempt < FSYNC_ATTEMPTS => {
                    warn!(
                        path = %self.path.display(),
                        attempt,
                        error = %e,
                        "fsync failed, retrying"
                    );
                    thread::sleep(FSYNC_RETRY_DELAY * attempt);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn force_to_disk(&self) -> std::io::Result<()> {
        for page in self.pages.iter() {
            page.value().flush()?;
        }
        self.file.sync_all()
    }

    /// Close the storage without deleting the file.
    ///
    /// Pages obtained earlier stay mapped until their last holder drops them, but must not be
    /// used after this call. Closing twice is a no-op.
    pub fn close(&self) -> StorageResult<()> {
        if self.retire_pages() {
            self.release_registration();
        }
        Ok(())
    }

    /// Close, unmap every page immediately, and delete the backing file.
    ///
    /// The path stays registered until both files are gone, so a concurrent open of the same
    /// path starts from scratch instead of losing its file.
    pub fn close_and_clean(&self) -> StorageResult<()> {
        self.retire_pages();
        self.unmap_all();

        let removed = self.remove_files();
        self.release_registration();
        removed?;

        debug!(path = %self.path.display(), "removed mapped storage file");
        Ok(())
    }

    /// Close (if still open) and unmap every page this storage created, without waiting for
    /// outstanding `Arc<Page>` holders to drop them.
    ///
    /// Waits only for in-flight [`PageBuffer`](super::PageBuffer) guards. Holders of the pages
    /// get [`StorageError::Unmapped`] afterwards.
    pub fn close_and_unsafely_unmap(&self) -> StorageResult<()> {
        self.retire_pages();
        self.unmap_all();
        self.release_registration();
        Ok(())
    }

    /// Mark the storage closed and move its pages out of the page table.
    /// Returns false if it was already closed.
    fn retire_pages(&self) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }

        let released = {
            let mut retired = self.retired.lock();
            let before = retired.len();
            self.pages.retain(|_, page| {
                retired.push(Arc::downgrade(page));
                false
            });
            retired.len() - before
        };

        debug!(
            path = %self.path.display(),
            pages = released,
            "closed mapped storage"
        );
        true
    }

    /// Unmap every page this storage ever created that is still alive.
    fn unmap_all(&self) {
        let retired = std::mem::take(&mut *self.retired.lock());
        // Pages inserted by a lookup that raced with close
        let mut stragglers = Vec::new();
        self.pages.retain(|_, page| {
            stragglers.push(Arc::clone(page));
            false
        });

        let mut unmapped = 0usize;
        for page in retired
            .iter()
            .filter_map(Weak::upgrade)
            .chain(stragglers)
        {
            page.unmap();
            unmapped += 1;
        }

        debug!(path = %self.path.display(), unmapped, "unmapped mapped storage");
    }

    fn remove_files(&self) -> StorageResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.allocation_lock.delete()
    }

    /// Release the path for re-opening; decrements the open count at most once.
    fn release_registration(&self) {
        self.registration.lock().take();
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StorageError::Closed(self.path.clone()))
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ResourceBusy | ErrorKind::Interrupted | ErrorKind::WouldBlock
    )
}

impl Drop for MappedFileStorage {
    fn drop(&mut self) {
        if self.is_open() {
            warn!(path = %self.path.display(), "mapped storage dropped without close()");
            if let Err(e) = self.close() {
                warn!(path = %self.path.display(), error = %e, "failed to close on drop");
            }
        }
    }
}

impl fmt::Display for MappedFileStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MappedFileStorage[{}][pageSize: {}]",
            self.path.display(),
            self.page_size
        )
    }
}

impl fmt::Debug for MappedFileStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedFileStorage")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("file_length", &self.file_length.load(Ordering::Relaxed))
            .field("pages", &self.pages.len())
            .field("open", &self.is_open())
            .finish()
    }
}
