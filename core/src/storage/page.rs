//! Page handles over a memory-mapped file.
//!
//! Every page owns its own mapping of exactly `page_size` bytes, so growing the file never
//! moves or invalidates pages that were already handed out. A page is shared (`Arc<Page>`) by
//! all callers that resolved the same index; writes through one holder are immediately visible
//! to every other holder because they all address the same mapped memory.

use std::fmt;
use std::fs::File;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64};

use memmap2::{MmapOptions, MmapRaw};
use parking_lot::{RwLock, RwLockReadGuard};

use crate::error::{StorageError, StorageResult};

/// A fixed-size, page-aligned slice of the storage file.
pub struct Page {
    index: u64,
    page_size: usize,
    /// `None` once the page has been forcibly unmapped.
    mapping: RwLock<Option<MmapRaw>>,
}

impl Page {
    /// Map page `index` of `file`. The file must already be long enough to cover it.
    pub(crate) fn map(file: &File, index: u64, page_size: usize) -> StorageResult<Self> {
        let offset = index
            .checked_mul(page_size as u64)
            .ok_or_else(|| StorageError::OutOfBounds(format!("page index {index} overflows")))?;

        let mapping = MmapOptions::new()
            .offset(offset)
            .len(page_size)
            .map_raw(file)?;

        Ok(Self {
            index,
            page_size,
            mapping: RwLock::new(Some(mapping)),
        })
    }

    /// Page index within the file.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Offset of the first byte of this page within the file.
    pub fn offset_in_file(&self) -> u64 {
        self.index * self.page_size as u64
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether the mapping is still present.
    pub fn is_mapped(&self) -> bool {
        self.mapping.read_recursive().is_some()
    }

    /// Get the byte view of this page.
    ///
    /// The returned guard keeps the mapping alive; a forced unmap waits until every
    /// outstanding buffer is dropped.
    pub fn raw_buffer(&self) -> StorageResult<PageBuffer<'_>> {
        let guard = self.mapping.read_recursive();
        if guard.is_none() {
            return Err(StorageError::Unmapped(self.index));
        }
        Ok(PageBuffer {
            index: self.index,
            mapping: guard,
        })
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> StorageResult<()> {
        self.raw_buffer()?.read(offset, buf)
    }

    /// Copy `data` into the page starting at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> StorageResult<()> {
        self.raw_buffer()?.write(offset, data)
    }

    /// Synchronously flush this page's dirty bytes to the file.
    pub fn flush(&self) -> std::io::Result<()> {
        match self.mapping.read_recursive().as_ref() {
            Some(mapping) => mapping.flush(),
            None => Ok(()),
        }
    }

    /// Drop the mapping now. Subsequent buffer requests fail with [`StorageError::Unmapped`].
    pub(crate) fn unmap(&self) {
        self.mapping.write().take();
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("index", &self.index)
            .field("page_size", &self.page_size)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// Borrowed view of one page's bytes.
///
/// All accessors are bounds-checked against the page size. Concurrent writers to the same
/// bytes must coordinate themselves; the storage applies no per-byte locking.
pub struct PageBuffer<'a> {
    index: u64,
    mapping: RwLockReadGuard<'a, Option<MmapRaw>>,
}

impl PageBuffer<'_> {
    fn raw(&self) -> &MmapRaw {
        // Checked by Page::raw_buffer before the guard is handed out
        match self.mapping.as_ref() {
            Some(mapping) => mapping,
            None => unreachable!("page buffer over unmapped page"),
        }
    }

    fn check_range(&self, offset: usize, len: usize) -> StorageResult<Range<usize>> {
        let end = offset.checked_add(len).filter(|&end| end <= self.len());
        match end {
            Some(end) => Ok(offset..end),
            None => Err(StorageError::OutOfBounds(format!(
                "range {offset}+{len} outside page {} of size {}",
                self.index,
                self.len()
            ))),
        }
    }

    /// Page size in bytes.
    pub fn len(&self) -> usize {
        self.raw().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.raw().as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.raw().as_mut_ptr()
    }

    /// Copy bytes out of the page.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> StorageResult<()> {
        let range = self.check_range(offset, buf.len())?;
        // SAFETY: range is within the live mapping; buf is a distinct allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.as_ptr().add(range.start),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Copy bytes into the page.
    pub fn write(&self, offset: usize, data: &[u8]) -> StorageResult<()> {
        let range = self.check_range(offset, data.len())?;
        // SAFETY: range is within the live mapping; data is a distinct allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.as_mut_ptr().add(range.start),
                data.len(),
            );
        }
        Ok(())
    }

    /// Set every byte in `range` to `value`.
    pub fn fill(&self, range: Range<usize>, value: u8) -> StorageResult<()> {
        if range.start > range.end {
            return Err(StorageError::InvalidInput(format!(
                "inverted range {}..{}",
                range.start, range.end
            )));
        }
        let range = self.check_range(range.start, range.end - range.start)?;
        // SAFETY: range is within the live mapping.
        unsafe {
            std::ptr::write_bytes(self.as_mut_ptr().add(range.start), value, range.len());
        }
        Ok(())
    }

    /// Zero every byte in `range`.
    pub fn zero(&self, range: Range<usize>) -> StorageResult<()> {
        self.fill(range, 0)
    }

    /// Copy the whole page into a new vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len()];
        // SAFETY: out has exactly len() bytes
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr(), out.as_mut_ptr(), out.len());
        }
        out
    }

    pub fn get_u32(&self, offset: usize) -> StorageResult<u32> {
        let mut bytes = [0u8; 4];
        self.read(offset, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn put_u32(&self, offset: usize, value: u32) -> StorageResult<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn get_u64(&self, offset: usize) -> StorageResult<u64> {
        let mut bytes = [0u8; 8];
        self.read(offset, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn put_u64(&self, offset: usize, value: u64) -> StorageResult<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// View 4 bytes at `offset` as an atomic, for lock-free counters and headers.
    /// `offset` must be 4-byte aligned.
    pub fn atomic_u32(&self, offset: usize) -> StorageResult<&AtomicU32> {
        let range = self.check_range(offset, 4)?;
        // SAFETY: in bounds, alignment checked below, mapping outlives the guard borrow.
        let ptr = unsafe { self.as_mut_ptr().add(range.start) };
        if ptr as usize % align_of::<AtomicU32>() != 0 {
            return Err(StorageError::InvalidInput(format!(
                "offset {offset} is not 4-byte aligned"
            )));
        }
        Ok(unsafe { AtomicU32::from_ptr(ptr.cast()) })
    }

    /// View 8 bytes at `offset` as an atomic. `offset` must be 8-byte aligned.
    pub fn atomic_u64(&self, offset: usize) -> StorageResult<&AtomicU64> {
        let range = self.check_range(offset, 8)?;
        // SAFETY: in bounds, alignment checked below, mapping outlives the guard borrow.
        let ptr = unsafe { self.as_mut_ptr().add(range.start) };
        if ptr as usize % align_of::<AtomicU64>() != 0 {
            return Err(StorageError::InvalidInput(format!(
                "offset {offset} is not 8-byte aligned"
            )));
        }
        Ok(unsafe { AtomicU64::from_ptr(ptr.cast()) })
    }

    /// Get a slice view of the page.
    ///
    /// # Safety
    /// No other holder of this page may write the viewed bytes while the slice is alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }

    /// Get a mutable slice view of the page.
    ///
    /// # Safety
    /// No other holder of this page may read or write the viewed bytes while the slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.len()) }
    }
}
