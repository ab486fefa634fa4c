//! Memory-mapped, page-oriented file storage.
//!
//! A foundation for on-disk indices and caches: one growable file, accessed through fixed-size
//! pages that are mapped into memory on demand and shared by every thread that asks for them.
//! File growth is page-aligned and guarded by a small allocation log so that a crash in the
//! middle of a resize is detected and reconciled on the next open.
//!
//! ```rust
//! use mapped_storage::MappedFileStorageFactory;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let storage = MappedFileStorageFactory::default()
//!     .page_size(4096)
//!     .open(dir.path().join("cache.dat"))
//!     .unwrap();
//!
//! let offset = 5000;
//! let page = storage.page_by_offset(offset).unwrap();
//! let buffer = page.raw_buffer().unwrap();
//! buffer.put_u32(storage.to_offset_in_page(offset), 42).unwrap();
//! assert_eq!(buffer.get_u32(904).unwrap(), 42);
//! drop(buffer);
//!
//! storage.fsync().unwrap();
//! storage.close_and_clean().unwrap();
//! ```

pub mod config;
pub mod error;
pub mod storage;

pub use config::{DEFAULT_PAGE_SIZE, IfNotPageAligned, MAX_PAGE_SIZE, StorageConfig};
pub use error::{StorageError, StorageResult};
pub use storage::{
    MappedFileStorage, MappedFileStorageFactory, Page, PageBuffer, Region,
    RegionAllocationAtomicityLock,
};
