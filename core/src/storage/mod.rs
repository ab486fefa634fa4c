//! Memory-mapped page storage.
//!
//! The factory opens a storage, the storage hands out pages, and the allocation lock makes
//! file growth recoverable after a crash.

mod factory;
mod mapped;
mod page;
mod region_lock;
mod registry;

#[cfg(test)]
mod tests;

// Re-exports
pub use factory::MappedFileStorageFactory;
pub use mapped::MappedFileStorage;
pub use page::{Page, PageBuffer};
pub use region_lock::{LOCK_FILE_SUFFIX, Region, RegionAllocationAtomicityLock};
