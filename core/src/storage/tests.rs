//! Storage-level behaviour: lifecycle, concurrency, zeroing and alignment policies.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;

use pretty_assertions::assert_eq;
use tempfile::tempdir;

use super::test_support;
use super::*;
use crate::{IfNotPageAligned, StorageError};

const PAGE: usize = 4096;

fn open(path: &Path) -> MappedFileStorage {
    MappedFileStorageFactory::default()
        .page_size(PAGE)
        .open(path)
        .unwrap()
}

fn page_bytes(storage: &MappedFileStorage, index: u64) -> Vec<u8> {
    let page = storage.page_by_index(index).unwrap();
    page.raw_buffer().unwrap().to_vec()
}

#[test]
fn test_fresh_pages_are_zero() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let storage = open(&dir.path().join("zero.dat"));

    for index in [0u64, 1, 5, 17] {
        let page = storage.page_by_index(index).unwrap();
        let bytes = page.raw_buffer().unwrap().to_vec();
        assert_eq!(bytes.len(), PAGE);
        assert!(bytes.iter().all(|&b| b == 0), "page {index} not zeroed");
    }
    assert_eq!(storage.actual_file_size().unwrap(), 18 * PAGE as u64);
    storage.close().unwrap();
}

#[test]
fn test_offset_math() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let storage = open(&dir.path().join("math.dat"));

    assert_eq!(storage.page_index_by_offset(0), 0);
    assert_eq!(storage.page_index_by_offset(PAGE as u64 - 1), 0);
    assert_eq!(storage.page_index_by_offset(PAGE as u64), 1);
    assert_eq!(storage.to_offset_in_page(PAGE as u64 * 3 + 17), 17);
    assert_eq!(storage.to_offset_in_page(PAGE as u64 - 1), PAGE - 1);

    let page = storage.page_by_offset(PAGE as u64 * 2 + 5).unwrap();
    assert_eq!(page.index(), 2);
    assert_eq!(page.offset_in_file(), 2 * PAGE as u64);
    storage.close().unwrap();
}

#[test]
fn test_zeroize_region_exact_bounds() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let storage = open(&dir.path().join("zeroize.dat"));
    let pages = 4u64;
    let total = pages * PAGE as u64;

    for index in 0..pages {
        let page = storage.page_by_index(index).unwrap();
        page.raw_buffer().unwrap().fill(0..PAGE, 0xFF).unwrap();
    }

    // Spans pages 0..=2, starting and ending mid-page
    let start = PAGE as u64 - 10;
    let end = 2 * PAGE as u64 + 20;
    storage.zeroize_region(start, end).unwrap();

    for offset in 0..total {
        let page = storage.page_by_offset(offset).unwrap();
        let mut byte = [0u8; 1];
        page.read_bytes(storage.to_offset_in_page(offset), &mut byte).unwrap();
        let expected = if (start..=end).contains(&offset) { 0 } else { 0xFF };
        assert_eq!(byte[0], expected, "byte at offset {offset}");
    }
    storage.close().unwrap();
}

#[test]
fn test_zeroize_single_byte_and_inverted_range() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let storage = open(&dir.path().join("single.dat"));

    let page = storage.page_by_index(0).unwrap();
    page.raw_buffer().unwrap().fill(0..PAGE, 0x11).unwrap();
    storage.zeroize_region(100, 100).unwrap();

    let bytes = page.raw_buffer().unwrap().to_vec();
    assert_eq!(&bytes[99..102], &[0x11, 0, 0x11]);
    assert!(matches!(
        storage.zeroize_region(10, 9),
        Err(StorageError::InvalidInput(_))
    ));
    storage.close().unwrap();
}

#[test]
fn test_zeroize_till_eof() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let storage = open(&dir.path().join("eof.dat"));

    for index in 0..2 {
        let page = storage.page_by_index(index).unwrap();
        page.raw_buffer().unwrap().fill(0..PAGE, 0x5A).unwrap();
    }
    storage.zeroize_till_eof(PAGE as u64 + 1).unwrap();
    // Past EOF: nothing to do, and the file must not grow
    storage.zeroize_till_eof(10 * PAGE as u64).unwrap();

    let second = page_bytes(&storage, 1);
    assert_eq!(second[0], 0x5A);
    assert!(second[1..].iter().all(|&b| b == 0));
    assert_eq!(storage.actual_file_size().unwrap(), 2 * PAGE as u64);
    storage.close().unwrap();
}

#[test]
fn test_page_identity_under_race() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let storage = Arc::new(open(&dir.path().join("race.dat")));

    const THREADS: usize = 8;
    const PAGES: u64 = 64;
    let barrier = Barrier::new(THREADS);

    let seen: Vec<Vec<Arc<Page>>> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let storage = Arc::clone(&storage);
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    // Alternate direction so threads collide on first access from both ends
                    let mut pages: Vec<Arc<Page>> = Vec::with_capacity(PAGES as usize);
                    let indices: Vec<u64> = if t % 2 == 0 {
                        (0..PAGES).collect()
                    } else {
                        (0..PAGES).rev().collect()
                    };
                    for index in indices {
                        pages.push(storage.page_by_index(index).unwrap());
                    }
                    pages.sort_by_key(|p| p.index());
                    pages
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for index in 0..PAGES as usize {
        let first = &seen[0][index];
        for pages in &seen[1..] {
            assert!(Arc::ptr_eq(first, &pages[index]), "page {index} differs");
        }
    }
    assert_eq!(storage.mapped_pages_count(), PAGES as usize);
    // Racing growths never overshoot, and every one of them was resolved
    assert_eq!(storage.actual_file_size().unwrap(), PAGES * PAGE as u64);
    let lock = RegionAllocationAtomicityLock::default_lock(storage.storage_path()).unwrap();
    assert!(lock.unfinished_regions().is_empty());
    storage.close().unwrap();
}

#[test]
fn test_concurrent_writers_on_distinct_pages() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let storage = Arc::new(open(&dir.path().join("writers.dat")));

    thread::scope(|s| {
        for t in 0..4u64 {
            let storage = Arc::clone(&storage);
            s.spawn(move || {
                for i in 0..16u64 {
                    let index = i * 4 + t;
                    let page = storage.page_by_index(index).unwrap();
                    let buffer = page.raw_buffer().unwrap();
                    buffer.put_u64(0, index * 1000).unwrap();
                }
            });
        }
    });

    for index in 0..64u64 {
        let page = storage.page_by_index(index).unwrap();
        assert_eq!(page.raw_buffer().unwrap().get_u64(0).unwrap(), index * 1000);
    }
    storage.close().unwrap();
}

#[test]
fn test_single_open_per_path() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let path = dir.path().join("single-open.dat");

    let first = open(&path);
    assert!(MappedFileStorage::is_path_open(&path));
    match MappedFileStorageFactory::default()
        .page_size(PAGE)
        .open(&path)
    {
        Err(StorageError::AlreadyOpen(p)) => assert_eq!(p, fs::canonicalize(&path).unwrap()),
        other => panic!("expected AlreadyOpen, got {other:?}"),
    }

    first.close().unwrap();
    let second = open(&path);
    assert!(second.is_open());
    second.close().unwrap();
}

#[test]
fn test_close_and_clean_removes_file() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let path = dir.path().join("clean.dat");

    let storage = open(&path);
    let page = storage.page_by_index(3).unwrap();
    page.write_bytes(0, b"gone").unwrap();
    let lock_path = RegionAllocationAtomicityLock::lock_path_for(storage.storage_path());
    storage.close_and_clean().unwrap();

    assert!(!path.exists());
    assert!(!lock_path.exists());
    assert!(!storage.is_open());
}

#[test]
fn test_opened_storages_count() {
    let _guard = test_support::exclusive();
    let dir = tempdir().unwrap();
    let baseline = MappedFileStorage::opened_storages_count();

    let a = open(&dir.path().join("a.dat"));
    let b = open(&dir.path().join("b.dat"));
    let c = open(&dir.path().join("c.dat"));
    assert_eq!(MappedFileStorage::opened_storages_count(), baseline + 3);

    a.close().unwrap();
    assert_eq!(MappedFileStorage::opened_storages_count(), baseline + 2);
    a.close().unwrap();
    assert_eq!(MappedFileStorage::opened_storages_count(), baseline + 2);

    b.close_and_clean().unwrap();
    assert_eq!(MappedFileStorage::opened_storages_count(), baseline + 1);

    c.close().unwrap();
    c.close_and_unsafely_unmap().unwrap();
    assert_eq!(MappedFileStorage::opened_storages_count(), baseline);

    // Failed opens never count
    let _ = MappedFileStorageFactory::default()
        .open(dir.path().join("d.dat"))
        .unwrap_err();
    assert_eq!(MappedFileStorage::opened_storages_count(), baseline);

    // Dropping without close releases the registration too
    drop(open(&dir.path().join("e.dat")));
    assert_eq!(MappedFileStorage::opened_storages_count(), baseline);
}

#[test]
fn test_closed_storage_rejects_access() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let storage = open(&dir.path().join("closed.dat"));
    let page = storage.page_by_index(0).unwrap();
    page.write_bytes(0, b"still mapped").unwrap();

    storage.close().unwrap();
    assert!(matches!(storage.page_by_index(0), Err(StorageError::Closed(_))));
    assert!(matches!(storage.fsync(), Err(StorageError::Closed(_))));
    assert!(matches!(storage.zeroize_region(0, 1), Err(StorageError::Closed(_))));

    // The holder keeps the mapping alive until it lets go, or until a forced unmap
    let mut out = [0u8; 12];
    page.read_bytes(0, &mut out).unwrap();
    assert_eq!(&out, b"still mapped");

    storage.close_and_unsafely_unmap().unwrap();
    assert!(matches!(page.raw_buffer(), Err(StorageError::Unmapped(0))));
}

#[test]
fn test_data_survives_reopen() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let path = dir.path().join("reopen.dat");

    {
        let storage = open(&path);
        storage
            .page_by_offset(3 * PAGE as u64 + 8)
            .unwrap()
            .write_bytes(8, b"persisted")
            .unwrap();
        storage.fsync().unwrap();
        storage.close().unwrap();
    }

    let storage = open(&path);
    assert_eq!(storage.actual_file_size().unwrap(), 4 * PAGE as u64);
    let mut out = [0u8; 9];
    let page = storage.page_by_index(3).unwrap();
    page.read_bytes(8, &mut out).unwrap();
    assert_eq!(&out, b"persisted");
    storage.close().unwrap();
}

#[test]
fn test_fsync_keeps_written_data() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let storage = open(&dir.path().join("fsync.dat"));

    for index in 0..8u64 {
        let page = storage.page_by_index(index).unwrap();
        let buffer = page.raw_buffer().unwrap();
        buffer.fill(0..PAGE, index as u8 + 1).unwrap();
    }

    storage.fsync().unwrap();
    storage.fsync().unwrap();

    for index in 0..8u64 {
        let bytes = page_bytes(&storage, index);
        assert!(bytes.iter().all(|&b| b == index as u8 + 1));
    }
    storage.close().unwrap();
}

#[test]
fn test_failed_growth_leaves_region_unfinished() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let storage = open(&dir.path().join("failed-growth.dat"));
    let page = storage.page_by_index(0).unwrap();
    page.write_bytes(0, b"low").unwrap();

    // The required length exceeds what the file system accepts, so set_len fails
    let huge = 1u64 << 51;
    let required = (huge + 1) * PAGE as u64;
    assert!(matches!(storage.page_by_index(huge), Err(StorageError::Io(_))));
    assert_eq!(storage.actual_file_size().unwrap(), PAGE as u64);

    let lock = RegionAllocationAtomicityLock::default_lock(storage.storage_path()).unwrap();
    assert_eq!(
        lock.unfinished_regions(),
        vec![(PAGE as u64, required - PAGE as u64)]
    );
    drop(lock);

    // Lower pages are unaffected
    let mut out = [0u8; 3];
    let page = storage.page_by_index(0).unwrap();
    page.read_bytes(0, &mut out).unwrap();
    assert_eq!(&out, b"low");

    // The next successful growth overlaps the failed range and resolves it
    storage.page_by_index(1).unwrap();
    let lock = RegionAllocationAtomicityLock::default_lock(storage.storage_path()).unwrap();
    assert!(lock.unfinished_regions().is_empty());
    storage.close().unwrap();
}

#[test]
fn test_close_and_clean_races_with_reopen() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let path = dir.path().join("handover.dat");

    for round in 0..20 {
        let old = open(&path);
        let page = old.page_by_index(1).unwrap();
        page.write_bytes(0, b"old").unwrap();
        let barrier = Barrier::new(2);

        let new = thread::scope(|s| {
            s.spawn(|| {
                barrier.wait();
                old.close_and_clean().unwrap();
            });
            let reopen = s.spawn(|| {
                barrier.wait();
                loop {
                    match MappedFileStorageFactory::default()
                        .page_size(PAGE)
                        .open(&path)
                    {
                        Ok(storage) => return storage,
                        Err(StorageError::AlreadyOpen(_)) => thread::yield_now(),
                        Err(e) => panic!("round {round}: unexpected open error {e}"),
                    }
                }
            });
            reopen.join().unwrap()
        });

        // The new owner only got the path once the old files were gone
        assert!(path.exists(), "round {round}: file removed under the new owner");
        assert_eq!(new.actual_file_size().unwrap(), 0);
        let page = new.page_by_index(0).unwrap();
        page.write_bytes(0, b"new").unwrap();
        new.close_and_clean().unwrap();
    }
}

fn write_unaligned_file(path: &Path) {
    fs::write(path, vec![0x42u8; 3 * PAGE + 1]).unwrap();
}

#[test]
fn test_alignment_throw_exception() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let path = dir.path().join("throw.dat");
    write_unaligned_file(&path);

    let result = MappedFileStorageFactory::default()
        .page_size(PAGE)
        .if_file_is_not_page_aligned(IfNotPageAligned::ThrowException)
        .open(&path);
    assert!(matches!(result, Err(StorageError::NotPageAligned { .. })));
    assert_eq!(fs::metadata(&path).unwrap().len(), 3 * PAGE as u64 + 1);
}

#[test]
fn test_alignment_expand_file() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let path = dir.path().join("expand.dat");
    write_unaligned_file(&path);

    let storage = MappedFileStorageFactory::default()
        .page_size(PAGE)
        .if_file_is_not_page_aligned(IfNotPageAligned::ExpandFile)
        .open(&path)
        .unwrap();
    assert_eq!(storage.actual_file_size().unwrap(), 4 * PAGE as u64);

    let last = page_bytes(&storage, 3);
    assert_eq!(last[0], 0x42);
    assert!(last[1..].iter().all(|&b| b == 0));
    storage.close().unwrap();
}

#[test]
fn test_alignment_clean() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let path = dir.path().join("clean-policy.dat");
    write_unaligned_file(&path);

    let storage = MappedFileStorageFactory::default()
        .page_size(PAGE)
        .if_file_is_not_page_aligned(IfNotPageAligned::Clean)
        .open(&path)
        .unwrap();
    assert_eq!(storage.actual_file_size().unwrap(), 0);
    storage.close().unwrap();
}

#[test]
fn test_alignment_throw_exception_recovers_interrupted_growth() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let path = dir.path().join("interrupted.dat");
    write_unaligned_file(&path);

    let lock = RegionAllocationAtomicityLock::default_lock(&path).unwrap();
    lock.region(3 * PAGE as u64, PAGE as u64).start().unwrap();
    drop(lock);

    let storage = MappedFileStorageFactory::default()
        .page_size(PAGE)
        .if_file_is_not_page_aligned(IfNotPageAligned::ThrowException)
        .open(&path)
        .unwrap();
    assert_eq!(storage.actual_file_size().unwrap(), 4 * PAGE as u64);

    // The unfinished page reads as zero, earlier pages are untouched
    let last = page_bytes(&storage, 3);
    assert!(last.iter().all(|&b| b == 0));
    let first = page_bytes(&storage, 0);
    assert!(first.iter().all(|&b| b == 0x42));
    storage.close().unwrap();

    // Reconciled: a second open finds nothing to recover
    let lock = RegionAllocationAtomicityLock::default_lock(&path).unwrap();
    assert!(lock.unfinished_regions().is_empty());
}

#[test]
fn test_growth_leaves_no_unfinished_regions() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let path = dir.path().join("growth.dat");

    let storage = open(&path);
    for offset in (0..10 * PAGE as u64).step_by(PAGE / 2) {
        storage.page_by_offset(offset).unwrap();
    }
    storage.close().unwrap();

    let lock = RegionAllocationAtomicityLock::default_lock(&path).unwrap();
    assert!(lock.unfinished_regions().is_empty());
    assert_eq!(fs::metadata(lock.lock_file_path()).unwrap().len(), 0);
}

#[test]
fn test_distinct_pages_per_storage_instance() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let path = dir.path().join("instances.dat");

    let first = open(&path);
    let page = first.page_by_index(0).unwrap();
    page.write_bytes(0, b"v1").unwrap();
    first.close().unwrap();

    let second = open(&path);
    let again = second.page_by_index(0).unwrap();
    assert!(!Arc::ptr_eq(&page, &again));
    let mut out = [0u8; 2];
    again.read_bytes(0, &mut out).unwrap();
    assert_eq!(&out, b"v1");

    let indices: HashSet<u64> = (0..4)
        .map(|i| second.page_by_index(i).unwrap().index())
        .collect();
    assert_eq!(indices.len(), 4);
    second.close().unwrap();
}

#[test]
fn test_display() {
    let _guard = test_support::shared();
    let dir = tempdir().unwrap();
    let storage = open(&dir.path().join("display.dat"));
    let shown = storage.to_string();
    assert!(shown.starts_with("MappedFileStorage["));
    assert!(shown.ends_with("[pageSize: 4096]"));
    storage.close().unwrap();
}
