use std::sync::atomic::Ordering;
use std::sync::Arc;

use plume_db::buffer::BufferPoolManager;
use plume_db::storage::disk_manager::DiskManager;
use plume_db::storage::disk_scheduler::DiskScheduler;
use plume_db::storage::index::comparator::default_comparator;
use plume_db::storage::index::{BPlusTreeIndex, TreeIndexIterator};
use plume_db::storage::page::RecordId;
use rand::seq::SliceRandom;
use tempfile::TempDir;

fn setup(pool_size: usize) -> (TempDir, Arc<BufferPoolManager>) {
    let temp_dir = TempDir::new().unwrap();
    let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
    let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, disk_scheduler));
    (temp_dir, buffer_pool)
}

fn key(i: u32) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

fn rid(i: u32) -> RecordId {
    RecordId::new(i, i)
}

/// Mixed workload through the whole stack: disk manager, scheduler,
/// buffer pool with eviction pressure, and the tree on top.
#[test]
fn tree_survives_eviction_pressure() {
    const KEYS: u32 = 500;
    // far fewer frames than tree pages, so leaves cycle through disk
    let (_temp_dir, buffer_pool) = setup(16);
    let index = Arc::new(BPlusTreeIndex::new(
        "stress",
        buffer_pool,
        default_comparator,
        8,
        8,
    ));

    let mut keys: Vec<u32> = (1..=KEYS).collect();
    keys.shuffle(&mut rand::thread_rng());
    for &i in &keys {
        assert!(index.insert(&key(i), rid(i)).unwrap());
    }

    for i in 1..=KEYS {
        assert_eq!(index.get_value(&key(i)).unwrap(), Some(rid(i)));
    }

    // full scan comes back sorted and complete
    let mut iterator = TreeIndexIterator::begin(index.clone()).unwrap();
    let mut previous = None;
    let mut count = 0;
    while let Some((k, _)) = iterator.next().unwrap() {
        if let Some(ref p) = previous {
            assert!(p < &k, "leaf chain out of order");
        }
        previous = Some(k);
        count += 1;
    }
    assert_eq!(count, KEYS);

    // delete a random half, then verify membership exactly
    keys.shuffle(&mut rand::thread_rng());
    let (gone, kept) = keys.split_at(keys.len() / 2);
    for &i in gone {
        index.remove(&key(i)).unwrap();
    }
    for &i in gone {
        assert_eq!(index.get_value(&key(i)).unwrap(), None);
    }
    for &i in kept {
        assert_eq!(index.get_value(&key(i)).unwrap(), Some(rid(i)));
    }
}

#[test]
fn header_page_survives_reopen() {
    let (_temp_dir, buffer_pool) = setup(32);
    let header_page_id = BPlusTreeIndex::create_header_page(&buffer_pool).unwrap();

    let index = BPlusTreeIndex::new(
        "accounts_pk",
        buffer_pool.clone(),
        default_comparator,
        4,
        4,
    )
    .with_header(header_page_id)
    .unwrap();
    for i in 1u32..=50 {
        index.insert(&key(i), rid(i)).unwrap();
    }
    let root = index.root_page_id.load(Ordering::SeqCst);
    drop(index);

    // a new handle picks up the recorded root and sees the same data
    let reopened = BPlusTreeIndex::new(
        "accounts_pk",
        buffer_pool,
        default_comparator,
        4,
        4,
    )
    .with_header(header_page_id)
    .unwrap();
    assert_eq!(reopened.root_page_id.load(Ordering::SeqCst), root);
    for i in 1u32..=50 {
        assert_eq!(reopened.get_value(&key(i)).unwrap(), Some(rid(i)));
    }
}
