use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};

/// In-memory extendible hash table behind one coarse latch. Directory
/// growth is rare and the buffer pool only stores page metadata here, so a
/// single mutex over the whole structure is enough.
///
/// Directory slots hold indices into a bucket arena, so several slots can
/// reference the same bucket while its local depth trails the global depth.
#[derive(Debug)]
pub struct ExtendibleHashTable<K, V, S = RandomState> {
    bucket_size: usize,
    hash_builder: S,
    dir: Mutex<Directory<K, V>>,
}

#[derive(Debug)]
struct Directory<K, V> {
    global_depth: usize,
    num_buckets: usize,
    slots: Vec<usize>,
    buckets: Vec<Bucket<K, V>>,
}

#[derive(Debug)]
struct Bucket<K, V> {
    local_depth: usize,
    items: Vec<(K, V)>,
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    pub fn new(bucket_size: usize) -> Self {
        Self::with_hasher(bucket_size, RandomState::new())
    }
}

impl<K, V, S> ExtendibleHashTable<K, V, S>
where
    K: Hash + Eq,
    V: Clone,
    S: BuildHasher,
{
    pub fn with_hasher(bucket_size: usize, hash_builder: S) -> Self {
        assert!(bucket_size > 0, "bucket size must be positive");
        Self {
            bucket_size,
            hash_builder,
            dir: Mutex::new(Directory {
                global_depth: 0,
                num_buckets: 1,
                slots: vec![0],
                buckets: vec![Bucket {
                    local_depth: 0,
                    items: Vec::new(),
                }],
            }),
        }
    }

    fn hash_of(&self, key: &K) -> usize {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        hasher.finish() as usize
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let dir = self.dir.lock();
        let slot = dir.slots[self.hash_of(key) & ((1usize << dir.global_depth) - 1)];
        dir.buckets[slot]
            .items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn remove(&self, key: &K) -> bool {
        let mut dir = self.dir.lock();
        let slot = dir.slots[self.hash_of(key) & ((1usize << dir.global_depth) - 1)];
        let bucket = &mut dir.buckets[slot];
        if let Some(pos) = bucket.items.iter().position(|(k, _)| k == key) {
            bucket.items.remove(pos);
            true
        } else {
            false
        }
    }

    /// Insert or overwrite. A full bucket either splits (its depth trails
    /// the directory) or forces the directory to double first; one insert
    /// can cascade through several splits when every item lands on the same
    /// side.
    pub fn insert(&self, key: K, value: V) {
        let mut guard = self.dir.lock();
        let dir = &mut *guard;
        loop {
            let index = self.hash_of(&key) & ((1usize << dir.global_depth) - 1);
            let slot = dir.slots[index];
            let bucket = &mut dir.buckets[slot];
            if let Some(entry) = bucket.items.iter_mut().find(|(k, _)| *k == key) {
                entry.1 = value;
                return;
            }
            if bucket.items.len() < self.bucket_size {
                bucket.items.push((key, value));
                return;
            }
            if bucket.local_depth == dir.global_depth {
                // new upper half of the directory mirrors the lower half
                let mirrored = dir.slots.clone();
                dir.slots.extend(mirrored);
                dir.global_depth += 1;
            } else {
                self.split_bucket(dir, index);
            }
        }
    }

    fn split_bucket(&self, dir: &mut Directory<K, V>, index: usize) {
        let slot = dir.slots[index];
        dir.buckets[slot].local_depth += 1;
        let depth = dir.buckets[slot].local_depth;
        let low_bits = index & ((1usize << (depth - 1)) - 1);

        // redistribute by the newly significant hash bit
        let mut sibling = Bucket {
            local_depth: depth,
            items: Vec::new(),
        };
        let items = std::mem::take(&mut dir.buckets[slot].items);
        for (k, v) in items {
            if self.hash_of(&k) & ((1usize << depth) - 1) == low_bits {
                dir.buckets[slot].items.push((k, v));
            } else {
                sibling.items.push((k, v));
            }
        }
        let sibling_slot = dir.buckets.len();
        dir.buckets.push(sibling);
        dir.num_buckets += 1;

        // rewire directory entries that match the old low bits but differ
        // in the new bit
        let half_mask = (1usize << (depth - 1)) - 1;
        let full_mask = (1usize << depth) - 1;
        for i in 0..dir.slots.len() {
            if i & half_mask == low_bits && i & full_mask != low_bits {
                dir.slots[i] = sibling_slot;
            }
        }
    }

    pub fn global_depth(&self) -> usize {
        self.dir.lock().global_depth
    }

    pub fn local_depth(&self, dir_index: usize) -> usize {
        let dir = self.dir.lock();
        dir.buckets[dir.slots[dir_index]].local_depth
    }

    pub fn num_buckets(&self) -> usize {
        self.dir.lock().num_buckets
    }

    /// Snapshot of every stored pair, in no particular order.
    pub fn entries(&self) -> Vec<(K, V)>
    where
        K: Clone,
    {
        let dir = self.dir.lock();
        dir.buckets
            .iter()
            .flat_map(|b| b.items.iter().cloned())
            .collect()
    }

    #[cfg(test)]
    fn bucket_of(&self, dir_index: usize) -> usize {
        self.dir.lock().slots[dir_index]
    }
}
