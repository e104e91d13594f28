use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// A bucket of up to `capacity` key/value pairs, tagged with its local depth.
struct Bucket<K, V> {
    items: Vec<(K, V)>,
    capacity: usize,
    depth: usize,
}

impl<K: Eq + Clone, V: Clone> Bucket<K, V> {
    fn new(capacity: usize, depth: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
            depth,
        }
    }

    fn find(&self, key: &K) -> Option<V> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    fn remove(&mut self, key: &K) -> bool {
        if let Some(pos) = self.items.iter().position(|(k, _)| k == key) {
            self.items.remove(pos);
            true
        } else {
            false
        }
    }

    /// Upserts; returns false when the key is new and the bucket is full.
    fn insert(&mut self, key: K, value: V) -> bool {
        for (k, v) in self.items.iter_mut() {
            if *k == key {
                *v = value;
                return true;
            }
        }
        if self.items.len() >= self.capacity {
            return false;
        }
        self.items.push((key, value));
        true
    }
}

type BucketRef<K, V> = Arc<Mutex<Bucket<K, V>>>;

struct TableInner<K, V> {
    global_depth: usize,
    num_buckets: usize,
    /// Directory slots share buckets; a bucket of local depth d is pointed
    /// to by 2^(global_depth - d) slots.
    directory: Vec<BucketRef<K, V>>,
}

/// Extendible hash table addressed by the low `global_depth` bits of the
/// key's hash. A full bucket splits into two of one greater local depth,
/// doubling the directory when local depth catches up with global depth.
///
/// Every public operation, reads included, is serialised by one lock.
pub struct ExtendibleHashTable<K, V> {
    bucket_size: usize,
    inner: Mutex<TableInner<K, V>>,
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Creates a table with a one-slot directory holding a single depth-0
    /// bucket.
    pub fn new(bucket_size: usize) -> Self {
        assert!(bucket_size > 0, "bucket_size must be positive");
        Self {
            bucket_size,
            inner: Mutex::new(TableInner {
                global_depth: 0,
                num_buckets: 1,
                directory: vec![Arc::new(Mutex::new(Bucket::new(bucket_size, 0)))],
            }),
        }
    }

    fn hash_of(key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn index_of(key: &K, global_depth: usize) -> usize {
        let mask = (1u64 << global_depth) - 1;
        (Self::hash_of(key) & mask) as usize
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        let index = Self::index_of(key, inner.global_depth);
        let bucket = inner.directory[index].lock();
        bucket.find(key)
    }

    pub fn remove(&self, key: &K) -> bool {
        let inner = self.inner.lock();
        let index = Self::index_of(key, inner.global_depth);
        let mut bucket = inner.directory[index].lock();
        bucket.remove(key)
    }

    /// Inserts or overwrites; splits the target bucket (possibly repeatedly)
    /// until the pair fits.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();

        loop {
            let index = Self::index_of(&key, inner.global_depth);
            let bucket_ref = Arc::clone(&inner.directory[index]);

            if bucket_ref.lock().insert(key.clone(), value.clone()) {
                return;
            }

            // Bucket is full; split it.
            let local_depth = bucket_ref.lock().depth;

            if local_depth == inner.global_depth {
                // Double the directory: each new high-half slot aliases its
                // low-half twin.
                let length = inner.directory.len();
                for i in 0..length {
                    let twin = Arc::clone(&inner.directory[i]);
                    inner.directory.push(twin);
                }
                inner.global_depth += 1;
                debug!(global_depth = inner.global_depth, "doubled hash directory");
            }

            let new_depth = local_depth + 1;
            let bucket0 = Arc::new(Mutex::new(Bucket::new(self.bucket_size, new_depth)));
            let bucket1 = Arc::new(Mutex::new(Bucket::new(self.bucket_size, new_depth)));

            // Rehash the overflowed bucket: bit (new_depth - 1) routes each
            // entry to bucket1 or bucket0.
            {
                let old_bucket = bucket_ref.lock();
                for (k, v) in old_bucket.items.iter() {
                    let hash = Self::hash_of(k);
                    if (hash >> (new_depth - 1)) & 1 == 1 {
                        bucket1.lock().insert(k.clone(), v.clone());
                    } else {
                        bucket0.lock().insert(k.clone(), v.clone());
                    }
                }
            }

            // Repoint every slot that aliased the old bucket according to the
            // same bit of the slot index.
            for i in 0..inner.directory.len() {
                if Arc::ptr_eq(&inner.directory[i], &bucket_ref) {
                    if (i >> (new_depth - 1)) & 1 == 1 {
                        inner.directory[i] = Arc::clone(&bucket1);
                    } else {
                        inner.directory[i] = Arc::clone(&bucket0);
                    }
                }
            }

            inner.num_buckets += 1;
            // Retry the insert against the split table.
        }
    }

    pub fn global_depth(&self) -> usize {
        self.inner.lock().global_depth
    }

    pub fn num_buckets(&self) -> usize {
        self.inner.lock().num_buckets
    }

    /// Local depth of the bucket at the given directory slot.
    pub fn local_depth(&self, dir_index: usize) -> usize {
        let inner = self.inner.lock();
        if dir_index >= inner.directory.len() {
            return 0;
        }
        let depth = inner.directory[dir_index].lock().depth;
        depth
    }
}
