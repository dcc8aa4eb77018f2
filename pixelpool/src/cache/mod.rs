//! Reference-counted buffer cache with LRU eviction and storage reuse.
//!
//! The [`BufferCache`] maps request keys to [`PooledBuffer`]s. Checkout and
//! insert hand back a [`BufferLease`] that pins the entry; dropping the
//! lease releases the reference. Entries with a nonzero reference count are
//! never evicted, so the configured byte budget is a soft target: when
//! every resident entry is pinned, an insert is still admitted and the
//! cache temporarily runs over budget.
//!
//! Evicted, unreferenced storage goes into a bounded free pool that decode
//! workers draw from to reuse allocations ([`StorageRecycler`]).
//!
//! The internal table is guarded by one mutex, held only for the duration
//! of a table mutation — never across a decode call or an observer
//! notification.

mod stats;
mod types;

pub use stats::CacheStats;
pub use types::CacheError;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::buffer::{Dimensions, PooledBuffer};
use crate::request::RequestKey;

/// Source of reusable pixel storage for decode workers.
///
/// Implemented by [`BufferCache`]; injected into the decode executor so the
/// executor never depends on a concrete cache type.
pub trait StorageRecycler: Send + Sync {
    /// Takes a storage allocation large enough for `dims`, if one is
    /// available.
    fn reclaim(&self, dims: Dimensions) -> Option<Vec<u8>>;
}

struct Entry {
    buffer: PooledBuffer,
    last_used: u64,
}

struct Table<K> {
    entries: HashMap<K, Entry>,
    /// Monotonic recency clock, bumped on every checkout and insert.
    tick: u64,
    resident_bytes: usize,
    free_pool: VecDeque<Vec<u8>>,
}

impl<K: RequestKey> Table<K> {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Evicts least-recently-used zero-refcount entries until the residency
    /// plus `incoming` fits the budget, or nothing evictable remains.
    /// Returns the number of entries evicted.
    fn evict_for(&mut self, incoming: usize, budget: usize, free_pool_depth: usize) -> u64 {
        if self.resident_bytes + incoming <= budget {
            return 0;
        }

        let mut candidates: Vec<(K, u64, usize)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.buffer.ref_count() == 0)
            .map(|(k, e)| (k.clone(), e.last_used, e.buffer.size_bytes()))
            .collect();
        candidates.sort_by_key(|(_, last_used, _)| *last_used);

        let mut evicted = 0;
        for (key, _, size) in candidates {
            if self.resident_bytes + incoming <= budget {
                break;
            }
            if let Some(entry) = self.entries.remove(&key) {
                self.resident_bytes -= size;
                evicted += 1;
                tracing::debug!(key = ?key, size, "evicted buffer");
                self.pool_storage(entry.buffer, free_pool_depth);
            }
        }
        evicted
    }

    /// Offers a buffer's storage to the free pool. Only succeeds when the
    /// buffer is unreferenced and this was the last handle to it.
    fn pool_storage(&mut self, buffer: PooledBuffer, free_pool_depth: usize) {
        if self.free_pool.len() >= free_pool_depth {
            return;
        }
        if let Some(storage) = buffer.try_reclaim_storage() {
            self.free_pool.push_back(storage);
        }
    }
}

struct Shared<K> {
    table: Mutex<Table<K>>,
    budget_bytes: usize,
    free_pool_depth: usize,
    stats: Mutex<CacheStats>,
}

/// Capacity-bounded store of decoded buffers, shared by all binding slots.
///
/// Cloning the cache is cheap; all clones refer to the same table.
pub struct BufferCache<K: RequestKey> {
    shared: Arc<Shared<K>>,
}

impl<K: RequestKey> Clone for BufferCache<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: RequestKey> BufferCache<K> {
    /// Creates a cache with the given byte budget and free-pool depth.
    pub fn new(budget_bytes: usize, free_pool_depth: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(Table {
                    entries: HashMap::new(),
                    tick: 0,
                    resident_bytes: 0,
                    free_pool: VecDeque::new(),
                }),
                budget_bytes,
                free_pool_depth,
                stats: Mutex::new(CacheStats::new()),
            }),
        }
    }

    /// Looks up a resident buffer, pinning it on hit.
    ///
    /// On hit the entry's reference count is incremented and its recency
    /// updated; the returned lease releases the reference on drop. Returns
    /// `None` on miss. Performs no allocation.
    pub fn checkout(&self, key: &K) -> Option<BufferLease<K>> {
        let found = {
            let mut table = self.shared.table.lock().unwrap();
            let tick = table.touch();
            table.entries.get_mut(key).map(|entry| {
                entry.last_used = tick;
                entry.buffer.acquire();
                entry.buffer.clone()
            })
        };

        match found {
            Some(buffer) => {
                self.with_stats(|s| s.record_hit());
                tracing::trace!(key = ?key, "cache hit");
                Some(BufferLease {
                    cache: self.clone(),
                    key: key.clone(),
                    buffer,
                })
            }
            None => {
                self.with_stats(|s| s.record_miss());
                tracing::trace!(key = ?key, "cache miss");
                None
            }
        }
    }

    /// Installs a freshly decoded buffer, returning the inserting caller's
    /// lease (reference count seeded at 1).
    ///
    /// Zero-refcount least-recently-used entries are evicted until the new
    /// entry fits the budget. If everything evictable is gone and the
    /// budget is still exceeded, the insert succeeds anyway — a buffer in
    /// use must never be destroyed, so the budget is a target, not a hard
    /// limit.
    pub fn insert(&self, key: K, buffer: PooledBuffer) -> BufferLease<K> {
        let size = buffer.size_bytes();
        let free_pool_depth = self.shared.free_pool_depth;
        let mut table = self.shared.table.lock().unwrap();

        if let Some(old) = table.entries.remove(&key) {
            table.resident_bytes -= old.buffer.size_bytes();
            table.pool_storage(old.buffer, free_pool_depth);
        }

        let evicted = table.evict_for(size, self.shared.budget_bytes, free_pool_depth);

        buffer.acquire();
        let tick = table.touch();
        table.entries.insert(
            key.clone(),
            Entry {
                buffer: buffer.clone(),
                last_used: tick,
            },
        );
        table.resident_bytes += size;

        let resident = table.resident_bytes;
        let count = table.entries.len();
        let pool_depth = table.free_pool.len();
        drop(table);

        self.with_stats(|s| {
            s.record_insert();
            s.record_evictions(evicted);
            s.update_residency(resident, count, pool_depth);
        });
        tracing::debug!(key = ?key, size, resident, evicted, "inserted buffer");

        BufferLease {
            cache: self.clone(),
            key,
            buffer,
        }
    }

    /// Releases one reference on the buffer currently mapped to `key`.
    ///
    /// Prefer dropping the [`BufferLease`]; this exists for callers that
    /// manage references by key.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidRelease`] if the key is unknown or the
    /// entry's reference count is already zero. Either indicates a
    /// reference-counting bug and should be treated as fatal.
    pub fn release(&self, key: &K) -> Result<(), CacheError> {
        let table = self.shared.table.lock().unwrap();
        let entry = table
            .entries
            .get(key)
            .ok_or_else(|| CacheError::InvalidRelease(format!("unknown key {:?}", key)))?;
        let buffer = entry.buffer.clone();
        drop(table);
        self.release_buffer(key, &buffer)
    }

    /// Releases one reference on a specific buffer.
    ///
    /// Releases are by buffer identity, not key lookup, so a lease taken
    /// before its entry was replaced still releases the right buffer.
    fn release_buffer(&self, key: &K, buffer: &PooledBuffer) -> Result<(), CacheError> {
        match buffer.release() {
            Some(remaining) => {
                self.with_stats(|s| s.record_release());
                tracing::trace!(key = ?key, remaining, "released buffer reference");
                Ok(())
            }
            None => {
                tracing::warn!(key = ?key, "over-release: reference count already zero");
                Err(CacheError::InvalidRelease(format!(
                    "count already zero for {:?}",
                    key
                )))
            }
        }
    }

    /// Offers a buffer that will never be cached (a stale decode result) so
    /// its storage can be reused.
    pub fn offer_storage(&self, buffer: PooledBuffer) {
        let free_pool_depth = self.shared.free_pool_depth;
        let mut table = self.shared.table.lock().unwrap();
        table.pool_storage(buffer, free_pool_depth);
        let pool_depth = table.free_pool.len();
        let resident = table.resident_bytes;
        let count = table.entries.len();
        drop(table);
        self.with_stats(|s| s.update_residency(resident, count, pool_depth));
    }

    /// Returns true if `key` is resident.
    pub fn contains(&self, key: &K) -> bool {
        self.shared.table.lock().unwrap().entries.contains_key(key)
    }

    /// Returns the reference count of the entry for `key`, if resident.
    pub fn ref_count(&self, key: &K) -> Option<i32> {
        let table = self.shared.table.lock().unwrap();
        table.entries.get(key).map(|e| e.buffer.ref_count())
    }

    /// Returns the number of resident entries.
    pub fn entry_count(&self) -> usize {
        self.shared.table.lock().unwrap().entries.len()
    }

    /// Returns the total resident size in bytes.
    pub fn resident_bytes(&self) -> usize {
        self.shared.table.lock().unwrap().resident_bytes
    }

    /// Returns the configured byte budget.
    pub fn budget_bytes(&self) -> usize {
        self.shared.budget_bytes
    }

    /// Returns a snapshot of the cache statistics.
    pub fn stats(&self) -> CacheStats {
        let table = self.shared.table.lock().unwrap();
        let resident = table.resident_bytes;
        let count = table.entries.len();
        let pool_depth = table.free_pool.len();
        drop(table);
        let mut stats = self.shared.stats.lock().unwrap().clone();
        stats.update_residency(resident, count, pool_depth);
        stats
    }

    /// Returns a one-line human-readable summary for logs.
    pub fn debug_summary(&self) -> String {
        let table = self.shared.table.lock().unwrap();
        format!(
            "entries={} resident={}B budget={}B free_pool={}",
            table.entries.len(),
            table.resident_bytes,
            self.shared.budget_bytes,
            table.free_pool.len()
        )
    }

    fn with_stats(&self, f: impl FnOnce(&mut CacheStats)) {
        let mut stats = self.shared.stats.lock().unwrap();
        f(&mut stats);
    }
}

impl<K: RequestKey> StorageRecycler for BufferCache<K> {
    fn reclaim(&self, dims: Dimensions) -> Option<Vec<u8>> {
        let needed = dims.byte_len();
        let mut table = self.shared.table.lock().unwrap();
        let position = table
            .free_pool
            .iter()
            .position(|storage| storage.capacity() >= needed)?;
        let storage = table.free_pool.remove(position)?;
        drop(table);
        self.with_stats(|s| s.record_storage_reuse());
        Some(storage)
    }
}

/// A held reference to a cached buffer.
///
/// The lease is the caller's obligation: dropping it releases the
/// reference on every exit path, including the stale and cancelled paths.
pub struct BufferLease<K: RequestKey> {
    cache: BufferCache<K>,
    key: K,
    buffer: PooledBuffer,
}

impl<K: RequestKey> BufferLease<K> {
    /// Returns the key this lease was taken for.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Returns the leased buffer.
    pub fn buffer(&self) -> &PooledBuffer {
        &self.buffer
    }
}

impl<K: RequestKey> Drop for BufferLease<K> {
    fn drop(&mut self) {
        let result = self.cache.release_buffer(&self.key, &self.buffer);
        debug_assert!(result.is_ok(), "lease over-release for {:?}", self.key);
    }
}

impl<K: RequestKey> std::fmt::Debug for BufferLease<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferLease")
            .field("key", &self.key)
            .field("buffer", &self.buffer)
            .finish()
    }
}
