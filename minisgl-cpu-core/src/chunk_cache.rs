//! Chunk Cache (`spec.md` §4.2): a degenerate alternative to the radix
//! cache with no cross-request sharing, used when prefix caching is
//! disabled or chunked prefill requires strict sequentiality. No teacher
//! equivalent existed for this — it implements the same [`CacheBackend`]
//! trait the radix wrapper does.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::cache::{CacheBackend, CacheError};

/// Chunk cache handles carry no state: `match_prefix` always returns an
/// empty match, so there is nothing for a handle to reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCacheHandle;

#[derive(Debug, Default)]
pub struct ChunkCache {
    /// Slots owned by a currently-live request (locked, not evictable).
    running: HashMap<Arc<str>, Vec<i32>>,
    /// Finished requests' slots, FIFO-ordered, evictable as whole entries
    /// since there is no sub-request sharing to preserve.
    evictable: VecDeque<(Arc<str>, Vec<i32>)>,
    evictable_size: usize,
}

impl ChunkCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }
}

impl CacheBackend for ChunkCache {
    type Handle = ChunkCacheHandle;

    fn match_prefix(
        &mut self,
        _rid: &Arc<str>,
        _input_ids: &[i32],
    ) -> Result<(Self::Handle, Vec<i32>), CacheError> {
        Ok((ChunkCacheHandle, Vec::new()))
    }

    fn cache_unfinished_req(
        &mut self,
        rid: &Arc<str>,
        _prev_handle: Option<&Self::Handle>,
        _full_ids: &[i32],
        full_indices: &[i32],
    ) -> Result<Self::Handle, CacheError> {
        self.running.insert(rid.clone(), full_indices.to_vec());
        Ok(ChunkCacheHandle)
    }

    fn cache_finished_req(
        &mut self,
        rid: &Arc<str>,
        _prev_handle: Option<&Self::Handle>,
        _full_ids: &[i32],
        full_indices: &[i32],
    ) -> Result<(), CacheError> {
        self.running.remove(rid);
        self.evictable_size += full_indices.len();
        self.evictable.push_back((rid.clone(), full_indices.to_vec()));
        Ok(())
    }

    fn evict(&mut self, num_tokens: usize) -> Result<Vec<i32>, CacheError> {
        if num_tokens == 0 {
            return Ok(Vec::new());
        }
        if num_tokens > self.evictable_size {
            return Err(CacheError::EvictTooLarge {
                requested: num_tokens,
                evictable: self.evictable_size,
            });
        }

        let mut evicted = Vec::new();
        let mut freed = 0usize;
        while freed < num_tokens {
            let Some((_rid, indices)) = self.evictable.pop_front() else {
                return Err(CacheError::CorruptedTree {
                    reason: "failed to evict enough cache",
                });
            };
            freed += indices.len();
            self.evictable_size -= indices.len();
            evicted.extend(indices);
        }
        Ok(evicted)
    }

    fn evictable_size(&self) -> usize {
        self.evictable_size
    }

    /// No-op: a chunk cache entry is already exclusively owned by `rid`
    /// from the moment `cache_unfinished_req` inserts it into `running`.
    fn lock(&mut self, _rid: &Arc<str>, _handle: &Self::Handle) -> Result<(), CacheError> {
        Ok(())
    }

    /// Folds `rid`'s running entry into the evictable queue, identical to
    /// `cache_finished_req` without requiring the caller to re-supply
    /// `full_ids`/`full_indices`.
    fn unlock(&mut self, rid: &Arc<str>, _handle: &Self::Handle) -> Result<(), CacheError> {
        if let Some(indices) = self.running.remove(rid) {
            self.evictable_size += indices.len();
            self.evictable.push_back((rid.clone(), indices));
        }
        Ok(())
    }

    /// There is no cross-request sharing to report a match against.
    fn peek_match_len(&mut self, _input_ids: &[i32]) -> usize {
        0
    }

    fn reset(&mut self) -> Result<(), CacheError> {
        if !self.running.is_empty() {
            return Err(CacheError::CorruptedTree {
                reason: "cannot reset chunk cache while requests are running",
            });
        }
        self.evictable.clear();
        self.evictable_size = 0;
        Ok(())
    }
}
