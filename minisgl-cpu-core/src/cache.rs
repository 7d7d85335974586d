use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid request: input cannot be empty")]
    EmptyInput,
    #[error(
        "invalid cache insert: input and indices lengths differ ({input_len} != {indices_len})"
    )]
    MismatchedInputAndIndices {
        input_len: usize,
        indices_len: usize,
    },
    #[error("cannot evict {requested}, only {evictable} is evictable")]
    EvictTooLarge { requested: usize, evictable: usize },
    #[error("unlock would make node refcount negative")]
    UnlockUnderflow,
    #[error("cache tree is corrupted: {reason}")]
    CorruptedTree { reason: &'static str },
}

/// Unifies the Radix Prefix Cache and the Chunk Cache (`spec.md` §4.1/§4.2)
/// behind the request-level operations the scheduler actually drives:
/// match, cache the partial result of an unfinished prefill, cache the
/// final result of a finished request, evict, and reset. Content-addressed
/// backends (radix) key purely on `input_ids`; identity-addressed backends
/// (chunk) use `rid` instead — both are passed so either works.
pub trait CacheBackend {
    type Handle: Clone + std::fmt::Debug;

    fn match_prefix(
        &mut self,
        rid: &Arc<str>,
        input_ids: &[i32],
    ) -> Result<(Self::Handle, Vec<i32>), CacheError>;

    /// Called after a prefill step that did not finish the request:
    /// transfers newly computed slots into the cache and re-pins the new
    /// tail, releasing the previous pin if any.
    fn cache_unfinished_req(
        &mut self,
        rid: &Arc<str>,
        prev_handle: Option<&Self::Handle>,
        full_ids: &[i32],
        full_indices: &[i32],
    ) -> Result<Self::Handle, CacheError>;

    /// Transfers all slots (including the final output token) and releases
    /// the previous pin exactly once.
    fn cache_finished_req(
        &mut self,
        rid: &Arc<str>,
        prev_handle: Option<&Self::Handle>,
        full_ids: &[i32],
        full_indices: &[i32],
    ) -> Result<(), CacheError>;

    fn evict(&mut self, num_tokens: usize) -> Result<Vec<i32>, CacheError>;
    fn evictable_size(&self) -> usize;

    /// Pins the slots backing `handle` so a concurrent `evict` in the same
    /// admission pass cannot reclaim them before the caller finishes using
    /// the match. Mirrors the teacher's `PrefillCache::lock`.
    fn lock(&mut self, rid: &Arc<str>, handle: &Self::Handle) -> Result<(), CacheError>;

    /// Releases a pin taken by `lock` or `cache_unfinished_req` without
    /// recording any new content. Used when a request holding a live
    /// handle is retracted or jump-forwarded instead of completing a
    /// forward pass; the backing slots fold into the cache's own evictable
    /// pool and must never also be freed straight to the KV pool.
    fn unlock(&mut self, rid: &Arc<str>, handle: &Self::Handle) -> Result<(), CacheError>;

    /// Longest cached prefix for `input_ids`, without pinning anything.
    /// Used to rank waiting requests before admission decides who actually
    /// gets matched and locked.
    fn peek_match_len(&mut self, input_ids: &[i32]) -> usize;

    /// Forbidden unless every pin is released and the running set is
    /// empty; the scheduler is responsible for enforcing the latter.
    fn reset(&mut self) -> Result<(), CacheError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeInfo {
    pub evictable_size: usize,
    pub protected_size: usize,
}

impl SizeInfo {
    pub fn total_size(self) -> usize {
        self.evictable_size + self.protected_size
    }
}

pub trait PrefixCacheManager {
    type Handle: Clone;

    fn match_prefix(&mut self, input_ids: &[i32]) -> Result<(Self::Handle, Vec<i32>), CacheError>;
    fn lock_handle(&mut self, handle: &Self::Handle, unlock: bool) -> Result<(), CacheError>;
    fn insert_prefix(&mut self, input_ids: &[i32], indices: &[i32]) -> Result<usize, CacheError>;
    fn evict(&mut self, size: usize) -> Result<Vec<i32>, CacheError>;
    fn size_info(&self) -> SizeInfo;
    fn check_integrity(&self) -> Result<(), CacheError>;
}

/// Handle union for [`CacheImpl`]: whichever backend is active, its
/// matches are always wrapped in the variant that produced them.
#[derive(Debug, Clone)]
pub enum AnyCacheHandle {
    Radix(crate::radix::RadixCacheHandle),
    Chunk(crate::chunk_cache::ChunkCacheHandle),
}

/// Runtime choice between the Radix Prefix Cache and the Chunk Cache
/// (`spec.md` §4.2: "used when radix caching is disabled"), so the
/// scheduler does not need to be generic over a cache type parameter.
#[derive(Debug)]
pub enum CacheImpl {
    Radix(crate::radix::RadixCache),
    Chunk(crate::chunk_cache::ChunkCache),
}

impl CacheImpl {
    pub fn new_radix() -> Self {
        CacheImpl::Radix(crate::radix::RadixCache::new())
    }

    pub fn new_chunk() -> Self {
        CacheImpl::Chunk(crate::chunk_cache::ChunkCache::new())
    }
}

impl CacheBackend for CacheImpl {
    type Handle = AnyCacheHandle;

    fn match_prefix(
        &mut self,
        rid: &std::sync::Arc<str>,
        input_ids: &[i32],
    ) -> Result<(Self::Handle, Vec<i32>), CacheError> {
        match self {
            CacheImpl::Radix(c) => {
                let (h, m) = c.match_prefix(rid, input_ids)?;
                Ok((AnyCacheHandle::Radix(h), m))
            }
            CacheImpl::Chunk(c) => {
                let (h, m) = c.match_prefix(rid, input_ids)?;
                Ok((AnyCacheHandle::Chunk(h), m))
            }
        }
    }

    fn cache_unfinished_req(
        &mut self,
        rid: &std::sync::Arc<str>,
        prev_handle: Option<&Self::Handle>,
        full_ids: &[i32],
        full_indices: &[i32],
    ) -> Result<Self::Handle, CacheError> {
        match self {
            CacheImpl::Radix(c) => {
                let prev = match prev_handle {
                    Some(AnyCacheHandle::Radix(h)) => Some(h),
                    Some(AnyCacheHandle::Chunk(_)) => {
                        return Err(CacheError::CorruptedTree {
                            reason: "handle/backend mismatch",
                        })
                    }
                    None => None,
                };
                Ok(AnyCacheHandle::Radix(
                    c.cache_unfinished_req(rid, prev, full_ids, full_indices)?,
                ))
            }
            CacheImpl::Chunk(c) => {
                let prev = match prev_handle {
                    Some(AnyCacheHandle::Chunk(h)) => Some(h),
                    Some(AnyCacheHandle::Radix(_)) => {
                        return Err(CacheError::CorruptedTree {
                            reason: "handle/backend mismatch",
                        })
                    }
                    None => None,
                };
                Ok(AnyCacheHandle::Chunk(
                    c.cache_unfinished_req(rid, prev, full_ids, full_indices)?,
                ))
            }
        }
    }

    fn cache_finished_req(
        &mut self,
        rid: &std::sync::Arc<str>,
        prev_handle: Option<&Self::Handle>,
        full_ids: &[i32],
        full_indices: &[i32],
    ) -> Result<(), CacheError> {
        match self {
            CacheImpl::Radix(c) => {
                let prev = match prev_handle {
                    Some(AnyCacheHandle::Radix(h)) => Some(h),
                    Some(AnyCacheHandle::Chunk(_)) => {
                        return Err(CacheError::CorruptedTree {
                            reason: "handle/backend mismatch",
                        })
                    }
                    None => None,
                };
                c.cache_finished_req(rid, prev, full_ids, full_indices)
            }
            CacheImpl::Chunk(c) => {
                let prev = match prev_handle {
                    Some(AnyCacheHandle::Chunk(h)) => Some(h),
                    Some(AnyCacheHandle::Radix(_)) => {
                        return Err(CacheError::CorruptedTree {
                            reason: "handle/backend mismatch",
                        })
                    }
                    None => None,
                };
                c.cache_finished_req(rid, prev, full_ids, full_indices)
            }
        }
    }

    fn evict(&mut self, num_tokens: usize) -> Result<Vec<i32>, CacheError> {
        match self {
            CacheImpl::Radix(c) => c.evict(num_tokens),
            CacheImpl::Chunk(c) => c.evict(num_tokens),
        }
    }

    fn evictable_size(&self) -> usize {
        match self {
            CacheImpl::Radix(c) => c.evictable_size(),
            CacheImpl::Chunk(c) => c.evictable_size(),
        }
    }

    fn lock(&mut self, rid: &std::sync::Arc<str>, handle: &Self::Handle) -> Result<(), CacheError> {
        match (self, handle) {
            (CacheImpl::Radix(c), AnyCacheHandle::Radix(h)) => c.lock(rid, h),
            (CacheImpl::Chunk(c), AnyCacheHandle::Chunk(h)) => c.lock(rid, h),
            _ => Err(CacheError::CorruptedTree {
                reason: "handle/backend mismatch",
            }),
        }
    }

    fn unlock(&mut self, rid: &std::sync::Arc<str>, handle: &Self::Handle) -> Result<(), CacheError> {
        match (self, handle) {
            (CacheImpl::Radix(c), AnyCacheHandle::Radix(h)) => c.unlock(rid, h),
            (CacheImpl::Chunk(c), AnyCacheHandle::Chunk(h)) => c.unlock(rid, h),
            _ => Err(CacheError::CorruptedTree {
                reason: "handle/backend mismatch",
            }),
        }
    }

    fn peek_match_len(&mut self, input_ids: &[i32]) -> usize {
        match self {
            CacheImpl::Radix(c) => c.peek_match_len(input_ids),
            CacheImpl::Chunk(c) => c.peek_match_len(input_ids),
        }
    }

    fn reset(&mut self) -> Result<(), CacheError> {
        match self {
            CacheImpl::Radix(c) => c.reset(),
            CacheImpl::Chunk(c) => c.reset(),
        }
    }
}
