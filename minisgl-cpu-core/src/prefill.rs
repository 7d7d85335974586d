//! Prefill Adder (`spec.md` §4.4): the admission controller that greedily
//! fills a new prefill batch subject to token, memory, request-count,
//! LoRA-set, and future-decode-reserve constraints.
//!
//! Field and method names are taken directly from the original's call
//! sites in `scheduler.py` (`adder.can_run_list`, `adder.log_input_tokens`,
//! `adder.log_hit_tokens`, `adder.new_inflight_req`, `add_one_req`,
//! `AddReqResult.{CONTINUE,NO_TOKEN,OTHER}`) so the grounding is auditable
//! at the symbol level, generalized from the teacher's `PrefillAdder`
//! (which only handled the token-budget/chunk-size half of this).

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use crate::cache::{CacheBackend, CacheError};
use crate::pool::{PoolError, ReqSlotPool};
use crate::types::ForwardMode;

#[derive(Debug, Error)]
pub enum PrefillError {
    #[error("input length must be > 0")]
    EmptyInput,
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// A request waiting to be admitted into a prefill batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReq {
    pub rid: Arc<str>,
    pub input_ids: Vec<i32>,
    pub max_new_tokens: u32,
    pub lora_path: Option<Arc<str>>,
}

impl PendingReq {
    pub fn input_len(&self) -> usize {
        self.input_ids.len()
    }
}

/// Saved resume state for a request admitted as inflight last iteration;
/// re-added at the head of the next iteration's adder via
/// `add_inflight_req` and resumed from `cached_len`.
#[derive(Debug, Clone)]
pub struct ChunkedReqState<H> {
    pub pending: PendingReq,
    pub cache_handle: H,
    pub req_pool_idx: i32,
    pub cached_len: usize,
    /// Full KV slot indices for `[0, cached_len)` accumulated across every
    /// chunk admitted so far.
    pub matched_indices: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledReq<H> {
    pub rid: Arc<str>,
    pub req_pool_idx: i32,
    pub cached_len: usize,
    /// End offset (exclusive) of the tokens prefilled through this
    /// iteration; equals `input_len()` unless this admission is chunked.
    pub device_len: usize,
    pub max_new_tokens: u32,
    pub cache_handle: H,
    /// KV slot indices backing `[0, cached_len)`, as returned by the
    /// cache's `match_prefix`; the scheduler appends freshly allocated
    /// slots for `[cached_len, device_len)` to get the full index list.
    pub matched_indices: Vec<i32>,
    pub is_chunked: bool,
    pub lora_path: Option<Arc<str>>,
}

impl<H> ScheduledReq<H> {
    pub fn extend_len(&self) -> usize {
        self.device_len.saturating_sub(self.cached_len)
    }

    pub fn can_decode(&self) -> bool {
        !self.is_chunked
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddReqResult {
    Continue,
    /// Admitted as a chunked (partial) prefill; the caller must stop
    /// walking the waiting queue this iteration (`spec.md` §4.4 "one
    /// inflight request per iteration").
    Chunked,
    NoToken,
    Other,
}

/// Greedy single-iteration admission controller. Constructed fresh by the
/// scheduler for each `get_new_batch_prefill` call.
pub struct PrefillAdder<'a, C: CacheBackend> {
    pub can_run_list: Vec<ScheduledReq<C::Handle>>,
    pub log_input_tokens: usize,
    pub log_hit_tokens: usize,
    pub rem_total_tokens: i64,
    pub rem_input_tokens: i64,
    pub rem_chunk_tokens: Option<i64>,
    pub new_inflight_req: Option<ChunkedReqState<C::Handle>>,
    pub batch_is_full: bool,

    new_token_ratio: f32,
    max_loras_per_batch: usize,
    max_running_requests: usize,
    running_bs: usize,
    lora_set: HashSet<Arc<str>>,

    cache: &'a mut C,
    req_pool: &'a mut ReqSlotPool,
}

impl<'a, C: CacheBackend> PrefillAdder<'a, C> {
    /// `running_lora_paths` seeds the LoRA set with adapters already in the
    /// running batch, so a fresh admission never exceeds
    /// `max_loras_per_batch` across running + newly admitted requests.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: &'a mut C,
        req_pool: &'a mut ReqSlotPool,
        rem_total_tokens: i64,
        rem_input_tokens: i64,
        rem_chunk_tokens: Option<i64>,
        new_token_ratio: f32,
        max_loras_per_batch: usize,
        max_running_requests: usize,
        running_bs: usize,
        running_decode_reserve: i64,
        running_lora_paths: impl IntoIterator<Item = Arc<str>>,
        enable_mixed_chunk: bool,
    ) -> Self {
        let mixed_reserve = if enable_mixed_chunk {
            running_decode_reserve
        } else {
            0
        };
        Self {
            can_run_list: Vec::new(),
            log_input_tokens: 0,
            log_hit_tokens: 0,
            rem_total_tokens: rem_total_tokens - mixed_reserve,
            rem_input_tokens,
            rem_chunk_tokens,
            new_inflight_req: None,
            batch_is_full: false,
            new_token_ratio,
            max_loras_per_batch,
            max_running_requests,
            running_bs,
            lora_set: running_lora_paths.into_iter().collect(),
            cache,
            req_pool,
        }
    }

    fn required_tokens(l_new: usize, max_new_tokens: u32, new_token_ratio: f32) -> i64 {
        let reserve = (new_token_ratio * max_new_tokens as f32).ceil() as i64;
        l_new as i64 + reserve
    }

    /// Re-admits a previously chunked request at the head of the queue,
    /// resuming from its saved `cached_len` (`spec.md` §4.4 "Inflight
    /// requests are re-added first").
    pub fn add_inflight_req(
        &mut self,
        state: ChunkedReqState<C::Handle>,
    ) -> Result<AddReqResult, PrefillError> {
        self.add_one_req_inner(state.pending.clone(), Some(state))
    }

    pub fn add_one_req(&mut self, pending: PendingReq) -> Result<AddReqResult, PrefillError> {
        self.add_one_req_inner(pending, None)
    }

    fn add_one_req_inner(
        &mut self,
        pending: PendingReq,
        resume: Option<ChunkedReqState<C::Handle>>,
    ) -> Result<AddReqResult, PrefillError> {
        if pending.input_len() == 0 {
            return Err(PrefillError::EmptyInput);
        }
        if self.running_bs + self.can_run_list.len() >= self.max_running_requests {
            self.batch_is_full = true;
            return Ok(AddReqResult::Other);
        }
        if let Some(lora) = &pending.lora_path {
            if !self.lora_set.contains(lora) && self.lora_set.len() >= self.max_loras_per_batch {
                return Ok(AddReqResult::Other);
            }
        }

        let is_fresh_match = resume.is_none();
        let (cache_handle, cached_len, req_pool_idx, matched_indices) = match resume {
            Some(state) => (
                state.cache_handle,
                state.cached_len,
                state.req_pool_idx,
                state.matched_indices,
            ),
            None => {
                let match_input = &pending.input_ids[..pending.input_len() - 1];
                let (handle, matched) = self.cache.match_prefix(&pending.rid, match_input)?;
                let req_pool_idx = self
                    .req_pool
                    .allocate()
                    .ok_or(PoolError::OutOfSlots {
                        requested: 1,
                        available: 0,
                    })?;
                let cached_len = matched.len();
                (handle, cached_len, req_pool_idx, matched)
            }
        };

        let l_new = pending.input_len().saturating_sub(cached_len);
        let required = Self::required_tokens(l_new, pending.max_new_tokens, self.new_token_ratio);

        if required > self.rem_total_tokens {
            let deficit = (required - self.rem_total_tokens) as usize;
            if deficit > self.cache.evictable_size() {
                self.batch_is_full = true;
                if is_fresh_match {
                    self.cache.unlock(&pending.rid, &cache_handle)?;
                }
                return Ok(AddReqResult::NoToken);
            }
            self.cache.evict(deficit)?;
            self.rem_total_tokens += deficit as i64;
        }
        if required > self.rem_input_tokens {
            if is_fresh_match {
                self.cache.unlock(&pending.rid, &cache_handle)?;
            }
            return Ok(AddReqResult::Other);
        }

        let chunk_budget = self.rem_chunk_tokens;
        let is_chunked = matches!(chunk_budget, Some(budget) if l_new as i64 > budget);

        let (device_len, consumed) = if is_chunked {
            let budget = chunk_budget.expect("is_chunked implies Some") as usize;
            (cached_len + budget, budget)
        } else {
            (cached_len + l_new, l_new)
        };

        self.log_input_tokens += l_new;
        self.log_hit_tokens += cached_len;
        self.rem_total_tokens -= required;
        self.rem_input_tokens -= required;
        if let Some(budget) = self.rem_chunk_tokens.as_mut() {
            *budget -= consumed as i64;
        }
        if let Some(lora) = &pending.lora_path {
            self.lora_set.insert(lora.clone());
        }

        let scheduled = ScheduledReq {
            rid: pending.rid.clone(),
            req_pool_idx,
            cached_len,
            device_len,
            max_new_tokens: pending.max_new_tokens,
            cache_handle,
            matched_indices,
            is_chunked,
            lora_path: pending.lora_path.clone(),
        };

        if is_chunked {
            self.new_inflight_req = Some(ChunkedReqState {
                pending,
                cache_handle: scheduled.cache_handle.clone(),
                req_pool_idx,
                cached_len: device_len,
                // Filled in by the scheduler once it knows the freshly
                // allocated slots for this chunk; empty here is safe
                // because the adder never reads it back within one call.
                matched_indices: scheduled.matched_indices.clone(),
            });
            self.rem_chunk_tokens = Some(0);
        }

        self.can_run_list.push(scheduled);
        if self.running_bs + self.can_run_list.len() >= self.max_running_requests {
            self.batch_is_full = true;
        }
        if is_chunked {
            return Ok(AddReqResult::Chunked);
        }
        Ok(AddReqResult::Continue)
    }
}

/// Decode-step token reserve: one token per currently-decodable running
/// request (`spec.md` §4.4 step 2, mixed-chunk mode).
pub fn decode_inflight_tokens<H>(running_reqs: &[ScheduledReq<H>]) -> usize {
    running_reqs.iter().filter(|req| req.can_decode()).count()
}

pub fn make_positions<H>(padded_reqs: &[ScheduledReq<H>]) -> Vec<i32> {
    let total: usize = padded_reqs.iter().map(ScheduledReq::extend_len).sum();
    let mut out = Vec::with_capacity(total);
    for req in padded_reqs {
        for pos in req.cached_len..req.device_len {
            out.push(pos as i32);
        }
    }
    out
}

pub fn make_input_mapping<H>(padded_reqs: &[ScheduledReq<H>]) -> Vec<i32> {
    let total: usize = padded_reqs.iter().map(ScheduledReq::extend_len).sum();
    let mut mapping = Vec::with_capacity(total);
    for req in padded_reqs {
        for _ in 0..req.extend_len() {
            mapping.push(req.req_pool_idx);
        }
    }
    mapping
}

pub fn make_input_tuple<H>(
    padded_reqs: &[ScheduledReq<H>],
    positions: &[i32],
) -> (Vec<i32>, Vec<i32>) {
    (make_input_mapping(padded_reqs), positions.to_vec())
}

pub fn make_write_tuple<H>(reqs: &[ScheduledReq<H>]) -> (Vec<i32>, Vec<i32>) {
    let req_mapping: Vec<i32> = reqs.iter().map(|req| req.req_pool_idx).collect();
    let write_pos: Vec<i32> = reqs
        .iter()
        .map(|req| {
            if req.can_decode() {
                req.device_len as i32
            } else {
                -1
            }
        })
        .collect();
    (req_mapping, write_pos)
}

pub fn forward_mode_of<H>(reqs: &[ScheduledReq<H>]) -> ForwardMode {
    let any_chunked = reqs.iter().any(|r| r.is_chunked);
    let any_full = reqs.iter().any(|r| !r.is_chunked);
    match (any_chunked, any_full) {
        (true, true) => ForwardMode::Mixed,
        _ => ForwardMode::Extend,
    }
}
