//! Scheduler Loop (`spec.md` §4.5, component 9): the single-threaded
//! cooperative loop that drains the inbound channel, drives prefill/decode
//! iterations, applies retraction and jump-forward, and emits results to
//! the detokenizer channel.
//!
//! Method names (`recv_requests`, `process_input_requests`,
//! `get_new_batch_prefill`, `update_running_batch`, `run_batch`,
//! `check_memory`) mirror the original's `scheduler.py` call sites so the
//! grounding stays auditable at the symbol level; the body is original code
//! since `scheduler.py` itself was not included in the retrieval pack.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::{CacheBackend, CacheImpl};
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::grammar::{GrammarKind, GrammarStateCache};
use crate::io_struct::{
    AbortReq, BatchEmbeddingOut, BatchTokenIDOut, FlushCacheReq, MetaInfo, ProfileReq,
    SchedulerMessage, SchedulerOutput, TokenizedEmbeddingReqInput, TokenizedGenerateReqInput,
    UpdateWeightReqInput, UpdateWeightReqOutput,
};
use crate::jump_forward::JumpForwardCache;
use crate::policy::SchedulePolicy;
use crate::pool::{KvPool, ReqSlotPool};
use crate::prefill::{
    forward_mode_of, make_input_mapping, make_positions, make_write_tuple, AddReqResult,
    ChunkedReqState, PendingReq, PrefillAdder, ScheduledReq,
};
use crate::types::{FinishReason, ForwardMode, Req, ReqKind};
use crate::worker::{BatchReqView, ScheduledBatch, Worker};

/// Per-request bookkeeping the `Req` value itself does not own: the cache
/// handle pinning its prefix, and the KV slot indices backing its tokens.
#[derive(Debug, Default, Clone)]
struct ReqRuntime {
    cache_handle: Option<<CacheImpl as CacheBackend>::Handle>,
    kv_indices: Vec<i32>,
}

/// Greedily re-tokenizes a jump-forward byte string against a vocabulary
/// table by longest-prefix match, standing in for the real tokenizer that
/// is an external collaborator per `spec.md` §1.
fn retokenize_forced_bytes(vocab: &[Vec<u8>], forced: &[u8]) -> Vec<i32> {
    let mut out = Vec::new();
    let mut pos = 0;
    'outer: while pos < forced.len() {
        let remaining = &forced[pos..];
        for len in (1..=remaining.len()).rev() {
            let candidate = &remaining[..len];
            if let Some(id) = vocab.iter().position(|bytes| bytes == candidate) {
                out.push(id as i32);
                pos += len;
                continue 'outer;
            }
        }
        break;
    }
    out
}

pub struct Scheduler<W: Worker> {
    config: SchedulerConfig,
    kv_pool: KvPool,
    req_pool: ReqSlotPool,
    cache: CacheImpl,
    grammar_cache: GrammarStateCache,
    jump_forward_cache: JumpForwardCache,
    policy: SchedulePolicy,
    worker: W,
    vocab: Arc<Vec<Vec<u8>>>,

    inbound_rx: Receiver<SchedulerMessage>,
    outbound_tx: Sender<SchedulerOutput>,

    waiting_queue: VecDeque<Req>,
    running_batch: Vec<Req>,
    runtime: HashMap<Arc<str>, ReqRuntime>,

    chunked_req_state: Option<ChunkedReqState<<CacheImpl as CacheBackend>::Handle>>,
    new_token_ratio: f32,
    iteration: u64,
    profiling: bool,
}

impl<W: Worker> Scheduler<W> {
    pub fn new(
        config: SchedulerConfig,
        cache: CacheImpl,
        worker: W,
        vocab: Vec<Vec<u8>>,
        inbound_rx: Receiver<SchedulerMessage>,
        outbound_tx: Sender<SchedulerOutput>,
    ) -> Self {
        let init_new_token_ratio = config.init_new_token_ratio;
        Self {
            kv_pool: KvPool::new(config.max_total_num_tokens),
            req_pool: ReqSlotPool::new(config.req_slot_capacity),
            cache,
            grammar_cache: GrammarStateCache::new(),
            jump_forward_cache: JumpForwardCache::new(),
            policy: SchedulePolicy::LongestPrefix,
            worker,
            vocab: Arc::new(vocab),
            inbound_rx,
            outbound_tx,
            waiting_queue: VecDeque::new(),
            running_batch: Vec::new(),
            runtime: HashMap::new(),
            chunked_req_state: None,
            new_token_ratio: init_new_token_ratio,
            iteration: 0,
            profiling: false,
            config,
        }
    }

    pub fn with_policy(mut self, policy: SchedulePolicy) -> Self {
        self.policy = policy;
        self
    }

    // ---- §4.5 step 1: Receive -------------------------------------------

    fn recv_requests(&mut self) -> Vec<SchedulerMessage> {
        let mut msgs = Vec::new();
        loop {
            match self.inbound_rx.try_recv() {
                Ok(msg) => msgs.push(msg),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        msgs
    }

    fn process_input_requests(&mut self, msgs: Vec<SchedulerMessage>) {
        for msg in msgs {
            match msg {
                SchedulerMessage::Generate(input) => self.handle_generate(input, ReqKind::Generate),
                SchedulerMessage::Embedding(input) => self.handle_embedding(input, ReqKind::Embedding),
                SchedulerMessage::Reward(input) => self.handle_embedding(input, ReqKind::Embedding),
                SchedulerMessage::FlushCache(FlushCacheReq) => {
                    if let Err(e) = self.flush_cache() {
                        warn!(error = %e, "flush_cache refused");
                    }
                }
                SchedulerMessage::Abort(AbortReq { rid }) => self.abort_request(&rid),
                SchedulerMessage::UpdateWeight(req) => self.handle_update_weight(req),
                SchedulerMessage::Profile(req) => self.handle_profile(req),
            }
        }
    }

    fn handle_generate(&mut self, input: TokenizedGenerateReqInput, kind: ReqKind) {
        let mut req = Req::new(input.rid, input.input_ids, input.sampling_params);
        req.stream = input.stream;
        req.lora_path = input.lora_path;
        req.kind = kind;
        self.truncate_if_oversized(&mut req);
        self.compile_grammar_if_requested(&mut req);
        self.waiting_queue.push_back(req);
    }

    fn handle_embedding(&mut self, input: TokenizedEmbeddingReqInput, kind: ReqKind) {
        let mut req = Req::new(input.rid, input.input_ids, input.sampling_params);
        req.kind = kind;
        self.truncate_if_oversized(&mut req);
        self.waiting_queue.push_back(req);
    }

    /// Silent truncation (`spec.md` §7): prompts at or beyond
    /// `max_req_input_len` are cut, with `max_new_tokens` shrunk to match.
    fn truncate_if_oversized(&self, req: &mut Req) {
        let limit = self.config.max_req_input_len;
        if req.origin_input_ids.len() >= limit {
            warn!(
                rid = %req.rid,
                original_len = req.origin_input_ids.len(),
                limit,
                "truncating oversized prompt"
            );
            req.origin_input_ids.truncate(limit.saturating_sub(1));
            let remaining = limit
                .saturating_sub(1)
                .saturating_sub(req.origin_input_ids.len());
            req.sampling_params.max_new_tokens = Some(remaining as u32);
        }
    }

    fn compile_grammar_if_requested(&mut self, req: &mut Req) {
        let (kind, spec) = if let Some(schema) = &req.sampling_params.json_schema {
            (GrammarKind::Json, schema.clone())
        } else if let Some(regex) = &req.sampling_params.regex {
            (GrammarKind::Regex, regex.clone())
        } else {
            return;
        };
        match self.grammar_cache.query(kind, &spec) {
            Ok(matcher) => {
                req.jump_forward_map = if self.config.disable_regex_jump_forward {
                    None
                } else {
                    Some(self.jump_forward_cache.get_or_create(&spec))
                };
                req.grammar = Some(matcher);
            }
            Err(e) => {
                warn!(rid = %req.rid, error = %e, "grammar compile failed, proceeding unconstrained")
            }
        }
    }

    fn handle_update_weight(&mut self, req: UpdateWeightReqInput) {
        let output = match self.worker.update_weights(&req.model_path) {
            Ok((success, message)) => UpdateWeightReqOutput { success, message },
            Err(e) => UpdateWeightReqOutput {
                success: false,
                message: e.to_string(),
            },
        };
        let _ = self.outbound_tx.send(SchedulerOutput::UpdateWeight(output));
    }

    fn handle_profile(&mut self, req: ProfileReq) {
        self.profiling = matches!(req, ProfileReq::Start);
        info!(profiling = self.profiling, "profile state changed");
    }

    // ---- flush / abort ----------------------------------------------------

    fn flush_cache(&mut self) -> Result<(), SchedulerError> {
        if !self.waiting_queue.is_empty() || !self.running_batch.is_empty() {
            warn!("flush_cache skipped: requests still live");
            return Ok(());
        }
        self.cache.reset()?;
        Ok(())
    }

    /// Idempotent: aborting an already-finished or already-removed request
    /// is a no-op (`spec.md` §5 "Cancellation").
    fn abort_request(&mut self, rid: &Arc<str>) {
        if let Some(pos) = self.waiting_queue.iter().position(|r| &r.rid == rid) {
            self.waiting_queue.remove(pos);
            return;
        }
        if let Some(req) = self.running_batch.iter_mut().find(|r| &r.rid == rid) {
            if req.finished_reason.is_none() {
                req.finished_reason = Some(FinishReason::Abort);
            }
        }
        if let Some(state) = &self.chunked_req_state {
            if state.pending.rid == *rid {
                let state = self.chunked_req_state.take().unwrap();
                let _ = self.req_pool.release(state.req_pool_idx);
                if let Err(e) = self.cache.unlock(rid, &state.cache_handle) {
                    warn!(rid = %rid, error = %e, "failed to unlock cache handle on abort");
                }
                let want = state.matched_indices.len().min(self.cache.evictable_size());
                if want > 0 {
                    match self.cache.evict(want) {
                        Ok(evicted) => {
                            if let Err(e) = self.kv_pool.free(&evicted) {
                                warn!(rid = %rid, error = %e, "failed to free evicted kv slots on abort");
                            }
                        }
                        Err(e) => warn!(rid = %rid, error = %e, "failed to reclaim kv pool capacity on abort"),
                    }
                }
                self.runtime.remove(rid);
            }
        }
    }

    // ---- §4.4/§4.5 "Plan": prefill -----------------------------------------

    fn get_new_batch_prefill(
        &mut self,
    ) -> Option<(
        Vec<ScheduledReq<<CacheImpl as CacheBackend>::Handle>>,
        usize,
        usize,
    )> {
        if self.waiting_queue.is_empty() && self.chunked_req_state.is_none() {
            return None;
        }

        let mut ordered: Vec<Req> = self.waiting_queue.drain(..).collect();
        for req in &mut ordered {
            let full_ids = req.full_token_ids();
            let match_input = &full_ids[..full_ids.len().saturating_sub(1)];
            req.cached_len = self.cache.peek_match_len(match_input);
        }
        self.policy.order(&mut ordered);

        let running_decode_reserve = self
            .running_batch
            .iter()
            .filter(|r| r.is_inflight_req == 0 && !r.is_finished())
            .count() as i64;
        let lora_paths: Vec<Arc<str>> = self
            .running_batch
            .iter()
            .filter_map(|r| r.lora_path.clone())
            .collect();

        let mut admitted = 0usize;
        let (can_run_list, log_input_tokens, log_hit_tokens) = {
            let mut adder = PrefillAdder::new(
                &mut self.cache,
                &mut self.req_pool,
                self.kv_pool.available_size() as i64,
                self.config.max_prefill_tokens as i64,
                self.config.chunked_prefill_size.map(|v| v as i64),
                self.new_token_ratio,
                self.config.max_loras_per_batch,
                self.config.max_running_requests,
                self.running_batch.len(),
                running_decode_reserve,
                lora_paths,
                self.config.enable_mixed_chunk,
            );

            if let Some(resume) = self.chunked_req_state.take() {
                if let Err(e) = adder.add_inflight_req(resume) {
                    warn!(error = %e, "failed to resume inflight request");
                }
            }

            for req in &ordered {
                let pending = PendingReq {
                    rid: req.rid.clone(),
                    input_ids: req.full_token_ids(),
                    max_new_tokens: req.sampling_params.max_new_tokens(),
                    lora_path: req.lora_path.clone(),
                };
                match adder.add_one_req(pending) {
                    Ok(AddReqResult::Continue) => admitted += 1,
                    Ok(AddReqResult::Chunked) => {
                        admitted += 1;
                        break;
                    }
                    Ok(_) => break,
                    Err(e) => {
                        warn!(rid = %req.rid, error = %e, "admission failed");
                        break;
                    }
                }
            }

            self.chunked_req_state = adder.new_inflight_req.take();
            (
                adder.can_run_list,
                adder.log_input_tokens,
                adder.log_hit_tokens,
            )
        };

        let leftover: Vec<Req> = ordered.split_off(admitted);
        let mut admitted_reqs: HashMap<Arc<str>, Req> =
            ordered.into_iter().map(|r| (r.rid.clone(), r)).collect();
        for req in leftover {
            self.waiting_queue.push_back(req);
        }

        if can_run_list.is_empty() {
            for (_, req) in admitted_reqs.drain() {
                self.waiting_queue.push_back(req);
            }
            return None;
        }

        // Carry the admitted `Req` values (prompt/sampling/grammar state)
        // alongside the adder's scheduling decisions into `running_batch`;
        // `run_prefill_batch` finishes wiring KV slots and cache pins.
        for scheduled in &can_run_list {
            if let Some(mut req) = admitted_reqs.remove(&scheduled.rid) {
                req.req_pool_idx = Some(scheduled.req_pool_idx);
                req.cached_len = scheduled.cached_len;
                req.is_inflight_req = u32::from(scheduled.is_chunked);
                self.running_batch.push(req);
            }
        }

        Some((can_run_list, log_input_tokens, log_hit_tokens))
    }

    // ---- §4.5 steps 3-5: Execute + Post-process (prefill) ------------------

    fn run_prefill_batch(
        &mut self,
        scheduled: Vec<ScheduledReq<<CacheImpl as CacheBackend>::Handle>>,
        log_input_tokens: usize,
        log_hit_tokens: usize,
    ) -> Result<(), SchedulerError> {
        info!(
            iteration = self.iteration,
            requests = scheduled.len(),
            log_input_tokens,
            log_hit_tokens,
            "running prefill batch"
        );

        let mode = forward_mode_of(&scheduled);
        let _positions = make_positions(&scheduled);
        let _input_mapping = make_input_mapping(&scheduled);
        let _write_tuple = make_write_tuple(&scheduled);

        let batch = ScheduledBatch {
            reqs: scheduled
                .iter()
                .map(|s| BatchReqView {
                    rid: s.rid.clone(),
                    req_pool_idx: s.req_pool_idx,
                    completion_tokens_so_far: 0,
                })
                .collect(),
            mode,
        };
        let output = self
            .worker
            .forward_batch_generation(&batch)
            .map_err(SchedulerError::from)?;

        for (scheduled_req, next_id) in scheduled.iter().zip(output.next_token_ids.iter()) {
            let extend_len = scheduled_req.extend_len();
            let fresh = self.kv_pool.alloc(extend_len)?;
            let mut full_indices = scheduled_req.matched_indices.clone();
            full_indices.extend_from_slice(&fresh);

            if scheduled_req.is_chunked {
                if let Some(state) = &mut self.chunked_req_state {
                    if state.pending.rid == scheduled_req.rid {
                        state.matched_indices = full_indices.clone();
                    }
                }
                self.runtime.insert(
                    scheduled_req.rid.clone(),
                    ReqRuntime {
                        cache_handle: Some(scheduled_req.cache_handle.clone()),
                        kv_indices: full_indices,
                    },
                );
                continue;
            }

            let Some(req) = self
                .running_batch
                .iter_mut()
                .find(|r| r.rid == scheduled_req.rid)
            else {
                continue;
            };

            if req.kind == ReqKind::Embedding {
                req.finished_reason = Some(FinishReason::Length);
                self.cache.cache_finished_req(
                    &req.rid,
                    Some(&scheduled_req.cache_handle),
                    &req.full_token_ids(),
                    &full_indices,
                )?;
                self.req_pool.release(scheduled_req.req_pool_idx)?;
                continue;
            }

            req.is_inflight_req = 0;
            let out_slot = self.kv_pool.alloc(1)?;
            full_indices.extend_from_slice(&out_slot);
            req.output_ids.push(*next_id);
            req.completion_tokens_wo_jump_forward += 1;
            self.advance_grammar(req, *next_id);
            self.evaluate_termination(req);

            let full_ids = req.full_token_ids();
            if req.is_finished() {
                self.cache.cache_finished_req(
                    &req.rid,
                    Some(&scheduled_req.cache_handle),
                    &full_ids,
                    &full_indices,
                )?;
                self.req_pool.release(scheduled_req.req_pool_idx)?;
                self.runtime.remove(&req.rid);
            } else {
                let handle = self.cache.cache_unfinished_req(
                    &req.rid,
                    Some(&scheduled_req.cache_handle),
                    &full_ids,
                    &full_indices,
                )?;
                self.runtime.insert(
                    req.rid.clone(),
                    ReqRuntime {
                        cache_handle: Some(handle),
                        kv_indices: full_indices,
                    },
                );
            }
        }

        let mut finished_embeddings = Vec::new();
        self.running_batch.retain(|r| {
            let keep = !r.is_finished();
            if !keep && r.kind == ReqKind::Embedding {
                finished_embeddings.push(r.rid.clone());
            }
            keep
        });
        if !finished_embeddings.is_empty() {
            let n = finished_embeddings.len();
            self.stream_embedding_results(finished_embeddings, vec![Vec::new(); n]);
        }
        self.stream_finished_and_streaming();
        Ok(())
    }

    // ---- §4.5 step 3 fallback / continuous decode --------------------------

    fn update_running_batch(&mut self) -> Result<(), SchedulerError> {
        if self.running_batch.is_empty() {
            return Ok(());
        }

        if self.decode_mem_insufficient() {
            self.retract_decode()?;
            if self.running_batch.is_empty() {
                return Ok(());
            }
        }

        self.check_for_jump_forward();
        if self.running_batch.is_empty() {
            return Ok(());
        }

        self.run_decode_step()?;

        for _ in 1..self.config.num_continuous_decode_steps.max(1) {
            if self.running_batch.is_empty() {
                break;
            }
            if self.decode_mem_insufficient() {
                self.retract_decode()?;
                if self.running_batch.is_empty() {
                    break;
                }
            }
            self.run_decode_step()?;
        }

        self.new_token_ratio = (self.new_token_ratio - self.config.new_token_ratio_decay)
            .max(self.config.min_new_token_ratio());
        Ok(())
    }

    fn decode_mem_insufficient(&self) -> bool {
        if self.config.test_retract && self.running_batch.len() > 10 {
            return true;
        }
        let decodable = self
            .running_batch
            .iter()
            .filter(|r| r.is_inflight_req == 0 && !r.is_finished())
            .count();
        decodable > self.kv_pool.available_size()
    }

    fn run_decode_step(&mut self) -> Result<(), SchedulerError> {
        let decodable: Vec<Arc<str>> = self
            .running_batch
            .iter()
            .filter(|r| r.is_inflight_req == 0 && !r.is_finished())
            .map(|r| r.rid.clone())
            .collect();
        if decodable.is_empty() {
            return Ok(());
        }

        let batch = ScheduledBatch {
            reqs: decodable
                .iter()
                .filter_map(|rid| {
                    self.running_batch
                        .iter()
                        .find(|r| &r.rid == rid)
                        .map(|r| BatchReqView {
                            rid: r.rid.clone(),
                            req_pool_idx: r.req_pool_idx.unwrap_or_default(),
                            completion_tokens_so_far: r.completion_tokens(),
                        })
                })
                .collect(),
            mode: ForwardMode::Decode,
        };
        let output = self
            .worker
            .forward_batch_generation(&batch)
            .map_err(SchedulerError::from)?;

        for (rid, next_id) in decodable.iter().zip(output.next_token_ids.iter()) {
            let slot = self.kv_pool.alloc(1)?;
            let (finished, full_ids, req_pool_idx) = {
                let Some(req) = self.running_batch.iter_mut().find(|r| &r.rid == rid) else {
                    continue;
                };
                req.output_ids.push(*next_id);
                req.completion_tokens_wo_jump_forward += 1;
                self.advance_grammar(req, *next_id);
                self.evaluate_termination(req);
                (
                    req.is_finished(),
                    req.full_token_ids(),
                    req.req_pool_idx.unwrap_or_default(),
                )
            };

            let mut full_indices = self
                .runtime
                .get(rid)
                .map(|r| r.kv_indices.clone())
                .unwrap_or_default();
            full_indices.extend_from_slice(&slot);

            if finished {
                self.cache.cache_finished_req(
                    rid,
                    self.runtime.get(rid).and_then(|r| r.cache_handle.as_ref()),
                    &full_ids,
                    &full_indices,
                )?;
                self.req_pool.release(req_pool_idx)?;
                self.runtime.remove(rid);
            } else {
                let handle = self.cache.cache_unfinished_req(
                    rid,
                    self.runtime.get(rid).and_then(|r| r.cache_handle.as_ref()),
                    &full_ids,
                    &full_indices,
                )?;
                self.runtime.insert(
                    rid.clone(),
                    ReqRuntime {
                        cache_handle: Some(handle),
                        kv_indices: full_indices,
                    },
                );
            }
        }

        self.running_batch.retain(|r| !r.is_finished());
        self.stream_finished_and_streaming();
        Ok(())
    }

    fn advance_grammar(&self, req: &mut Req, next_id: i32) {
        if let Some(grammar) = &mut req.grammar {
            let Ok(idx) = usize::try_from(next_id) else {
                return;
            };
            let Some(bytes) = self.vocab.get(idx) else {
                return;
            };
            if !grammar.accept_token(bytes) {
                warn!(rid = %req.rid, "sampled token rejected by grammar; leaving state unchanged");
            }
        }
    }

    fn evaluate_termination(&self, req: &mut Req) {
        if req.finished_reason.is_some() {
            return;
        }
        if req.completion_tokens() as u32 >= req.sampling_params.max_new_tokens() {
            req.finished_reason = Some(FinishReason::Length);
            return;
        }
        if !req.sampling_params.ignore_eos {
            if let Some(&last) = req.output_ids.last() {
                if last < 0 {
                    req.finished_reason = Some(FinishReason::EosToken);
                }
            }
        }
    }

    // ---- §4.6 Decode Retraction --------------------------------------------

    fn retract_decode(&mut self) -> Result<(), SchedulerError> {
        let needed = self
            .running_batch
            .iter()
            .filter(|r| r.is_inflight_req == 0 && !r.is_finished())
            .count()
            .saturating_sub(self.kv_pool.available_size());

        let mut freed = 0usize;
        while freed < needed {
            let Some(pos) = self
                .running_batch
                .iter()
                .rposition(|r| r.is_inflight_req == 0 && !r.is_finished())
            else {
                break;
            };
            let victim = self.running_batch.remove(pos);
            let runtime = self.runtime.remove(&victim.rid).unwrap_or_default();
            if let Some(handle) = runtime.cache_handle.as_ref() {
                self.cache.unlock(&victim.rid, handle)?;
            }
            if let Some(idx) = victim.req_pool_idx {
                self.req_pool.release(idx)?;
            }

            let want = (needed - freed).min(self.cache.evictable_size());
            if want > 0 {
                let evicted = self.cache.evict(want)?;
                self.kv_pool.free(&evicted)?;
                freed += evicted.len();
            }

            let mut resumed = victim;
            resumed.req_pool_idx = None;
            resumed.cached_len = 0;
            resumed.is_inflight_req = 0;
            self.waiting_queue.push_front(resumed);
        }

        if freed > 0 {
            self.new_token_ratio = (self.new_token_ratio + 0.1).min(1.0);
            info!(
                new_token_ratio = self.new_token_ratio,
                freed, "retracted decode requests"
            );
        }
        Ok(())
    }

    // ---- §4.7 Jump-Forward --------------------------------------------------

    fn check_for_jump_forward(&mut self) {
        if self.vocab.is_empty() {
            return;
        }
        let mut jumped_rids = Vec::new();
        for req in &mut self.running_batch {
            let Some(grammar) = &req.grammar else { continue };
            let Some(map) = &req.jump_forward_map else {
                continue;
            };
            let forced = map.forced_suffix(grammar);
            let Some(forced_bytes) = forced.as_ref() else {
                continue;
            };
            if forced_bytes.is_empty() {
                continue;
            }
            let new_tokens = retokenize_forced_bytes(&self.vocab, forced_bytes);
            if new_tokens.is_empty() {
                continue;
            }
            req.output_ids.extend_from_slice(&new_tokens);
            if let Some(grammar) = &mut req.grammar {
                grammar.apply_forced_bytes(forced_bytes);
            }
            jumped_rids.push(req.rid.clone());
        }

        if jumped_rids.is_empty() {
            return;
        }
        let mut moved = Vec::new();
        self.running_batch.retain(|r| {
            if jumped_rids.contains(&r.rid) {
                moved.push(r.clone());
                false
            } else {
                true
            }
        });
        for mut req in moved {
            if let Some(runtime) = self.runtime.remove(&req.rid) {
                if let Some(handle) = runtime.cache_handle.as_ref() {
                    if let Err(e) = self.cache.unlock(&req.rid, handle) {
                        warn!(rid = %req.rid, error = %e, "failed to unlock cache handle on jump-forward");
                    }
                }
                let want = runtime.kv_indices.len().min(self.cache.evictable_size());
                if want > 0 {
                    match self.cache.evict(want) {
                        Ok(evicted) => {
                            if let Err(e) = self.kv_pool.free(&evicted) {
                                warn!(rid = %req.rid, error = %e, "failed to free evicted kv slots on jump-forward");
                            }
                        }
                        Err(e) => {
                            warn!(rid = %req.rid, error = %e, "failed to reclaim kv pool capacity on jump-forward")
                        }
                    }
                }
            }
            if let Some(idx) = req.req_pool_idx.take() {
                let _ = self.req_pool.release(idx);
            }
            req.cached_len = 0;
            req.is_inflight_req = 0;
            self.waiting_queue.push_back(req);
        }
    }

    // ---- §4.5 step 6: Stream ------------------------------------------------

    fn stream_finished_and_streaming(&mut self) {
        let mut rids = Vec::new();
        let mut meta_infos = Vec::new();
        let mut finished = Vec::new();

        for req in &self.running_batch {
            let is_finished = req.is_finished();
            let due =
                is_finished || (req.stream && self.iteration % self.config.stream_interval.max(1) == 0);
            if !due {
                continue;
            }
            rids.push(req.rid.clone());
            meta_infos.push(MetaInfo {
                prompt_tokens: req.prompt_tokens(),
                completion_tokens: req.completion_tokens(),
                completion_tokens_wo_jump_forward: req.completion_tokens_wo_jump_forward,
                finish_reason: req.finished_reason.clone(),
                input_token_logprobs: None,
                output_token_logprobs: None,
                input_top_logprobs: None,
                output_top_logprobs: None,
                normalized_prompt_logprob: None,
            });
            finished.push(req.finished_reason.clone());
        }

        if rids.is_empty() {
            return;
        }

        let n = rids.len();
        let out = BatchTokenIDOut {
            vids: vec![0; n],
            decoded_texts: vec![String::new(); n],
            read_ids: vec![Vec::new(); n],
            read_offsets: vec![0; n],
            skip_special_tokens: vec![true; n],
            spaces_between_special_tokens: vec![true; n],
            meta_info: meta_infos,
            finished_reason: finished,
            no_stop_trim: vec![false; n],
            rids,
        };
        let _ = self.outbound_tx.send(SchedulerOutput::TokenIds(out));
    }

    fn stream_embedding_results(&self, rids: Vec<Arc<str>>, embeddings: Vec<Vec<f32>>) {
        let n = rids.len();
        let out = BatchEmbeddingOut {
            rids,
            embeddings,
            meta_info: vec![
                MetaInfo {
                    prompt_tokens: 0,
                    completion_tokens: 0,
                    completion_tokens_wo_jump_forward: 0,
                    finish_reason: Some(FinishReason::Length),
                    input_token_logprobs: None,
                    output_token_logprobs: None,
                    input_top_logprobs: None,
                    output_top_logprobs: None,
                    normalized_prompt_logprob: None,
                };
                n
            ],
            finished_reason: vec![Some(FinishReason::Length); n],
        };
        let _ = self.outbound_tx.send(SchedulerOutput::Embedding(out));
    }

    // ---- §4.5 step 7: Idle bookkeeping --------------------------------------

    pub fn check_memory(&self) -> Result<(), SchedulerError> {
        let in_use: usize = self.runtime.values().map(|r| r.kv_indices.len()).sum();
        let accounted = self.kv_pool.available_size() + self.cache.evictable_size() + in_use;
        if accounted != self.kv_pool.capacity() {
            let msg = format!(
                "kv accounting drift: available={} evictable={} in_use={} capacity={}",
                self.kv_pool.available_size(),
                self.cache.evictable_size(),
                in_use,
                self.kv_pool.capacity()
            );
            if self.config.crash_on_warning {
                return Err(SchedulerError::InvariantDrift(msg));
            }
            warn!("{msg}");
        }
        Ok(())
    }

    // ---- top-level loop -----------------------------------------------------

    /// One full loop turn: receive, plan, execute, post-process, stream,
    /// and (when idle) verify invariants.
    pub fn step(&mut self) -> Result<(), SchedulerError> {
        let msgs = self.recv_requests();
        self.process_input_requests(msgs);

        match self.get_new_batch_prefill() {
            Some((scheduled, log_input, log_hit)) => {
                self.run_prefill_batch(scheduled, log_input, log_hit)?;
            }
            None => self.update_running_batch()?,
        }

        if self.running_batch.is_empty() && self.waiting_queue.is_empty() {
            self.check_memory()?;
        }

        if self.iteration % crate::config::DECODE_LOG_INTERVAL == 0 {
            info!(
                iteration = self.iteration,
                running = self.running_batch.len(),
                waiting = self.waiting_queue.len(),
                new_token_ratio = self.new_token_ratio,
                "scheduler stats"
            );
        }
        self.iteration += 1;
        Ok(())
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting_queue.len()
    }

    pub fn running_len(&self) -> usize {
        self.running_batch.len()
    }

    pub fn running_requests(&self) -> &[Req] {
        &self.running_batch
    }

    pub fn new_token_ratio(&self) -> f32 {
        self.new_token_ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SamplingParams;
    use crate::worker::MockWorker;
    use std::sync::mpsc;

    fn test_config() -> SchedulerConfig {
        let mut cfg = SchedulerConfig::from_env();
        cfg.max_total_num_tokens = 64;
        cfg.max_prefill_tokens = 64;
        cfg.req_slot_capacity = 8;
        cfg.max_running_requests = 8;
        cfg
    }

    fn make_scheduler() -> (
        Scheduler<MockWorker>,
        Sender<SchedulerMessage>,
        Receiver<SchedulerOutput>,
    ) {
        let (in_tx, in_rx) = mpsc::channel();
        let (out_tx, out_rx) = mpsc::channel();
        let worker = MockWorker::new(8, 3);
        let scheduler = Scheduler::new(
            test_config(),
            CacheImpl::new_radix(),
            worker,
            Vec::new(),
            in_rx,
            out_tx,
        );
        (scheduler, in_tx, out_rx)
    }

    fn generate_req(rid: &str, input_ids: Vec<i32>, max_new_tokens: u32) -> TokenizedGenerateReqInput {
        TokenizedGenerateReqInput {
            rid: Arc::from(rid),
            input_text: String::new(),
            input_ids,
            sampling_params: SamplingParams {
                max_new_tokens: Some(max_new_tokens),
                ..SamplingParams::default()
            },
            image_inputs: None,
            return_logprob: false,
            top_logprobs_num: 0,
            stream: false,
            logprob_start_len: -1,
            lora_path: None,
        }
    }

    #[test]
    fn single_request_prefills_then_decodes_to_completion() {
        let (mut scheduler, in_tx, out_rx) = make_scheduler();
        in_tx
            .send(SchedulerMessage::Generate(generate_req(
                "r1",
                vec![1, 2, 3, 4],
                3,
            )))
            .unwrap();

        for _ in 0..8 {
            scheduler.step().unwrap();
            if scheduler.waiting_len() == 0 && scheduler.running_len() == 0 {
                break;
            }
        }

        assert_eq!(scheduler.waiting_len(), 0);
        assert_eq!(scheduler.running_len(), 0);
        let mut saw_finished = false;
        while let Ok(SchedulerOutput::TokenIds(out)) = out_rx.try_recv() {
            if out.finished_reason.iter().any(Option::is_some) {
                saw_finished = true;
            }
        }
        assert!(saw_finished);
    }

    #[test]
    fn abort_removes_waiting_request() {
        let (mut scheduler, in_tx, _out_rx) = make_scheduler();
        in_tx
            .send(SchedulerMessage::Generate(generate_req("r1", vec![1, 2, 3], 5)))
            .unwrap();
        in_tx
            .send(SchedulerMessage::Abort(AbortReq { rid: Arc::from("r1") }))
            .unwrap();

        let msgs = scheduler.recv_requests();
        scheduler.process_input_requests(msgs);
        assert_eq!(scheduler.waiting_len(), 0);
    }

    #[test]
    fn check_memory_holds_when_idle() {
        let (scheduler, _in_tx, _out_rx) = make_scheduler();
        assert!(scheduler.check_memory().is_ok());
    }
}
