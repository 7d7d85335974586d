use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::grammar::GrammarMatcher;
use crate::jump_forward::JumpForwardMap;

/// `max_new_tokens: null` means "effectively unbounded", matching the
/// original scheduler's `1 << 30` sentinel.
pub const UNBOUNDED_NEW_TOKENS: u32 = 1 << 30;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub ignore_eos: bool,
    pub max_new_tokens: Option<u32>,
    pub json_schema: Option<String>,
    pub regex: Option<String>,
    pub skip_special_tokens: bool,
    pub spaces_between_special_tokens: bool,
    pub no_stop_trim: bool,
    pub stop: Option<Vec<String>>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_k: -1,
            top_p: 1.0,
            ignore_eos: false,
            max_new_tokens: Some(1024),
            json_schema: None,
            regex: None,
            skip_special_tokens: true,
            spaces_between_special_tokens: true,
            no_stop_trim: false,
            stop: None,
        }
    }
}

impl SamplingParams {
    pub fn max_new_tokens(&self) -> u32 {
        self.max_new_tokens.unwrap_or(UNBOUNDED_NEW_TOKENS)
    }

    pub fn has_grammar(&self) -> bool {
        self.json_schema.is_some() || self.regex.is_some()
    }
}

/// Terminal reason for a request. `None` on `Req::finished_reason` means the
/// request is still live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    Length,
    EosToken,
    StopStr { matched: String },
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchPhase {
    Prefill,
    Decode,
}

/// Distinguishes a generation request (prefill + iterative decode) from an
/// embedding request (single forward pass, no decode phase, no sampling).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReqKind {
    Generate,
    Embedding,
}

/// A single live request. Owns its token history and whatever per-request
/// constrained-decoding state it was created with; everything else
/// (KV slots, cache pins) is owned by the pools/caches it is admitted into.
#[derive(Debug, Clone)]
pub struct Req {
    pub rid: Arc<str>,
    pub origin_input_ids: Vec<i32>,
    pub output_ids: Vec<i32>,
    pub sampling_params: SamplingParams,
    pub grammar: Option<GrammarMatcher>,
    pub jump_forward_map: Option<Arc<JumpForwardMap>>,
    /// >0 while this request's prefill has started but not finished; such a
    /// request must never be treated as decodable.
    pub is_inflight_req: u32,
    pub req_pool_idx: Option<i32>,
    pub finished_reason: Option<FinishReason>,
    /// Length of the prefix this request matched in the active cache, as of
    /// the most recent `match_prefix` call.
    pub cached_len: usize,
    /// Count of tokens produced by an actual forward pass, i.e. excluding
    /// jump-forward skips (S4 requires this to stay flat across a skip while
    /// `output_ids.len()` advances by the skip length).
    pub completion_tokens_wo_jump_forward: usize,
    pub stream: bool,
    pub lora_path: Option<Arc<str>>,
    pub kind: ReqKind,
}

impl Req {
    pub fn new(rid: impl Into<Arc<str>>, origin_input_ids: Vec<i32>, sampling_params: SamplingParams) -> Self {
        Self {
            rid: rid.into(),
            origin_input_ids,
            output_ids: Vec::new(),
            sampling_params,
            grammar: None,
            jump_forward_map: None,
            is_inflight_req: 0,
            req_pool_idx: None,
            finished_reason: None,
            cached_len: 0,
            completion_tokens_wo_jump_forward: 0,
            stream: false,
            lora_path: None,
            kind: ReqKind::Generate,
        }
    }

    /// Full token sequence the cache should index: prompt followed by
    /// whatever has been generated so far.
    pub fn full_token_ids(&self) -> Vec<i32> {
        let mut ids = self.origin_input_ids.clone();
        ids.extend_from_slice(&self.output_ids);
        ids
    }

    pub fn prompt_tokens(&self) -> usize {
        self.origin_input_ids.len()
    }

    pub fn completion_tokens(&self) -> usize {
        self.output_ids.len()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_reason.is_some()
    }

    pub fn is_being_chunked(&self) -> bool {
        self.is_inflight_req > 0
    }
}

/// An ordered collection of requests destined for one forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardMode {
    Extend,
    Decode,
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeInfoSnapshot {
    pub available: usize,
    pub evictable: usize,
    pub capacity: usize,
}
