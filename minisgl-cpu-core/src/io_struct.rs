//! External interfaces (`spec.md` §6): the inbound request channel and the
//! outbound channel to the detokenizer, realized as tagged Rust enums
//! instead of Python's dynamically-dispatched message objects (per the
//! DESIGN NOTE "model as a tagged variant/sum type").

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{FinishReason, SamplingParams};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenizedGenerateReqInput {
    pub rid: Arc<str>,
    pub input_text: String,
    pub input_ids: Vec<i32>,
    pub sampling_params: SamplingParams,
    pub image_inputs: Option<Vec<u8>>,
    pub return_logprob: bool,
    pub top_logprobs_num: u32,
    pub stream: bool,
    pub logprob_start_len: i32,
    pub lora_path: Option<Arc<str>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenizedEmbeddingReqInput {
    pub rid: Arc<str>,
    pub input_text: String,
    pub input_ids: Vec<i32>,
    pub sampling_params: SamplingParams,
}

/// Same shape as `TokenizedEmbeddingReqInput` (`spec.md` §6).
pub type TokenizedRewardReqInput = TokenizedEmbeddingReqInput;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlushCacheReq;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AbortReq {
    pub rid: Arc<str>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateWeightReqInput {
    pub model_path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProfileReq {
    Start,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SchedulerMessage {
    Generate(TokenizedGenerateReqInput),
    Embedding(TokenizedEmbeddingReqInput),
    Reward(TokenizedRewardReqInput),
    FlushCache(FlushCacheReq),
    Abort(AbortReq),
    UpdateWeight(UpdateWeightReqInput),
    Profile(ProfileReq),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetaInfo {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub completion_tokens_wo_jump_forward: usize,
    pub finish_reason: Option<FinishReason>,
    pub input_token_logprobs: Option<Vec<f32>>,
    pub output_token_logprobs: Option<Vec<f32>>,
    pub input_top_logprobs: Option<Vec<Vec<(i32, f32)>>>,
    pub output_top_logprobs: Option<Vec<Vec<(i32, f32)>>>,
    pub normalized_prompt_logprob: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchTokenIDOut {
    pub rids: Vec<Arc<str>>,
    pub vids: Vec<i32>,
    pub decoded_texts: Vec<String>,
    pub read_ids: Vec<Vec<i32>>,
    pub read_offsets: Vec<usize>,
    pub skip_special_tokens: Vec<bool>,
    pub spaces_between_special_tokens: Vec<bool>,
    pub meta_info: Vec<MetaInfo>,
    pub finished_reason: Vec<Option<FinishReason>>,
    pub no_stop_trim: Vec<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchEmbeddingOut {
    pub rids: Vec<Arc<str>>,
    pub embeddings: Vec<Vec<f32>>,
    pub meta_info: Vec<MetaInfo>,
    pub finished_reason: Vec<Option<FinishReason>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateWeightReqOutput {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SchedulerOutput {
    TokenIds(BatchTokenIDOut),
    Embedding(BatchEmbeddingOut),
    UpdateWeight(UpdateWeightReqOutput),
}
