//! Worker interface (`spec.md` §6 "Worker operations consumed"): the model
//! forward pass is an external collaborator reached only through this
//! trait. A trivial in-memory implementation ships for tests, in the same
//! spirit as a reference impl of a trait with no real backing store.

use std::sync::Arc;

use crate::error::WorkerError;
use crate::types::ForwardMode;

/// One request's worker-facing view inside a forward-pass batch: just
/// enough for a `Worker` impl to produce a next token, independent of the
/// admission controller's own bookkeeping types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReqView {
    pub rid: Arc<str>,
    pub req_pool_idx: i32,
    pub completion_tokens_so_far: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledBatch {
    pub reqs: Vec<BatchReqView>,
    pub mode: ForwardMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardOutput {
    /// One row of logits per request in the batch, vocab-sized.
    pub logits: Vec<Vec<f32>>,
    pub next_token_ids: Vec<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryInfo {
    pub max_total_num_tokens: usize,
    pub max_prefill_tokens: usize,
    pub max_running_requests: usize,
    pub max_req_input_len: usize,
    pub seed: u64,
}

pub trait Worker {
    fn forward_batch_generation(
        &mut self,
        batch: &ScheduledBatch,
    ) -> Result<ForwardOutput, WorkerError>;

    fn forward_batch_embedding(
        &mut self,
        batch: &ScheduledBatch,
    ) -> Result<Vec<Vec<f32>>, WorkerError>;

    fn get_token_and_memory_info(&self) -> MemoryInfo;

    fn update_weights(&mut self, path: &str) -> Result<(bool, String), WorkerError>;
}

/// Deterministic token-cycling worker used throughout the test suite: it
/// returns `vocab_size - 1` (a fixed EOS-like id) once a request's
/// generated length reaches `eos_after`, and otherwise cycles ids
/// `0..vocab_size-1`. No real forward pass, no accelerator.
#[derive(Debug, Clone)]
pub struct MockWorker {
    pub vocab_size: usize,
    pub eos_token_id: i32,
    pub eos_after: usize,
    pub memory_info: MemoryInfo,
}

impl MockWorker {
    pub fn new(vocab_size: usize, eos_after: usize) -> Self {
        Self {
            vocab_size,
            eos_token_id: (vocab_size as i32) - 1,
            eos_after,
            memory_info: MemoryInfo {
                max_total_num_tokens: 4096,
                max_prefill_tokens: 2048,
                max_running_requests: 256,
                max_req_input_len: 4096,
                seed: 0,
            },
        }
    }
}

impl Worker for MockWorker {
    fn forward_batch_generation(
        &mut self,
        batch: &ScheduledBatch,
    ) -> Result<ForwardOutput, WorkerError> {
        let mut logits = Vec::with_capacity(batch.reqs.len());
        let mut next_token_ids = Vec::with_capacity(batch.reqs.len());
        for req in &batch.reqs {
            let mut row = vec![0.0f32; self.vocab_size];
            let produced = req.completion_tokens_so_far;
            let next_id = if produced + 1 >= self.eos_after {
                self.eos_token_id
            } else {
                (produced as i32) % (self.vocab_size as i32 - 1)
            };
            row[next_id as usize] = 1.0;
            logits.push(row);
            next_token_ids.push(next_id);
        }
        Ok(ForwardOutput {
            logits,
            next_token_ids,
        })
    }

    fn forward_batch_embedding(
        &mut self,
        batch: &ScheduledBatch,
    ) -> Result<Vec<Vec<f32>>, WorkerError> {
        Ok(batch
            .reqs
            .iter()
            .map(|_| vec![0.0f32; self.vocab_size])
            .collect())
    }

    fn get_token_and_memory_info(&self) -> MemoryInfo {
        self.memory_info
    }

    fn update_weights(&mut self, path: &str) -> Result<(bool, String), WorkerError> {
        if path.is_empty() {
            return Err(WorkerError::WeightUpdate("empty path".to_string()));
        }
        Ok((true, format!("loaded weights from {path}")))
    }
}
