//! Overlap Worker Shim (`spec.md` §4.8, optional fast path): lets the
//! scheduler submit batch N+1 before batch N's `next_token_ids` reach the
//! host, by handing out negative placeholder ids and resolving them once
//! the real ids land.
//!
//! `tp_worker_overlap_thread.py` in the original was filtered to its
//! license header only, so the queue/thread structure below is original
//! code grounded directly on `spec.md` §4.8/§5 ("two queues, two host
//! events, `resolve_batch_result`"), not a port. `std::thread` +
//! `std::sync::mpsc` stands in for the dedicated accelerator stream and
//! its two queues, matching the DESIGN NOTE "one bounded background
//! worker, no hidden task scheduler".

use std::sync::mpsc::{self, Receiver, RecvError, Sender};
use std::thread::JoinHandle;

use crate::error::WorkerError;
use crate::worker::{ForwardOutput, ScheduledBatch, Worker};

/// Counter wraps modulo `3 * max_running_requests`; the backing store is
/// sized `5 * max_running_requests` to guarantee non-overlap between two
/// in-flight generations (`spec.md` §4.8).
pub fn future_token_ids_limit(max_running_requests: usize) -> i64 {
    3 * max_running_requests as i64
}

pub fn future_map_capacity(max_running_requests: usize) -> usize {
    5 * max_running_requests
}

/// Maps negative placeholder ids to the real token id that will eventually
/// land there. `alloc(bs)` hands out a contiguous range
/// `[-(ct+1), -(ct+bs)]` and advances the counter with wraparound.
#[derive(Debug)]
pub struct FutureTokenIdsMap {
    counter: i64,
    limit: i64,
    store: Vec<i32>,
}

impl FutureTokenIdsMap {
    pub fn new(max_running_requests: usize) -> Self {
        Self {
            counter: 0,
            limit: future_token_ids_limit(max_running_requests),
            store: vec![0; future_map_capacity(max_running_requests)],
        }
    }

    /// Allocates `bs` placeholder ids and returns them most-recent-first,
    /// matching the original's `-(ct+1) ..= -(ct+bs)` range.
    pub fn alloc(&mut self, bs: usize) -> Vec<i32> {
        let ct = self.counter;
        let ids = (1..=bs as i64).map(|k| -(ct + k) as i32).collect();
        self.counter = (self.counter + bs as i64) % self.limit.max(1);
        ids
    }

    fn slot_for(&self, placeholder: i32) -> usize {
        (-placeholder as usize) % self.store.len()
    }

    pub fn resolve(&self, placeholder: i32) -> i32 {
        if placeholder >= 0 {
            placeholder
        } else {
            self.store[self.slot_for(placeholder)]
        }
    }

    /// Rewrites `input_ids` in place: `where(id < 0, future_map[-id], id)`.
    pub fn rewrite(&self, input_ids: &mut [i32]) {
        for id in input_ids.iter_mut() {
            if *id < 0 {
                *id = self.resolve(*id);
            }
        }
    }

    /// Records the real ids a placeholder range resolves to, once they
    /// land on the host.
    pub fn fulfill(&mut self, placeholders: &[i32], real_ids: &[i32]) {
        for (&placeholder, &real) in placeholders.iter().zip(real_ids) {
            let slot = self.slot_for(placeholder);
            self.store[slot] = real;
        }
    }
}

enum WorkItem {
    Generation(ScheduledBatch),
    Embedding(ScheduledBatch),
    Shutdown,
}

enum WorkResult {
    Generation(Result<ForwardOutput, WorkerError>),
    Embedding(Result<Vec<Vec<f32>>, WorkerError>),
}

/// Producer (scheduler) / consumer (worker thread) single-slot pipeline.
/// The scheduler enqueues a batch and immediately receives placeholder ids
/// to embed in the *next* batch's input_ids, then later calls
/// `resolve_batch_result` to block on this batch's real results.
pub struct OverlapWorker {
    input_tx: Sender<WorkItem>,
    output_rx: Receiver<WorkResult>,
    handle: Option<JoinHandle<()>>,
}

impl OverlapWorker {
    pub fn spawn<W: Worker + Send + 'static>(mut worker: W) -> Self {
        let (input_tx, input_rx) = mpsc::channel::<WorkItem>();
        let (output_tx, output_rx) = mpsc::channel::<WorkResult>();

        let handle = std::thread::spawn(move || {
            while let Ok(item) = input_rx.recv() {
                let result = match item {
                    WorkItem::Generation(batch) => {
                        WorkResult::Generation(worker.forward_batch_generation(&batch))
                    }
                    WorkItem::Embedding(batch) => {
                        WorkResult::Embedding(worker.forward_batch_embedding(&batch))
                    }
                    WorkItem::Shutdown => break,
                };
                if output_tx.send(result).is_err() {
                    break;
                }
            }
        });

        Self {
            input_tx,
            output_rx,
            handle: Some(handle),
        }
    }

    pub fn submit_generation(&self, batch: ScheduledBatch) {
        let _ = self.input_tx.send(WorkItem::Generation(batch));
    }

    pub fn submit_embedding(&self, batch: ScheduledBatch) {
        let _ = self.input_tx.send(WorkItem::Embedding(batch));
    }

    /// Blocks until the most recently submitted batch's results land on
    /// the host (`copy_done` in the original), then returns them.
    pub fn resolve_batch_result(&self) -> Result<ForwardOutput, WorkerError> {
        match self.output_rx.recv() {
            Ok(WorkResult::Generation(result)) => result,
            Ok(WorkResult::Embedding(_)) => {
                Err(WorkerError::Forward("expected generation result, got embedding".to_string()))
            }
            Err(RecvError) => Err(WorkerError::Forward("worker thread disconnected".to_string())),
        }
    }

    pub fn resolve_embedding_result(&self) -> Result<Vec<Vec<f32>>, WorkerError> {
        match self.output_rx.recv() {
            Ok(WorkResult::Embedding(result)) => result,
            Ok(WorkResult::Generation(_)) => {
                Err(WorkerError::Forward("expected embedding result, got generation".to_string()))
            }
            Err(RecvError) => Err(WorkerError::Forward("worker thread disconnected".to_string())),
        }
    }
}

impl Drop for OverlapWorker {
    fn drop(&mut self) {
        let _ = self.input_tx.send(WorkItem::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{BatchReqView, MockWorker};
    use crate::types::ForwardMode;

    fn batch(n: usize) -> ScheduledBatch {
        ScheduledBatch {
            reqs: (0..n)
                .map(|i| BatchReqView {
                    rid: std::sync::Arc::from(format!("r{i}")),
                    req_pool_idx: i as i32,
                    completion_tokens_so_far: 0,
                })
                .collect(),
            mode: ForwardMode::Decode,
        }
    }

    #[test]
    fn future_map_alloc_and_resolve_round_trip() {
        let mut map = FutureTokenIdsMap::new(4);
        let placeholders = map.alloc(3);
        assert_eq!(placeholders, vec![-1, -2, -3]);
        map.fulfill(&placeholders, &[10, 11, 12]);
        for (p, expected) in placeholders.iter().zip([10, 11, 12]) {
            assert_eq!(map.resolve(*p), expected);
        }
    }

    #[test]
    fn rewrite_only_touches_negative_ids() {
        let mut map = FutureTokenIdsMap::new(4);
        let placeholders = map.alloc(2);
        map.fulfill(&placeholders, &[7, 8]);
        let mut ids = vec![placeholders[0], 99, placeholders[1]];
        map.rewrite(&mut ids);
        assert_eq!(ids, vec![7, 99, 8]);
    }

    #[test]
    fn counter_wraps_modulo_limit() {
        let mut map = FutureTokenIdsMap::new(1); // limit = 3
        let _ = map.alloc(2);
        let second = map.alloc(2);
        // counter started at 2, wrapped to 2 % 3 = 2 -> ids -(2+1), -(2+2)
        assert_eq!(second, vec![-3, -4]);
    }

    #[test]
    fn overlap_worker_round_trips_one_batch() {
        let worker = MockWorker::new(4, 100);
        let shim = OverlapWorker::spawn(worker);
        shim.submit_generation(batch(2));
        let result = shim.resolve_batch_result().unwrap();
        assert_eq!(result.next_token_ids.len(), 2);
    }
}
