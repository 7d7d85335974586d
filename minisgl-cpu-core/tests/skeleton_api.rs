use std::sync::mpsc;
use std::sync::Arc;

use minisgl_cpu_core::{
    CacheImpl, MockWorker, SamplingParams, Scheduler, SchedulerConfig, SchedulerMessage,
    SchedulerOutput, TokenizedGenerateReqInput,
};

#[test]
fn sampling_params_defaults_match_server_contract() {
    let params = SamplingParams::default();
    assert_eq!(params.temperature, 0.0);
    assert_eq!(params.top_k, -1);
    assert_eq!(params.top_p, 1.0);
    assert!(!params.ignore_eos);
    assert_eq!(params.max_new_tokens(), 1024);
}

#[test]
fn scheduler_admits_and_drains_a_single_request() {
    let mut cfg = SchedulerConfig::from_env();
    cfg.max_total_num_tokens = 64;
    cfg.max_prefill_tokens = 64;
    cfg.req_slot_capacity = 8;
    cfg.max_running_requests = 8;

    let (in_tx, in_rx) = mpsc::channel();
    let (out_tx, out_rx) = mpsc::channel();
    let worker = MockWorker::new(8, 3);
    let mut scheduler = Scheduler::new(cfg, CacheImpl::new_radix(), worker, Vec::new(), in_rx, out_tx);

    in_tx
        .send(SchedulerMessage::Generate(TokenizedGenerateReqInput {
            rid: Arc::from("skeleton-r1"),
            input_text: String::new(),
            input_ids: vec![1, 2, 3, 4],
            sampling_params: SamplingParams {
                max_new_tokens: Some(2),
                ..SamplingParams::default()
            },
            image_inputs: None,
            return_logprob: false,
            top_logprobs_num: 0,
            stream: false,
            logprob_start_len: -1,
            lora_path: None,
        }))
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
