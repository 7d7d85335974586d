//! Explicit, env-derived configuration constructed once at startup. Mirrors
//! `minisgl-cpu-gateway`'s `GatewayConfig::from_env` pattern: parse the
//! environment exactly once, never inside the scheduler loop (`spec.md` §9,
//! "Global mutable state").

use std::env;

/// Profiler/stats logging cadence, in iterations (`spec.md` §6 "Constants").
pub const DECODE_LOG_INTERVAL: u64 = 40;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// `SGLANG_IS_IN_CI`: crash the process on invariant drift instead of
    /// warning and continuing.
    pub crash_on_warning: bool,
    /// `SGLANG_TEST_RETRACT`: force decode retraction once the running
    /// batch exceeds 10 requests, for deterministic tests.
    pub test_retract: bool,
    /// `SGLANG_TORCH_PROFILER_DIR`: directory the profiler writes traces
    /// to; `None` disables profiling.
    pub torch_profiler_dir: Option<String>,

    pub base_min_new_token_ratio: f32,
    pub new_token_ratio_decay: f32,
    pub schedule_conservativeness: f32,
    pub init_new_token_ratio: f32,

    pub max_running_requests: usize,
    pub max_prefill_tokens: usize,
    pub max_req_input_len: usize,
    pub max_total_num_tokens: usize,
    pub req_slot_capacity: usize,

    /// `None` disables chunked prefill entirely.
    pub chunked_prefill_size: Option<usize>,
    pub enable_mixed_chunk: bool,
    pub max_loras_per_batch: usize,
    pub stream_interval: u64,
    pub num_continuous_decode_steps: u32,
    pub disable_regex_jump_forward: bool,
}

impl SchedulerConfig {
    /// Conservative defaults sized for the test doubles used across this
    /// crate's tests; production call sites override via
    /// `get_token_and_memory_info()` results before constructing this.
    pub fn from_env() -> Self {
        let crash_on_warning = env_flag("SGLANG_IS_IN_CI");
        let test_retract = env_flag("SGLANG_TEST_RETRACT");
        let torch_profiler_dir = env::var("SGLANG_TORCH_PROFILER_DIR").ok();

        let schedule_conservativeness = env_parse("MINISGL_SCHEDULE_CONSERVATIVENESS", 1.0);
        let base_min_new_token_ratio = env_parse("MINISGL_BASE_MIN_NEW_TOKEN_RATIO", 0.1);
        let new_token_ratio_decay = env_parse("MINISGL_NEW_TOKEN_RATIO_DECAY", 0.001);
        let init_new_token_ratio = env_parse("MINISGL_INIT_NEW_TOKEN_RATIO", 0.7);

        Self {
            crash_on_warning,
            test_retract,
            torch_profiler_dir,
            base_min_new_token_ratio: base_min_new_token_ratio * schedule_conservativeness,
            new_token_ratio_decay,
            schedule_conservativeness,
            init_new_token_ratio: init_new_token_ratio * schedule_conservativeness,
            max_running_requests: env_parse("MINISGL_MAX_RUNNING_REQUESTS", 256usize),
            max_prefill_tokens: env_parse("MINISGL_MAX_PREFILL_TOKENS", 16_384usize),
            max_req_input_len: env_parse("MINISGL_MAX_REQ_INPUT_LEN", 32_768usize),
            max_total_num_tokens: env_parse("MINISGL_MAX_TOTAL_NUM_TOKENS", 131_072usize),
            req_slot_capacity: env_parse("MINISGL_REQ_SLOT_CAPACITY", 256usize),
            chunked_prefill_size: env::var("MINISGL_CHUNKED_PREFILL_SIZE")
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .and_then(|v| if v <= 0 { None } else { Some(v as usize) }),
            enable_mixed_chunk: env_flag("MINISGL_ENABLE_MIXED_CHUNK"),
            max_loras_per_batch: env_parse("MINISGL_MAX_LORAS_PER_BATCH", 8usize),
            stream_interval: env_parse("MINISGL_STREAM_INTERVAL", 1u64),
            num_continuous_decode_steps: env_parse("MINISGL_NUM_CONTINUOUS_DECODE_STEPS", 1u32),
            disable_regex_jump_forward: env_flag("MINISGL_DISABLE_REGEX_JUMP_FORWARD"),
        }
    }

    pub fn min_new_token_ratio(&self) -> f32 {
        self.base_min_new_token_ratio
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "True" | "TRUE"))
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_stable_without_env() {
        let cfg = SchedulerConfig::from_env();
        assert!(!cfg.crash_on_warning);
        assert!(!cfg.test_retract);
        assert!(cfg.chunked_prefill_size.is_none() || cfg.chunked_prefill_size.unwrap() > 0);
        assert_eq!(cfg.min_new_token_ratio(), cfg.base_min_new_token_ratio);
    }
}
