pub mod cache;
pub mod chunk_cache;
pub mod config;
pub mod error;
pub mod grammar;
pub mod io_struct;
pub mod jump_forward;
pub mod overlap;
pub mod policy;
pub mod pool;
pub mod prefill;
pub mod radix;
pub mod scheduler;
pub mod types;
pub mod worker;

pub use cache::{AnyCacheHandle, CacheBackend, CacheError, CacheImpl, PrefixCacheManager, SizeInfo};
pub use chunk_cache::{ChunkCache, ChunkCacheHandle};
pub use config::{SchedulerConfig, DECODE_LOG_INTERVAL};
pub use error::{SchedulerError, WorkerError};
pub use grammar::{
    GrammarError, GrammarKind, GrammarMatcher, GrammarStateCache, MAX_ROLLBACK_TOKENS,
};
pub use io_struct::{
    AbortReq, BatchEmbeddingOut, BatchTokenIDOut, FlushCacheReq, MetaInfo, ProfileReq,
    SchedulerMessage, SchedulerOutput, TokenizedEmbeddingReqInput, TokenizedGenerateReqInput,
    TokenizedRewardReqInput, UpdateWeightReqInput, UpdateWeightReqOutput,
};
pub use jump_forward::{JumpForwardCache, JumpForwardMap};
pub use overlap::{FutureTokenIdsMap, OverlapWorker};
pub use policy::SchedulePolicy;
pub use pool::{KvPool, PoolError, ReqSlotPool};
pub use prefill::{
    decode_inflight_tokens, forward_mode_of, make_input_mapping, make_input_tuple, make_positions,
    make_write_tuple, AddReqResult, ChunkedReqState, PendingReq, PrefillAdder, PrefillError,
    ScheduledReq,
};
pub use radix::{RadixCache, RadixCacheHandle, RadixCacheManager};
pub use scheduler::Scheduler;
pub use types::{
    FinishReason, ForwardMode, Req, ReqKind, SamplingParams, SizeInfoSnapshot,
    UNBOUNDED_NEW_TOKENS,
};
pub use worker::{BatchReqView, ForwardOutput, MemoryInfo, MockWorker, ScheduledBatch, Worker};
