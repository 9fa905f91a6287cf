//! On-device SLM inference runtime: model/context lifecycle, KV-cache
//! management, sampler reuse, speculative decoding, and the single-mutex
//! [`Adapter`] entry point that ties them together.

mod adapter;
mod cancel;
mod context;
mod error;
mod model;
mod native;
mod preset;
mod prompt_cache;
mod sampler;
mod speculative;
mod stop_ring;
mod vision;

pub use adapter::Adapter;
pub use cancel::CancelToken;
pub use context::Context;
pub use error::{AdapterError, Result};
pub use model::Model;
pub use native::{ContextParams, LlamaBackend, ModelInfo, MockBackend, NativeBackend, SamplerParams};
pub use preset::{apply_preset, find_preset};
pub use prompt_cache::PromptCache;
pub use sampler::SamplerChain;
pub use speculative::{SpeculativeEngine, SpeculativeRound};
pub use stop_ring::StopRing;
pub use vision::{inject_media_markers, VisionContext};

pub use slm_types::{
    AdapterConfig, FinishReason, FlashAttention, GenerationOptions, KvCacheType, PresetEntry,
    Request, Response, SamplerKey, Stats, StreamEvent,
};
