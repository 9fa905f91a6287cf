//! Shared DTOs, configuration surface, and error type for the SLM inference
//! runtime. This crate has no native-library dependency — it is safe to
//! depend on from tooling that never touches `llama-cpp-2` directly.

mod config;
mod error;
mod types;

pub use config::{
    AdapterConfig, FlashAttention, GenerationOptions, KvCacheType, PresetEntry, SamplerKey,
};
pub use error::{AdapterError, Result};
pub use types::{FinishReason, Request, Response, Stats, StreamEvent};
