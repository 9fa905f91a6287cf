//! The native-library contract (spec'd in the "external interfaces" section)
//! expressed as a trait, so the adapter's control flow can run against a
//! [`MockBackend`] without a GGUF file or `llama-cpp-2` present — mirrored on
//! the teacher's own `chat_mock.rs`, which swaps a mock `ChatEngine` in
//! behind a Cargo feature for the same reason.

use slm_types::{AdapterError, KvCacheType, Result};

/// Metadata queried once at model load.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub n_embd: u32,
    pub n_ctx_train: u32,
    pub vocab_size: u32,
    pub n_params: u64,
    pub description: String,
    pub chat_template: Option<String>,
    pub has_encoder: bool,
}

/// Parameters for `context_new`, one-to-one with the native contract.
#[derive(Debug, Clone)]
pub struct ContextParams {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_threads: u32,
    pub n_threads_batch: u32,
    pub embeddings: bool,
    pub flash_attn: bool,
    pub kv_type_k: KvCacheType,
    pub kv_type_v: KvCacheType,
}

/// Structural parameters for `sampler_chain_new`: penalties -> top-k -> top-p
/// -> min-p -> temperature -> {greedy | distribution(seed)}.
#[derive(Debug, Clone, Copy)]
pub struct SamplerParams {
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub repeat_penalty: f32,
    pub repeat_last_n: i32,
    pub seed: u32,
    pub greedy: bool,
}

/// The ABI the Adapter depends on. One production implementation
/// ([`LlamaBackend`]) wraps `llama-cpp-2`; [`MockBackend`] is a
/// deterministic test double with the same contract.
pub trait NativeBackend {
    type Model;
    type Context;
    type Sampler;
    type Vision;

    fn model_load(
        &self,
        path: &str,
        gpu_layers: u32,
        use_mmap: bool,
        use_mlock: bool,
    ) -> Result<Self::Model>;
    fn model_info(&self, model: &Self::Model) -> ModelInfo;
    fn tokenize(
        &self,
        model: &Self::Model,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<u32>>;
    fn token_to_piece(&self, model: &Self::Model, token: u32) -> Result<Vec<u8>>;
    fn token_is_eog(&self, model: &Self::Model, token: u32) -> bool;
    fn token_bos(&self, model: &Self::Model) -> u32;
    fn token_eos(&self, model: &Self::Model) -> u32;

    fn context_new(&self, model: &Self::Model, params: &ContextParams) -> Result<Self::Context>;
    /// Evaluate `tokens` starting at `pos_start`; returns last-position logits.
    fn context_decode(
        &self,
        ctx: &mut Self::Context,
        tokens: &[u32],
        pos_start: u32,
    ) -> Result<Vec<f32>>;
    /// Evaluate `tokens` starting at `pos_start`; returns logits at every position.
    fn context_decode_logits_all(
        &self,
        ctx: &mut Self::Context,
        tokens: &[u32],
        pos_start: u32,
    ) -> Result<Vec<Vec<f32>>>;
    fn context_encode(&self, ctx: &mut Self::Context, tokens: &[u32]) -> Result<Vec<f32>>;
    fn context_get_logits_at(&self, ctx: &Self::Context, idx: usize) -> Vec<f32>;
    fn context_get_embeddings_seq(&self, ctx: &Self::Context, seq_id: u32) -> Vec<f32>;

    fn kv_clear(&self, ctx: &mut Self::Context);
    fn kv_seq_rm(&self, ctx: &mut Self::Context, seq_id: u32, p0: u32, p1: u32);
    fn kv_seq_add(&self, ctx: &mut Self::Context, seq_id: u32, p0: u32, p1: u32, delta: i32);

    fn sampler_chain_new(&self, params: &SamplerParams, model: &Self::Model) -> Self::Sampler;
    fn sampler_sample(&self, sampler: &mut Self::Sampler, ctx: &mut Self::Context, idx: i32) -> u32;
    fn sampler_reset(&self, sampler: &mut Self::Sampler);

    fn vision_init(
        &self,
        mmproj_path: &str,
        model: &Self::Model,
        n_threads: u32,
        use_gpu: bool,
    ) -> Result<Self::Vision>;
    /// Returns the new `n_past` after evaluating the prompt + images.
    fn vision_eval(
        &self,
        vision: &mut Self::Vision,
        ctx: &mut Self::Context,
        prompt: &str,
        image_paths: &[String],
        n_past: u32,
        n_batch: u32,
    ) -> Result<u32>;
}

pub mod llama;
pub mod mock;

pub use llama::LlamaBackend;
pub use mock::MockBackend;

pub(crate) fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
            if v > bv {
                (i, v)
            } else {
                (bi, bv)
            }
        })
        .0 as u32
}

pub(crate) fn kv_overflow(msg: impl Into<String>) -> AdapterError {
    AdapterError::KvOverflow(msg.into())
}
