//! Production [`NativeBackend`] over `llama-cpp-2`. Mirrors the teacher's
//! direct usage in `generation.rs` (context params, batch construction,
//! `'static` lifetime erasure) but exposes it through the trait boundary
//! instead of being called inline from the adapter.

use std::num::NonZeroU32;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend as RawBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use slm_types::{AdapterError, KvCacheType as SlmKvType, Result};

use super::{ContextParams, ModelInfo, NativeBackend, SamplerParams};

fn to_ffi_kv_type(t: SlmKvType) -> llama_cpp_2::context::params::KvCacheType {
    use llama_cpp_2::context::params::KvCacheType as Ffi;
    match t {
        SlmKvType::F16 => Ffi::F16,
        SlmKvType::Q8_0 => Ffi::Q8_0,
        SlmKvType::Q4_0 => Ffi::Q4_0,
    }
}

/// A [`LlamaContext`] plus the scratch [`LlamaBatch`] it reuses across calls.
/// Lifetime erased to `'static` exactly as the teacher's `InferenceCache`
/// does — SAFETY: the owning `Model` (held by the `Adapter`, declared after
/// its contexts in field order) must outlive this value; enforced by close
/// ordering (context before model) rather than the type system.
pub struct LlamaContextHandle {
    ctx: LlamaContext<'static>,
    batch: LlamaBatch,
}

#[cfg(feature = "vision")]
pub struct LlamaVisionHandle {
    mtmd: llama_cpp_2::mtmd::MtmdContext,
}

#[cfg(not(feature = "vision"))]
pub struct LlamaVisionHandle(std::convert::Infallible);

/// Production backend wrapping one global `llama.cpp` library handle.
pub struct LlamaBackend {
    raw: RawBackend,
}

impl LlamaBackend {
    pub fn new() -> Result<Self> {
        let raw = RawBackend::init()
            .map_err(|e| AdapterError::NativeInit(format!("backend init failed: {e}")))?;
        Ok(Self { raw })
    }
}

impl NativeBackend for LlamaBackend {
    type Model = LlamaModel;
    type Context = LlamaContextHandle;
    type Sampler = LlamaSampler;
    type Vision = LlamaVisionHandle;

    fn model_load(
        &self,
        path: &str,
        gpu_layers: u32,
        use_mmap: bool,
        use_mlock: bool,
    ) -> Result<Self::Model> {
        let params = LlamaModelParams::default()
            .with_n_gpu_layers(gpu_layers)
            .with_use_mmap(use_mmap)
            .with_use_mlock(use_mlock);
        LlamaModel::load_from_file(&self.raw, path, &params)
            .map_err(|e| AdapterError::NativeInit(format!("model load failed: {e}")))
    }

    fn model_info(&self, model: &Self::Model) -> ModelInfo {
        ModelInfo {
            n_embd: model.n_embd(),
            n_ctx_train: model.n_ctx_train(),
            vocab_size: model.n_vocab() as u32,
            n_params: model.n_params(),
            description: model.desc().unwrap_or_default(),
            chat_template: model.chat_template(None).ok().map(|t| t.to_string()),
            has_encoder: model.has_encoder(),
        }
    }

    fn tokenize(
        &self,
        model: &Self::Model,
        text: &str,
        add_special: bool,
        _parse_special: bool,
    ) -> Result<Vec<u32>> {
        let add_bos = if add_special { AddBos::Always } else { AddBos::Never };
        let tokens = model
            .str_to_token(text, add_bos)
            .map_err(|e| AdapterError::Tokenization(e.to_string()))?;
        if tokens.is_empty() {
            return Err(AdapterError::Tokenization("tokenization produced no tokens".into()));
        }
        Ok(tokens.into_iter().map(|t| t.0 as u32).collect())
    }

    fn token_to_piece(&self, model: &Self::Model, token: u32) -> Result<Vec<u8>> {
        #[allow(deprecated)]
        model
            .token_to_str(LlamaToken(token as i32), llama_cpp_2::model::Special::Tokenize)
            .map(String::into_bytes)
            .map_err(|e| AdapterError::Decode(format!("token_to_piece failed: {e}")))
    }

    fn token_is_eog(&self, model: &Self::Model, token: u32) -> bool {
        model.is_eog_token(LlamaToken(token as i32))
    }

    fn token_bos(&self, model: &Self::Model) -> u32 {
        model.token_bos().0 as u32
    }

    fn token_eos(&self, model: &Self::Model) -> u32 {
        model.token_eos().0 as u32
    }

    fn context_new(&self, model: &Self::Model, params: &ContextParams) -> Result<Self::Context> {
        let n_ctx = NonZeroU32::new(params.n_ctx)
            .ok_or_else(|| AdapterError::Configuration("context_size must be non-zero".into()))?;
        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(params.n_batch)
            .with_embeddings(params.embeddings)
            .with_type_k(to_ffi_kv_type(params.kv_type_k))
            .with_type_v(to_ffi_kv_type(params.kv_type_v));
        if params.n_threads > 0 {
            ctx_params = ctx_params.with_n_threads(params.n_threads);
        }
        if params.n_threads_batch > 0 {
            ctx_params = ctx_params.with_n_threads_batch(params.n_threads_batch);
        }
        if params.flash_attn {
            ctx_params = ctx_params.with_flash_attention_policy(1);
        }

        // SAFETY: erases the borrow of `model`; the adapter's close ordering
        // guarantees this context is dropped before its model.
        let ctx = unsafe {
            let real = model
                .new_context(&self.raw, ctx_params)
                .map_err(|e| AdapterError::NativeInit(format!("context creation failed: {e}")))?;
            std::mem::transmute::<LlamaContext<'_>, LlamaContext<'static>>(real)
        };
        let batch = LlamaBatch::new(params.n_batch as usize, 1);
        Ok(LlamaContextHandle { ctx, batch })
    }

    fn context_decode(
        &self,
        ctx: &mut Self::Context,
        tokens: &[u32],
        pos_start: u32,
    ) -> Result<Vec<f32>> {
        ctx.batch.clear();
        let last = tokens.len() - 1;
        for (i, &tok) in tokens.iter().enumerate() {
            let pos = pos_start as i32 + i as i32;
            ctx.batch
                .add(LlamaToken(tok as i32), pos, &[0], i == last)
                .map_err(|e| AdapterError::Decode(format!("batch add failed: {e}")))?;
        }
        ctx.ctx
            .decode(&mut ctx.batch)
            .map_err(|e| AdapterError::Decode(format!("decode failed: {e}")))?;
        Ok(ctx.ctx.get_logits_ith(last as i32).to_vec())
    }

    fn context_decode_logits_all(
        &self,
        ctx: &mut Self::Context,
        tokens: &[u32],
        pos_start: u32,
    ) -> Result<Vec<Vec<f32>>> {
        ctx.batch.clear();
        for (i, &tok) in tokens.iter().enumerate() {
            let pos = pos_start as i32 + i as i32;
            ctx.batch
                .add(LlamaToken(tok as i32), pos, &[0], true)
                .map_err(|e| AdapterError::Decode(format!("batch add failed: {e}")))?;
        }
        ctx.ctx
            .decode(&mut ctx.batch)
            .map_err(|e| AdapterError::Decode(format!("decode failed: {e}")))?;
        Ok((0..tokens.len() as i32).map(|i| ctx.ctx.get_logits_ith(i).to_vec()).collect())
    }

    fn context_encode(&self, ctx: &mut Self::Context, tokens: &[u32]) -> Result<Vec<f32>> {
        ctx.batch.clear();
        let last = tokens.len() - 1;
        for (i, &tok) in tokens.iter().enumerate() {
            ctx.batch
                .add(LlamaToken(tok as i32), i as i32, &[0], i == last)
                .map_err(|e| AdapterError::Decode(format!("batch add failed: {e}")))?;
        }
        ctx.ctx
            .encode(&mut ctx.batch)
            .map_err(|e| AdapterError::Decode(format!("encode failed: {e}")))?;
        Ok(ctx.ctx.embeddings_seq_ith(0).unwrap_or_default().to_vec())
    }

    fn context_get_logits_at(&self, ctx: &Self::Context, idx: usize) -> Vec<f32> {
        ctx.ctx.get_logits_ith(idx as i32).to_vec()
    }

    fn context_get_embeddings_seq(&self, ctx: &Self::Context, seq_id: u32) -> Vec<f32> {
        ctx.ctx.embeddings_seq_ith(seq_id as i32).unwrap_or_default().to_vec()
    }

    fn kv_clear(&self, ctx: &mut Self::Context) {
        ctx.ctx.clear_kv_cache();
    }

    fn kv_seq_rm(&self, ctx: &mut Self::Context, seq_id: u32, p0: u32, p1: u32) {
        ctx.ctx.kv_cache_seq_rm(seq_id as i32, Some(p0 as i32), Some(p1 as i32));
    }

    fn kv_seq_add(&self, ctx: &mut Self::Context, seq_id: u32, p0: u32, p1: u32, delta: i32) {
        ctx.ctx.kv_cache_seq_add(seq_id as i32, Some(p0 as i32), Some(p1 as i32), delta);
    }

    fn sampler_chain_new(&self, params: &SamplerParams, _model: &Self::Model) -> Self::Sampler {
        let mut chain: Vec<LlamaSampler> = Vec::new();
        if params.repeat_penalty > 1.0 {
            chain.push(LlamaSampler::penalties(params.repeat_last_n, params.repeat_penalty, 0.0, 0.0));
        }
        if params.greedy {
            chain.push(LlamaSampler::greedy());
            return LlamaSampler::chain_simple(chain);
        }
        chain.push(LlamaSampler::temp(params.temperature));
        if params.top_k > 0 {
            chain.push(LlamaSampler::top_k(params.top_k));
        }
        if params.top_p > 0.0 {
            chain.push(LlamaSampler::top_p(params.top_p, 1));
        }
        if params.min_p > 0.0 {
            chain.push(LlamaSampler::min_p(params.min_p, 1));
        }
        chain.push(LlamaSampler::dist(params.seed));
        LlamaSampler::chain_simple(chain)
    }

    fn sampler_sample(&self, sampler: &mut Self::Sampler, ctx: &mut Self::Context, idx: i32) -> u32 {
        sampler.sample(&ctx.ctx, idx).0 as u32
    }

    fn sampler_reset(&self, sampler: &mut Self::Sampler) {
        sampler.reset();
    }

    #[cfg(feature = "vision")]
    fn vision_init(
        &self,
        mmproj_path: &str,
        model: &Self::Model,
        n_threads: u32,
        use_gpu: bool,
    ) -> Result<Self::Vision> {
        let mtmd = llama_cpp_2::mtmd::MtmdContext::init_from_file(mmproj_path, model, n_threads, use_gpu)
            .map_err(|e| AdapterError::Vision(format!("mmproj load failed: {e}")))?;
        Ok(LlamaVisionHandle { mtmd })
    }

    #[cfg(not(feature = "vision"))]
    fn vision_init(
        &self,
        _mmproj_path: &str,
        _model: &Self::Model,
        _n_threads: u32,
        _use_gpu: bool,
    ) -> Result<Self::Vision> {
        Err(AdapterError::Vision("vision feature not enabled".into()))
    }

    #[cfg(feature = "vision")]
    fn vision_eval(
        &self,
        vision: &mut Self::Vision,
        ctx: &mut Self::Context,
        prompt: &str,
        image_paths: &[String],
        n_past: u32,
        n_batch: u32,
    ) -> Result<u32> {
        use llama_cpp_2::mtmd::{MtmdBitmap, MtmdInputText};

        let bitmaps: Vec<MtmdBitmap> = image_paths
            .iter()
            .map(|p| {
                MtmdBitmap::from_file(&vision.mtmd, p)
                    .map_err(|e| AdapterError::Vision(format!("image load failed ({p}): {e}")))
            })
            .collect::<Result<_>>()?;
        let bitmap_refs: Vec<&MtmdBitmap> = bitmaps.iter().collect();

        let text_input = MtmdInputText {
            text: prompt.to_string(),
            add_special: n_past == 0,
            parse_special: true,
        };
        let chunks = vision
            .mtmd
            .tokenize(text_input, &bitmap_refs)
            .map_err(|e| AdapterError::Vision(format!("vision tokenization failed: {e}")))?;

        let new_past = chunks
            .eval_chunks(&vision.mtmd, &ctx.ctx, n_past as i32, 0, n_batch as i32, true)
            .map_err(|e| AdapterError::Vision(format!("vision eval failed: {e}")))?;
        if new_past < 0 {
            return Err(AdapterError::Vision(format!("vision eval returned rc={new_past}")));
        }
        Ok(new_past as u32)
    }

    #[cfg(not(feature = "vision"))]
    fn vision_eval(
        &self,
        _vision: &mut Self::Vision,
        _ctx: &mut Self::Context,
        _prompt: &str,
        _image_paths: &[String],
        _n_past: u32,
        _n_batch: u32,
    ) -> Result<u32> {
        Err(AdapterError::Vision("vision feature not enabled".into()))
    }
}
