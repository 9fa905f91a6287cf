//! Deterministic test double for [`NativeBackend`], grounded in the
//! teacher's `chat_mock.rs`. There is no real vocabulary or forward pass:
//! the "model" predicts the next token purely as a function of KV length,
//! which is enough to exercise prefix reuse, shifting, stop detection,
//! cancellation, and speculative accept/reject bookkeeping without a GGUF
//! file. Two contexts fed the same token sequence always see the same
//! predictions, which is what makes the speculative draft/target
//! equivalence properties provable against this backend.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use slm_types::{AdapterError, Result};

use super::{ContextParams, ModelInfo, NativeBackend, SamplerParams};

const VOCAB_SIZE: u32 = 1024;
const BOS_TOKEN: u32 = 0;
const EOS_TOKEN: u32 = 1;
const PROMPT_BASE: u32 = 2;
const GEN_BASE: u32 = 1000;
const WORD_CYCLE: &[&str] = &["4", " is", " the", " answer", "."];

fn predicted_for_next(next_pos: u32) -> u32 {
    GEN_BASE + next_pos % WORD_CYCLE.len() as u32
}

fn spike_vector(token: u32) -> Vec<f32> {
    let mut v = vec![0.0f32; VOCAB_SIZE as usize];
    v[token as usize] = 10.0;
    v
}

#[derive(Debug, Default)]
pub struct MockModel;

#[derive(Debug, Default)]
pub struct MockContext {
    kv: Vec<u32>,
    capacity: u32,
    last_logits: Vec<f32>,
    last_logits_all: Vec<Vec<f32>>,
    /// When set, EOG fires once the KV reaches this length — lets a test
    /// force natural termination without relying on the stop-ring.
    pub eog_at_len: Option<u32>,
}

impl MockContext {
    #[must_use]
    pub fn pos(&self) -> u32 {
        self.kv.len() as u32
    }

    #[must_use]
    pub fn kv_tokens(&self) -> &[u32] {
        &self.kv
    }

    /// Test hook: corrupt the KV directly, as P9 requires for the draft
    /// desync scenario.
    pub fn corrupt_kv(&mut self, tokens: Vec<u32>) {
        self.kv = tokens;
    }
}

#[derive(Debug, Default)]
pub struct MockSampler;

/// Deterministic, content-blind backend for unit/integration tests.
#[derive(Default)]
pub struct MockBackend {
    vocab: RefCell<HashMap<String, u32>>,
    reverse: RefCell<Vec<String>>,
    next_id: Cell<u32>,
}

impl MockBackend {
    #[must_use]
    pub fn new() -> Self {
        Self { vocab: RefCell::new(HashMap::new()), reverse: RefCell::new(Vec::new()), next_id: Cell::new(PROMPT_BASE) }
    }

    fn intern(&self, word: &str) -> u32 {
        if let Some(&id) = self.vocab.borrow().get(word) {
            return id;
        }
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.vocab.borrow_mut().insert(word.to_string(), id);
        self.reverse.borrow_mut().push(word.to_string());
        id
    }
}

impl NativeBackend for MockBackend {
    type Model = MockModel;
    type Context = MockContext;
    type Sampler = MockSampler;
    type Vision = ();

    fn model_load(&self, _path: &str, _gpu_layers: u32, _use_mmap: bool, _use_mlock: bool) -> Result<Self::Model> {
        Ok(MockModel)
    }

    fn model_info(&self, _model: &Self::Model) -> ModelInfo {
        ModelInfo {
            n_embd: 4096,
            n_ctx_train: 4096,
            vocab_size: VOCAB_SIZE,
            n_params: 7_000_000_000,
            description: "mock-model".into(),
            chat_template: None,
            has_encoder: false,
        }
    }

    fn tokenize(&self, _model: &Self::Model, text: &str, add_special: bool, _parse_special: bool) -> Result<Vec<u32>> {
        if text.trim().is_empty() {
            return Err(AdapterError::Tokenization("empty prompt".into()));
        }
        let mut out = Vec::new();
        if add_special {
            out.push(BOS_TOKEN);
        }
        out.extend(text.split_whitespace().map(|w| self.intern(w)));
        Ok(out)
    }

    fn token_to_piece(&self, _model: &Self::Model, token: u32) -> Result<Vec<u8>> {
        if token == BOS_TOKEN || token == EOS_TOKEN {
            return Ok(Vec::new());
        }
        if token >= GEN_BASE {
            return Ok(WORD_CYCLE[(token - GEN_BASE) as usize % WORD_CYCLE.len()].as_bytes().to_vec());
        }
        let idx = (token - PROMPT_BASE) as usize;
        let reverse = self.reverse.borrow();
        let word = reverse.get(idx).map(String::as_str).unwrap_or("");
        Ok(format!(" {word}").into_bytes())
    }

    fn token_is_eog(&self, _model: &Self::Model, token: u32) -> bool {
        token == EOS_TOKEN
    }

    fn token_bos(&self, _model: &Self::Model) -> u32 {
        BOS_TOKEN
    }

    fn token_eos(&self, _model: &Self::Model) -> u32 {
        EOS_TOKEN
    }

    fn context_new(&self, _model: &Self::Model, params: &ContextParams) -> Result<Self::Context> {
        Ok(MockContext { kv: Vec::new(), capacity: params.n_ctx, last_logits: Vec::new(), last_logits_all: Vec::new(), eog_at_len: None })
    }

    fn context_decode(&self, ctx: &mut Self::Context, tokens: &[u32], pos_start: u32) -> Result<Vec<f32>> {
        ctx.kv.truncate(pos_start as usize);
        ctx.kv.extend_from_slice(tokens);
        if ctx.kv.len() as u32 > ctx.capacity {
            return Err(AdapterError::KvOverflow(format!("kv full at {}", ctx.kv.len())));
        }
        let next = ctx.kv.len() as u32;
        let predicted = if ctx.eog_at_len == Some(next) { EOS_TOKEN } else { predicted_for_next(next) };
        let logits = spike_vector(predicted);
        ctx.last_logits = logits.clone();
        Ok(logits)
    }

    fn context_decode_logits_all(&self, ctx: &mut Self::Context, tokens: &[u32], pos_start: u32) -> Result<Vec<Vec<f32>>> {
        ctx.kv.truncate(pos_start as usize);
        let mut out = Vec::with_capacity(tokens.len());
        for (i, &tok) in tokens.iter().enumerate() {
            ctx.kv.push(tok);
            let next = pos_start + i as u32 + 1;
            let predicted = if ctx.eog_at_len == Some(next) { EOS_TOKEN } else { predicted_for_next(next) };
            out.push(spike_vector(predicted));
        }
        if ctx.kv.len() as u32 > ctx.capacity {
            return Err(AdapterError::KvOverflow(format!("kv full at {}", ctx.kv.len())));
        }
        ctx.last_logits_all = out.clone();
        Ok(out)
    }

    fn context_encode(&self, _ctx: &mut Self::Context, _tokens: &[u32]) -> Result<Vec<f32>> {
        Ok(vec![0.0; 4096])
    }

    fn context_get_logits_at(&self, ctx: &Self::Context, idx: usize) -> Vec<f32> {
        ctx.last_logits_all.get(idx).cloned().unwrap_or_default()
    }

    fn context_get_embeddings_seq(&self, _ctx: &Self::Context, _seq_id: u32) -> Vec<f32> {
        vec![0.0; 4096]
    }

    fn kv_clear(&self, ctx: &mut Self::Context) {
        ctx.kv.clear();
        ctx.last_logits.clear();
        ctx.last_logits_all.clear();
    }

    fn kv_seq_rm(&self, ctx: &mut Self::Context, _seq_id: u32, p0: u32, p1: u32) {
        let end = if p1 == u32::MAX { ctx.kv.len() as u32 } else { p1 };
        let start = (p0 as usize).min(ctx.kv.len());
        let end = (end as usize).min(ctx.kv.len());
        if start < end {
            ctx.kv.drain(start..end);
        }
    }

    fn kv_seq_add(&self, _ctx: &mut Self::Context, _seq_id: u32, _p0: u32, _p1: u32, _delta: i32) {}

    fn sampler_chain_new(&self, _params: &SamplerParams, _model: &Self::Model) -> Self::Sampler {
        MockSampler
    }

    fn sampler_sample(&self, _sampler: &mut Self::Sampler, ctx: &mut Self::Context, idx: i32) -> u32 {
        let logits = if idx < 0 { &ctx.last_logits } else { &ctx.last_logits_all[idx as usize] };
        super::argmax(logits)
    }

    fn sampler_reset(&self, _sampler: &mut Self::Sampler) {}

    fn vision_init(&self, _mmproj_path: &str, _model: &Self::Model, _n_threads: u32, _use_gpu: bool) -> Result<Self::Vision> {
        Err(AdapterError::Vision("vision not supported by MockBackend".into()))
    }

    fn vision_eval(
        &self,
        _vision: &mut Self::Vision,
        _ctx: &mut Self::Context,
        _prompt: &str,
        _image_paths: &[String],
        _n_past: u32,
        _n_batch: u32,
    ) -> Result<u32> {
        Err(AdapterError::Vision("vision not supported by MockBackend".into()))
    }
}
