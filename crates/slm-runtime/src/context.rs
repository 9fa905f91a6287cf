use std::sync::Arc;

use slm_types::{AdapterError, Result};

use crate::native::{ContextParams, NativeBackend};

/// Single-sequence KV cache over a [`crate::model::Model`]. Owns the
/// position counter `pos` (invariant I1: `pos` always equals the number of
/// KV-populated positions for sequence 0) and must be freed before the
/// model that created it — enforced by the adapter's close ordering, the
/// same invariant documented on the teacher's `InferenceCache`.
pub struct Context<B: NativeBackend> {
    backend: Arc<B>,
    handle: B::Context,
    pos: u32,
    batch_size: u32,
}

impl<B: NativeBackend> Context<B> {
    pub fn new(backend: Arc<B>, model: &B::Model, params: &ContextParams) -> Result<Self> {
        let handle = backend.context_new(model, params)?;
        Ok(Self { backend, handle, pos: 0, batch_size: params.n_batch })
    }

    #[must_use]
    pub fn pos(&self) -> u32 {
        self.pos
    }

    /// Set `pos` directly, for callers (vision preprocessing) that advance
    /// the KV through a path other than `eval`/`eval_logits_all` and must
    /// report the resulting position back per invariant I1.
    pub(crate) fn set_pos(&mut self, pos: u32) {
        self.pos = pos;
    }

    #[must_use]
    pub fn handle_mut(&mut self) -> &mut B::Context {
        &mut self.handle
    }

    /// Evaluate `tokens` in slices of at most `batch_size`, advancing `pos`
    /// by `tokens.len()`. Returns the last slice's last-position logits.
    pub fn eval(&mut self, tokens: &[u32]) -> Result<Vec<f32>> {
        if tokens.is_empty() {
            return Err(AdapterError::Decode("eval called with no tokens".into()));
        }
        let mut logits = Vec::new();
        for chunk in tokens.chunks(self.batch_size as usize) {
            logits = self.backend.context_decode(&mut self.handle, chunk, self.pos)?;
            self.pos += chunk.len() as u32;
        }
        Ok(logits)
    }

    /// Evaluate `tokens` as one batch (caller guarantees `tokens.len() <=
    /// batch_size - 1`, per the speculative round's effective-N clamp),
    /// returning logits at every position.
    pub fn eval_logits_all(&mut self, tokens: &[u32]) -> Result<Vec<Vec<f32>>> {
        let out = self.backend.context_decode_logits_all(&mut self.handle, tokens, self.pos)?;
        self.pos += tokens.len() as u32;
        Ok(out)
    }

    pub fn encode(&mut self, tokens: &[u32]) -> Result<Vec<f32>> {
        self.backend.context_encode(&mut self.handle, tokens)
    }

    #[must_use]
    pub fn logits_at(&self, idx: usize) -> Vec<f32> {
        self.backend.context_get_logits_at(&self.handle, idx)
    }

    pub fn clear(&mut self) {
        self.backend.kv_clear(&mut self.handle);
        self.pos = 0;
    }

    /// Truncate KV to the first `p` positions.
    pub fn truncate(&mut self, p: u32) {
        if p >= self.pos {
            return;
        }
        self.backend.kv_seq_rm(&mut self.handle, 0, p, u32::MAX);
        self.pos = p;
    }

    /// Discard the oldest `n_discard` KV entries and shift the rest down,
    /// per the context-window sliding contract (spec section 4.3).
    pub fn shift(&mut self, n_discard: u32) {
        if n_discard == 0 || n_discard > self.pos {
            return;
        }
        self.backend.kv_seq_rm(&mut self.handle, 0, 0, n_discard);
        self.backend.kv_seq_add(&mut self.handle, 0, n_discard, u32::MAX, -(n_discard as i32));
        self.pos -= n_discard;
    }

    /// Pre-evaluate `tokens` without returning anything useful to the
    /// caller — used to warm the KV cache with a fixed preamble (e.g. a
    /// system prompt) right after model load.
    pub fn warmup(&mut self, tokens: &[u32]) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        self.eval(tokens)?;
        Ok(())
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.batch_size
    }
}
