//! Request entry point: serializes all requests through a single mutex,
//! implements the blocking and streaming paths as one generation pipeline
//! parameterized by an output sink (spec's "polymorphism over
//! {blocking,streaming}" design note), and owns every native resource's
//! lifetime.

use std::sync::Mutex;
use std::time::Instant;

use slm_types::{AdapterConfig, AdapterError, FinishReason, Request, Response, Result, Stats, StreamEvent};

use crate::cancel::CancelToken;
use crate::context::Context;
use crate::model::Model;
use crate::native::{ContextParams, NativeBackend};
use crate::preset::{apply_preset, find_preset, default_presets};
use crate::prompt_cache::PromptCache;
use crate::sampler::SamplerChain;
use crate::speculative::SpeculativeEngine;
use crate::stop_ring::StopRing;
use crate::vision::VisionContext;

struct AdapterState<B: NativeBackend> {
    // Declared in close order (sampler -> vision -> speculative -> context
    // -> model) so an implicit drop (e.g. a panic unwind) tears resources
    // down in the same order `Adapter::close` uses explicitly.
    sampler: Option<SamplerChain<B>>,
    vision: Option<VisionContext<B>>,
    speculative: Option<SpeculativeEngine<B>>,
    context: Option<Context<B>>,
    model: Option<Model<B>>,
    prompt_cache: PromptCache,
    closed: bool,
}

pub struct Adapter<B: NativeBackend> {
    backend: std::sync::Arc<B>,
    config: AdapterConfig,
    state: Mutex<AdapterState<B>>,
}

const CONTEXT_SHIFT_TRIGGER: f64 = 0.75;
const CONTEXT_SHIFT_DISCARD: f64 = 0.25;

impl<B: NativeBackend> Adapter<B> {
    pub fn new(backend: std::sync::Arc<B>, mut config: AdapterConfig) -> Result<Self> {
        let model = Model::from_config(backend.clone(), &config)?;

        let presets = default_presets();
        if let Some(preset) = find_preset(&presets, &model.info().description, &config.model_path) {
            apply_preset(&mut config, preset);
        }

        let ctx_params = context_params(&config);
        let mut context = Context::new(backend.clone(), model.handle(), &ctx_params)?;

        if config.warmup && config.warmup_tokens > 0 {
            let tokens = model.tokenize("", true, true).unwrap_or_default();
            let _ = context.warmup(&tokens);
        }

        let speculative = if let Some(draft_path) = &config.draft_model_path {
            let draft_model = Model::load(backend.clone(), draft_path, config.gpu_layers, config.mmap, config.mlock)?;
            let draft_context = Context::new(backend.clone(), draft_model.handle(), &ctx_params)?;
            Some(SpeculativeEngine::new(draft_model, draft_context, config.speculative_n))
        } else {
            None
        };

        let vision = if let Some(mmproj) = &config.mmproj_path {
            Some(VisionContext::load(&*backend, mmproj, model.handle(), config.threads, config.gpu_layers > 0)?)
        } else {
            None
        };

        let sampler = SamplerChain::new(&*backend, model.handle(), &config.generation_defaults, 1234);

        Ok(Self {
            backend,
            config,
            state: Mutex::new(AdapterState {
                model: Some(model),
                context: Some(context),
                sampler: Some(sampler),
                vision,
                speculative,
                prompt_cache: PromptCache::empty(),
                closed: false,
            }),
        })
    }

    /// Blocking path: fills the response body completely or until
    /// cancellation.
    #[tracing::instrument(skip(self, req, cancel))]
    pub fn generate(&self, req: &Request, cancel: &CancelToken) -> Result<Response> {
        let mut text = String::new();
        let finish = self.run(req, cancel, &mut |event| {
            if let StreamEvent::Chunk { token, .. } = &event {
                text.push_str(token);
            }
            Ok(())
        })?;
        Ok(Response { text, finish: finish.0, stats: finish.1 })
    }

    /// Streaming path: `cb` is invoked once per produced chunk and exactly
    /// once at the end with a `Final` event. If `cb` returns an error,
    /// generation aborts and that error propagates verbatim.
    #[tracing::instrument(skip(self, req, cancel, cb))]
    pub fn stream(&self, req: &Request, cancel: &CancelToken, mut cb: impl FnMut(StreamEvent) -> Result<()>) -> Result<()> {
        let result = self.run(req, cancel, &mut cb);
        match result {
            Ok((finish, stats)) => cb(StreamEvent::final_ok(stats, finish)),
            Err(e) => {
                let _ = cb(StreamEvent::final_err(e.to_string()));
                Err(e)
            }
        }
    }

    /// Idempotent; frees sampler, vision, draft context, draft model,
    /// context, model in that order. Each step tolerates a prior error —
    /// the Rust `Drop` of each native handle is the "free" call.
    pub fn close(&self) {
        let Ok(mut state) = self.state.lock() else { return };
        if state.closed {
            return;
        }
        state.sampler.take();
        state.vision.take();
        // SpeculativeEngine's own field order drops its context before its
        // model; dropping the whole engine here gets DraftContext -> DraftModel
        // in one step.
        state.speculative.take();
        state.context.take();
        state.model.take();
        state.closed = true;
    }

    fn run(
        &self,
        req: &Request,
        cancel: &CancelToken,
        emit: &mut dyn FnMut(StreamEvent) -> Result<()>,
    ) -> Result<(FinishReason, Stats)> {
        let mut state = self.state.lock().expect("adapter mutex poisoned");
        if state.closed {
            return Err(AdapterError::Configuration("adapter is closed".into()));
        }

        let effective = req.options.merged_with(&self.config.generation_defaults);
        let request_start = Instant::now();
        let mut stats = Stats::default();

        let model = state.model.take().expect("model present while open");
        let backend = self.backend.clone();
        {
            let sampler = state.sampler.as_mut().expect("sampler present while open");
            sampler.reuse_or_rebuild(&backend, model.handle(), &effective);
        }

        let preprocess_result = self.preprocess(&mut state, &model, req);
        let preprocess_result = match preprocess_result {
            Ok(r) => r,
            Err(e) => {
                state.prompt_cache.invalidate();
                state.model = Some(model);
                return Err(e);
            }
        };
        stats.tokens_evaluated = preprocess_result.tokens_evaluated;
        stats.tokens_cached = preprocess_result.prefix_len;

        // Budget clamp (section 4.4), after prompt eval and any shift. With
        // context-shift enabled, the per-iteration shift check (step 8 of
        // section 4.5) keeps freeing room as generation proceeds, so the
        // requested token count never needs capping here; clamping would
        // otherwise permanently cap the request at whatever happened to fit
        // before the first token was generated. Only a shift-less adapter
        // needs this as a hard ceiling, since nothing else will ever make
        // room for the rest of the request.
        let context_size = self.config.context_size;
        let max_tokens = {
            let ctx = state.context.as_mut().expect("context present");
            self.apply_shift_if_needed(ctx, state.speculative.as_mut(), &mut state.prompt_cache);
            let pos = ctx.pos();
            let mut budget = effective.max_tokens;
            if !self.config.context_shift && pos + budget > context_size {
                budget = context_size.saturating_sub(pos);
            }
            if budget == 0 {
                state.prompt_cache.invalidate();
                state.model = Some(model);
                return Err(AdapterError::KvOverflow("context window full".into()));
            }
            budget
        };

        let mut stop_ring = StopRing::new(&effective.stop);
        let mut tokens_generated = 0u32;
        let mut ttft: Option<Instant> = None;
        let mut finish = FinishReason::Length;
        let mut emit_index = 0u32;
        let is_vision_req = self.is_vision_request(&state, req);
        let chunk_size = self.config.stream_chunk_size.max(1);
        let mut pending = String::new();
        let mut pending_count = 0u32;

        'gen: while tokens_generated < max_tokens {
            if cancel.is_cancelled() {
                state.prompt_cache.invalidate();
                finish = FinishReason::Cancelled;
                break;
            }

            let round_pieces: Vec<Vec<u8>>;
            let hit_eog;
            if state.speculative.is_some() && !is_vision_req {
                let spec = state.speculative.as_mut().expect("checked above");
                let ctx = state.context.as_mut().expect("context present");
                let sampler = state.sampler.as_mut().expect("sampler present");
                match spec.round(&backend, &model, ctx, sampler) {
                    Ok(round) => {
                        stats.speculative_attempted += round.drafted;
                        stats.speculative_accepted += round.accepted;
                        round_pieces = round.pieces;
                        hit_eog = round.hit_eog;
                        tokens_generated += round_pieces.len() as u32;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "speculative round failed; disabling speculative decoding for the remainder of this request");
                        state.speculative = None;
                        continue 'gen;
                    }
                }
            } else {
                let ctx = state.context.as_mut().expect("context present");
                let sampler = state.sampler.as_mut().expect("sampler present");
                let token = sampler.sample(&backend, ctx.handle_mut(), -1);
                if model.is_eog(token) {
                    finish = FinishReason::Stop;
                    break;
                }
                let piece = match model.token_to_piece(token) {
                    Ok(p) => p,
                    Err(e) => {
                        state.prompt_cache.invalidate();
                        state.model = Some(model);
                        return Err(e);
                    }
                };
                if let Err(e) = self.eval_with_shift_retry(ctx, &[token], state.speculative.as_mut(), &mut state.prompt_cache) {
                    state.prompt_cache.invalidate();
                    state.model = Some(model);
                    return Err(e);
                }
                tokens_generated += 1;
                round_pieces = vec![piece];
                hit_eog = false;
            }

            let mut stopped_on_piece = false;
            for piece in &round_pieces {
                if ttft.is_none() {
                    ttft = Some(Instant::now());
                }
                if let Some(ring) = stop_ring.as_mut() {
                    ring.write(piece);
                }
                pending.push_str(&String::from_utf8_lossy(piece));
                pending_count += 1;

                // A chunk that contains (or completes) a stop match is never
                // flushed to the callback: trim the matched tail off the
                // still-buffered text before emitting.
                if let Some(ring) = stop_ring.as_ref() {
                    if let Some(matched_len) = ring.check() {
                        let keep = pending.len().saturating_sub(matched_len);
                        pending.truncate(keep);
                        finish = FinishReason::Stop;
                        stopped_on_piece = true;
                        break;
                    }
                }

                if pending_count >= chunk_size {
                    if !pending.is_empty() {
                        if let Err(e) = emit(StreamEvent::chunk(std::mem::take(&mut pending), emit_index)) {
                            state.prompt_cache.invalidate();
                            state.model = Some(model);
                            return Err(AdapterError::StreamCallback(e.to_string()));
                        }
                        emit_index += 1;
                    }
                    pending_count = 0;
                }
            }

            if stopped_on_piece {
                if !pending.is_empty() {
                    if let Err(e) = emit(StreamEvent::chunk(std::mem::take(&mut pending), emit_index)) {
                        state.prompt_cache.invalidate();
                        state.model = Some(model);
                        return Err(AdapterError::StreamCallback(e.to_string()));
                    }
                }
                break 'gen;
            }

            if hit_eog {
                finish = FinishReason::Stop;
                break;
            }

            let ctx = state.context.as_mut().expect("context present");
            self.apply_shift_if_needed(ctx, state.speculative.as_mut(), &mut state.prompt_cache);
        }

        if !pending.is_empty() && !matches!(finish, FinishReason::Cancelled) {
            if let Err(e) = emit(StreamEvent::chunk(std::mem::take(&mut pending), emit_index)) {
                state.prompt_cache.invalidate();
                state.model = Some(model);
                return Err(AdapterError::StreamCallback(e.to_string()));
            }
        }

        stats.tokens_generated = tokens_generated;
        stats.duration_ms = request_start.elapsed().as_millis() as u64;
        stats.ttft_ms = ttft.map_or(stats.duration_ms, |t| t.duration_since(request_start).as_millis() as u64);
        stats.finalize();

        state.model = Some(model);
        Ok((finish, stats))
    }

    fn is_vision_request(&self, state: &AdapterState<B>, req: &Request) -> bool {
        req.is_vision() && state.vision.is_some()
    }

    fn apply_shift_if_needed(&self, ctx: &mut Context<B>, speculative: Option<&mut SpeculativeEngine<B>>, prompt_cache: &mut PromptCache) {
        if !self.config.context_shift {
            return;
        }
        let context_size = self.config.context_size;
        let pos = ctx.pos();
        if (pos as f64) < CONTEXT_SHIFT_TRIGGER * f64::from(context_size) {
            return;
        }
        self.force_shift(ctx, speculative, prompt_cache);
    }

    /// Discard the oldest slice of KV unconditionally (no trigger check),
    /// used both by the proactive per-round shift and by the one-time
    /// recovery retry after a `KvOverflow` (spec section 7).
    fn force_shift(&self, ctx: &mut Context<B>, speculative: Option<&mut SpeculativeEngine<B>>, prompt_cache: &mut PromptCache) {
        let context_size = self.config.context_size;
        let n_discard = (CONTEXT_SHIFT_DISCARD * f64::from(context_size)) as u32;
        if n_discard == 0 {
            return;
        }
        ctx.shift(n_discard);
        prompt_cache.invalidate();
        if let Some(spec) = speculative {
            if spec.draft_context().pos() >= n_discard {
                spec.draft_context_mut().shift(n_discard);
            }
        }
    }

    /// Evaluate `tokens`, and on `KvOverflow` shift once and retry exactly
    /// once before surfacing "context window full" (spec section 7). A
    /// no-op when context-shift is disabled: the overflow propagates as-is.
    fn eval_with_shift_retry(
        &self,
        ctx: &mut Context<B>,
        tokens: &[u32],
        speculative: Option<&mut SpeculativeEngine<B>>,
        prompt_cache: &mut PromptCache,
    ) -> Result<Vec<f32>> {
        match ctx.eval(tokens) {
            Ok(logits) => Ok(logits),
            Err(AdapterError::KvOverflow(_)) if self.config.context_shift => {
                self.force_shift(ctx, speculative, prompt_cache);
                ctx.eval(tokens).map_err(|_| AdapterError::KvOverflow("context window full".into()))
            }
            Err(e) => Err(e),
        }
    }

    fn preprocess(&self, state: &mut AdapterState<B>, model: &Model<B>, req: &Request) -> Result<PreprocessResult> {
        if self.is_vision_request(state, req) {
            let ctx = state.context.as_mut().expect("context present");
            ctx.clear();
            state.prompt_cache.invalidate();
            if let Some(spec) = state.speculative.as_mut() {
                spec.draft_context_mut().clear();
            }
            let vision = state.vision.as_mut().expect("checked by is_vision_request");
            let new_pos = vision.eval_with_images(&self.backend, ctx, &req.prompt, &req.images, self.config.batch_size)?;
            ctx.set_pos(new_pos);
            Ok(PreprocessResult { tokens_evaluated: new_pos, prefix_len: 0 })
        } else {
            let tokens = model.tokenize(&req.prompt, true, true)?;
            let prefix_len = state.prompt_cache.longest_common_prefix(&tokens) as u32;

            let ctx = state.context.as_mut().expect("context present");
            let effective_prefix = if prefix_len as usize == tokens.len() {
                ctx.clear();
                state.prompt_cache.invalidate();
                if let Some(spec) = state.speculative.as_mut() {
                    spec.draft_context_mut().clear();
                }
                0
            } else if prefix_len > 0 {
                ctx.truncate(prefix_len);
                if let Some(spec) = state.speculative.as_mut() {
                    spec.draft_context_mut().truncate(prefix_len);
                }
                prefix_len
            } else {
                ctx.clear();
                if let Some(spec) = state.speculative.as_mut() {
                    spec.draft_context_mut().clear();
                }
                0
            };

            let new_tokens = &tokens[effective_prefix as usize..];
            if !new_tokens.is_empty() {
                self.eval_with_shift_retry(ctx, new_tokens, state.speculative.as_mut(), &mut state.prompt_cache)?;
            }
            state.prompt_cache.store(tokens.clone());

            if let Some(spec) = state.speculative.as_mut() {
                let draft_ctx = spec.draft_context_mut();
                draft_ctx.clear();
                self.eval_with_shift_retry(draft_ctx, &tokens, None, &mut state.prompt_cache)?;
            }

            Ok(PreprocessResult { tokens_evaluated: tokens.len() as u32, prefix_len: effective_prefix })
        }
    }
}

struct PreprocessResult {
    tokens_evaluated: u32,
    prefix_len: u32,
}

fn context_params(config: &AdapterConfig) -> ContextParams {
    ContextParams {
        n_ctx: config.context_size,
        n_batch: config.batch_size,
        n_threads: config.threads,
        n_threads_batch: config.threads_batch,
        embeddings: false,
        flash_attn: matches!(config.flash_attention, slm_types::FlashAttention::On),
        kv_type_k: config.kv_cache_type,
        kv_type_v: config.kv_cache_type,
    }
}

impl<B: NativeBackend> Drop for Adapter<B> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::native::mock::MockBackend;

    use super::*;

    fn test_config() -> AdapterConfig {
        let mut config = AdapterConfig::new("mock.gguf");
        config.context_size = 64;
        config
    }

    /// P8: closing twice is a no-op the second time, and closing never
    /// leaves the adapter in a state where a subsequent call panics.
    #[test]
    fn close_twice_is_ok() {
        let backend = Arc::new(MockBackend::new());
        let adapter = Adapter::new(backend, test_config()).unwrap();
        adapter.close();
        adapter.close();
    }

    #[test]
    fn closed_adapter_rejects_new_requests() {
        let backend = Arc::new(MockBackend::new());
        let adapter = Adapter::new(backend, test_config()).unwrap();
        adapter.close();
        let err = adapter.generate(&Request::new("hello"), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, AdapterError::Configuration(_)));
    }
}
