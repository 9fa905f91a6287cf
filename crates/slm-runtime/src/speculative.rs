//! Draft/verify/accept/re-sync speculative decoding loop (spec section
//! 4.6), grounded in the draft+target two-context pattern from the pack's
//! `speculative.rs` example, but implementing the spec's exact accept/bonus
//! rules rather than that example's simpler greedy-only variant.

use slm_types::Result;

use crate::context::Context;
use crate::model::Model;
use crate::native::NativeBackend;
use crate::sampler::{greedy_draft_sampler, SamplerChain};

/// Pair of (draft model, draft context) plus the configured speculation
/// depth. Both draft entities are freed before the target context/model
/// (see the adapter's close ordering).
pub struct SpeculativeEngine<B: NativeBackend> {
    // Declaration order is drop order: the draft context must be freed
    // before the draft model it was created from (same invariant as the
    // adapter's own context/model pair).
    draft_context: Context<B>,
    draft_model: Model<B>,
    n: u32,
}

/// Outcome of one round: accepted pieces plus bookkeeping for the stats and
/// acceptance-rate counters. `accepted` counts only draft-matching tokens —
/// the bonus token and the divergence replacement are not counted against
/// acceptance rate, per spec section 4.6 step 7.
pub struct SpeculativeRound {
    pub tokens: Vec<u32>,
    pub pieces: Vec<Vec<u8>>,
    pub hit_eog: bool,
    pub drafted: u32,
    pub accepted: u32,
}

impl<B: NativeBackend> SpeculativeEngine<B> {
    #[must_use]
    pub fn new(draft_model: Model<B>, draft_context: Context<B>, n: u32) -> Self {
        Self { draft_context, draft_model, n }
    }

    #[must_use]
    pub fn draft_context(&self) -> &Context<B> {
        &self.draft_context
    }

    #[must_use]
    pub fn draft_context_mut(&mut self) -> &mut Context<B> {
        &mut self.draft_context
    }

    #[must_use]
    pub fn draft_model(&self) -> &Model<B> {
        &self.draft_model
    }

    /// Run one speculative round against `target_ctx`/`target_model` using
    /// `target_sampler` for the bonus token. `target_batch_size` bounds the
    /// effective draft depth so the verify batch never exceeds it.
    pub fn round(
        &mut self,
        backend: &B,
        target_model: &Model<B>,
        target_ctx: &mut Context<B>,
        target_sampler: &mut SamplerChain<B>,
    ) -> Result<SpeculativeRound> {
        let target_batch_size = target_ctx.capacity();
        let saved_pos = target_ctx.pos();

        let effective_n = (self.n).min(target_batch_size.saturating_sub(saved_pos).saturating_sub(1));
        if effective_n == 0 {
            return self.single_token_fallback(backend, target_model, target_ctx, target_sampler);
        }

        // Draft phase: greedy, temperature 0, private sampler per round.
        let mut draft_sampler = greedy_draft_sampler(backend, self.draft_model.handle());
        let mut draft_tokens = Vec::new();
        for i in 0..effective_n {
            let token = backend.sampler_sample(&mut draft_sampler, self.draft_context.handle_mut(), -1);
            if self.draft_model.is_eog(token) {
                break;
            }
            draft_tokens.push(token);
            if i + 1 < effective_n {
                self.draft_context.eval(&[token])?;
            }
        }
        if draft_tokens.is_empty() {
            return self.single_token_fallback(backend, target_model, target_ctx, target_sampler);
        }
        let k = draft_tokens.len() as u32;

        // Verify phase: one batched decode computing logits at every position.
        let logits_all = match target_ctx.eval_logits_all(&draft_tokens) {
            Ok(l) => l,
            Err(e) => {
                target_ctx.truncate(saved_pos);
                return Err(e);
            }
        };

        // Accept phase.
        let mut accepted_tokens = Vec::new();
        let mut pieces = Vec::new();
        let mut matched = 0u32;
        let mut hit_eog = false;
        for (i, &draft_token) in draft_tokens.iter().enumerate() {
            let target_token = crate::native::argmax(&logits_all[i]);
            if target_token == draft_token {
                accepted_tokens.push(draft_token);
                pieces.push(target_model.token_to_piece(draft_token)?);
                matched += 1;
                if target_model.is_eog(draft_token) {
                    hit_eog = true;
                    break;
                }
            } else {
                accepted_tokens.push(target_token);
                pieces.push(target_model.token_to_piece(target_token)?);
                if target_model.is_eog(target_token) {
                    hit_eog = true;
                }
                break;
            }
        }

        // Bonus token: only if every draft token matched and none was EOG.
        if matched == k && !hit_eog {
            let bonus = target_sampler.sample(backend, target_ctx.handle_mut(), (k - 1) as i32);
            accepted_tokens.push(bonus);
            pieces.push(target_model.token_to_piece(bonus)?);
            if target_model.is_eog(bonus) {
                hit_eog = true;
            }
        }

        // KV reconciliation.
        let accepted_count = accepted_tokens.len() as u32;
        target_ctx.truncate(saved_pos + accepted_count);

        let draft_pos = self.draft_context.pos();
        if draft_pos > saved_pos + accepted_count {
            self.draft_context.truncate(saved_pos + accepted_count);
        } else if draft_pos < saved_pos + accepted_count {
            let missing = &accepted_tokens[(draft_pos - saved_pos) as usize..];
            if let Err(e) = self.draft_context.eval(missing) {
                tracing::warn!(error = %e, "draft KV re-sync after bonus token failed; next round's draft quality will suffer");
            }
        }

        Ok(SpeculativeRound { tokens: accepted_tokens, pieces, hit_eog, drafted: k, accepted: matched })
    }

    fn single_token_fallback(
        &mut self,
        backend: &B,
        target_model: &Model<B>,
        target_ctx: &mut Context<B>,
        target_sampler: &mut SamplerChain<B>,
    ) -> Result<SpeculativeRound> {
        let token = target_sampler.sample(backend, target_ctx.handle_mut(), -1);
        let hit_eog = target_model.is_eog(token);
        let piece = target_model.token_to_piece(token)?;
        if !hit_eog {
            target_ctx.eval(&[token])?;
        }
        Ok(SpeculativeRound { tokens: vec![token], pieces: vec![piece], hit_eog, drafted: 0, accepted: 0 })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use slm_types::{GenerationOptions, KvCacheType};

    use super::*;
    use crate::native::mock::MockBackend;
    use crate::native::ContextParams;

    fn ctx_params() -> ContextParams {
        ContextParams {
            n_ctx: 256,
            n_batch: 64,
            n_threads: 0,
            n_threads_batch: 0,
            embeddings: false,
            flash_attn: false,
            kv_type_k: KvCacheType::F16,
            kv_type_v: KvCacheType::F16,
        }
    }

    fn greedy_options() -> GenerationOptions {
        GenerationOptions { temperature: 0.0, ..GenerationOptions::default() }
    }

    fn run_single_token_baseline(backend: &Arc<MockBackend>, prompt: &str, count: u32) -> Vec<u32> {
        let model = Model::load(backend.clone(), "m", 0, false, false).unwrap();
        let mut ctx = Context::new(backend.clone(), model.handle(), &ctx_params()).unwrap();
        let tokens = model.tokenize(prompt, true, true).unwrap();
        ctx.eval(&tokens).unwrap();
        let mut sampler = SamplerChain::new(&**backend, model.handle(), &greedy_options(), 1);

        let mut out = Vec::new();
        for _ in 0..count {
            let token = sampler.sample(&**backend, ctx.handle_mut(), -1);
            if model.is_eog(token) {
                break;
            }
            out.push(token);
            ctx.eval(&[token]).unwrap();
        }
        out
    }

    /// P5: a fixed prompt with identical seed produces the same token
    /// sequence whether or not speculative decoding is enabled, because the
    /// accept phase always re-verifies every draft token against the
    /// target's own argmax.
    #[test]
    fn greedy_speculative_matches_single_token() {
        let backend = Arc::new(MockBackend::new());
        let prompt = "hello world this is a test prompt";

        let target_model = Model::load(backend.clone(), "m", 0, false, false).unwrap();
        let mut target_ctx = Context::new(backend.clone(), target_model.handle(), &ctx_params()).unwrap();
        let tokens = target_model.tokenize(prompt, true, true).unwrap();
        target_ctx.eval(&tokens).unwrap();
        let mut target_sampler = SamplerChain::new(&*backend, target_model.handle(), &greedy_options(), 1);

        let draft_model = Model::load(backend.clone(), "d", 0, false, false).unwrap();
        let mut draft_ctx = Context::new(backend.clone(), draft_model.handle(), &ctx_params()).unwrap();
        draft_ctx.eval(&tokens).unwrap();
        let mut engine = SpeculativeEngine::new(draft_model, draft_ctx, 4);

        let mut spec_tokens = Vec::new();
        for _ in 0..3 {
            let round = engine.round(&*backend, &target_model, &mut target_ctx, &mut target_sampler).unwrap();
            spec_tokens.extend(round.tokens);
            if round.hit_eog {
                break;
            }
        }

        let baseline = run_single_token_baseline(&backend, prompt, spec_tokens.len() as u32);
        assert_eq!(spec_tokens, baseline);
    }

    /// P9: corrupting the draft's KV content between rounds must not change
    /// the accepted text, since every draft token is re-verified against the
    /// target's own (uncorrupted) forward pass before being accepted.
    #[test]
    fn desynced_draft_cache_still_yields_correct_text() {
        let backend = Arc::new(MockBackend::new());
        let prompt = "the quick brown fox jumps over";

        let target_model = Model::load(backend.clone(), "m", 0, false, false).unwrap();
        let mut target_ctx = Context::new(backend.clone(), target_model.handle(), &ctx_params()).unwrap();
        let tokens = target_model.tokenize(prompt, true, true).unwrap();
        target_ctx.eval(&tokens).unwrap();
        let mut target_sampler = SamplerChain::new(&*backend, target_model.handle(), &greedy_options(), 1);

        let draft_model = Model::load(backend.clone(), "d", 0, false, false).unwrap();
        let mut draft_ctx = Context::new(backend.clone(), draft_model.handle(), &ctx_params()).unwrap();
        draft_ctx.eval(&tokens).unwrap();
        let mut engine = SpeculativeEngine::new(draft_model, draft_ctx, 4);

        let mut spec_tokens = Vec::new();
        let first = engine.round(&*backend, &target_model, &mut target_ctx, &mut target_sampler).unwrap();
        spec_tokens.extend(first.tokens);

        // Directly wipe the draft's backend-level KV content so its future
        // predictions are computed from the wrong effective position.
        engine.draft_context_mut().handle_mut().corrupt_kv(Vec::new());

        for _ in 0..3 {
            let round = engine.round(&*backend, &target_model, &mut target_ctx, &mut target_sampler).unwrap();
            spec_tokens.extend(round.tokens);
            if round.hit_eog {
                break;
            }
        }

        let baseline = run_single_token_baseline(&backend, prompt, spec_tokens.len() as u32);
        assert_eq!(spec_tokens, baseline);
    }
}
