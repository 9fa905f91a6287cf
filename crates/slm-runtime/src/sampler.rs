use slm_types::{GenerationOptions, SamplerKey};

use crate::native::{NativeBackend, SamplerParams};

/// Ordered sampling pipeline. Rebuilt only when the effective-parameters key
/// changes (spec's "sampler reuse" rule) — otherwise `reset()` is enough to
/// clear penalty/history state between requests, avoiding a fresh
/// allocation across the FFI boundary on every call, same rationale as the
/// teacher's `create_sampler`.
pub struct SamplerChain<B: NativeBackend> {
    handle: B::Sampler,
    key: SamplerKey,
    seed: u32,
}

impl<B: NativeBackend> SamplerChain<B> {
    pub fn new(backend: &B, model: &B::Model, options: &GenerationOptions, seed: u32) -> Self {
        let key = options.sampler_key();
        let handle = backend.sampler_chain_new(&to_native_params(options, seed), model);
        Self { handle, key, seed }
    }

    /// Reuse this chain if `options`'s structural key matches; otherwise
    /// rebuild. Either way the chain is reset so no penalty history leaks
    /// across requests.
    pub fn reuse_or_rebuild(&mut self, backend: &B, model: &B::Model, options: &GenerationOptions) {
        let key = options.sampler_key();
        if key != self.key {
            self.handle = backend.sampler_chain_new(&to_native_params(options, self.seed), model);
            self.key = key;
        } else {
            backend.sampler_reset(&mut self.handle);
        }
    }

    pub fn sample(&mut self, backend: &B, ctx: &mut B::Context, idx: i32) -> u32 {
        backend.sampler_sample(&mut self.handle, ctx, idx)
    }

    pub fn reset(&mut self, backend: &B) {
        backend.sampler_reset(&mut self.handle);
    }

    #[must_use]
    pub fn handle(&self) -> &B::Sampler {
        &self.handle
    }
}

fn to_native_params(options: &GenerationOptions, seed: u32) -> SamplerParams {
    SamplerParams {
        temperature: options.temperature,
        top_k: options.top_k,
        top_p: options.top_p,
        min_p: options.min_p,
        repeat_penalty: options.repeat_penalty,
        repeat_last_n: options.repeat_last_n,
        seed,
        greedy: options.temperature == 0.0,
    }
}

/// A private, structurally-fixed greedy sampler for the speculative draft
/// phase (temperature 0, seed irrelevant) — built fresh per round rather
/// than reused, since it never needs penalty state across rounds.
pub fn greedy_draft_sampler<B: NativeBackend>(backend: &B, model: &B::Model) -> B::Sampler {
    backend.sampler_chain_new(
        &SamplerParams { temperature: 0.0, top_k: 0, top_p: 0.0, min_p: 0.0, repeat_penalty: 0.0, repeat_last_n: 0, seed: 0, greedy: true },
        model,
    )
}
