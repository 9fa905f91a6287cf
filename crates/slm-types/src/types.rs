use serde::{Deserialize, Serialize};

use crate::config::GenerationOptions;

/// Entry point payload: a prompt, optional image paths for the vision path,
/// and per-request generation overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    pub prompt: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub options: GenerationOptions,
}

impl Request {
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self { prompt: prompt.into(), images: Vec::new(), options: GenerationOptions::default() }
    }

    #[must_use]
    pub fn is_vision(&self) -> bool {
        !self.images.is_empty()
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Cancelled,
}

/// Per-response performance counters, per the stats contract.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Stats {
    pub tokens_evaluated: u32,
    pub tokens_generated: u32,
    pub tokens_cached: u32,
    pub duration_ms: u64,
    pub ttft_ms: u64,
    pub prompt_tps: f64,
    pub gen_tps: f64,
    pub speculative_attempted: u32,
    pub speculative_accepted: u32,
    pub speculative_acceptance_rate: f64,
}

impl Stats {
    /// Fills in `prompt_tps`/`gen_tps` from elapsed wall-clock when the
    /// native perf counters reported zero, and computes the speculative
    /// acceptance rate.
    pub fn finalize(&mut self) {
        if self.prompt_tps == 0.0 && self.ttft_ms > 0 {
            self.prompt_tps = f64::from(self.tokens_evaluated) / (self.ttft_ms as f64 / 1000.0);
        }
        let gen_duration_ms = self.duration_ms.saturating_sub(self.ttft_ms);
        if self.gen_tps == 0.0 && gen_duration_ms > 0 {
            self.gen_tps = f64::from(self.tokens_generated) / (gen_duration_ms as f64 / 1000.0);
        }
        if self.speculative_attempted > 0 {
            self.speculative_acceptance_rate =
                f64::from(self.speculative_accepted) / f64::from(self.speculative_attempted) * 100.0;
        }
    }
}

/// The completed result of a blocking [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub text: String,
    pub finish: FinishReason,
    pub stats: Stats,
}

/// One event delivered to a streaming callback. Exactly one `Final` event
/// terminates a stream; everything before it is a `Chunk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk { token: String, index: u32 },
    Final { stats: Option<Stats>, finish: FinishReason, err: Option<String> },
}

impl StreamEvent {
    #[must_use]
    pub fn chunk(token: impl Into<String>, index: u32) -> Self {
        StreamEvent::Chunk { token: token.into(), index }
    }

    #[must_use]
    pub fn final_ok(stats: Stats, finish: FinishReason) -> Self {
        StreamEvent::Final { stats: Some(stats), finish, err: None }
    }

    #[must_use]
    pub fn final_err(err: impl Into<String>) -> Self {
        StreamEvent::Final { stats: None, finish: FinishReason::Cancelled, err: Some(err.into()) }
    }
}
