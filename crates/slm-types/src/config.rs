use serde::{Deserialize, Serialize};

fn default_context_size() -> u32 {
    2048
}

fn default_batch_size() -> u32 {
    512
}

fn default_speculative_n() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_stream_chunk_size() -> u32 {
    1
}

fn default_max_tokens() -> u32 {
    512
}

/// Whether flash attention is requested; `Auto` lets the native backend decide
/// based on what the loaded model and device support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashAttention {
    #[default]
    Auto,
    On,
    Off,
}

/// KV-cache quantization. Unknown strings fall back to `F16` (see `From<&str>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvCacheType {
    #[default]
    F16,
    Q8_0,
    Q4_0,
}

impl From<&str> for KvCacheType {
    fn from(s: &str) -> Self {
        match s {
            "q8_0" => KvCacheType::Q8_0,
            "q4_0" => KvCacheType::Q4_0,
            "f16" => KvCacheType::F16,
            other => {
                tracing::warn!(value = other, "unknown kv_cache_type, falling back to f16");
                KvCacheType::F16
            }
        }
    }
}

/// Static configuration for an [`Adapter`](crate constant docs) instance —
/// everything needed to load the model(s) and fix the shape of every
/// subsequent request. Parsing this out of a config file is out of scope;
/// the embedding application builds this struct however it likes and
/// deserializes it with `serde` if it wants to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub model_path: String,

    #[serde(default = "default_context_size")]
    pub context_size: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default)]
    pub threads: u32,
    #[serde(default)]
    pub threads_batch: u32,
    #[serde(default)]
    pub gpu_layers: u32,
    #[serde(default)]
    pub mmap: bool,
    #[serde(default)]
    pub mlock: bool,
    #[serde(default)]
    pub flash_attention: FlashAttention,
    #[serde(default)]
    pub kv_cache_type: KvCacheType,
    #[serde(default)]
    pub warmup: bool,
    #[serde(default)]
    pub warmup_tokens: u32,

    #[serde(default)]
    pub mmproj_path: Option<String>,
    #[serde(default)]
    pub draft_model_path: Option<String>,
    #[serde(default = "default_speculative_n")]
    pub speculative_n: u32,

    #[serde(default = "default_true")]
    pub context_shift: bool,
    #[serde(default = "default_stream_chunk_size")]
    pub stream_chunk_size: u32,

    #[serde(default)]
    pub generation_defaults: GenerationOptions,
}

impl AdapterConfig {
    pub fn new(model_path: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
            context_size: default_context_size(),
            batch_size: default_batch_size(),
            threads: 0,
            threads_batch: 0,
            gpu_layers: 0,
            mmap: false,
            mlock: false,
            flash_attention: FlashAttention::default(),
            kv_cache_type: KvCacheType::default(),
            warmup: false,
            warmup_tokens: 0,
            mmproj_path: None,
            draft_model_path: None,
            speculative_n: default_speculative_n(),
            context_shift: true,
            stream_chunk_size: default_stream_chunk_size(),
            generation_defaults: GenerationOptions::default(),
        }
    }
}

/// Generation options carried by a [`Request`](crate::Request). Every numeric
/// field at its zero value means "use the configured default" — the merge
/// rule lives in the adapter, not here; this struct only carries the values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub top_k: i32,
    #[serde(default)]
    pub top_p: f32,
    #[serde(default)]
    pub min_p: f32,
    #[serde(default)]
    pub repeat_penalty: f32,
    #[serde(default)]
    pub repeat_last_n: i32,
    #[serde(default)]
    pub stop: Vec<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: 0.0,
            top_k: 0,
            top_p: 0.0,
            min_p: 0.0,
            repeat_penalty: 0.0,
            repeat_last_n: 0,
            stop: Vec::new(),
        }
    }
}

impl GenerationOptions {
    /// Per-field merge: zero values in `self` (the request override) fall
    /// back to `defaults`; a non-empty `stop` list replaces the default
    /// entirely rather than merging.
    #[must_use]
    pub fn merged_with(&self, defaults: &GenerationOptions) -> GenerationOptions {
        GenerationOptions {
            max_tokens: if self.max_tokens == 0 { defaults.max_tokens } else { self.max_tokens },
            temperature: if self.temperature == 0.0 { defaults.temperature } else { self.temperature },
            top_k: if self.top_k == 0 { defaults.top_k } else { self.top_k },
            top_p: if self.top_p == 0.0 { defaults.top_p } else { self.top_p },
            min_p: if self.min_p == 0.0 { defaults.min_p } else { self.min_p },
            repeat_penalty: if self.repeat_penalty == 0.0 {
                defaults.repeat_penalty
            } else {
                self.repeat_penalty
            },
            repeat_last_n: if self.repeat_last_n == 0 {
                defaults.repeat_last_n
            } else {
                self.repeat_last_n
            },
            stop: if self.stop.is_empty() { defaults.stop.clone() } else { self.stop.clone() },
        }
    }

    /// The key used to decide whether the sampler chain must be rebuilt:
    /// every field that influences chain *structure* (not just its state).
    #[must_use]
    pub fn sampler_key(&self) -> SamplerKey {
        SamplerKey {
            temperature: self.temperature.to_bits(),
            top_k: self.top_k,
            top_p: self.top_p.to_bits(),
            min_p: self.min_p.to_bits(),
            repeat_penalty: self.repeat_penalty.to_bits(),
            repeat_last_n: self.repeat_last_n,
        }
    }
}

/// Value-equality key for sampler-chain reuse (spec'd "effective parameters
/// key"); floats are compared by bit pattern since we never do arithmetic on
/// the key itself, only equality checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerKey {
    pub temperature: u32,
    pub top_k: i32,
    pub top_p: u32,
    pub min_p: u32,
    pub repeat_penalty: u32,
    pub repeat_last_n: i32,
}

/// One entry in the model-preset substring-match table.
#[derive(Debug, Clone)]
pub struct PresetEntry {
    /// Substring key, already normalized (lowercase, `-`/`_` -> space).
    pub key: &'static str,
    pub context_size: Option<u32>,
    pub batch_size: Option<u32>,
    pub threads: Option<u32>,
    pub generation_defaults: Option<GenerationOptions>,
    pub warmup: Option<bool>,
}
