//! Substring-match preset table (spec section 4.9). On model load, the
//! description and filename are normalized (lowercased, `-`/`_` replaced
//! with space) and checked in order against each preset's key; the first
//! substring match wins. A matched preset only fills in fields that are
//! still at their zero value — explicit configuration always wins.

use slm_types::{AdapterConfig, GenerationOptions, PresetEntry};

/// Built-in substring-keyed preset table, one entry per model family the
/// teacher's own `filename_patterns.rs` architecture table recognizes.
/// Context sizes are each family's commonly-shipped training length; these
/// are starting points, not tuned per-checkpoint values — an explicit
/// `AdapterConfig` field always wins over them.
#[must_use]
pub fn default_presets() -> Vec<PresetEntry> {
    vec![
        PresetEntry {
            key: "llama 3",
            context_size: Some(8192),
            batch_size: Some(512),
            threads: None,
            generation_defaults: Some(GenerationOptions { temperature: 0.6, ..GenerationOptions::default() }),
            warmup: Some(true),
        },
        PresetEntry {
            key: "qwen",
            context_size: Some(32768),
            batch_size: Some(512),
            threads: None,
            generation_defaults: Some(GenerationOptions { temperature: 0.7, ..GenerationOptions::default() }),
            warmup: Some(true),
        },
        PresetEntry {
            key: "gemma",
            context_size: Some(8192),
            batch_size: Some(512),
            threads: None,
            generation_defaults: Some(GenerationOptions { temperature: 0.7, ..GenerationOptions::default() }),
            warmup: Some(true),
        },
        PresetEntry {
            key: "mistral",
            context_size: Some(32768),
            batch_size: Some(512),
            threads: None,
            generation_defaults: Some(GenerationOptions { temperature: 0.7, ..GenerationOptions::default() }),
            warmup: Some(true),
        },
        PresetEntry {
            key: "phi",
            context_size: Some(4096),
            batch_size: Some(512),
            threads: None,
            generation_defaults: Some(GenerationOptions { temperature: 0.7, ..GenerationOptions::default() }),
            warmup: Some(true),
        },
    ]
}

fn normalize(s: &str) -> String {
    s.to_lowercase().replace(['-', '_'], " ")
}

#[must_use]
pub fn find_preset<'a>(table: &'a [PresetEntry], description: &str, filename: &str) -> Option<&'a PresetEntry> {
    let description = normalize(description);
    let filename = normalize(filename);
    table.iter().find(|entry| description.contains(entry.key) || filename.contains(entry.key))
}

/// Apply a matched preset's defaults onto `config`, leaving any non-zero
/// field (already set by explicit configuration) untouched.
pub fn apply_preset(config: &mut AdapterConfig, preset: &PresetEntry) {
    if config.context_size == 0 {
        if let Some(v) = preset.context_size {
            config.context_size = v;
        }
    }
    if config.batch_size == 0 {
        if let Some(v) = preset.batch_size {
            config.batch_size = v;
        }
    }
    if config.threads == 0 {
        if let Some(v) = preset.threads {
            config.threads = v;
        }
    }
    if !config.warmup {
        if let Some(v) = preset.warmup {
            config.warmup = v;
        }
    }
    if let Some(defaults) = &preset.generation_defaults {
        merge_generation_defaults(&mut config.generation_defaults, defaults);
    }
}

fn merge_generation_defaults(target: &mut GenerationOptions, preset: &GenerationOptions) {
    if target.max_tokens == 0 {
        target.max_tokens = preset.max_tokens;
    }
    if target.temperature == 0.0 {
        target.temperature = preset.temperature;
    }
    if target.top_k == 0 {
        target.top_k = preset.top_k;
    }
    if target.top_p == 0.0 {
        target.top_p = preset.top_p;
    }
    if target.min_p == 0.0 {
        target.min_p = preset.min_p;
    }
    if target.repeat_penalty == 0.0 {
        target.repeat_penalty = preset.repeat_penalty;
    }
    if target.repeat_last_n == 0 {
        target.repeat_last_n = preset.repeat_last_n;
    }
    if target.stop.is_empty() {
        target.stop = preset.stop.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Vec<PresetEntry> {
        vec![PresetEntry {
            key: "llama 3",
            context_size: Some(8192),
            batch_size: Some(512),
            threads: None,
            generation_defaults: Some(GenerationOptions { temperature: 0.7, ..GenerationOptions::default() }),
            warmup: Some(true),
        }]
    }

    #[test]
    fn matches_on_normalized_filename_substring() {
        let table = table();
        let found = find_preset(&table, "a generic gguf", "Llama-3-8B-Instruct.Q4_K_M.gguf");
        assert!(found.is_some());
    }

    #[test]
    fn no_match_returns_none() {
        let table = table();
        assert!(find_preset(&table, "mystery model", "mystery.gguf").is_none());
    }

    #[test]
    fn explicit_config_wins_over_preset() {
        let table = table();
        let preset = find_preset(&table, "", "llama-3-8b.gguf").unwrap();
        let mut config = AdapterConfig::new("model.gguf");
        config.context_size = 2048;
        apply_preset(&mut config, preset);
        assert_eq!(config.context_size, 2048);
        assert!(config.warmup);
    }

    #[test]
    fn default_presets_matches_known_family_filename() {
        let table = default_presets();
        let found = find_preset(&table, "a generic gguf", "Qwen2.5-7B-Instruct-Q4_K_M.gguf");
        assert!(found.is_some());
        assert_eq!(found.unwrap().key, "qwen");
    }

    #[test]
    fn default_presets_fills_zero_generation_temperature() {
        let table = default_presets();
        let preset = find_preset(&table, "", "gemma-2-9b.gguf").unwrap();
        let mut config = AdapterConfig::new("model.gguf");
        assert_eq!(config.generation_defaults.temperature, 0.0);
        apply_preset(&mut config, preset);
        assert_eq!(config.generation_defaults.temperature, 0.7);
    }
}
