//! The last request's full prompt-token vector, used to detect a reusable
//! KV prefix on the next request (invariant I2: when non-empty, its
//! contents equal the exact prompt-token prefix present in the context's
//! KV). Holds prompt tokens only — generated tokens are never appended
//! (invariant I5).

#[derive(Debug, Default, Clone)]
pub struct PromptCache {
    tokens: Vec<u32>,
}

impl PromptCache {
    #[must_use]
    pub fn empty() -> Self {
        Self { tokens: Vec::new() }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn invalidate(&mut self) {
        self.tokens.clear();
    }

    pub fn store(&mut self, tokens: Vec<u32>) {
        self.tokens = tokens;
    }

    /// Length of the shared prefix between the cached tokens and `tokens`.
    #[must_use]
    pub fn longest_common_prefix(&self, tokens: &[u32]) -> usize {
        self.tokens.iter().zip(tokens.iter()).take_while(|(a, b)| a == b).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_of_identical_sequences_is_full_length() {
        let mut cache = PromptCache::empty();
        cache.store(vec![1, 2, 3]);
        assert_eq!(cache.longest_common_prefix(&[1, 2, 3]), 3);
    }

    #[test]
    fn prefix_stops_at_first_divergence() {
        let mut cache = PromptCache::empty();
        cache.store(vec![1, 2, 3]);
        assert_eq!(cache.longest_common_prefix(&[1, 2, 9, 9]), 2);
    }

    #[test]
    fn empty_cache_has_zero_prefix() {
        let cache = PromptCache::empty();
        assert_eq!(cache.longest_common_prefix(&[1, 2, 3]), 0);
    }

    #[test]
    fn invalidate_clears_stored_tokens() {
        let mut cache = PromptCache::empty();
        cache.store(vec![1, 2, 3]);
        cache.invalidate();
        assert!(cache.is_empty());
    }
}
