use std::sync::Arc;

use slm_types::{AdapterConfig, Result};

use crate::native::{ModelInfo, NativeBackend};

/// Loaded weights + vocabulary. Read-mostly, shareable across the contexts
/// built from it. Freed last on [`crate::adapter::Adapter::close`].
pub struct Model<B: NativeBackend> {
    backend: Arc<B>,
    handle: B::Model,
    info: ModelInfo,
}

impl<B: NativeBackend> Model<B> {
    pub fn load(backend: Arc<B>, path: &str, gpu_layers: u32, use_mmap: bool, use_mlock: bool) -> Result<Self> {
        let handle = backend.model_load(path, gpu_layers, use_mmap, use_mlock)?;
        let info = backend.model_info(&handle);
        Ok(Self { backend, handle, info })
    }

    pub fn from_config(backend: Arc<B>, config: &AdapterConfig) -> Result<Self> {
        Self::load(backend, &config.model_path, config.gpu_layers, config.mmap, config.mlock)
    }

    #[must_use]
    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    #[must_use]
    pub fn handle(&self) -> &B::Model {
        &self.handle
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<u32>> {
        self.backend.tokenize(&self.handle, text, add_special, parse_special)
    }

    pub fn token_to_piece(&self, token: u32) -> Result<Vec<u8>> {
        self.backend.token_to_piece(&self.handle, token)
    }

    #[must_use]
    pub fn is_eog(&self, token: u32) -> bool {
        self.backend.token_is_eog(&self.handle, token)
    }

    #[must_use]
    pub fn token_bos(&self) -> u32 {
        self.backend.token_bos(&self.handle)
    }

    #[must_use]
    pub fn token_eos(&self) -> u32 {
        self.backend.token_eos(&self.handle)
    }
}
