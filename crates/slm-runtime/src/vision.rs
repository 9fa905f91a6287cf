//! Multimodal projector, feature-gated behind `vision` (mirroring the
//! teacher's `#[cfg(feature = "vision")]` split in `generation.rs`). Given a
//! prompt with media markers and N image paths, advances the context's KV
//! state and returns the new `pos`, exactly the contract in spec sections 2
//! and 4.2.

use slm_types::Result;

use crate::context::Context;
use crate::native::NativeBackend;

/// One `<__media__>` marker per image, inserted the same way the teacher's
/// `inject_media_markers` does: just before the last occurrence of the
/// user-visible message text, falling back to prepending if not found.
#[must_use]
pub fn inject_media_markers(prompt: &str, anchor: &str, count: usize) -> String {
    let markers = "<__media__>\n".repeat(count);
    if let Some(pos) = prompt.rfind(anchor) {
        let mut result = String::with_capacity(prompt.len() + markers.len());
        result.push_str(&prompt[..pos]);
        result.push_str(&markers);
        result.push_str(&prompt[pos..]);
        result
    } else {
        format!("{markers}{prompt}")
    }
}

pub struct VisionContext<B: NativeBackend> {
    handle: B::Vision,
}

impl<B: NativeBackend> VisionContext<B> {
    pub fn load(backend: &B, mmproj_path: &str, model: &B::Model, n_threads: u32, use_gpu: bool) -> Result<Self> {
        let handle = backend.vision_init(mmproj_path, model, n_threads, use_gpu)?;
        Ok(Self { handle })
    }

    /// Evaluate `prompt` (already carrying media markers) plus `images`
    /// against `context`, starting from `context.pos()`. Returns the new
    /// `pos`; the caller is responsible for setting `context`'s position
    /// and clearing the prompt cache (invariant I4).
    pub fn eval_with_images(
        &mut self,
        backend: &B,
        context: &mut Context<B>,
        prompt: &str,
        images: &[String],
        n_batch: u32,
    ) -> Result<u32> {
        if images.is_empty() {
            return Err(slm_types::AdapterError::Vision("eval_with_images called with no images".into()));
        }
        backend.vision_eval(&mut self.handle, context.handle_mut(), prompt, images, context.pos(), n_batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_inserted_before_anchor_text() {
        let result = inject_media_markers("SYSTEM:\nhi\nUSER:\nlook at this", "look at this", 1);
        assert!(result.contains("<__media__>\nlook at this"));
    }

    #[test]
    fn marker_count_matches_image_count() {
        let result = inject_media_markers("hello world", "world", 3);
        assert_eq!(result.matches("<__media__>").count(), 3);
    }

    #[test]
    fn falls_back_to_prepend_when_anchor_missing() {
        let result = inject_media_markers("hello", "missing", 1);
        assert!(result.starts_with("<__media__>"));
    }
}
