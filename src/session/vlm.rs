//! Single-shot vision-language turns.
//!
//! No context carries over between turns: every `send` re-encodes the
//! whole prompt from the system prompt. The current image sticks until
//! explicitly cleared, so several questions can be asked about one frame.

use crate::core::vlm::VlmEngine;
use crate::core::{RunOutput, StreamChunk};
use crate::error::{LlmError, Result};
use crate::tokenizer::Tokenizer;

pub struct VlmSession {
    engine: VlmEngine,
    tokenizer: Box<dyn Tokenizer>,
    system_prompt: String,
    image: Option<Vec<u16>>,
}

impl VlmSession {
    pub fn new(engine: VlmEngine, tokenizer: Box<dyn Tokenizer>, system_prompt: &str) -> Self {
        Self {
            engine,
            tokenizer,
            system_prompt: system_prompt.to_string(),
            image: None,
        }
    }

    pub fn engine(&self) -> &VlmEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut VlmEngine {
        &mut self.engine
    }

    /// Model type string from the loaded description file.
    pub fn model_type(&self) -> &str {
        &self.engine.attr().model_type
    }

    pub fn set_system_prompt(&mut self, prompt: &str) {
        self.system_prompt = prompt.to_string();
    }

    /// Encode one RGB888 frame for the following turns. The frame must
    /// match the vision encoder's native geometry.
    pub fn set_image(&mut self, rgb: &[u8], width: usize, height: usize) -> Result<()> {
        if width != self.engine.image_width() || height != self.engine.image_height() {
            return Err(LlmError::args(format!(
                "image is {width}x{height}, encoder wants {}x{}",
                self.engine.image_width(),
                self.engine.image_height()
            )));
        }
        self.image = Some(self.engine.encode_image(rgb)?);
        Ok(())
    }

    pub fn clear_image(&mut self) {
        self.image = None;
    }

    pub fn is_image_set(&self) -> bool {
        self.image.is_some()
    }

    /// One single-shot turn over the current image (if any).
    pub fn send(
        &mut self,
        msg: &str,
        callback: Option<&mut dyn FnMut(StreamChunk<'_>)>,
    ) -> Result<RunOutput> {
        if msg.trim().is_empty() {
            return Err(LlmError::args("empty message"));
        }
        self.tokenizer.reset(&self.system_prompt)?;
        let encoded = self.tokenizer.encode(msg, "", self.image.is_some())?;
        let embeds = self
            .engine
            .build_embed(&encoded.token_ids, self.image.as_deref())?;
        self.engine.run(&embeds, self.tokenizer.as_mut(), callback)
    }

    pub fn stop(&self) {
        self.engine.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FinishReason;
    use crate::device::sim::{write_embed_table, SimBackend, SimSpec};
    use crate::tokenizer::SimTokenizer;
    use crate::utils::config::{LlmAttr, PostConfig};
    use std::path::Path;

    fn greedy_cfg() -> PostConfig {
        PostConfig {
            enable_temperature: false,
            enable_repetition_penalty: false,
            enable_diversity_penalty: false,
            enable_top_p_sampling: false,
            enable_top_k_sampling: false,
            ..PostConfig::default()
        }
    }

    fn session(dir: &Path) -> VlmSession {
        let backend = SimBackend::new(SimSpec {
            vlm_prefill_mask: true,
            ..SimSpec::small()
        });
        let spec = backend.spec();
        let embed_path = dir.join("embeds.bin");
        write_embed_table(&embed_path, spec.vocab, spec.embed_size).unwrap();
        let attr = LlmAttr {
            template_filename_axmodel: dir.join("vlm_l%d.axmodel"),
            filename_post_axmodel: dir.join("vlm_post.axmodel"),
            filename_tokens_embed: embed_path,
            url_tokenizer: "http://localhost:8080".into(),
            model_type: "sim-vl".into(),
            tokenizer_type: None,
            axmodel_num: spec.axmodel_num,
            tokens_embed_num: spec.vocab,
            tokens_embed_size: spec.embed_size,
            use_mmap_load_embed: false,
            vpm_model: Some(dir.join("vpm.axmodel")),
            vpm_len: spec.vpm_len,
        };
        let engine = VlmEngine::load(attr, greedy_cfg(), &backend, 42).unwrap();
        VlmSession::new(engine, Box::new(SimTokenizer::with_image_support(32, 4)), "")
    }

    #[test]
    fn test_image_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        assert!(!session.is_image_set());
        session.set_image(&vec![9u8; 16 * 16 * 3], 16, 16).unwrap();
        assert!(session.is_image_set());
        session.clear_image();
        assert!(!session.is_image_set());
    }

    #[test]
    fn test_wrong_geometry_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        let err = session.set_image(&vec![0u8; 8 * 8 * 3], 8, 8).unwrap_err();
        assert!(matches!(err, LlmError::InvalidArgs { .. }));
        assert!(!session.is_image_set());
    }

    #[test]
    fn test_send_with_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        session.set_image(&vec![1u8; 16 * 16 * 3], 16, 16).unwrap();
        let mut sink = |_: StreamChunk<'_>| {};
        let out = session.send("what", Some(&mut sink)).unwrap();
        assert_eq!(out.finish, FinishReason::Eos);
        for pair in out.token_ids.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
        // The image sticks for follow-up questions.
        assert!(session.is_image_set());
        assert!(session.send("again", Some(&mut sink)).is_ok());
    }

    #[test]
    fn test_send_without_image_is_text_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        let mut sink = |_: StreamChunk<'_>| {};
        let out = session.send("hi", Some(&mut sink)).unwrap();
        assert_eq!(out.finish, FinishReason::Eos);
    }

    #[test]
    fn test_empty_message_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        let err = session.send("", None).unwrap_err();
        assert!(matches!(err, LlmError::InvalidArgs { .. }));
    }
}
