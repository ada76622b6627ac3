//! Deterministic in-crate codec for tests, demos and the CLI.
//!
//! Every whitespace-separated word hashes to a stable id inside the
//! configured vocabulary; decoding renders each id as `[id]`, so the decode
//! of a token sequence is exactly the concatenation of the decodes of its
//! fragments. Context diffing mirrors the HTTP service: the codec keeps the
//! conversation ids and reports only the new suffix.

use crate::core::vlm::IMG_CONTEXT;
use crate::error::Result;
use crate::tokenizer::{Encoded, Tokenizer};

pub struct SimTokenizer {
    vocab: u32,
    bos: u32,
    eos: u32,
    /// Placeholder tokens emitted per image prompt, 0 for LLM variants.
    vpm_len: usize,
    context: Vec<u32>,
}

impl SimTokenizer {
    pub fn new(vocab: u32) -> Self {
        Self {
            vocab,
            bos: 1,
            eos: vocab - 1,
            vpm_len: 0,
            context: Vec::new(),
        }
    }

    /// Codec for the VLM variant: image prompts get `vpm_len` placeholder
    /// tokens spliced after the leading bos.
    pub fn with_image_support(vocab: u32, vpm_len: usize) -> Self {
        Self {
            vpm_len,
            ..Self::new(vocab)
        }
    }

    /// Stable word hash into `[2, eos)`, keeping 0, bos and eos reserved.
    fn word_id(&self, word: &str) -> u32 {
        let mut h: u32 = 2166136261;
        for b in word.bytes() {
            h ^= b as u32;
            h = h.wrapping_mul(16777619);
        }
        let span = self.eos.saturating_sub(2).max(1);
        2 + h % span
    }

    fn encode_words(&self, text: &str) -> Vec<u32> {
        text.split_whitespace().map(|w| self.word_id(w)).collect()
    }
}

impl Tokenizer for SimTokenizer {
    fn reset(&mut self, system_prompt: &str) -> Result<Vec<u32>> {
        self.context = vec![self.bos];
        self.context.extend(self.encode_words(system_prompt));
        Ok(self.context.clone())
    }

    fn encode(&mut self, text: &str, last_reply: &str, img_prompt: bool) -> Result<Encoded> {
        let mut diff = Vec::new();
        if !last_reply.is_empty() {
            diff.extend(self.encode_words(last_reply));
        }
        if img_prompt && self.vpm_len > 0 {
            diff.extend(std::iter::repeat(IMG_CONTEXT).take(self.vpm_len));
        }
        diff.extend(self.encode_words(text));
        self.context.extend(&diff);
        Ok(Encoded {
            token_ids: self.context.clone(),
            diff,
        })
    }

    fn decode(&mut self, token_ids: &[u32]) -> Result<String> {
        let mut out = String::new();
        for id in token_ids {
            out.push_str(&format!("[{id}]"));
        }
        Ok(out)
    }

    fn bos_id(&self) -> u32 {
        self.bos
    }

    fn eos_id(&self) -> u32 {
        self.eos
    }
}
