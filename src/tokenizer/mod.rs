//! Text <-> token-id codec seam.
//!
//! The platform keeps tokenization out of process: an HTTP service holds
//! the conversation template and performs server-side context diffing, so
//! the engine only ever sees token ids. The trait keeps that service
//! swappable for a deterministic in-crate codec in tests and demos.

pub mod http;
pub mod sim;

pub use http::HttpTokenizer;
pub use sim::SimTokenizer;

use crate::error::Result;

/// Result of encoding one user turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Encoded {
    /// The full token sequence of the conversation so far.
    pub token_ids: Vec<u32>,
    /// The suffix of tokens not yet represented in the cached context;
    /// only these need prefill.
    pub diff: Vec<u32>,
}

pub trait Tokenizer {
    /// Clear the service-side conversation and seed it with a system
    /// prompt; returns the prompt's token ids.
    fn reset(&mut self, system_prompt: &str) -> Result<Vec<u32>>;

    /// Encode one user turn. `last_reply` is the previous assistant answer,
    /// folded in so the service can diff against the cached context.
    /// `img_prompt` asks for image-placeholder tokens (VLM).
    fn encode(&mut self, text: &str, last_reply: &str, img_prompt: bool) -> Result<Encoded>;

    fn decode(&mut self, token_ids: &[u32]) -> Result<String>;

    fn bos_id(&self) -> u32;

    fn eos_id(&self) -> u32;
}
