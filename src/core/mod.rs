//! Decoding core: embedding table, masks, KV-cache plumbing and the
//! two-phase prefill/decode engines.

pub mod embed;
pub mod engine;
pub mod kvcache;
pub mod mask;
pub mod vlm;

/// Why a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model produced the end-of-sequence token.
    Eos,
    /// The absolute position ceiling was reached.
    Length,
    /// A cooperative stop request was honored.
    Stopped,
}

/// One streaming fragment handed to the caller mid-generation.
#[derive(Debug, Clone, Copy)]
pub struct StreamChunk<'a> {
    /// Token ids in this fragment only.
    pub token_ids: &'a [u32],
    /// Decoded text of this fragment only; fragments concatenate to the
    /// final reply.
    pub text: &'a str,
    /// Decode throughput so far.
    pub tokens_per_sec: f32,
}

/// A completed generation.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub text: String,
    pub token_ids: Vec<u32>,
    pub finish: FinishReason,
    /// Milliseconds from request to the first produced token.
    pub ttft_ms: f32,
    pub tokens_per_sec: f32,
}
