//! On-device autoregressive decoding for partitioned NPU transformer
//! models.
//!
//! The compiled model is a set of partition modules plus a logits head,
//! each carrying one single-token decode group and several prefill groups
//! of ascending KV capacity. The engine drives them in two phases: chunked
//! prefill of the new prompt tokens, then one-token-per-pass decode.
//! Conversation state is a plain KV snapshot the session layer exports and
//! re-imports across turns; tokenization lives out of process behind the
//! [`tokenizer::Tokenizer`] trait.

pub mod core;
pub mod device;
pub mod error;
pub mod session;
pub mod tokenizer;
pub mod utils;

pub use crate::core::engine::LlmEngine;
pub use crate::core::kvcache::KvSnapshot;
pub use crate::core::vlm::{VlmEngine, IMG_CONTEXT};
pub use crate::core::{FinishReason, RunOutput, StreamChunk};
pub use crate::error::{LlmError, Result};
pub use crate::session::{ChatSession, VlmSession};
pub use crate::tokenizer::{HttpTokenizer, SimTokenizer, Tokenizer};
pub use crate::utils::config::{LlmAttr, ModelDims, PostConfig};
