//! Conversation controllers on top of the engines: context carry-over for
//! the text models, single-shot image turns for the vision models.

pub mod chat;
pub mod vlm;

pub use chat::ChatSession;
pub use vlm::VlmSession;
