//! Crate-wide error type.

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Errors surfaced by the decoding engine and its sessions.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Model or embedding-table loading failed. Fatal: the engine is not usable.
    #[error("load error: {reason}")]
    Load {
        /// Description of what went wrong
        reason: String,
    },

    /// The requested sequence does not fit any KV-cache capacity group.
    /// Recoverable: the caller should clear the context and retry.
    #[error("kv cache capacity exceeded: {reason}, the context may be full, try clear context")]
    CapacityExceeded {
        /// Which limit was hit
        reason: String,
    },

    /// A caller-supplied argument was rejected before any device work.
    #[error("invalid argument: {reason}")]
    InvalidArgs {
        /// Why it was rejected
        reason: String,
    },

    /// A stop request arrived while the operation's result was still
    /// incomplete, so there is nothing coherent to return.
    #[error("interrupted: {reason}")]
    Interrupted {
        /// What was cut short
        reason: String,
    },

    /// A named tensor was missing or had an unexpected shape on the device.
    #[error("device error: {reason}")]
    Device {
        /// Description of what went wrong
        reason: String,
    },

    /// The external tokenizer service failed or returned a malformed reply.
    #[error("tokenizer error: {reason}")]
    Tokenizer {
        /// Description of what went wrong
        reason: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LlmError {
    pub fn load(reason: impl Into<String>) -> Self {
        Self::Load {
            reason: reason.into(),
        }
    }

    pub fn capacity(reason: impl Into<String>) -> Self {
        Self::CapacityExceeded {
            reason: reason.into(),
        }
    }

    pub fn args(reason: impl Into<String>) -> Self {
        Self::InvalidArgs {
            reason: reason.into(),
        }
    }

    pub fn interrupted(reason: impl Into<String>) -> Self {
        Self::Interrupted {
            reason: reason.into(),
        }
    }

    pub fn device(reason: impl Into<String>) -> Self {
        Self::Device {
            reason: reason.into(),
        }
    }

    pub fn tokenizer(reason: impl Into<String>) -> Self {
        Self::Tokenizer {
            reason: reason.into(),
        }
    }

    /// True for the "context full" condition callers handle by clearing the
    /// conversation.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}
