//! Multi-turn chat on top of the text engine.
//!
//! The session owns the engine, the tokenizer and the KV snapshot of the
//! conversation so far. Each turn encodes only the context diff, restores
//! the snapshot, runs, and re-exports. A capacity rejection leaves the
//! snapshot untouched; the caller decides whether to clear the context and
//! start over.

use tracing::info;

use crate::core::engine::LlmEngine;
use crate::core::kvcache::KvSnapshot;
use crate::core::{RunOutput, StreamChunk};
use crate::error::{LlmError, Result};
use crate::tokenizer::Tokenizer;

pub struct ChatSession {
    engine: LlmEngine,
    tokenizer: Box<dyn Tokenizer>,
    system_prompt: String,
    last_reply: String,
    snapshot: KvSnapshot,
}

impl ChatSession {
    pub fn new(
        engine: LlmEngine,
        tokenizer: Box<dyn Tokenizer>,
        system_prompt: &str,
    ) -> Result<Self> {
        let mut session = Self {
            engine,
            tokenizer,
            system_prompt: system_prompt.to_string(),
            last_reply: String::new(),
            snapshot: KvSnapshot::empty(0),
        };
        session.clear_context()?;
        Ok(session)
    }

    pub fn engine(&self) -> &LlmEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut LlmEngine {
        &mut self.engine
    }

    /// Model type string from the loaded description file.
    pub fn model_type(&self) -> &str {
        &self.engine.attr().model_type
    }

    /// Positions of conversation currently cached.
    pub fn context_len(&self) -> usize {
        self.snapshot.precompute_len
    }

    /// Tokens the next turn may still prefill.
    pub fn remaining_budget(&self) -> usize {
        self.engine.dims().turn_budget(self.snapshot.precompute_len)
    }

    /// Drop the conversation and rebuild the system-prompt baseline.
    pub fn clear_context(&mut self) -> Result<()> {
        self.last_reply.clear();
        let ids = self.tokenizer.reset(&self.system_prompt)?;
        self.snapshot = self.engine.prefill_prompt(&ids)?;
        info!(baseline = self.snapshot.precompute_len, "context cleared");
        Ok(())
    }

    /// Replace the system prompt; the conversation restarts from it.
    pub fn set_system_prompt(&mut self, prompt: &str) -> Result<()> {
        self.system_prompt = prompt.to_string();
        self.clear_context()
    }

    /// One user turn. The previous reply is folded into the encode request
    /// so the tokenizer service can diff against the cached context.
    pub fn send(
        &mut self,
        msg: &str,
        callback: Option<&mut dyn FnMut(StreamChunk<'_>)>,
    ) -> Result<RunOutput> {
        if msg.trim().is_empty() {
            return Err(LlmError::args("empty message"));
        }
        let encoded = self.tokenizer.encode(msg, &self.last_reply, false)?;
        self.engine
            .import_snapshot(&self.snapshot, encoded.diff.len())?;
        let embeds = self.engine.embed_table().lookup_all(&encoded.diff);
        let out = self
            .engine
            .run(&embeds, self.tokenizer.as_mut(), callback)?;
        self.last_reply = out.text.clone();
        self.snapshot = self.engine.export_snapshot()?;
        Ok(out)
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

    fn session(dir: &Path) -> ChatSession {
        let backend = SimBackend::new(SimSpec::small());
        let spec = backend.spec();
        let embed_path = dir.join("embeds.bin");
        write_embed_table(&embed_path, spec.vocab, spec.embed_size).unwrap();
        let attr = LlmAttr {
            template_filename_axmodel: dir.join("llm_l%d.axmodel"),
            filename_post_axmodel: dir.join("llm_post.axmodel"),
            filename_tokens_embed: embed_path,
            url_tokenizer: "http://localhost:8080".into(),
            model_type: "sim".into(),
            tokenizer_type: None,
            axmodel_num: spec.axmodel_num,
            tokens_embed_num: spec.vocab,
            tokens_embed_size: spec.embed_size,
            use_mmap_load_embed: false,
            vpm_model: None,
            vpm_len: 0,
        };
        let engine = LlmEngine::load(attr, greedy_cfg(), &backend, 42).unwrap();
        ChatSession::new(engine, Box::new(SimTokenizer::new(32)), "").unwrap()
    }

    #[test]
    fn test_new_session_prefills_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        // An empty system prompt still carries the leading bos.
        assert_eq!(session.context_len(), 1);
        assert_eq!(session.remaining_budget(), 24);
    }

    #[test]
    fn test_send_grows_context_by_diff_plus_reply() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        let before = session.context_len();
        let mut sink = |_: StreamChunk<'_>| {};
        let out = session.send("hello", Some(&mut sink)).unwrap();
        assert!(!out.token_ids.is_empty());
        // "hello" encodes to one token; every produced token adds one row.
        assert_eq!(session.context_len(), before + 1 + out.token_ids.len());
    }

    #[test]
    fn test_replies_walk_successor_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        let mut sink = |_: StreamChunk<'_>| {};
        let out = session.send("hello", Some(&mut sink)).unwrap();
        assert_eq!(out.finish, FinishReason::Eos);
        for pair in out.token_ids.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
    }

    #[test]
    fn test_empty_message_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        let err = session.send("   ", None).unwrap_err();
        assert!(matches!(err, LlmError::InvalidArgs { .. }));
    }

    #[test]
    fn test_capacity_rejection_then_clear_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        // 40 distinct words exceed the 24-token turn budget.
        let long: String = (0..40).map(|i| format!("w{i} ")).collect();
        let err = session.send(&long, None).unwrap_err();
        assert!(err.is_capacity());

        session.clear_context().unwrap();
        assert_eq!(session.context_len(), 1);
        let mut sink = |_: StreamChunk<'_>| {};
        assert!(session.send("hello", Some(&mut sink)).is_ok());
    }

    #[test]
    fn test_clear_context_resets_to_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        let mut sink = |_: StreamChunk<'_>| {};
        session.send("hello", Some(&mut sink)).unwrap();
        assert!(session.context_len() > 1);
        session.clear_context().unwrap();
        assert_eq!(session.context_len(), 1);
    }

    #[test]
    fn test_system_prompt_extends_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        session.set_system_prompt("be terse").unwrap();
        // bos + two prompt words.
        assert_eq!(session.context_len(), 3);
    }
}
