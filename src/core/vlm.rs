//! Vision-language variant of the decode engine.
//!
//! A VLM turn is single-shot: the whole prompt, with the image-placeholder
//! run replaced by vision-encoder output, must fit one prefill chunk. The
//! chunk runs on group 1 with a plain causal mask, its K/V lands in the
//! decode group only, and the decode caches are cleared after the run so
//! the next turn starts from scratch.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::core::engine::LlmEngine;
use crate::core::kvcache::{self, DECODE_GROUP};
use crate::core::mask;
use crate::core::{RunOutput, StreamChunk};
use crate::device::{NpuBackend, VisionEncoder};
use crate::error::{LlmError, Result};
use crate::tokenizer::Tokenizer;
use crate::utils::config::{LlmAttr, ModelDims, PostConfig};
use crate::utils::logits_processor::LogitsProcessor;

/// InternVL image-placeholder token id.
pub const IMG_CONTEXT: u32 = 151667;

impl std::fmt::Debug for VlmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VlmEngine")
            .field("llm", &self.llm)
            .finish_non_exhaustive()
    }
}

pub struct VlmEngine {
    llm: LlmEngine,
    vision: Box<dyn VisionEncoder>,
}

impl VlmEngine {
    pub fn load(
        attr: LlmAttr,
        post_cfg: PostConfig,
        backend: &dyn NpuBackend,
        seed: u64,
    ) -> Result<Self> {
        let vpm_path = attr
            .vpm_model
            .clone()
            .ok_or_else(|| LlmError::load("model description has no vision resampler"))?;
        if attr.vpm_len == 0 {
            return Err(LlmError::load("model description has vpm_len = 0"));
        }
        let llm = LlmEngine::load(attr, post_cfg, backend, seed)?;
        let vision = backend.load_vision(&vpm_path)?;
        let want = llm.attr.vpm_len * llm.embed.embed_size();
        if vision.embed_len() != want {
            return Err(LlmError::load(format!(
                "vision encoder emits {} words, vpm_len * embed_size = {want}",
                vision.embed_len()
            )));
        }
        Ok(Self { llm, vision })
    }

    pub fn attr(&self) -> &LlmAttr {
        self.llm.attr()
    }

    pub fn dims(&self) -> &ModelDims {
        self.llm.dims()
    }

    pub fn processor(&self) -> &LogitsProcessor {
        self.llm.processor()
    }

    pub fn processor_mut(&mut self) -> &mut LogitsProcessor {
        self.llm.processor_mut()
    }

    pub fn stop_handle(&self) -> Arc<std::sync::atomic::AtomicBool> {
        self.llm.stop_handle()
    }

    pub fn stop(&self) {
        self.llm.stop();
    }

    pub fn image_width(&self) -> usize {
        self.vision.input_width()
    }

    pub fn image_height(&self) -> usize {
        self.vision.input_height()
    }

    /// Run the vision encoder over one RGB888 frame of the encoder's
    /// native geometry.
    pub fn encode_image(&mut self, rgb: &[u8]) -> Result<Vec<u16>> {
        let words = self.vision.encode(rgb)?;
        let want = self.llm.attr.vpm_len * self.llm.embed.embed_size();
        if words.len() != want {
            return Err(LlmError::device(format!(
                "vision encoder returned {} words, want {want}",
                words.len()
            )));
        }
        Ok(words)
    }

    /// Build the prompt's embedding rows, splicing the vision-encoder
    /// output over the image-placeholder run. Without an image the prompt
    /// must carry no placeholders.
    pub fn build_embed(&self, token_ids: &[u32], image: Option<&[u16]>) -> Result<Vec<u16>> {
        if token_ids.is_empty() {
            return Err(LlmError::args("empty prompt"));
        }
        let ptn = self.llm.dims.prefill_token_num;
        if token_ids.len() > ptn {
            return Err(LlmError::capacity(format!(
                "prompt of {} tokens exceeds the single prefill window of {ptn}",
                token_ids.len()
            )));
        }
        let emb = self.llm.embed.embed_size();
        let placeholders: Vec<usize> = token_ids
            .iter()
            .enumerate()
            .filter(|(_, &id)| id == IMG_CONTEXT)
            .map(|(i, _)| i)
            .collect();

        let Some(image) = image else {
            if !placeholders.is_empty() {
                return Err(LlmError::args(
                    "prompt has image placeholders but no image is set",
                ));
            }
            return Ok(self.llm.embed.lookup_all(token_ids));
        };

        let vpm_len = self.llm.attr.vpm_len;
        let (Some(&first), Some(&last)) = (placeholders.first(), placeholders.last()) else {
            return Err(LlmError::args("image is set but the prompt has no placeholders"));
        };
        if last - first + 1 != placeholders.len() {
            return Err(LlmError::args("image placeholders are not contiguous"));
        }
        if placeholders.len() != vpm_len {
            return Err(LlmError::args(format!(
                "prompt has {} image placeholders, encoder produces {vpm_len} rows",
                placeholders.len()
            )));
        }
        if image.len() != vpm_len * emb {
            return Err(LlmError::args(format!(
                "image embedding of {} words, want {}",
                image.len(),
                vpm_len * emb
            )));
        }

        let mut out = vec![0u16; token_ids.len() * emb];
        for (i, &id) in token_ids.iter().enumerate() {
            let row = &mut out[i * emb..(i + 1) * emb];
            if (first..=last).contains(&i) {
                let src = (i - first) * emb;
                row.copy_from_slice(&image[src..src + emb]);
            } else {
                self.llm.embed.lookup(id, row);
            }
        }
        Ok(out)
    }

    /// One single-shot generation over prebuilt embedding rows.
    pub fn run(
        &mut self,
        embeds: &[u16],
        tokenizer: &mut dyn Tokenizer,
        callback: Option<&mut dyn FnMut(StreamChunk<'_>)>,
    ) -> Result<RunOutput> {
        let emb = self.llm.embed.embed_size();
        if embeds.is_empty() || embeds.len() % emb != 0 {
            return Err(LlmError::args(format!(
                "embedding buffer of {} words is not a whole number of {emb}-word rows",
                embeds.len()
            )));
        }
        let token_count = embeds.len() / emb;
        let ptn = self.llm.dims.prefill_token_num;
        if token_count > ptn {
            return Err(LlmError::capacity(format!(
                "prompt of {token_count} tokens exceeds the single prefill window of {ptn}"
            )));
        }
        let kvsz = self.llm.dims.kv_cache_size;

        self.llm.stop.store(false, Ordering::SeqCst);
        let start = Instant::now();

        let mut data = vec![0u16; ptn * emb];
        data[..embeds.len()].copy_from_slice(embeds);
        let chunk_mask = mask::causal_mask(ptn);
        let indices: Vec<u16> = (0..ptn as u16).collect();
        let mut stopped = false;
        for runner in self.llm.partitions.iter_mut() {
            if self.llm.stop.load(Ordering::SeqCst) {
                stopped = true;
                break;
            }
            runner.input(1, "input")?.copy_from_slice(&data);
            runner.input(1, "mask")?.copy_from_slice(&chunk_mask);
            runner.input(1, "indices")?.copy_from_slice(&indices);
            runner.run(1)?;
            kvcache::mirror_chunk(runner.as_mut(), 1, DECODE_GROUP, 0, token_count * kvsz)?;
            data.copy_from_slice(runner.output(1, "output")?);
        }
        if stopped {
            self.reset_decode_state()?;
            return Ok(RunOutput {
                text: String::new(),
                token_ids: Vec::new(),
                finish: crate::core::FinishReason::Stopped,
                ttft_ms: 0.0,
                tokens_per_sec: 0.0,
            });
        }
        let first = self
            .llm
            .run_post(&data[(token_count - 1) * emb..token_count * emb], &[])?;
        let ttft_ms = start.elapsed().as_secs_f32() * 1000.0;
        info!(ttft_ms, "first token ready");

        let out = self
            .llm
            .decode_phase(token_count, first, ttft_ms, tokenizer, callback)?;

        // Single-shot: nothing carries over to the next turn.
        self.reset_decode_state()?;
        Ok(out)
    }

    fn reset_decode_state(&mut self) -> Result<()> {
        let empty_mask = mask::decode_mask(self.llm.dims.kv_cache_num, 0);
        for runner in self.llm.partitions.iter_mut() {
            kvcache::clear_cache(runner.as_mut(), DECODE_GROUP)?;
            runner
                .input(DECODE_GROUP, "mask")?
                .copy_from_slice(&empty_mask);
        }
        Ok(())
    }
}
