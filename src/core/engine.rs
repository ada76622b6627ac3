//! Two-phase autoregressive decode engine.
//!
//! A generation has a prefill phase, which pushes the new prompt tokens
//! through the partitions in fixed-size chunks on one of the prefill
//! execution groups, and a decode phase, which produces one token per pass
//! on group 0. Prefill K/V output lands in both the active prefill group
//! and the decode group, so decode reads a complete history without
//! re-running any position.
//!
//! The decode mask doubles as the position counter: every cached row has a
//! zero slot, everything else holds the sentinel, and the engine keeps the
//! partitions' group-0 mask in sync at the end of each run so a snapshot
//! export can recover the valid length by scanning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::core::embed::EmbedTable;
use crate::core::kvcache::{self, KvSnapshot, DECODE_GROUP};
use crate::core::mask;
use crate::core::{FinishReason, RunOutput, StreamChunk};
use crate::device::{NpuBackend, NpuRunner};
use crate::error::{LlmError, Result};
use crate::tokenizer::Tokenizer;
use crate::utils::bf16_slice_to_f32;
use crate::utils::config::{LlmAttr, ModelDims, PostConfig};
use crate::utils::logits_processor::LogitsProcessor;
use crate::utils::progress::Progress;

/// Tokens buffered before a streaming callback flush.
const STREAM_FLUSH_TOKENS: usize = 3;

impl std::fmt::Debug for LlmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmEngine")
            .field("attr", &self.attr)
            .field("dims", &self.dims)
            .field("precompute_len", &self.precompute_len)
            .field("prefill_grpid", &self.prefill_grpid)
            .finish_non_exhaustive()
    }
}

pub struct LlmEngine {
    pub(crate) attr: LlmAttr,
    pub(crate) dims: ModelDims,
    pub(crate) partitions: Vec<Box<dyn NpuRunner>>,
    pub(crate) post: Box<dyn NpuRunner>,
    pub(crate) embed: EmbedTable,
    pub(crate) processor: LogitsProcessor,
    /// Positions already cached before the current turn's prefill.
    pub(crate) precompute_len: usize,
    /// Prefill group chosen at the last snapshot import.
    pub(crate) prefill_grpid: usize,
    pub(crate) stop: Arc<AtomicBool>,
}

impl LlmEngine {
    pub fn load(
        attr: LlmAttr,
        post_cfg: PostConfig,
        backend: &dyn NpuBackend,
        seed: u64,
    ) -> Result<Self> {
        if attr.axmodel_num == 0 {
            return Err(LlmError::load("model description declares zero partitions"));
        }
        let progress = Progress::new(attr.axmodel_num + 2, "loading model");
        let embed = EmbedTable::open(
            &attr.filename_tokens_embed,
            attr.tokens_embed_num,
            attr.tokens_embed_size,
            attr.use_mmap_load_embed,
        )?;
        progress.update(1, "tokens embed");

        let mut partitions = Vec::with_capacity(attr.axmodel_num);
        for i in 0..attr.axmodel_num {
            let path = attr.partition_path(i);
            partitions.push(backend.load_runner(&path)?);
            progress.update(2 + i, &format!("partition {i}"));
        }
        let post = backend.load_runner(&attr.filename_post_axmodel)?;
        progress.finish();

        let dims = discover_dims(partitions[0].as_ref())?;
        let emb_words = partitions[0].input_ref(DECODE_GROUP, "input")?.len();
        if emb_words != attr.tokens_embed_size {
            return Err(LlmError::load(format!(
                "partition input row is {emb_words} words, embed table rows are {}",
                attr.tokens_embed_size
            )));
        }

        // Seed the decode masks so a scan on a fresh engine reports zero
        // cached rows.
        let empty_mask = mask::decode_mask(dims.kv_cache_num, 0);
        for runner in partitions.iter_mut() {
            runner
                .input(DECODE_GROUP, "mask")?
                .copy_from_slice(&empty_mask);
        }

        info!(
            model_type = %attr.model_type,
            partitions = attr.axmodel_num,
            max_token_len = dims.max_token_len,
            kv_cache_num = dims.kv_cache_num,
            prefill_token_num = dims.prefill_token_num,
            prefill_groups = dims.prefill_grp_caps.len(),
            "model loaded"
        );

        Ok(Self {
            attr,
            dims,
            partitions,
            post,
            embed,
            processor: LogitsProcessor::new(seed, post_cfg),
            precompute_len: 0,
            prefill_grpid: 1,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn attr(&self) -> &LlmAttr {
        &self.attr
    }

    pub fn dims(&self) -> &ModelDims {
        &self.dims
    }

    pub fn precompute_len(&self) -> usize {
        self.precompute_len
    }

    pub fn embed_table(&self) -> &EmbedTable {
        &self.embed
    }

    pub fn processor(&self) -> &LogitsProcessor {
        &self.processor
    }

    pub fn processor_mut(&mut self) -> &mut LogitsProcessor {
        &mut self.processor
    }

    /// Handle for requesting a cooperative stop from another thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Prefill a prompt from position zero and export the resulting cache,
    /// without disturbing the decode-group bookkeeping. Used to build the
    /// baseline snapshot a conversation restarts from.
    pub fn prefill_prompt(&mut self, token_ids: &[u32]) -> Result<KvSnapshot> {
        if token_ids.is_empty() {
            return Ok(KvSnapshot::empty(self.partitions.len()));
        }
        let grpid = self.dims.select_prefill_group(token_ids.len()).ok_or_else(|| {
            LlmError::capacity(format!(
                "prompt of {} tokens exceeds the largest prefill window of {}",
                token_ids.len(),
                self.dims.prefill_max_token_num
            ))
        })?;
        self.stop.store(false, Ordering::SeqCst);
        for runner in self.partitions.iter_mut() {
            kvcache::clear_cache(runner.as_mut(), grpid)?;
        }
        let embeds = self.embed.lookup_all(token_ids);
        let (_, stopped) = self.run_prefill(&embeds, token_ids.len(), grpid, 0)?;
        if stopped {
            return Err(LlmError::interrupted("prompt prefill cut short, baseline incomplete"));
        }
        kvcache::export(&self.partitions, grpid, token_ids.len(), self.dims.kv_cache_size)
    }

    /// Restore a snapshot ahead of a turn that will prefill `new_tokens`
    /// more positions. Group selection and the per-turn budget are checked
    /// before any tensor is touched, so a rejected turn leaves the device
    /// untouched.
    pub fn import_snapshot(&mut self, snap: &KvSnapshot, new_tokens: usize) -> Result<()> {
        let total = snap.precompute_len + new_tokens;
        let grpid = self.dims.select_prefill_group(total).ok_or_else(|| {
            LlmError::capacity(format!(
                "{} cached + {new_tokens} new tokens exceed the largest prefill window of {}",
                snap.precompute_len, self.dims.prefill_max_token_num
            ))
        })?;
        let budget = self.dims.turn_budget(snap.precompute_len);
        if new_tokens > budget {
            return Err(LlmError::capacity(format!(
                "turn of {new_tokens} tokens exceeds the remaining budget of {budget}"
            )));
        }
        self.prefill_grpid = grpid;
        self.precompute_len = snap.precompute_len;

        if snap.precompute_len > 0 {
            kvcache::import(&mut self.partitions, snap, grpid, self.dims.kv_cache_size)?;
        }
        let decode_mask = mask::decode_mask(self.dims.kv_cache_num, snap.precompute_len);
        for runner in self.partitions.iter_mut() {
            runner
                .input(DECODE_GROUP, "mask")?
                .copy_from_slice(&decode_mask);
        }
        Ok(())
    }

    /// Copy the decode-group cache out, up to the valid length recovered
    /// from the decode mask.
    pub fn export_snapshot(&self) -> Result<KvSnapshot> {
        let mask = self.partitions[0].input_ref(DECODE_GROUP, "mask")?;
        let valid_len = mask::scan_valid_len(mask);
        kvcache::export(&self.partitions, DECODE_GROUP, valid_len, self.dims.kv_cache_size)
    }

    /// One full generation: prefill the new embedding rows on top of the
    /// imported history, then decode until end-of-sequence, the position
    /// ceiling or a stop request. `callback` receives decoded fragments as
    /// they form; without one, a console progress bar tracks decode.
    pub fn run(
        &mut self,
        new_embed: &[u16],
        tokenizer: &mut dyn Tokenizer,
        callback: Option<&mut dyn FnMut(StreamChunk<'_>)>,
    ) -> Result<RunOutput> {
        let emb = self.embed.embed_size();
        if new_embed.is_empty() || new_embed.len() % emb != 0 {
            return Err(LlmError::args(format!(
                "embedding buffer of {} words is not a whole number of {emb}-word rows",
                new_embed.len()
            )));
        }
        let token_count = new_embed.len() / emb;
        let total = self.precompute_len + token_count;
        let grpid = self.prefill_grpid;
        let cap = self.dims.group_capacity(grpid);
        if total > cap {
            return Err(LlmError::capacity(format!(
                "{} cached + {token_count} new tokens exceed the prefill window of {cap}",
                self.precompute_len
            )));
        }

        self.stop.store(false, Ordering::SeqCst);
        let start = Instant::now();
        let (last_chunk, stopped) =
            self.run_prefill(new_embed, token_count, grpid, self.precompute_len)?;
        if stopped {
            return Ok(RunOutput {
                text: String::new(),
                token_ids: Vec::new(),
                finish: FinishReason::Stopped,
                ttft_ms: 0.0,
                tokens_per_sec: 0.0,
            });
        }
        let live = (token_count - 1) % self.dims.prefill_token_num + 1;
        let first = self.run_post(&last_chunk[(live - 1) * emb..live * emb], &[])?;
        let ttft_ms = start.elapsed().as_secs_f32() * 1000.0;
        info!(ttft_ms, "first token ready");

        self.decode_phase(total, first, ttft_ms, tokenizer, callback)
    }

    /// Chunked prefill of `token_count` embedding rows starting at cache
    /// position `base`. Returns the last chunk's output rows and whether a
    /// stop request cut the work short.
    pub(crate) fn run_prefill(
        &mut self,
        embeds: &[u16],
        token_count: usize,
        grpid: usize,
        base: usize,
    ) -> Result<(Vec<u16>, bool)> {
        let ptn = self.dims.prefill_token_num;
        let emb = self.embed.embed_size();
        let kvsz = self.dims.kv_cache_size;
        let cap = self.dims.group_capacity(grpid);
        let chunks = token_count.div_ceil(ptn);

        let mut data = vec![0u16; ptn * emb];
        for p in 0..chunks {
            let live = (token_count - p * ptn).min(ptn);
            let start = p * ptn * emb;
            data[..live * emb].copy_from_slice(&embeds[start..start + live * emb]);
            data[live * emb..].fill(0);

            let history = base + p * ptn;
            let chunk_mask = mask::prefill_chunk_mask(ptn, cap, live, history);
            let indices: Vec<u16> = (0..ptn).map(|i| (history + i) as u16).collect();
            for runner in self.partitions.iter_mut() {
                if self.stop.load(Ordering::SeqCst) {
                    return Ok((data, true));
                }
                runner.input(grpid, "input")?.copy_from_slice(&data);
                runner.input(grpid, "mask")?.copy_from_slice(&chunk_mask);
                runner.input(grpid, "indices")?.copy_from_slice(&indices);
                runner.run(grpid)?;
                kvcache::stash_chunk(runner.as_mut(), grpid, history * kvsz, live * kvsz)?;
                data.copy_from_slice(runner.output(grpid, "output")?);
            }
            debug!(chunk = p, live, history, "prefill chunk done");
        }
        Ok((data, false))
    }

    /// One-token-per-pass decode starting with `first` already produced and
    /// the cache valid up to `total`. Shared between the text and vision
    /// runs.
    pub(crate) fn decode_phase(
        &mut self,
        total: usize,
        first: u32,
        ttft_ms: f32,
        tokenizer: &mut dyn Tokenizer,
        mut callback: Option<&mut dyn FnMut(StreamChunk<'_>)>,
    ) -> Result<RunOutput> {
        let emb = self.embed.embed_size();
        let kvsz = self.dims.kv_cache_size;
        let max = self.dims.max_token_len;
        let eos = tokenizer.eos_id();

        let mut mask_host = mask::decode_mask(self.dims.kv_cache_num, total);
        let mut ids: Vec<u32> = Vec::new();
        let mut finish = FinishReason::Length;
        let decode_start = Instant::now();
        let mut flushed = 0usize;

        if first == eos {
            finish = FinishReason::Eos;
        } else {
            ids.push(first);
            let progress = callback.is_none().then(|| Progress::new(max, "decode"));
            let mut data = vec![0u16; emb];
            'steps: for pos in total..max {
                self.embed.lookup(ids[ids.len() - 1], &mut data);
                for runner in self.partitions.iter_mut() {
                    if self.stop.load(Ordering::SeqCst) {
                        finish = FinishReason::Stopped;
                        break 'steps;
                    }
                    runner.input(DECODE_GROUP, "input")?.copy_from_slice(&data);
                    runner.input(DECODE_GROUP, "mask")?.copy_from_slice(&mask_host);
                    runner.input(DECODE_GROUP, "indices")?[0] = pos as u16;
                    runner.run(DECODE_GROUP)?;
                    kvcache::stash_decode_step(runner.as_mut(), pos, kvsz)?;
                    data.copy_from_slice(runner.output(DECODE_GROUP, "output")?);
                }
                mask::allow_position(&mut mask_host, pos);

                let token = self.run_post(&data, &ids)?;
                if token == eos {
                    finish = FinishReason::Eos;
                    break;
                }
                ids.push(token);

                if let Some(cb) = callback.as_mut() {
                    if ids.len() - flushed >= STREAM_FLUSH_TOKENS {
                        let rate =
                            ids.len() as f32 / decode_start.elapsed().as_secs_f32().max(1e-6);
                        let text = tokenizer.decode(&ids[flushed..])?;
                        cb(StreamChunk {
                            token_ids: &ids[flushed..],
                            text: &text,
                            tokens_per_sec: rate,
                        });
                        flushed = ids.len();
                    }
                } else if let Some(p) = &progress {
                    p.update(pos, "");
                }
            }
            if let Some(p) = &progress {
                p.finish();
            }
        }

        // Flush whatever the threshold held back.
        if let Some(cb) = callback.as_mut() {
            if flushed < ids.len() {
                let rate = ids.len() as f32 / decode_start.elapsed().as_secs_f32().max(1e-6);
                let text = tokenizer.decode(&ids[flushed..])?;
                cb(StreamChunk {
                    token_ids: &ids[flushed..],
                    text: &text,
                    tokens_per_sec: rate,
                });
            }
        }

        // Sync the final mask into the partitions so a snapshot export
        // scans the true cached length.
        for runner in self.partitions.iter_mut() {
            runner
                .input(DECODE_GROUP, "mask")?
                .copy_from_slice(&mask_host);
        }

        let tokens_per_sec = ids.len() as f32 / decode_start.elapsed().as_secs_f32().max(1e-6);
        info!(tokens = ids.len(), tokens_per_sec, ?finish, "generation finished");
        let text = tokenizer.decode(&ids)?;
        Ok(RunOutput {
            text,
            token_ids: ids,
            finish,
            ttft_ms,
            tokens_per_sec,
        })
    }

    /// Push one hidden row through the logits head and sample.
    pub(crate) fn run_post(&mut self, hidden: &[u16], history: &[u32]) -> Result<u32> {
        self.post.input(0, "input")?.copy_from_slice(hidden);
        self.post.run(0)?;
        let mut logits = bf16_slice_to_f32(self.post.output(0, "output")?);
        self.processor.apply(&mut logits, history)
    }
}

/// Read the tensor geometry off the first partition: the decode mask gives
/// the position ceiling, the decode-group cache gives the KV capacity, and
/// each prefill group's cache gives its capacity tier.
fn discover_dims(runner: &dyn NpuRunner) -> Result<ModelDims> {
    let mask_len: usize = runner.input_shape(DECODE_GROUP, "mask")?.iter().product();
    let max_token_len = mask_len - 1;
    // Positions travel through the 16-bit `indices` tensor.
    if max_token_len > u16::MAX as usize + 1 {
        return Err(LlmError::load(format!(
            "position ceiling {max_token_len} does not fit 16-bit position indices"
        )));
    }
    let kv_cache_size = runner.output(DECODE_GROUP, "K_cache_out")?.len();
    let kv_cache_num = runner.input_ref(DECODE_GROUP, "K_cache")?.len() / kv_cache_size;

    let groups = runner.group_count();
    if groups < 2 {
        return Err(LlmError::load("model was compiled without prefill groups"));
    }
    let prefill_token_num: usize = runner.input_shape(1, "indices")?.iter().product();
    let mut prefill_grp_caps = Vec::with_capacity(groups - 1);
    for g in 1..groups {
        prefill_grp_caps.push(runner.input_ref(g, "K_cache")?.len() / kv_cache_size);
    }
    if prefill_grp_caps.windows(2).any(|w| w[0] >= w[1]) {
        return Err(LlmError::load(format!(
            "prefill group capacities {prefill_grp_caps:?} are not strictly ascending"
        )));
    }
    let prefill_max_token_num = *prefill_grp_caps.last().unwrap();

    Ok(ModelDims {
        max_token_len,
        kv_cache_num,
        kv_cache_size,
        prefill_token_num,
        prefill_max_token_num,
        prefill_grp_caps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{write_embed_table, SimBackend, SimSpec};
    use crate::tokenizer::SimTokenizer;
    use std::path::{Path, PathBuf};

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

    pub(crate) fn test_attr(dir: &Path, spec: &SimSpec) -> LlmAttr {
        let embed_path = dir.join("embeds.bin");
        write_embed_table(&embed_path, spec.vocab, spec.embed_size).unwrap();
        LlmAttr {
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
        }
    }

    fn engine(dir: &Path, backend: &SimBackend) -> LlmEngine {
        let attr = test_attr(dir, backend.spec());
        LlmEngine::load(attr, greedy_cfg(), backend, 42).unwrap()
    }

    #[test]
    fn test_dims_discovered_from_tensor_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimBackend::new(SimSpec::small());
        let eng = engine(dir.path(), &backend);
        assert_eq!(
            eng.dims(),
            &ModelDims {
                max_token_len: 64,
                kv_cache_num: 64,
                kv_cache_size: 4,
                prefill_token_num: 8,
                prefill_max_token_num: 32,
                prefill_grp_caps: vec![8, 16, 32],
            }
        );
    }

    #[test]
    fn test_load_rejects_nonascending_groups() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = SimSpec::small();
        spec.prefill_grp_caps = vec![16, 16, 32];
        let backend = SimBackend::new(spec);
        let attr = test_attr(dir.path(), backend.spec());
        let err = LlmEngine::load(attr, greedy_cfg(), &backend, 0).unwrap_err();
        assert!(matches!(err, LlmError::Load { .. }));
    }

    #[test]
    fn test_load_rejects_missing_embed_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimBackend::new(SimSpec::small());
        let mut attr = test_attr(dir.path(), backend.spec());
        attr.filename_tokens_embed = PathBuf::from("/nonexistent/embeds.bin");
        let err = LlmEngine::load(attr, greedy_cfg(), &backend, 0).unwrap_err();
        assert!(matches!(err, LlmError::Load { .. }));
    }

    #[test]
    fn test_prefill_prompt_exports_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimBackend::new(SimSpec::small());
        let mut eng = engine(dir.path(), &backend);
        let snap = eng.prefill_prompt(&[1, 2, 3]).unwrap();
        assert_eq!(snap.precompute_len, 3);
        assert_eq!(snap.k.len(), 2);
        assert_eq!(snap.k[0].len(), 3 * 4);
        // Baseline construction leaves the decode bookkeeping untouched.
        assert_eq!(eng.export_snapshot().unwrap().precompute_len, 0);
    }

    #[test]
    fn test_oversize_prompt_rejected_before_device_work() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimBackend::new(SimSpec::small());
        let mut eng = engine(dir.path(), &backend);
        let ids: Vec<u32> = (0..33).map(|i| i % 30).collect();
        let err = eng.prefill_prompt(&ids).unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(backend.run_count(), 0, "rejection must precede device work");
    }

    #[test]
    fn test_import_enforces_turn_budget() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimBackend::new(SimSpec::small());
        let mut eng = engine(dir.path(), &backend);
        let snap = eng.prefill_prompt(&[1, 2, 3]).unwrap();
        // budget(3) = align_down(32 - 3, 8) = 24.
        assert!(eng.import_snapshot(&snap, 24).is_ok());
        let err = eng.import_snapshot(&snap, 25).unwrap_err();
        assert!(err.is_capacity());
    }

    #[test]
    fn test_greedy_walk_reaches_eos() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimBackend::new(SimSpec::small());
        let mut eng = engine(dir.path(), &backend);
        let mut tok = SimTokenizer::new(32);

        eng.import_snapshot(&KvSnapshot::empty(2), 5).unwrap();
        let embeds = eng.embed_table().lookup_all(&[1, 2, 3, 4, 5]);
        let mut chunks: Vec<(Vec<u32>, String)> = Vec::new();
        let mut cb = |c: StreamChunk<'_>| chunks.push((c.token_ids.to_vec(), c.text.to_string()));
        let out = eng.run(&embeds, &mut tok, Some(&mut cb)).unwrap();

        // Successor logits walk 6, 7, ... and stop at eos = 31, unappended.
        let want: Vec<u32> = (6..=30).collect();
        assert_eq!(out.token_ids, want);
        assert_eq!(out.finish, FinishReason::Eos);
        assert!(out.ttft_ms >= 0.0);
        assert!(out.tokens_per_sec > 0.0);

        // Streamed fragments reassemble the final reply exactly.
        let streamed_ids: Vec<u32> = chunks.iter().flat_map(|(ids, _)| ids.clone()).collect();
        let streamed_text: String = chunks.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(streamed_ids, out.token_ids);
        assert_eq!(streamed_text, out.text);
    }

    #[test]
    fn test_mask_scan_counts_prefill_plus_decode_rows() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimBackend::new(SimSpec::small());
        let mut eng = engine(dir.path(), &backend);
        let mut tok = SimTokenizer::new(32);

        eng.import_snapshot(&KvSnapshot::empty(2), 5).unwrap();
        let embeds = eng.embed_table().lookup_all(&[1, 2, 3, 4, 5]);
        let mut sink = |_: StreamChunk<'_>| {};
        let out = eng.run(&embeds, &mut tok, Some(&mut sink)).unwrap();

        let snap = eng.export_snapshot().unwrap();
        assert_eq!(snap.precompute_len, 5 + out.token_ids.len());
    }

    #[test]
    fn test_snapshot_round_trip_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimBackend::new(SimSpec::small());
        let mut eng = engine(dir.path(), &backend);
        let mut tok = SimTokenizer::new(32);

        eng.import_snapshot(&KvSnapshot::empty(2), 5).unwrap();
        let embeds = eng.embed_table().lookup_all(&[1, 2, 3, 4, 5]);
        let mut sink = |_: StreamChunk<'_>| {};
        eng.run(&embeds, &mut tok, Some(&mut sink)).unwrap();
        let snap = eng.export_snapshot().unwrap();

        let backend2 = SimBackend::new(SimSpec::small());
        let mut fresh = engine(dir.path(), &backend2);
        fresh.import_snapshot(&snap, 0).unwrap();
        let again = fresh.export_snapshot().unwrap();
        assert_eq!(snap, again);
    }

    #[test]
    fn test_run_rejects_ragged_embed_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimBackend::new(SimSpec::small());
        let mut eng = engine(dir.path(), &backend);
        let mut tok = SimTokenizer::new(32);
        let err = eng.run(&[0u16; 7], &mut tok, None).unwrap_err();
        assert!(matches!(err, LlmError::InvalidArgs { .. }));
    }

    /// Wraps the first runner a backend hands out and raises the stop flag
    /// from inside its `trigger`-th `run` call, so cancellation latency is
    /// observable at partition granularity.
    struct StopTap {
        inner: Box<dyn NpuRunner>,
        stop: Arc<parking_lot::Mutex<Option<Arc<AtomicBool>>>>,
        runs_done: usize,
        trigger: usize,
    }

    impl NpuRunner for StopTap {
        fn group_count(&self) -> usize {
            self.inner.group_count()
        }

        fn input(&mut self, group: usize, name: &str) -> Result<&mut [u16]> {
            self.inner.input(group, name)
        }

        fn input_ref(&self, group: usize, name: &str) -> Result<&[u16]> {
            self.inner.input_ref(group, name)
        }

        fn output(&self, group: usize, name: &str) -> Result<&[u16]> {
            self.inner.output(group, name)
        }

        fn input_shape(&self, group: usize, name: &str) -> Result<&[usize]> {
            self.inner.input_shape(group, name)
        }

        fn run(&mut self, group: usize) -> Result<()> {
            self.inner.run(group)?;
            self.runs_done += 1;
            if self.runs_done == self.trigger {
                if let Some(stop) = self.stop.lock().as_ref() {
                    stop.store(true, Ordering::SeqCst);
                }
            }
            Ok(())
        }
    }

    struct StopTapBackend {
        inner: SimBackend,
        stop: Arc<parking_lot::Mutex<Option<Arc<AtomicBool>>>>,
        trigger: usize,
        tapped: AtomicBool,
    }

    impl StopTapBackend {
        fn new(trigger: usize) -> Self {
            Self {
                inner: SimBackend::new(SimSpec::small()),
                stop: Arc::new(parking_lot::Mutex::new(None)),
                trigger,
                tapped: AtomicBool::new(false),
            }
        }
    }

    impl crate::device::NpuBackend for StopTapBackend {
        fn load_runner(&self, path: &Path) -> Result<Box<dyn NpuRunner>> {
            let inner = self.inner.load_runner(path)?;
            if !self.tapped.swap(true, Ordering::SeqCst) {
                return Ok(Box::new(StopTap {
                    inner,
                    stop: self.stop.clone(),
                    runs_done: 0,
                    trigger: self.trigger,
                }));
            }
            Ok(inner)
        }
    }

    #[test]
    fn test_stop_between_partitions_halts_the_step() {
        let dir = tempfile::tempdir().unwrap();
        // Partition 0 runs once for the prefill chunk; its second run is the
        // first decode pass, which raises the flag mid-step.
        let backend = StopTapBackend::new(2);
        let attr = test_attr(dir.path(), backend.inner.spec());
        let mut eng = LlmEngine::load(attr, greedy_cfg(), &backend, 42).unwrap();
        *backend.stop.lock() = Some(eng.stop_handle());
        let mut tok = SimTokenizer::new(32);

        eng.import_snapshot(&KvSnapshot::empty(2), 1).unwrap();
        let embeds = eng.embed_table().lookup_all(&[5]);
        let mut sink = |_: StreamChunk<'_>| {};
        let out = eng.run(&embeds, &mut tok, Some(&mut sink)).unwrap();

        assert_eq!(out.finish, FinishReason::Stopped);
        assert_eq!(out.token_ids, vec![6]);
        // Partition 0 twice (prefill + the aborted decode step), partition 1
        // once (prefill), the post model once (first token). The remaining
        // partition of the decode step never ran.
        assert_eq!(backend.inner.run_count(), 4);
    }

    #[test]
    fn test_stop_during_baseline_prefill_is_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        // Raise the flag from partition 0's very first chunk.
        let backend = StopTapBackend::new(1);
        let attr = test_attr(dir.path(), backend.inner.spec());
        let mut eng = LlmEngine::load(attr, greedy_cfg(), &backend, 42).unwrap();
        *backend.stop.lock() = Some(eng.stop_handle());

        let err = eng.prefill_prompt(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, LlmError::Interrupted { .. }));
    }

    #[test]
    fn test_load_rejects_positions_beyond_u16() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = SimSpec::small();
        // Decode mask of kv + 1 words puts the position ceiling at 70000.
        spec.kv_cache_num = 70_000;
        let backend = SimBackend::new(spec);
        let attr = test_attr(dir.path(), backend.spec());
        let err = LlmEngine::load(attr, greedy_cfg(), &backend, 0).unwrap_err();
        assert!(matches!(err, LlmError::Load { .. }));
        assert!(err.to_string().contains("16-bit"));
    }

    #[test]
    fn test_stop_raised_mid_decode() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimBackend::new(SimSpec::small());
        let mut eng = engine(dir.path(), &backend);
        let mut tok = SimTokenizer::new(32);

        eng.import_snapshot(&KvSnapshot::empty(2), 1).unwrap();
        let embeds = eng.embed_table().lookup_all(&[5]);
        let stop = eng.stop_handle();
        // run() clears the flag on entry, so raise it from the first flush.
        let mut cb = move |_: StreamChunk<'_>| {
            stop.store(true, std::sync::atomic::Ordering::SeqCst);
        };
        let out = eng.run(&embeds, &mut tok, Some(&mut cb)).unwrap();
        assert_eq!(out.finish, FinishReason::Stopped);
        assert!(out.token_ids.len() < 8, "stop should cut the walk short");
    }
}
