//! Deterministic software execution device.
//!
//! Stands in for the NPU in tests, demos and the CLI: the same group and
//! tensor layout as the compiled models, with scripted arithmetic instead of
//! attention. Partition modules pass their input embedding through unchanged
//! and emit K/V rows mixed from (partition id, position, leading input
//! word), so cache contents are position-dependent and snapshot round-trips
//! are observable. The post module reads the leading input word as the
//! current token id and puts all logit mass on its successor modulo the
//! vocabulary, which makes greedy decode walk `t+1, t+2, ...` until it hits
//! the end-of-sequence id.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::device::{NpuBackend, NpuRunner, VisionEncoder};
use crate::error::{LlmError, Result};
use crate::utils::f32_to_bf16;

/// Tensor geometry the simulated models are "compiled" with.
#[derive(Debug, Clone)]
pub struct SimSpec {
    pub axmodel_num: usize,
    pub vocab: usize,
    pub embed_size: usize,
    pub kv_cache_num: usize,
    pub kv_cache_size: usize,
    pub prefill_token_num: usize,
    /// Prefill group capacities, ascending; group id is `index + 1`.
    pub prefill_grp_caps: Vec<usize>,
    /// Vision models compile the prefill mask as `[ptn, ptn]` instead of
    /// `[ptn, cap + ptn]`.
    pub vlm_prefill_mask: bool,
    pub vpm_len: usize,
    pub vpm_width: usize,
    pub vpm_height: usize,
}

impl SimSpec {
    /// A small geometry that keeps tests fast: 2 partitions, 32-token
    /// vocabulary, 3 prefill tiers.
    pub fn small() -> Self {
        Self {
            axmodel_num: 2,
            vocab: 32,
            embed_size: 8,
            kv_cache_num: 64,
            kv_cache_size: 4,
            prefill_token_num: 8,
            prefill_grp_caps: vec![8, 16, 32],
            vlm_prefill_mask: false,
            vpm_len: 4,
            vpm_width: 16,
            vpm_height: 16,
        }
    }
}

/// Write a token-embedding table matching the simulator convention: row `t`
/// starts with the raw word `t`, so identity partitions carry the token id
/// through to the post module.
pub fn write_embed_table(path: &Path, vocab: usize, embed_size: usize) -> Result<()> {
    let mut file = std::fs::File::create(path)?;
    let mut row = Vec::with_capacity(embed_size * 2);
    for t in 0..vocab {
        row.clear();
        for j in 0..embed_size {
            let word = if j == 0 {
                t as u16
            } else {
                (t as u16).wrapping_mul(31).wrapping_add(j as u16)
            };
            row.extend_from_slice(&word.to_le_bytes());
        }
        file.write_all(&row)?;
    }
    Ok(())
}

fn kv_word(partition: usize, pos: u16, seed: u16, j: usize, value: bool) -> u16 {
    let mut h = 0x9e37u16 ^ (partition as u16).wrapping_mul(131);
    h = h.wrapping_add(pos.wrapping_mul(7));
    h = h.wrapping_add(seed.wrapping_mul(13));
    h = h.wrapping_add(j as u16);
    if value {
        h = h.rotate_left(3) ^ 0x5555;
    }
    h
}

struct Tensor {
    shape: Vec<usize>,
    data: Vec<u16>,
}

impl Tensor {
    fn new(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0u16; len],
        }
    }
}

struct Bank {
    inputs: HashMap<(usize, String), Tensor>,
    outputs: HashMap<(usize, String), Tensor>,
}

impl Bank {
    fn new() -> Self {
        Self {
            inputs: HashMap::new(),
            outputs: HashMap::new(),
        }
    }

    fn add_input(&mut self, group: usize, name: &str, shape: Vec<usize>) {
        self.inputs
            .insert((group, name.to_string()), Tensor::new(shape));
    }

    fn add_output(&mut self, group: usize, name: &str, shape: Vec<usize>) {
        self.outputs
            .insert((group, name.to_string()), Tensor::new(shape));
    }

    fn input(&mut self, group: usize, name: &str) -> Result<&mut Tensor> {
        self.inputs
            .get_mut(&(group, name.to_string()))
            .ok_or_else(|| LlmError::device(format!("no input tensor {name:?} in group {group}")))
    }

    fn input_ref(&self, group: usize, name: &str) -> Result<&Tensor> {
        self.inputs
            .get(&(group, name.to_string()))
            .ok_or_else(|| LlmError::device(format!("no input tensor {name:?} in group {group}")))
    }

    fn output_ref(&self, group: usize, name: &str) -> Result<&Tensor> {
        self.outputs
            .get(&(group, name.to_string()))
            .ok_or_else(|| LlmError::device(format!("no output tensor {name:?} in group {group}")))
    }
}

/// Scripted transformer partition.
pub struct SimPartition {
    id: usize,
    spec: SimSpec,
    bank: Bank,
    runs: Arc<AtomicUsize>,
}

impl SimPartition {
    fn new(id: usize, spec: SimSpec, runs: Arc<AtomicUsize>) -> Self {
        let mut bank = Bank::new();
        let kv = spec.kv_cache_num;
        let kvsz = spec.kv_cache_size;
        let ptn = spec.prefill_token_num;
        let emb = spec.embed_size;

        bank.add_input(0, "input", vec![1, emb]);
        bank.add_input(0, "mask", vec![1, kv + 1]);
        bank.add_input(0, "indices", vec![1, 1]);
        bank.add_input(0, "K_cache", vec![1, kv, kvsz]);
        bank.add_input(0, "V_cache", vec![1, kv, kvsz]);
        bank.add_output(0, "output", vec![1, emb]);
        bank.add_output(0, "K_cache_out", vec![1, kvsz]);
        bank.add_output(0, "V_cache_out", vec![1, kvsz]);

        for (i, &cap) in spec.prefill_grp_caps.iter().enumerate() {
            let g = i + 1;
            let mask_cols = if spec.vlm_prefill_mask { ptn } else { cap + ptn };
            bank.add_input(g, "input", vec![1, ptn, emb]);
            bank.add_input(g, "mask", vec![1, ptn, mask_cols]);
            bank.add_input(g, "indices", vec![1, ptn]);
            bank.add_input(g, "K_cache", vec![1, cap, kvsz]);
            bank.add_input(g, "V_cache", vec![1, cap, kvsz]);
            bank.add_output(g, "output", vec![1, ptn, emb]);
            bank.add_output(g, "K_cache_out", vec![1, ptn, kvsz]);
            bank.add_output(g, "V_cache_out", vec![1, ptn, kvsz]);
        }

        Self {
            id,
            spec,
            bank,
            runs,
        }
    }
}

impl NpuRunner for SimPartition {
    fn group_count(&self) -> usize {
        self.spec.prefill_grp_caps.len() + 1
    }

    fn input(&mut self, group: usize, name: &str) -> Result<&mut [u16]> {
        Ok(&mut self.bank.input(group, name)?.data)
    }

    fn input_ref(&self, group: usize, name: &str) -> Result<&[u16]> {
        Ok(&self.bank.input_ref(group, name)?.data)
    }

    fn output(&self, group: usize, name: &str) -> Result<&[u16]> {
        Ok(&self.bank.output_ref(group, name)?.data)
    }

    fn input_shape(&self, group: usize, name: &str) -> Result<&[usize]> {
        Ok(&self.bank.input_ref(group, name)?.shape)
    }

    fn run(&mut self, group: usize) -> Result<()> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let kvsz = self.spec.kv_cache_size;
        let emb = self.spec.embed_size;
        let input = self.bank.input_ref(group, "input")?.data.clone();
        let indices = self.bank.input_ref(group, "indices")?.data.clone();

        let rows = if group == 0 {
            1
        } else {
            self.spec.prefill_token_num
        };
        let mut k_out = vec![0u16; rows * kvsz];
        let mut v_out = vec![0u16; rows * kvsz];
        for i in 0..rows {
            let pos = indices[i];
            let seed = input[i * emb];
            for j in 0..kvsz {
                k_out[i * kvsz + j] = kv_word(self.id, pos, seed, j, false);
                v_out[i * kvsz + j] = kv_word(self.id, pos, seed, j, true);
            }
        }

        self.bank.outputs.get_mut(&(group, "output".to_string())).unwrap().data = input;
        self.bank
            .outputs
            .get_mut(&(group, "K_cache_out".to_string()))
            .unwrap()
            .data = k_out;
        self.bank
            .outputs
            .get_mut(&(group, "V_cache_out".to_string()))
            .unwrap()
            .data = v_out;
        Ok(())
    }
}

/// Scripted logits head: successor-token logits.
pub struct SimPost {
    spec: SimSpec,
    bank: Bank,
    runs: Arc<AtomicUsize>,
}

impl SimPost {
    fn new(spec: SimSpec, runs: Arc<AtomicUsize>) -> Self {
        let mut bank = Bank::new();
        bank.add_input(0, "input", vec![1, spec.embed_size]);
        bank.add_output(0, "output", vec![1, spec.vocab]);
        Self { spec, bank, runs }
    }
}

impl NpuRunner for SimPost {
    fn group_count(&self) -> usize {
        1
    }

    fn input(&mut self, group: usize, name: &str) -> Result<&mut [u16]> {
        Ok(&mut self.bank.input(group, name)?.data)
    }

    fn input_ref(&self, group: usize, name: &str) -> Result<&[u16]> {
        Ok(&self.bank.input_ref(group, name)?.data)
    }

    fn output(&self, group: usize, name: &str) -> Result<&[u16]> {
        Ok(&self.bank.output_ref(group, name)?.data)
    }

    fn input_shape(&self, group: usize, name: &str) -> Result<&[usize]> {
        Ok(&self.bank.input_ref(group, name)?.shape)
    }

    fn run(&mut self, group: usize) -> Result<()> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let cur = self.bank.input_ref(group, "input")?.data[0] as usize % self.spec.vocab;
        let next = (cur + 1) % self.spec.vocab;
        let mut logits = vec![f32_to_bf16(0.0); self.spec.vocab];
        logits[next] = f32_to_bf16(16.0);
        self.bank
            .outputs
            .get_mut(&(group, "output".to_string()))
            .unwrap()
            .data = logits;
        Ok(())
    }
}

/// Scripted vision encoder: a fixed-length embedding block mixed from the
/// image bytes.
pub struct SimVision {
    spec: SimSpec,
}

impl VisionEncoder for SimVision {
    fn input_width(&self) -> usize {
        self.spec.vpm_width
    }

    fn input_height(&self) -> usize {
        self.spec.vpm_height
    }

    fn embed_len(&self) -> usize {
        self.spec.vpm_len * self.spec.embed_size
    }

    fn encode(&mut self, rgb: &[u8]) -> Result<Vec<u16>> {
        let expect = self.spec.vpm_width * self.spec.vpm_height * 3;
        if rgb.len() != expect {
            return Err(LlmError::args(format!(
                "image buffer is {} bytes, encoder wants {expect}",
                rgb.len()
            )));
        }
        let seed: u32 = rgb.iter().map(|&b| b as u32).sum();
        let words = self.embed_len();
        Ok((0..words)
            .map(|i| f32_to_bf16((seed.wrapping_add(i as u32) % 251) as f32 / 251.0))
            .collect())
    }
}

/// Factory producing scripted partitions, the scripted post module and the
/// scripted vision encoder. Counts every device run so tests can assert
/// "no device work was issued".
pub struct SimBackend {
    spec: SimSpec,
    runs: Arc<AtomicUsize>,
}

impl SimBackend {
    pub fn new(spec: SimSpec) -> Self {
        Self {
            spec,
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn spec(&self) -> &SimSpec {
        &self.spec
    }

    /// Total `run` calls across every module created by this backend.
    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::Relaxed)
    }
}

impl NpuBackend for SimBackend {
    /// Paths whose file stem contains `post` become the logits head; any
    /// other path becomes a partition, its id taken from the trailing digits
    /// of the stem (`..._l7` -> 7).
    fn load_runner(&self, path: &Path) -> Result<Box<dyn NpuRunner>> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        if stem.contains("post") {
            return Ok(Box::new(SimPost::new(self.spec.clone(), self.runs.clone())));
        }
        let digits: String = stem
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        let id: usize = digits.chars().rev().collect::<String>().parse().unwrap_or(0);
        Ok(Box::new(SimPartition::new(
            id,
            self.spec.clone(),
            self.runs.clone(),
        )))
    }

    fn load_vision(&self, _path: &Path) -> Result<Box<dyn VisionEncoder>> {
        Ok(Box::new(SimVision {
            spec: self.spec.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_distinguishes_post_from_partitions() {
        let backend = SimBackend::new(SimSpec::small());
        let post = backend.load_runner(Path::new("/m/qwen_post.axmodel")).unwrap();
        assert_eq!(post.group_count(), 1);
        let part = backend.load_runner(Path::new("/m/qwen_p8_l7.axmodel")).unwrap();
        assert_eq!(part.group_count(), 4);
    }

    #[test]
    fn test_partition_kv_rows_depend_on_position_and_input() {
        let backend = SimBackend::new(SimSpec::small());
        let mut part = backend.load_runner(Path::new("/m/l0.axmodel")).unwrap();
        part.input(0, "input").unwrap()[0] = 5;
        part.input(0, "indices").unwrap()[0] = 3;
        part.run(0).unwrap();
        let k_a = part.output(0, "K_cache_out").unwrap().to_vec();

        part.input(0, "indices").unwrap()[0] = 4;
        part.run(0).unwrap();
        let k_b = part.output(0, "K_cache_out").unwrap().to_vec();
        assert_ne!(k_a, k_b, "K rows must vary with position");

        part.input(0, "indices").unwrap()[0] = 3;
        part.run(0).unwrap();
        assert_eq!(part.output(0, "K_cache_out").unwrap(), &k_a[..], "same inputs, same row");
        assert_eq!(backend.run_count(), 3);
    }

    #[test]
    fn test_partition_output_passes_input_through() {
        let backend = SimBackend::new(SimSpec::small());
        let mut part = backend.load_runner(Path::new("/m/l1.axmodel")).unwrap();
        let emb: Vec<u16> = (0..8).collect();
        part.input(0, "input").unwrap().copy_from_slice(&emb);
        part.run(0).unwrap();
        assert_eq!(part.output(0, "output").unwrap(), &emb[..]);
    }

    #[test]
    fn test_post_scripts_successor_token() {
        let backend = SimBackend::new(SimSpec::small());
        let mut post = backend.load_runner(Path::new("/m/post.axmodel")).unwrap();
        post.input(0, "input").unwrap()[0] = 9;
        post.run(0).unwrap();
        let logits = crate::utils::bf16_slice_to_f32(post.output(0, "output").unwrap());
        let best = crate::utils::logits_processor::argmax(&logits);
        assert_eq!(best, 10);
    }

    #[test]
    fn test_embed_table_convention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeds.bin");
        write_embed_table(&path, 32, 8).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 32 * 8 * 2);
        // Row 7 leads with the raw word 7.
        let off = 7 * 8 * 2;
        assert_eq!(u16::from_le_bytes([bytes[off], bytes[off + 1]]), 7);
    }

    #[test]
    fn test_vision_rejects_wrong_geometry() {
        let backend = SimBackend::new(SimSpec::small());
        let mut vision = backend.load_vision(Path::new("/m/vpm.axmodel")).unwrap();
        assert!(vision.encode(&[0u8; 3]).is_err());
        let ok = vision.encode(&vec![1u8; 16 * 16 * 3]).unwrap();
        assert_eq!(ok.len(), vision.embed_len());
    }
}
