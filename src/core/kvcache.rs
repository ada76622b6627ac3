//! Segmented KV-cache store.
//!
//! Each partition owns one Key and one Value tensor per execution group,
//! logically `[capacity_positions, kv_cache_size]` in 16-bit words. Prefill
//! output is written to both the active prefill group and the decode group
//! at the same position offset, so the next decode step (or the next chunk)
//! reads a consistent view without re-running earlier positions. Snapshots
//! are plain copies owned by the caller, never aliases of device tensors.

use crate::device::NpuRunner;
use crate::error::{LlmError, Result};

/// Device group id of the single-token decode configuration.
pub const DECODE_GROUP: usize = 0;

/// Exported KV-cache contents: per partition, the first `precompute_len`
/// positions of Key and Value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvSnapshot {
    pub precompute_len: usize,
    pub k: Vec<Vec<u16>>,
    pub v: Vec<Vec<u16>>,
}

impl KvSnapshot {
    /// Snapshot of an empty cache (first run after load).
    pub fn empty(axmodel_num: usize) -> Self {
        Self {
            precompute_len: 0,
            k: vec![Vec::new(); axmodel_num],
            v: vec![Vec::new(); axmodel_num],
        }
    }

    /// Shape check against the engine's geometry: one K and one V buffer
    /// per partition, each exactly `precompute_len * kv_cache_size` words.
    pub fn validate(&self, axmodel_num: usize, kv_cache_size: usize) -> Result<()> {
        if self.k.len() != self.v.len() || self.k.len() != axmodel_num {
            return Err(LlmError::args(format!(
                "snapshot has {} K / {} V partitions, model has {axmodel_num}",
                self.k.len(),
                self.v.len()
            )));
        }
        let want = self.precompute_len * kv_cache_size;
        for (i, (k, v)) in self.k.iter().zip(&self.v).enumerate() {
            if k.len() != want || v.len() != want {
                return Err(LlmError::args(format!(
                    "snapshot partition {i} has {}K/{}V words, want {want}",
                    k.len(),
                    v.len()
                )));
            }
        }
        Ok(())
    }
}

/// Zero a group's K and V tensors on one partition.
pub fn clear_cache(runner: &mut dyn NpuRunner, group: usize) -> Result<()> {
    runner.input(group, "K_cache")?.fill(0);
    runner.input(group, "V_cache")?.fill(0);
    Ok(())
}

/// Copy the leading `len_words` of `src_group`'s fresh K/V output into
/// `dst_group`'s cache at `offset_words`.
pub fn mirror_chunk(
    runner: &mut dyn NpuRunner,
    src_group: usize,
    dst_group: usize,
    offset_words: usize,
    len_words: usize,
) -> Result<()> {
    let k_out = runner.output(src_group, "K_cache_out")?[..len_words].to_vec();
    let v_out = runner.output(src_group, "V_cache_out")?[..len_words].to_vec();
    let k = runner.input(dst_group, "K_cache")?;
    if offset_words + len_words > k.len() {
        return Err(LlmError::device(format!(
            "K stash {offset_words}+{len_words} overruns group {dst_group} cache of {}",
            k.len()
        )));
    }
    k[offset_words..offset_words + len_words].copy_from_slice(&k_out);
    let v = runner.input(dst_group, "V_cache")?;
    v[offset_words..offset_words + len_words].copy_from_slice(&v_out);
    Ok(())
}

/// After a prefill run, copy the chunk's fresh K/V output into both the
/// active prefill group and the decode group at `offset_words`.
pub fn stash_chunk(
    runner: &mut dyn NpuRunner,
    prefill_grp: usize,
    offset_words: usize,
    len_words: usize,
) -> Result<()> {
    mirror_chunk(runner, prefill_grp, DECODE_GROUP, offset_words, len_words)?;
    mirror_chunk(runner, prefill_grp, prefill_grp, offset_words, len_words)
}

/// After a decode run, write the single fresh K/V row into the decode group
/// at absolute `position`.
pub fn stash_decode_step(
    runner: &mut dyn NpuRunner,
    position: usize,
    kv_cache_size: usize,
) -> Result<()> {
    let k_out = runner.output(DECODE_GROUP, "K_cache_out")?.to_vec();
    let v_out = runner.output(DECODE_GROUP, "V_cache_out")?.to_vec();
    let offset = position * kv_cache_size;
    let k = runner.input(DECODE_GROUP, "K_cache")?;
    if offset + kv_cache_size > k.len() {
        return Err(LlmError::device(format!(
            "decode K write at position {position} overruns cache of {}",
            k.len()
        )));
    }
    k[offset..offset + kv_cache_size].copy_from_slice(&k_out[..kv_cache_size]);
    let v = runner.input(DECODE_GROUP, "V_cache")?;
    v[offset..offset + kv_cache_size].copy_from_slice(&v_out[..kv_cache_size]);
    Ok(())
}

/// Copy the first `valid_len` positions of every partition's cache in
/// `group` out into a caller-owned snapshot.
pub fn export(
    partitions: &[Box<dyn NpuRunner>],
    group: usize,
    valid_len: usize,
    kv_cache_size: usize,
) -> Result<KvSnapshot> {
    let words = valid_len * kv_cache_size;
    let mut snap = KvSnapshot::empty(partitions.len());
    snap.precompute_len = valid_len;
    for (i, runner) in partitions.iter().enumerate() {
        snap.k[i] = runner.input_ref(group, "K_cache")?[..words].to_vec();
        snap.v[i] = runner.input_ref(group, "V_cache")?[..words].to_vec();
    }
    Ok(snap)
}

/// Clear the chosen prefill group and the decode group, then copy the
/// snapshot into both. Shape validation happens before any tensor is
/// touched.
pub fn import(
    partitions: &mut [Box<dyn NpuRunner>],
    snap: &KvSnapshot,
    prefill_grp: usize,
    kv_cache_size: usize,
) -> Result<()> {
    snap.validate(partitions.len(), kv_cache_size)?;
    let words = snap.precompute_len * kv_cache_size;
    for (i, runner) in partitions.iter_mut().enumerate() {
        clear_cache(runner.as_mut(), prefill_grp)?;
        clear_cache(runner.as_mut(), DECODE_GROUP)?;
        for group in [prefill_grp, DECODE_GROUP] {
            runner.input(group, "K_cache")?[..words].copy_from_slice(&snap.k[i]);
            runner.input(group, "V_cache")?[..words].copy_from_slice(&snap.v[i]);
        }
    }
    Ok(())
}
