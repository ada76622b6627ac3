//! Attention-mask construction and scanning.
//!
//! The device attention kernels read a row of 16-bit bfloat16 words per
//! query position: 0 means "may attend", a very negative constant means
//! "may not". The decode mask doubles as the engine's position counter:
//! the first sentinel word marks the current valid length, so a snapshot
//! export can recover it without a separate counter.

/// bfloat16 bit pattern of -65536.0, the "attention not allowed" sentinel.
pub const MASK_SENTINEL: u16 = 0xc780;

/// Decode-group mask: `kv_cache_num + 1` words, sentinel everywhere except
/// positions below `valid_len` and the final self slot.
pub fn decode_mask(kv_cache_num: usize, valid_len: usize) -> Vec<u16> {
    let mut mask = vec![MASK_SENTINEL; kv_cache_num + 1];
    mask[kv_cache_num] = 0;
    for slot in mask.iter_mut().take(valid_len.min(kv_cache_num)) {
        *slot = 0;
    }
    mask
}

/// Mark `position` as attendable after a decode step wrote its K/V row.
pub fn allow_position(mask: &mut [u16], position: usize) {
    if position < mask.len() {
        mask[position] = 0;
    }
}

/// Recover the valid length from a decode mask: the index of the first
/// sentinel word. A mask with no sentinel means the cache is full and the
/// valid length equals `kv_cache_num` (the final word is the always-zero
/// self slot, never part of the scan).
pub fn scan_valid_len(mask: &[u16]) -> usize {
    let positions = mask.len() - 1;
    mask[..positions]
        .iter()
        .position(|&w| w == MASK_SENTINEL)
        .unwrap_or(positions)
}

/// Banded causal mask for one prefill chunk, laid out
/// `[prefill_token_num, group_cap + prefill_token_num]`. Row `i` of a live
/// chunk position attends to the `history_len` already-cached positions in
/// the group window plus its own chunk-local causal band starting at column
/// `group_cap`. Zero-padded rows (`i >= live_rows`) stay fully masked.
pub fn prefill_chunk_mask(
    prefill_token_num: usize,
    group_cap: usize,
    live_rows: usize,
    history_len: usize,
) -> Vec<u16> {
    let cols = group_cap + prefill_token_num;
    let mut mask = vec![MASK_SENTINEL; prefill_token_num * cols];
    for i in 0..live_rows.min(prefill_token_num) {
        let row = &mut mask[i * cols..(i + 1) * cols];
        for slot in row.iter_mut().take(history_len.min(group_cap)) {
            *slot = 0;
        }
        for slot in row[group_cap..].iter_mut().take(i + 1) {
            *slot = 0;
        }
    }
    mask
}

/// Plain causal `[n, n]` mask used by the single-chunk vision models.
pub fn causal_mask(n: usize) -> Vec<u16> {
    let mut mask = vec![MASK_SENTINEL; n * n];
    for i in 0..n {
        for slot in mask[i * n..].iter_mut().take(i + 1) {
            *slot = 0;
        }
    }
    mask
}
