pub mod config;
pub mod logits_processor;
pub mod mud;
pub mod progress;

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static LOG_INIT: OnceCell<()> = OnceCell::new();

/// Install the process-wide tracing subscriber once. `RUST_LOG` overrides
/// `default_level`. Safe to call from several entry points.
pub fn init_logging(default_level: &str) {
    let level = default_level.to_string();
    LOG_INIT.get_or_init(move || {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    });
}

/// Round `v` down to a multiple of `align`.
pub fn align_down(v: usize, align: usize) -> usize {
    if align == 0 {
        return v;
    }
    v / align * align
}

/// Reinterpret one bfloat16 bit pattern as f32.
#[inline]
pub fn bf16_to_f32(bits: u16) -> f32 {
    half::bf16::from_bits(bits).to_f32()
}

/// Convert f32 to its bfloat16 bit pattern (round-to-nearest).
#[inline]
pub fn f32_to_bf16(v: f32) -> u16 {
    half::bf16::from_f32(v).to_bits()
}

/// Widen a slice of bfloat16 bit patterns into f32 values.
pub fn bf16_slice_to_f32(bits: &[u16]) -> Vec<f32> {
    bits.iter().map(|&b| bf16_to_f32(b)).collect()
}
