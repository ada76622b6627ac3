//! Execution-device seam.
//!
//! The decode engine never touches vendor runtime handles directly; it works
//! against named 16-bit word tensors keyed by execution group, exposed as
//! plain slices. Group 0 is the single-token decode configuration, groups
//! `1..group_count()` are prefill configurations of increasing KV capacity.
//!
//! Word semantics: `input`, `mask`, `K_cache`, `V_cache`, `output`,
//! `K_cache_out` and `V_cache_out` carry bfloat16 bit patterns; `indices`
//! carries plain integer positions (always below 65536, guaranteed by the
//! mask-derived token ceiling discovered at load).

pub mod sim;

use std::path::Path;

use crate::error::Result;

/// One compiled model module (a transformer partition, or the logits head).
pub trait NpuRunner {
    /// Number of execution groups this module was compiled with.
    fn group_count(&self) -> usize;

    /// Mutable view of a named input tensor.
    fn input(&mut self, group: usize, name: &str) -> Result<&mut [u16]>;

    /// Shared view of a named input tensor.
    fn input_ref(&self, group: usize, name: &str) -> Result<&[u16]>;

    /// Shared view of a named output tensor, valid after `run`.
    fn output(&self, group: usize, name: &str) -> Result<&[u16]>;

    /// Logical shape of a named input tensor.
    fn input_shape(&self, group: usize, name: &str) -> Result<&[usize]>;

    /// Execute the module on `group`, consuming the current inputs and
    /// refreshing the outputs. Blocks until the device finishes.
    fn run(&mut self, group: usize) -> Result<()>;
}

/// One vision-encoder pass: raw RGB888 in, a block of bfloat16 embedding
/// words out.
pub trait VisionEncoder {
    fn input_width(&self) -> usize;
    fn input_height(&self) -> usize;
    /// Total words produced per pass (`vpm_len * embed_size`).
    fn embed_len(&self) -> usize;
    fn encode(&mut self, rgb: &[u8]) -> Result<Vec<u16>>;
}

/// Factory for device modules. The engine asks for one runner per compiled
/// partition file plus the post (logits) model, and optionally a vision
/// encoder for VLM variants.
pub trait NpuBackend {
    fn load_runner(&self, path: &Path) -> Result<Box<dyn NpuRunner>>;

    fn load_vision(&self, path: &Path) -> Result<Box<dyn VisionEncoder>> {
        Err(crate::error::LlmError::device(format!(
            "backend has no vision encoder for {}",
            path.display()
        )))
    }
}
