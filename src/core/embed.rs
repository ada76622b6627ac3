//! Token-embedding table: token id -> `embed_size` half-precision words.
//!
//! Two backing modes, chosen at load: fully resident (the whole file read
//! into memory) or a read-only memory map. The file must be exactly
//! `token_count * embed_size * 2` bytes. Read-only after open; lookups are
//! safe from any thread.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use tracing::error;

use crate::error::{LlmError, Result};

enum Backing {
    Resident(Vec<u16>),
    Mapped(Mmap),
}

impl std::fmt::Debug for EmbedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbedTable")
            .field("token_count", &self.token_count)
            .field("embed_size", &self.embed_size)
            .finish_non_exhaustive()
    }
}

pub struct EmbedTable {
    backing: Backing,
    token_count: usize,
    embed_size: usize,
}

impl EmbedTable {
    pub fn open(
        path: impl AsRef<Path>,
        token_count: usize,
        embed_size: usize,
        use_mmap: bool,
    ) -> Result<Self> {
        let path = path.as_ref();
        let expect_bytes = token_count * embed_size * 2;
        let meta = std::fs::metadata(path)
            .map_err(|e| LlmError::load(format!("embed file {}: {e}", path.display())))?;
        if meta.len() != expect_bytes as u64 {
            return Err(LlmError::load(format!(
                "embed file {} is {} bytes, want token_count({token_count}) * embed_size({embed_size}) * 2 = {expect_bytes}",
                path.display(),
                meta.len()
            )));
        }

        let backing = if use_mmap {
            let file = File::open(path)
                .map_err(|e| LlmError::load(format!("embed file {}: {e}", path.display())))?;
            // Safety: the map is private to this process and never written.
            let map = unsafe { Mmap::map(&file) }
                .map_err(|e| LlmError::load(format!("mmap {}: {e}", path.display())))?;
            Backing::Mapped(map)
        } else {
            let bytes = std::fs::read(path)
                .map_err(|e| LlmError::load(format!("embed file {}: {e}", path.display())))?;
            let words = bytes
                .chunks_exact(2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .collect();
            Backing::Resident(words)
        };

        Ok(Self {
            backing,
            token_count,
            embed_size,
        })
    }

    pub fn embed_size(&self) -> usize {
        self.embed_size
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    /// Copy the embedding row of `token_id` into `out` (`embed_size` words).
    /// An out-of-range id is a caller bug prevented upstream: it is logged
    /// and the buffer is left unwritten rather than treated as an error.
    pub fn lookup(&self, token_id: u32, out: &mut [u16]) {
        let idx = token_id as usize;
        if idx >= self.token_count {
            error!(token_id, token_count = self.token_count, "embed index out of range");
            return;
        }
        let start = idx * self.embed_size;
        match &self.backing {
            Backing::Resident(words) => {
                out[..self.embed_size].copy_from_slice(&words[start..start + self.embed_size]);
            }
            Backing::Mapped(map) => {
                let bytes = &map[start * 2..(start + self.embed_size) * 2];
                for (slot, b) in out[..self.embed_size].iter_mut().zip(bytes.chunks_exact(2)) {
                    *slot = u16::from_le_bytes([b[0], b[1]]);
                }
            }
        }
    }

    /// Embedding rows for a whole token sequence, concatenated in order.
    pub fn lookup_all(&self, token_ids: &[u32]) -> Vec<u16> {
        let mut out = vec![0u16; token_ids.len() * self.embed_size];
        for (i, &id) in token_ids.iter().enumerate() {
            self.lookup(id, &mut out[i * self.embed_size..(i + 1) * self.embed_size]);
        }
        out
    }
}
