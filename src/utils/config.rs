//! Engine configuration: model attributes from the MUD file, tensor
//! dimensions discovered at load time, and the sampling configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::utils::mud::MudFile;

/// Static model attributes, read from the MUD description file.
#[derive(Debug, Clone)]
pub struct LlmAttr {
    /// Partition file template containing a `%d` placeholder.
    pub template_filename_axmodel: PathBuf,
    pub filename_post_axmodel: PathBuf,
    pub filename_tokens_embed: PathBuf,
    pub url_tokenizer: String,
    pub model_type: String,
    pub tokenizer_type: Option<String>,
    /// Number of compiled model partitions.
    pub axmodel_num: usize,
    /// Vocabulary rows in the embedding table.
    pub tokens_embed_num: usize,
    /// Embedding width in half-precision words.
    pub tokens_embed_size: usize,
    pub use_mmap_load_embed: bool,
    /// Vision resampler model, present for VLM variants only.
    pub vpm_model: Option<PathBuf>,
    /// Rows produced by one vision-encoder pass.
    pub vpm_len: usize,
}

impl LlmAttr {
    /// Build attributes from a parsed MUD file. Vision keys are optional;
    /// everything else is required.
    pub fn from_mud(mud: &MudFile) -> Result<Self> {
        let vpm_model = if mud.has("extra", "vpm_resampler_model") {
            Some(mud.resolve(mud.require("extra", "vpm_resampler_model")?))
        } else {
            None
        };
        let vpm_len = if mud.has("extra", "vpm_len") {
            mud.require_usize("extra", "vpm_len")?
        } else {
            0
        };
        Ok(Self {
            template_filename_axmodel: mud.resolve(mud.require("basic", "model_npu")?),
            filename_post_axmodel: mud.resolve(mud.require("extra", "post_model")?),
            filename_tokens_embed: mud.resolve(mud.require("extra", "tokens_embed")?),
            url_tokenizer: mud.require("extra", "tokenizer_url")?.to_string(),
            model_type: mud.require("extra", "model_type")?.to_string(),
            tokenizer_type: mud.get("extra", "tokenizer_type").map(str::to_string),
            axmodel_num: mud.require_usize("extra", "model_num")?,
            tokens_embed_num: mud.require_usize("extra", "tokens_embed_num")?,
            tokens_embed_size: mud.require_usize("extra", "tokens_embed_size")?,
            use_mmap_load_embed: mud.get_bool("extra", "use_mmap_load_embed", false),
            vpm_model,
            vpm_len,
        })
    }

    /// Path of partition `index`, substituted into the `%d` template.
    pub fn partition_path(&self, index: usize) -> PathBuf {
        let template = self.template_filename_axmodel.to_string_lossy();
        PathBuf::from(template.replace("%d", &index.to_string()))
    }
}

/// Tensor dimensions discovered from the loaded partitions. Immutable once
/// the engine is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDims {
    /// Hard ceiling on absolute sequence positions.
    pub max_token_len: usize,
    /// Decode-group KV capacity in positions.
    pub kv_cache_num: usize,
    /// Words per cached position, per partition.
    pub kv_cache_size: usize,
    /// Positions processed by one prefill chunk.
    pub prefill_token_num: usize,
    /// Largest prefill input accepted across all groups.
    pub prefill_max_token_num: usize,
    /// Capacity of each prefill group, ascending; device group id is
    /// `index + 1`.
    pub prefill_grp_caps: Vec<usize>,
}

impl ModelDims {
    /// Smallest prefill group able to hold `total` positions. Returns the
    /// device group id (1-based).
    pub fn select_prefill_group(&self, total: usize) -> Option<usize> {
        self.prefill_grp_caps
            .iter()
            .position(|&cap| total <= cap)
            .map(|i| i + 1)
    }

    /// Capacity of device prefill group `grpid` (1-based).
    pub fn group_capacity(&self, grpid: usize) -> usize {
        self.prefill_grp_caps[grpid - 1]
    }

    /// Tokens still accepted for one turn after `precompute_len` positions
    /// are already cached, aligned down to whole prefill chunks.
    pub fn turn_budget(&self, precompute_len: usize) -> usize {
        let remaining = self.prefill_max_token_num.saturating_sub(precompute_len);
        crate::utils::align_down(remaining, self.prefill_token_num)
    }
}

fn default_true() -> bool {
    true
}
fn default_temperature() -> f32 {
    0.9
}
fn default_repetition_penalty() -> f32 {
    1.2
}
fn default_penalty_window() -> usize {
    20
}
fn default_diversity_penalty() -> f32 {
    1.0
}
fn default_top_p() -> f32 {
    0.8
}
fn default_top_k() -> usize {
    10
}

/// Sampling configuration applied to every produced token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostConfig {
    #[serde(default = "default_true")]
    pub enable_temperature: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub enable_repetition_penalty: bool,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
    #[serde(default = "default_penalty_window")]
    pub penalty_window: usize,
    #[serde(default)]
    pub enable_diversity_penalty: bool,
    #[serde(default = "default_diversity_penalty")]
    pub diversity_penalty: f32,
    /// Token ids whose logits the diversity penalty scales.
    #[serde(default)]
    pub common_phrases: Vec<u32>,
    #[serde(default)]
    pub enable_top_p_sampling: bool,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_true")]
    pub enable_top_k_sampling: bool,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for PostConfig {
    fn default() -> Self {
        Self {
            enable_temperature: true,
            temperature: default_temperature(),
            enable_repetition_penalty: false,
            repetition_penalty: default_repetition_penalty(),
            penalty_window: default_penalty_window(),
            enable_diversity_penalty: false,
            diversity_penalty: default_diversity_penalty(),
            common_phrases: Vec::new(),
            enable_top_p_sampling: false,
            top_p: default_top_p(),
            enable_top_k_sampling: true,
            top_k: default_top_k(),
        }
    }
}

impl PostConfig {
    /// Read the `[post_config]` section. Numeric keys are required, enables
    /// fall back to off when absent.
    pub fn from_mud(mud: &MudFile) -> Result<Self> {
        Ok(Self {
            enable_temperature: mud.get_bool("post_config", "enable_temperature", false),
            temperature: mud.require_f32("post_config", "temperature")?,
            enable_repetition_penalty: mud.get_bool(
                "post_config",
                "enable_repetition_penalty",
                false,
            ),
            repetition_penalty: mud.require_f32("post_config", "repetition_penalty")?,
            penalty_window: mud.require_usize("post_config", "penalty_window")?,
            enable_diversity_penalty: false,
            diversity_penalty: default_diversity_penalty(),
            common_phrases: Vec::new(),
            enable_top_p_sampling: mud.get_bool("post_config", "enable_top_p_sampling", false),
            top_p: mud.require_f32("post_config", "top_p")?,
            enable_top_k_sampling: mud.get_bool("post_config", "enable_top_k_sampling", false),
            top_k: mud.require_usize("post_config", "top_k")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_config_defaults() {
        let cfg = PostConfig::default();
        assert!(cfg.enable_temperature);
        assert_eq!(cfg.temperature, 0.9);
        assert!(!cfg.enable_repetition_penalty);
        assert_eq!(cfg.repetition_penalty, 1.2);
        assert_eq!(cfg.penalty_window, 20);
        assert!(!cfg.enable_top_p_sampling);
        assert_eq!(cfg.top_p, 0.8);
        assert!(cfg.enable_top_k_sampling);
        assert_eq!(cfg.top_k, 10);
    }

    #[test]
    fn test_post_config_from_json_partial() {
        // Missing keys take the documented defaults.
        let cfg: PostConfig = serde_json::from_str(r#"{"temperature": 0.2}"#).unwrap();
        assert_eq!(cfg.temperature, 0.2);
        assert!(cfg.enable_temperature);
        assert_eq!(cfg.top_k, 10);
    }

    #[test]
    fn test_partition_path_substitution() {
        let mud = MudFile::parse_str(
            "[basic]\nmodel_npu = model/qwen2_p96_l%d.axmodel\n\
             [extra]\nmodel_type = q\ntokenizer_url = u\ntokens_embed = e.bin\n\
             post_model = post.axmodel\nmodel_num = 3\ntokens_embed_num = 10\n\
             tokens_embed_size = 4\n",
            "/opt/m",
        )
        .unwrap();
        let attr = LlmAttr::from_mud(&mud).unwrap();
        assert_eq!(
            attr.partition_path(7),
            PathBuf::from("/opt/m/model/qwen2_p96_l7.axmodel")
        );
        assert!(attr.vpm_model.is_none());
        assert_eq!(attr.vpm_len, 0);
    }

    #[test]
    fn test_select_prefill_group_smallest_fit() {
        let dims = ModelDims {
            max_token_len: 1023,
            kv_cache_num: 1023,
            kv_cache_size: 128,
            prefill_token_num: 96,
            prefill_max_token_num: 512,
            prefill_grp_caps: vec![96, 192, 288, 384, 512],
        };
        assert_eq!(dims.select_prefill_group(1), Some(1));
        assert_eq!(dims.select_prefill_group(96), Some(1));
        assert_eq!(dims.select_prefill_group(97), Some(2));
        assert_eq!(dims.select_prefill_group(512), Some(5));
        assert_eq!(dims.select_prefill_group(513), None);
    }

    #[test]
    fn test_group_selection_monotonic() {
        let dims = ModelDims {
            max_token_len: 1023,
            kv_cache_num: 1023,
            kv_cache_size: 128,
            prefill_token_num: 96,
            prefill_max_token_num: 512,
            prefill_grp_caps: vec![96, 192, 288, 384, 512],
        };
        let mut last = 0;
        for len in 1..=512 {
            let grp = dims.select_prefill_group(len).unwrap();
            assert!(grp >= last, "group shrank at len {len}");
            last = grp;
        }
    }

    #[test]
    fn test_turn_budget_alignment() {
        let dims = ModelDims {
            max_token_len: 1023,
            kv_cache_num: 1023,
            kv_cache_size: 128,
            prefill_token_num: 96,
            prefill_max_token_num: 512,
            prefill_grp_caps: vec![96, 192, 288, 384, 512],
        };
        assert_eq!(dims.turn_budget(0), 480);
        assert_eq!(dims.turn_budget(32), 480);
        assert_eq!(dims.turn_budget(100), 384);
        assert_eq!(dims.turn_budget(512), 0);
        assert_eq!(dims.turn_budget(9999), 0);
    }
}
