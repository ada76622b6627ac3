//! Token post-processing: temperature, repetition and diversity penalties,
//! then greedy / top-k / top-p selection over the post model's logits.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{LlmError, Result};
use crate::utils::config::PostConfig;

pub struct LogitsProcessor {
    rng: Arc<Mutex<StdRng>>,
    cfg: PostConfig,
}

impl LogitsProcessor {
    pub fn new(seed: u64, cfg: PostConfig) -> Self {
        let rng = StdRng::seed_from_u64(seed);
        Self {
            rng: Arc::new(Mutex::new(rng)),
            cfg,
        }
    }

    pub fn config(&self) -> &PostConfig {
        &self.cfg
    }

    /// Replace the whole configuration. Selection priority (top-p before
    /// top-k before greedy) resolves configs where both samplers are on.
    pub fn set_config(&mut self, cfg: PostConfig) {
        self.cfg = cfg;
    }

    pub fn set_temperature(&mut self, temperature: f32, enable: bool) {
        self.cfg.temperature = temperature;
        self.cfg.enable_temperature = enable;
    }

    pub fn set_repetition_penalty(&mut self, penalty: f32, window: usize, enable: bool) {
        self.cfg.repetition_penalty = penalty;
        self.cfg.penalty_window = window;
        self.cfg.enable_repetition_penalty = enable;
    }

    /// Enabling top-p turns top-k off; they never run together.
    pub fn set_top_p(&mut self, top_p: f32, enable: bool) {
        self.cfg.top_p = top_p;
        self.cfg.enable_top_p_sampling = enable;
        if enable {
            self.cfg.enable_top_k_sampling = false;
        }
    }

    /// Enabling top-k turns top-p off; they never run together.
    pub fn set_top_k(&mut self, top_k: usize, enable: bool) {
        self.cfg.top_k = top_k;
        self.cfg.enable_top_k_sampling = enable;
        if enable {
            self.cfg.enable_top_p_sampling = false;
        }
    }

    pub fn set_diversity_penalty(&mut self, phrases: Vec<u32>, penalty: f32, enable: bool) {
        self.cfg.common_phrases = phrases;
        self.cfg.diversity_penalty = penalty;
        self.cfg.enable_diversity_penalty = enable;
    }

    /// Run the full pipeline over one logits row and pick the next token.
    /// `history` is the tokens produced so far in this generation.
    pub fn apply(&self, logits: &mut [f32], history: &[u32]) -> Result<u32> {
        if self.cfg.enable_temperature {
            self.apply_temperature(logits);
        }
        if self.cfg.enable_repetition_penalty {
            self.apply_repetition_penalty(logits, history);
        }
        if self.cfg.enable_diversity_penalty {
            self.apply_diversity_penalty(logits);
        }

        if self.cfg.enable_top_p_sampling {
            self.sample_top_p(logits)
        } else if self.cfg.enable_top_k_sampling {
            self.sample_top_k(logits)
        } else {
            Ok(argmax(logits))
        }
    }

    fn apply_temperature(&self, logits: &mut [f32]) {
        let t = self.cfg.temperature;
        for l in logits.iter_mut() {
            *l /= t;
        }
    }

    /// Dampen every token seen in the last `penalty_window` history entries:
    /// positive logits are divided by sqrt(penalty), non-positive ones
    /// multiplied, so repeated tokens lose mass regardless of sign. A
    /// penalty of exactly 1.0 or an empty history is a no-op.
    fn apply_repetition_penalty(&self, logits: &mut [f32], history: &[u32]) {
        if self.cfg.repetition_penalty == 1.0 || history.is_empty() {
            return;
        }
        let start = history.len().saturating_sub(self.cfg.penalty_window);
        let recent: HashSet<u32> = history[start..].iter().copied().collect();
        let damp = self.cfg.repetition_penalty.sqrt();
        for token in recent {
            let Some(l) = logits.get_mut(token as usize) else {
                continue;
            };
            if *l > 0.0 {
                *l /= damp;
            } else {
                *l *= damp;
            }
        }
    }

    fn apply_diversity_penalty(&self, logits: &mut [f32]) {
        for &token in &self.cfg.common_phrases {
            if let Some(l) = logits.get_mut(token as usize) {
                *l *= self.cfg.diversity_penalty;
            }
        }
    }

    fn sample_multinomial(&self, prs: &[f32]) -> Result<u32> {
        let distr = WeightedIndex::new(prs)
            .map_err(|e| LlmError::device(format!("weighted sampling failed: {e}")))?;
        let mut rng = self.rng.lock();
        Ok(distr.sample(&mut *rng) as u32)
    }

    /// top-p (nucleus) sampling: softmax everything, keep the most probable
    /// tokens until their cumulative probability reaches top_p (always at
    /// least one), renormalize the kept subset and draw from it.
    fn sample_top_p(&self, logits: &[f32]) -> Result<u32> {
        let probs = softmax(logits);
        let mut order: Vec<usize> = (0..probs.len()).collect();
        order.sort_unstable_by(|&a, &b| probs[b].total_cmp(&probs[a]));

        let mut kept_idx = Vec::new();
        let mut kept_p = Vec::new();
        let mut cumulative = 0.0f32;
        for &i in &order {
            kept_idx.push(i);
            kept_p.push(probs[i]);
            cumulative += probs[i];
            if cumulative >= self.cfg.top_p {
                break;
            }
        }

        let sum: f32 = kept_p.iter().sum();
        for p in kept_p.iter_mut() {
            *p /= sum;
        }
        let picked = self.sample_multinomial(&kept_p)?;
        Ok(kept_idx[picked as usize] as u32)
    }

    /// top-k sampling: keep the k largest logits, softmax that subset only,
    /// and draw from it.
    fn sample_top_k(&self, logits: &[f32]) -> Result<u32> {
        let k = self.cfg.top_k.clamp(1, logits.len());
        let mut order: Vec<usize> = (0..logits.len()).collect();
        order.sort_unstable_by(|&a, &b| logits[b].total_cmp(&logits[a]));
        order.truncate(k);

        let subset: Vec<f32> = order.iter().map(|&i| logits[i]).collect();
        let probs = softmax(&subset);
        let picked = self.sample_multinomial(&probs)?;
        Ok(order[picked as usize] as u32)
    }
}

/// First-occurrence argmax.
pub fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best as u32
}

/// Numerically safe softmax: subtracts the max logit before exponentiating.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
