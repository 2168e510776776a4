// core/src/acoustic.rs
//
// Acoustic state scoring: compact block layout for diagonal-covariance
// Gaussian mixtures, a plain (unblocked) fallback used when adaptation
// transforms need the original representation, a hybrid path for neural
// posteriors, and the per-state block cache in front of all three.

use crate::math::{clamp_log, log_add, LZERO, LZERO_F};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Vectors are zero-padded to a multiple of this many floats.
pub const VEC_PAD: usize = 4;

/// One Gaussian component of a shared state, as delivered by the model
/// loader. Means and inverse diagonal variances have the feature dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mixture {
    pub log_weight: f32,
    pub g_const: f32,
    pub mean: Vec<f32>,
    pub inv_var: Vec<f32>,
}

/// A shared output state: a bag of mixtures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmmState {
    pub mixtures: Vec<Mixture>,
}

/// Round `n` up to the next multiple of `align`.
fn round_align(n: usize, align: usize) -> usize {
    if n % align == 0 {
        n
    } else {
        (n / align + 1) * align
    }
}

/// Compact model layout for fast scoring.
///
/// States are stored in fixed-size blocks of `mix_per_block` rows, where
/// `mix_per_block` is the minimum mixture count over all states. A state
/// with `k * mix_per_block` mixtures occupies `k` consecutive blocks. Each
/// row is `[g_const, log_weight, mix_count, pad, mean[padded],
/// inv_var[padded]]`, so a row spans `2 * pad(dim) + 4` floats and mean and
/// inverse variance stay contiguous and aligned for the inner kernel.
#[derive(Debug, Clone)]
pub struct StateTable {
    base: Vec<f32>,
    n_dim: usize,
    floats_per_mix: usize,
    floats_per_block: usize,
    state_block: Vec<u32>,
}

impl StateTable {
    /// Convert the generic mixture representation into the block layout.
    pub fn build(states: &[GmmState], dim: usize) -> Result<StateTable> {
        if states.is_empty() {
            bail!("acoustic model has no states");
        }
        let mut min_mix = usize::MAX;
        for (s, st) in states.iter().enumerate() {
            if st.mixtures.is_empty() {
                bail!("state {} has no mixtures", s);
            }
            for mix in &st.mixtures {
                if mix.mean.len() != dim || mix.inv_var.len() != dim {
                    bail!(
                        "state {}: mixture vector size {} does not match feature dimension {}",
                        s,
                        mix.mean.len(),
                        dim
                    );
                }
            }
            min_mix = min_mix.min(st.mixtures.len());
        }

        let n_vec = round_align(dim, VEC_PAD);
        let floats_per_mix = 2 * n_vec + 4;
        let floats_per_block = min_mix * floats_per_mix;

        // assign the first block of each state
        let mut state_block = Vec::with_capacity(states.len());
        let mut next = 0u32;
        for st in states {
            state_block.push(next);
            next += (round_align(st.mixtures.len(), min_mix) / min_mix) as u32;
        }

        let mut base = vec![0.0f32; next as usize * floats_per_block];
        for (s, st) in states.iter().enumerate() {
            let mut row = state_block[s] as usize * floats_per_block;
            for mix in &st.mixtures {
                base[row] = mix.g_const;
                base[row + 1] = mix.log_weight;
                base[row + 2] = st.mixtures.len() as f32;
                base[row + 4..row + 4 + dim].copy_from_slice(&mix.mean);
                base[row + 4 + n_vec..row + 4 + n_vec + dim].copy_from_slice(&mix.inv_var);
                row += floats_per_mix;
            }
        }

        Ok(StateTable {
            base,
            n_dim: dim,
            floats_per_mix,
            floats_per_block,
            state_block,
        })
    }

    pub fn n_states(&self) -> usize {
        self.state_block.len()
    }

    pub fn dim(&self) -> usize {
        self.n_dim
    }

    /// Log output probability of state `s` for feature vector `x`.
    ///
    /// With `pde` set, mixtures whose partial squared distance already puts
    /// them more than `PDE_MARGIN` below the running log-sum are abandoned
    /// early.
    pub fn score(&self, s: u32, x: &[f32], pde: bool) -> f32 {
        const PDE_MARGIN: f32 = 10.0;

        debug_assert_eq!(x.len(), self.n_dim);
        let mut row = self.state_block[s as usize] as usize * self.floats_per_block;
        let n_mix = self.base[row + 2] as usize;
        let n_vec = (self.floats_per_mix - 4) / 2;

        let mut bx = LZERO;
        for _ in 0..n_mix {
            let g_const = self.base[row];
            let weight = self.base[row + 1];
            let mean = &self.base[row + 4..row + 4 + self.n_dim];
            let inv_var = &self.base[row + 4 + n_vec..row + 4 + n_vec + self.n_dim];

            let mut sum = g_const;
            if pde && bx > LZERO {
                // abandon once -0.5*sum + weight cannot reach bx - margin
                let limit = 2.0 * (weight - bx as f32 + PDE_MARGIN) + g_const;
                let mut dead = false;
                for i in 0..self.n_dim {
                    let d = x[i] - mean[i];
                    sum += d * d * inv_var[i];
                    if sum > limit {
                        dead = true;
                        break;
                    }
                }
                if dead {
                    row += self.floats_per_mix;
                    continue;
                }
            } else {
                for i in 0..self.n_dim {
                    let d = x[i] - mean[i];
                    sum += d * d * inv_var[i];
                }
            }
            let px = -0.5 * sum;
            bx = log_add(bx, (weight + px) as f64);
            row += self.floats_per_mix;
        }
        bx as f32
    }
}

/// Unblocked mixture store, used when a feature-space transform has to be
/// applied per mixture and the compact table cannot be shared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlainStates {
    pub states: Vec<GmmState>,
    pub dim: usize,
}

impl PlainStates {
    pub fn score(&self, s: u32, x: &[f32]) -> f32 {
        let st = &self.states[s as usize];
        let mut bx = LZERO;
        for mix in &st.mixtures {
            let mut sum = mix.g_const;
            for i in 0..self.dim {
                let d = x[i] - mix.mean[i];
                sum += d * d * mix.inv_var[i];
            }
            bx = log_add(bx, (mix.log_weight - 0.5 * sum) as f64);
        }
        bx as f32
    }
}

/// Hybrid acoustic model: the observation vector holds log posteriors from
/// an external network and each state selects one output unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridTable {
    pub targets: Vec<u32>,
}

/// The three scoring back ends behind one surface.
#[derive(Debug, Clone)]
pub enum AcousticModel {
    Blocked(StateTable),
    Plain(PlainStates),
    Hybrid(HybridTable),
}

impl AcousticModel {
    /// Build from the generic per-state mixture surface. `use_hmodel`
    /// keeps the original representation (needed when per-mixture
    /// transforms must be applied) instead of the compact block table.
    pub fn from_states(states: Vec<GmmState>, dim: usize, use_hmodel: bool) -> Result<Self> {
        if use_hmodel {
            for (s, st) in states.iter().enumerate() {
                for mix in &st.mixtures {
                    if mix.mean.len() != dim || mix.inv_var.len() != dim {
                        bail!(
                            "state {}: mixture vector size {} does not match feature dimension {}",
                            s,
                            mix.mean.len(),
                            dim
                        );
                    }
                }
            }
            Ok(AcousticModel::Plain(PlainStates { states, dim }))
        } else {
            Ok(AcousticModel::Blocked(StateTable::build(&states, dim)?))
        }
    }

    pub fn n_states(&self) -> usize {
        match self {
            AcousticModel::Blocked(t) => t.n_states(),
            AcousticModel::Plain(p) => p.states.len(),
            AcousticModel::Hybrid(h) => h.targets.len(),
        }
    }

    /// Feature dimension expected in observations, if the model constrains it.
    pub fn dim(&self) -> Option<usize> {
        match self {
            AcousticModel::Blocked(t) => Some(t.dim()),
            AcousticModel::Plain(p) => Some(p.dim),
            AcousticModel::Hybrid(_) => None,
        }
    }
}

/// A single frame of input: feature vector, or network log posteriors for
/// hybrid models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub features: Vec<f32>,
}

impl Observation {
    pub fn new(features: Vec<f32>) -> Self {
        Self { features }
    }
}

/// Affine feature-space transform, applied to observations before scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transform {
    /// Row-major `dim x dim` linear part.
    pub linear: Vec<f32>,
    pub bias: Vec<f32>,
}

impl Transform {
    pub fn apply(&self, x: &[f32]) -> Vec<f32> {
        let dim = self.bias.len();
        let mut out = self.bias.clone();
        for (r, o) in out.iter_mut().enumerate() {
            let row = &self.linear[r * dim..(r + 1) * dim];
            for (a, b) in row.iter().zip(x) {
                *o += a * b;
            }
        }
        out
    }
}

/// Per-state cache of block-scored output probabilities.
///
/// Each state remembers the frame at which its block was last filled and how
/// many entries of the block are valid (fewer than the block size near the
/// end of the utterance). A request within the valid window is a hit; a miss
/// scores the whole remaining block at once.
#[derive(Debug)]
struct ScoreCache {
    block: usize,
    frame_of: Vec<i64>,
    valid: Vec<u16>,
    scores: Vec<f32>,
    hits: u64,
    misses: u64,
}

impl ScoreCache {
    fn new(n_states: usize, block: usize) -> Self {
        Self {
            block,
            frame_of: vec![-1000; n_states],
            valid: vec![0; n_states],
            scores: vec![0.0; n_states * block],
            hits: 0,
            misses: 0,
        }
    }

    fn reset(&mut self) {
        for t in &mut self.frame_of {
            *t = -1000;
        }
        for v in &mut self.valid {
            *v = 0;
        }
        self.hits = 0;
        self.misses = 0;
    }
}

/// Cached scorer over one acoustic model.
#[derive(Debug)]
pub struct AcousticScorer {
    model: AcousticModel,
    cache: ScoreCache,
    pde: bool,
}

impl AcousticScorer {
    pub fn new(model: AcousticModel, block: usize, pde: bool) -> Self {
        let n = model.n_states();
        Self {
            model,
            cache: ScoreCache::new(n, block.max(1)),
            pde,
        }
    }

    pub fn model(&self) -> &AcousticModel {
        &self.model
    }

    /// Invalidate the cache; call between utterances.
    pub fn reset(&mut self) {
        self.cache.reset();
    }

    pub fn cache_stats(&self) -> (u64, u64) {
        (self.cache.hits, self.cache.misses)
    }

    /// Scaled log output probability of `state` at `frame`. `obs` holds the
    /// current observation followed by the lookahead block.
    pub fn score(&mut self, frame: i64, obs: &[Observation], ac_scale: f32, state: u32) -> f32 {
        let s = state as usize;
        let off = frame - self.cache.frame_of[s];
        if off >= 0 && (off as usize) < self.cache.valid[s] as usize {
            self.cache.hits += 1;
            return self.cache.scores[s * self.cache.block + off as usize];
        }

        self.cache.misses += 1;
        let n = self.cache.block.min(obs.len());
        for (i, ob) in obs.iter().take(n).enumerate() {
            let raw = match &self.model {
                AcousticModel::Blocked(t) => t.score(state, &ob.features, self.pde),
                AcousticModel::Plain(p) => p.score(state, &ob.features),
                AcousticModel::Hybrid(h) => {
                    let tgt = h.targets[s] as usize;
                    if tgt < ob.features.len() {
                        ob.features[tgt]
                    } else {
                        LZERO_F
                    }
                }
            };
            self.cache.scores[s * self.cache.block + i] = clamp_log(ac_scale * raw);
        }
        self.cache.frame_of[s] = frame;
        self.cache.valid[s] = n as u16;
        self.cache.scores[s * self.cache.block]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_state(mean: Vec<f32>) -> GmmState {
        let dim = mean.len();
        GmmState {
            mixtures: vec![Mixture {
                log_weight: 0.0,
                // gConst for unit variance: dim*ln(2pi) + ln|Sigma| with
                // invVar = 1 everywhere
                g_const: dim as f32 * (2.0 * std::f32::consts::PI).ln(),
                mean,
                inv_var: vec![1.0; dim],
            }],
        }
    }

    #[test]
    fn blocked_matches_plain_scoring() {
        let states = vec![unit_state(vec![0.0, 1.0, -1.0]), unit_state(vec![2.0, 2.0, 2.0])];
        let table = StateTable::build(&states, 3).unwrap();
        let plain = PlainStates {
            states: states.clone(),
            dim: 3,
        };
        let x = [0.5f32, 0.5, 0.5];
        for s in 0..2 {
            let a = table.score(s, &x, false);
            let b = plain.score(s, &x);
            assert!((a - b).abs() < 1e-4, "state {}: {} vs {}", s, a, b);
        }
    }

    #[test]
    fn score_is_highest_at_the_mean() {
        let states = vec![unit_state(vec![1.0, 2.0])];
        let table = StateTable::build(&states, 2).unwrap();
        let at_mean = table.score(0, &[1.0, 2.0], false);
        let away = table.score(0, &[3.0, 0.0], false);
        assert!(at_mean > away);
    }

    #[test]
    fn multi_block_state_layout() {
        // one single-mix state forces mix_per_block = 1, the 3-mix state
        // then spans three blocks
        let mut big = unit_state(vec![0.0; 2]);
        big.mixtures.push(Mixture {
            log_weight: -0.7,
            g_const: 2.0,
            mean: vec![5.0, 5.0],
            inv_var: vec![1.0, 1.0],
        });
        big.mixtures.push(Mixture {
            log_weight: -0.7,
            g_const: 2.0,
            mean: vec![-5.0, -5.0],
            inv_var: vec![1.0, 1.0],
        });
        let states = vec![unit_state(vec![0.0; 2]), big.clone()];
        let table = StateTable::build(&states, 2).unwrap();
        let plain = PlainStates { states, dim: 2 };
        let x = [4.0f32, 4.5];
        assert!((table.score(1, &x, false) - plain.score(1, &x)).abs() < 1e-4);
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let states = vec![unit_state(vec![0.0, 0.0])];
        assert!(StateTable::build(&states, 3).is_err());
    }

    #[test]
    fn pde_keeps_the_dominant_mixture() {
        let mut st = unit_state(vec![0.0; 4]);
        st.mixtures.push(Mixture {
            log_weight: -0.7,
            g_const: 4.0,
            mean: vec![100.0; 4],
            inv_var: vec![1.0; 4],
        });
        // pad with a matching single-mix state so mix_per_block is 1
        let states = vec![st, unit_state(vec![0.0; 4])];
        let table = StateTable::build(&states, 4).unwrap();
        let exact = table.score(0, &[0.1; 4], false);
        let fast = table.score(0, &[0.1; 4], true);
        assert!((exact - fast).abs() < 0.01);
    }

    #[test]
    fn cache_hits_within_block() {
        let states = vec![unit_state(vec![0.0, 0.0])];
        let table = StateTable::build(&states, 2).unwrap();
        let mut scorer = AcousticScorer::new(AcousticModel::Blocked(table), 4, false);

        let obs: Vec<Observation> = (0..4)
            .map(|i| Observation::new(vec![i as f32, 0.0]))
            .collect();
        let s0 = scorer.score(1, &obs, 1.0, 0);
        // next frame, shorter remaining block: should hit the cache
        let s1 = scorer.score(2, &obs[1..], 1.0, 0);
        let (hits, misses) = scorer.cache_stats();
        assert_eq!(misses, 1);
        assert_eq!(hits, 1);
        // the cached entry for frame 2 was computed from obs[1]
        let expect = scorer.model().dim();
        assert!(expect.is_some());
        assert!(s0 >= s1, "score away from the mean must not increase");
    }

    #[test]
    fn cache_respects_short_tail_blocks() {
        let states = vec![unit_state(vec![0.0])];
        let table = StateTable::build(&states, 1).unwrap();
        let mut scorer = AcousticScorer::new(AcousticModel::Blocked(table), 8, false);

        // only two observations left near the end of the utterance
        let obs = vec![Observation::new(vec![0.0]), Observation::new(vec![1.0])];
        scorer.score(10, &obs, 1.0, 0);
        scorer.score(11, &obs[1..], 1.0, 0);
        let (hits, misses) = scorer.cache_stats();
        assert_eq!((hits, misses), (1, 1));

        // frame 12 was never scored; must be a miss, not a stale hit
        scorer.score(12, &[Observation::new(vec![2.0])], 1.0, 0);
        let (_, misses) = scorer.cache_stats();
        assert_eq!(misses, 2);
    }

    #[test]
    fn hybrid_scoring_reads_posterior_slots() {
        let model = AcousticModel::Hybrid(HybridTable {
            targets: vec![1, 0],
        });
        let mut scorer = AcousticScorer::new(model, 1, false);
        let obs = vec![Observation::new(vec![-2.0, -0.5])];
        assert!((scorer.score(0, &obs, 1.0, 0) - (-0.5)).abs() < 1e-6);
        assert!((scorer.score(0, &obs, 2.0, 1) - (-4.0)).abs() < 1e-6);
    }

    #[test]
    fn transform_is_affine() {
        let t = Transform {
            linear: vec![0.0, 1.0, 1.0, 0.0],
            bias: vec![1.0, -1.0],
        };
        assert_eq!(t.apply(&[2.0, 3.0]), vec![4.0, 1.0]);
    }
}
