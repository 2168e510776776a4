// core/src/lm.rs
//
// Language-model surface consumed by the decoder, the lexicon-tree
// lookahead structure, and the bounded per-node cache of lookahead scores.
// A small bigram back-off model is included so the engine can be exercised
// without an external LM collaborator.

use crate::dict::PronId;
use crate::math::{LSMALL_F, LZERO_F};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Opaque language-model state handle. The total order on the raw value is
/// the order tokens are kept in within a token set.
pub type LmState = u64;

/// What the decoder needs from a language model. All returned scores are
/// unscaled natural-log probabilities; the decoder applies its grammar
/// scale factor.
pub trait LangModel {
    /// State before the first word of the utterance.
    fn initial(&self) -> LmState;

    /// Probability of pronunciation `pron` leaving `src`, with the successor
    /// state. Impossible transitions return a score of `LZERO_F`.
    fn trans_prob(&self, src: LmState, pron: PronId) -> (LmState, f32);

    /// Upper bound used for lookahead: the best transition probability over
    /// the contiguous word-end range `lo..=hi`.
    fn lookahead_max(&self, state: LmState, lo: PronId, hi: PronId) -> f32;

    /// Optional coarsening of a state for fast lookahead; grouping histories
    /// widens cache hits at a small accuracy cost.
    fn fast_state(&self, state: LmState) -> LmState {
        state
    }
}

/// One lookahead-tree entry covering a contiguous word-end range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmlaNode {
    pub lo: PronId,
    pub hi: PronId,
}

/// Union entry: the lookahead is the max over other entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompLmlaNode {
    pub parts: Vec<u32>,
}

/// Lookahead indices for the lexicon tree. Simple entries occupy indices
/// `0..nodes.len()`, composite entries follow. Index 0 is reserved (a node
/// with lookahead index 0 performs no lookahead), so builders keep a dummy
/// entry there.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LmlaTree {
    pub nodes: Vec<LmlaNode>,
    pub comp: Vec<CompLmlaNode>,
}

impl LmlaTree {
    /// A tree with only the reserved slot.
    pub fn new() -> Self {
        Self {
            nodes: vec![LmlaNode { lo: 0, hi: 0 }],
            comp: Vec::new(),
        }
    }

    /// Append a simple range entry and return its index.
    pub fn push_range(&mut self, lo: PronId, hi: PronId) -> u32 {
        self.nodes.push(LmlaNode { lo, hi });
        (self.nodes.len() - 1) as u32
    }

    pub fn n_entries(&self) -> usize {
        self.nodes.len() + self.comp.len()
    }
}

const NODE_CACHE_WAYS: usize = 8;

#[derive(Debug, Clone, Copy)]
struct LaEntry {
    src: LmState,
    prob: f32,
}

/// Bounded ring of cached `(state, score)` pairs for one lookahead index.
#[derive(Debug)]
struct NodeCache {
    entries: Vec<LaEntry>,
    next_free: usize,
}

impl NodeCache {
    fn new() -> Self {
        Self {
            entries: Vec::with_capacity(NODE_CACHE_WAYS),
            next_free: 0,
        }
    }

    fn find(&self, src: LmState) -> Option<f32> {
        self.entries.iter().find(|e| e.src == src).map(|e| e.prob)
    }

    fn insert(&mut self, src: LmState, prob: f32) {
        if self.entries.len() < NODE_CACHE_WAYS {
            self.entries.push(LaEntry { src, prob });
        } else {
            self.entries[self.next_free] = LaEntry { src, prob };
            self.next_free = (self.next_free + 1) % NODE_CACHE_WAYS;
        }
    }
}

/// Cache of scaled lookahead scores, one ring per lookahead index.
#[derive(Debug)]
pub struct LmCache {
    node: Vec<Option<NodeCache>>,
    pub la_hits: u64,
    pub la_misses: u64,
}

impl LmCache {
    pub fn new(n_entries: usize) -> Self {
        let mut node = Vec::with_capacity(n_entries);
        node.resize_with(n_entries, || None);
        Self {
            node,
            la_hits: 0,
            la_misses: 0,
        }
    }

    pub fn reset(&mut self) {
        for n in &mut self.node {
            *n = None;
        }
        self.la_hits = 0;
        self.la_misses = 0;
    }

    /// Scaled lookahead score for `(state, idx)`. With `fast` set the state
    /// is first coarsened through [`LangModel::fast_state`].
    pub fn lookahead(
        &mut self,
        lm: &dyn LangModel,
        tree: &LmlaTree,
        lm_scale: f32,
        state: LmState,
        idx: u32,
        fast: bool,
    ) -> f32 {
        debug_assert!((idx as usize) < tree.n_entries());
        let state = if fast { lm.fast_state(state) } else { state };

        if let Some(cache) = &self.node[idx as usize] {
            if let Some(prob) = cache.find(state) {
                self.la_hits += 1;
                return prob;
            }
        }

        let mut score = if (idx as usize) < tree.nodes.len() {
            self.la_misses += 1;
            let node = &tree.nodes[idx as usize];
            lm_scale * lm.lookahead_max(state, node.lo, node.hi)
        } else {
            let parts = tree.comp[idx as usize - tree.nodes.len()].parts.clone();
            let mut best = LZERO_F;
            for part in parts {
                let s = self.lookahead(lm, tree, lm_scale, state, part, false);
                if s > best {
                    best = s;
                }
            }
            best
        };
        if score < LSMALL_F {
            score = LZERO_F;
        }

        let cache = self.node[idx as usize].get_or_insert_with(NodeCache::new);
        cache.insert(state, score);
        score
    }
}

/// Bigram back-off language model over pronunciation ids.
///
/// State encoding: 0 is the start-of-sentence context, `p + 1` is the
/// context after pronunciation `p`. The fast state collapses every history
/// to the start context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BigramLm {
    n_prons: u32,
    unigram: Vec<f32>,
    backoff: Vec<f32>,
    bigram: HashMap<(u64, u32), f32>,
}

impl BigramLm {
    /// Uniform unigram model over `n_prons` pronunciations.
    pub fn uniform(n_prons: u32) -> Self {
        let p = -(n_prons.max(1) as f32).ln();
        Self {
            n_prons,
            unigram: vec![p; n_prons as usize],
            backoff: vec![0.0; n_prons as usize + 1],
            bigram: HashMap::new(),
        }
    }

    pub fn set_unigram(&mut self, pron: PronId, log_p: f32) {
        self.unigram[pron as usize] = log_p;
    }

    /// Set `log P(pron | context)`; the context state is 0 for sentence
    /// start or `prev + 1` for a preceding pronunciation.
    pub fn set_bigram(&mut self, context: LmState, pron: PronId, log_p: f32) {
        self.bigram.insert((context, pron), log_p);
    }

    pub fn set_backoff(&mut self, context: LmState, log_w: f32) {
        self.backoff[context as usize] = log_w;
    }

    pub fn save_bincode<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn load_bincode<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let model: Self = bincode::deserialize_from(reader)?;
        Ok(model)
    }
}

impl LangModel for BigramLm {
    fn initial(&self) -> LmState {
        0
    }

    fn trans_prob(&self, src: LmState, pron: PronId) -> (LmState, f32) {
        if pron >= self.n_prons {
            return (src, LZERO_F);
        }
        let score = match self.bigram.get(&(src, pron)) {
            Some(&p) => p,
            None => self.backoff[src as usize] + self.unigram[pron as usize],
        };
        if score < LSMALL_F {
            (src, LZERO_F)
        } else {
            (pron as LmState + 1, score)
        }
    }

    fn lookahead_max(&self, state: LmState, lo: PronId, hi: PronId) -> f32 {
        let mut best = LZERO_F;
        for p in lo..=hi.min(self.n_prons.saturating_sub(1)) {
            let (_, s) = self.trans_prob(state, p);
            if s > best {
                best = s;
            }
        }
        best
    }

    fn fast_state(&self, _state: LmState) -> LmState {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_lm() -> BigramLm {
        let mut lm = BigramLm::uniform(3);
        lm.set_unigram(0, -1.0);
        lm.set_unigram(1, -2.0);
        lm.set_unigram(2, -3.0);
        lm.set_bigram(0, 1, -0.5); // P(1 | <s>)
        lm.set_bigram(2, 2, -0.25); // P(2 | 1)
        lm
    }

    #[test]
    fn bigram_beats_backoff() {
        let lm = small_lm();
        let (dest, p) = lm.trans_prob(0, 1);
        assert_eq!(dest, 2);
        assert!((p - (-0.5)).abs() < 1e-6);

        // no bigram for (0, 2): back-off to the unigram
        let (dest, p) = lm.trans_prob(0, 2);
        assert_eq!(dest, 3);
        assert!((p - (-3.0)).abs() < 1e-6);
    }

    #[test]
    fn lookahead_max_is_the_range_maximum() {
        let lm = small_lm();
        // from <s>: candidates are -1.0 (pron 0), -0.5 (pron 1), -3.0 (pron 2)
        assert!((lm.lookahead_max(0, 0, 2) - (-0.5)).abs() < 1e-6);
        assert!((lm.lookahead_max(0, 2, 2) - (-3.0)).abs() < 1e-6);
    }

    #[test]
    fn cache_hits_on_repeat_lookups() {
        let lm = small_lm();
        let mut tree = LmlaTree::new();
        let idx = tree.push_range(0, 2);
        let mut cache = LmCache::new(tree.n_entries());

        let a = cache.lookahead(&lm, &tree, 2.0, 0, idx, false);
        let b = cache.lookahead(&lm, &tree, 2.0, 0, idx, false);
        assert_eq!(a, b);
        assert!((a - (-1.0)).abs() < 1e-6); // 2.0 * -0.5
        assert_eq!(cache.la_hits, 1);
        assert_eq!(cache.la_misses, 1);
    }

    #[test]
    fn cache_ring_evicts_oldest() {
        let lm = small_lm();
        let mut tree = LmlaTree::new();
        let idx = tree.push_range(0, 2);
        let mut cache = LmCache::new(tree.n_entries());

        // fill the ring past capacity with distinct states
        for st in 0..=(NODE_CACHE_WAYS as u64) {
            cache.lookahead(&lm, &tree, 1.0, st, idx, false);
        }
        let misses = cache.la_misses;
        // state 0 was evicted: looking it up again must miss
        cache.lookahead(&lm, &tree, 1.0, 0, idx, false);
        assert_eq!(cache.la_misses, misses + 1);
    }

    #[test]
    fn composite_entries_take_the_max_of_parts() {
        let lm = small_lm();
        let mut tree = LmlaTree::new();
        let a = tree.push_range(0, 0);
        let b = tree.push_range(2, 2);
        tree.comp.push(CompLmlaNode { parts: vec![a, b] });
        let comp_idx = (tree.nodes.len() + tree.comp.len() - 1) as u32;

        let mut cache = LmCache::new(tree.n_entries());
        let got = cache.lookahead(&lm, &tree, 1.0, 0, comp_idx, false);
        assert!((got - (-1.0)).abs() < 1e-6);
    }

    #[test]
    fn fast_state_collapses_history() {
        let lm = small_lm();
        assert_eq!(lm.fast_state(7), 0);
    }

    #[test]
    fn bincode_roundtrip() {
        let lm = small_lm();
        let tmp = std::env::temp_dir().join("librecog_bigram_test.bin");
        lm.save_bincode(&tmp).unwrap();
        let back = BigramLm::load_bincode(&tmp).unwrap();
        let _ = std::fs::remove_file(&tmp);
        assert_eq!(back.trans_prob(0, 1), lm.trans_prob(0, 1));
    }
}
