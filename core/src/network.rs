// core/src/network.rs
//
// Static recognition network: HMM inventory and the tree-structured lexicon
// the decoder scans. The network is built (or loaded) once per recognition
// setup by an external collaborator; the decoder only consumes it. Nodes
// are partitioned into layers with a fixed scan order; the special layer
// ids (silence, word end, cross-word junctions, sp-skip) are declared
// explicitly by the builder rather than inferred from the graph shape.

use crate::dict::PronId;
use crate::lm::LmlaTree;
use crate::math::LSMALL_F;
use anyhow::{bail, Result};

pub type NodeId = u32;
pub type HmmId = u32;

/// One hidden Markov model. States are numbered `0..n_states` with 0 the
/// non-emitting entry and `n_states - 1` the non-emitting exit.
#[derive(Debug, Clone)]
pub struct Hmm {
    pub name: String,
    pub n_states: usize,
    /// Log transition probabilities, `trans[i][j]`.
    pub trans: Vec<Vec<f32>>,
    /// Acoustic state index for each emitting state `1..n_states-1`.
    pub states: Vec<u32>,
    /// Monophone index within the owning set.
    pub phone: u16,
    /// Strictly left-to-right topology (self-loop and +1 only), which
    /// enables the single-pass internal propagation.
    pub lr: bool,
}

impl Hmm {
    /// Direct entry-to-exit transition of a tee model, if present.
    pub fn tee_prob(&self) -> Option<f32> {
        let p = self.trans[0][self.n_states - 1];
        if p > LSMALL_F {
            Some(p)
        } else {
            None
        }
    }
}

/// Only self-loops and +1 transitions (the entry may additionally carry a
/// tee transition, which is handled during external propagation).
fn is_left_to_right(trans: &[Vec<f32>]) -> bool {
    let n = trans.len();
    for (r, row) in trans.iter().enumerate().take(n - 1) {
        for (c, &p) in row.iter().enumerate() {
            if p <= LSMALL_F {
                continue;
            }
            let ok = if r == 0 {
                c == 1 || c == n - 1
            } else {
                c == r || c == r + 1
            };
            if !ok {
                return false;
            }
        }
    }
    true
}

/// Model inventory with a monophone table for posterior estimation.
#[derive(Debug, Clone, Default)]
pub struct HmmSet {
    pub hmms: Vec<Hmm>,
    pub phones: Vec<String>,
    pub max_states: usize,
}

impl HmmSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model. `trans` must be a square matrix of log
    /// probabilities and `states` one acoustic state per emitting state.
    pub fn add_hmm(
        &mut self,
        name: &str,
        trans: Vec<Vec<f32>>,
        states: Vec<u32>,
        phone: &str,
    ) -> Result<HmmId> {
        let n = trans.len();
        if n < 2 {
            bail!("model '{}' needs at least entry and exit states", name);
        }
        if trans.iter().any(|row| row.len() != n) {
            bail!("model '{}' has a non-square transition matrix", name);
        }
        if states.len() != n - 2 {
            bail!(
                "model '{}' has {} emitting states but {} acoustic state indices",
                name,
                n - 2,
                states.len()
            );
        }

        let phone_idx = match self.phones.iter().position(|p| p == phone) {
            Some(i) => i as u16,
            None => {
                self.phones.push(phone.to_string());
                (self.phones.len() - 1) as u16
            }
        };

        let lr = is_left_to_right(&trans);
        let id = self.hmms.len() as HmmId;
        self.max_states = self.max_states.max(n);
        self.hmms.push(Hmm {
            name: name.to_string(),
            n_states: n,
            trans,
            states,
            phone: phone_idx,
            lr,
        });
        Ok(id)
    }

    pub fn hmm(&self, id: HmmId) -> &Hmm {
        &self.hmms[id as usize]
    }

    pub fn n_phones(&self) -> usize {
        self.phones.len()
    }
}

/// The three node variants of the lexicon network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Owns an HMM; the only multi-state variant.
    Model(HmmId),
    /// Fan-in/fan-out junction, single state.
    Context,
    /// Terminates a word with the given pronunciation, single state.
    WordEnd(PronId),
}

#[derive(Debug, Clone)]
pub struct LexNode {
    pub kind: NodeKind,
    pub foll: Vec<NodeId>,
    /// Lookahead index into the network's [`LmlaTree`]; 0 disables
    /// lookahead at this node.
    pub lmla_idx: u32,
}

/// Declared layer structure. `order` fixes the per-frame scan order; the
/// named ids select the layers with special handling.
#[derive(Debug, Clone, Default)]
pub struct LexLayers {
    pub order: Vec<Vec<NodeId>>,
    /// Silence-model layer (source of forced lattice output).
    pub sil: usize,
    /// Word-end layer subject to the word-end beam.
    pub we: usize,
    /// Layer at which word boundary records are re-stamped.
    pub we_update: usize,
    /// Cross-word A-B junction layer.
    pub ab: usize,
    /// B-Y layer (within-tree entry; token sets re-sort here).
    pub by: usize,
    /// Z-S junction layer, subject to the Z/S beam.
    pub zs: usize,
    /// S-A junction layer, subject to the Z/S beam.
    pub sa: usize,
    /// Pronunciation-variant fan-out layer of silence dictionaries.
    pub sp_skip: Option<usize>,
}

/// Static lexicon network plus everything the decoder needs to know about
/// it: scan layers, entry/exit nodes, sentence-end targets and the
/// LM-lookahead tree.
#[derive(Debug, Clone)]
pub struct LexNet {
    pub nodes: Vec<LexNode>,
    pub layers: LexLayers,
    /// Layer of each node, derived from `layers.order`.
    pub layer_of: Vec<u16>,
    pub start: NodeId,
    pub end: NodeId,
    /// Pronunciation of the sentence-start word.
    pub start_pron: PronId,
    /// Pronunciation of the sentence-end word.
    pub end_pron: PronId,
    /// The short-pause model, skipped by the `-` variant of silence
    /// dictionaries.
    pub hmm_sp: Option<HmmId>,
    /// Sentence-end entry points for the `sp` and `sil` variants.
    pub sent_end_sp: Option<NodeId>,
    pub sent_end_sil: Option<NodeId>,
    /// Successor of the sp-skip layer that leads towards the sentence end
    /// (declared, never inferred from the graph shape).
    pub sent_end_junction: Option<NodeId>,
    pub lmla: LmlaTree,
    /// Provenance recorded in lattice headers.
    pub vocab_file: Option<String>,
    pub hmm_file: Option<String>,
}

impl LexNet {
    pub fn new(n_layers: usize) -> Self {
        LexNet {
            nodes: Vec::new(),
            layers: LexLayers {
                order: vec![Vec::new(); n_layers],
                ..Default::default()
            },
            layer_of: Vec::new(),
            start: 0,
            end: 0,
            start_pron: 0,
            end_pron: 0,
            hmm_sp: None,
            sent_end_sp: None,
            sent_end_sil: None,
            sent_end_junction: None,
            lmla: LmlaTree::new(),
            vocab_file: None,
            hmm_file: None,
        }
    }

    /// Append a node to a layer and return its id.
    pub fn add_node(&mut self, layer: usize, kind: NodeKind, lmla_idx: u32) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(LexNode {
            kind,
            foll: Vec::new(),
            lmla_idx,
        });
        self.layers.order[layer].push(id);
        id
    }

    pub fn link(&mut self, from: NodeId, to: NodeId) {
        self.nodes[from as usize].foll.push(to);
    }

    pub fn node(&self, id: NodeId) -> &LexNode {
        &self.nodes[id as usize]
    }

    pub fn n_layers(&self) -> usize {
        self.layers.order.len()
    }

    /// Derive `layer_of` and check referential integrity against the model
    /// set. Must be called once the graph is complete.
    pub fn finish(&mut self, hmms: &HmmSet) -> Result<()> {
        self.layer_of = vec![u16::MAX; self.nodes.len()];
        for (l, layer) in self.layers.order.iter().enumerate() {
            for &id in layer {
                if id as usize >= self.nodes.len() {
                    bail!("layer {} refers to unknown node {}", l, id);
                }
                if self.layer_of[id as usize] != u16::MAX {
                    bail!("node {} assigned to two layers", id);
                }
                self.layer_of[id as usize] = l as u16;
            }
        }
        if let Some(unassigned) = self.layer_of.iter().position(|&l| l == u16::MAX) {
            bail!("node {} belongs to no layer", unassigned);
        }

        for (id, node) in self.nodes.iter().enumerate() {
            if let NodeKind::Model(h) = node.kind {
                if h as usize >= hmms.hmms.len() {
                    bail!("node {} refers to unknown model {}", id, h);
                }
            }
            for &f in &node.foll {
                if f as usize >= self.nodes.len() {
                    bail!("node {} has dangling successor {}", id, f);
                }
            }
            if node.lmla_idx as usize >= self.lmla.n_entries() {
                bail!("node {} has lookahead index out of range", id);
            }
        }
        if self.start as usize >= self.nodes.len() || self.end as usize >= self.nodes.len() {
            bail!("start or end node out of range");
        }
        Ok(())
    }
}
