// core/src/decoder.rs
//
// The time-synchronous Viterbi engine: per-frame internal and external
// token propagation over the layered lexicon network, word-end handling
// with LM transitions, the five-beam pruning controller and phone
// posterior estimation. Traceback, lattice construction and garbage
// collection over the records produced here live in traceback.rs.

use crate::acoustic::{AcousticModel, AcousticScorer, Observation, Transform};
use crate::arena::Arena;
use crate::config::Config;
use crate::dict::{Dictionary, VAR_NONE, VAR_SIL, VAR_SP};
use crate::lm::{LangModel, LmCache};
use crate::math::{log_add, LSMALL_F, LZERO, LZERO_F};
use crate::network::{HmmSet, LexNet, NodeId, NodeKind};
use crate::token::{RelToken, TokenMerger, TokenSet};
use crate::traceback::{AltWordEndHyp, ModEndHyp, WordEndHyp};
use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Options fixed when the decoder is created.
#[derive(Debug, Clone)]
pub struct DecoderOpts {
    /// Maximum tokens per set (K).
    pub n_tok: usize,
    /// Record alternative word-end hypotheses for lattice generation.
    pub lat_gen: bool,
    /// Observation block size for the acoustic score cache.
    pub outp_block: usize,
    /// Estimate per-frame monophone posteriors.
    pub phone_post: bool,
    /// Record per-model alignment chains.
    pub mod_align: bool,
}

impl Default for DecoderOpts {
    fn default() -> Self {
        Self {
            n_tok: 32,
            lat_gen: true,
            outp_block: 8,
            phone_post: false,
            mod_align: false,
        }
    }
}

/// Per-utterance search parameters, passed to [`Decoder::init`]. All beam
/// widths are non-negative log-score widths.
#[derive(Debug, Clone)]
pub struct BeamParams {
    /// Sample period in 100 ns units; one frame per sample.
    pub sample_rate: f64,
    pub beam_width: f32,
    pub rel_beam_width: f32,
    pub we_beam_width: f32,
    pub zs_beam_width: f32,
    /// Target number of live model instances for histogram pruning;
    /// 0 disables it.
    pub max_model: usize,
    pub ins_pen: f32,
    pub ac_scale: f32,
    pub pron_scale: f32,
    pub lm_scale: f32,
    /// Delta width under which tokens use the coarsened fast LM state;
    /// `None` disables fast lookahead.
    pub fast_lmla_beam: Option<f32>,
}

impl Default for BeamParams {
    fn default() -> Self {
        Self {
            sample_rate: 100_000.0,
            beam_width: 200.0,
            rel_beam_width: 200.0,
            we_beam_width: 1.0e10,
            zs_beam_width: 1.0e10,
            max_model: 0,
            ins_pen: 0.0,
            ac_scale: 1.0,
            pron_scale: 1.0,
            lm_scale: 1.0,
            fast_lmla_beam: None,
        }
    }
}

/// A live activation of one lexicon node: one token set per HMM state for
/// model nodes, a single set otherwise.
#[derive(Debug, Clone)]
pub(crate) struct Instance {
    pub(crate) node: NodeId,
    pub(crate) ts: Vec<TokenSet>,
    pub(crate) best: f32,
}

impl Instance {
    fn placeholder() -> Self {
        Instance {
            node: u32::MAX,
            ts: Vec::new(),
            best: LZERO_F,
        }
    }
}

/// The decoding engine. Created once, reused across utterances by calling
/// [`Decoder::init`] before each one.
pub struct Decoder {
    pub(crate) hmms: Arc<HmmSet>,
    pub(crate) net: Arc<LexNet>,
    pub(crate) dict: Arc<Dictionary>,
    pub(crate) lm: Arc<dyn LangModel>,
    pub(crate) cfg: Config,
    pub(crate) opts: DecoderOpts,

    pub(crate) scorer: AcousticScorer,
    pub(crate) lm_cache: LmCache,
    pub(crate) merger: TokenMerger,

    pub(crate) prm: BeamParams,
    pub(crate) frame: i32,
    pub(crate) frame_dur: f64,
    obs: Vec<Observation>,

    pub(crate) insts: Arena<Instance>,
    pub(crate) node_inst: Vec<Option<u32>>,
    pub(crate) layer_insts: Vec<Vec<u32>>,

    pub(crate) paths: Arena<WordEndHyp>,
    pub(crate) altpaths: Arena<AltWordEndHyp>,
    pub(crate) modpaths: Arena<ModEndHyp>,

    pub(crate) best_score: f32,
    pub(crate) best_inst: Option<u32>,
    pub(crate) beam_limit: f32,
    cur_beam_width: f32,
    max_lmla: f32,

    temp_ts: Vec<TokenSet>,
    phone_post: Vec<f64>,
    phone_freq: Vec<u32>,
}

impl Decoder {
    /// Create a decoding engine over the given collaborators.
    pub fn new(
        acoustic: AcousticModel,
        hmms: Arc<HmmSet>,
        lm: Arc<dyn LangModel>,
        net: Arc<LexNet>,
        dict: Arc<Dictionary>,
        cfg: Config,
        opts: DecoderOpts,
    ) -> Result<Decoder> {
        if opts.n_tok == 0 {
            bail!("token set size must be at least 1");
        }
        for hmm in &hmms.hmms {
            for &s in &hmm.states {
                if s as usize >= acoustic.n_states() {
                    bail!(
                        "model '{}' refers to acoustic state {} of {}",
                        hmm.name,
                        s,
                        acoustic.n_states()
                    );
                }
            }
        }
        let n_phones = hmms.n_phones();
        let scorer = AcousticScorer::new(acoustic, opts.outp_block, cfg.pde);
        let lm_cache = LmCache::new(net.lmla.n_entries());
        let n_nodes = net.nodes.len();
        let n_layers = net.n_layers();
        let max_states = hmms.max_states.max(2);

        Ok(Decoder {
            hmms,
            net,
            dict,
            lm,
            cfg,
            merger: TokenMerger::new(opts.n_tok, 0.0),
            opts,
            scorer,
            lm_cache,
            prm: BeamParams::default(),
            frame: 0,
            frame_dur: 0.01,
            obs: Vec::new(),
            insts: Arena::new(),
            node_inst: vec![None; n_nodes],
            layer_insts: vec![Vec::new(); n_layers],
            paths: Arena::new(),
            altpaths: Arena::new(),
            modpaths: Arena::new(),
            best_score: LZERO_F,
            best_inst: None,
            beam_limit: LZERO_F,
            cur_beam_width: 0.0,
            max_lmla: 0.0,
            temp_ts: vec![TokenSet::new(); max_states],
            phone_post: vec![LZERO; n_phones + 1],
            phone_freq: vec![0; n_phones + 1],
        })
    }

    /// Drop all per-utterance state, keeping models and allocations.
    pub fn reset(&mut self) {
        for ni in &mut self.node_inst {
            *ni = None;
        }
        for layer in &mut self.layer_insts {
            layer.clear();
        }
        self.insts.reset();
        self.paths.reset();
        self.altpaths.reset();
        self.modpaths.reset();
        self.scorer.reset();
        self.lm_cache.reset();
        self.merger.reset_ids();
        self.frame = 0;
        self.best_score = LZERO_F;
        self.best_inst = None;
        self.beam_limit = LZERO_F;
    }

    /// Prepare for a new utterance: reset state, install the search
    /// parameters and seed the start node with the initial token.
    pub fn init(&mut self, prm: BeamParams) {
        self.reset();
        self.frame_dur = prm.sample_rate / 1.0e7;
        self.cur_beam_width = prm.beam_width;
        self.max_lmla = prm.lm_scale * self.cfg.max_lmla;
        self.merger.rel_beam = -prm.rel_beam_width;
        self.prm = prm;

        let start = self.net.start;
        let inst_id = self.activate_node(start);
        let id = self.merger.next_id();
        let initial = self.lm.initial();
        let inst = self.insts.get_mut(inst_id);
        inst.ts[0].score = 0.0;
        inst.ts[0].id = id;
        inst.ts[0].toks.push(RelToken::start(initial));
    }

    pub fn frame(&self) -> i32 {
        self.frame
    }

    pub fn best_score(&self) -> f32 {
        self.best_score
    }

    /// Per-frame normalised monophone log posteriors, indexed by the phone
    /// table of the model set (entry 0 is unused).
    pub fn phone_posteriors(&self) -> &[f64] {
        &self.phone_post
    }

    /// Number of live node instances.
    pub fn n_active(&self) -> usize {
        self.insts.live_count()
    }

    /// Current (dynamically adjusted) main beam width.
    pub fn cur_beam_width(&self) -> f32 {
        self.cur_beam_width
    }

    /// Validate the token-set invariants over every live instance: tokens
    /// strictly ordered by LM state, deltas non-positive modulo slack, and
    /// the cached instance best consistent with its token sets.
    pub fn check_invariants(&self) -> Result<()> {
        for layer in &self.layer_insts {
            for &id in layer {
                let inst = self.insts.get(id);
                let mut max_score = LZERO_F;
                let mut any = false;
                for ts in &inst.ts {
                    if ts.is_empty() {
                        continue;
                    }
                    any = true;
                    max_score = max_score.max(ts.score);
                    for w in ts.toks.windows(2) {
                        if w[0].lm_state >= w[1].lm_state {
                            bail!("token order violated in node {}", inst.node);
                        }
                    }
                    for tok in &ts.toks {
                        if tok.delta > 0.01 {
                            bail!(
                                "positive token delta {} in node {}",
                                tok.delta,
                                inst.node
                            );
                        }
                    }
                }
                if any && inst.best > LZERO_F && (inst.best - max_score).abs() > 0.01 {
                    // the cached best may only exceed token scores after a
                    // lookahead renormalisation lowered the entry set
                    if inst.best < max_score - 0.01 {
                        bail!(
                            "instance best {} below its best token set {} in node {}",
                            inst.best,
                            max_score,
                            inst.node
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Advance the search by one frame. `obs_block` holds the current
    /// observation followed by up to `outp_block - 1` future ones.
    pub fn process_frame(
        &mut self,
        obs_block: &[Observation],
        xform: Option<&Transform>,
    ) -> Result<()> {
        if obs_block.is_empty() {
            bail!("empty observation block");
        }
        if let Some(dim) = self.scorer.model().dim() {
            for ob in obs_block {
                if ob.features.len() != dim {
                    bail!(
                        "observation size {} does not match model dimension {}",
                        ob.features.len(),
                        dim
                    );
                }
            }
        }
        self.obs.clear();
        match xform {
            Some(t) => {
                for ob in obs_block {
                    self.obs.push(Observation::new(t.apply(&ob.features)));
                }
            }
            None => self.obs.extend_from_slice(obs_block),
        }

        self.best_score = LZERO_F;
        self.best_inst = None;
        self.frame += 1;

        if self.cfg.gc_freq > 0 && self.frame as u32 % self.cfg.gc_freq == 0 {
            self.collect_garbage();
        }

        // internal pass
        for l in 0..self.layer_insts.len() {
            let ids = self.layer_insts[l].clone();
            for id in ids {
                let node = self.insts.get(id).node;
                match self.net.nodes[node as usize].kind {
                    NodeKind::Model(_) => self.propagate_internal(id),
                    _ => {
                        let inst = self.insts.get_mut(id);
                        inst.ts[0].clear();
                        inst.best = LZERO_F;
                    }
                }
            }
        }

        self.beam_limit = self.best_score - self.cur_beam_width;
        trace!(
            frame = self.frame,
            best = self.best_score,
            beam_limit = self.beam_limit,
            "internal pass done"
        );

        // external pass with layer-local pruning
        for l in 0..self.layer_insts.len() {
            let mut ids = std::mem::take(&mut self.layer_insts[l]);

            if l == self.net.layers.we_update {
                for &id in &ids {
                    self.update_wordend_hyps(id);
                }
            }

            let mut layer_beam = self.beam_limit;
            let we_layer_pruned =
                self.prm.we_beam_width < self.prm.beam_width && l == self.net.layers.we;
            if we_layer_pruned {
                let mut best_we = LZERO_F;
                let mut kept = Vec::with_capacity(ids.len());
                for id in ids {
                    if self.insts.get(id).best < self.beam_limit {
                        self.deactivate_node(id);
                        continue;
                    }
                    self.handle_wordend(id);
                    best_we = best_we.max(self.insts.get(id).best);
                    kept.push(id);
                }
                ids = kept;
                layer_beam = (best_we - self.prm.we_beam_width).max(self.beam_limit);
            } else if self.prm.zs_beam_width < self.prm.beam_width
                && (l == self.net.layers.zs || l == self.net.layers.sa)
            {
                let mut best = LZERO_F;
                for &id in &ids {
                    best = best.max(self.insts.get(id).best);
                }
                layer_beam = (best - self.prm.zs_beam_width).max(self.beam_limit);
            }

            let mut kept = Vec::with_capacity(ids.len());
            for id in ids {
                let node = self.insts.get(id).node;
                let ln = &self.net.nodes[node as usize];
                let is_wordend = matches!(ln.kind, NodeKind::WordEnd(_));

                if !is_wordend && ln.lmla_idx != 0 && !self.insts.get(id).ts[0].is_empty() {
                    if self.insts.get(id).ts[0].score >= layer_beam {
                        self.update_lmla(id);
                    }
                    let inst = self.insts.get_mut(id);
                    if !inst.ts[0].is_empty() {
                        let score = inst.ts[0].score;
                        if score > inst.best {
                            inst.best = score;
                        }
                    }
                }

                if self.insts.get(id).best < layer_beam {
                    self.deactivate_node(id);
                    continue;
                }

                let sp_skip = self.dict.is_sil_dict()
                    && Some(l) == self.net.layers.sp_skip
                    && !self.insts.get(id).ts[0].is_empty();
                if sp_skip {
                    self.handle_sp_skip(id);
                } else {
                    let handle_we = !(self.prm.we_beam_width < self.prm.beam_width)
                        || l == self.net.layers.sil
                        || l == self.net.layers.ab;
                    self.propagate_external(id, handle_we, l == self.net.layers.by);
                }
                kept.push(id);
            }

            // instances activated into this layer during its own pass are
            // first processed next frame
            let newly = std::mem::take(&mut self.layer_insts[l]);
            kept.extend(newly);
            self.layer_insts[l] = kept;
        }

        if self.prm.max_model > 0 {
            self.max_model_prune();
        }
        self.beam_limit = self.best_score - self.cur_beam_width;

        if self.opts.phone_post {
            self.calc_phone_post();
        }
        Ok(())
    }

    pub(crate) fn take_inst(&mut self, id: u32) -> Instance {
        std::mem::replace(self.insts.get_mut(id), Instance::placeholder())
    }

    pub(crate) fn put_inst(&mut self, id: u32, inst: Instance) {
        *self.insts.get_mut(id) = inst;
    }

    /// Allocate and register an instance for a dormant node.
    fn activate_node(&mut self, node: NodeId) -> u32 {
        debug_assert!(self.node_inst[node as usize].is_none());
        let n = match self.net.nodes[node as usize].kind {
            NodeKind::Model(h) => self.hmms.hmm(h).n_states,
            _ => 1,
        };
        let id = self.insts.alloc(Instance {
            node,
            ts: vec![TokenSet::new(); n],
            best: LZERO_F,
        });
        self.node_inst[node as usize] = Some(id);
        let l = self.net.layer_of[node as usize] as usize;
        self.layer_insts[l].push(id);
        id
    }

    /// Free an instance; the caller removes it from its layer list.
    fn deactivate_node(&mut self, inst_id: u32) {
        let node = self.insts.get(inst_id).node;
        self.node_inst[node as usize] = None;
        self.insts.free(inst_id);
    }

    /// Within-model token propagation for one frame.
    fn propagate_internal(&mut self, inst_id: u32) {
        let mut inst = self.take_inst(inst_id);
        let hmms = self.hmms.clone();
        let hmm = match self.net.nodes[inst.node as usize].kind {
            NodeKind::Model(h) => hmms.hmm(h),
            _ => unreachable!("internal propagation on a single-state node"),
        };
        let n = hmm.n_states;
        let prune = if self.cfg.merge_tok_only {
            None
        } else {
            Some(self.beam_limit)
        };

        // main beam: clear sets that fell under last frame's limit
        for ts in inst.ts.iter_mut().take(n - 1) {
            if !ts.is_empty() && ts.score < self.beam_limit {
                ts.clear();
            }
        }

        let mut best = LZERO_F;
        if hmm.lr {
            // single backward pass over a strictly left-to-right topology:
            // forward merge before adding the self-loop keeps each set
            // one-frame consistent without a temporary array
            if n > 2 {
                inst.ts[n - 2].score += hmm.trans[n - 2][n - 2];
            }
            for i in (1..n.saturating_sub(2)).rev() {
                if !inst.ts[i].is_empty() {
                    let (a, b) = inst.ts.split_at_mut(i + 1);
                    self.merger.merge(&a[i], &mut b[0], hmm.trans[i][i + 1], prune);
                    inst.ts[i].score += hmm.trans[i][i];
                }
            }
            if !inst.ts[0].is_empty() && hmm.trans[0][1] > LSMALL_F {
                let (a, b) = inst.ts.split_at_mut(1);
                self.merger.merge(&a[0], &mut b[0], hmm.trans[0][1], prune);
            }

            for i in 1..n - 1 {
                if !inst.ts[i].is_empty() {
                    let outp =
                        self.scorer
                            .score(self.frame as i64, &self.obs, self.prm.ac_scale, hmm.states[i - 1]);
                    inst.ts[i].score += outp;
                    best = best.max(inst.ts[i].score);
                }
            }
            inst.best = best;

            inst.ts[0].clear();
            inst.ts[n - 1].clear();

            if n > 2 && !inst.ts[n - 2].is_empty() {
                // beam still refers to last frame's scores; this frame's
                // output probability is already in, so no pruning here
                let (a, b) = inst.ts.split_at_mut(n - 1);
                self.merger.merge(&a[n - 2], &mut b[0], hmm.trans[n - 2][n - 1], None);
            }
        } else {
            // general topology via a temporary token-set array
            let mut temp = std::mem::take(&mut self.temp_ts);
            for j in 1..n - 1 {
                temp[j].clear();
                temp[j].score = 0.0;
                for i in 0..n - 1 {
                    if !inst.ts[i].is_empty() && hmm.trans[i][j] > LSMALL_F {
                        self.merger.merge(&inst.ts[i], &mut temp[j], hmm.trans[i][j], prune);
                    }
                }
                if !temp[j].is_empty() {
                    let outp =
                        self.scorer
                            .score(self.frame as i64, &self.obs, self.prm.ac_scale, hmm.states[j - 1]);
                    temp[j].score += outp;
                }
            }

            inst.ts[0].clear();
            for j in 1..n - 1 {
                std::mem::swap(&mut inst.ts[j], &mut temp[j]);
                if !inst.ts[j].is_empty() {
                    best = best.max(inst.ts[j].score);
                }
            }
            inst.best = best;

            inst.ts[n - 1].clear();
            for i in 1..n - 1 {
                if !inst.ts[i].is_empty() && hmm.trans[i][n - 1] > LSMALL_F {
                    let (a, b) = inst.ts.split_at_mut(n - 1);
                    self.merger.merge(&a[i], &mut b[0], hmm.trans[i][n - 1], None);
                }
            }
            self.temp_ts = temp;
        }

        if best > self.best_score {
            self.best_score = best;
            self.best_inst = Some(inst_id);
        }
        self.put_inst(inst_id, inst);
    }

    /// Propagate a token set into the entry state of `node`, activating it
    /// if dormant, and refresh its LM lookahead when requested.
    fn prop_into_node(&mut self, ts: &TokenSet, node: NodeId, update_lmla: bool) {
        let inst_id = match self.node_inst[node as usize] {
            Some(id) => id,
            None => self.activate_node(node),
        };

        {
            let mut target = self.take_inst(inst_id);
            self.merger
                .merge(ts, &mut target.ts[0], 0.0, Some(self.beam_limit));
            self.put_inst(inst_id, target);
        }

        let ln = &self.net.nodes[node as usize];
        let has_lmla = !matches!(ln.kind, NodeKind::WordEnd(_)) && ln.lmla_idx != 0;
        if update_lmla && has_lmla {
            self.update_lmla(inst_id);
        }
        // best stays stale until the lookahead has been applied
        if !has_lmla || update_lmla {
            let inst = self.insts.get_mut(inst_id);
            if !inst.ts[0].is_empty() && inst.ts[0].score > inst.best {
                inst.best = inst.ts[0].score;
            }
        }
    }

    /// Token propagation out of a node: tee transitions, word-end handling,
    /// token-set pruning and fan-out to the successors.
    fn propagate_external(&mut self, inst_id: u32, handle_we: bool, within_tree: bool) {
        let node = self.insts.get(inst_id).node;
        let ln_kind = self.net.nodes[node as usize].kind;

        let exit = match ln_kind {
            NodeKind::Model(h) => {
                let hmm = self.hmms.clone();
                let hmm = hmm.hmm(h);
                let n = hmm.n_states;
                let mut inst = self.take_inst(inst_id);
                if let Some(tee) = hmm.tee_prob() {
                    if !inst.ts[0].is_empty() && inst.ts[0].score > self.beam_limit {
                        let (a, b) = inst.ts.split_at_mut(n - 1);
                        self.merger.merge(&a[0], &mut b[0], tee, Some(self.beam_limit));
                    }
                }
                self.put_inst(inst_id, inst);
                n - 1
            }
            NodeKind::WordEnd(_) => {
                if handle_we {
                    self.handle_wordend(inst_id);
                }
                let inst = self.insts.get_mut(inst_id);
                if inst.ts[0].score < self.beam_limit {
                    inst.ts[0].clear();
                    inst.best = LZERO_F;
                } else {
                    inst.best = inst.ts[0].score;
                }
                0
            }
            NodeKind::Context => {
                let inst = self.insts.get_mut(inst_id);
                if inst.ts[0].score < self.beam_limit {
                    inst.ts[0].clear();
                    inst.best = LZERO_F;
                } else {
                    inst.best = inst.ts[0].score;
                }
                0
            }
        };

        // relative beam over the interior and exit sets
        {
            let beam_limit = self.beam_limit;
            let mut inst = self.take_inst(inst_id);
            for i in 1..exit {
                if !inst.ts[i].is_empty() {
                    self.merger.prune(&mut inst.ts[i], beam_limit);
                }
            }
            if !inst.ts[exit].is_empty() {
                self.merger.prune(&mut inst.ts[exit], beam_limit);
            }
            self.put_inst(inst_id, inst);
        }

        let propagate = {
            let inst = self.insts.get(inst_id);
            !inst.ts[exit].is_empty() && inst.ts[exit].score > self.beam_limit
        };
        if propagate {
            let mut inst = self.take_inst(inst_id);
            if self.opts.mod_align {
                self.update_mod_paths(&mut inst.ts[exit], node);
            }
            let foll = self.net.nodes[node as usize].foll.clone();
            for f in foll {
                self.prop_into_node(&inst.ts[exit], f, within_tree);
            }
            self.put_inst(inst_id, inst);
        }
    }

    /// Append a model-end record to every token leaving `node`.
    fn update_mod_paths(&mut self, ts: &mut TokenSet, node: NodeId) {
        if matches!(self.net.nodes[node as usize].kind, NodeKind::Context) {
            return;
        }
        for tok in &mut ts.toks {
            let rec = self.modpaths.alloc(ModEndHyp {
                prev: tok.modpath,
                node,
                frame: self.frame,
            });
            tok.modpath = Some(rec);
        }
    }

    /// Refresh the LM lookahead of every token in the entry state of an
    /// instance, renormalising the set afterwards.
    fn update_lmla(&mut self, inst_id: u32) {
        let mut inst = self.take_inst(inst_id);
        let idx = self.net.nodes[inst.node as usize].lmla_idx;
        debug_assert!(idx != 0);
        let lm = self.lm.clone();
        let ts = &mut inst.ts[0];

        let mut best_delta = LZERO_F;
        for tok in &mut ts.toks {
            let lmscore = match self.prm.fast_lmla_beam {
                None => {
                    let s = self.lm_cache.lookahead(
                        lm.as_ref(),
                        &self.net.lmla,
                        self.prm.lm_scale,
                        tok.lm_state,
                        idx,
                        false,
                    );
                    debug_assert!(
                        s <= tok.lmscore + 0.1,
                        "lookahead rose from {} to {}",
                        tok.lmscore,
                        s
                    );
                    s
                }
                Some(width) => {
                    // a coarsened state may raise the estimate; keep the
                    // tighter stored value in that case
                    let s = self.lm_cache.lookahead(
                        lm.as_ref(),
                        &self.net.lmla,
                        self.prm.lm_scale,
                        tok.lm_state,
                        idx,
                        tok.delta < -width,
                    );
                    s.min(tok.lmscore)
                }
            };
            let lmscore = if lmscore > LSMALL_F && tok.lmscore - lmscore > self.max_lmla {
                tok.lmscore - self.max_lmla
            } else {
                lmscore
            };
            tok.delta += lmscore - tok.lmscore;
            tok.lmscore = lmscore;
            best_delta = best_delta.max(tok.delta);
        }

        debug_assert!(best_delta <= 0.1 || ts.toks.is_empty());
        if best_delta > LSMALL_F {
            for tok in &mut ts.toks {
                tok.delta -= best_delta;
            }
            ts.score += best_delta;
        } else {
            ts.clear();
            ts.score = LZERO_F;
        }
        self.put_inst(inst_id, inst);
    }

    /// Apply the LM transition and word-insertion penalty to every token in
    /// a word-end node, recombining tokens that reach the same successor LM
    /// state and emitting traceback records.
    pub(crate) fn handle_wordend(&mut self, inst_id: u32) {
        let mut inst = self.take_inst(inst_id);
        let pron = match self.net.nodes[inst.node as usize].kind {
            NodeKind::WordEnd(p) => p,
            _ => unreachable!("word-end handling on a non word-end node"),
        };
        let lm = self.lm.clone();
        let ts = &mut inst.ts[0];

        let delta_limit = (self.beam_limit - ts.score).max(self.merger.rel_beam);
        let mut new_toks: Vec<RelToken> = Vec::with_capacity(ts.toks.len());
        let mut best_delta = LZERO_F;

        for tok in &ts.toks {
            if tok.delta < delta_limit {
                continue;
            }
            let (dest, raw) = lm.trans_prob(tok.lm_state, pron);
            let lm_score = self.prm.lm_scale * raw + self.prm.ins_pen;
            if self.prm.fast_lmla_beam.is_none() {
                debug_assert!(
                    lm_score <= tok.lmscore + 0.1,
                    "LM transition {} exceeds lookahead {}",
                    lm_score,
                    tok.lmscore
                );
            }
            let new_delta = tok.delta + (lm_score - tok.lmscore);
            if new_delta < delta_limit {
                continue;
            }
            best_delta = best_delta.max(new_delta);
            let prev = tok.path;
            let modpath = tok.modpath;

            match new_toks.binary_search_by(|t| t.lm_state.cmp(&dest)) {
                Ok(j) => {
                    let winner = &mut new_toks[j];
                    let main_we = winner.path.expect("recombined token without a path");
                    if !self.opts.lat_gen {
                        if new_delta > winner.delta {
                            winner.delta = new_delta;
                            winner.lmscore = 0.0;
                            winner.modpath = modpath;
                            let score = ts.score + new_delta;
                            let we = self.paths.get_mut(main_we);
                            debug_assert_eq!(we.pron, pron);
                            we.prev = prev;
                            we.score = score;
                            we.lm = lm_score;
                            we.modpath = modpath;
                        }
                        // losing token is simply dropped
                    } else {
                        let alt = if new_delta > winner.delta {
                            // demote the current best path to an alternative
                            let score = ts.score + new_delta;
                            let (old_prev, old_score, old_lm, old_mod) = {
                                let we = self.paths.get(main_we);
                                (we.prev, we.score, we.lm, we.modpath)
                            };
                            winner.delta = new_delta;
                            winner.lmscore = 0.0;
                            winner.modpath = modpath;
                            let we = self.paths.get_mut(main_we);
                            debug_assert_eq!(we.pron, pron);
                            we.prev = prev;
                            we.score = score;
                            we.lm = lm_score;
                            we.modpath = modpath;
                            AltWordEndHyp {
                                prev: old_prev,
                                score: old_score,
                                lm: old_lm,
                                modpath: old_mod,
                                next: None,
                            }
                        } else {
                            AltWordEndHyp {
                                prev,
                                score: ts.score + new_delta,
                                lm: lm_score,
                                modpath,
                                next: None,
                            }
                        };
                        let alt_id = self.altpaths.alloc(alt);
                        let we = self.paths.get_mut(main_we);
                        self.altpaths.get_mut(alt_id).next = we.alt;
                        we.alt = Some(alt_id);
                    }
                }
                Err(j) => {
                    let we = self.paths.alloc(WordEndHyp {
                        prev,
                        pron,
                        frame: self.frame,
                        score: ts.score + new_delta,
                        lm: lm_score,
                        pron_var: VAR_NONE,
                        lat_node: 0,
                        alt: None,
                        modpath,
                    });
                    new_toks.insert(
                        j,
                        RelToken {
                            lm_state: dest,
                            delta: new_delta,
                            lmscore: 0.0,
                            path: Some(we),
                            modpath,
                        },
                    );
                }
            }
        }

        ts.toks = new_toks;
        if !ts.toks.is_empty() {
            if self.prm.fast_lmla_beam.is_none() {
                debug_assert!(best_delta <= 0.1);
            }
            debug_assert!(best_delta > LSMALL_F);
            for tok in &mut ts.toks {
                tok.delta -= best_delta;
                // convert the alternatives (attached this call, absolute)
                // to deltas against the main hypothesis
                let main_we = tok.path.expect("word-end token without path");
                let main_score = self.paths.get(main_we).score;
                let mut alt = self.paths.get(main_we).alt;
                while let Some(a) = alt {
                    let rec = self.altpaths.get_mut(a);
                    rec.score -= main_score;
                    debug_assert!(rec.score <= 0.1);
                    alt = rec.next;
                }
            }
            ts.score += best_delta;
            ts.id = self.merger.next_id();
        } else {
            ts.id = 0;
            ts.score = LZERO_F;
        }
        inst.best = ts.score;
        self.put_inst(inst_id, inst);
    }

    /// Re-stamp the word-end records of passing tokens with the current
    /// frame and score, so lattice nodes carry word boundary times.
    fn update_wordend_hyps(&mut self, inst_id: u32) {
        let mut inst = self.take_inst(inst_id);
        let ts = &mut inst.ts[0];
        for tok in &mut ts.toks {
            if let Some(old_id) = tok.path {
                let old = self.paths.get(old_id);
                if old.frame != self.frame || old.pron != self.net.start_pron {
                    let mut copy = old.clone();
                    copy.score = ts.score + tok.delta;
                    copy.frame = self.frame;
                    copy.modpath = tok.modpath;
                    tok.path = Some(self.paths.alloc(copy));
                }
            }
            if self.opts.mod_align {
                tok.modpath = None;
            }
        }
        self.put_inst(inst_id, inst);
    }

    /// Add scaled pronunciation-variant probabilities to a token set,
    /// stamping the variant into (copies of) the word-end records.
    fn add_pron_probs(&mut self, ts: &mut TokenSet, var: u8) {
        let mut best_delta = LZERO_F;
        for tok in &mut ts.toks {
            let path_id = tok.path.expect("pronunciation variant without a path");
            let base = self.paths.get(path_id).pron;
            let pron = self.dict.variant(base, var);
            tok.delta += self.prm.pron_scale * pron.prob;
            best_delta = best_delta.max(tok.delta);

            if self.paths.get(path_id).pron_var != var {
                let mut copy = self.paths.get(path_id).clone();
                copy.pron_var = var;
                tok.path = Some(self.paths.alloc(copy));
            }
        }
        for tok in &mut ts.toks {
            tok.delta -= best_delta;
        }
        ts.score += best_delta;
    }

    /// Pronunciation-variant fan-out of silence dictionaries: propagate the
    /// `-` variant around the short-pause model, the `sp` and `sil`
    /// variants through it, and fork the sentence-end paths where the
    /// layer provides them.
    fn handle_sp_skip(&mut self, inst_id: u32) {
        let node = self.insts.get(inst_id).node;
        let foll = self.net.nodes[node as usize].foll.clone();

        if foll.len() == 1 {
            // no sentence-end path: `-` bypasses the sp model
            let sp_node = foll[0];
            debug_assert!(matches!(
                self.net.nodes[sp_node as usize].kind,
                NodeKind::Model(h) if Some(h) == self.net.hmm_sp
            ));
            debug_assert_eq!(self.net.nodes[sp_node as usize].foll.len(), 1);
            let bypass = self.net.nodes[sp_node as usize].foll[0];

            let entry = {
                let inst = self.take_inst(inst_id);
                let ts = inst.ts[0].clone();
                self.put_inst(inst_id, inst);
                ts
            };
            self.prop_into_node(&entry, bypass, false);

            if let Some(target) = self.node_inst[bypass as usize] {
                let mut t = self.take_inst(target);
                if !t.ts[0].is_empty() {
                    let mut ts = std::mem::take(&mut t.ts[0]);
                    self.put_inst(target, t);
                    self.add_pron_probs(&mut ts, VAR_NONE);
                    let mut t = self.take_inst(target);
                    t.ts[0] = ts;
                    self.put_inst(target, t);
                } else {
                    self.put_inst(target, t);
                }
            }

            let mut inst = self.take_inst(inst_id);
            let mut ts = std::mem::take(&mut inst.ts[0]);
            self.put_inst(inst_id, inst);
            self.add_pron_probs(&mut ts, VAR_SP);
            let mut inst = self.take_inst(inst_id);
            inst.ts[0] = ts;
            self.put_inst(inst_id, inst);
            self.propagate_external(inst_id, false, false);
        } else {
            // sentence-end fork: the declared junction successor leads to
            // the end of the utterance, the other continues the word loop
            debug_assert_eq!(foll.len(), 2);
            let junction = self.net.sent_end_junction;
            let sent_end_pos = foll
                .iter()
                .position(|&f| Some(f) == junction)
                .unwrap_or(0);

            let entry = {
                let inst = self.take_inst(inst_id);
                let ts = inst.ts[0].clone();
                self.put_inst(inst_id, inst);
                ts
            };

            let se_sp = self.net.sent_end_sp;
            let se_sil = self.net.sent_end_sil;
            let mut fork = |dec: &mut Decoder, var: u8, target: Option<NodeId>| {
                if let Some(target) = target {
                    let mut temp = TokenSet::new();
                    dec.merger.merge(&entry, &mut temp, 0.0, None);
                    dec.add_pron_probs(&mut temp, var);
                    if temp.score >= dec.beam_limit {
                        dec.prop_into_node(&temp, target, false);
                    }
                }
            };
            fork(self, VAR_NONE, Some(foll[sent_end_pos]));
            fork(self, VAR_SP, se_sp);
            fork(self, VAR_SIL, se_sil);

            // word loop continues with the sil variant
            let mut inst = self.take_inst(inst_id);
            let mut ts = std::mem::take(&mut inst.ts[0]);
            self.put_inst(inst_id, inst);
            self.add_pron_probs(&mut ts, VAR_SIL);
            if ts.score < self.beam_limit {
                ts.clear();
                let mut inst = self.take_inst(inst_id);
                inst.ts[0] = ts;
                self.put_inst(inst_id, inst);
            } else {
                let loop_foll = foll[1 - sent_end_pos];
                self.prop_into_node(&ts, loop_foll, false);
                let mut inst = self.take_inst(inst_id);
                inst.ts[0] = ts;
                self.put_inst(inst_id, inst);
            }
        }
    }

    /// Histogram pruning towards `max_model` live model instances: tighten
    /// the dynamic beam to the bin boundary that keeps the target count, or
    /// relax it multiplicatively when under target.
    fn max_model_prune(&mut self) {
        const BINS: usize = 128;
        let bin_width = self.cur_beam_width / BINS as f32;
        if bin_width <= 0.0 {
            return;
        }
        let mut hist = [0usize; BINS];
        let mut n_hist = 0usize;
        for layer in &self.layer_insts {
            for &id in layer {
                let best = self.insts.get(id).best;
                if best > LSMALL_F {
                    let bin = ((self.best_score - best) / bin_width) as usize;
                    if bin < BINS {
                        hist[bin] += 1;
                        n_hist += 1;
                    }
                }
            }
        }

        if n_hist > self.prm.max_model {
            let mut n_mod = 0usize;
            let mut i = 0usize;
            while n_mod < self.prm.max_model && i < BINS {
                n_mod += hist[i];
                i += 1;
            }
            let floor = self.cfg.max_ln_beam_floor * self.prm.beam_width;
            let tightened = (bin_width * (i - 1) as f32).max(floor);
            debug!(
                frame = self.frame,
                live = n_hist,
                beam = tightened,
                "histogram pruning tightened the beam"
            );
            self.cur_beam_width = tightened;
        } else {
            self.cur_beam_width =
                (self.cur_beam_width * self.cfg.dyn_beam_inc).min(self.prm.beam_width);
        }
    }

    /// Accumulate normalised per-monophone log posteriors over all live
    /// model-node tokens.
    fn calc_phone_post(&mut self) {
        for p in &mut self.phone_post {
            *p = LZERO;
        }
        for f in &mut self.phone_freq {
            *f = 0;
        }
        for layer in &self.layer_insts {
            for &id in layer {
                let inst = self.insts.get(id);
                let hmm = match self.net.nodes[inst.node as usize].kind {
                    NodeKind::Model(h) => self.hmms.hmm(h),
                    _ => continue,
                };
                let phone = hmm.phone as usize + 1;
                for ts in inst.ts.iter().take(hmm.n_states - 1).skip(1) {
                    for tok in &ts.toks {
                        self.phone_post[phone] =
                            log_add(self.phone_post[phone], (ts.score + tok.delta) as f64);
                        self.phone_freq[phone] += 1;
                    }
                }
            }
        }
        let sum = self.phone_post.iter().fold(LZERO, |a, &b| log_add(a, b));
        if sum > LZERO {
            for p in &mut self.phone_post {
                *p -= sum;
            }
        }
    }

    /// The best-scoring non-empty token set anywhere in the network, used
    /// as a fallback when nothing reached the sentence end.
    pub(crate) fn best_tok_set(&self) -> Option<(u32, usize)> {
        let inst_id = self.best_inst?;
        let inst = self.insts.get(inst_id);
        let mut best: Option<(u32, usize)> = None;
        let mut best_score = LZERO_F;
        for (i, ts) in inst.ts.iter().enumerate() {
            if !ts.is_empty() && ts.score > best_score {
                best_score = ts.score;
                best = Some((inst_id, i));
            }
        }
        best
    }

    /// Instance of the sentence-end node, if live.
    pub(crate) fn end_inst(&self) -> Option<u32> {
        self.node_inst[self.net.end as usize]
    }

    pub(crate) fn warn_no_sent_end(&self) {
        warn!(frame = self.frame, "no token survived to the sentence end");
    }
}
