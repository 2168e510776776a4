// core/src/traceback.rs
//
// Traceback records, their garbage collector and the readers that turn the
// record graph into a 1-best transcription or a word lattice.
//
// Records live in typed arenas and reference each other through 32-bit
// handles; a record stays alive only while some live token can still reach
// it. The collector marks from every token of every live instance into the
// arenas' sidecar bitmaps and sweeps unmarked slots back to the free lists.

use crate::decoder::Decoder;
use crate::dict::{PronId, VAR_NONE};
use crate::lattice::{AlignEntry, Lattice};
use crate::math::{LSMALL_F, LZERO_F};
use crate::network::{NodeId, NodeKind};
use crate::token::TokenSet;
use anyhow::{bail, Result};
use tracing::{debug, warn};

/// Word-end record: one crossed word boundary on some surviving path.
#[derive(Debug, Clone)]
pub struct WordEndHyp {
    pub prev: Option<u32>,
    pub pron: PronId,
    pub frame: i32,
    /// Cumulative path score at this boundary.
    pub score: f32,
    /// Scaled LM score of this transition, insertion penalty included.
    pub lm: f32,
    /// Boundary pronunciation variant (`-`, `sp`, `sil`).
    pub pron_var: u8,
    /// Lattice node number assigned during traversal; 0 = not visited.
    pub lat_node: u32,
    pub alt: Option<u32>,
    pub modpath: Option<u32>,
}

/// Alternative word-end: a recombination loser kept for the lattice.
/// `score` is a delta relative to the owning main hypothesis.
#[derive(Debug, Clone)]
pub struct AltWordEndHyp {
    pub prev: Option<u32>,
    pub score: f32,
    pub lm: f32,
    pub modpath: Option<u32>,
    pub next: Option<u32>,
}

/// Model-end record for per-model alignment.
#[derive(Debug, Clone)]
pub struct ModEndHyp {
    pub prev: Option<u32>,
    pub node: NodeId,
    pub frame: i32,
}

/// One label of a transcription.
#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub sym: String,
    pub start: f64,
    pub end: f64,
    pub score: f64,
}

/// The 1-best word sequence with times and per-word score increments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcription {
    pub labels: Vec<Label>,
}

impl Transcription {
    pub fn words(&self) -> Vec<&str> {
        self.labels.iter().map(|l| l.sym.as_str()).collect()
    }
}

impl Decoder {
    // ----- garbage collection -----

    /// Mark-and-sweep over the three traceback arenas. Roots are the tokens
    /// of every live instance; anything unreachable is returned to the free
    /// lists.
    pub fn collect_garbage(&mut self) {
        let mut we_roots: Vec<u32> = Vec::new();
        let mut mod_roots: Vec<u32> = Vec::new();
        for layer in &self.layer_insts {
            for &id in layer {
                let inst = self.insts.get(id);
                for ts in &inst.ts {
                    for tok in &ts.toks {
                        if let Some(p) = tok.path {
                            we_roots.push(p);
                        }
                        if let Some(m) = tok.modpath {
                            mod_roots.push(m);
                        }
                    }
                }
            }
        }

        let mut stack = we_roots;
        while let Some(p) = stack.pop() {
            if !self.paths.mark(p) {
                continue;
            }
            let rec = self.paths.get(p);
            if let Some(m) = rec.modpath {
                mod_roots.push(m);
            }
            if let Some(prev) = rec.prev {
                stack.push(prev);
            }
            let mut alt = rec.alt;
            while let Some(a) = alt {
                if !self.altpaths.mark(a) {
                    break;
                }
                let arec = self.altpaths.get(a);
                if let Some(m) = arec.modpath {
                    mod_roots.push(m);
                }
                if let Some(prev) = arec.prev {
                    stack.push(prev);
                }
                alt = arec.next;
            }
        }

        let mut m = mod_roots;
        while let Some(id) = m.pop() {
            let mut cur = Some(id);
            while let Some(c) = cur {
                if !self.modpaths.mark(c) {
                    break;
                }
                cur = self.modpaths.get(c).prev;
            }
        }

        let freed_we = self.paths.sweep();
        let freed_alt = self.altpaths.sweep();
        let freed_mod = self.modpaths.sweep();
        debug!(
            frame = self.frame,
            freed_we, freed_alt, freed_mod, "traceback garbage collected"
        );
    }

    // ----- 1-best traceback -----

    /// Best hypothesis at the end of the utterance. Prefers the sentence-end
    /// node; falls back to the best token set anywhere, and to an empty
    /// transcription when nothing survived.
    pub fn traceback(&self) -> Transcription {
        let located = self.locate_final_tok_set();
        let ts = match located {
            Some((inst, state)) => &self.insts.get(inst).ts[state],
            None => {
                warn!("no live token set anywhere; returning an empty transcription");
                return Transcription::default();
            }
        };

        let mut best_delta = LZERO_F;
        let mut best_tok = None;
        for tok in &ts.toks {
            if tok.delta > best_delta {
                best_delta = tok.delta;
                best_tok = Some(tok);
            }
        }
        let best_tok = match best_tok {
            Some(t) => t,
            None => return Transcription::default(),
        };
        debug_assert!(best_delta <= 0.1);

        let mut labels: Vec<Label> = Vec::new();
        let mut cur = best_tok.path;
        while let Some(id) = cur {
            let we = self.paths.get(id);
            let pron = self.dict.variant(we.pron, we.pron_var);
            labels.push(Label {
                sym: pron.out_sym.clone().unwrap_or_default(),
                start: 0.0,
                end: we.frame as f64 * self.frame_dur,
                score: we.score as f64,
            });
            cur = we.prev;
        }
        labels.reverse();

        // forward pass: starts from previous ends, scores to increments
        let mut start = 0.0;
        let mut prev_score = 0.0;
        for lab in &mut labels {
            lab.start = start;
            start = lab.end;
            let s = lab.score - prev_score;
            prev_score = lab.score;
            lab.score = s;
        }

        // words with an empty output symbol are deleted
        labels.retain(|l| !l.sym.is_empty());
        Transcription { labels }
    }

    fn locate_final_tok_set(&self) -> Option<(u32, usize)> {
        if let Some(end_inst) = self.end_inst() {
            if !self.insts.get(end_inst).ts[0].is_empty() {
                return Some((end_inst, 0));
            }
        }
        self.warn_no_sent_end();
        self.best_tok_set()
    }

    // ----- lattice construction -----

    /// Build the word lattice from the recorded word-end hypotheses.
    pub fn lattice_traceback(&mut self) -> Result<Lattice> {
        let sent_end = self.find_sentence_end()?;

        // number every reachable word-end record; node 0 is the !NULL start
        let mut visited: Vec<u32> = Vec::new();
        let mut n_nodes = 0u32;
        let mut n_links = 0usize;
        let mut stack = vec![sent_end];
        while let Some(id) = stack.pop() {
            if self.paths.get(id).lat_node != 0 {
                continue;
            }
            n_nodes += 1;
            self.paths.get_mut(id).lat_node = n_nodes;
            visited.push(id);

            let rec = self.paths.get(id);
            n_links += 1;
            if let Some(prev) = rec.prev {
                stack.push(prev);
            }
            let mut alt = rec.alt;
            while let Some(a) = alt {
                n_links += 1;
                let arec = self.altpaths.get(a);
                if let Some(prev) = arec.prev {
                    stack.push(prev);
                }
                alt = arec.next;
            }
        }
        debug!(n_nodes, n_links, "lattice traceback");

        let mut lat = Lattice::new();
        lat.lm_scale = self.prm.lm_scale as f64;
        lat.wd_penalty = self.prm.ins_pen as f64;
        lat.pr_scale = self.prm.pron_scale as f64;
        lat.frame_dur = self.frame_dur;
        lat.vocab = self.net.vocab_file.clone();
        lat.hmms = self.net.hmm_file.clone();

        lat.add_node(0.0, "!NULL", 0);
        for &id in &visited {
            let rec = self.paths.get(id);
            let pron = self.dict.variant(rec.pron, rec.pron_var);
            let node = lat.add_node(rec.frame as f64 * self.frame_dur, &pron.word, pron.pnum);
            debug_assert_eq!(node, self.paths.get(id).lat_node);
        }

        for &id in &visited {
            let rec = self.paths.get(id).clone();
            let end = rec.lat_node;
            let pron = self.dict.variant(rec.pron, rec.pron_var);
            let prlike = pron.prob as f64;

            let (start, prev_score, prev_frame) = match rec.prev {
                Some(p) => {
                    let prev = self.paths.get(p);
                    (prev.lat_node, prev.score, prev.frame)
                }
                None => (0, 0.0, 0),
            };
            let aclike =
                rec.score as f64 - prev_score as f64 - rec.lm as f64 - prlike * self.prm.pron_scale as f64;
            let lmlike = (rec.lm - self.prm.ins_pen) as f64 / self.prm.lm_scale as f64;
            let arc = lat.add_arc(start, end, aclike, lmlike, prlike);
            if self.opts.mod_align {
                lat.arcs[arc as usize].align = self.align_from_modpath(rec.modpath, prev_frame);
            }

            let mut alt = rec.alt;
            while let Some(a) = alt {
                let arec = self.altpaths.get(a).clone();
                let (start, prev_score, prev_frame) = match arec.prev {
                    Some(p) => {
                        let prev = self.paths.get(p);
                        (prev.lat_node, prev.score, prev.frame)
                    }
                    None => (0, 0.0, 0),
                };
                // alt scores are deltas against the main hypothesis
                let abs_score = rec.score as f64 + arec.score as f64;
                let aclike =
                    abs_score - prev_score as f64 - arec.lm as f64 - prlike * self.prm.pron_scale as f64;
                let lmlike = (arec.lm - self.prm.ins_pen) as f64 / self.prm.lm_scale as f64;
                let arc = lat.add_arc(start, end, aclike, lmlike, prlike);
                if self.opts.mod_align {
                    lat.arcs[arc as usize].align =
                        self.align_from_alt_modpath(arec.modpath, rec.modpath, prev_frame);
                }
                alt = arec.next;
            }
        }

        // clear the traversal numbers so a later traceback starts fresh
        for &id in &visited {
            self.paths.get_mut(id).lat_node = 0;
        }

        if self.opts.mod_align {
            self.check_alignment(&mut lat)?;
        }
        Ok(lat)
    }

    /// Locate (or fabricate) the word-end record the lattice ends in.
    fn find_sentence_end(&mut self) -> Result<u32> {
        if self.cfg.build_lat_sent_end {
            if let Some(end_inst) = self.end_inst() {
                let ts = &self.insts.get(end_inst).ts[0];
                if ts.toks.len() == 1 {
                    if let Some(p) = ts.toks[0].path {
                        return Ok(p);
                    }
                }
            }
            warn!("no single token in the sentence end; building from silence word ends");
        }

        if let Some(we) = self.build_lattice_from_sil()? {
            return Ok(we);
        }
        warn!("no live silence word ends");
        if self.cfg.force_lat_out {
            warn!("forcing lattice output from the best token set");
            if let Some(we) = self.build_forced_lattice()? {
                return Ok(we);
            }
        }
        bail!("no token survived to the sentence end and no fallback produced a lattice");
    }

    /// Sentence-end transition for one token: the LM step to the end
    /// pronunciation, packaged as an alternative word end.
    fn fake_sent_end_path(
        &self,
        tok: crate::token::RelToken,
        use_lm: bool,
    ) -> Option<AltWordEndHyp> {
        let lm_score = if use_lm {
            let (_, raw) = self.lm.trans_prob(tok.lm_state, self.net.end_pron);
            self.prm.lm_scale * raw
        } else {
            0.0
        };
        if lm_score <= LSMALL_F {
            return None;
        }
        let lm_score = lm_score + self.prm.ins_pen;
        Some(AltWordEndHyp {
            prev: tok.path,
            score: tok.delta + (lm_score - tok.lmscore),
            lm: lm_score,
            modpath: None,
            next: None,
        })
    }

    /// Combine a list of fabricated sentence-end alternatives into one main
    /// word-end hypothesis carrying the rest as its alternatives.
    fn alt_list_to_path(&mut self, mut alts: Vec<AltWordEndHyp>, pron: PronId) -> Option<u32> {
        if alts.is_empty() {
            return None;
        }
        let best = alts
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.score.partial_cmp(&b.1.score).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        let main = alts.swap_remove(best);
        let we = self.paths.alloc(WordEndHyp {
            prev: main.prev,
            pron,
            frame: self.frame,
            score: main.score,
            lm: main.lm,
            pron_var: VAR_NONE,
            lat_node: 0,
            alt: None,
            modpath: main.modpath,
        });
        let mut head: Option<u32> = None;
        for mut alt in alts {
            alt.score -= main.score;
            alt.next = head;
            head = Some(self.altpaths.alloc(alt));
        }
        self.paths.get_mut(we).alt = head;
        Some(we)
    }

    /// Build the sentence-end record from all token sets in the final state
    /// of the (non short-pause) silence-layer models.
    fn build_lattice_from_sil(&mut self) -> Result<Option<u32>> {
        let sil_layer = self.net.layers.sil;
        let ids = self.layer_insts[sil_layer].clone();
        let mut alts: Vec<AltWordEndHyp> = Vec::new();
        let mut sil_modend: Option<u32> = None;

        for id in ids {
            let node = self.insts.get(id).node;
            let hmm_id = match self.net.nodes[node as usize].kind {
                NodeKind::Model(h) => h,
                _ => continue,
            };
            if Some(hmm_id) == self.net.hmm_sp {
                continue;
            }
            let n = self.hmms.hmm(hmm_id).n_states;
            let toks = self.insts.get(id).ts[n - 1].toks.clone();
            let score = self.insts.get(id).ts[n - 1].score;

            for mut tok in toks {
                // re-stamp the path: boundary updates never ran on it
                if let Some(p) = tok.path {
                    let we = self.paths.get_mut(p);
                    we.score = score + tok.delta;
                    we.frame = self.frame - 1;
                }
                if self.opts.mod_align {
                    // drop the final silence entry; the token may still make
                    // it into the lattice through the sentence-end transition
                    if let Some(m) = tok.modpath {
                        if self.modpaths.get(m).node == node {
                            tok.modpath = self.modpaths.get(m).prev;
                        }
                    }
                    if let (Some(p), Some(m)) = (tok.path, tok.modpath) {
                        let frame = self.modpaths.get(m).frame;
                        let we = self.paths.get_mut(p);
                        we.frame = frame;
                        we.modpath = Some(m);
                    }
                    if sil_modend.is_none() {
                        sil_modend = Some(self.modpaths.alloc(ModEndHyp {
                            prev: None,
                            node,
                            frame: self.frame,
                        }));
                    }
                }
                if let Some(mut alt) = self.fake_sent_end_path(tok, true) {
                    alt.score += score;
                    alt.modpath = sil_modend;
                    alts.push(alt);
                }
            }
        }

        let end_pron = self.net.end_pron;
        let we = self.alt_list_to_path(alts, end_pron);
        if let (Some(we), Some(m)) = (we, sil_modend) {
            self.paths.get_mut(we).modpath = Some(m);
        }
        Ok(we)
    }

    /// Last-resort lattice: fabricate sentence-end transitions from the
    /// best token set anywhere, with an LM-free retry.
    fn build_forced_lattice(&mut self) -> Result<Option<u32>> {
        let (inst, state) = match self.best_tok_set() {
            Some(x) => x,
            None => return Ok(None),
        };
        let toks = self.insts.get(inst).ts[state].toks.clone();
        let score = self.insts.get(inst).ts[state].score;
        for tok in &toks {
            if let Some(p) = tok.path {
                let we = self.paths.get_mut(p);
                we.score = score + tok.delta;
                we.frame = self.frame - 1;
            }
        }

        let mut alts: Vec<AltWordEndHyp> = Vec::new();
        for &tok in &toks {
            if let Some(mut alt) = self.fake_sent_end_path(tok, true) {
                alt.score += score;
                alts.push(alt);
            }
        }
        if alts.is_empty() {
            warn!("no token survives a sentence-end LM transition; inserting LM-free arcs");
            for &tok in &toks {
                if let Some(mut alt) = self.fake_sent_end_path(tok, false) {
                    alt.score += score;
                    alts.push(alt);
                }
            }
        }
        let end_pron = self.net.end_pron;
        Ok(self.alt_list_to_path(alts, end_pron))
    }

    // ----- model alignment -----

    /// Alignment entries for a word, walking its model-end chain backwards.
    fn align_from_modpath(&self, modpath: Option<u32>, word_start: i32) -> Vec<AlignEntry> {
        let mut entries = Vec::new();
        let mut cur = modpath;
        while let Some(id) = cur {
            let rec = self.modpaths.get(id);
            if let NodeKind::Model(h) = self.net.nodes[rec.node as usize].kind {
                let start = match rec.prev {
                    Some(p) => self.modpaths.get(p).frame,
                    None => word_start,
                };
                entries.push(AlignEntry {
                    state: -1,
                    dur: (rec.frame - start) as f64 * self.frame_dur,
                    label: self.hmms.hmm(h).name.clone(),
                });
            }
            cur = rec.prev;
        }
        entries.reverse();
        entries
    }

    /// Alignment for an alternative arc: the shared head comes from the
    /// main chain up to its first word-end entry, the tail from the
    /// alternative's own chain.
    fn align_from_alt_modpath(
        &self,
        alt_mod: Option<u32>,
        main_mod: Option<u32>,
        word_start: i32,
    ) -> Vec<AlignEntry> {
        // does the main chain contain a word-end marker?
        let mut has_we = false;
        let mut cur = main_mod;
        while let Some(id) = cur {
            let rec = self.modpaths.get(id);
            if matches!(self.net.nodes[rec.node as usize].kind, NodeKind::WordEnd(_)) {
                has_we = true;
                break;
            }
            cur = rec.prev;
        }
        if !has_we {
            return self.align_from_modpath(alt_mod, word_start);
        }

        let mut entries = Vec::new();
        let mut cur = main_mod;
        let mut switched = false;
        while let Some(id) = cur {
            let rec = self.modpaths.get(id);
            match self.net.nodes[rec.node as usize].kind {
                NodeKind::Model(h) => {
                    let start = match rec.prev {
                        Some(p) => self.modpaths.get(p).frame,
                        None => word_start,
                    };
                    entries.push(AlignEntry {
                        state: -1,
                        dur: (rec.frame - start) as f64 * self.frame_dur,
                        label: self.hmms.hmm(h).name.clone(),
                    });
                    cur = rec.prev;
                }
                NodeKind::WordEnd(_) if !switched => {
                    // switch to the alternative's own history
                    cur = alt_mod;
                    switched = true;
                }
                _ => {
                    cur = rec.prev;
                }
            }
        }
        entries.reverse();
        entries
    }

    /// Validate arc alignments against node times; fabricate a silence
    /// entry for forced sentence-end arcs that never saw a model.
    fn check_alignment(&self, lat: &mut Lattice) -> Result<()> {
        for i in 0..lat.arcs.len() {
            if lat.arcs[i].align.is_empty() {
                if self.cfg.force_lat_out {
                    let dur = lat.nodes[lat.arcs[i].end as usize].time
                        - lat.nodes[lat.arcs[i].start as usize].time;
                    lat.arcs[i].align.push(AlignEntry {
                        state: -1,
                        dur,
                        label: "sil".to_string(),
                    });
                } else {
                    bail!("empty model alignment on arc {}", i);
                }
            }
            let arc_dur = lat.nodes[lat.arcs[i].end as usize].time
                - lat.nodes[lat.arcs[i].start as usize].time;
            let sum: f64 = lat.arcs[i].align.iter().map(|e| e.dur).sum();
            if (sum - arc_dur).abs() > self.frame_dur / 2.0 {
                warn!(
                    arc = i,
                    arc_dur, align_dur = sum, "alignment durations disagree with node times"
                );
            }
        }
        Ok(())
    }

    /// Inject a synthetic unreachable word-end record. Test instrumentation
    /// for the collector.
    #[doc(hidden)]
    pub fn inject_unreachable_wordend(&mut self) -> u32 {
        self.paths.alloc(WordEndHyp {
            prev: None,
            pron: 0,
            frame: self.frame,
            score: LZERO_F,
            lm: 0.0,
            pron_var: VAR_NONE,
            lat_node: 0,
            alt: None,
            modpath: None,
        })
    }

    /// Live and free slot counts of the word-end arena.
    pub fn wordend_arena_stats(&self) -> (usize, usize) {
        (self.paths.live_count(), self.paths.free_count())
    }
}

/// Free function used by tests and the confusion-network 1-best: walk a
/// token set and return the best token index.
pub fn best_token(ts: &TokenSet) -> Option<usize> {
    let mut best = None;
    let mut best_delta = LZERO_F;
    for (i, tok) in ts.toks.iter().enumerate() {
        if tok.delta > best_delta {
            best_delta = tok.delta;
            best = Some(i);
        }
    }
    best
}
