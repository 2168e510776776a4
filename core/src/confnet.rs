// core/src/confnet.rs
//
// Confusion-network clustering: collapse a word lattice into a linear
// sequence of clusters ("sausage" bins), each holding a posterior
// distribution over competing words. Arc posteriors come from the lattice
// forward-backward pass; clusters merge in four passes (identical
// word/time triples, intra-word by time overlap, inter-word by phonetic
// similarity, and a final zero-overlap pass that makes the precedence
// relation total). Precedence is tracked as OR-accumulated bitvectors,
// never as pointer chains.

use crate::config::{Config, ConfMethod};
use crate::dict::Dictionary;
use crate::lattice::Lattice;
use crate::math::{log_add, log_sub, log_to_lin, LZERO};
use crate::traceback::{Label, Transcription};
use anyhow::{bail, Result};
use lru::LruCache;
use std::io::Write;
use std::num::NonZeroUsize;
use tracing::{debug, warn};

/// One competing word within a cluster.
#[derive(Debug, Clone)]
pub struct SCWord {
    pub word: String,
    /// Log posterior.
    pub post: f64,
    pub start: f64,
    pub end: f64,
}

/// A cluster of competing words with its precedence bitvector and the
/// doubly-linked list plumbing.
#[derive(Debug, Clone)]
pub struct SCluster {
    pub words: Vec<SCWord>,
    pred: Vec<u64>,
    pub start: f64,
    pub end: f64,
    alive: bool,
    prev: usize,
    next: usize,
}

const HEAD: usize = 0;
const TAIL: usize = 1;

/// The sausage: an ordered doubly-linked list of clusters (entries 0 and 1
/// are the head/tail sentinels) plus the bitvector width.
#[derive(Debug)]
pub struct ConfNet {
    clusters: Vec<SCluster>,
    n_clusters: usize,
    bv_width: usize,
    /// Cluster holding each lattice arc, used while deriving precedence.
    arc_cluster: Vec<usize>,
}

fn bv_set(bv: &mut [u64], bit: usize) {
    bv[bit / 64] |= 1 << (bit % 64);
}

fn bv_get(bv: &[u64], bit: usize) -> bool {
    bv[bit / 64] & (1 << (bit % 64)) != 0
}

fn bv_or(src: &[u64], dest: &mut [u64]) {
    for (d, s) in dest.iter_mut().zip(src) {
        *d |= s;
    }
}

/// Normalised time overlap of two intervals: intersection length over the
/// sum of both lengths; 0 when disjoint.
fn overlap(s1: f64, e1: f64, s2: f64, e2: f64) -> f64 {
    if e2 <= s1 || s2 >= e1 {
        return 0.0;
    }
    let norm = (e1 - s1) + (e2 - s2);
    if norm <= 0.0 {
        return 0.0;
    }
    (e1.min(e2) - s1.max(s2)) / norm
}

/// Weighted Levenshtein alignment cost between two phone sequences.
fn phone_align_cost(a: &[String], b: &[String], sub: i32, del: i32, ins: i32) -> i32 {
    let (n, m) = (a.len(), b.len());
    let mut prev: Vec<i32> = (0..=m as i32).map(|j| j * del).collect();
    let mut cur = vec![0i32; m + 1];
    for i in 1..=n {
        cur[0] = i as i32 * ins;
        for j in 1..=m {
            let d = prev[j - 1] + if a[i - 1] == b[j - 1] { 0 } else { sub };
            let h = prev[j] + ins;
            let v = cur[j - 1] + del;
            cur[j] = d.min(h).min(v);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[m]
}

/// Memoised phonetic similarity between words.
struct SimScorer<'a> {
    dict: &'a Dictionary,
    cache: LruCache<(String, String), f64>,
    sub: i32,
    del: i32,
    ins: i32,
}

impl<'a> SimScorer<'a> {
    fn new(dict: &'a Dictionary, cfg: &Config) -> Self {
        Self {
            dict,
            cache: LruCache::new(NonZeroUsize::new(4096).unwrap()),
            sub: cfg.sim_sub_pen,
            del: cfg.sim_del_pen,
            ins: cfg.sim_ins_pen,
        }
    }

    /// Similarity in [0, 1]: `1 - alignment_cost / (|a| + |b|)`.
    fn word_sim(&mut self, w1: &str, w2: &str) -> f64 {
        if w1 == w2 {
            return 1.0;
        }
        let key = if w1 < w2 {
            (w1.to_string(), w2.to_string())
        } else {
            (w2.to_string(), w1.to_string())
        };
        if let Some(&sim) = self.cache.get(&key) {
            return sim;
        }
        let sim = match (self.dict.phones_of(w1), self.dict.phones_of(w2)) {
            (Some(p1), Some(p2)) => {
                let cost = phone_align_cost(p1, p2, self.sub, self.del, self.ins) as f64;
                let dist = cost / (p1.len() + p2.len()) as f64;
                debug_assert!(dist <= 1.0 + 1e-9);
                1.0 - dist.min(1.0)
            }
            _ => {
                warn!(w1, w2, "no pronunciation for similarity scoring");
                1.0
            }
        };
        self.cache.put(key, sim);
        sim
    }

    /// Posterior-weighted average pairwise similarity of two clusters.
    fn cluster_sim(&mut self, c1: &SCluster, c2: &SCluster) -> f64 {
        let mut sum = 0.0;
        let mut n = 0usize;
        for w1 in &c1.words {
            for w2 in &c2.words {
                n += 1;
                sum += self.word_sim(&w1.word, &w2.word) * log_to_lin(w1.post) * log_to_lin(w2.post);
            }
        }
        if n == 0 {
            0.0
        } else {
            sum / n as f64
        }
    }
}

impl ConfNet {
    /// Cluster a lattice into a confusion network. The lattice is mutated:
    /// header weights are rescaled, acoustic likelihoods optionally
    /// clamped, pronunciation probabilities optionally re-derived and arc
    /// score slots overwritten with log posteriors.
    pub fn cluster(lat: &mut Lattice, dict: &Dictionary, cfg: &Config) -> Result<ConfNet> {
        if cfg.scale_lat_score <= 0.0 {
            bail!("lattice score scale must be positive");
        }
        lat.scale_scores(cfg.scale_lat_score as f64);
        if cfg.fix_pron_prob {
            lat.fix_pron_probs(dict)?;
        }
        if cfg.clamp_aclike {
            lat.clamp_aclike();
        }
        lat.check()?;
        lat.calc_posteriors()?;

        let mut cn = ConfNet::initial_clusters(lat);
        cn.calc_precedence(lat)?;
        cn.prune(-10.0);

        let mut sim = SimScorer::new(dict, cfg);
        debug!(clusters = cn.n_clusters, "intra-word clustering");
        cn.run_pass(2, &mut sim);
        cn.prune(cfg.conf_net_prune as f64);
        debug!(clusters = cn.n_clusters, "inter-word clustering");
        cn.run_pass(3, &mut sim);
        cn.run_pass(4, &mut sim);
        cn.sort_by_precedence();
        debug!(clusters = cn.n_clusters, "confusion network complete");
        Ok(cn)
    }

    /// One cluster per distinct (start, end, word) triple; coincident arcs
    /// have their posteriors summed.
    fn initial_clusters(lat: &Lattice) -> ConfNet {
        let mut order: Vec<usize> = (0..lat.arcs.len()).collect();
        order.sort_by(|&x, &y| {
            let (ax, ay) = (&lat.arcs[x], &lat.arcs[y]);
            let kx = (
                lat.nodes[ax.start as usize].time,
                lat.nodes[ax.end as usize].time,
            );
            let ky = (
                lat.nodes[ay.start as usize].time,
                lat.nodes[ay.end as usize].time,
            );
            kx.partial_cmp(&ky)
                .unwrap()
                .then_with(|| lat.nodes[ax.end as usize].word.cmp(&lat.nodes[ay.end as usize].word))
        });

        let sentinel = SCluster {
            words: Vec::new(),
            pred: Vec::new(),
            start: 0.0,
            end: 0.0,
            alive: false,
            prev: HEAD,
            next: TAIL,
        };
        let mut cn = ConfNet {
            clusters: vec![sentinel.clone(), sentinel],
            n_clusters: 0,
            bv_width: 0,
            arc_cluster: Vec::new(),
        };
        cn.clusters[HEAD].next = TAIL;
        cn.clusters[TAIL].prev = HEAD;

        // arc index -> cluster, aligned with the sort
        let mut arc_cluster = vec![usize::MAX; lat.arcs.len()];
        for &ai in &order {
            let arc = &lat.arcs[ai];
            let start = lat.nodes[arc.start as usize].time;
            let end = lat.nodes[arc.end as usize].time;
            let word = &lat.nodes[arc.end as usize].word;

            let last = cn.clusters[TAIL].prev;
            let mergeable = last >= 2 && {
                let c = &cn.clusters[last];
                c.words[0].start == start && c.words[0].end == end && &c.words[0].word == word
            };
            if mergeable {
                let c = &mut cn.clusters[last];
                c.words[0].post = log_add(c.words[0].post, arc.score);
                arc_cluster[ai] = last;
            } else {
                let id = cn.clusters.len();
                let prev = cn.clusters[TAIL].prev;
                cn.clusters.push(SCluster {
                    words: vec![SCWord {
                        word: word.clone(),
                        post: arc.score,
                        start,
                        end,
                    }],
                    pred: Vec::new(),
                    start,
                    end,
                    alive: true,
                    prev,
                    next: TAIL,
                });
                cn.clusters[prev].next = id;
                cn.clusters[TAIL].prev = id;
                cn.n_clusters += 1;
                arc_cluster[ai] = id;
            }
        }

        cn.bv_width = cn.clusters.len().div_ceil(64);
        for c in &mut cn.clusters[2..] {
            c.pred = vec![0u64; cn.bv_width];
        }
        cn.arc_cluster = arc_cluster;
        cn
    }

    /// Transitive predecessor sets, propagated along the lattice in
    /// topological order.
    fn calc_precedence(&mut self, lat: &Lattice) -> Result<()> {
        let order = lat.top_order()?;
        for &node in &order {
            for &a in &lat.nodes[node as usize].foll {
                let c = self.arc_cluster[a as usize];
                for &fa in &lat.nodes[lat.arcs[a as usize].end as usize].foll {
                    let fc = self.arc_cluster[fa as usize];
                    debug_assert_ne!(c, fc);
                    let mut pred = std::mem::take(&mut self.clusters[fc].pred);
                    bv_or(&self.clusters[c].pred, &mut pred);
                    bv_set(&mut pred, c);
                    self.clusters[fc].pred = pred;
                }
            }
        }
        Ok(())
    }

    fn active_ids(&self) -> Vec<usize> {
        let mut ids = Vec::with_capacity(self.n_clusters);
        let mut c = self.clusters[HEAD].next;
        while c != TAIL {
            ids.push(c);
            c = self.clusters[c].next;
        }
        ids
    }

    /// Remove clusters whose posterior falls below `thresh` (log domain).
    fn prune(&mut self, thresh: f64) {
        let ids = self.active_ids();
        let mut pruned = 0usize;
        for id in ids {
            let total = self.clusters[id]
                .words
                .iter()
                .fold(LZERO, |a, w| log_add(a, w.post));
            if total < thresh {
                self.unlink(id);
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!(pruned, thresh, "low-posterior clusters removed");
        }
    }

    fn unlink(&mut self, id: usize) {
        let (prev, next) = (self.clusters[id].prev, self.clusters[id].next);
        self.clusters[prev].next = next;
        self.clusters[next].prev = prev;
        self.clusters[id].alive = false;
        self.n_clusters -= 1;
    }

    fn ordered(&self, a: usize, b: usize) -> bool {
        bv_get(&self.clusters[a].pred, b) || bv_get(&self.clusters[b].pred, a)
    }

    /// Best mergeable pair for the given pass, or `None` when the pass has
    /// converged.
    fn best_candidate(&self, pass: u8, sim: &mut SimScorer) -> Option<(usize, usize, f64)> {
        let ids = self.active_ids();
        let mut best: Option<(usize, usize, f64)> = None;
        for (i, &c1) in ids.iter().enumerate() {
            for &c2 in &ids[i + 1..] {
                if pass == 2 && self.clusters[c1].words[0].word != self.clusters[c2].words[0].word {
                    continue;
                }
                let ov = overlap(
                    self.clusters[c1].start,
                    self.clusters[c1].end,
                    self.clusters[c2].start,
                    self.clusters[c2].end,
                );
                if (ov <= 0.0 && pass != 4) || self.ordered(c1, c2) {
                    continue;
                }
                let score = match pass {
                    2 => ov,
                    _ => sim.cluster_sim(&self.clusters[c1], &self.clusters[c2]),
                };
                if best.map(|(_, _, s)| score > s).unwrap_or(true) {
                    best = Some((c1, c2, score));
                }
            }
        }
        best
    }

    /// Repeatedly merge the best candidate pair of a clustering pass.
    fn run_pass(&mut self, pass: u8, sim: &mut SimScorer) {
        let merge_words = pass == 2;
        let mut merges = 0usize;
        while let Some((c1, c2, _)) = self.best_candidate(pass, sim) {
            self.merge_clusters(c1, c2, merge_words);
            merges += 1;
        }
        debug!(pass, merges, "clustering pass done");
    }

    /// Merge `c2` into `c1`: combine the word entries, OR the precedence
    /// vectors and push the combined predecessors to every successor of
    /// either cluster.
    fn merge_clusters(&mut self, c1: usize, c2: usize, merge_words: bool) {
        debug_assert!(c1 != c2 && !self.ordered(c1, c2));

        if merge_words {
            debug_assert_eq!(self.clusters[c1].words[0].word, self.clusters[c2].words[0].word);
            let p2 = self.clusters[c2].words[0].post;
            let w1 = &mut self.clusters[c1].words[0];
            w1.post = log_add(w1.post, p2);
        } else {
            let words = std::mem::take(&mut self.clusters[c2].words);
            self.clusters[c1].words.extend(words);
        }

        let pred2 = std::mem::take(&mut self.clusters[c2].pred);
        bv_or(&pred2, &mut self.clusters[c1].pred);
        self.clusters[c2].pred = pred2;

        // push the combined predecessor set to every successor of c1 or c2
        let ids = self.active_ids();
        for id in ids {
            if id == c1 || id == c2 {
                continue;
            }
            let succ_c1 = bv_get(&self.clusters[id].pred, c1);
            let succ_c2 = bv_get(&self.clusters[id].pred, c2);
            if succ_c1 || succ_c2 {
                let mut pred = std::mem::take(&mut self.clusters[id].pred);
                let combined = self.clusters[c1].pred.clone();
                bv_or(&combined, &mut pred);
                if succ_c2 {
                    bv_set(&mut pred, c1);
                }
                self.clusters[id].pred = pred;
            }
        }

        if self.clusters[c2].start < self.clusters[c1].start {
            self.clusters[c1].start = self.clusters[c2].start;
        }
        if self.clusters[c2].end > self.clusters[c1].end {
            self.clusters[c1].end = self.clusters[c2].end;
        }
        self.unlink(c2);
    }

    /// Relink the cluster list in precedence order. After the final pass
    /// the precedence relation restricted to surviving clusters is total,
    /// so the order is unique.
    fn sort_by_precedence(&mut self) {
        let mut ids = self.active_ids();
        if ids.len() <= 1 {
            return;
        }
        let clusters = &self.clusters;
        ids.sort_by(|&a, &b| {
            if bv_get(&clusters[a].pred, b) {
                std::cmp::Ordering::Greater
            } else if bv_get(&clusters[b].pred, a) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        });

        let mut prev = HEAD;
        for &id in &ids {
            self.clusters[prev].next = id;
            self.clusters[id].prev = prev;
            prev = id;
        }
        self.clusters[prev].next = TAIL;
        self.clusters[TAIL].prev = prev;
    }

    /// Number of surviving clusters.
    pub fn len(&self) -> usize {
        self.n_clusters
    }

    pub fn is_empty(&self) -> bool {
        self.n_clusters == 0
    }

    /// Surviving clusters in order.
    pub fn iter(&self) -> impl Iterator<Item = &SCluster> + '_ {
        let mut c = self.clusters[HEAD].next;
        std::iter::from_fn(move || {
            if c == TAIL {
                None
            } else {
                let cl = &self.clusters[c];
                c = cl.next;
                Some(cl)
            }
        })
    }

    /// Check that the precedence relation over survivors is a total order
    /// consistent with the list order.
    pub fn is_linear(&self) -> bool {
        let ids = self.active_ids();
        for (i, &a) in ids.iter().enumerate() {
            for &b in &ids[i + 1..] {
                if !bv_get(&self.clusters[b].pred, a) {
                    return false;
                }
            }
        }
        true
    }

    /// 1-best transcription: per cluster the highest-posterior word, unless
    /// deleting the cluster outright is more probable. Label times are the
    /// cluster bounds smoothed at the boundaries.
    pub fn transcription(&self, dict: &Dictionary) -> Transcription {
        let mut labels: Vec<Label> = Vec::new();
        for cluster in self.iter() {
            let mut logsum = LZERO;
            let mut best: Option<&SCWord> = None;
            for w in &cluster.words {
                logsum = log_add(logsum, w.post);
                if best.map(|b| w.post > b.post).unwrap_or(true) {
                    best = Some(w);
                }
            }
            let best = match best {
                Some(b) => b,
                None => continue,
            };
            let post = log_to_lin(best.post);
            // is the word more likely than deleting the whole cluster?
            if post > 1.0 - log_to_lin(logsum) {
                let out_sym = dict
                    .lookup(&best.word)
                    .first()
                    .and_then(|&id| dict.pron(id).out_sym.clone());
                if let Some(sym) = out_sym {
                    labels.push(Label {
                        sym,
                        start: cluster.start,
                        end: cluster.end,
                        score: post,
                    });
                }
            }
        }

        // smooth boundary times: butt each label against its neighbour
        let mut next_start = 0.0f64;
        for i in 0..labels.len() {
            labels[i].start = next_start;
            let following = if i + 1 < labels.len() {
                labels[i + 1].start
            } else {
                labels[i].end
            };
            labels[i].end = ((labels[i].end + following) / 2.0).max(labels[i].start);
            next_start = labels[i].end;
        }
        Transcription { labels }
    }

    /// Write the sausage in the plain-text field-per-line format: a count
    /// header, then per cluster a word count followed by one line per word.
    /// A residual null-word entry carries the missing probability mass when
    /// requested.
    pub fn write_scf<W: Write>(&self, out: &mut W, add_null_word: bool) -> Result<()> {
        writeln!(out, "N={}", self.n_clusters)?;
        for cluster in self.iter() {
            let sum = cluster
                .words
                .iter()
                .fold(LZERO, |a, w| log_add(a, w.post));
            let mut k = cluster.words.len();
            let residual = sum < 0.0 && add_null_word;
            if residual {
                k += 1;
            }
            writeln!(out, "k={}", k)?;
            for w in &cluster.words {
                writeln!(
                    out,
                    "W={:<19} s={:<7.2} e={:<7.2} p={:<9.5}",
                    w.word, w.start, w.end, w.post
                )?;
            }
            if residual {
                let first = &cluster.words[0];
                writeln!(
                    out,
                    "W={:<19} s={:<7.2} e={:<7.2} p={:<9.5}",
                    "!NULL",
                    first.start,
                    first.end,
                    log_sub(0.0, sum)
                )?;
            }
        }
        Ok(())
    }
}

/// Per-word confidence from time-dependent lattice posteriors: for each
/// label, combine the posteriors of arcs carrying the same word over the
/// frames the label spans, by geometric mean or maximum.
pub fn word_confidences(
    lat: &mut Lattice,
    trans: &mut Transcription,
    method: ConfMethod,
) -> Result<()> {
    lat.calc_posteriors()?;
    let frame_dur = lat.frame_dur;
    for lab in &mut trans.labels {
        let mut conf_sum = 0.0f64;
        let mut len = 0usize;
        let mut max_post = LZERO;
        let mut t = lab.start;
        while t <= lab.end {
            let mut post_cor = LZERO;
            for arc in &lat.arcs {
                let (s, e) = (
                    lat.nodes[arc.start as usize].time,
                    lat.nodes[arc.end as usize].time,
                );
                if s <= t && e > t && lat.nodes[arc.end as usize].word == lab.sym {
                    post_cor = log_add(post_cor, arc.score);
                }
            }
            if post_cor > LZERO {
                conf_sum += post_cor;
                len += 1;
            }
            max_post = max_post.max(post_cor);
            t += frame_dur;
        }
        lab.score = match method {
            ConfMethod::GeoMean => {
                if len > 0 {
                    log_to_lin(conf_sum / len as f64)
                } else {
                    0.0
                }
            }
            ConfMethod::Max => log_to_lin(max_post),
        };
    }
    Ok(())
}
