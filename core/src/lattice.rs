// core/src/lattice.rs
//
// Word lattices: the DAG of word hypotheses produced by the decoder and
// consumed by rescoring and confusion-network clustering. Nodes carry a
// time and the word ending at that point; arcs carry the acoustic, LM and
// pronunciation score components plus an optional model alignment.
// Includes the plain-text reader/writer and the forward-backward pass that
// turns arc scores into posteriors.

use crate::dict::Dictionary;
use crate::math::{log_add, LZERO};
use anyhow::{bail, Context, Result};
use std::io::{BufRead, Write};
use tracing::debug;

/// Per-model alignment entry on an arc.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignEntry {
    /// State index, -1 for whole-model entries.
    pub state: i32,
    /// Duration in seconds.
    pub dur: f64,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct LatNode {
    /// Word-end time in seconds.
    pub time: f64,
    pub word: String,
    /// Pronunciation variant number (1-based; 0 when unknown).
    pub variant: u16,
    pub foll: Vec<u32>,
    pub pred: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct LatArc {
    pub start: u32,
    pub end: u32,
    pub aclike: f64,
    pub lmlike: f64,
    pub prlike: f64,
    /// Scratch slot; holds the log posterior after `calc_posteriors`.
    pub score: f64,
    pub align: Vec<AlignEntry>,
}

/// Word lattice with the header fields carried to disk.
#[derive(Debug, Clone)]
pub struct Lattice {
    pub nodes: Vec<LatNode>,
    pub arcs: Vec<LatArc>,
    pub lm_scale: f64,
    pub wd_penalty: f64,
    pub pr_scale: f64,
    pub ac_scale: f64,
    /// Frame duration in seconds.
    pub frame_dur: f64,
    pub utterance: Option<String>,
    pub vocab: Option<String>,
    pub hmms: Option<String>,
}

impl Lattice {
    pub fn new() -> Self {
        Lattice {
            nodes: Vec::new(),
            arcs: Vec::new(),
            lm_scale: 1.0,
            wd_penalty: 0.0,
            pr_scale: 1.0,
            ac_scale: 1.0,
            frame_dur: 0.01,
            utterance: None,
            vocab: None,
            hmms: None,
        }
    }

    pub fn add_node(&mut self, time: f64, word: &str, variant: u16) -> u32 {
        self.nodes.push(LatNode {
            time,
            word: word.to_string(),
            variant,
            foll: Vec::new(),
            pred: Vec::new(),
        });
        (self.nodes.len() - 1) as u32
    }

    pub fn add_arc(
        &mut self,
        start: u32,
        end: u32,
        aclike: f64,
        lmlike: f64,
        prlike: f64,
    ) -> u32 {
        let id = self.arcs.len() as u32;
        self.arcs.push(LatArc {
            start,
            end,
            aclike,
            lmlike,
            prlike,
            score: 0.0,
            align: Vec::new(),
        });
        self.nodes[start as usize].foll.push(id);
        self.nodes[end as usize].pred.push(id);
        id
    }

    /// Combined arc log score under the header weights.
    pub fn arc_total(&self, arc: &LatArc) -> f64 {
        self.ac_scale * arc.aclike
            + self.lm_scale * arc.lmlike
            + self.pr_scale * arc.prlike
            + self.wd_penalty
    }

    /// Nodes in topological order. Fails on cyclic input.
    pub fn top_order(&self) -> Result<Vec<u32>> {
        let mut in_deg: Vec<usize> = self.nodes.iter().map(|n| n.pred.len()).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut queue: Vec<u32> = (0..self.nodes.len() as u32)
            .filter(|&n| in_deg[n as usize] == 0)
            .collect();
        while let Some(n) = queue.pop() {
            order.push(n);
            for &a in &self.nodes[n as usize].foll {
                let dst = self.arcs[a as usize].end as usize;
                in_deg[dst] -= 1;
                if in_deg[dst] == 0 {
                    queue.push(dst as u32);
                }
            }
        }
        if order.len() != self.nodes.len() {
            bail!("lattice contains a cycle");
        }
        Ok(order)
    }

    /// Basic structural checks: non-empty, unique entry and exit nodes,
    /// acyclic.
    pub fn check(&self) -> Result<()> {
        if self.nodes.is_empty() || self.arcs.is_empty() {
            bail!("empty lattice");
        }
        let starts = self.nodes.iter().filter(|n| n.pred.is_empty()).count();
        let ends = self.nodes.iter().filter(|n| n.foll.is_empty()).count();
        if starts != 1 || ends != 1 {
            bail!("lattice has {} entry and {} exit nodes", starts, ends);
        }
        self.top_order()?;
        Ok(())
    }

    /// Forward-backward over the lattice. Returns per-node alpha and beta
    /// plus the total data log likelihood `p(X) = alpha(end)`.
    pub fn forward_backward(&self) -> Result<(Vec<f64>, Vec<f64>, f64)> {
        let order = self.top_order()?;
        let n = self.nodes.len();
        let mut alpha = vec![LZERO; n];
        let mut beta = vec![LZERO; n];

        for &id in &order {
            let node = &self.nodes[id as usize];
            if node.pred.is_empty() {
                alpha[id as usize] = 0.0;
            }
            for &a in &node.foll {
                let arc = &self.arcs[a as usize];
                let v = alpha[id as usize] + self.arc_total(arc);
                let dst = arc.end as usize;
                alpha[dst] = log_add(alpha[dst], v);
            }
        }
        for &id in order.iter().rev() {
            let node = &self.nodes[id as usize];
            if node.foll.is_empty() {
                beta[id as usize] = 0.0;
            }
            for &a in &node.pred {
                let arc = &self.arcs[a as usize];
                let v = beta[id as usize] + self.arc_total(arc);
                let src = arc.start as usize;
                beta[src] = log_add(beta[src], v);
            }
        }

        let px = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.foll.is_empty())
            .fold(LZERO, |acc, (i, _)| log_add(acc, alpha[i]));
        if px <= LZERO {
            bail!("no path through the lattice");
        }
        Ok((alpha, beta, px))
    }

    /// Store normalised arc log posteriors in the arc score slots.
    pub fn calc_posteriors(&mut self) -> Result<f64> {
        let (alpha, beta, px) = self.forward_backward()?;
        for arc in &mut self.arcs {
            let total = self.ac_scale * arc.aclike
                + self.lm_scale * arc.lmlike
                + self.pr_scale * arc.prlike
                + self.wd_penalty;
            arc.score = alpha[arc.start as usize] + total + beta[arc.end as usize] - px;
        }
        debug!(px, n_arcs = self.arcs.len(), "lattice posteriors computed");
        Ok(px)
    }

    /// Clamp positive acoustic likelihoods to zero.
    pub fn clamp_aclike(&mut self) {
        let mut clamped = 0usize;
        for arc in &mut self.arcs {
            if arc.aclike > 0.0 {
                arc.aclike = 0.0;
                clamped += 1;
            }
        }
        if clamped > 0 {
            debug!(clamped, "positive acoustic likelihoods clamped");
        }
    }

    /// Replace arc pronunciation likelihoods with the dictionary values for
    /// the end node's word and variant.
    pub fn fix_pron_probs(&mut self, dict: &Dictionary) -> Result<()> {
        for i in 0..self.arcs.len() {
            let end = &self.nodes[self.arcs[i].end as usize];
            let ids = dict.lookup(&end.word);
            if ids.is_empty() {
                bail!("lattice word '{}' not in dictionary", end.word);
            }
            let pron = ids
                .iter()
                .map(|&id| dict.pron(id))
                .find(|p| p.pnum == end.variant)
                .unwrap_or_else(|| dict.pron(ids[0]));
            self.arcs[i].prlike = pron.prob as f64;
        }
        Ok(())
    }

    /// Multiply all header weights, rescaling every combined score.
    pub fn scale_scores(&mut self, k: f64) {
        self.lm_scale *= k;
        self.wd_penalty *= k;
        self.pr_scale *= k;
        self.ac_scale *= k;
    }

    /// Write in the field-per-line plain-text lattice format.
    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(out, "VERSION=1.0")?;
        if let Some(u) = &self.utterance {
            writeln!(out, "UTTERANCE={}", u)?;
        }
        writeln!(out, "lmscale={:.2} wdpenalty={:.2}", self.lm_scale, self.wd_penalty)?;
        writeln!(out, "prscale={:.2} acscale={:.2}", self.pr_scale, self.ac_scale)?;
        writeln!(out, "framedur={}", self.frame_dur)?;
        if let Some(v) = &self.vocab {
            writeln!(out, "vocab={}", v)?;
        }
        if let Some(h) = &self.hmms {
            writeln!(out, "hmms={}", h)?;
        }
        writeln!(out, "N={} L={}", self.nodes.len(), self.arcs.len())?;
        for (i, n) in self.nodes.iter().enumerate() {
            writeln!(out, "I={}\tt={:.2}", i, n.time)?;
        }
        for (j, a) in self.arcs.iter().enumerate() {
            let end = &self.nodes[a.end as usize];
            write!(
                out,
                "J={}\tS={}\tE={}\tW={}\tv={}\ta={:.4}\tl={:.4}\tr={:.4}",
                j, a.start, a.end, end.word, end.variant, a.aclike, a.lmlike, a.prlike
            )?;
            if !a.align.is_empty() {
                write!(out, "\td=")?;
                for e in &a.align {
                    write!(out, ":{},{:.2}", e.label, e.dur)?;
                }
            }
            writeln!(out)?;
        }
        Ok(())
    }

    /// Read a lattice written by [`Lattice::write`].
    pub fn read<R: BufRead>(input: R) -> Result<Lattice> {
        let mut lat = Lattice::new();
        let mut n_nodes = 0usize;
        let mut n_arcs = 0usize;

        for line in input.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields: Vec<(&str, &str)> = Vec::new();
            for tok in line.split_whitespace() {
                let (k, v) = tok
                    .split_once('=')
                    .with_context(|| format!("malformed lattice field '{}'", tok))?;
                fields.push((k, v));
            }
            match fields.first() {
                Some(&("VERSION", _)) => {}
                Some(&("UTTERANCE", u)) => lat.utterance = Some(u.to_string()),
                Some(&("lmscale", _)) | Some(&("prscale", _)) | Some(&("framedur", _)) => {
                    for &(k, v) in &fields {
                        match k {
                            "lmscale" => lat.lm_scale = v.parse()?,
                            "wdpenalty" => lat.wd_penalty = v.parse()?,
                            "prscale" => lat.pr_scale = v.parse()?,
                            "acscale" => lat.ac_scale = v.parse()?,
                            "framedur" => lat.frame_dur = v.parse()?,
                            _ => {}
                        }
                    }
                }
                Some(&("vocab", v)) => lat.vocab = Some(v.to_string()),
                Some(&("hmms", h)) => lat.hmms = Some(h.to_string()),
                Some(&("N", n)) => {
                    n_nodes = n.parse()?;
                    for (k, v) in &fields[1..] {
                        if *k == "L" {
                            n_arcs = v.parse()?;
                        }
                    }
                    lat.nodes.reserve(n_nodes);
                    lat.arcs.reserve(n_arcs);
                }
                Some(&("I", _)) => {
                    let mut time = 0.0f64;
                    for (k, v) in &fields[1..] {
                        if *k == "t" {
                            time = v.parse()?;
                        }
                    }
                    lat.add_node(time, "", 0);
                }
                Some(&("J", _)) => {
                    let (mut s, mut e) = (0u32, 0u32);
                    let (mut a, mut l, mut r) = (0.0f64, 0.0f64, 0.0f64);
                    let mut word = String::new();
                    let mut variant = 0u16;
                    let mut align = Vec::new();
                    for (k, v) in &fields[1..] {
                        match *k {
                            "S" => s = v.parse()?,
                            "E" => e = v.parse()?,
                            "W" => word = v.to_string(),
                            "v" => variant = v.parse()?,
                            "a" => a = v.parse()?,
                            "l" => l = v.parse()?,
                            "r" => r = v.parse()?,
                            "d" => {
                                for seg in v.split(':').filter(|s| !s.is_empty()) {
                                    let (label, dur) = seg
                                        .split_once(',')
                                        .with_context(|| format!("bad alignment '{}'", seg))?;
                                    align.push(AlignEntry {
                                        state: -1,
                                        dur: dur.parse()?,
                                        label: label.to_string(),
                                    });
                                }
                            }
                            _ => {}
                        }
                    }
                    if s as usize >= lat.nodes.len() || e as usize >= lat.nodes.len() {
                        bail!("arc references unknown node");
                    }
                    let arc = lat.add_arc(s, e, a, l, r);
                    lat.arcs[arc as usize].align = align;
                    lat.nodes[e as usize].word = word;
                    lat.nodes[e as usize].variant = variant;
                }
                _ => bail!("unrecognised lattice line '{}'", line),
            }
        }
        if lat.nodes.len() != n_nodes || lat.arcs.len() != n_arcs {
            bail!(
                "lattice declares {} nodes / {} arcs but contains {} / {}",
                n_nodes,
                n_arcs,
                lat.nodes.len(),
                lat.arcs.len()
            );
        }
        Ok(lat)
    }

    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let mut f = std::io::BufWriter::new(std::fs::File::create(path)?);
        self.write(&mut f)
    }

    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Lattice> {
        let f = std::io::BufReader::new(std::fs::File::open(path)?);
        Self::read(f)
    }
}

impl Default for Lattice {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::log_to_lin;

    /// start -> (a | b) -> end, equal scores.
    fn diamond() -> Lattice {
        let mut lat = Lattice::new();
        let s = lat.add_node(0.0, "!NULL", 0);
        let a = lat.add_node(0.5, "a", 1);
        let b = lat.add_node(0.5, "b", 1);
        let e = lat.add_node(1.0, "end", 1);
        lat.add_arc(s, a, -10.0, 0.0, 0.0);
        lat.add_arc(s, b, -10.0, 0.0, 0.0);
        lat.add_arc(a, e, -5.0, 0.0, 0.0);
        lat.add_arc(b, e, -5.0, 0.0, 0.0);
        lat
    }

    #[test]
    fn posteriors_split_evenly_on_symmetric_paths() {
        let mut lat = diamond();
        lat.calc_posteriors().unwrap();
        // the two parallel first arcs carry probability 0.5 each
        assert!((log_to_lin(lat.arcs[0].score) - 0.5).abs() < 1e-9);
        assert!((log_to_lin(lat.arcs[1].score) - 0.5).abs() < 1e-9);
        // posteriors over arcs crossing t=0.75 sum to one
        let sum: f64 = log_to_lin(lat.arcs[2].score) + log_to_lin(lat.arcs[3].score);
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn arc_total_applies_header_weights() {
        let mut lat = diamond();
        lat.lm_scale = 10.0;
        lat.wd_penalty = -1.0;
        let t = lat.arc_total(&LatArc {
            start: 0,
            end: 1,
            aclike: -2.0,
            lmlike: -0.5,
            prlike: -1.0,
            score: 0.0,
            align: Vec::new(),
        });
        assert!((t - (-2.0 - 5.0 - 1.0 - 1.0)).abs() < 1e-9);
    }

    #[test]
    fn top_order_respects_arcs() {
        let lat = diamond();
        let order = lat.top_order().unwrap();
        let pos: Vec<usize> = (0..4).map(|n| order.iter().position(|&x| x == n).unwrap()).collect();
        assert!(pos[0] < pos[1] && pos[0] < pos[2]);
        assert!(pos[1] < pos[3] && pos[2] < pos[3]);
    }

    #[test]
    fn cyclic_lattices_are_rejected() {
        let mut lat = Lattice::new();
        let a = lat.add_node(0.0, "a", 0);
        let b = lat.add_node(1.0, "b", 0);
        lat.add_arc(a, b, 0.0, 0.0, 0.0);
        lat.add_arc(b, a, 0.0, 0.0, 0.0);
        assert!(lat.top_order().is_err());
    }

    #[test]
    fn clamp_zeroes_positive_aclike() {
        let mut lat = diamond();
        lat.arcs[0].aclike = 1.5;
        lat.clamp_aclike();
        assert_eq!(lat.arcs[0].aclike, 0.0);
        assert_eq!(lat.arcs[2].aclike, -5.0);
    }

    #[test]
    fn write_read_roundtrip() {
        let mut lat = diamond();
        lat.lm_scale = 12.0;
        lat.utterance = Some("utt01".to_string());
        lat.arcs[0].align.push(AlignEntry {
            state: -1,
            dur: 0.25,
            label: "sil".to_string(),
        });

        let mut buf = Vec::new();
        lat.write(&mut buf).unwrap();
        let back = Lattice::read(std::io::Cursor::new(buf)).unwrap();

        assert_eq!(back.nodes.len(), 4);
        assert_eq!(back.arcs.len(), 4);
        assert!((back.lm_scale - 12.0).abs() < 1e-9);
        assert_eq!(back.utterance.as_deref(), Some("utt01"));
        assert_eq!(back.nodes[1].word, "a");
        assert_eq!(back.arcs[0].align.len(), 1);
        assert_eq!(back.arcs[0].align[0].label, "sil");
        assert!((back.arcs[0].aclike - (-10.0)).abs() < 1e-6);
        back.check().unwrap();
    }

    #[test]
    fn declared_counts_must_match() {
        let text = "VERSION=1.0\nN=2 L=1\nI=0 t=0.00\n";
        assert!(Lattice::read(std::io::Cursor::new(text.as_bytes())).is_err());
    }
}
