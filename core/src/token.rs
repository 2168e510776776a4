// core/src/token.rs
//
// Relative-scored token sets and the merge operation that recombines them.
// A token set keeps at most K tokens in distinct LM states, sorted by LM
// state, each scored as a non-positive delta against the set's best score.
// Merging exploits the sorted order (single linear pass) and the identity
// stamp: two sets carrying the same id hold identical token arrays by
// construction, so only their best scores need comparing.

use crate::lm::LmState;
use crate::math::LZERO_F;

/// A partial hypothesis relative to its token set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelToken {
    pub lm_state: LmState,
    /// Score relative to the owning set's best; at most +0.01 of slack.
    pub delta: f32,
    /// LM lookahead already applied to this token.
    pub lmscore: f32,
    /// Most recent word-end record on this path.
    pub path: Option<u32>,
    /// Most recent model-end record, when alignment is on.
    pub modpath: Option<u32>,
}

impl RelToken {
    pub fn start(lm_state: LmState) -> Self {
        RelToken {
            lm_state,
            delta: 0.0,
            lmscore: 0.0,
            path: None,
            modpath: None,
        }
    }
}

/// Container of competing tokens entering or leaving one HMM state.
/// `id == 0` means empty; non-zero ids stamp the token-array identity.
#[derive(Debug, Clone, Default)]
pub struct TokenSet {
    pub score: f32,
    pub id: u32,
    pub toks: Vec<RelToken>,
}

impl TokenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.toks.is_empty()
    }

    pub fn clear(&mut self) {
        self.toks.clear();
        self.id = 0;
    }

    /// Shift deltas so the best token sits at 0 again, folding the shift
    /// into the set score. Returns the shift.
    pub fn renormalise(&mut self) -> f32 {
        let best = self
            .toks
            .iter()
            .map(|t| t.delta)
            .fold(LZERO_F, f32::max);
        if best > LZERO_F {
            for t in &mut self.toks {
                t.delta -= best;
            }
            self.score += best;
        }
        best
    }

    #[cfg(debug_assertions)]
    fn check(&self) {
        let mut have_zero = false;
        for w in self.toks.windows(2) {
            debug_assert!(w[0].lm_state < w[1].lm_state, "token order violated");
        }
        for t in &self.toks {
            debug_assert!(t.delta <= 0.01, "positive delta {}", t.delta);
            if t.delta >= -0.01 {
                have_zero = true;
            }
        }
        debug_assert!(self.toks.is_empty() || have_zero, "no token near the set best");
    }

    #[cfg(not(debug_assertions))]
    fn check(&self) {}
}

const HIST_BINS: usize = 64;

/// Shared state of all merge operations: the token budget K, the relative
/// beam (stored negated, as a delta limit), the id counter and a scratch
/// buffer for the winning tokens.
#[derive(Debug)]
pub struct TokenMerger {
    pub n_tok: usize,
    /// `-relBeamWidth`; deltas below this are outside the relative beam.
    pub rel_beam: f32,
    id_count: u32,
    buf: Vec<RelToken>,
}

impl TokenMerger {
    pub fn new(n_tok: usize, rel_beam_width: f32) -> Self {
        Self {
            n_tok,
            rel_beam: -rel_beam_width,
            id_count: 0,
            buf: Vec::new(),
        }
    }

    pub fn next_id(&mut self) -> u32 {
        self.id_count += 1;
        self.id_count
    }

    pub fn reset_ids(&mut self) {
        self.id_count = 0;
    }

    /// Merge `src` (with `add` added to its scores) into `dest`, keeping
    /// per LM state the better token and at most `n_tok` tokens overall.
    /// With `beam_limit` set, the merge also prunes against the main beam.
    pub fn merge(
        &mut self,
        src: &TokenSet,
        dest: &mut TokenSet,
        add: f32,
        beam_limit: Option<f32>,
    ) {
        debug_assert!(!src.toks.is_empty());

        if dest.is_empty() {
            dest.score = src.score + add;
            dest.id = src.id;
            dest.toks.clear();
            dest.toks.extend_from_slice(&src.toks);
            return;
        }
        if let Some(limit) = beam_limit {
            if src.score + add < limit {
                return;
            }
        }
        if src.id == dest.id {
            // identical token arrays by construction: compare best scores
            let src_score = src.score + add;
            if src_score > dest.score {
                dest.score = src_score;
            }
            return;
        }

        // sorted two-way merge
        let (win_score, src_corr, dest_corr) = if src.score + add > dest.score {
            (src.score + add, -add, dest.score - (src.score + add))
        } else {
            (dest.score, src.score - dest.score, 0.0)
        };

        let delta_limit = match beam_limit {
            Some(limit) => (limit - win_score).max(self.rel_beam),
            None => self.n_tok as f32 * self.rel_beam,
        };

        self.buf.clear();
        let mut n_win = [0usize; 2];
        let (mut i, mut j) = (0usize, 0usize);
        while i < src.toks.len() && j < dest.toks.len() {
            let (tok, loc) = {
                let st = &src.toks[i];
                let dt = &dest.toks[j];
                if st.lm_state == dt.lm_state {
                    let take_src = src.score + st.delta + add > dest.score + dt.delta;
                    i += 1;
                    j += 1;
                    if take_src {
                        let mut t = *st;
                        t.delta += src_corr + add;
                        (t, 0)
                    } else {
                        let mut t = *dt;
                        t.delta += dest_corr;
                        (t, 1)
                    }
                } else if st.lm_state < dt.lm_state {
                    let mut t = *st;
                    t.delta += src_corr + add;
                    i += 1;
                    (t, 0)
                } else {
                    let mut t = *dt;
                    t.delta += dest_corr;
                    j += 1;
                    (t, 1)
                }
            };
            if tok.delta >= delta_limit {
                self.buf.push(tok);
                n_win[loc] += 1;
            }
        }
        for st in &src.toks[i..] {
            let mut t = *st;
            t.delta += src_corr + add;
            if t.delta >= delta_limit {
                self.buf.push(t);
                n_win[0] += 1;
            }
        }
        for dt in &dest.toks[j..] {
            let mut t = *dt;
            t.delta += dest_corr;
            if t.delta >= delta_limit {
                self.buf.push(t);
                n_win[1] += 1;
            }
        }

        let n_win_tok = self.buf.len();
        if n_win_tok == 0 {
            dest.clear();
            dest.score = win_score;
            return;
        }

        if n_win_tok <= self.n_tok {
            dest.toks.clear();
            dest.toks.extend_from_slice(&self.buf);
            dest.score = win_score;
            dest.id = if n_win[0] == n_win_tok {
                src.id
            } else if n_win[1] == n_win_tok {
                dest.id
            } else {
                self.next_id()
            };
        } else {
            self.histogram_prune(delta_limit);
            dest.toks.clear();
            dest.toks.extend_from_slice(&self.buf);
            dest.score = win_score;
            dest.id = self.next_id();
        }
        dest.check();
    }

    /// Reduce `buf` to exactly `n_tok` tokens by bucket sort over delta.
    /// The bin boundary is relaxed when it undershoots and ties at the
    /// boundary are demoted to `LZERO` when it overshoots.
    fn histogram_prune(&mut self, delta_limit: f32) {
        let bin_width = delta_limit * 1.001 / HIST_BINS as f32;
        let mut bins = [0usize; HIST_BINS];
        for t in &self.buf {
            let b = ((t.delta / bin_width) as usize).min(HIST_BINS - 1);
            bins[b] += 1;
        }

        let mut kept = 0usize;
        let mut edge = 0usize;
        loop {
            kept += bins[edge];
            if kept >= self.n_tok {
                break;
            }
            edge += 1;
        }

        if kept == self.n_tok {
            let limit_bin = edge;
            self.buf
                .retain(|t| ((t.delta / bin_width) as usize).min(HIST_BINS - 1) <= limit_bin);
        } else {
            // relax the boundary below the last bin until n_tok fit
            let mut limit = bin_width * edge as f32;
            let mut n_better;
            loop {
                let mut best_below = LZERO_F;
                n_better = 0;
                for t in &self.buf {
                    if t.delta >= limit {
                        n_better += 1;
                    } else if t.delta > best_below {
                        best_below = t.delta;
                    }
                }
                if n_better >= self.n_tok {
                    break;
                }
                limit = best_below;
            }
            if n_better > self.n_tok {
                // demote ties at the boundary
                let mut excess = n_better - self.n_tok;
                for t in &mut self.buf {
                    if excess == 0 {
                        break;
                    }
                    if t.delta == limit {
                        t.delta = LZERO_F;
                        excess -= 1;
                    }
                }
            }
            self.buf.retain(|t| t.delta >= limit);
        }
        debug_assert_eq!(self.buf.len(), self.n_tok);
    }

    /// Apply the main and relative beams to a token set in place.
    pub fn prune(&mut self, ts: &mut TokenSet, beam_limit: f32) {
        let delta_limit = (beam_limit - ts.score).max(self.rel_beam);
        if delta_limit > 0.0 {
            ts.clear();
            return;
        }
        let before = ts.toks.len();
        ts.toks.retain(|t| t.delta >= delta_limit);
        if ts.toks.is_empty() {
            ts.id = 0;
        } else if ts.toks.len() != before {
            ts.id = self.next_id();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok(lm_state: LmState, delta: f32) -> RelToken {
        RelToken {
            lm_state,
            delta,
            lmscore: 0.0,
            path: None,
            modpath: None,
        }
    }

    fn set(score: f32, id: u32, toks: Vec<RelToken>) -> TokenSet {
        TokenSet { score, id, toks }
    }

    #[test]
    fn merge_into_empty_copies_and_inherits_id() {
        let mut m = TokenMerger::new(4, 100.0);
        let src = set(-10.0, 7, vec![tok(1, 0.0), tok(3, -2.0)]);
        let mut dest = TokenSet::new();
        m.merge(&src, &mut dest, -1.0, None);
        assert_eq!(dest.id, 7);
        assert!((dest.score - (-11.0)).abs() < 1e-6);
        assert_eq!(dest.toks, src.toks);
    }

    #[test]
    fn identity_fast_path_keeps_token_array() {
        let mut m = TokenMerger::new(4, 100.0);
        let toks = vec![tok(1, 0.0), tok(5, -1.0)];
        let src = set(-8.0, 3, toks.clone());
        let mut dest = set(-9.5, 3, toks.clone());
        m.merge(&src, &mut dest, 0.0, None);
        assert_eq!(dest.id, 3);
        assert!((dest.score - (-8.0)).abs() < 1e-6);
        assert_eq!(dest.toks, toks, "fast path must leave tokens untouched");

        // better dest also short-circuits
        let mut dest = set(-2.0, 3, toks.clone());
        m.merge(&src, &mut dest, 0.0, None);
        assert!((dest.score - (-2.0)).abs() < 1e-6);
    }

    #[test]
    fn sorted_merge_recombines_per_lm_state() {
        let mut m = TokenMerger::new(8, 100.0);
        let src = set(-5.0, 1, vec![tok(1, 0.0), tok(4, -1.0)]);
        let mut dest = set(-4.0, 2, vec![tok(2, 0.0), tok(4, -3.0)]);
        m.merge(&src, &mut dest, 0.0, None);

        // winner score: dest (-4.0) beats src (-5.0)
        assert!((dest.score - (-4.0)).abs() < 1e-6);
        let states: Vec<LmState> = dest.toks.iter().map(|t| t.lm_state).collect();
        assert_eq!(states, vec![1, 2, 4]);
        // state 4: src is at -6.0 absolute, dest at -7.0 -> src wins
        let t4 = dest.toks.iter().find(|t| t.lm_state == 4).unwrap();
        assert!((t4.delta - (-2.0)).abs() < 1e-5);
        // mixed winners demand a fresh id
        assert_ne!(dest.id, 1);
        assert_ne!(dest.id, 2);
    }

    #[test]
    fn all_src_winners_inherit_src_id() {
        let mut m = TokenMerger::new(8, 100.0);
        let src = set(0.0, 11, vec![tok(1, 0.0), tok(2, -0.5)]);
        let mut dest = set(-50.0, 12, vec![tok(1, 0.0)]);
        // relative beam of 100 drops dest's token at -50 relative
        m.merge(&src, &mut dest, 0.0, Some(-40.0));
        assert_eq!(dest.id, 11);
        assert_eq!(dest.toks.len(), 2);
    }

    #[test]
    fn merge_prunes_src_below_beam() {
        let mut m = TokenMerger::new(8, 100.0);
        let src = set(-100.0, 1, vec![tok(1, 0.0)]);
        let mut dest = set(-5.0, 2, vec![tok(2, 0.0)]);
        m.merge(&src, &mut dest, 0.0, Some(-50.0));
        // src was entirely below the beam: dest untouched
        assert_eq!(dest.toks.len(), 1);
        assert_eq!(dest.id, 2);
    }

    #[test]
    fn histogram_prune_keeps_the_best_k() {
        let mut m = TokenMerger::new(3, 1000.0);
        let src = set(
            0.0,
            1,
            vec![tok(1, 0.0), tok(3, -4.0), tok(5, -8.0), tok(7, -12.0)],
        );
        let mut dest = set(
            -1.0,
            2,
            vec![tok(2, 0.0), tok(4, -6.0), tok(6, -10.0), tok(8, -14.0)],
        );
        m.merge(&src, &mut dest, 0.0, None);
        assert_eq!(dest.toks.len(), 3);
        let states: Vec<LmState> = dest.toks.iter().map(|t| t.lm_state).collect();
        // best three absolute scores: 0.0 (state 1), -1.0 (state 2), -4.0 (state 3)
        assert_eq!(states, vec![1, 2, 3]);
    }

    #[test]
    fn histogram_prune_with_few_distinct_bins() {
        // many tokens, all in the same bin: tie demotion must still cut to K
        let mut m = TokenMerger::new(2, 1000.0);
        let src = set(
            0.0,
            1,
            vec![tok(1, 0.0), tok(3, 0.0), tok(5, 0.0)],
        );
        let mut dest = set(0.0, 2, vec![tok(2, 0.0), tok(4, 0.0), tok(6, 0.0)]);
        m.merge(&src, &mut dest, 0.0, None);
        assert_eq!(dest.toks.len(), 2);
    }

    #[test]
    fn prune_applies_relative_beam() {
        let mut m = TokenMerger::new(8, 5.0);
        let mut ts = set(-10.0, 4, vec![tok(1, 0.0), tok(2, -3.0), tok(3, -7.0)]);
        m.prune(&mut ts, -1000.0);
        assert_eq!(ts.toks.len(), 2, "token outside the relative beam dropped");
        assert_ne!(ts.id, 4, "pruning re-stamps the identity");
    }

    #[test]
    fn prune_clears_sets_below_the_main_beam() {
        let mut m = TokenMerger::new(8, 50.0);
        let mut ts = set(-100.0, 4, vec![tok(1, 0.0)]);
        m.prune(&mut ts, -20.0);
        assert!(ts.is_empty());
        assert_eq!(ts.id, 0);
    }

    #[test]
    fn renormalise_restores_zero_best() {
        let mut ts = set(-5.0, 1, vec![tok(1, -2.0), tok(2, -3.0)]);
        let shift = ts.renormalise();
        assert!((shift - (-2.0)).abs() < 1e-6);
        assert!((ts.score - (-7.0)).abs() < 1e-6);
        assert!((ts.toks[0].delta - 0.0).abs() < 1e-6);
    }
}
