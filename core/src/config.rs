// core/src/config.rs
//
// Decoder and confusion-network configuration. Loaded from TOML; the
// historical upper-case key spellings are accepted as aliases so existing
// site configuration files keep working.

use serde::{Deserialize, Serialize};

/// How a per-word confidence is derived from frame posteriors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfMethod {
    #[serde(alias = "GEOMEAN")]
    GeoMean,
    #[serde(alias = "MAX")]
    Max,
}

/// Tunables of the recognition engine that are fixed per site rather than
/// per utterance. Per-utterance quantities (beams, scales, penalties) are
/// passed to [`Decoder::init`](crate::Decoder::init) instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Trace bitmask for extra diagnostics.
    #[serde(alias = "TRACE")]
    pub trace: u32,

    /// Maximum jump in LM lookahead applied per model node.
    #[serde(alias = "MAXLMLA")]
    pub max_lmla: f32,

    /// Build the lattice from the single token in the sentence-end node,
    /// rather than from all silence-layer word ends.
    #[serde(alias = "BUILDLATSENTEND")]
    pub build_lat_sent_end: bool,

    /// Always produce a lattice, even when no token reached sentence end.
    #[serde(alias = "FORCELATOUT")]
    pub force_lat_out: bool,

    /// Run traceback garbage collection every this many frames.
    #[serde(alias = "GCFREQ")]
    pub gc_freq: u32,

    /// Partial distance elimination in the mixture scoring loop.
    #[serde(alias = "PDE")]
    pub pde: bool,

    /// Restore the older pruning defaults (see [`Config::normalise`]).
    #[serde(alias = "USEOLDPRUNE")]
    pub use_old_prune: bool,

    /// Prune during token-set merges (as opposed to merging everything and
    /// pruning afterwards).
    #[serde(alias = "MERGETOKONLY")]
    pub merge_tok_only: bool,

    /// Floor for the dynamic beam, as a fraction of the main beam width.
    #[serde(alias = "MAXLNBEAMFLR")]
    pub max_ln_beam_floor: f32,

    /// Multiplicative relaxation factor for the dynamic beam.
    #[serde(alias = "DYNBEAMINC")]
    pub dyn_beam_inc: f32,

    /// Confidence scoring method for time-posterior confidences.
    #[serde(alias = "CONFMETHOD")]
    pub conf_method: ConfMethod,

    /// Clamp positive acoustic likelihoods on lattice arcs to 0.
    #[serde(alias = "CLAMPACLIKE")]
    pub clamp_aclike: bool,

    /// Re-derive pronunciation probabilities on lattice arcs from the
    /// dictionary before clustering.
    #[serde(alias = "FIXPRONPROB")]
    pub fix_pron_prob: bool,

    /// Append a residual null-word entry to written confusion networks when
    /// the listed posteriors sum to less than one.
    #[serde(alias = "ADDNULLWORD")]
    pub add_null_word: bool,

    /// Posterior floor (log) for the second confusion-network pruning pass.
    #[serde(alias = "CONFNETPRUNE")]
    pub conf_net_prune: f32,

    /// Scale applied to all lattice score weights before clustering.
    #[serde(alias = "SCALELATSCORE")]
    pub scale_lat_score: f32,

    /// Phone-alignment penalties for the phonetic-similarity measure.
    pub sim_sub_pen: i32,
    pub sim_del_pen: i32,
    pub sim_ins_pen: i32,

    /// File name rewriting masks for batch processing.
    #[serde(alias = "LABFILEMASK")]
    pub lab_file_mask: Option<String>,
    #[serde(alias = "LABOFILEMASK")]
    pub lab_ofile_mask: Option<String>,
    #[serde(alias = "LATFILEMASK")]
    pub lat_file_mask: Option<String>,
    #[serde(alias = "LATOFILEMASK")]
    pub lat_ofile_mask: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trace: 0,
            max_lmla: 1.0e10,
            build_lat_sent_end: false,
            force_lat_out: true,
            gc_freq: 100,
            pde: false,
            use_old_prune: false,
            merge_tok_only: true,
            max_ln_beam_floor: 0.8,
            dyn_beam_inc: 1.3,
            conf_method: ConfMethod::Max,
            clamp_aclike: true,
            fix_pron_prob: false,
            add_null_word: true,
            conf_net_prune: -5.0,
            scale_lat_score: 1.0,
            sim_sub_pen: 2,
            sim_del_pen: 1,
            sim_ins_pen: 1,
            lab_file_mask: None,
            lab_ofile_mask: None,
            lat_file_mask: None,
            lat_ofile_mask: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_toml<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.normalise();
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_toml<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.normalise();
        Ok(config)
    }

    /// Resolve interacting options. `use_old_prune` switches the merge and
    /// dynamic-beam behaviour back to the historical settings.
    pub fn normalise(&mut self) {
        if self.use_old_prune {
            self.merge_tok_only = false;
            self.max_ln_beam_floor = 0.0;
            self.dyn_beam_inc = 1.1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.gc_freq, 100);
        assert!(c.force_lat_out);
        assert!((c.conf_net_prune - (-5.0)).abs() < 1e-6);
        assert!((c.dyn_beam_inc - 1.3).abs() < 1e-6);
        assert_eq!(c.conf_method, ConfMethod::Max);
    }

    #[test]
    fn old_prune_restores_legacy_settings() {
        let mut c = Config::default();
        c.use_old_prune = true;
        c.normalise();
        assert!(!c.merge_tok_only);
        assert_eq!(c.max_ln_beam_floor, 0.0);
        assert!((c.dyn_beam_inc - 1.1).abs() < 1e-6);
    }

    #[test]
    fn historical_key_spellings_are_accepted() {
        let c = Config::from_toml_str("GCFREQ = 25\nFORCELATOUT = false\n").unwrap();
        assert_eq!(c.gc_freq, 25);
        assert!(!c.force_lat_out);
    }

    #[test]
    fn toml_roundtrip() {
        let mut c = Config::default();
        c.gc_freq = 7;
        c.conf_method = ConfMethod::GeoMean;
        let s = toml::to_string_pretty(&c).unwrap();
        let back = Config::from_toml_str(&s).unwrap();
        assert_eq!(back.gc_freq, 7);
        assert_eq!(back.conf_method, ConfMethod::GeoMean);
    }
}
