//! librecog-core
//!
//! Time-synchronous Viterbi decoding for large-vocabulary continuous
//! speech recognition over a prefix-tree lexicon with n-gram language
//! model lookahead, plus the subsystems that make it feasible at scale: a
//! mark-and-sweep collector over the traceback record graph and a
//! confusion-network clustering post-processor that turns word lattices
//! into "sausages" with per-word confidences.
//!
//! Model loading, feature extraction and file-format plumbing live in
//! frontend crates; this crate consumes their results through the
//! acoustic, language-model, lexicon and dictionary surfaces.
//!
//! Public API:
//! - [`Decoder`] - the recognition engine (`init` / `process_frame` /
//!   `traceback` / `lattice_traceback` per utterance)
//! - [`AcousticModel`], [`AcousticScorer`] - block-cached state scoring
//! - [`LangModel`], [`BigramLm`] - language-model surface and a reference
//!   implementation
//! - [`LexNet`], [`HmmSet`], [`Dictionary`] - the static recognition
//!   network
//! - [`Lattice`] - word lattices with forward-backward posteriors
//! - [`ConfNet`] - confusion-network clustering and SCF output
//! - [`Config`] - site configuration with TOML round-trip

pub mod acoustic;
pub mod arena;
pub mod config;
pub mod confnet;
pub mod decoder;
pub mod dict;
pub mod lattice;
pub mod lm;
pub mod math;
pub mod network;
pub mod token;
pub mod traceback;

pub use acoustic::{
    AcousticModel, AcousticScorer, GmmState, HybridTable, Mixture, Observation, PlainStates,
    StateTable, Transform,
};
pub use config::{ConfMethod, Config};
pub use confnet::{word_confidences, ConfNet, SCWord, SCluster};
pub use decoder::{BeamParams, Decoder, DecoderOpts};
pub use dict::{Dictionary, Pron, PronId};
pub use lattice::{AlignEntry, LatArc, LatNode, Lattice};
pub use lm::{BigramLm, LangModel, LmCache, LmState, LmlaTree};
pub use network::{Hmm, HmmSet, LexLayers, LexNet, LexNode, NodeId, NodeKind};
pub use token::{RelToken, TokenMerger, TokenSet};
pub use traceback::{AltWordEndHyp, Label, ModEndHyp, Transcription, WordEndHyp};
