// core/src/dict.rs
//
// Pronunciation dictionary consumed by the decoder and the
// confusion-network clustering. Words map to one or more pronunciations;
// each pronunciation carries its phone sequence, an optional output symbol
// and a log probability. With a silence dictionary every word additionally
// carries `sp` and `sil` boundary variants chained off its base entry.
//
// Lookup is served from an in-memory map for dynamically added words, with
// an optional fst index + payload store for the static vocabulary.

use anyhow::{bail, Context, Result};
use fst::{Map, MapBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Index into the pronunciation table.
pub type PronId = u32;

/// Pronunciation variant at a word boundary: none, short pause, silence.
pub const VAR_NONE: u8 = 0;
pub const VAR_SP: u8 = 1;
pub const VAR_SIL: u8 = 2;

/// One pronunciation of a word.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pron {
    pub word: String,
    /// Output symbol; `None` deletes the word from transcriptions.
    pub out_sym: Option<String>,
    pub phones: Vec<String>,
    /// Log pronunciation probability.
    pub prob: f32,
    /// Variant number within the word (1-based, as written to lattices).
    pub pnum: u16,
    /// Next boundary variant (`sp`, then `sil`) for silence dictionaries.
    pub next_var: Option<PronId>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Dictionary {
    prons: Vec<Pron>,
    words: HashMap<String, Vec<PronId>>,
    /// Whether entries carry `sp`/`sil` boundary variants.
    sil_dict: bool,
    #[serde(skip)]
    fst_index: Option<Map<Vec<u8>>>,
    #[serde(skip)]
    payloads: Option<Vec<Vec<PronId>>>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_sil_dict(&self) -> bool {
        self.sil_dict
    }

    pub fn n_prons(&self) -> usize {
        self.prons.len()
    }

    /// Add a pronunciation and return its id. Variant numbers are assigned
    /// in insertion order per word.
    pub fn add_pron(
        &mut self,
        word: &str,
        out_sym: Option<&str>,
        phones: &[&str],
        prob: f32,
    ) -> PronId {
        let id = self.prons.len() as PronId;
        let pnum = self
            .words
            .get(word)
            .map(|v| v.len() as u16 + 1)
            .unwrap_or(1);
        self.prons.push(Pron {
            word: word.to_string(),
            out_sym: out_sym.map(|s| s.to_string()),
            phones: phones.iter().map(|p| p.to_string()).collect(),
            prob,
            pnum,
            next_var: None,
        });
        self.words.entry(word.to_string()).or_default().push(id);
        id
    }

    /// Add the `sp` and `sil` boundary variants for `base`, chaining them
    /// off the base pronunciation. Marks the dictionary as a silence
    /// dictionary.
    pub fn add_silence_variants(&mut self, base: PronId, sp_prob: f32, sil_prob: f32) {
        let word = self.prons[base as usize].word.clone();
        let phones: Vec<String> = self.prons[base as usize].phones.clone();
        let out_sym = self.prons[base as usize].out_sym.clone();
        let pnum = self.prons[base as usize].pnum;

        let mut mk = |suffix: &str, prob: f32| -> PronId {
            let id = self.prons.len() as PronId;
            let mut ph = phones.clone();
            ph.push(suffix.to_string());
            self.prons.push(Pron {
                word: word.clone(),
                out_sym: out_sym.clone(),
                phones: ph,
                prob,
                pnum,
                next_var: None,
            });
            id
        };
        let sp = mk("sp", sp_prob);
        let sil = mk("sil", sil_prob);
        self.prons[base as usize].next_var = Some(sp);
        self.prons[sp as usize].next_var = Some(sil);
        self.sil_dict = true;
    }

    pub fn pron(&self, id: PronId) -> &Pron {
        &self.prons[id as usize]
    }

    /// Resolve a boundary variant: `VAR_NONE` is the entry itself, `VAR_SP`
    /// and `VAR_SIL` walk the variant chain. Falls back to the base entry
    /// when no variants exist.
    pub fn variant(&self, id: PronId, var: u8) -> &Pron {
        let mut cur = id;
        for _ in 0..var {
            match self.prons[cur as usize].next_var {
                Some(next) => cur = next,
                None => break,
            }
        }
        &self.prons[cur as usize]
    }

    /// All pronunciation ids for a word.
    pub fn lookup(&self, word: &str) -> Vec<PronId> {
        if let Some(v) = self.words.get(word) {
            return v.clone();
        }
        if let (Some(index), Some(payloads)) = (&self.fst_index, &self.payloads) {
            if let Some(idx) = index.get(word) {
                if let Some(ids) = payloads.get(idx as usize) {
                    return ids.clone();
                }
            }
        }
        Vec::new()
    }

    /// Phones of a word's first pronunciation, for phonetic similarity.
    pub fn phones_of(&self, word: &str) -> Option<&[String]> {
        self.lookup(word)
            .first()
            .map(|&id| self.prons[id as usize].phones.as_slice())
    }

    /// Build the fst index over the current static vocabulary.
    pub fn build_index(&mut self) -> Result<()> {
        let mut keys: Vec<&String> = self.words.keys().collect();
        keys.sort();
        let mut builder = MapBuilder::new(Vec::new())?;
        let mut payloads = Vec::with_capacity(keys.len());
        for (i, key) in keys.iter().enumerate() {
            builder.insert(key.as_bytes(), i as u64)?;
            payloads.push(self.words[key.as_str()].clone());
        }
        let bytes = builder.into_inner()?;
        self.fst_index = Some(Map::new(bytes).context("dictionary fst index")?);
        self.payloads = Some(payloads);
        Ok(())
    }

    pub fn save_bincode<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn load_bincode<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let mut dict: Self = bincode::deserialize_from(reader)?;
        dict.build_index()?;
        Ok(dict)
    }

    /// Load a prebuilt fst + payload pair produced by an external
    /// vocabulary build.
    pub fn load_index<P: AsRef<Path>>(&mut self, fst_path: P, payload_path: P) -> Result<()> {
        let mut buf = Vec::new();
        File::open(fst_path.as_ref())
            .with_context(|| format!("open fst {}", fst_path.as_ref().display()))?
            .read_to_end(&mut buf)?;
        let map = Map::new(buf).context("dictionary fst")?;

        let mut buf = Vec::new();
        File::open(payload_path.as_ref())
            .with_context(|| format!("open payloads {}", payload_path.as_ref().display()))?
            .read_to_end(&mut buf)?;
        let payloads: Vec<Vec<PronId>> = bincode::deserialize(&buf)?;

        if map.len() != payloads.len() {
            bail!(
                "dictionary index has {} keys but {} payload rows",
                map.len(),
                payloads.len()
            );
        }
        self.fst_index = Some(map);
        self.payloads = Some(payloads);
        Ok(())
    }
}
