//! Shared fixtures: tiny vocabularies, hand-built rule tables, and a flat
//! language model with predictable scores.

use crate::config::{parse_config_toml, DecoderConfig, DEFAULT_CONFIG_TOML};
use crate::decoder::Models;
use crate::lm::NgramLm;
use crate::nnjm::JointScorer;
use crate::rules::{AlignPoint, RuleKind, RuleTable, TgtRule};
use crate::vocab::{SymbolId, Vocab, NONTERMINAL};

pub const TRANS_WEIGHTS: [f64; 1] = [1.0];

/// Default test config: one translation feature, unit weights, generous
/// beam, single-threaded.
pub fn test_cfg() -> DecoderConfig {
    let toml = DEFAULT_CONFIG_TOML
        .replace("trans = [1.0, 1.0, 1.0, 1.0]", "trans = [1.0]")
        .replace("len = 0.5", "len = 0.0")
        .replace("rule_num = 0.5", "rule_num = 0.0")
        .replace("glue = 0.5", "glue = 0.0");
    parse_config_toml(&toml).expect("test config must parse")
}

pub fn vocab_with(words: &[&str]) -> Vocab {
    Vocab::from_words(words.iter().map(|w| w.to_string()))
}

/// Bigram model: every vocabulary word scores -1.0 with no context effects,
/// so an n-word hypothesis costs exactly -n and the sentence-final closure
/// adds the -1.0 `</s>` step.
pub fn flat_lm(vocab: &Vocab) -> NgramLm {
    let mut entries: Vec<(Vec<SymbolId>, f64, f64)> = (0..vocab.len() as SymbolId)
        .filter(|&id| id != vocab.bos() && id != vocab.eos())
        .map(|id| (vec![id], -1.0, 0.0))
        .collect();
    entries.push((vec![vocab.bos()], -99.0, 0.0));
    entries.push((vec![vocab.eos()], -1.0, 0.0));
    NgramLm::from_entries(2, vocab.bos(), vocab.eos(), entries)
}

pub struct Fixture {
    pub cfg: DecoderConfig,
    pub src_vocab: Vocab,
    pub tgt_vocab: Vocab,
    pub table: RuleTable,
    pub lm: NgramLm,
    pub nnjm: Option<Box<dyn JointScorer>>,
}

impl Fixture {
    pub fn new(src_words: &[&str], tgt_words: &[&str]) -> Self {
        let cfg = test_cfg();
        let src_vocab = vocab_with(src_words);
        let tgt_vocab = vocab_with(tgt_words);
        let lm = flat_lm(&tgt_vocab);
        let table = RuleTable::new(cfg.params.rule_len_max, cfg.params.rule_num_limit);
        Fixture {
            cfg,
            src_vocab,
            tgt_vocab,
            table,
            lm,
            nnjm: None,
        }
    }

    pub fn models(&self) -> Models<'_> {
        Models {
            src_vocab: &self.src_vocab,
            tgt_vocab: &self.tgt_vocab,
            rules: &self.table,
            lm: &self.lm,
            nnjm: self.nnjm.as_deref(),
        }
    }

    /// Add a pure-terminal rule `src ||| tgt` with one probability feature.
    pub fn add_phrase_rule(&mut self, src: &str, tgt: &str, prob: f64) {
        let src_ids: Vec<SymbolId> = src
            .split_whitespace()
            .map(|w| self.src_vocab.get_or_intern(w))
            .collect();
        let tgt_ids: Vec<SymbolId> = tgt
            .split_whitespace()
            .map(|w| self.tgt_vocab.get_or_intern(w))
            .collect();
        // Monotone alignment, clipped to the source length.
        let align = (0..tgt_ids.len())
            .map(|i| AlignPoint::Src(i.min(src_ids.len() - 1)))
            .collect();
        let rule = TgtRule::new(RuleKind::Phrase, tgt_ids, align, vec![prob], &TRANS_WEIGHTS);
        self.table.add_rule(&src_ids, rule);
    }

    /// Add a hierarchical rule; `[X][X]` marks the nonterminal slots on
    /// both sides. `kind` selects forward/reversed/glue semantics.
    pub fn add_hiero_rule(&mut self, src: &str, tgt: &str, kind: RuleKind, prob: f64) {
        let src_ids: Vec<SymbolId> = src
            .split_whitespace()
            .map(|w| self.src_vocab.get_or_intern(w))
            .collect();
        let tgt_nt = self.tgt_vocab.nonterminal();
        let tgt_ids: Vec<SymbolId> = tgt
            .split_whitespace()
            .map(|w| self.tgt_vocab.get_or_intern(w))
            .collect();
        let mut nts = 0;
        let align = tgt_ids
            .iter()
            .enumerate()
            .map(|(i, &wid)| {
                if wid == tgt_nt {
                    nts += 1;
                    if nts == 1 {
                        AlignPoint::FirstNt
                    } else {
                        AlignPoint::SecondNt
                    }
                } else {
                    AlignPoint::Src(i.min(src_ids.len() - 1))
                }
            })
            .collect();
        let rule = TgtRule::new(kind, tgt_ids, align, vec![prob], &TRANS_WEIGHTS);
        self.table.add_rule(&src_ids, rule);
    }

    /// Add the glue rule `[X][X] [X][X] ||| [X][X] [X][X]`.
    pub fn add_glue_rule(&mut self) {
        let nt = format!("{NONTERMINAL} {NONTERMINAL}");
        self.add_hiero_rule(&nt, &nt, RuleKind::Glue, 0.0);
    }
}
