//! The chart decoder: span-indexed candidate chart filled bottom-up with
//! cube-pruned beam search.
//!
//! One [`SentenceDecoder`] handles one input line (possibly several
//! EOS-delimited sub-sentences): it seeds every span reachable by phrase
//! rules (with an OOV passthrough for uncovered single words), then fills
//! spans in increasing length order. Cells of equal length are independent
//! and may be filled in parallel; each level completes, including the
//! beam sort, before the next begins.

mod candidate;
mod cube;
mod matcher;
mod pattern;
mod scoring;

#[cfg(test)]
mod tests;

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, debug_span};

use crate::config::DecoderConfig;
use crate::lm::NgramLm;
use crate::nnjm::{JointScorer, ScoreCache};
use crate::rules::{RuleKind, RuleTable, TgtRule};
use crate::sentence::{SourceSentence, Span};
use crate::vocab::{SymbolId, Vocab};

pub use candidate::{AppliedRule, CandId, Candidate, RecombKey};

use candidate::{CandArena, Chart, SpanBeam};
use cube::CellResult;
use matcher::SpanRules;
use scoring::DecodeCtx;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("no derivation found for sub-sentence {segment}")]
    NoDerivation { segment: usize },
}

/// Borrowed handles to the shared read-only models. Cheap to copy into
/// each per-sentence decoder; safe to share across sentence threads.
#[derive(Clone, Copy)]
pub struct Models<'m> {
    pub src_vocab: &'m Vocab,
    pub tgt_vocab: &'m Vocab,
    pub rules: &'m RuleTable,
    pub lm: &'m NgramLm,
    pub nnjm: Option<&'m dyn JointScorer>,
}

/// One n-best entry with its feature vector, for weight tuning.
#[derive(Debug, Clone, Serialize)]
pub struct TuneInfo {
    pub translation: String,
    /// Translation probabilities, then lm, word count, rule count, glue
    /// count, and the joint-model score when enabled.
    pub feature_values: Vec<f64>,
    pub total_score: f64,
}

/// Intern every word of `line` into both vocabularies.
///
/// Must run single-threadedly before sentence workers share the vocabs:
/// decoding itself never assigns new ids.
pub fn preregister(src_vocab: &mut Vocab, tgt_vocab: &mut Vocab, line: &str) {
    for word in line.split_whitespace() {
        src_vocab.get_or_intern(word);
        tgt_vocab.get_or_intern(word);
    }
}

pub struct SentenceDecoder<'m> {
    models: Models<'m>,
    cfg: &'m DecoderConfig,
    sen: SourceSentence,
    chart: Chart,
    arena: CandArena<'m>,
    span_rules: SpanRules<'m>,
    /// Phrase-rule alternatives per `[beg][len]` cell.
    phrase: Vec<Vec<Vec<&'m TgtRule>>>,
    /// Per source position: target id of the passthrough token.
    oov_tgt: Vec<SymbolId>,
    /// Target ids produced only by OOV passthrough, for `drop_oov` output.
    oov_out_wids: HashSet<SymbolId>,
    nnjm_cache: ScoreCache,
    decoded: bool,
}

impl<'m> SentenceDecoder<'m> {
    pub fn new(models: Models<'m>, cfg: &'m DecoderConfig, line: &str) -> Self {
        let mut src_wids = Vec::new();
        let mut oov_tgt = Vec::new();
        for word in line.split_whitespace() {
            src_wids.push(models.src_vocab.id_or_unk(word));
            oov_tgt.push(models.tgt_vocab.id_or_unk(word));
        }
        let marker = models
            .src_vocab
            .get_id(&cfg.params.eos_marker)
            .unwrap_or(SymbolId::MAX);
        let sen = SourceSentence::new(src_wids, marker);
        let n = sen.len();

        let span_rules = matcher::collect(
            &sen,
            models.rules,
            models.src_vocab.nonterminal(),
            cfg.params.rule_span_max,
        );

        let mut phrase: Vec<Vec<Vec<&'m TgtRule>>> = (0..n)
            .map(|beg| (0..n - beg).map(|_| Vec::new()).collect())
            .collect();
        let mut oov_out_wids = HashSet::new();
        for beg in 0..n {
            let matched = models.rules.find_matched_rules_for_prefixes(sen.wids(), beg);
            for (len, alts) in matched.into_iter().enumerate() {
                if !sen.span_valid(Span::new(beg, len)) {
                    continue;
                }
                if let Some(alts) = alts {
                    phrase[beg][len] = alts
                        .iter()
                        .filter(|r| r.kind == RuleKind::Phrase)
                        .collect();
                }
            }
            if sen.span_valid(Span::new(beg, 0)) && phrase[beg][0].is_empty() {
                oov_out_wids.insert(oov_tgt[beg]);
            }
        }

        SentenceDecoder {
            models,
            cfg,
            chart: Chart::new(n),
            arena: CandArena::new(),
            sen,
            span_rules,
            phrase,
            oov_tgt,
            oov_out_wids,
            nnjm_cache: ScoreCache::new(),
            decoded: false,
        }
    }

    /// Top translation per sub-sentence. An empty input yields an empty
    /// list; a reachable sub-sentence without any derivation is an error,
    /// never an empty string.
    pub fn translate(&mut self) -> Result<Vec<String>, DecodeError> {
        self.run();
        let mut out = Vec::with_capacity(self.sen.segments().len());
        for si in 0..self.sen.segments().len() {
            let span = self.sen.segment_span(si);
            let top = self
                .chart
                .beam(span)
                .top()
                .ok_or(DecodeError::NoDerivation { segment: si })?;
            out.push(self.words_to_str(&self.arena[top].tgt_wids, self.cfg.params.drop_oov));
        }
        Ok(out)
    }

    /// Up to `nbest` feature-annotated entries per sub-sentence.
    pub fn nbest(&mut self) -> Vec<Vec<TuneInfo>> {
        self.run();
        let mut out = Vec::with_capacity(self.sen.segments().len());
        for si in 0..self.sen.segments().len() {
            let span = self.sen.segment_span(si);
            let beam = self.chart.beam(span);
            let entries = beam
                .kept()
                .iter()
                .take(self.cfg.params.nbest)
                .map(|&id| {
                    let c = &self.arena[id];
                    let mut feature_values = c.trans_probs.clone();
                    feature_values.push(c.lm_score);
                    feature_values.push(c.tgt_word_num as f64);
                    feature_values.push(c.rule_num as f64);
                    feature_values.push(c.glue_num as f64);
                    if self.cfg.nnjm.enabled {
                        feature_values.push(c.nnjm_score);
                    }
                    TuneInfo {
                        translation: self.words_to_str(&c.tgt_wids, false),
                        feature_values,
                        total_score: c.score,
                    }
                })
                .collect();
            out.push(entries);
        }
        out
    }

    /// The rule trace of each sub-sentence's best derivation: one
    /// `src ||| tgt` line per rule, pre-order over the derivation tree.
    pub fn applied_rules(&mut self) -> Vec<Vec<String>> {
        self.run();
        let mut out = Vec::with_capacity(self.sen.segments().len());
        for si in 0..self.sen.segments().len() {
            let span = self.sen.segment_span(si);
            let mut trace = Vec::new();
            if let Some(top) = self.chart.beam(span).top() {
                self.dump_rules(&mut trace, top);
            }
            out.push(trace);
        }
        out
    }

    /// The best candidate covering sub-sentence `segment`, once decoded.
    pub fn best_candidate(&self, segment: usize) -> Option<&Candidate<'m>> {
        if segment >= self.sen.segments().len() {
            return None;
        }
        let span = self.sen.segment_span(segment);
        self.chart.beam(span).top().map(|id| &self.arena[id])
    }

    pub fn candidate(&self, id: CandId) -> &Candidate<'m> {
        &self.arena[id]
    }

    fn run(&mut self) {
        if self.decoded {
            return;
        }
        self.decoded = true;
        let n = self.sen.len();
        if n == 0 {
            return;
        }
        let _guard = debug_span!("decode", len = n).entered();
        for len in 0..n {
            let begs: Vec<usize> = (0..n - len)
                .filter(|&beg| self.sen.span_valid(Span::new(beg, len)))
                .collect();
            if begs.is_empty() {
                continue;
            }
            let results = self.fill_level(&begs, len);
            for (beg, result) in begs.into_iter().zip(results) {
                self.install(Span::new(beg, len), result);
            }
        }
        debug!(candidates = self.arena.len(), "chart complete");
    }

    /// Fill every valid cell of one span length. Cells only read strictly
    /// shorter spans, so a level is embarrassingly parallel; the returned
    /// results are installed (and the level thereby sealed) by the caller.
    fn fill_level(&self, begs: &[usize], len: usize) -> Vec<CellResult<'m>> {
        let ctx = DecodeCtx {
            cfg: self.cfg,
            lm: self.models.lm,
            sen: &self.sen,
            chart: &self.chart,
            arena: &self.arena,
            src_nt: self.models.src_vocab.nonterminal(),
            tgt_nt: self.models.tgt_vocab.nonterminal(),
            src_bos: self.models.src_vocab.bos(),
            src_eos: self.models.src_vocab.eos(),
            tgt_bos: self.models.tgt_vocab.bos(),
            oov_tgt: &self.oov_tgt,
            nnjm: if self.cfg.nnjm.enabled {
                self.models.nnjm
            } else {
                None
            },
            nnjm_cache: &self.nnjm_cache,
        };
        let span_rules = &self.span_rules;
        let phrase = &self.phrase;
        let fill = |beg: usize| {
            let span = Span::new(beg, len);
            cube::fill_cell(&ctx, span, span_rules.rules(span), &phrase[beg][len])
        };

        let threads = self.cfg.params.span_threads.min(begs.len());
        if threads <= 1 {
            return begs.iter().map(|&beg| fill(beg)).collect();
        }
        let chunk_size = begs.len().div_ceil(threads);
        std::thread::scope(|s| {
            let handles: Vec<_> = begs
                .chunks(chunk_size)
                .map(|chunk| {
                    let fill = &fill;
                    s.spawn(move || chunk.iter().map(|&beg| fill(beg)).collect::<Vec<_>>())
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().expect("span task panicked"))
                .collect()
        })
    }

    fn install(&mut self, span: Span, result: CellResult<'m>) {
        let CellResult {
            cands,
            kept,
            recombined,
        } = result;
        let mut slots: Vec<Option<Candidate<'m>>> = cands.into_iter().map(Some).collect();
        let kept_ids = kept
            .into_iter()
            .map(|i| self.arena.push(slots[i].take().expect("kept index unique")))
            .collect();
        let recombined_ids = recombined
            .into_iter()
            .map(|i| self.arena.push(slots[i].take().expect("recombined index unique")))
            .collect();
        self.chart
            .install(span, SpanBeam::new(kept_ids, recombined_ids));
    }

    fn words_to_str(&self, wids: &[SymbolId], drop_oov: bool) -> String {
        let words: Vec<&str> = wids
            .iter()
            .filter(|&&wid| !(drop_oov && self.oov_out_wids.contains(&wid)))
            .map(|&wid| self.models.tgt_vocab.word(wid))
            .collect();
        words.join(" ")
    }

    fn dump_rules(&self, out: &mut Vec<String>, id: CandId) {
        let cand = &self.arena[id];
        let src: Vec<&str> = cand
            .applied
            .src_ids
            .iter()
            .map(|&wid| self.models.src_vocab.word(wid))
            .collect();
        let tgt: Vec<&str> = match cand.applied.tgt {
            Some(rule) => rule
                .wids
                .iter()
                .map(|&wid| self.models.tgt_vocab.word(wid))
                .collect(),
            // OOV passthrough: the source word stands for itself.
            None => src.clone(),
        };
        out.push(format!("{} ||| {}", src.join(" "), tgt.join(" ")));
        if let Some(child) = cand.child_x1 {
            self.dump_rules(out, child);
        }
        if let Some(child) = cand.child_x2 {
            self.dump_rules(out, child);
        }
    }
}
