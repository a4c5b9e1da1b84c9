//! Backoff n-gram language model with chart-decoder scoring state.
//!
//! Scores are log10 conditional probabilities. Each hypothesis carries an
//! [`LmState`] (its first and last `order-1` target words) so a merge can
//! extend scores incrementally: a child's leading words were charged with
//! truncated context at construction time, and the difference is repaid the
//! moment more left context becomes known. The final begin/end-of-sentence
//! closure is applied exactly once, on whole sub-sentence spans.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::Path;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::vocab::{SymbolId, Vocab};

const MAGIC: &[u8; 4] = b"HGLM";
const VERSION: u8 = 1;
const HEADER_SIZE: usize = 4 + 1 + 4 + 8; // magic + version + crc32 + payload_len

/// Default log10 cost for words absent from the model (no `<unk>` entry).
const UNK_LOGPROB_DEFAULT: f64 = -99.0;

#[derive(Debug, thiserror::Error)]
pub enum LmError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid header (too short)")]
    InvalidHeader,

    #[error("invalid magic bytes (expected HGLM)")]
    InvalidMagic,

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("payload checksum mismatch")]
    ChecksumMismatch,

    #[error("serialization error: {0}")]
    Serialize(bincode::Error),

    #[error("deserialization error: {0}")]
    Deserialize(bincode::Error),

    #[error("ARPA parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct NgramEntry {
    prob: f64,
    backoff: f64,
}

/// Boundary state of a scored hypothesis: the words whose probabilities can
/// still improve when left context arrives (`prefix`), and the words that
/// serve as context for whatever follows (`suffix`). Both hold at most
/// `order-1` entries. Equal states are interchangeable for all future
/// derivations, which is exactly the recombination criterion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LmState {
    pub prefix: Vec<SymbolId>,
    pub suffix: Vec<SymbolId>,
}

#[derive(Serialize, Deserialize)]
pub struct NgramLm {
    order: usize,
    ngrams: HashMap<Vec<SymbolId>, NgramEntry>,
    bos: SymbolId,
    eos: SymbolId,
    unk_logprob: f64,
}

impl NgramLm {
    /// Build directly from `(ngram, prob, backoff)` triples.
    pub fn from_entries(
        order: usize,
        bos: SymbolId,
        eos: SymbolId,
        entries: impl IntoIterator<Item = (Vec<SymbolId>, f64, f64)>,
    ) -> Self {
        let ngrams = entries
            .into_iter()
            .map(|(key, prob, backoff)| (key, NgramEntry { prob, backoff }))
            .collect();
        NgramLm {
            order,
            ngrams,
            bos,
            eos,
            unk_logprob: UNK_LOGPROB_DEFAULT,
        }
    }

    /// Parse an ARPA text model, interning its words through `vocab`.
    pub fn from_arpa(text: &str, vocab: &mut Vocab) -> Result<Self, LmError> {
        let mut order = 0;
        let mut current_n = 0usize;
        let mut ngrams = HashMap::new();
        let mut unk_logprob = UNK_LOGPROB_DEFAULT;

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line == "\\data\\" || line == "\\end\\" {
                continue;
            }
            if let Some(counts) = line.strip_prefix("ngram ") {
                let n: usize = counts
                    .split('=')
                    .next()
                    .and_then(|s| s.trim().parse().ok())
                    .ok_or_else(|| LmError::Parse(format!("bad count line: {line}")))?;
                order = order.max(n);
                continue;
            }
            if let Some(section) = line.strip_suffix("-grams:") {
                current_n = section
                    .trim_start_matches('\\')
                    .parse()
                    .map_err(|_| LmError::Parse(format!("bad section header: {line}")))?;
                continue;
            }
            if current_n == 0 {
                continue;
            }

            let mut parts = line.split_whitespace();
            let prob: f64 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| LmError::Parse(format!("bad ngram line: {line}")))?;
            let mut key = Vec::with_capacity(current_n);
            for _ in 0..current_n {
                let word = parts
                    .next()
                    .ok_or_else(|| LmError::Parse(format!("short ngram line: {line}")))?;
                key.push(vocab.get_or_intern(word));
            }
            let backoff: f64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);

            if current_n == 1 && key[0] == vocab.unk() {
                unk_logprob = prob;
            }
            ngrams.insert(key, NgramEntry { prob, backoff });
        }

        if order == 0 {
            return Err(LmError::Parse("no ngram counts found".to_string()));
        }
        Ok(NgramLm {
            order,
            ngrams,
            bos: vocab.bos(),
            eos: vocab.eos(),
            unk_logprob,
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn ngram_count(&self) -> usize {
        self.ngrams.len()
    }

    /// log10 P(w | ctx), with `ctx` truncated to the last `order-1` words.
    pub fn prob(&self, w: SymbolId, ctx: &[SymbolId]) -> f64 {
        let start = ctx.len().saturating_sub(self.order - 1);
        self.prob_backoff(w, &ctx[start..])
    }

    fn prob_backoff(&self, w: SymbolId, ctx: &[SymbolId]) -> f64 {
        let mut key = Vec::with_capacity(ctx.len() + 1);
        key.extend_from_slice(ctx);
        key.push(w);
        if let Some(e) = self.ngrams.get(key.as_slice()) {
            return e.prob;
        }
        if ctx.is_empty() {
            return self.unk_logprob;
        }
        let backoff = self.ngrams.get(ctx).map(|e| e.backoff).unwrap_or(0.0);
        backoff + self.prob_backoff(w, &ctx[1..])
    }

    pub fn scorer(&self) -> RuleScorer<'_> {
        RuleScorer {
            lm: self,
            delta: 0.0,
            seen_any: false,
            anchored: false,
            prefix: Vec::new(),
            context: Vec::new(),
        }
    }

    /// Begin/end-of-sentence closure for a completed sub-sentence: rescore
    /// the hypothesis prefix against `<s>` and charge the `</s>` step.
    pub fn finalize(&self, state: &LmState) -> f64 {
        let mut sc = self.scorer();
        sc.begin_sentence();
        sc.nonterminal(state);
        sc.terminal(self.eos);
        sc.finish().0
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, LmError> {
        let payload = bincode::serialize(self).map_err(LmError::Serialize)?;
        let crc = crc32fast::hash(&payload);
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(MAGIC);
        buf.push(VERSION);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, LmError> {
        if data.len() < 5 {
            return Err(LmError::InvalidHeader);
        }
        if &data[..4] != MAGIC {
            return Err(LmError::InvalidMagic);
        }
        if data[4] != VERSION {
            return Err(LmError::UnsupportedVersion(data[4]));
        }
        if data.len() < HEADER_SIZE {
            return Err(LmError::InvalidHeader);
        }
        let crc = u32::from_le_bytes(data[5..9].try_into().expect("4 bytes"));
        let payload_len = u64::from_le_bytes(data[9..17].try_into().expect("8 bytes")) as usize;
        if data.len() < HEADER_SIZE + payload_len {
            return Err(LmError::InvalidHeader);
        }
        let payload = &data[HEADER_SIZE..HEADER_SIZE + payload_len];
        if crc32fast::hash(payload) != crc {
            return Err(LmError::ChecksumMismatch);
        }
        bincode::deserialize(payload).map_err(LmError::Deserialize)
    }

    /// Open a compiled model file via mmap.
    pub fn open(path: &Path) -> Result<Self, LmError> {
        let file = File::open(path)?;
        // SAFETY: the file is opened read-only and the mapping is dropped
        // after deserialization completes.
        let mmap = unsafe { Mmap::map(&file)? };
        let lm = Self::from_bytes(&mmap)?;
        info!(path = %path.display(), order = lm.order, ngrams = lm.ngrams.len(), "loaded language model");
        Ok(lm)
    }

    pub fn save(&self, path: &Path) -> Result<(), LmError> {
        Ok(fs::write(path, self.to_bytes()?)?)
    }
}

/// Incremental scorer for one rule application: feed the rule's target
/// template left to right, passing a child's [`LmState`] at each
/// nonterminal slot instead of re-reading the child's words.
pub struct RuleScorer<'a> {
    lm: &'a NgramLm,
    delta: f64,
    seen_any: bool,
    anchored: bool,
    prefix: Vec<SymbolId>,
    context: Vec<SymbolId>,
}

impl RuleScorer<'_> {
    /// Anchor the hypothesis at the sentence start. Must precede any word.
    pub fn begin_sentence(&mut self) {
        debug_assert!(!self.seen_any, "begin_sentence after words were fed");
        self.anchored = true;
        self.context.push(self.lm.bos);
    }

    pub fn terminal(&mut self, w: SymbolId) {
        self.delta += self.lm.prob(w, &self.context);
        self.push_word(w);
    }

    /// Splice in an already-scored child. Its prefix words were charged with
    /// the child's own truncated context; repay the difference now that the
    /// words to its left are known.
    pub fn nonterminal(&mut self, st: &LmState) {
        for (i, &w) in st.prefix.iter().enumerate() {
            if self.seen_any || self.anchored {
                let old = self.lm.prob(w, &st.prefix[..i]);
                let mut ctx = self.context.clone();
                ctx.extend_from_slice(&st.prefix[..i]);
                let new = self.lm.prob(w, &ctx);
                self.delta += new - old;
            }
            if !self.anchored && self.prefix.len() < self.lm.order - 1 {
                self.prefix.push(w);
            }
        }
        self.context.extend_from_slice(&st.suffix);
        let keep = self.lm.order - 1;
        if self.context.len() > keep {
            self.context.drain(..self.context.len() - keep);
        }
        self.seen_any |= !st.suffix.is_empty();
    }

    fn push_word(&mut self, w: SymbolId) {
        if !self.anchored && self.prefix.len() < self.lm.order - 1 {
            self.prefix.push(w);
        }
        self.context.push(w);
        let keep = self.lm.order - 1;
        if self.context.len() > keep {
            self.context.drain(..self.context.len() - keep);
        }
        self.seen_any = true;
    }

    /// Total score delta for this rule application, and the resulting state.
    pub fn finish(self) -> (f64, LmState) {
        let mut suffix = self.context;
        if self.anchored && suffix.first() == Some(&self.lm.bos) {
            suffix.remove(0);
        }
        (
            self.delta,
            LmState {
                prefix: self.prefix,
                suffix,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOS: SymbolId = 0;
    const EOS: SymbolId = 1;

    fn trigram_lm() -> NgramLm {
        // Words: 10 "a", 11 "b", 12 "c".
        NgramLm::from_entries(
            3,
            BOS,
            EOS,
            vec![
                (vec![10], -1.0, -0.1),
                (vec![11], -1.2, -0.2),
                (vec![12], -1.4, -0.3),
                (vec![BOS], -99.0, -0.05),
                (vec![EOS], -1.6, 0.0),
                (vec![10, 11], -0.4, -0.15),
                (vec![11, 12], -0.5, -0.25),
                (vec![BOS, 10], -0.3, -0.12),
                (vec![12, EOS], -0.6, 0.0),
                (vec![10, 11, 12], -0.2, 0.0),
                (vec![BOS, 10, 11], -0.25, 0.0),
            ],
        )
    }

    fn score_flat(lm: &NgramLm, words: &[SymbolId]) -> (f64, LmState) {
        let mut sc = lm.scorer();
        for &w in words {
            sc.terminal(w);
        }
        sc.finish()
    }

    #[test]
    fn backoff_chain() {
        let lm = trigram_lm();
        // (11, 12) exists directly.
        assert!((lm.prob(12, &[11]) - -0.5).abs() < 1e-12);
        // (12, 11) missing: backoff(12) + p(11) = -0.3 + -1.2.
        assert!((lm.prob(11, &[12]) - -1.5).abs() < 1e-12);
        // Unknown word: the floor, plus the context backoff weights.
        assert!((lm.prob(77, &[]) - -99.0).abs() < 1e-12);
        assert!((lm.prob(77, &[10, 11]) - (-0.15 - 0.2 - 99.0)).abs() < 1e-9);
    }

    #[test]
    fn context_truncated_to_order() {
        let lm = trigram_lm();
        assert_eq!(lm.prob(12, &[99, 98, 10, 11]), lm.prob(12, &[10, 11]));
    }

    #[test]
    fn state_keeps_boundary_words() {
        let lm = trigram_lm();
        let (_, st) = score_flat(&lm, &[10, 11, 12]);
        assert_eq!(st.prefix, vec![10, 11]);
        assert_eq!(st.suffix, vec![11, 12]);

        let (_, st_short) = score_flat(&lm, &[10]);
        assert_eq!(st_short.prefix, vec![10]);
        assert_eq!(st_short.suffix, vec![10]);
    }

    #[test]
    fn merge_matches_flat_scoring() {
        let lm = trigram_lm();
        let words = [10, 11, 12, 10, 11];
        let (flat, flat_state) = score_flat(&lm, &words);

        for split in 1..words.len() {
            let (left, left_state) = score_flat(&lm, &words[..split]);
            let (right, right_state) = score_flat(&lm, &words[split..]);
            let mut sc = lm.scorer();
            sc.nonterminal(&left_state);
            sc.nonterminal(&right_state);
            let (delta, merged_state) = sc.finish();
            let total = left + right + delta;
            assert!(
                (total - flat).abs() < 1e-9,
                "split at {split}: {total} != {flat}"
            );
            assert_eq!(merged_state, flat_state, "state mismatch at split {split}");
        }
    }

    #[test]
    fn merge_with_interleaved_terminals_matches_flat() {
        let lm = trigram_lm();
        // Template: "a X c" with child "b".
        let (child, child_state) = score_flat(&lm, &[11]);
        let mut sc = lm.scorer();
        sc.terminal(10);
        sc.nonterminal(&child_state);
        sc.terminal(12);
        let (delta, state) = sc.finish();

        let (flat, flat_state) = score_flat(&lm, &[10, 11, 12]);
        assert!((child + delta - flat).abs() < 1e-9);
        assert_eq!(state, flat_state);
    }

    #[test]
    fn finalize_matches_anchored_scoring() {
        let lm = trigram_lm();
        let words = [10, 11, 12];
        let (open, state) = score_flat(&lm, &words);
        let total = open + lm.finalize(&state);

        let mut sc = lm.scorer();
        sc.begin_sentence();
        for &w in &words {
            sc.terminal(w);
        }
        sc.terminal(EOS);
        let (anchored, _) = sc.finish();
        assert!((total - anchored).abs() < 1e-9);
    }

    #[test]
    fn finalize_uses_bos_trigram() {
        let lm = trigram_lm();
        let (_, state) = score_flat(&lm, &[10, 11]);
        let closure = lm.finalize(&state);
        // p(a|<s>) - p(a) + p(b|<s> a) - p(b|a) + p(</s>|a b).
        let expected = (-0.3 - -1.0) + (-0.25 - -0.4) + lm.prob(EOS, &[10, 11]);
        assert!((closure - expected).abs() < 1e-9);
    }

    #[test]
    fn arpa_round_trip() {
        let arpa = "\
\\data\\
ngram 1=4
ngram 2=2

\\1-grams:
-1.0	the	-0.5
-2.0	cat
-1.5	<s>	-0.2
-1.8	</s>

\\2-grams:
-0.3	the	cat
-0.4	<s>	the

\\end\\
";
        let mut vocab = Vocab::new();
        let lm = NgramLm::from_arpa(arpa, &mut vocab).unwrap();
        assert_eq!(lm.order(), 2);
        let the = vocab.get_id("the").unwrap();
        let cat = vocab.get_id("cat").unwrap();
        assert!((lm.prob(cat, &[the]) - -0.3).abs() < 1e-12);
        // Missing bigram backs off through "cat"'s (absent) backoff weight.
        assert!((lm.prob(the, &[cat]) - -1.0).abs() < 1e-12);
    }

    #[test]
    fn arpa_without_counts_is_an_error() {
        let mut vocab = Vocab::new();
        assert!(matches!(
            NgramLm::from_arpa("\\1-grams:\n-1.0 the\n", &mut vocab),
            Err(LmError::Parse(_))
        ));
    }

    #[test]
    fn binary_round_trip_and_corruption() {
        let lm = trigram_lm();
        let bytes = lm.to_bytes().unwrap();
        let back = NgramLm::from_bytes(&bytes).unwrap();
        assert_eq!(back.order(), 3);
        assert_eq!(back.ngram_count(), lm.ngram_count());
        assert_eq!(back.prob(12, &[10, 11]), lm.prob(12, &[10, 11]));

        let mut corrupt = bytes.clone();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xff;
        assert!(matches!(
            NgramLm::from_bytes(&corrupt),
            Err(LmError::ChecksumMismatch)
        ));

        assert!(matches!(
            NgramLm::from_bytes(b"XXXX"),
            Err(LmError::InvalidHeader) | Err(LmError::InvalidMagic)
        ));
    }

    #[test]
    fn save_open_round_trip() {
        let lm = trigram_lm();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.hglm");
        lm.save(&path).unwrap();
        let back = NgramLm::open(&path).unwrap();
        assert_eq!(back.order(), lm.order());
    }
}
