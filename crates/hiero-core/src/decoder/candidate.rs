//! Translation hypotheses, the per-sentence candidate arena, and span beams.
//!
//! Candidates form a DAG: a merge candidate points at the one or two
//! sub-candidates it was built from. Children are referenced by arena index,
//! never owned; the whole arena is dropped as a unit when sentence decoding
//! ends, so no per-candidate lifetime bookkeeping is needed.

use std::sync::Arc;

use crate::lm::LmState;
use crate::rules::TgtRule;
use crate::sentence::Span;
use crate::vocab::SymbolId;

/// Index into the sentence's [`CandArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CandId(pub u32);

/// The rule instance a candidate was built with: a shared copy of the
/// matched source symbol sequence, a borrowed target alternative (`None`
/// for the OOV passthrough leaf), and the concrete sub-spans bound to the
/// target-side nonterminals.
#[derive(Debug, Clone)]
pub struct AppliedRule<'t> {
    pub src_ids: Arc<[SymbolId]>,
    pub tgt: Option<&'t TgtRule>,
    pub span_x1: Option<Span>,
    pub span_x2: Option<Span>,
}

/// One scored hypothesis covering `span`. Fully populated at construction
/// and never mutated afterwards (the sentence-final LM closure is applied
/// before beam acceptance, while the candidate is still owned by the
/// search).
#[derive(Debug, Clone)]
pub struct Candidate<'t> {
    pub span: Span,
    pub rule_num: u32,
    pub glue_num: u32,
    pub tgt_word_num: u32,
    pub tgt_wids: Vec<SymbolId>,
    /// Absolute aligned source index per target word.
    pub aligned_src: Vec<usize>,
    /// Per-feature translation log-probability accumulators.
    pub trans_probs: Vec<f64>,
    pub lm_score: f64,
    pub nnjm_score: f64,
    /// Total weighted score.
    pub score: f64,
    pub lm_state: LmState,
    pub applied: AppliedRule<'t>,
    pub rank_x1: u32,
    pub rank_x2: Option<u32>,
    pub child_x1: Option<CandId>,
    pub child_x2: Option<CandId>,
}

impl Candidate<'_> {
    /// State visible to future derivations: LM boundary state plus, when
    /// the joint model is active (`h > 0`), the target boundary words whose
    /// scores can still change (leading, with their source alignment) or
    /// that act as history for what follows (trailing).
    pub fn recomb_key(&self, h: usize) -> RecombKey {
        let take = h.min(self.tgt_wids.len());
        let head = self
            .tgt_wids
            .iter()
            .zip(&self.aligned_src)
            .take(take)
            .map(|(&w, &a)| (w, a))
            .collect();
        let tail = self.tgt_wids[self.tgt_wids.len() - take..].to_vec();
        RecombKey {
            lm_state: self.lm_state.clone(),
            nnjm_head: head,
            nnjm_tail: tail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecombKey {
    lm_state: LmState,
    nnjm_head: Vec<(SymbolId, usize)>,
    nnjm_tail: Vec<SymbolId>,
}

/// Growable per-sentence candidate store. Ids are stable; nothing is ever
/// removed before the arena as a whole is dropped.
pub struct CandArena<'t> {
    cands: Vec<Candidate<'t>>,
}

impl<'t> CandArena<'t> {
    pub fn new() -> Self {
        CandArena { cands: Vec::new() }
    }

    pub fn push(&mut self, cand: Candidate<'t>) -> CandId {
        let id = CandId(self.cands.len() as u32);
        self.cands.push(cand);
        id
    }

    pub fn get(&self, id: CandId) -> &Candidate<'t> {
        &self.cands[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.cands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cands.is_empty()
    }
}

impl<'t> Default for CandArena<'t> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'t> std::ops::Index<CandId> for CandArena<'t> {
    type Output = Candidate<'t>;

    fn index(&self, id: CandId) -> &Self::Output {
        self.get(id)
    }
}

/// Final beam contents for one chart cell: `kept` is score-sorted and
/// capacity-bounded; `recombined` holds dominated duplicates that stay
/// reconstructable for rule tracing but are never used as merge sources.
#[derive(Debug, Default)]
pub struct SpanBeam {
    kept: Vec<CandId>,
    recombined: Vec<CandId>,
}

impl SpanBeam {
    pub fn new(kept: Vec<CandId>, recombined: Vec<CandId>) -> Self {
        SpanBeam { kept, recombined }
    }

    pub fn kept(&self) -> &[CandId] {
        &self.kept
    }

    pub fn recombined(&self) -> &[CandId] {
        &self.recombined
    }

    pub fn top(&self) -> Option<CandId> {
        self.kept.first().copied()
    }

    pub fn len(&self) -> usize {
        self.kept.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }
}

/// The (start, length)-addressed matrix of span beams.
pub struct Chart {
    cells: Vec<Vec<SpanBeam>>,
}

impl Chart {
    pub fn new(n: usize) -> Self {
        let cells = (0..n)
            .map(|beg| (0..n - beg).map(|_| SpanBeam::default()).collect())
            .collect();
        Chart { cells }
    }

    pub fn beam(&self, span: Span) -> &SpanBeam {
        &self.cells[span.beg][span.len]
    }

    pub fn install(&mut self, span: Span, beam: SpanBeam) {
        self.cells[span.beg][span.len] = beam;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_cand(score: f64, tgt: Vec<SymbolId>) -> Candidate<'static> {
        let n = tgt.len();
        Candidate {
            span: Span::new(0, 0),
            rule_num: 1,
            glue_num: 0,
            tgt_word_num: n as u32,
            tgt_wids: tgt,
            aligned_src: vec![0; n],
            trans_probs: vec![],
            lm_score: 0.0,
            nnjm_score: 0.0,
            score,
            lm_state: LmState::default(),
            applied: AppliedRule {
                src_ids: Arc::from([0u32].as_slice()),
                tgt: None,
                span_x1: None,
                span_x2: None,
            },
            rank_x1: 0,
            rank_x2: None,
            child_x1: None,
            child_x2: None,
        }
    }

    #[test]
    fn arena_ids_are_stable() {
        let mut arena = CandArena::new();
        assert!(arena.is_empty());
        let a = arena.push(dummy_cand(-1.0, vec![5]));
        let b = arena.push(dummy_cand(-2.0, vec![6]));
        assert_ne!(a, b);
        assert_eq!(arena.len(), 2);
        assert_eq!(arena[a].tgt_wids, vec![5]);
        assert_eq!(arena[b].tgt_wids, vec![6]);
    }

    #[test]
    fn recomb_key_ignores_score_and_counts() {
        let mut a = dummy_cand(-1.0, vec![5, 6]);
        let mut b = dummy_cand(-9.0, vec![5, 6]);
        a.lm_state = LmState {
            prefix: vec![5],
            suffix: vec![6],
        };
        b.lm_state = a.lm_state.clone();
        b.rule_num = 7;
        assert_eq!(a.recomb_key(0), b.recomb_key(0));
        assert_eq!(a.recomb_key(2), b.recomb_key(2));
    }

    #[test]
    fn recomb_key_sees_nnjm_boundary() {
        let a = dummy_cand(-1.0, vec![5, 6, 7]);
        let mut b = dummy_cand(-1.0, vec![5, 6, 8]);
        b.lm_state = a.lm_state.clone();
        // Identical under LM-only recombination...
        assert_eq!(a.recomb_key(0), b.recomb_key(0));
        // ...distinct once the trailing joint-model context is visible.
        assert_ne!(a.recomb_key(2), b.recomb_key(2));
    }

    #[test]
    fn chart_addressing() {
        let mut chart = Chart::new(3);
        let span = Span::new(1, 1);
        assert!(chart.beam(span).is_empty());
        chart.install(span, SpanBeam::new(vec![CandId(4)], vec![]));
        assert_eq!(chart.beam(span).top(), Some(CandId(4)));
        assert_eq!(chart.beam(span).len(), 1);
        assert!(chart.beam(span).recombined().is_empty());
        assert_eq!(chart.beam(Span::new(0, 2)).top(), None);
    }
}
