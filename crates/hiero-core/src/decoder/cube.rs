//! Cube pruning: best-first lazy expansion of the (rule × rank × rank)
//! cross product for one chart cell.
//!
//! An explicit max-heap holds frontier candidates; a visited set keyed by
//! (rule identity, rank_x1, rank_x2) guarantees each lattice point is
//! enqueued at most once. Popping a candidate enqueues its neighbours
//! (one rank further into either child beam). The pop budget bounds search
//! effort; the beam size bounds accepted output.
//!
//! Cells at the same span length never touch each other: a fill only reads
//! strictly shorter spans from the chart and returns its new candidates in
//! a [`CellResult`] for the driver to install.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use tracing::{debug, debug_span};

use crate::rules::TgtRule;
use crate::sentence::Span;

use super::candidate::Candidate;
use super::matcher::SpanRule;
use super::scoring::{self, DecodeCtx};

/// Output of one cell fill: locally indexed candidates plus the kept and
/// recombined index lists, remapped into the arena by the driver.
pub(crate) struct CellResult<'m> {
    pub cands: Vec<Candidate<'m>>,
    pub kept: Vec<usize>,
    pub recombined: Vec<usize>,
}

/// Fill one chart cell: seed phrase leaves (and the OOV passthrough for an
/// uncovered single word), then cube-prune over the span's applicable
/// rules. The kept list is score-sorted on return.
pub(crate) fn fill_cell<'m>(
    ctx: &DecodeCtx<'_, 'm>,
    span: Span,
    span_rules: &[SpanRule<'m>],
    phrase_rules: &[&'m TgtRule],
) -> CellResult<'m> {
    let _span_guard = debug_span!("fill_cell", beg = span.beg, len = span.len).entered();
    let params = &ctx.cfg.params;
    let whole_segment = ctx.sen.is_whole_segment(span);
    let mut cands: Vec<Candidate<'m>> = Vec::new();
    let mut beam = LocalBeam::new(params.beam_size, ctx.recomb_history());

    for &rule in phrase_rules {
        let mut cand = scoring::leaf_from_rule(ctx, span, rule);
        if whole_segment {
            apply_final_lm(ctx, &mut cand);
        }
        beam.add(&mut cands, cand);
    }
    if span.len == 0 && phrase_rules.is_empty() && ctx.sen.span_valid(span) {
        let mut cand = scoring::leaf_oov(ctx, span.beg);
        if whole_segment {
            apply_final_lm(ctx, &mut cand);
        }
        beam.add(&mut cands, cand);
    }

    let mut heap: BinaryHeap<HeapEntry<'m>> = BinaryHeap::new();
    let mut visited: HashSet<(usize, u32, u32)> = HashSet::new();
    let mut seq = 0u64;
    for (ri, rule) in span_rules.iter().enumerate() {
        if visited.insert((ri, 0, 0)) {
            if let Some(cand) = scoring::build_merge(ctx, rule, span, 0, 0) {
                heap.push(HeapEntry {
                    seq,
                    rule_idx: ri,
                    rank_x1: 0,
                    rank_x2: 0,
                    cand,
                });
                seq += 1;
            }
        }
    }

    let mut pops = 0usize;
    let mut accepted = 0usize;
    while pops < params.cube_size && accepted < params.beam_size {
        let Some(entry) = heap.pop() else {
            break;
        };
        pops += 1;
        let HeapEntry {
            rule_idx,
            rank_x1,
            rank_x2,
            mut cand,
            ..
        } = entry;

        if whole_segment {
            apply_final_lm(ctx, &mut cand);
        }

        let rule = &span_rules[rule_idx];
        let mut neighbours = vec![(rank_x1 + 1, rank_x2)];
        if rule.tgt.kind.nonterminals() == 2 {
            neighbours.push((rank_x1, rank_x2 + 1));
        }
        for (r1, r2) in neighbours {
            if visited.insert((rule_idx, r1, r2)) {
                if let Some(n) = scoring::build_merge(ctx, rule, span, r1, r2) {
                    heap.push(HeapEntry {
                        seq,
                        rule_idx,
                        rank_x1: r1,
                        rank_x2: r2,
                        cand: n,
                    });
                    seq += 1;
                }
            }
        }

        match beam.add(&mut cands, cand) {
            AddOutcome::Kept | AddOutcome::Recombined => accepted += 1,
            AddOutcome::Rejected => {}
        }
    }

    beam.sort(&cands);
    debug!(
        kept = beam.kept.len(),
        recombined = beam.recombined.len(),
        pops,
        "cell filled"
    );
    CellResult {
        cands,
        kept: beam.kept,
        recombined: beam.recombined,
    }
}

/// Sentence-final LM closure, applied once per candidate of a whole
/// sub-sentence span before beam acceptance. The boundary state is left
/// untouched: the closure is a pure function of it.
fn apply_final_lm(ctx: &DecodeCtx<'_, '_>, cand: &mut Candidate<'_>) {
    let extra = ctx.lm.finalize(&cand.lm_state);
    cand.lm_score += extra;
    cand.score += ctx.cfg.weights.lm * extra;
}

struct HeapEntry<'m> {
    seq: u64,
    rule_idx: usize,
    rank_x1: u32,
    rank_x2: u32,
    cand: Candidate<'m>,
}

impl Ord for HeapEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on score; earlier insertion wins ties for determinism.
        self.cand
            .score
            .total_cmp(&other.cand.score)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry<'_> {}

pub(crate) enum AddOutcome {
    Kept,
    Recombined,
    Rejected,
}

/// Capacity-bounded beam over locally indexed candidates, with
/// recombination against the kept representatives.
struct LocalBeam {
    beam_size: usize,
    recomb_h: usize,
    kept: Vec<usize>,
    recombined: Vec<usize>,
}

impl LocalBeam {
    fn new(beam_size: usize, recomb_h: usize) -> Self {
        LocalBeam {
            beam_size,
            recomb_h,
            kept: Vec::new(),
            recombined: Vec::new(),
        }
    }

    fn add<'t>(&mut self, cands: &mut Vec<Candidate<'t>>, cand: Candidate<'t>) -> AddOutcome {
        let key = cand.recomb_key(self.recomb_h);
        if let Some(slot) = self
            .kept
            .iter()
            .position(|&i| cands[i].recomb_key(self.recomb_h) == key)
        {
            let rep = self.kept[slot];
            let idx = cands.len();
            if cands[rep].score >= cand.score {
                // Dominated duplicate: retained, never re-expanded.
                cands.push(cand);
                self.recombined.push(idx);
                return AddOutcome::Recombined;
            }
            // The newcomer takes over as the class representative.
            cands.push(cand);
            self.kept[slot] = idx;
            self.recombined.push(rep);
            return AddOutcome::Kept;
        }

        if self.kept.len() < self.beam_size {
            let idx = cands.len();
            cands.push(cand);
            self.kept.push(idx);
            return AddOutcome::Kept;
        }

        let worst_slot = self
            .kept
            .iter()
            .enumerate()
            .min_by(|a, b| cands[*a.1].score.total_cmp(&cands[*b.1].score))
            .map(|(slot, _)| slot)
            .expect("beam_size is positive");
        if cands[self.kept[worst_slot]].score < cand.score {
            let idx = cands.len();
            cands.push(cand);
            self.kept[worst_slot] = idx;
            return AddOutcome::Kept;
        }
        AddOutcome::Rejected
    }

    /// Sort kept candidates by score, descending; equal scores keep
    /// insertion order.
    fn sort(&mut self, cands: &[Candidate<'_>]) {
        self.kept
            .sort_by(|&a, &b| cands[b].score.total_cmp(&cands[a].score).then(a.cmp(&b)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::LmState;
    use crate::sentence::Span;
    use crate::vocab::SymbolId;
    use std::sync::Arc;

    fn cand(score: f64, tgt: Vec<SymbolId>, suffix: Vec<SymbolId>) -> Candidate<'static> {
        let n = tgt.len();
        Candidate {
            span: Span::new(0, 0),
            rule_num: 1,
            glue_num: 0,
            tgt_word_num: n as u32,
            tgt_wids: tgt.clone(),
            aligned_src: vec![0; n],
            trans_probs: vec![],
            lm_score: 0.0,
            nnjm_score: 0.0,
            score,
            lm_state: LmState {
                prefix: tgt,
                suffix,
            },
            applied: super::super::candidate::AppliedRule {
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
    fn beam_keeps_best_within_capacity() {
        let mut cands = Vec::new();
        let mut beam = LocalBeam::new(2, 0);
        for (i, s) in [-3.0, -1.0, -2.0].iter().enumerate() {
            beam.add(&mut cands, cand(*s, vec![i as SymbolId], vec![i as SymbolId]));
        }
        beam.sort(&cands);
        let scores: Vec<f64> = beam.kept.iter().map(|&i| cands[i].score).collect();
        assert_eq!(scores, vec![-1.0, -2.0]);
    }

    #[test]
    fn worse_duplicate_goes_to_recombined() {
        let mut cands = Vec::new();
        let mut beam = LocalBeam::new(4, 0);
        beam.add(&mut cands, cand(-1.0, vec![7], vec![7]));
        let outcome = beam.add(&mut cands, cand(-2.0, vec![7], vec![7]));
        assert!(matches!(outcome, AddOutcome::Recombined));
        assert_eq!(beam.kept.len(), 1);
        assert_eq!(beam.recombined.len(), 1);
        assert_eq!(cands[beam.kept[0]].score, -1.0);
    }

    #[test]
    fn better_duplicate_takes_over_representative() {
        let mut cands = Vec::new();
        let mut beam = LocalBeam::new(4, 0);
        beam.add(&mut cands, cand(-2.0, vec![7], vec![7]));
        let outcome = beam.add(&mut cands, cand(-1.0, vec![7], vec![7]));
        assert!(matches!(outcome, AddOutcome::Kept));
        assert_eq!(beam.kept.len(), 1);
        assert_eq!(cands[beam.kept[0]].score, -1.0);
        assert_eq!(cands[beam.recombined[0]].score, -2.0);
    }

    #[test]
    fn full_beam_rejects_worse_candidates() {
        let mut cands = Vec::new();
        let mut beam = LocalBeam::new(1, 0);
        beam.add(&mut cands, cand(-1.0, vec![7], vec![7]));
        let outcome = beam.add(&mut cands, cand(-5.0, vec![8], vec![8]));
        assert!(matches!(outcome, AddOutcome::Rejected));
        assert_eq!(beam.kept.len(), 1);
    }

    #[test]
    fn sorted_beam_is_monotone_and_stable() {
        let mut cands = Vec::new();
        let mut beam = LocalBeam::new(8, 0);
        for (i, s) in [-2.0, -1.0, -2.0, -0.5].iter().enumerate() {
            beam.add(
                &mut cands,
                cand(*s, vec![10 + i as SymbolId], vec![10 + i as SymbolId]),
            );
        }
        beam.sort(&cands);
        let scores: Vec<f64> = beam.kept.iter().map(|&i| cands[i].score).collect();
        assert_eq!(scores, vec![-0.5, -1.0, -2.0, -2.0]);
        // The two -2.0 entries keep insertion order.
        assert_eq!(cands[beam.kept[2]].tgt_wids, vec![10]);
        assert_eq!(cands[beam.kept[3]].tgt_wids, vec![12]);
    }
}
