//! Candidate construction: leaf seeding, cube-pruning merges, and the
//! log-linear feature composition.
//!
//! Scores are strictly additive: a merge candidate's total is its
//! children's finalized totals plus this rule application's own deltas
//! (rule score, incremental LM, incremental joint-model, count features).
//! Children are never re-scored.

use std::sync::Arc;

use crate::config::DecoderConfig;
use crate::lm::NgramLm;
use crate::nnjm::{self, ContextKey, JointScorer, ScoreCache};
use crate::rules::{AlignPoint, TgtRule, LOGPROB_PSEUDO_ZERO};
use crate::sentence::{SourceSentence, Span};
use crate::vocab::SymbolId;

use super::candidate::{AppliedRule, CandArena, Candidate, Chart};
use super::matcher::SpanRule;

/// Read-only view of everything one cell fill needs. Shared by reference
/// across same-length span tasks; all fields are immutable or internally
/// synchronized.
pub(crate) struct DecodeCtx<'a, 'm> {
    pub cfg: &'a DecoderConfig,
    pub lm: &'a NgramLm,
    pub sen: &'a SourceSentence,
    pub chart: &'a Chart,
    pub arena: &'a CandArena<'m>,
    pub src_nt: SymbolId,
    pub tgt_nt: SymbolId,
    pub src_bos: SymbolId,
    pub src_eos: SymbolId,
    pub tgt_bos: SymbolId,
    /// Per source position: the target id of the passthrough token.
    pub oov_tgt: &'a [SymbolId],
    pub nnjm: Option<&'a dyn JointScorer>,
    pub nnjm_cache: &'a ScoreCache,
}

impl DecodeCtx<'_, '_> {
    fn nnjm_enabled(&self) -> bool {
        self.cfg.nnjm.enabled && self.nnjm.is_some()
    }

    /// History length relevant to recombination (0 when disabled).
    pub fn recomb_history(&self) -> usize {
        if self.nnjm_enabled() {
            self.cfg.nnjm.target_history
        } else {
            0
        }
    }
}

/// Leaf built from a phrase rule matched directly on `span`.
pub(crate) fn leaf_from_rule<'m>(
    ctx: &DecodeCtx<'_, 'm>,
    span: Span,
    rule: &'m TgtRule,
) -> Candidate<'m> {
    let w = &ctx.cfg.weights;
    let src_ids: Arc<[SymbolId]> = Arc::from(&ctx.sen.wids()[span.beg..=span.end()]);

    let mut raw_aligned: Vec<Option<usize>> = Vec::with_capacity(rule.wids.len());
    let mut scorer = ctx.lm.scorer();
    for (i, &wid) in rule.wids.iter().enumerate() {
        scorer.terminal(wid);
        raw_aligned.push(match rule.align[i] {
            AlignPoint::Src(j) => Some(span.beg + j.min(span.len)),
            _ => None,
        });
    }
    let (lm_score, lm_state) = scorer.finish();
    let aligned_src = resolve_unaligned(raw_aligned, span.beg);

    let nnjm_score = score_positions_fresh(ctx, span, &rule.wids, &aligned_src, 0..rule.wids.len());

    let score = rule.score
        + w.rule_num
        + w.len * rule.word_num as f64
        + w.lm * lm_score
        + w.nnjm * nnjm_score;

    Candidate {
        span,
        rule_num: 1,
        glue_num: 0,
        tgt_word_num: rule.word_num as u32,
        tgt_wids: rule.wids.clone(),
        aligned_src,
        trans_probs: rule.probs.clone(),
        lm_score,
        nnjm_score,
        score,
        lm_state,
        applied: AppliedRule {
            src_ids,
            tgt: Some(rule),
            span_x1: None,
            span_x2: None,
        },
        rank_x1: 0,
        rank_x2: None,
        child_x1: None,
        child_x2: None,
    }
}

/// Passthrough leaf for a single uncovered source word: the word translates
/// as itself, every translation feature at the pseudo-zero floor.
pub(crate) fn leaf_oov<'m>(ctx: &DecodeCtx<'_, 'm>, beg: usize) -> Candidate<'m> {
    let w = &ctx.cfg.weights;
    let span = Span::new(beg, 0);
    let tgt_wids = vec![ctx.oov_tgt[beg]];
    let aligned_src = vec![beg];
    let trans_probs = vec![LOGPROB_PSEUDO_ZERO; w.trans.len()];

    let mut scorer = ctx.lm.scorer();
    scorer.terminal(tgt_wids[0]);
    let (lm_score, lm_state) = scorer.finish();

    let nnjm_score = score_positions_fresh(ctx, span, &tgt_wids, &aligned_src, 0..1);

    let trans_part: f64 = w.trans.iter().map(|tw| tw * LOGPROB_PSEUDO_ZERO).sum();
    let score = trans_part + w.rule_num + w.len + w.lm * lm_score + w.nnjm * nnjm_score;

    Candidate {
        span,
        rule_num: 1,
        glue_num: 0,
        tgt_word_num: 1,
        tgt_wids,
        aligned_src,
        trans_probs,
        lm_score,
        nnjm_score,
        score,
        lm_state,
        applied: AppliedRule {
            src_ids: Arc::from([ctx.sen.wid(beg)].as_slice()),
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

/// Merge candidate for `rule` over `span`, taking the `rank_x1`/`rank_x2`
/// entries of the sub-span beams. `None` when a referenced rank does not
/// exist (beam exhausted); the caller skips silently.
pub(crate) fn build_merge<'m>(
    ctx: &DecodeCtx<'_, 'm>,
    rule: &SpanRule<'m>,
    span: Span,
    rank_x1: u32,
    rank_x2: u32,
) -> Option<Candidate<'m>> {
    let tgt = rule.tgt;
    let w = &ctx.cfg.weights;
    let two_nt = tgt.kind.nonterminals() == 2;

    let beam_x1 = ctx.chart.beam(rule.span_x1?);
    let id_x1 = *beam_x1.kept().get(rank_x1 as usize)?;
    let cand_x1 = ctx.arena.get(id_x1);
    let (id_x2, cand_x2) = if two_nt {
        let beam_x2 = ctx.chart.beam(rule.span_x2?);
        let id = *beam_x2.kept().get(rank_x2 as usize)?;
        (Some(id), Some(ctx.arena.get(id)))
    } else {
        (None, None)
    };

    let glue = tgt.kind.is_glue();
    let child_rule_num = cand_x1.rule_num + cand_x2.map_or(0, |c| c.rule_num);
    let child_glue_num = cand_x1.glue_num + cand_x2.map_or(0, |c| c.glue_num);
    let rule_num = child_rule_num + if glue { 0 } else { 1 };
    let glue_num = child_glue_num + if glue { 1 } else { 0 };
    let tgt_word_num =
        cand_x1.tgt_word_num + cand_x2.map_or(0, |c| c.tgt_word_num) + tgt.word_num as u32;

    // Target assembly: walk the rule template, splicing each child's full
    // target sequence at its nonterminal slot while the LM scorer consumes
    // the same template incrementally.
    let mut tgt_wids = Vec::new();
    let mut raw_aligned: Vec<Option<usize>> = Vec::new();
    let mut terminal_positions = Vec::new();
    let mut splices: Vec<(usize, &Candidate)> = Vec::new();
    let mut scorer = ctx.lm.scorer();
    let mut nt_seen = 0;
    for (i, &wid) in tgt.wids.iter().enumerate() {
        if wid == ctx.tgt_nt {
            let child = if nt_seen == 0 { cand_x1 } else { cand_x2? };
            nt_seen += 1;
            splices.push((tgt_wids.len(), child));
            scorer.nonterminal(&child.lm_state);
            tgt_wids.extend_from_slice(&child.tgt_wids);
            raw_aligned.extend(child.aligned_src.iter().map(|&a| Some(a)));
        } else {
            scorer.terminal(wid);
            terminal_positions.push(tgt_wids.len());
            tgt_wids.push(wid);
            raw_aligned.push(match tgt.align[i] {
                AlignPoint::Src(j) => Some(abs_src_index(ctx, rule, span, j)),
                _ => None,
            });
        }
    }
    let (lm_delta, lm_state) = scorer.finish();
    let lm_score = cand_x1.lm_score + cand_x2.map_or(0.0, |c| c.lm_score) + lm_delta;

    let aligned_src = resolve_unaligned(raw_aligned, span.beg);
    debug_assert_eq!(aligned_src.len(), tgt_wids.len());
    debug_assert!(aligned_src.iter().all(|&a| span.contains(a)));

    let mut trans_probs = tgt.probs.clone();
    for (i, p) in trans_probs.iter_mut().enumerate() {
        *p += cand_x1.trans_probs[i] + cand_x2.map_or(0.0, |c| c.trans_probs[i]);
    }

    let nnjm_delta = nnjm_merge_delta(
        ctx,
        span,
        &tgt_wids,
        &aligned_src,
        &terminal_positions,
        &splices,
    );
    let nnjm_score = cand_x1.nnjm_score + cand_x2.map_or(0.0, |c| c.nnjm_score) + nnjm_delta;

    let score = cand_x1.score
        + cand_x2.map_or(0.0, |c| c.score)
        + tgt.score
        + w.lm * lm_delta
        + w.rule_num
        + if glue { w.glue } else { 0.0 }
        + w.len * tgt.word_num as f64
        + w.nnjm * nnjm_delta;

    Some(Candidate {
        span,
        rule_num,
        glue_num,
        tgt_word_num,
        tgt_wids,
        aligned_src,
        trans_probs,
        lm_score,
        nnjm_score,
        score,
        lm_state,
        applied: AppliedRule {
            src_ids: Arc::clone(&rule.src_ids),
            tgt: Some(tgt),
            span_x1: rule.span_x1,
            span_x2: rule.span_x2,
        },
        rank_x1,
        rank_x2: two_nt.then_some(rank_x2),
        child_x1: Some(id_x1),
        child_x2: id_x2,
    })
}

/// Absolute sentence index of the rule-relative source symbol `j`: walk the
/// rule's source side, a nonterminal advancing by its bound sub-span width.
fn abs_src_index(ctx: &DecodeCtx<'_, '_>, rule: &SpanRule<'_>, span: Span, j: usize) -> usize {
    let (nt1, nt2) = rule.src_order_nt_spans();
    let mut abs = span.beg;
    let mut nt_seen = 0;
    for &s in rule.src_ids.iter().take(j) {
        if s == ctx.src_nt {
            let width = match nt_seen {
                0 => nt1.map_or(1, |sp| sp.width()),
                _ => nt2.map_or(1, |sp| sp.width()),
            };
            nt_seen += 1;
            abs += width;
        } else {
            abs += 1;
        }
    }
    abs.min(span.end())
}

/// Fill unaligned target positions from the nearest originally-aligned
/// neighbour, left before right at equal distance; `fallback` covers the
/// no-anchor case.
fn resolve_unaligned(raw: Vec<Option<usize>>, fallback: usize) -> Vec<usize> {
    let n = raw.len();
    let mut out = Vec::with_capacity(n);
    for p in 0..n {
        if let Some(a) = raw[p] {
            out.push(a);
            continue;
        }
        let mut found = None;
        for d in 1..n {
            if let Some(Some(a)) = p.checked_sub(d).map(|q| raw[q]) {
                found = Some(a);
                break;
            }
            if let Some(Some(a)) = raw.get(p + d).copied() {
                found = Some(a);
                break;
            }
        }
        out.push(found.unwrap_or(fallback));
    }
    out
}

/// Joint-model scores for freshly placed target positions.
fn score_positions_fresh(
    ctx: &DecodeCtx<'_, '_>,
    span: Span,
    tgt: &[SymbolId],
    aligned: &[usize],
    positions: impl IntoIterator<Item = usize>,
) -> f64 {
    if !ctx.nnjm_enabled() {
        return 0.0;
    }
    let seg = ctx
        .sen
        .segment_bounds(span)
        .unwrap_or((0, ctx.sen.len()));
    positions
        .into_iter()
        .map(|p| score_position(ctx, seg, tgt, aligned, p))
        .sum()
}

fn score_position(
    ctx: &DecodeCtx<'_, '_>,
    seg: (usize, usize),
    tgt: &[SymbolId],
    aligned: &[usize],
    p: usize,
) -> f64 {
    let np = &ctx.cfg.nnjm;
    let scorer = ctx.nnjm.expect("nnjm_enabled checked");
    let source_window = nnjm::source_window(
        ctx.sen.wids(),
        seg,
        aligned[p],
        np.source_window,
        ctx.src_bos,
        ctx.src_eos,
    );
    let target_history = nnjm::target_history(tgt, p, np.target_history, ctx.tgt_bos);
    ctx.nnjm_cache.score(
        scorer,
        ContextKey {
            source_window,
            target_history,
            target_word: tgt[p],
        },
    )
}

/// Joint-model delta for a merge: fresh scores for the rule's own terminal
/// positions, plus history corrections for each spliced child's leading
/// words, whose original charge assumed the hypothesis started at the
/// child's first word.
fn nnjm_merge_delta(
    ctx: &DecodeCtx<'_, '_>,
    span: Span,
    tgt: &[SymbolId],
    aligned: &[usize],
    terminal_positions: &[usize],
    splices: &[(usize, &Candidate)],
) -> f64 {
    if !ctx.nnjm_enabled() {
        return 0.0;
    }
    let np = &ctx.cfg.nnjm;
    let scorer = ctx.nnjm.expect("nnjm_enabled checked");
    let seg = ctx
        .sen
        .segment_bounds(span)
        .unwrap_or((0, ctx.sen.len()));
    let h = np.target_history;

    let mut delta: f64 = terminal_positions
        .iter()
        .map(|&p| score_position(ctx, seg, tgt, aligned, p))
        .sum();

    for &(offset, child) in splices {
        if offset == 0 {
            // The child keeps its hypothesis-start padding: nothing moved.
            continue;
        }
        for i in 0..child.tgt_wids.len().min(h) {
            let p = offset + i;
            let old_history = nnjm::target_history(&child.tgt_wids, i, h, ctx.tgt_bos);
            let new_history = nnjm::target_history(tgt, p, h, ctx.tgt_bos);
            if old_history == new_history {
                continue;
            }
            let source_window = nnjm::source_window(
                ctx.sen.wids(),
                seg,
                child.aligned_src[i],
                np.source_window,
                ctx.src_bos,
                ctx.src_eos,
            );
            let old = ctx.nnjm_cache.score(
                scorer,
                ContextKey {
                    source_window: source_window.clone(),
                    target_history: old_history,
                    target_word: tgt[p],
                },
            );
            let new = ctx.nnjm_cache.score(
                scorer,
                ContextKey {
                    source_window,
                    target_history: new_history,
                    target_word: tgt[p],
                },
            );
            delta += new - old;
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prefers_nearest_then_left() {
        let raw = vec![Some(3), None, Some(7)];
        assert_eq!(resolve_unaligned(raw, 0), vec![3, 3, 7]);

        let raw = vec![None, None, Some(5)];
        assert_eq!(resolve_unaligned(raw, 0), vec![5, 5, 5]);

        let raw = vec![None, None];
        assert_eq!(resolve_unaligned(raw, 4), vec![4, 4]);
    }

    #[test]
    fn resolve_uses_original_anchors_only() {
        // Position 1 resolves from position 0's original value, not from
        // position 2's resolved copy.
        let raw = vec![Some(2), None, None, Some(9)];
        assert_eq!(resolve_unaligned(raw, 0), vec![2, 2, 9, 9]);
    }
}
