//! Enumeration of source-side rule shapes over a sentence.
//!
//! A pattern is one abstract source sequence (terminals with up to two
//! nonterminal slots) plus every concrete (span, sub-span) binding it can
//! take. Shapes are enumerated by placing one or two disjoint nonterminal
//! sub-spans inside each valid span: one slot yields `X A`, `A X` and
//! `A X B`; two slots (always separated by at least one terminal) yield
//! `X A X`, `A X B X`, `X A X B` and `A X B X C`. The glue shape `X1 X2`
//! is anchored at each sub-sentence start and is not length-capped.
//!
//! Patterns are ephemeral: they exist only to be intersected with the rule
//! trie and are dropped after matching.

use std::collections::BTreeMap;

use crate::sentence::{SourceSentence, Span};
use crate::vocab::SymbolId;

/// One concrete binding of a shape: the covered span and the sub-span each
/// nonterminal slot takes, in source order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternSpan {
    pub span: Span,
    pub x1: Option<Span>,
    pub x2: Option<Span>,
}

#[derive(Debug)]
pub struct Pattern {
    pub src_ids: Vec<SymbolId>,
    pub spans: Vec<PatternSpan>,
}

/// Enumerate every matchable pattern of the sentence.
///
/// `span_max` caps the width of non-glue shapes. Grouping is keyed on the
/// source sequence so each distinct sequence walks the trie once; the
/// ordered map keeps enumeration deterministic.
pub fn generate(sen: &SourceSentence, nt_id: SymbolId, span_max: usize) -> Vec<Pattern> {
    let mut by_ids: BTreeMap<Vec<SymbolId>, Vec<PatternSpan>> = BTreeMap::new();

    for si in 0..sen.segments().len() {
        let (seg_beg, seg_end) = sen.segments()[si];
        for beg in seg_beg..seg_end {
            let max_end = (beg + span_max).min(seg_end);
            for end in beg + 1..max_end {
                let span = Span::new(beg, end - beg);
                one_slot_shapes(sen, nt_id, span, &mut by_ids);
                two_slot_shapes(sen, nt_id, span, &mut by_ids);
            }
        }
        glue_shapes(sen, nt_id, (seg_beg, seg_end), &mut by_ids);
    }

    by_ids
        .into_iter()
        .map(|(src_ids, spans)| Pattern { src_ids, spans })
        .collect()
}

/// Shapes with one nonterminal slot: `X A`, `A X`, `A X B`.
fn one_slot_shapes(
    sen: &SourceSentence,
    nt_id: SymbolId,
    span: Span,
    by_ids: &mut BTreeMap<Vec<SymbolId>, Vec<PatternSpan>>,
) {
    for xb in span.beg..=span.end() {
        for xe in xb..=span.end() {
            if xb == span.beg && xe == span.end() {
                continue; // the slot may not swallow the whole span
            }
            let x1 = Span::new(xb, xe - xb);
            let src_ids = render(sen, nt_id, span, Some(x1), None);
            by_ids.entry(src_ids).or_default().push(PatternSpan {
                span,
                x1: Some(x1),
                x2: None,
            });
        }
    }
}

/// Shapes with two nonterminal slots, at least one terminal between them:
/// `X A X`, `A X B X`, `X A X B`, `A X B X C`.
fn two_slot_shapes(
    sen: &SourceSentence,
    nt_id: SymbolId,
    span: Span,
    by_ids: &mut BTreeMap<Vec<SymbolId>, Vec<PatternSpan>>,
) {
    for x1b in span.beg..=span.end() {
        for x1e in x1b..=span.end() {
            // Leave room for a separating terminal and the second slot.
            for x2b in x1e + 2..=span.end() {
                for x2e in x2b..=span.end() {
                    let x1 = Span::new(x1b, x1e - x1b);
                    let x2 = Span::new(x2b, x2e - x2b);
                    let src_ids = render(sen, nt_id, span, Some(x1), Some(x2));
                    by_ids.entry(src_ids).or_default().push(PatternSpan {
                        span,
                        x1: Some(x1),
                        x2: Some(x2),
                    });
                }
            }
        }
    }
}

/// The glue shape `X1 X2`: anchored at the sub-sentence start, one binding
/// per (length, split point), not capped by `span_max`.
fn glue_shapes(
    sen: &SourceSentence,
    nt_id: SymbolId,
    seg: (usize, usize),
    by_ids: &mut BTreeMap<Vec<SymbolId>, Vec<PatternSpan>>,
) {
    let (seg_beg, seg_end) = seg;
    let width = seg_end - seg_beg;
    if width < 2 {
        return;
    }
    let spans = by_ids.entry(vec![nt_id, nt_id]).or_default();
    for len in 1..width {
        for x1_len in 0..len {
            spans.push(PatternSpan {
                span: Span::new(seg_beg, len),
                x1: Some(Span::new(seg_beg, x1_len)),
                x2: Some(Span::new(seg_beg + x1_len + 1, len - x1_len - 1)),
            });
        }
    }
}

/// The pattern's source sequence: sentence words with the slot ranges
/// replaced by the nonterminal symbol.
fn render(
    sen: &SourceSentence,
    nt_id: SymbolId,
    span: Span,
    x1: Option<Span>,
    x2: Option<Span>,
) -> Vec<SymbolId> {
    let mut src_ids = Vec::with_capacity(span.width());
    let mut i = span.beg;
    while i <= span.end() {
        if x1.is_some_and(|x| x.beg == i) {
            src_ids.push(nt_id);
            i = x1.expect("checked").end() + 1;
        } else if x2.is_some_and(|x| x.beg == i) {
            src_ids.push(nt_id);
            i = x2.expect("checked").end() + 1;
        } else {
            src_ids.push(sen.wid(i));
            i += 1;
        }
    }
    src_ids
}
