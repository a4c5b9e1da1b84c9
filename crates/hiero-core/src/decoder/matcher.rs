//! Intersection of generated patterns with the rule trie.
//!
//! Each successfully matched pattern fans out across every concrete span
//! binding recorded for it, producing one applicable-rule instance per
//! (binding, target alternative). For reversed rules (type 3) the two
//! nonterminal sub-spans are swapped here, so `span_x1` always feeds the
//! target side's first nonterminal.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::rules::{RuleKind, RuleTable, TgtRule};
use crate::sentence::{SourceSentence, Span};
use crate::vocab::SymbolId;

use super::pattern;

/// One rule instance applicable to a specific span.
#[derive(Debug, Clone)]
pub struct SpanRule<'t> {
    pub src_ids: Arc<[SymbolId]>,
    pub tgt: &'t TgtRule,
    /// Source sub-span rewriting the target side's first nonterminal.
    pub span_x1: Option<Span>,
    /// Source sub-span rewriting the second, if the rule has one.
    pub span_x2: Option<Span>,
}

impl SpanRule<'_> {
    /// The source-order nonterminal sub-spans (undoing the reversed swap).
    pub fn src_order_nt_spans(&self) -> (Option<Span>, Option<Span>) {
        if self.tgt.kind == RuleKind::TwoReversed {
            (self.span_x2, self.span_x1)
        } else {
            (self.span_x1, self.span_x2)
        }
    }
}

/// Applicable rules per chart cell, addressed as `[beg][len]`.
pub struct SpanRules<'t> {
    cells: Vec<Vec<Vec<SpanRule<'t>>>>,
}

impl<'t> SpanRules<'t> {
    pub fn rules(&self, span: Span) -> &[SpanRule<'t>] {
        &self.cells[span.beg][span.len]
    }
}

/// Generate all patterns for the sentence and match them against the trie.
pub fn collect<'t>(
    sen: &SourceSentence,
    table: &'t RuleTable,
    src_nt: SymbolId,
    span_max: usize,
) -> SpanRules<'t> {
    let n = sen.len();
    let mut cells: Vec<Vec<Vec<SpanRule<'t>>>> = (0..n)
        .map(|beg| (0..n - beg).map(|_| Vec::new()).collect())
        .collect();
    let mut seen: HashSet<(usize, Option<Span>, Option<Span>)> = HashSet::new();

    let patterns = pattern::generate(sen, src_nt, span_max);
    let mut matched_patterns = 0usize;
    for p in &patterns {
        let Some(alts) = table.find_matched_rules(&p.src_ids) else {
            continue;
        };
        matched_patterns += 1;
        let src_ids: Arc<[SymbolId]> = Arc::from(p.src_ids.as_slice());
        let slot_count = p.src_ids.iter().filter(|&&w| w == src_nt).count();
        for tgt in alts {
            if tgt.kind.nonterminals() != slot_count {
                // A table inconsistency; the rule cannot bind this shape.
                continue;
            }
            for ps in &p.spans {
                let (span_x1, span_x2) = if tgt.kind == RuleKind::TwoReversed {
                    (ps.x2, ps.x1)
                } else {
                    (ps.x1, ps.x2)
                };
                let key = (tgt as *const TgtRule as usize, span_x1, span_x2);
                if !seen.insert(key) {
                    continue;
                }
                cells[ps.span.beg][ps.span.len].push(SpanRule {
                    src_ids: Arc::clone(&src_ids),
                    tgt,
                    span_x1,
                    span_x2,
                });
            }
        }
    }
    debug!(
        patterns = patterns.len(),
        matched = matched_patterns,
        "rule matching done"
    );
    SpanRules { cells }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::AlignPoint;

    const NT: SymbolId = 1;
    const M: SymbolId = 99;
    const W: [f64; 2] = [1.0, 1.0];

    fn tgt_rule(kind: RuleKind, wids: Vec<SymbolId>) -> TgtRule {
        let align = wids
            .iter()
            .scan(0, |nts, &w| {
                Some(if w == NT {
                    *nts += 1;
                    if *nts == 1 {
                        AlignPoint::FirstNt
                    } else {
                        AlignPoint::SecondNt
                    }
                } else {
                    AlignPoint::Unaligned
                })
            })
            .collect();
        TgtRule::new(kind, wids, align, vec![-0.1, -0.1], &W)
    }

    fn sentence(wids: &[SymbolId]) -> SourceSentence {
        SourceSentence::new(wids.to_vec(), M)
    }

    #[test]
    fn one_nt_rule_binds_its_subspan() {
        let mut table = RuleTable::new(5, 10);
        table.add_rule(&[10, NT], tgt_rule(RuleKind::OneNonterminal, vec![20, NT]));
        let sen = sentence(&[10, 11, 12]);
        let rules = collect(&sen, &table, NT, 10);

        // Span (0,1): A=10, X over word 1.
        let cell = rules.rules(Span::new(0, 1));
        assert_eq!(cell.len(), 1);
        assert_eq!(cell[0].span_x1, Some(Span::new(1, 0)));
        assert_eq!(cell[0].span_x2, None);

        // Span (0,2): X may also cover words 1-2.
        let cell = rules.rules(Span::new(0, 2));
        assert_eq!(cell.len(), 1);
        assert_eq!(cell[0].span_x1, Some(Span::new(1, 1)));
    }

    #[test]
    fn reversed_rule_swaps_subspans() {
        let mut table = RuleTable::new(5, 10);
        table.add_rule(
            &[NT, 11, NT],
            tgt_rule(RuleKind::TwoForward, vec![NT, 21, NT]),
        );
        table.add_rule(
            &[NT, 11, NT],
            tgt_rule(RuleKind::TwoReversed, vec![NT, 22, NT]),
        );
        let sen = sentence(&[10, 11, 12]);
        let rules = collect(&sen, &table, NT, 10);

        let cell = rules.rules(Span::new(0, 2));
        assert_eq!(cell.len(), 2);
        let forward = cell
            .iter()
            .find(|r| r.tgt.kind == RuleKind::TwoForward)
            .unwrap();
        let reversed = cell
            .iter()
            .find(|r| r.tgt.kind == RuleKind::TwoReversed)
            .unwrap();
        assert_eq!(forward.span_x1, Some(Span::new(0, 0)));
        assert_eq!(forward.span_x2, Some(Span::new(2, 0)));
        assert_eq!(reversed.span_x1, Some(Span::new(2, 0)));
        assert_eq!(reversed.span_x2, Some(Span::new(0, 0)));
        // Source-order accessors undo the swap.
        assert_eq!(
            reversed.src_order_nt_spans(),
            (Some(Span::new(0, 0)), Some(Span::new(2, 0)))
        );
    }

    #[test]
    fn glue_rule_fans_out_over_split_points() {
        let mut table = RuleTable::new(5, 10);
        table.add_rule(&[NT, NT], tgt_rule(RuleKind::Glue, vec![NT, NT]));
        let sen = sentence(&[10, 11, 12]);
        let rules = collect(&sen, &table, NT, 10);

        let whole = rules.rules(Span::new(0, 2));
        assert_eq!(whole.len(), 2); // splits 1|23 and 12|3
        assert!(whole
            .iter()
            .all(|r| r.span_x1.unwrap().beg == 0 && r.tgt.kind == RuleKind::Glue));
        // Glue never applies off the sub-sentence start.
        assert!(rules.rules(Span::new(1, 1)).is_empty());
    }

    #[test]
    fn nt_count_mismatch_is_skipped() {
        let mut table = RuleTable::new(5, 10);
        // A two-NT alternative stored under a one-slot source path.
        table.add_rule(&[10, NT], tgt_rule(RuleKind::TwoForward, vec![NT, 20, NT]));
        let sen = sentence(&[10, 11]);
        let rules = collect(&sen, &table, NT, 10);
        assert!(rules.rules(Span::new(0, 1)).is_empty());
    }

    #[test]
    fn matching_twice_yields_identical_rule_sets() {
        let mut table = RuleTable::new(5, 10);
        table.add_rule(&[10, NT], tgt_rule(RuleKind::OneNonterminal, vec![20, NT]));
        table.add_rule(&[NT, NT], tgt_rule(RuleKind::Glue, vec![NT, NT]));
        let sen = sentence(&[10, 11, 12]);

        let a = collect(&sen, &table, NT, 10);
        let b = collect(&sen, &table, NT, 10);
        for beg in 0..3 {
            for len in 0..3 - beg {
                let span = Span::new(beg, len);
                let ra = a.rules(span);
                let rb = b.rules(span);
                assert_eq!(ra.len(), rb.len());
                for (x, y) in ra.iter().zip(rb) {
                    assert!(std::ptr::eq(x.tgt, y.tgt));
                    assert_eq!(x.span_x1, y.span_x1);
                    assert_eq!(x.span_x2, y.span_x2);
                }
            }
        }
    }
}
