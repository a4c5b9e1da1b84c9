use crate::vocab::SymbolId;

/// Log10 floor standing in for a zero probability.
pub const LOGPROB_PSEUDO_ZERO: f64 = -99.0;

/// Closed set of synchronous rule shapes, decoded from the on-disk tag.
///
/// Tags 0 and 1 cover zero or one nonterminal; 2 keeps the two source
/// nonterminals in order on the target side, 3 reverses them; 4 is the glue
/// rule joining two adjacent spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Phrase,
    OneNonterminal,
    TwoForward,
    TwoReversed,
    Glue,
}

impl RuleKind {
    pub fn from_tag(tag: i16) -> Option<Self> {
        match tag {
            0 => Some(RuleKind::Phrase),
            1 => Some(RuleKind::OneNonterminal),
            2 => Some(RuleKind::TwoForward),
            3 => Some(RuleKind::TwoReversed),
            4 => Some(RuleKind::Glue),
            _ => None,
        }
    }

    pub fn tag(&self) -> i16 {
        match self {
            RuleKind::Phrase => 0,
            RuleKind::OneNonterminal => 1,
            RuleKind::TwoForward => 2,
            RuleKind::TwoReversed => 3,
            RuleKind::Glue => 4,
        }
    }

    pub fn nonterminals(&self) -> usize {
        match self {
            RuleKind::Phrase => 0,
            RuleKind::OneNonterminal => 1,
            RuleKind::TwoForward | RuleKind::TwoReversed | RuleKind::Glue => 2,
        }
    }

    pub fn is_glue(&self) -> bool {
        matches!(self, RuleKind::Glue)
    }
}

/// Where one target position points back into the rule's source side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignPoint {
    /// Source-relative symbol index within the rule.
    Src(usize),
    FirstNt,
    SecondNt,
    Unaligned,
}

/// One target-side alternative stored at a rule trie node.
#[derive(Debug, Clone)]
pub struct TgtRule {
    pub kind: RuleKind,
    /// Target symbol sequence, nonterminal slots included.
    pub wids: Vec<SymbolId>,
    /// Per-target-position alignment, same length as `wids`.
    pub align: Vec<AlignPoint>,
    /// Translation-probability features, log10.
    pub probs: Vec<f64>,
    /// Weighted sum of `probs`, precomputed at load time.
    pub score: f64,
    /// Target terminal count (`wids` minus nonterminal slots).
    pub word_num: usize,
}

impl TgtRule {
    pub fn new(
        kind: RuleKind,
        wids: Vec<SymbolId>,
        align: Vec<AlignPoint>,
        probs: Vec<f64>,
        trans_weights: &[f64],
    ) -> Self {
        let score = probs
            .iter()
            .zip(trans_weights)
            .map(|(p, w)| p * w)
            .sum();
        let word_num = wids.len() - kind.nonterminals().min(wids.len());
        TgtRule {
            kind,
            wids,
            align,
            probs,
            score,
            word_num,
        }
    }
}
