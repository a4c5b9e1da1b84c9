use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use memmap2::Mmap;
use tracing::info;

use crate::vocab::SymbolId;

use super::entry::{AlignPoint, RuleKind, TgtRule};
use super::RuleTableError;

/// One on-disk rule record. Layout (little-endian, no header):
/// `i16 src_len, i32×src_len, i16 tgt_len, i32×tgt_len, i32×tgt_len align,
/// f64×prob_num, i16 rule_type`.
///
/// Alignment sentinels: `-1` first nonterminal slot, `-2` second, `-99`
/// unaligned; non-negative values are source-relative symbol indices.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleRecord {
    pub src_ids: Vec<SymbolId>,
    pub tgt_wids: Vec<SymbolId>,
    pub align: Vec<i32>,
    pub probs: Vec<f64>,
    pub rule_type: i16,
}

const UNALIGNED: i32 = -99;
const FIRST_NT: i32 = -1;
const SECOND_NT: i32 = -2;

#[derive(Debug)]
struct RuleTrieNode {
    tgt_rules: Vec<TgtRule>,
    children: HashMap<SymbolId, RuleTrieNode>,
}

impl RuleTrieNode {
    fn new() -> Self {
        RuleTrieNode {
            tgt_rules: Vec::new(),
            children: HashMap::new(),
        }
    }
}

/// The rule trie: source symbol sequence → target alternatives.
///
/// Construction is single-threaded; lookups are `&self` and safe to share
/// across span tasks.
#[derive(Debug)]
pub struct RuleTable {
    root: RuleTrieNode,
    rule_len_max: usize,
    rule_num_limit: usize,
    rule_count: usize,
}

impl RuleTable {
    pub fn new(rule_len_max: usize, rule_num_limit: usize) -> Self {
        RuleTable {
            root: RuleTrieNode::new(),
            rule_len_max,
            rule_num_limit,
            rule_count: 0,
        }
    }

    /// Load a binary rule file, weighting each alternative with
    /// `trans_weights` (whose length fixes the expected `prob_num`).
    pub fn open(
        path: &Path,
        trans_weights: &[f64],
        rule_len_max: usize,
        rule_num_limit: usize,
    ) -> Result<Self, RuleTableError> {
        let file = File::open(path)?;
        // SAFETY: the file is opened read-only and the mapping is dropped
        // before this function returns.
        let mmap = unsafe { Mmap::map(&file)? };
        let table = Self::from_bytes(&mmap, trans_weights, rule_len_max, rule_num_limit)?;
        info!(
            path = %path.display(),
            rules = table.rule_count,
            "loaded rule table"
        );
        Ok(table)
    }

    pub fn from_bytes(
        data: &[u8],
        trans_weights: &[f64],
        rule_len_max: usize,
        rule_num_limit: usize,
    ) -> Result<Self, RuleTableError> {
        let mut table = Self::new(rule_len_max, rule_num_limit);
        let mut cur = Cursor { data, pos: 0 };
        while !cur.at_end() {
            let offset = cur.pos;
            let record = read_record(&mut cur, trans_weights.len())?;
            let (src_ids, rule) = decode_record(record, trans_weights, offset)?;
            if src_ids.len() > rule_len_max {
                return Err(RuleTableError::RuleTooLong {
                    offset,
                    len: src_ids.len(),
                });
            }
            table.add_rule(&src_ids, rule);
        }
        Ok(table)
    }

    /// Insert one alternative, evicting the lowest-scored alternative at the
    /// node once the per-source cap is reached.
    pub fn add_rule(&mut self, src_ids: &[SymbolId], rule: TgtRule) {
        let mut node = &mut self.root;
        for &wid in src_ids {
            node = node.children.entry(wid).or_insert_with(RuleTrieNode::new);
        }
        if node.tgt_rules.len() < self.rule_num_limit {
            node.tgt_rules.push(rule);
            self.rule_count += 1;
        } else if let Some(worst) = node
            .tgt_rules
            .iter_mut()
            .min_by(|a, b| a.score.total_cmp(&b.score))
        {
            if worst.score < rule.score {
                *worst = rule;
            }
        }
    }

    /// Target alternatives stored at the exact trie path `ids`, if any.
    pub fn find_matched_rules(&self, ids: &[SymbolId]) -> Option<&[TgtRule]> {
        let mut node = &self.root;
        for wid in ids {
            node = node.children.get(wid)?;
        }
        if node.tgt_rules.is_empty() {
            None
        } else {
            Some(&node.tgt_rules)
        }
    }

    /// Alternatives for every prefix of `wids[pos..]`, up to `rule_len_max`
    /// symbols. Index `k` of the result covers the prefix of `k+1` words;
    /// the walk stops at the first missing trie edge.
    pub fn find_matched_rules_for_prefixes(
        &self,
        wids: &[SymbolId],
        pos: usize,
    ) -> Vec<Option<&[TgtRule]>> {
        let mut matched = Vec::new();
        let mut node = &self.root;
        for wid in wids[pos..].iter().take(self.rule_len_max) {
            match node.children.get(wid) {
                Some(child) => {
                    node = child;
                    matched.push(if child.tgt_rules.is_empty() {
                        None
                    } else {
                        Some(child.tgt_rules.as_slice())
                    });
                }
                None => break,
            }
        }
        matched
    }

    pub fn rule_count(&self) -> usize {
        self.rule_count
    }

    pub fn rule_len_max(&self) -> usize {
        self.rule_len_max
    }
}

fn decode_record(
    record: RuleRecord,
    trans_weights: &[f64],
    offset: usize,
) -> Result<(Vec<SymbolId>, TgtRule), RuleTableError> {
    let kind = RuleKind::from_tag(record.rule_type).ok_or(RuleTableError::BadRuleType {
        offset,
        value: record.rule_type,
    })?;
    let mut align = Vec::with_capacity(record.align.len());
    for &a in &record.align {
        align.push(match a {
            v if v >= 0 => AlignPoint::Src(v as usize),
            FIRST_NT if kind.nonterminals() >= 1 => AlignPoint::FirstNt,
            SECOND_NT if kind.nonterminals() >= 2 => AlignPoint::SecondNt,
            // Pure-terminal rules have no slot to claim -1; treat it as
            // unaligned for compatibility with older table builds.
            UNALIGNED | FIRST_NT => AlignPoint::Unaligned,
            v => return Err(RuleTableError::BadAlignment { offset, value: v }),
        });
    }
    let rule = TgtRule::new(kind, record.tgt_wids, align, record.probs, trans_weights);
    Ok((record.src_ids, rule))
}

/// Append binary records to a writer, byte-exact with the reader.
pub fn write_records(out: &mut impl Write, records: &[RuleRecord]) -> std::io::Result<()> {
    for r in records {
        out.write_all(&(r.src_ids.len() as i16).to_le_bytes())?;
        for &id in &r.src_ids {
            out.write_all(&(id as i32).to_le_bytes())?;
        }
        out.write_all(&(r.tgt_wids.len() as i16).to_le_bytes())?;
        for &id in &r.tgt_wids {
            out.write_all(&(id as i32).to_le_bytes())?;
        }
        for &a in &r.align {
            out.write_all(&a.to_le_bytes())?;
        }
        for &p in &r.probs {
            out.write_all(&p.to_le_bytes())?;
        }
        out.write_all(&r.rule_type.to_le_bytes())?;
    }
    Ok(())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&[u8], RuleTableError> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(RuleTableError::Truncated { offset: self.pos });
        }
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_i16(&mut self) -> Result<i16, RuleTableError> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    fn read_i32(&mut self) -> Result<i32, RuleTableError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_f64(&mut self) -> Result<f64, RuleTableError> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes(b.try_into().expect("8 bytes")))
    }
}

fn read_len(cur: &mut Cursor, what_offset: usize) -> Result<usize, RuleTableError> {
    let len = cur.read_i16()?;
    if len < 0 {
        return Err(RuleTableError::Truncated {
            offset: what_offset,
        });
    }
    Ok(len as usize)
}

fn read_symbols(cur: &mut Cursor, n: usize, offset: usize) -> Result<Vec<SymbolId>, RuleTableError> {
    let mut ids = Vec::with_capacity(n);
    for _ in 0..n {
        let v = cur.read_i32()?;
        if v < 0 {
            return Err(RuleTableError::BadSymbol { offset, value: v });
        }
        ids.push(v as SymbolId);
    }
    Ok(ids)
}

fn read_record(cur: &mut Cursor, prob_num: usize) -> Result<RuleRecord, RuleTableError> {
    let offset = cur.pos;
    let src_len = read_len(cur, offset)?;
    let src_ids = read_symbols(cur, src_len, offset)?;
    let tgt_len = read_len(cur, offset)?;
    let tgt_wids = read_symbols(cur, tgt_len, offset)?;
    let mut align = Vec::with_capacity(tgt_len);
    for _ in 0..tgt_len {
        align.push(cur.read_i32()?);
    }
    let mut probs = Vec::with_capacity(prob_num);
    for _ in 0..prob_num {
        probs.push(cur.read_f64()?);
    }
    let rule_type = cur.read_i16()?;
    Ok(RuleRecord {
        src_ids,
        tgt_wids,
        align,
        probs,
        rule_type,
    })
}
