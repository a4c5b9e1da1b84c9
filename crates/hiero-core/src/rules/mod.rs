//! Synchronous-grammar rule storage and lookup.
//!
//! `RuleTable` holds target-side rule alternatives in a trie keyed by the
//! rule's source symbol sequence. Rules are loaded from the binary rule
//! file once at startup and are read-only for the whole decoding run.

mod entry;
mod table;

pub use entry::{AlignPoint, RuleKind, TgtRule, LOGPROB_PSEUDO_ZERO};
pub use table::{RuleRecord, RuleTable, write_records};

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum RuleTableError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("truncated rule file at byte {offset}")]
    Truncated { offset: usize },

    #[error("rule at byte {offset}: bad rule type {value}")]
    BadRuleType { offset: usize, value: i16 },

    #[error("rule at byte {offset}: negative symbol id {value}")]
    BadSymbol { offset: usize, value: i32 },

    #[error("rule at byte {offset}: bad alignment index {value}")]
    BadAlignment { offset: usize, value: i32 },

    #[error("rule at byte {offset}: source side longer than rule_len_max ({len})")]
    RuleTooLong { offset: usize, len: usize },
}
