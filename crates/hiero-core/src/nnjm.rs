//! Neural joint model contract and context assembly.
//!
//! The decoder consumes the model as a scoring oracle: a log-probability for
//! one target word given a fixed-width window of source words around its
//! aligned position and a fixed-length target history. Scores are pure in
//! their context tuple, so they are cached by exact key; the cache is shared
//! across the span tasks of one sentence.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::vocab::SymbolId;

/// Context-window scorer. `source_window` has `2W+1` entries centred on the
/// aligned source index; `target_history` has `H` entries, oldest first.
pub trait JointScorer: Send + Sync {
    fn score(
        &self,
        source_window: &[SymbolId],
        target_history: &[SymbolId],
        target_word: SymbolId,
    ) -> f64;
}

/// Exact context tuple. Two keys hash-colliding can never alias a score:
/// the map compares full tuples on lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextKey {
    pub source_window: Vec<SymbolId>,
    pub target_history: Vec<SymbolId>,
    pub target_word: SymbolId,
}

/// Shared score cache for one sentence's span tasks. A missed key costs at
/// most a redundant oracle call, never a wrong answer.
pub struct ScoreCache {
    inner: Mutex<HashMap<ContextKey, f64>>,
}

impl ScoreCache {
    pub fn new() -> Self {
        ScoreCache {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn score(&self, scorer: &dyn JointScorer, key: ContextKey) -> f64 {
        if let Some(&cached) = self.inner.lock().expect("nnjm cache poisoned").get(&key) {
            return cached;
        }
        let value = scorer.score(&key.source_window, &key.target_history, key.target_word);
        self.inner
            .lock()
            .expect("nnjm cache poisoned")
            .insert(key, value);
        value
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("nnjm cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ScoreCache {
    fn default() -> Self {
        Self::new()
    }
}

/// The `2W+1` source words centred on `center`, padded with `<s>`/`</s>`
/// ids beyond the sub-sentence bounds `[seg_beg, seg_end)`.
pub fn source_window(
    wids: &[SymbolId],
    seg: (usize, usize),
    center: usize,
    w: usize,
    bos: SymbolId,
    eos: SymbolId,
) -> Vec<SymbolId> {
    let (seg_beg, seg_end) = seg;
    let mut window = Vec::with_capacity(2 * w + 1);
    let center = center as isize;
    for off in -(w as isize)..=(w as isize) {
        let i = center + off;
        if i < seg_beg as isize {
            window.push(bos);
        } else if i >= seg_end as isize {
            window.push(eos);
        } else {
            window.push(wids[i as usize]);
        }
    }
    window
}

/// The `h` target words preceding `pos`, oldest first, front-padded with
/// `<s>` where the hypothesis has too little history.
pub fn target_history(tgt: &[SymbolId], pos: usize, h: usize, bos: SymbolId) -> Vec<SymbolId> {
    let mut history = Vec::with_capacity(h);
    for back in (1..=h).rev() {
        match pos.checked_sub(back) {
            Some(i) => history.push(tgt[i]),
            None => history.push(bos),
        }
    }
    history
}
