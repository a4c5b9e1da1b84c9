//! Bidirectional word⇄id tables for the source and target languages.
//!
//! Vocab files are plain text, one `word id` pair per line, as produced by
//! `hierodec compile-rules`. The decoder treats vocabularies as read-only
//! during search; any word that may need an id at decode time (for the OOV
//! passthrough path) must be interned single-threadedly beforehand.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

/// Symbol id shared by both languages' vocabularies.
pub type SymbolId = u32;

pub const BOS: &str = "<s>";
pub const EOS: &str = "</s>";
pub const UNK: &str = "<unk>";
/// The nonterminal placeholder symbol used on both rule sides.
pub const NONTERMINAL: &str = "[X][X]";

#[derive(Debug, thiserror::Error)]
pub enum VocabError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("line {line}: expected `word id`, got {got:?}")]
    Malformed { line: usize, got: String },

    #[error("line {line}: duplicate id {id}")]
    DuplicateId { line: usize, id: SymbolId },
}

/// A bidirectional string⇄id map.
pub struct Vocab {
    words: Vec<String>,
    ids: HashMap<String, SymbolId>,
    bos: SymbolId,
    eos: SymbolId,
    unk: SymbolId,
    nonterminal: SymbolId,
}

impl Vocab {
    /// An empty vocabulary containing only the reserved tokens.
    pub fn new() -> Self {
        Self::from_words(std::iter::empty::<String>())
    }

    /// Build from plain words; reserved tokens are interned if absent.
    pub fn from_words(words: impl IntoIterator<Item = String>) -> Self {
        let mut v = Vocab {
            words: Vec::new(),
            ids: HashMap::new(),
            bos: 0,
            eos: 0,
            unk: 0,
            nonterminal: 0,
        };
        for w in words {
            v.get_or_intern(&w);
        }
        v.resolve_reserved();
        v
    }

    /// Load from a `word id` text file.
    ///
    /// Ids must form a permutation of `0..n`; reserved tokens missing from
    /// the file are appended after the last file id.
    pub fn load(path: &Path) -> Result<Self, VocabError> {
        let text = fs::read_to_string(path)?;
        let mut pairs: Vec<(String, SymbolId)> = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mut it = line.split_whitespace();
            let (Some(word), Some(id_str)) = (it.next(), it.next()) else {
                return Err(VocabError::Malformed {
                    line: i + 1,
                    got: line.to_string(),
                });
            };
            let id: SymbolId = id_str.parse().map_err(|_| VocabError::Malformed {
                line: i + 1,
                got: line.to_string(),
            })?;
            pairs.push((word.to_string(), id));
        }

        let mut words = vec![String::new(); pairs.len()];
        let mut ids = HashMap::with_capacity(pairs.len());
        for (i, (word, id)) in pairs.into_iter().enumerate() {
            let slot = words
                .get_mut(id as usize)
                .ok_or(VocabError::DuplicateId { line: i + 1, id })?;
            if !slot.is_empty() {
                return Err(VocabError::DuplicateId { line: i + 1, id });
            }
            ids.insert(word.clone(), id);
            *slot = word;
        }

        let mut v = Vocab {
            words,
            ids,
            bos: 0,
            eos: 0,
            unk: 0,
            nonterminal: 0,
        };
        v.resolve_reserved();
        tracing::info!(path = %path.display(), size = v.len(), "loaded vocab");
        Ok(v)
    }

    pub fn save(&self, path: &Path) -> Result<(), VocabError> {
        let mut out = String::new();
        for (id, word) in self.words.iter().enumerate() {
            out.push_str(word);
            out.push(' ');
            out.push_str(&id.to_string());
            out.push('\n');
        }
        fs::write(path, out)?;
        Ok(())
    }

    fn resolve_reserved(&mut self) {
        self.bos = self.get_or_intern(BOS);
        self.eos = self.get_or_intern(EOS);
        self.unk = self.get_or_intern(UNK);
        self.nonterminal = self.get_or_intern(NONTERMINAL);
    }

    pub fn get_id(&self, word: &str) -> Option<SymbolId> {
        self.ids.get(word).copied()
    }

    /// Id of `word`, or the `<unk>` id when unseen.
    pub fn id_or_unk(&self, word: &str) -> SymbolId {
        self.get_id(word).unwrap_or(self.unk)
    }

    pub fn get_or_intern(&mut self, word: &str) -> SymbolId {
        if let Some(&id) = self.ids.get(word) {
            return id;
        }
        let id = self.words.len() as SymbolId;
        self.words.push(word.to_string());
        self.ids.insert(word.to_string(), id);
        id
    }

    /// The surface string for `id`; unknown ids render as `<unk>`.
    pub fn word(&self, id: SymbolId) -> &str {
        self.words.get(id as usize).map_or(UNK, |w| w.as_str())
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn bos(&self) -> SymbolId {
        self.bos
    }

    pub fn eos(&self) -> SymbolId {
        self.eos
    }

    pub fn unk(&self) -> SymbolId {
        self.unk
    }

    pub fn nonterminal(&self) -> SymbolId {
        self.nonterminal
    }
}

impl Default for Vocab {
    fn default() -> Self {
        Self::new()
    }
}
