//! Command implementations for the `hierodec` binary.

pub mod commands;

use hiero_core::config::ConfigError;
use hiero_core::lm::LmError;
use hiero_core::rules::RuleTableError;
use hiero_core::vocab::VocabError;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("vocab error: {0}")]
    Vocab(#[from] VocabError),

    #[error("rule table error: {0}")]
    Rules(#[from] RuleTableError),

    #[error("language model error: {0}")]
    Lm(#[from] LmError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}
