//! Decoder configuration: search parameters and log-linear feature weights.
//!
//! Parsed once from TOML at startup, validated, and passed by reference into
//! every per-sentence decoder instance. There is deliberately no global
//! singleton: sentence-level parallelism stays safe because nothing here is
//! ambient or mutable.

use serde::Deserialize;

pub const DEFAULT_CONFIG_TOML: &str = include_str!("default_config.toml");

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TOML parse error: {0}")]
    Parse(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    pub params: Params,
    pub weights: Weights,
    pub nnjm: NnjmParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Params {
    /// Maximum candidates kept per span beam.
    pub beam_size: usize,
    /// Pop budget per span during cube pruning.
    pub cube_size: usize,
    /// Maximum source span a non-glue rule may cover, in words.
    pub rule_span_max: usize,
    /// Maximum source symbols per rule (trie walk depth).
    pub rule_len_max: usize,
    /// Maximum target alternatives stored per rule source sequence.
    pub rule_num_limit: usize,
    pub nbest: usize,
    pub span_threads: usize,
    pub sentence_threads: usize,
    /// Drop OOV passthrough tokens from the output surface string.
    pub drop_oov: bool,
    pub dump_rules: bool,
    pub print_nbest: bool,
    /// Token splitting one input line into sub-sentences.
    pub eos_marker: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Weights {
    /// One weight per translation-probability feature in the rule table.
    pub trans: Vec<f64>,
    pub lm: f64,
    pub len: f64,
    pub rule_num: f64,
    pub glue: f64,
    pub nnjm: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NnjmParams {
    pub enabled: bool,
    /// Source words taken on each side of the aligned index (window = 2W+1).
    pub source_window: usize,
    /// Target history length H.
    pub target_history: usize,
}

impl DecoderConfig {
    pub fn default_toml() -> &'static str {
        DEFAULT_CONFIG_TOML
    }

    /// Number of translation-probability features expected in rule files.
    pub fn prob_num(&self) -> usize {
        self.weights.trans.len()
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        parse_config_toml(DEFAULT_CONFIG_TOML).expect("default config TOML must be valid")
    }
}

pub fn parse_config_toml(toml_str: &str) -> Result<DecoderConfig, ConfigError> {
    let cfg: DecoderConfig =
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &DecoderConfig) -> Result<(), ConfigError> {
    macro_rules! check_positive {
        ($section:ident . $field:ident) => {
            if cfg.$section.$field == 0 {
                return Err(ConfigError::InvalidValue {
                    field: concat!(stringify!($section), ".", stringify!($field)).to_string(),
                    reason: "must be positive".to_string(),
                });
            }
        };
    }

    check_positive!(params.beam_size);
    check_positive!(params.cube_size);
    check_positive!(params.rule_span_max);
    check_positive!(params.rule_len_max);
    check_positive!(params.rule_num_limit);
    check_positive!(params.nbest);
    check_positive!(params.span_threads);
    check_positive!(params.sentence_threads);

    if cfg.params.eos_marker.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "params.eos_marker".to_string(),
            reason: "must be a non-empty token".to_string(),
        });
    }
    if cfg.weights.trans.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "weights.trans".to_string(),
            reason: "at least one translation feature weight is required".to_string(),
        });
    }
    if cfg.nnjm.enabled {
        check_positive!(nnjm.source_window);
        check_positive!(nnjm.target_history);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_default_toml() {
        let cfg = parse_config_toml(DEFAULT_CONFIG_TOML).unwrap();
        assert_eq!(cfg.params.beam_size, 20);
        assert_eq!(cfg.params.cube_size, 200);
        assert_eq!(cfg.params.rule_span_max, 10);
        assert_eq!(cfg.params.rule_len_max, 5);
        assert_eq!(cfg.params.rule_num_limit, 30);
        assert_eq!(cfg.params.eos_marker, "</s>");
        assert_eq!(cfg.prob_num(), 4);
        assert!(!cfg.nnjm.enabled);
        assert_eq!(cfg.nnjm.source_window, 5);
        assert_eq!(cfg.nnjm.target_history, 3);
    }

    #[test]
    fn error_zero_beam() {
        let toml = DEFAULT_CONFIG_TOML.replace("beam_size = 20", "beam_size = 0");
        let err = parse_config_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("params.beam_size"));
    }

    #[test]
    fn error_empty_trans_weights() {
        let toml = DEFAULT_CONFIG_TOML.replace("trans = [1.0, 1.0, 1.0, 1.0]", "trans = []");
        let err = parse_config_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("weights.trans"));
    }

    #[test]
    fn error_blank_eos_marker() {
        let toml = DEFAULT_CONFIG_TOML.replace("eos_marker = \"</s>\"", "eos_marker = \" \"");
        let err = parse_config_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("params.eos_marker"));
    }

    #[test]
    fn error_invalid_toml() {
        let err = parse_config_toml("not valid toml {{{").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn nnjm_windows_checked_only_when_enabled() {
        let toml = DEFAULT_CONFIG_TOML.replace("source_window = 5", "source_window = 0");
        assert!(parse_config_toml(&toml).is_ok());

        let toml = toml.replace("enabled = false", "enabled = true");
        let err = parse_config_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("nnjm.source_window"));
    }
}
