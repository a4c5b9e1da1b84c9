//! File translation: load models once, decode input lines in blocks with
//! per-line worker threads, write top-1 output plus optional n-best and
//! rule-trace files.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use clap::Args;
use serde::Serialize;
use tracing::info;

use hiero_core::config::{parse_config_toml, DecoderConfig};
use hiero_core::decoder::{preregister, DecodeError, Models, SentenceDecoder, TuneInfo};
use hiero_core::lm::NgramLm;
use hiero_core::rules::RuleTable;
use hiero_core::vocab::Vocab;

use crate::CliError;

#[derive(Debug, Args)]
pub struct TranslateArgs {
    /// Tokenized input, one sentence (or EOS-delimited paragraph) per line
    pub input: PathBuf,
    /// Output file for the top-1 translations
    pub output: PathBuf,

    /// Decoder config TOML (defaults are compiled in)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Source vocab file
    #[arg(long)]
    pub src_vocab: PathBuf,
    /// Target vocab file
    #[arg(long)]
    pub tgt_vocab: PathBuf,
    /// Binary rule table
    #[arg(long)]
    pub rules: PathBuf,
    /// Language model: compiled (.hglm) or ARPA text (.arpa)
    #[arg(long)]
    pub lm: PathBuf,
    /// Neural joint model weights (safetensors; requires the `neural` build)
    #[arg(long)]
    pub nnjm: Option<PathBuf>,

    /// Write an n-best list with feature values
    #[arg(long)]
    pub nbest_file: Option<PathBuf>,
    /// Write the applied-rule trace of each best derivation
    #[arg(long)]
    pub rules_file: Option<PathBuf>,
    /// Emit the n-best list as JSON lines instead of the ||| format
    #[arg(long)]
    pub json: bool,

    /// Override params.beam_size
    #[arg(long)]
    pub beam_size: Option<usize>,
    /// Override params.cube_size
    #[arg(long)]
    pub cube_size: Option<usize>,
    /// Override params.nbest
    #[arg(long)]
    pub nbest: Option<usize>,
    /// Override params.span_threads
    #[arg(long)]
    pub span_threads: Option<usize>,
    /// Override params.sentence_threads
    #[arg(long)]
    pub sentence_threads: Option<usize>,
    /// Drop OOV passthrough tokens from the output
    #[arg(long)]
    pub drop_oov: bool,
    /// Override a feature weight, e.g. `--weight lm=0.8` or
    /// `--weight trans2=1.5`; repeatable
    #[arg(long = "weight", value_name = "NAME=VALUE")]
    pub weights: Vec<String>,
}

struct LineOutput {
    translations: Result<Vec<String>, DecodeError>,
    nbest: Vec<Vec<TuneInfo>>,
    traces: Vec<Vec<String>>,
}

/// One n-best line in `--json` mode.
#[derive(Serialize)]
struct NbestRecord<'a> {
    sen_id: usize,
    translation: &'a str,
    features: &'a [f64],
    score: f64,
}

pub fn run(args: TranslateArgs) -> Result<(), CliError> {
    let mut cfg = load_config(&args)?;
    apply_overrides(&mut cfg, &args)?;

    let mut src_vocab = Vocab::load(&args.src_vocab)?;
    let mut tgt_vocab = Vocab::load(&args.tgt_vocab)?;
    let lm = load_lm(&args.lm, &mut tgt_vocab)?;
    let table = RuleTable::open(
        &args.rules,
        &cfg.weights.trans,
        cfg.params.rule_len_max,
        cfg.params.rule_num_limit,
    )?;
    let nnjm = load_nnjm(&args, &cfg)?;

    let lines: Vec<String> = BufReader::new(File::open(&args.input)?)
        .lines()
        .collect::<Result<_, _>>()?;
    let mut out = BufWriter::new(File::create(&args.output)?);
    // Config toggles supply the conventional file names when no explicit
    // path was given on the command line.
    let nbest_path = args.nbest_file.clone().or_else(|| {
        cfg.params
            .print_nbest
            .then(|| PathBuf::from("nbest.out"))
    });
    let rules_path = args.rules_file.clone().or_else(|| {
        cfg.params
            .dump_rules
            .then(|| PathBuf::from("applied-rules.txt"))
    });
    let mut nbest_out = nbest_path
        .as_ref()
        .map(|p| File::create(p).map(BufWriter::new))
        .transpose()?;
    let mut rules_out = rules_path
        .as_ref()
        .map(|p| File::create(p).map(BufWriter::new))
        .transpose()?;

    let want_nbest = nbest_out.is_some();
    let want_rules = rules_out.is_some();
    let block_size = cfg.params.sentence_threads.max(1);
    let mut sen_id = 0usize;
    for (block_idx, block) in lines.chunks(block_size).enumerate() {
        // New words (OOV passthrough targets included) must get their ids
        // before the workers share the vocabularies read-only.
        for line in block {
            preregister(&mut src_vocab, &mut tgt_vocab, line);
        }
        let models = Models {
            src_vocab: &src_vocab,
            tgt_vocab: &tgt_vocab,
            rules: &table,
            lm: &lm,
            nnjm: nnjm.as_deref(),
        };
        let results = decode_block(models, &cfg, block, want_nbest, want_rules);
        for (line_idx, result) in results.into_iter().enumerate() {
            match result.translations {
                Ok(translations) => {
                    for t in translations {
                        writeln!(out, "{t}")?;
                    }
                }
                Err(e) => {
                    eprintln!(
                        "warning: line {}: {e}",
                        block_idx * block_size + line_idx + 1
                    );
                    writeln!(out)?;
                }
            }
            if let Some(w) = nbest_out.as_mut() {
                for list in result.nbest {
                    write_nbest(w, sen_id, &list, args.json)?;
                    sen_id += 1;
                }
            }
            if let Some(w) = rules_out.as_mut() {
                for trace in result.traces {
                    for rule in trace {
                        writeln!(w, "{rule}")?;
                    }
                    writeln!(w)?;
                }
            }
        }
    }
    info!(lines = lines.len(), "translation finished");
    Ok(())
}

fn decode_block(
    models: Models<'_>,
    cfg: &DecoderConfig,
    block: &[String],
    want_nbest: bool,
    want_rules: bool,
) -> Vec<LineOutput> {
    let decode_line = |line: &String| {
        let mut dec = SentenceDecoder::new(models, cfg, line);
        let translations = dec.translate();
        LineOutput {
            translations,
            nbest: if want_nbest { dec.nbest() } else { Vec::new() },
            traces: if want_rules {
                dec.applied_rules()
            } else {
                Vec::new()
            },
        }
    };

    if block.len() <= 1 || cfg.params.sentence_threads <= 1 {
        return block.iter().map(decode_line).collect();
    }
    std::thread::scope(|s| {
        let handles: Vec<_> = block
            .iter()
            .map(|line| {
                let decode_line = &decode_line;
                s.spawn(move || decode_line(line))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("sentence task panicked"))
            .collect()
    })
}

fn write_nbest(
    w: &mut impl Write,
    sen_id: usize,
    list: &[TuneInfo],
    json: bool,
) -> Result<(), CliError> {
    if json {
        for entry in list {
            let record = NbestRecord {
                sen_id,
                translation: &entry.translation,
                features: &entry.feature_values,
                score: entry.total_score,
            };
            writeln!(w, "{}", serde_json::to_string(&record)?)?;
        }
        return Ok(());
    }
    for entry in list {
        let features: Vec<String> = entry.feature_values.iter().map(|v| v.to_string()).collect();
        writeln!(
            w,
            "{sen_id} ||| {} ||| {} ||| {}",
            entry.translation,
            features.join(" "),
            entry.total_score
        )?;
    }
    Ok(())
}

fn load_config(args: &TranslateArgs) -> Result<DecoderConfig, CliError> {
    match &args.config {
        Some(path) => Ok(parse_config_toml(&fs::read_to_string(path)?)?),
        None => Ok(DecoderConfig::default()),
    }
}

fn apply_overrides(cfg: &mut DecoderConfig, args: &TranslateArgs) -> Result<(), CliError> {
    if let Some(v) = args.beam_size {
        cfg.params.beam_size = v;
    }
    if let Some(v) = args.cube_size {
        cfg.params.cube_size = v;
    }
    if let Some(v) = args.nbest {
        cfg.params.nbest = v;
    }
    if let Some(v) = args.span_threads {
        cfg.params.span_threads = v;
    }
    if let Some(v) = args.sentence_threads {
        cfg.params.sentence_threads = v;
    }
    if args.drop_oov {
        cfg.params.drop_oov = true;
    }
    for spec in &args.weights {
        apply_weight_override(cfg, spec)?;
    }
    Ok(())
}

fn apply_weight_override(cfg: &mut DecoderConfig, raw: &str) -> Result<(), CliError> {
    let bad = || CliError::Other(format!("bad weight override {raw:?} (expected NAME=VALUE)"));
    let (name, value) = raw.split_once('=').ok_or_else(bad)?;
    let value: f64 = value.trim().parse().map_err(|_| bad())?;
    let w = &mut cfg.weights;
    match name.trim() {
        "lm" => w.lm = value,
        "len" => w.len = value,
        "rule-num" | "rule_num" => w.rule_num = value,
        "glue" => w.glue = value,
        "nnjm" => w.nnjm = value,
        name => {
            let idx: usize = name
                .strip_prefix("trans")
                .and_then(|s| s.parse().ok())
                .ok_or_else(bad)?;
            let trans_len = w.trans.len();
            let slot = w.trans.get_mut(idx).ok_or_else(|| {
                CliError::Other(format!(
                    "weight override {raw:?}: only {trans_len} translation features configured"
                ))
            })?;
            *slot = value;
        }
    }
    Ok(())
}

fn load_lm(path: &PathBuf, tgt_vocab: &mut Vocab) -> Result<NgramLm, CliError> {
    if path.extension().is_some_and(|e| e == "arpa") {
        Ok(NgramLm::from_arpa(&fs::read_to_string(path)?, tgt_vocab)?)
    } else {
        Ok(NgramLm::open(path)?)
    }
}


#[cfg(feature = "neural")]
fn load_nnjm(
    args: &TranslateArgs,
    cfg: &DecoderConfig,
) -> Result<Option<Box<dyn hiero_core::nnjm::JointScorer>>, CliError> {
    let Some(path) = &args.nnjm else {
        return Ok(None);
    };
    if !cfg.nnjm.enabled {
        return Err(CliError::Other(
            "an nnjm model was given but nnjm.enabled is false".to_string(),
        ));
    }
    let context_len = 2 * cfg.nnjm.source_window + 1 + cfg.nnjm.target_history;
    let model = hiero_core::neural::NeuralJointModel::open(path, context_len, true)
        .map_err(|e| CliError::Other(format!("failed to load nnjm model: {e}")))?;
    Ok(Some(Box::new(model)))
}

#[cfg(not(feature = "neural"))]
fn load_nnjm(
    args: &TranslateArgs,
    _cfg: &DecoderConfig,
) -> Result<Option<Box<dyn hiero_core::nnjm::JointScorer>>, CliError> {
    if args.nnjm.is_some() {
        return Err(CliError::Other(
            "this build has no neural support; rebuild with --features neural".to_string(),
        ));
    }
    Ok(None)
}
