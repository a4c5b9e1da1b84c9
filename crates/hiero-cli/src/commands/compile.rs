//! Model compilation: text rule tables to the binary format (with vocab
//! extraction and the glue-rule append), and ARPA language models to the
//! compiled form.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter};
use std::path::PathBuf;

use clap::Args;

use hiero_core::lm::NgramLm;
use hiero_core::rules::{write_records, RuleRecord, LOGPROB_PSEUDO_ZERO};
use hiero_core::vocab::{SymbolId, Vocab, NONTERMINAL};

use crate::CliError;

const UNALIGNED: i32 = -99;
const FIRST_NT: i32 = -1;
const SECOND_NT: i32 = -2;

#[derive(Debug, Args)]
pub struct CompileRulesArgs {
    /// Text rule table: `src ||| tgt ||| probs ||| alignment` per line
    pub input: PathBuf,
    /// Output binary rule table
    pub output: PathBuf,
    /// Output source vocab file
    #[arg(long)]
    pub src_vocab: PathBuf,
    /// Output target vocab file
    #[arg(long)]
    pub tgt_vocab: PathBuf,
}

#[derive(Debug, Args)]
pub struct CompileLmArgs {
    /// ARPA text language model
    pub input: PathBuf,
    /// Output compiled model
    pub output: PathBuf,
    /// Target vocab file; LM words are interned and the file is rewritten
    #[arg(long)]
    pub vocab: PathBuf,
}

pub fn run_rules(args: CompileRulesArgs) -> Result<(), CliError> {
    let mut src_vocab = Vocab::new();
    let mut tgt_vocab = Vocab::new();
    let mut records = Vec::new();
    let mut prob_num: Option<usize> = None;

    for (i, line) in BufReader::new(File::open(&args.input)?).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = parse_rule_line(&line, i + 1, &mut src_vocab, &mut tgt_vocab)?;
        match prob_num {
            None => prob_num = Some(record.probs.len()),
            Some(n) if n != record.probs.len() => {
                return Err(CliError::Other(format!(
                    "line {}: expected {} probabilities, got {}",
                    i + 1,
                    n,
                    record.probs.len()
                )));
            }
            Some(_) => {}
        }
        records.push(record);
    }

    let nt_src = src_vocab.nonterminal();
    let nt_tgt = tgt_vocab.nonterminal();
    records.push(RuleRecord {
        src_ids: vec![nt_src, nt_src],
        tgt_wids: vec![nt_tgt, nt_tgt],
        align: vec![FIRST_NT, SECOND_NT],
        probs: vec![0.0; prob_num.unwrap_or(1)],
        rule_type: 4,
    });

    let mut out = BufWriter::new(File::create(&args.output)?);
    write_records(&mut out, &records)?;
    src_vocab.save(&args.src_vocab)?;
    tgt_vocab.save(&args.tgt_vocab)?;
    eprintln!(
        "compiled {} rules ({} source words, {} target words)",
        records.len(),
        src_vocab.len(),
        tgt_vocab.len()
    );
    Ok(())
}

pub fn run_lm(args: CompileLmArgs) -> Result<(), CliError> {
    let mut vocab = Vocab::load(&args.vocab)?;
    let lm = NgramLm::from_arpa(&fs::read_to_string(&args.input)?, &mut vocab)?;
    lm.save(&args.output)?;
    // LM words that were new to the vocab must keep their ids.
    vocab.save(&args.vocab)?;
    eprintln!(
        "compiled order-{} model with {} ngrams",
        lm.order(),
        lm.ngram_count()
    );
    Ok(())
}

fn parse_rule_line(
    line: &str,
    line_no: usize,
    src_vocab: &mut Vocab,
    tgt_vocab: &mut Vocab,
) -> Result<RuleRecord, CliError> {
    let fields: Vec<&str> = line.split("|||").map(str::trim).collect();
    if fields.len() < 3 {
        return Err(CliError::Other(format!(
            "line {line_no}: expected `src ||| tgt ||| probs [||| alignment]`"
        )));
    }

    let src_tokens: Vec<&str> = fields[0].split_whitespace().collect();
    let tgt_tokens: Vec<&str> = fields[1].split_whitespace().collect();
    let src_ids: Vec<SymbolId> = src_tokens
        .iter()
        .map(|w| src_vocab.get_or_intern(w))
        .collect();
    let tgt_wids: Vec<SymbolId> = tgt_tokens
        .iter()
        .map(|w| tgt_vocab.get_or_intern(w))
        .collect();

    let src_nts = src_tokens.iter().filter(|&&w| w == NONTERMINAL).count();
    let nt_positions: Vec<usize> = tgt_tokens
        .iter()
        .enumerate()
        .filter(|(_, &w)| w == NONTERMINAL)
        .map(|(i, _)| i)
        .collect();
    if src_nts != nt_positions.len() || src_nts > 2 {
        return Err(CliError::Other(format!(
            "line {line_no}: nonterminal mismatch ({src_nts} source vs {} target)",
            nt_positions.len()
        )));
    }

    let probs: Vec<f64> = fields[2]
        .split_whitespace()
        .map(|s| {
            s.parse::<f64>().map(|p| {
                if p.abs() <= f64::EPSILON {
                    LOGPROB_PSEUDO_ZERO
                } else {
                    p.log10()
                }
            })
        })
        .collect::<Result<_, _>>()
        .map_err(|e| CliError::Other(format!("line {line_no}: bad probability: {e}")))?;
    if probs.is_empty() {
        return Err(CliError::Other(format!(
            "line {line_no}: at least one probability is required"
        )));
    }

    let mut links: Vec<Vec<i32>> = vec![Vec::new(); tgt_wids.len()];
    let mut reversed = false;
    let mut nt_link_seen = false;
    if let Some(alignment) = fields.get(3) {
        for pair in alignment.split_whitespace() {
            let (s, t) = pair
                .split_once('-')
                .and_then(|(a, b)| Some((a.parse::<i32>().ok()?, b.parse::<usize>().ok()?)))
                .ok_or_else(|| {
                    CliError::Other(format!("line {line_no}: bad alignment pair {pair:?}"))
                })?;
            if t >= tgt_wids.len() || s < 0 || s as usize >= src_ids.len() {
                return Err(CliError::Other(format!(
                    "line {line_no}: alignment {pair:?} out of range"
                )));
            }
            if Some(&t) == nt_positions.first() {
                nt_link_seen = true;
            } else if Some(&t) == nt_positions.get(1) {
                // The source-order first nonterminal links to the target's
                // second slot: the rule reorders its nonterminals.
                if !nt_link_seen {
                    reversed = true;
                }
                nt_link_seen = true;
            } else {
                links[t].push(s);
            }
        }
    }

    let mut align = Vec::with_capacity(tgt_wids.len());
    for (t, tlinks) in links.iter().enumerate() {
        align.push(if Some(&t) == nt_positions.first() {
            FIRST_NT
        } else if Some(&t) == nt_positions.get(1) {
            SECOND_NT
        } else if tlinks.is_empty() {
            UNALIGNED
        } else {
            let min = *tlinks.iter().min().expect("non-empty");
            let max = *tlinks.iter().max().expect("non-empty");
            (min + max) / 2
        });
    }

    let rule_type = match nt_positions.len() {
        0 => 0,
        1 => 1,
        _ if reversed => 3,
        _ => 2,
    };

    Ok(RuleRecord {
        src_ids,
        tgt_wids,
        align,
        probs,
        rule_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hiero_core::rules::RuleTable;

    fn parse(line: &str) -> (RuleRecord, Vocab, Vocab) {
        let mut src = Vocab::new();
        let mut tgt = Vocab::new();
        let record = parse_rule_line(line, 1, &mut src, &mut tgt).unwrap();
        (record, src, tgt)
    }

    #[test]
    fn phrase_rule_round_trip() {
        let (record, src, _) = parse("le chat ||| the cat ||| 0.5 0.25 ||| 0-0 1-1");
        assert_eq!(record.rule_type, 0);
        assert_eq!(record.src_ids.len(), 2);
        assert_eq!(record.align, vec![0, 1]);
        assert!((record.probs[0] - 0.5f64.log10()).abs() < 1e-12);
        assert!(src.get_id("chat").is_some());
    }

    #[test]
    fn zero_probability_floors() {
        let (record, _, _) = parse("a ||| b ||| 0 ||| 0-0");
        assert_eq!(record.probs, vec![LOGPROB_PSEUDO_ZERO]);
    }

    #[test]
    fn unaligned_and_multi_aligned_positions() {
        let (record, _, _) = parse("a b c ||| x y ||| 0.5 ||| 0-0 2-0");
        // x links to sources 0 and 2: midpoint 1. y is unaligned.
        assert_eq!(record.align, vec![1, UNALIGNED]);
    }

    #[test]
    fn forward_two_nt_rule() {
        let (record, _, _) = parse(
            "[X][X] de [X][X] ||| [X][X] of [X][X] ||| 0.5 ||| 0-0 1-1 2-2",
        );
        assert_eq!(record.rule_type, 2);
        assert_eq!(record.align, vec![FIRST_NT, 1, SECOND_NT]);
    }

    #[test]
    fn reversed_two_nt_rule() {
        // The first alignment pair links source NT 0 to the target's
        // second slot.
        let (record, _, _) = parse(
            "[X][X] de [X][X] ||| [X][X] of [X][X] ||| 0.5 ||| 0-2 1-1 2-0",
        );
        assert_eq!(record.rule_type, 3);
    }

    #[test]
    fn nonterminal_count_mismatch_rejected() {
        let mut src = Vocab::new();
        let mut tgt = Vocab::new();
        let err = parse_rule_line("[X][X] a ||| b ||| 0.5", 7, &mut src, &mut tgt).unwrap_err();
        assert!(err.to_string().contains("line 7"));
    }

    #[test]
    fn compiled_table_loads_and_matches() {
        let dir = tempfile::tempdir().unwrap();
        let text = dir.path().join("rules.txt");
        fs::write(
            &text,
            "le ||| the ||| 0.5 ||| 0-0\nle chat ||| the cat ||| 0.25 0.5 ||| 0-0 1-1\n",
        )
        .unwrap();
        // Mixed prob counts must be rejected.
        let args = CompileRulesArgs {
            input: text.clone(),
            output: dir.path().join("rules.bin"),
            src_vocab: dir.path().join("vocab.src"),
            tgt_vocab: dir.path().join("vocab.tgt"),
        };
        assert!(run_rules(args).is_err());

        fs::write(
            &text,
            "le ||| the ||| 0.5 ||| 0-0\nle chat ||| the cat ||| 0.25 ||| 0-0 1-1\n",
        )
        .unwrap();
        let args = CompileRulesArgs {
            input: text,
            output: dir.path().join("rules.bin"),
            src_vocab: dir.path().join("vocab.src"),
            tgt_vocab: dir.path().join("vocab.tgt"),
        };
        run_rules(args).unwrap();

        let src_vocab = Vocab::load(&dir.path().join("vocab.src")).unwrap();
        let table = RuleTable::open(&dir.path().join("rules.bin"), &[1.0], 5, 30).unwrap();
        // Both phrase rules and the appended glue rule are loadable.
        let le = src_vocab.get_id("le").unwrap();
        let chat = src_vocab.get_id("chat").unwrap();
        assert!(table.find_matched_rules(&[le]).is_some());
        assert!(table.find_matched_rules(&[le, chat]).is_some());
        let nt = src_vocab.nonterminal();
        let glue = table.find_matched_rules(&[nt, nt]).unwrap();
        assert_eq!(glue[0].kind.tag(), 4);
    }
}
