use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hiero_cli::commands::{compile, translate};

#[derive(Parser)]
#[command(name = "hierodec", about = "Hierarchical phrase-based decoder")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Translate a tokenized input file
    Translate(translate::TranslateArgs),
    /// Compile a text rule table to the binary format
    CompileRules(compile::CompileRulesArgs),
    /// Compile an ARPA language model
    CompileLm(compile::CompileLmArgs),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Translate(args) => translate::run(args),
        Command::CompileRules(args) => compile::run_rules(args),
        Command::CompileLm(args) => compile::run_lm(args),
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}
