//! geoagent CLI.
//!
//! `init` writes a default `geoagent.toml`, `run` executes one task and exits
//! with a stable code, `repl` starts an interactive session.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use geoagent::exit_codes;
use geoagent::io::config::{DEFAULT_CONFIG_FILE, GeoagentConfig, load_config, write_config};
use geoagent::io::llm::build_llm;
use geoagent::io::metadata::{load_corpus, load_file_metadata};
use geoagent::io::script::InterpreterRunner;
use geoagent::logging;
use geoagent::session::{Harness, describe_event, run_repl, summarize};

#[derive(Parser)]
#[command(
    name = "geoagent",
    version,
    about = "LLM agents that turn geospatial tasks into executed, validated scripts"
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Run a single task and exit.
    Run {
        /// Task description.
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
    },
    /// Start an interactive session (`new` resets, `exit` quits).
    Repl,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Run { query } => cmd_run(&cli.config, &query.join(" ")),
        Command::Repl => cmd_repl(&cli.config),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        eprintln!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
        return Ok(exit_codes::OK);
    }
    write_config(config_path, &GeoagentConfig::default())
        .with_context(|| format!("write {}", config_path.display()))?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

/// Load the config and its inputs, wire the backends and hand a harness to `f`.
fn with_harness<T>(config_path: &Path, f: impl FnOnce(&mut Harness<'_>) -> Result<T>) -> Result<T> {
    let config = load_config(config_path)?;
    let catalog = load_file_metadata(config.files.metadata.as_deref())?;
    let corpus = load_corpus(config.retrieval.corpus.as_deref())?;
    let llm = build_llm(&config.llm)?;
    let runner = InterpreterRunner::from_command(&config.execution.interpreter)?;
    debug!(
        files = catalog.len(),
        corpus = corpus.len(),
        "loaded session inputs"
    );
    let mut harness = Harness::new(&config, llm.as_ref(), &runner, catalog, corpus)?;
    f(&mut harness)
}

fn cmd_run(config_path: &Path, query: &str) -> Result<i32> {
    with_harness(config_path, |harness| {
        let outcome = harness.run_query(query, |event| println!("{}", describe_event(event)))?;
        println!("{}", summarize(&outcome));
        Ok(if outcome.result.is_done() {
            exit_codes::OK
        } else {
            exit_codes::ABORTED
        })
    })
}

fn cmd_repl(config_path: &Path) -> Result<i32> {
    with_harness(config_path, |harness| {
        let stdin = io::stdin();
        let mut stdout = io::stdout();
        run_repl(harness, stdin.lock(), &mut stdout)?;
        stdout.flush().context("flush stdout")?;
        Ok(exit_codes::OK)
    })
}
