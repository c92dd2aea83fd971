//! Main module for the Awful RAG CLI application (arag).
//!
//! This module parses the command line, loads the configuration, and runs the
//! requested subcommand against the library.
//!
//! # Examples
//!
//! Writing a default configuration, indexing a folder and querying it:
//!
//! ```sh
//! arag init
//! arag build --corpus ./docs
//! arag query "How long do refunds take?" -k 3
//! arag stats
//! ```

use std::{
    env,
    error::Error,
    fs,
    path::{Path, PathBuf},
};

use awful_rag::{
    commands::{Cli, Commands},
    config::{self, RagConfig},
    corpus,
    embedder::{Embedder, load_embedder},
    retriever::{RetrievedChunk, Retriever},
};
use clap::Parser;
use console::style;
use once_cell::sync::OnceCell;
use tracing::{debug, info};

static TRACING: OnceCell<()> = OnceCell::new();

fn main() -> Result<(), Box<dyn Error>> {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt::init();
    });
    run()
}

/// Load configuration, parse arguments and execute the selected command.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or validated, or if the
/// command itself fails.
fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => awful_rag::default_config_path()?,
    };

    match cli.command {
        Commands::Init => {
            debug!("Initializing configuration");
            init(&config_path)?;
        }
        Commands::Build { corpus: corpus_dir, force } => {
            let mut retriever = open_retriever(&config_path)?;
            let root = match corpus_dir {
                Some(dir) => dir,
                None => env::current_dir()?,
            };
            if force {
                let documents = corpus::load_documents(&root)?;
                retriever.build_from_corpus(&documents)?;
            } else {
                retriever.load_or_build(|| corpus::load_documents(&root))?;
            }
            let stats = retriever.stats()?;
            println!(
                "{} {} chunks from {} into {}",
                style("Indexed").green().bold(),
                stats.record_count,
                root.display(),
                retriever.config().persist_path.display()
            );
        }
        Commands::Query { question, k, json } => {
            let mut retriever = open_retriever(&config_path)?;
            retriever.load()?;
            let k = k.unwrap_or(retriever.config().top_k);
            let results = retriever.query(&question, k)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_results(&results);
            }
        }
        Commands::Stats => {
            let mut retriever = open_retriever(&config_path)?;
            retriever.load()?;
            let stats = retriever.stats()?;
            println!("{}", serde_yaml::to_string(&stats)?);
            println!(
                "{} {}",
                style("embedder:").dim(),
                retriever.embedder().model_name()
            );
        }
    }

    Ok(())
}

/// Load and validate the configuration, then wire a retriever to its embedder.
fn open_retriever(config_path: &Path) -> Result<Retriever<Box<dyn Embedder>>, Box<dyn Error>> {
    debug!("Loading config from: {}", config_path.display());
    let rag_config = config::load_config(&config_path.to_string_lossy())?;
    rag_config.validate()?;
    debug!("Config loaded: {:?}", rag_config);

    let embedder = load_embedder(&rag_config)?;
    Ok(Retriever::new(rag_config, embedder)?)
}

fn print_results(results: &[RetrievedChunk]) {
    if results.is_empty() {
        println!("{}", style("No matching chunks.").yellow());
        return;
    }
    for (rank, hit) in results.iter().enumerate() {
        println!(
            "{} {} {}",
            style(format!("#{}", rank + 1)).cyan().bold(),
            style(format!("{:.4}", hit.score)).green(),
            style(format!(
                "{} [{}..{}]",
                hit.source_document, hit.offset.start, hit.offset.end
            ))
            .dim()
        );
        println!("{}\n", hit.text.trim());
    }
}

/// Write a default configuration file, unless one already exists.
///
/// The snapshot directory defaults to `index/` next to the configuration.
///
/// # Errors
///
/// Returns an error if the directories or the file cannot be created.
fn init(config_path: &Path) -> Result<(), Box<dyn Error>> {
    if config_path.exists() {
        println!(
            "{} {}",
            style("Config already exists:").yellow(),
            config_path.display()
        );
        return Ok(());
    }

    let config_dir = match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    info!("Creating config directory: {}", config_dir.display());
    fs::create_dir_all(&config_dir)?;

    let rag_config = RagConfig::new(config_dir.join("index"));
    let config_yaml = serde_yaml::to_string(&rag_config)?;
    info!("Creating config file: {}", config_path.display());
    fs::write(config_path, config_yaml)?;

    println!(
        "{} {}",
        style("Wrote").green().bold(),
        config_path.display()
    );
    Ok(())
}
