//! This module defines the command-line interface for the application using `clap`.
//!
//! It provides a `Cli` struct that represents the parsed command-line arguments,
//! and a `Commands` enum that represents the available subcommands and their
//! options.
//!
//! # Examples
//!
//! Parsing command-line arguments:
//!
//! ```no_run
//! use clap::Parser;
//! use awful_rag::commands::{Cli, Commands};
//!
//! let cli = Cli::parse();
//! match cli.command {
//!     Commands::Query { question, .. } => println!("searching for {question}"),
//!     other => println!("{other:?}"),
//! }
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// Configuration file to use instead of the one in the platform config directory.
    #[arg(long, global = true, env = "ARAG_CONFIG")]
    pub config: Option<PathBuf>,

    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// Represents the available subcommands and their options.
#[derive(Subcommand, Debug)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Write a default configuration file.
    Init,

    /// Chunk, embed and persist a corpus of text files.
    ///
    /// Without `--force` an existing snapshot is reused.
    #[clap(name = "build", alias = "b")]
    Build {
        /// Directory of .txt/.md files. Defaults to the current directory.
        #[arg(long, short = 'c')]
        corpus: Option<PathBuf>,

        /// Rebuild even if a snapshot already exists.
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Return the chunks most similar to a question.
    #[clap(name = "query", alias = "q")]
    Query {
        question: String,

        /// Number of results. Defaults to `top_k` from the configuration.
        #[arg(short = 'k')]
        k: Option<usize>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Describe the persisted snapshot.
    Stats,
}
