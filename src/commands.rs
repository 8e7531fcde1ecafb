//! This module defines the command-line interface for the application using `clap`.
//!
//! It provides a `Cli` struct that represents the parsed command-line arguments,
//! and a `Commands` enum that represents the available subcommands and their
//! options.
//!
//! # Examples
//!
//! ```no_run
//! use clap::Parser;
//! use topranks::commands::{Cli, Commands};
//!
//! let cli = Cli::parse();
//! match cli.command {
//!     Commands::Refill => { /* submit one keyword batch */ }
//!     _ => {}
//! }
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::builder::BuildMode;
use crate::config::Environment;

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Auto)]
pub struct Cli {
    /// Configuration file; defaults to `config.yaml` in the platform config directory.
    #[arg(long, short = 'c', global = true, env = "TOPRANKS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Overrides the configured environment profile.
    #[arg(long, short = 'e', global = true, env = "TOPRANKS_ENV", value_enum)]
    pub environment: Option<Environment>,

    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// Represents the available subcommands and their options.
///
/// Every subcommand reports aggregate counts; per-record detail only goes to
/// the log.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Writes a starter config and the built-in templates, creates the schema,
    /// and seeds statistics, templates and the default AI model.
    Init,

    /// Imports domains, one per line.
    #[clap(name = "import-domains")]
    ImportDomains {
        file: PathBuf,

        /// Also assign the domains to this project, creating it if needed.
        #[arg(long, short = 'p')]
        project: Option<String>,
    },

    /// Imports keywords, one per line.
    #[clap(name = "import-keywords")]
    ImportKeywords { file: PathBuf },

    /// Installs a template from a YAML file.
    #[clap(name = "add-template")]
    AddTemplate {
        file: PathBuf,

        /// Owning project; templates without one are shared.
        #[arg(long, short = 'p')]
        project: Option<i32>,
    },

    /// Moves one batch of available keywords to the task queue.
    Refill,

    /// Runs the worker pool until Ctrl-C.
    Worker {
        /// Process at most one task and exit.
        #[arg(long)]
        once: bool,
    },

    /// Builds conversations and messages for a template.
    Build {
        #[arg(long, short = 't')]
        template: i32,

        #[arg(long, short = 'm')]
        ai_model: i32,

        /// Restrict to the domains of this project.
        #[arg(long, short = 'p')]
        project: Option<i32>,

        #[arg(long, value_enum, default_value_t = BuildMode::SkipExisting)]
        mode: BuildMode,

        /// Include adult-content domains when building across all domains.
        #[arg(long)]
        include_adult: bool,
    },

    /// Submits the messages of one conversation.
    #[clap(name = "request-conversation")]
    RequestConversation { id: i32 },

    /// Submits the messages of every conversation of a project.
    #[clap(name = "request-project")]
    RequestProject { id: i32 },

    /// Requests business data for domains that have none.
    #[clap(name = "enrich-domains")]
    EnrichDomains {
        #[arg(long, short = 'n', default_value_t = 100)]
        batch: i64,
    },

    /// Links brands to the keywords whose answers mention them.
    #[clap(name = "index-brands")]
    IndexBrands {
        #[arg(long, short = 'n', default_value_t = 100)]
        batch: i64,
    },

    /// Empties the task queue and returns every pending record to its pool.
    #[clap(name = "reset-queue")]
    ResetQueue,

    /// Prints the keyword statistics.
    Stats {
        /// Recompute the counters from the keyword table first.
        #[arg(long)]
        recount: bool,
    },

    /// Full-text search over keyword answers.
    Search {
        query: String,

        #[arg(long, short = 'n', default_value_t = 20)]
        limit: i64,
    },
}
