//! # TopRanks (library root)
//!
//! Queue-driven LLM enrichment for SEO research. The crate moves records
//! through an asynchronous pipeline backed by one SQLite store:
//!
//! - Keywords are refilled into a durable task queue under a depth ceiling
//!   ([`refill`]), answered by a rate-limited worker pool ([`worker`]) through
//!   the LLM client ([`api`]), and written back by result callbacks
//!   ([`callbacks`]) that keep the counters in [`statistics`] consistent.
//! - Templates ([`template`]) are expanded per domain into conversations and
//!   messages ([`builder`]) and submitted with [`dispatch`], which also
//!   requests business profiles for domains.
//! - [`reset`] is the manual recovery path; [`search`] indexes answers and
//!   brands; [`ingest`] loads keywords, domains and projects.
//!
//! ## Modules
//! - [`api`], [`broker`], [`builder`], [`callbacks`], [`commands`], [`config`],
//!   [`db`], [`dispatch`], [`error`], [`ingest`], [`models`], [`refill`],
//!   [`reset`], [`schema`], [`search`], [`statistics`], [`template`], [`worker`]

use directories::ProjectDirs;
use std::path::PathBuf;

pub mod api;
pub mod broker;
pub mod builder;
pub mod callbacks;
pub mod commands;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod models;
pub mod refill;
pub mod reset;
pub mod schema;
pub mod search;
pub mod statistics;
pub mod template;
pub mod worker;

use crate::error::RankError;

/// Return the per-platform configuration directory used by TopRanks.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "topranks", "topranks")`. The directory is **not** created here.
///
/// # Errors
/// Returns an error if the platform configuration directory cannot be
/// determined (rare, but possible in sandboxed environments).
///
/// # Examples
/// ```rust
/// let cfg = topranks::config_dir().expect("has a config dir");
/// println!("config at {}", cfg.display());
/// ```
pub fn config_dir() -> Result<PathBuf, RankError> {
    let proj_dirs = ProjectDirs::from("com", "topranks", "topranks")
        .ok_or_else(|| RankError::Config("unable to determine config directory".into()))?;
    Ok(proj_dirs.config_dir().to_path_buf())
}

/// Default location of the configuration file.
pub fn default_config_path() -> Result<PathBuf, RankError> {
    Ok(config_dir()?.join("config.yaml"))
}
