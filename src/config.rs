//! This module provides functionality for loading and handling the application's configuration.
//!
//! It defines the [`TopRanksConfig`] struct, which holds the configuration parameters,
//! the environment-dependent [`QueuePolicy`], and [`load_config`] to read it all from YAML.
//!
//! The queue policy is resolved **once** at process start (see
//! [`TopRanksConfig::queue_policy`]) and injected into the refill controller and the
//! conversation builder, so no call site re-reads the environment on its own.
//!
//! # Examples
//!
//! ```no_run
//! use topranks::config::load_config;
//!
//! let config = load_config("/path/to/config.yaml").unwrap();
//! println!("{:?}", config.queue_policy());
//! ```

use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use tracing::debug;

use crate::error::RankError;

/// Deployment profile; picks the default batch sizes and queue ceiling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

/// Batch sizing and backpressure knobs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    /// Nominal number of keywords selected per refill pass.
    pub batch_size: i64,
    /// Ceiling on requested-but-unanswered keywords.
    pub max_queue_depth: i64,
    /// Rows per bulk `UPDATE` when marking a batch requested.
    pub update_chunk_size: usize,
    /// Records accumulated before a bulk insert is flushed.
    pub insert_batch_size: usize,
}

impl QueuePolicy {
    pub const fn development() -> Self {
        Self {
            batch_size: 10,
            max_queue_depth: 30,
            update_chunk_size: 5000,
            insert_batch_size: 5000,
        }
    }

    pub const fn production() -> Self {
        Self {
            batch_size: 100,
            max_queue_depth: 300,
            update_chunk_size: 5000,
            insert_batch_size: 5000,
        }
    }

    /// Rejects sizes that would disable batching or the queue ceiling.
    pub fn validate(&self) -> Result<(), RankError> {
        if self.batch_size <= 0 || self.max_queue_depth <= 0 {
            return Err(RankError::Config(format!(
                "queue.batch_size ({}) and queue.max_queue_depth ({}) must be positive",
                self.batch_size, self.max_queue_depth
            )));
        }
        if self.update_chunk_size == 0 || self.insert_batch_size == 0 {
            return Err(RankError::Config(
                "queue.update_chunk_size and queue.insert_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Development => Self::development(),
            Environment::Production => Self::production(),
        }
    }
}

/// Worker pool settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WorkerSettings {
    /// Concurrent task loops per worker process.
    pub concurrency: usize,
    /// Global admission limit on LLM calls.
    pub requests_per_minute: u32,
    /// Seconds between scheduled refill passes; `0` disables the scheduler.
    pub refill_interval_secs: u64,
    /// Task-runner retries after the client's own retries are exhausted.
    pub task_max_retries: i32,
    pub task_retry_backoff_secs: u64,
    /// Running tasks locked for longer than this are returned to the queue.
    pub stale_task_secs: u64,
    pub idle_poll_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 8,
            requests_per_minute: 1500,
            refill_interval_secs: 30,
            task_max_retries: 5,
            task_retry_backoff_secs: 5,
            stale_task_secs: 900,
            idle_poll_ms: 500,
        }
    }
}

/// Exponential backoff with jitter for the LLM client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            min_delay_ms: 1_000,
            max_delay_ms: 60_000,
            request_timeout_secs: 120,
        }
    }
}

impl RetrySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Prompt text sent with enrichment tasks.
///
/// `keyword` must contain `@currentKeyword`, `business` must contain `@currentDomain`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PromptSet {
    pub system: String,
    pub keyword: String,
    pub business: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            system: "You are a helpful assistant.".to_string(),
            keyword: crate::template::KEYWORD_PROMPT.to_string(),
            business: crate::template::BUSINESS_PROMPT.to_string(),
        }
    }
}

/// Represents the application's configuration.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct TopRanksConfig {
    /// The API key used to authenticate requests to the API.
    pub api_key: String,

    /// The base URL of the OpenAI-compatible API.
    pub api_base: String,

    /// Model used when a task does not name one.
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// SQLite database path or URL.
    pub db_url: String,

    #[serde(default)]
    pub environment: Environment,

    /// Explicit override of the profile's queue policy.
    #[serde(default)]
    pub queue: Option<QueuePolicy>,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub prompts: PromptSet,
}

fn default_temperature() -> f32 {
    0.6
}

impl TopRanksConfig {
    /// The queue policy in force: the explicit override, else the profile default.
    pub fn queue_policy(&self) -> QueuePolicy {
        self.queue
            .unwrap_or_else(|| QueuePolicy::for_environment(self.environment))
    }

    /// A starter configuration written by `topranks init`.
    pub fn starter(db_url: String) -> Self {
        Self {
            api_key: "CHANGEME".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            temperature: default_temperature(),
            db_url,
            environment: Environment::Development,
            queue: None,
            worker: WorkerSettings::default(),
            retry: RetrySettings::default(),
            prompts: PromptSet::default(),
        }
    }
}

/// Loads the application's configuration from a YAML file.
///
/// # Errors
/// Returns an error if the file cannot be read or is not valid YAML for
/// [`TopRanksConfig`].
pub fn load_config(file: impl AsRef<Path>) -> Result<TopRanksConfig, RankError> {
    let file = file.as_ref();
    debug!("Loading config from {}", file.display());
    let content = fs::read_to_string(file)?;
    let config: TopRanksConfig = serde_yaml::from_str(&content)?;
    if let Some(queue) = &config.queue {
        queue.validate()?;
    }
    Ok(config)
}

/// Opens a SQLite connection with the pragmas every code path relies on.
///
/// `busy_timeout` lets concurrent writers queue on the database lock instead of
/// failing immediately.
pub fn establish_connection(db_url: &str) -> Result<SqliteConnection, RankError> {
    let mut conn =
        SqliteConnection::establish(db_url).map_err(|source| RankError::Connection {
            url: db_url.to_string(),
            source,
        })?;
    diesel::connection::SimpleConnection::batch_execute(
        &mut conn,
        "PRAGMA busy_timeout = 15000; PRAGMA foreign_keys = ON;",
    )?;
    Ok(conn)
}
