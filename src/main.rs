//! Main module for the TopRanks CLI application (`topranks`).
//!
//! This module provides the main function: it installs logging, parses the
//! command line, loads the configuration and dispatches to the library.
//!
//! # Examples
//!
//! ```sh
//! topranks init
//! topranks import-keywords keywords.txt
//! topranks refill
//! topranks worker
//! topranks stats --recount
//! ```

use clap::Parser;
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::{error::Error, fs, path::Path, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use topranks::{
    api::OpenAiClient,
    broker, builder,
    commands::{Cli, Commands},
    config::{self, TopRanksConfig},
    db::Database,
    dispatch, ingest, refill, reset, search, statistics,
    template::{self, BUILTIN_TEMPLATES},
    worker::{self, Worker},
};

static TRACING: OnceCell<()> = OnceCell::new();

fn main() -> Result<(), Box<dyn Error>> {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    });
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run())
}

fn print_report<T: Serialize>(report: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

fn read_lines(path: &Path) -> Result<Vec<String>, Box<dyn Error>> {
    Ok(fs::read_to_string(path)?
        .lines()
        .map(str::to_string)
        .collect())
}

/// Main asynchronous function of the TopRanks CLI application.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the selected
/// command fails.
async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => topranks::default_config_path()?,
    };

    if let Commands::Init = cli.command {
        return init(&config_path);
    }

    debug!("Loading config from: {}", config_path.display());
    let mut config = config::load_config(&config_path)?;
    if let Some(environment) = cli.environment {
        config.environment = environment;
    }
    let policy = config.queue_policy();
    debug!(?policy, "queue policy resolved");

    let db = Database::new(config.db_url.clone());
    db.migrate()?;
    let mut conn = db.connect()?;

    match cli.command {
        // Runs before any config is loaded.
        Commands::Init => {}
        Commands::ImportDomains { file, project } => {
            let lines = read_lines(&file)?;
            let report = ingest::import_domains(&mut conn, &lines)?;
            if let Some(project) = project {
                let project_id = ingest::ensure_project(&mut conn, &project)?;
                let linked = ingest::assign_domains(&mut conn, project_id, &lines)?;
                info!(project = %project, project_id, linked, "domains assigned");
            }
            print_report(&report)?;
        }
        Commands::ImportKeywords { file } => {
            let report = ingest::import_keywords(&mut conn, read_lines(&file)?)?;
            print_report(&report)?;
        }
        Commands::AddTemplate { file, project } => {
            let definition = template::load_template(&file)?;
            let template_id = template::install_template(&mut conn, &definition, project)?;
            println!("installed template {template_id} ({} items)", definition.items.len());
        }
        Commands::Refill => {
            let report = refill::refill(&mut conn, &policy, &config.prompts)?;
            print_report(&report)?;
        }
        Commands::Worker { once } => {
            drop(conn);
            let client = Arc::new(OpenAiClient::new(&config)?);
            if once {
                let limiter = Arc::new(worker::rate_limiter(config.worker.requests_per_minute));
                let single = Worker::new(
                    format!("cli-{}", std::process::id()),
                    db,
                    client,
                    limiter,
                    config.worker.clone(),
                );
                match single.process_next().await? {
                    Some(outcome) => println!("{outcome:?}"),
                    None => println!("no runnable task"),
                }
            } else {
                let shutdown = CancellationToken::new();
                tokio::spawn({
                    let shutdown = shutdown.clone();
                    async move {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            info!("received Ctrl-C, finishing in-flight tasks");
                        }
                        shutdown.cancel();
                    }
                });
                let report = worker::run_pool(&config, client, shutdown).await?;
                print_report(&report)?;
            }
        }
        Commands::Build {
            template,
            ai_model,
            project,
            mode,
            include_adult,
        } => {
            let report = builder::build(
                &mut conn,
                &policy,
                &builder::BuildRequest {
                    template_id: template,
                    ai_model_id: ai_model,
                    project_id: project,
                    mode,
                    include_adult,
                },
            )?;
            print_report(&report)?;
        }
        Commands::RequestConversation { id } => {
            let messages = dispatch::request_conversation(&mut conn, id)?;
            println!("queued {messages} messages");
        }
        Commands::RequestProject { id } => {
            let report = dispatch::request_project(&mut conn, id)?;
            print_report(&report)?;
        }
        Commands::EnrichDomains { batch } => {
            let dispatched = dispatch::request_business_data(&mut conn, batch, &config.prompts)?;
            println!("queued {dispatched} domains");
        }
        Commands::IndexBrands { batch } => {
            let report = search::index_brands(&mut conn, batch)?;
            print_report(&report)?;
        }
        Commands::ResetQueue => {
            let report = reset::reset_queue(&mut conn)?;
            print_report(&report)?;
        }
        Commands::Stats { recount } => {
            let stats = if recount {
                statistics::recount(&mut conn)?
            } else {
                statistics::snapshot(&mut conn)?
            };
            if !stats.is_consistent() {
                warn!(?stats, "statistics drifted; run `topranks stats --recount`");
            }
            print_report(&stats)?;
            let depth = broker::depth(&mut conn)?;
            println!("tasks queued: {}, running: {}", depth.queued, depth.running);
        }
        Commands::Search { query, limit } => {
            for hit in search::search_keywords(&mut conn, &query, limit)? {
                println!("{:>8.3}  {}", hit.score, hit.keyword);
            }
        }
    }

    Ok(())
}

/// Initializes the application's configuration, templates and database.
///
/// Writes a starter `config.yaml` (unless one exists) and the built-in
/// template files next to it, then creates the schema and seeds the statistic
/// keys, the built-in templates and the default AI model.
///
/// # Errors
///
/// Returns an error if the directories or files cannot be created, or the
/// database cannot be initialized.
fn init(config_path: &Path) -> Result<(), Box<dyn Error>> {
    let config_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| Path::new(".").to_path_buf());
    let templates_dir = config_dir.join("templates");
    info!("Creating template config directory: {}", templates_dir.display());
    fs::create_dir_all(&templates_dir)?;

    for (file_name, yaml) in BUILTIN_TEMPLATES {
        let path = templates_dir.join(file_name);
        if !path.exists() {
            info!("Creating template file: {}", path.display());
            fs::write(path, yaml)?;
        }
    }

    if config_path.exists() {
        info!("Keeping existing config file: {}", config_path.display());
    } else {
        info!("Creating config file: {}", config_path.display());
        let db_path = config_dir.join("topranks.db");
        let starter = TopRanksConfig::starter(db_path.to_string_lossy().to_string());
        fs::write(config_path, serde_yaml::to_string(&starter)?)?;
    }

    let config = config::load_config(config_path)?;
    let db = Database::new(config.db_url.clone());
    db.migrate()?;
    let mut conn = db.connect()?;
    let seeded = statistics::seed(&mut conn)?;
    let templates = template::seed_default_templates(&mut conn)?;
    println!(
        "initialized {} (statistics seeded: {seeded}, templates installed: {templates})",
        config_path.display()
    );
    Ok(())
}
