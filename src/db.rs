//! Database handle, schema setup and bulk-insert helpers.
//!
//! Worker loops and administrative commands each open short-lived connections
//! through [`Database::connect`]; SQLite serializes writers and `busy_timeout`
//! makes them wait their turn.

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tracing::info;

use crate::config::establish_connection;
use crate::error::RankError;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// SQLite's default cap on bound parameters per statement.
pub const SQLITE_MAX_BINDS: usize = 32_766;

/// Cloneable handle naming the shared store.
#[derive(Debug, Clone)]
pub struct Database {
    url: String,
}

impl Database {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connect(&self) -> Result<SqliteConnection, RankError> {
        establish_connection(&self.url)
    }

    /// Switches the file to WAL mode and applies pending migrations.
    pub fn migrate(&self) -> Result<(), RankError> {
        let mut conn = self.connect()?;
        migrate(&mut conn)
    }
}

pub fn migrate(conn: &mut SqliteConnection) -> Result<(), RankError> {
    conn.batch_execute("PRAGMA journal_mode = WAL;")?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| RankError::Migration(e.to_string()))?;
    for version in &applied {
        info!(%version, "migration applied");
    }
    info!(applied = applied.len(), "schema is up to date");
    Ok(())
}

/// Largest row count per `INSERT` for a record with `columns` bound values.
pub fn rows_per_statement(columns: usize) -> usize {
    (SQLITE_MAX_BINDS / columns.max(1)).max(1)
}
