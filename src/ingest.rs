//! Bulk ingestion of keywords, domains and projects.
//!
//! Inputs are plain lists of strings; file parsing stays with the caller.

use chrono::Utc;
use diesel::prelude::*;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, warn};

use crate::db::rows_per_statement;
use crate::error::RankError;
use crate::models::{NewDomain, NewKeyword, NewProject, NewProjectDomain};
use crate::schema::{domains, keywords, project_domains, projects};
use crate::statistics::{self, StatKey};

const INSERT_BATCH_SIZE: usize = 5000;

static DOMAIN_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z][a-z0-9-]{0,61}[a-z0-9]$")
        .expect("domain pattern is a valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ImportReport {
    pub received: usize,
    pub inserted: usize,
    /// Entries dropped as blank, duplicate within the input, or malformed.
    pub rejected: usize,
}

/// Inserts new keywords and counts them as available.
///
/// Text is trimmed; blanks and repeats are dropped; keywords already stored
/// are ignored by the unique index and not counted.
pub fn import_keywords<I, S>(conn: &mut SqliteConnection, texts: I) -> Result<ImportReport, RankError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut report = ImportReport::default();
    let mut rows = Vec::new();
    let now = Utc::now().naive_utc();

    for text in texts {
        report.received += 1;
        let keyword = text.as_ref().trim();
        if keyword.is_empty() || !seen.insert(keyword.to_string()) {
            report.rejected += 1;
            continue;
        }
        rows.push(NewKeyword {
            keyword: keyword.to_string(),
            created_at: now,
        });
    }

    let batch = INSERT_BATCH_SIZE.min(rows_per_statement(2));
    report.inserted = conn.transaction(|conn| {
        let mut inserted = 0;
        for chunk in rows.chunks(batch) {
            inserted += diesel::insert_or_ignore_into(keywords::table)
                .values(chunk)
                .execute(conn)?;
        }
        statistics::add(conn, StatKey::KeywordsTotal, inserted as i64)?;
        statistics::add(conn, StatKey::KeywordsAvailable, inserted as i64)?;
        Ok::<_, RankError>(inserted)
    })?;

    info!(
        received = report.received,
        inserted = report.inserted,
        rejected = report.rejected,
        "keywords imported"
    );
    Ok(report)
}

/// Lowercases a domain name and strips scheme, `www.`, path and port.
///
/// Returns `None` when what remains is not a plausible host name.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let mut name = raw.trim().to_lowercase();
    for scheme in ["https://", "http://"] {
        if let Some(rest) = name.strip_prefix(scheme) {
            name = rest.to_string();
        }
    }
    let host = name
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .split(':')
        .next()
        .unwrap_or_default()
        .trim_end_matches('.');
    let host = host.strip_prefix("www.").unwrap_or(host);
    DOMAIN_NAME.is_match(host).then(|| host.to_string())
}

/// Inserts new domains after normalization.
pub fn import_domains<I, S>(conn: &mut SqliteConnection, names: I) -> Result<ImportReport, RankError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut report = ImportReport::default();
    let mut rows = Vec::new();

    for raw in names {
        report.received += 1;
        let Some(domain) = normalize_domain(raw.as_ref()) else {
            if !raw.as_ref().trim().is_empty() {
                warn!(name = raw.as_ref(), "skipping malformed domain");
            }
            report.rejected += 1;
            continue;
        };
        if !seen.insert(domain.clone()) {
            report.rejected += 1;
            continue;
        }
        rows.push(NewDomain {
            domain,
            rank: None,
            keyword_count: None,
            traffic: None,
            cost: None,
            adult_content: false,
        });
    }

    let batch = INSERT_BATCH_SIZE.min(rows_per_statement(6));
    report.inserted = conn.transaction(|conn| {
        let mut inserted = 0;
        for chunk in rows.chunks(batch) {
            inserted += diesel::insert_or_ignore_into(domains::table)
                .values(chunk)
                .execute(conn)?;
        }
        Ok::<_, RankError>(inserted)
    })?;

    info!(
        received = report.received,
        inserted = report.inserted,
        rejected = report.rejected,
        "domains imported"
    );
    Ok(report)
}

/// Returns the id of the project named `name`, creating it if needed.
pub fn ensure_project(conn: &mut SqliteConnection, name: &str) -> Result<i32, RankError> {
    diesel::insert_or_ignore_into(projects::table)
        .values(&NewProject {
            project: name.to_string(),
            created_at: Utc::now().naive_utc(),
        })
        .execute(conn)?;
    let id = projects::table
        .filter(projects::project.eq(name))
        .select(projects::id)
        .first(conn)?;
    Ok(id)
}

/// Links stored domains to a project; names not found are skipped.
pub fn assign_domains<S: AsRef<str>>(
    conn: &mut SqliteConnection,
    project_id: i32,
    names: &[S],
) -> Result<usize, RankError> {
    let wanted: Vec<String> = names
        .iter()
        .filter_map(|n| normalize_domain(n.as_ref()))
        .collect();
    let mut linked = 0;
    for chunk in wanted.chunks(rows_per_statement(1)) {
        let ids: Vec<i32> = domains::table
            .filter(domains::domain.eq_any(chunk))
            .select(domains::id)
            .load(conn)?;
        let rows: Vec<NewProjectDomain> = ids
            .into_iter()
            .map(|domain_id| NewProjectDomain {
                project_id,
                domain_id,
            })
            .collect();
        for rows in rows.chunks(rows_per_statement(2)) {
            linked += diesel::insert_or_ignore_into(project_domains::table)
                .values(rows)
                .execute(conn)?;
        }
    }
    info!(project_id, linked, "domains assigned to project");
    Ok(linked)
}
