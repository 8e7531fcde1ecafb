//! # Queue reset
//!
//! Manual recovery for records stuck in "requested" because their task was
//! lost. The broker and result backend are emptied entirely (every task kind,
//! not just keyword tasks) and every pending record goes back to its pool.
//!
//! Running this while a refill pass or workers are active is a known race: a
//! keyword can be returned to the pool while its task is about to answer it.
//! The keyword callback tolerates that late answer (`available -> answered`),
//! so the statistics stay consistent; stop the workers first anyway.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::broker;
use crate::error::RankError;
use crate::schema::{conversations, domains, keywords, messages};
use crate::statistics::{self, StatKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ResetReport {
    pub keywords: usize,
    pub messages: usize,
    pub domains: usize,
    pub tasks_discarded: usize,
    pub results_discarded: usize,
}

/// Returns every pending record to its pool and empties the broker.
///
/// Idempotent: a second run finds nothing pending and an empty broker.
pub fn reset_queue(conn: &mut SqliteConnection) -> Result<ResetReport, RankError> {
    let report = conn.immediate_transaction(|conn| {
        let pending = diesel::update(
            keywords::table
                .filter(keywords::requested_at.is_not_null())
                .filter(keywords::answered_at.is_null()),
        )
        .set(keywords::requested_at.eq(None::<NaiveDateTime>))
        .execute(conn)?;
        statistics::add(conn, StatKey::KeywordsAvailable, pending as i64)?;
        statistics::set(conn, StatKey::KeywordsPending, 0)?;

        let flushed = broker::flush(conn)?;

        let messages = diesel::update(
            messages::table
                .filter(messages::requested_at.is_not_null())
                .filter(messages::answered_at.is_null()),
        )
        .set(messages::requested_at.eq(None::<NaiveDateTime>))
        .execute(conn)?;
        diesel::update(
            conversations::table
                .filter(conversations::requested_at.is_not_null())
                .filter(conversations::answered_at.is_null()),
        )
        .set(conversations::requested_at.eq(None::<NaiveDateTime>))
        .execute(conn)?;

        let domains = diesel::update(
            domains::table
                .filter(domains::business_requested_at.is_not_null())
                .filter(domains::business_json.is_null()),
        )
        .set(domains::business_requested_at.eq(None::<NaiveDateTime>))
        .execute(conn)?;

        Ok::<_, RankError>(ResetReport {
            keywords: pending,
            messages,
            domains,
            tasks_discarded: flushed.tasks,
            results_discarded: flushed.results,
        })
    })?;

    info!(
        keywords = report.keywords,
        messages = report.messages,
        domains = report.domains,
        tasks = report.tasks_discarded,
        results = report.results_discarded,
        "queue reset"
    );
    Ok(report)
}
