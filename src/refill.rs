//! # Keyword queue refill
//!
//! Moves a bounded batch of available keywords into the pending state and
//! enqueues one enrichment task per keyword.
//!
//! Backpressure: with `queued` keywords already pending, the nominal batch is
//! shrunk so that `queued + batch` never exceeds `max_queue_depth`. A batch of
//! zero is a no-op.
//!
//! Selection, the `requested_at` stamp, the statistics transfer and the
//! enqueue all happen in one `BEGIN IMMEDIATE` transaction, so two concurrent
//! refill passes can never select the same keyword.

use chrono::Utc;
use diesel::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::broker::{self, TaskKind};
use crate::config::{PromptSet, QueuePolicy};
use crate::db::SQLITE_MAX_BINDS;
use crate::error::RankError;
use crate::schema::keywords;
use crate::statistics::{self, StatKey};
use crate::template::{CURRENT_KEYWORD_TOKEN, substitute};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RefillReport {
    /// Pending keywords before this pass.
    pub queued_before: i64,
    /// Batch size after backpressure.
    pub batch_size: i64,
    pub submitted: usize,
}

/// Applies the queue ceiling to the policy's nominal batch size.
///
/// Never negative: SQLite reads a negative `LIMIT` as "no limit".
pub fn effective_batch_size(policy: &QueuePolicy, queued: i64) -> i64 {
    let batch_size = policy.batch_size.max(0);
    if queued + batch_size >= policy.max_queue_depth {
        (policy.max_queue_depth - queued).clamp(0, batch_size)
    } else {
        batch_size
    }
}

pub fn pending_keyword_count(conn: &mut SqliteConnection) -> Result<i64, RankError> {
    let count = keywords::table
        .filter(keywords::answered_at.is_null())
        .filter(keywords::requested_at.is_not_null())
        .count()
        .get_result(conn)?;
    Ok(count)
}

/// Runs one refill pass.
pub fn refill(
    conn: &mut SqliteConnection,
    policy: &QueuePolicy,
    prompts: &PromptSet,
) -> Result<RefillReport, RankError> {
    let report = conn.immediate_transaction(|conn| {
        let queued_before = pending_keyword_count(conn)?;
        let batch_size = effective_batch_size(policy, queued_before);
        let mut report = RefillReport {
            queued_before,
            batch_size,
            submitted: 0,
        };
        if batch_size <= 0 {
            return Ok::<_, RankError>(report);
        }

        let selected: Vec<(i32, String)> = keywords::table
            .filter(keywords::requested_at.is_null())
            .filter(keywords::answered_at.is_null())
            .order(keywords::id.asc())
            .limit(batch_size)
            .select((keywords::id, keywords::keyword))
            .load(conn)?;
        if selected.is_empty() {
            return Ok(report);
        }

        let now = Utc::now().naive_utc();
        let chunk_size = policy.update_chunk_size.clamp(1, SQLITE_MAX_BINDS - 1);
        for chunk in selected.chunks(chunk_size) {
            let ids: Vec<i32> = chunk.iter().map(|(id, _)| *id).collect();
            diesel::update(keywords::table.filter(keywords::id.eq_any(&ids)))
                .set(keywords::requested_at.eq(Some(now)))
                .execute(conn)?;
        }

        statistics::transfer(
            conn,
            StatKey::KeywordsAvailable,
            StatKey::KeywordsPending,
            selected.len() as i64,
        )?;

        let new_tasks: Vec<_> = selected
            .iter()
            .map(|(id, keyword)| {
                broker::task(
                    TaskKind::Keyword,
                    *id,
                    substitute(&prompts.keyword, CURRENT_KEYWORD_TOKEN, keyword),
                    None,
                    now,
                )
            })
            .collect();
        report.submitted = broker::enqueue(conn, &new_tasks)?;
        Ok(report)
    })?;

    info!(
        queued_before = report.queued_before,
        batch_size = report.batch_size,
        submitted = report.submitted,
        "keyword queue refilled"
    );
    Ok(report)
}
