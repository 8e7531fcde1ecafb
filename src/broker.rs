//! # Task broker
//!
//! A durable work queue (`tasks`) and result backend (`task_results`) living in
//! the shared store. Producers ([`crate::refill`], [`crate::dispatch`]) enqueue
//! rows carrying only primitive identifiers and the rendered prompt; workers
//! claim them one at a time.
//!
//! ```text
//! queued --claim--> running --complete--> (row deleted, result written)
//!    ^                 |
//!    +----retry--------+          (attempts > task_max_retries: result "failed")
//!    +----recover_stale+
//! ```
//!
//! SQLite has no `FOR UPDATE SKIP LOCKED`; [`claim`] runs inside `BEGIN
//! IMMEDIATE`, which takes the database write lock before the read so two
//! workers can never claim the same row.

use chrono::{NaiveDateTime, TimeDelta};
use diesel::prelude::*;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::WorkerSettings;
use crate::db::rows_per_statement;
use crate::error::RankError;
use crate::models::{NewTask, NewTaskResult, Task};
use crate::schema::{task_results, tasks};

const STATE_QUEUED: &str = "queued";
const STATE_RUNNING: &str = "running";
const NEW_TASK_COLUMNS: usize = 8;

/// Which result callback a task reports to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Keyword,
    Message,
    Business,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Keyword => "keyword",
            TaskKind::Message => "message",
            TaskKind::Business => "business",
        }
    }

    pub fn parse(value: &str) -> Result<Self, RankError> {
        match value {
            "keyword" => Ok(TaskKind::Keyword),
            "message" => Ok(TaskKind::Message),
            "business" => Ok(TaskKind::Business),
            other => Err(RankError::InvalidInput(format!("unknown task kind: {other}"))),
        }
    }
}

/// Outcome recorded in the result backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// The callback stored the answer.
    Succeeded,
    /// The callback rejected the response and returned the record to the pool.
    Reverted,
    /// The LLM call kept failing past the task retry budget.
    Failed,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Succeeded => "succeeded",
            ResultStatus::Reverted => "reverted",
            ResultStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Requeued { attempts: i32, available_at: NaiveDateTime },
    Failed,
    /// The task no longer exists (flushed while in flight).
    Gone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub tasks: usize,
    pub results: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrokerDepth {
    pub queued: i64,
    pub running: i64,
}

impl BrokerDepth {
    pub fn total(&self) -> i64 {
        self.queued + self.running
    }
}

/// A ready-to-enqueue task row.
pub fn task(
    kind: TaskKind,
    target_id: i32,
    prompt: String,
    model: Option<String>,
    now: NaiveDateTime,
) -> NewTask {
    NewTask {
        kind: kind.as_str().to_string(),
        target_id,
        prompt,
        model,
        state: STATE_QUEUED.to_string(),
        attempts: 0,
        available_at: now,
        created_at: now,
    }
}

/// Bulk-inserts `new_tasks`, split to respect SQLite's bind limit.
///
/// Runs on the caller's connection, so a surrounding transaction makes the
/// enqueue atomic with the caller's state changes.
pub fn enqueue(conn: &mut SqliteConnection, new_tasks: &[NewTask]) -> Result<usize, RankError> {
    let mut inserted = 0;
    for chunk in new_tasks.chunks(rows_per_statement(NEW_TASK_COLUMNS)) {
        inserted += diesel::insert_into(tasks::table)
            .values(chunk)
            .execute(conn)?;
    }
    debug!(inserted, "tasks enqueued");
    Ok(inserted)
}

/// Locks and returns the oldest runnable task, if any.
pub fn claim(
    conn: &mut SqliteConnection,
    worker_id: &str,
    now: NaiveDateTime,
) -> Result<Option<Task>, RankError> {
    conn.immediate_transaction(|conn| {
        let next = tasks::table
            .filter(tasks::state.eq(STATE_QUEUED))
            .filter(tasks::available_at.le(now))
            .order((tasks::available_at.asc(), tasks::id.asc()))
            .select(tasks::id)
            .first::<i32>(conn)
            .optional()?;

        let Some(id) = next else {
            return Ok(None);
        };

        let claimed = diesel::update(tasks::table.find(id))
            .set((
                tasks::state.eq(STATE_RUNNING),
                tasks::locked_by.eq(Some(worker_id)),
                tasks::locked_at.eq(Some(now)),
            ))
            .returning(Task::as_returning())
            .get_result(conn)?;
        debug!(task_id = id, worker_id, "task claimed");
        Ok(Some(claimed))
    })
}

/// Removes a running task and records its result.
///
/// Returns `false` when the task was flushed (or recovered by another worker)
/// while in flight; nothing is recorded then.
pub fn complete(
    conn: &mut SqliteConnection,
    task: &Task,
    status: ResultStatus,
    detail: Option<String>,
    now: NaiveDateTime,
) -> Result<bool, RankError> {
    conn.transaction(|conn| {
        let deleted = diesel::delete(
            tasks::table
                .filter(tasks::id.eq(task.id))
                .filter(tasks::state.eq(STATE_RUNNING))
                .filter(tasks::locked_by.eq(task.locked_by.as_deref())),
        )
        .execute(conn)?;
        if deleted == 0 {
            return Ok(false);
        }

        diesel::insert_into(task_results::table)
            .values(&NewTaskResult {
                task_id: task.id,
                kind: task.kind.clone(),
                target_id: task.target_id,
                status: status.as_str().to_string(),
                detail,
                finished_at: now,
            })
            .execute(conn)?;
        Ok(true)
    })
}

/// `true` while `task` is still running under the lock it was claimed with.
pub fn is_held(conn: &mut SqliteConnection, task: &Task) -> Result<bool, RankError> {
    let count: i64 = tasks::table
        .filter(tasks::id.eq(task.id))
        .filter(tasks::state.eq(STATE_RUNNING))
        .filter(tasks::locked_by.eq(task.locked_by.as_deref()))
        .count()
        .get_result(conn)?;
    Ok(count > 0)
}

/// Task-runner retry after the LLM client gave up.
///
/// The task goes back to `queued` with a delay of `task_retry_backoff_secs *
/// attempts`; past `task_max_retries` it is recorded as failed and its target
/// record stays pending until a queue reset.
pub fn retry(
    conn: &mut SqliteConnection,
    task: &Task,
    error: &str,
    settings: &WorkerSettings,
    now: NaiveDateTime,
) -> Result<RetryOutcome, RankError> {
    let attempts = task.attempts + 1;
    if attempts > settings.task_max_retries {
        warn!(
            task_id = task.id,
            kind = %task.kind,
            target_id = task.target_id,
            attempts = task.attempts,
            error,
            "task retries exhausted"
        );
        let recorded = complete(
            conn,
            task,
            ResultStatus::Failed,
            Some(error.to_string()),
            now,
        )?;
        return Ok(if recorded {
            RetryOutcome::Failed
        } else {
            RetryOutcome::Gone
        });
    }

    let delay = settings
        .task_retry_backoff_secs
        .saturating_mul(attempts.max(0) as u64);
    let available_at = now + retry_delay(delay);
    let updated = diesel::update(
        tasks::table
            .filter(tasks::id.eq(task.id))
            .filter(tasks::state.eq(STATE_RUNNING))
            .filter(tasks::locked_by.eq(task.locked_by.as_deref())),
    )
    .set((
        tasks::state.eq(STATE_QUEUED),
        tasks::attempts.eq(attempts),
        tasks::available_at.eq(available_at),
        tasks::locked_by.eq(None::<String>),
        tasks::locked_at.eq(None::<NaiveDateTime>),
        tasks::last_error.eq(Some(error)),
    ))
    .execute(conn)?;

    if updated == 0 {
        return Ok(RetryOutcome::Gone);
    }
    info!(task_id = task.id, attempts, delay_secs = delay, "task requeued");
    Ok(RetryOutcome::Requeued {
        attempts,
        available_at,
    })
}

/// Retry delays saturate at this many days.
pub const MAX_RETRY_DELAY_DAYS: i64 = 7;

fn retry_delay(secs: u64) -> TimeDelta {
    let cap = TimeDelta::days(MAX_RETRY_DELAY_DAYS);
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .map_or(cap, |delay| delay.min(cap))
}

/// Returns running tasks locked before `now - older_than` to the queue.
pub fn recover_stale(
    conn: &mut SqliteConnection,
    now: NaiveDateTime,
    older_than: Duration,
) -> Result<usize, RankError> {
    let cutoff = i64::try_from(older_than.as_secs())
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(NaiveDateTime::MIN);
    let recovered = diesel::update(
        tasks::table
            .filter(tasks::state.eq(STATE_RUNNING))
            .filter(tasks::locked_at.le(cutoff)),
    )
    .set((
        tasks::state.eq(STATE_QUEUED),
        tasks::locked_by.eq(None::<String>),
        tasks::locked_at.eq(None::<NaiveDateTime>),
        tasks::available_at.eq(now),
    ))
    .execute(conn)?;
    if recovered > 0 {
        warn!(recovered, "stale running tasks returned to the queue");
    }
    Ok(recovered)
}

/// Deletes every queued and running task and every stored result.
pub fn flush(conn: &mut SqliteConnection) -> Result<FlushReport, RankError> {
    conn.transaction(|conn| {
        let tasks = diesel::delete(tasks::table).execute(conn)?;
        let results = diesel::delete(task_results::table).execute(conn)?;
        info!(tasks, results, "broker flushed");
        Ok(FlushReport { tasks, results })
    })
}

pub fn depth(conn: &mut SqliteConnection) -> Result<BrokerDepth, RankError> {
    let queued = tasks::table
        .filter(tasks::state.eq(STATE_QUEUED))
        .count()
        .get_result(conn)?;
    let running = tasks::table
        .filter(tasks::state.eq(STATE_RUNNING))
        .count()
        .get_result(conn)?;
    Ok(BrokerDepth { queued, running })
}
