//! Submitting conversations and domains to the task broker.
//!
//! Like the keyword refill, each pass marks its records requested and enqueues
//! their tasks in the same `BEGIN IMMEDIATE` transaction, so a record is never
//! submitted twice.

use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::broker::{self, TaskKind};
use crate::config::PromptSet;
use crate::db::SQLITE_MAX_BINDS;
use crate::error::RankError;
use crate::models::Conversation;
use crate::schema::{ai_models, conversations, domains, messages, projects};
use crate::template::{CURRENT_DOMAIN_TOKEN, substitute};

/// Business-data requests per domain before the domain is left alone.
pub const MAX_BUSINESS_ATTEMPTS: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DispatchReport {
    pub conversations: usize,
    pub messages: usize,
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Marks and enqueues the conversation's unrequested, unanswered messages.
fn queue_messages(
    conn: &mut SqliteConnection,
    conversation: &Conversation,
    model: &str,
    now: NaiveDateTime,
) -> Result<usize, RankError> {
    let waiting: Vec<(i32, String)> = messages::table
        .filter(messages::conversation_id.eq(conversation.id))
        .filter(messages::requested_at.is_null())
        .filter(messages::answered_at.is_null())
        .order((messages::sort_order, messages::id))
        .select((messages::id, messages::prompt))
        .load(conn)?;
    if waiting.is_empty() {
        return Ok(0);
    }

    for chunk in waiting.chunks(SQLITE_MAX_BINDS - 1) {
        let ids: Vec<i32> = chunk.iter().map(|(id, _)| *id).collect();
        diesel::update(messages::table.filter(messages::id.eq_any(&ids)))
            .set(messages::requested_at.eq(Some(now)))
            .execute(conn)?;
    }
    diesel::update(conversations::table.find(conversation.id))
        .set(conversations::requested_at.eq(Some(now)))
        .execute(conn)?;

    let new_tasks: Vec<_> = waiting
        .into_iter()
        .map(|(id, prompt)| {
            broker::task(TaskKind::Message, id, prompt, Some(model.to_string()), now)
        })
        .collect();
    broker::enqueue(conn, &new_tasks)
}

/// Submits one conversation's messages.
///
/// Returns the number of messages queued; messages already requested or
/// answered are left alone.
///
/// # Errors
/// [`RankError::NotFound`] when the conversation does not exist.
pub fn request_conversation(
    conn: &mut SqliteConnection,
    conversation_id: i32,
) -> Result<usize, RankError> {
    let queued = conn.immediate_transaction(|conn| {
        let row: Option<(Conversation, String)> = conversations::table
            .inner_join(ai_models::table)
            .filter(conversations::id.eq(conversation_id))
            .select((Conversation::as_select(), ai_models::model))
            .first(conn)
            .optional()?;
        let (conversation, model) = row.ok_or(RankError::NotFound {
            entity: "conversation",
            id: conversation_id,
        })?;
        queue_messages(conn, &conversation, &model, now())
    })?;
    info!(conversation_id, messages = queued, "conversation requested");
    Ok(queued)
}

/// Submits every conversation of a project.
pub fn request_project(
    conn: &mut SqliteConnection,
    project_id: i32,
) -> Result<DispatchReport, RankError> {
    let exists: i64 = projects::table.find(project_id).count().get_result(conn)?;
    if exists == 0 {
        return Err(RankError::NotFound {
            entity: "project",
            id: project_id,
        });
    }

    let rows: Vec<(Conversation, String)> = conversations::table
        .inner_join(ai_models::table)
        .filter(conversations::project_id.eq(project_id))
        .order(conversations::id)
        .select((Conversation::as_select(), ai_models::model))
        .load(conn)?;

    let mut report = DispatchReport::default();
    for (conversation, model) in rows {
        let queued =
            conn.immediate_transaction(|conn| queue_messages(conn, &conversation, &model, now()))?;
        if queued > 0 {
            report.conversations += 1;
            report.messages += queued;
        }
    }
    info!(
        project_id,
        conversations = report.conversations,
        messages = report.messages,
        "project requested"
    );
    Ok(report)
}

/// Enqueues business-data requests for up to `batch` domains.
///
/// Eligible domains have no stored profile, no request in flight and fewer
/// than [`MAX_BUSINESS_ATTEMPTS`] attempts. Only dispatched domains have their
/// attempt counter incremented.
pub fn request_business_data(
    conn: &mut SqliteConnection,
    batch: i64,
    prompts: &PromptSet,
) -> Result<usize, RankError> {
    if batch <= 0 {
        return Ok(0);
    }
    let dispatched = conn.immediate_transaction(|conn| {
        let selected: Vec<(i32, String)> = domains::table
            .filter(domains::business_json.is_null())
            .filter(domains::business_requested_at.is_null())
            .filter(domains::business_attempts.lt(MAX_BUSINESS_ATTEMPTS))
            .order(domains::id)
            .limit(batch)
            .select((domains::id, domains::domain))
            .load(conn)?;
        if selected.is_empty() {
            return Ok::<_, RankError>(0);
        }

        let now = now();
        for chunk in selected.chunks(SQLITE_MAX_BINDS - 1) {
            let ids: Vec<i32> = chunk.iter().map(|(id, _)| *id).collect();
            diesel::update(domains::table.filter(domains::id.eq_any(&ids)))
                .set((
                    domains::business_attempts.eq(domains::business_attempts + 1),
                    domains::business_requested_at.eq(Some(now)),
                ))
                .execute(conn)?;
        }

        let new_tasks: Vec<_> = selected
            .iter()
            .map(|(id, domain)| {
                broker::task(
                    TaskKind::Business,
                    *id,
                    substitute(&prompts.business, CURRENT_DOMAIN_TOKEN, domain),
                    None,
                    now,
                )
            })
            .collect();
        broker::enqueue(conn, &new_tasks)
    })?;
    info!(batch, dispatched, "business data requested");
    Ok(dispatched)
}
