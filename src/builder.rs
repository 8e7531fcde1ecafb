//! # Conversation builder
//!
//! Expands a template across domains: one [`Conversation`](crate::models::Conversation)
//! per (template, domain, project, AI model), then one message per template
//! item with `@currentDomain` substituted.
//!
//! All writes are multi-row `INSERT`s flushed every `insert_batch_size`
//! records (and split further to respect SQLite's bind limit); nothing is
//! saved row by row. Each flush commits on its own so lock time stays short.
//! A run that stops half way is resumed by building again: conversations that
//! exist but have no messages are filled in.

use chrono::Utc;
use diesel::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::config::QueuePolicy;
use crate::db::rows_per_statement;
use crate::error::RankError;
use crate::models::{NewConversation, NewMessage, Template, TemplateItem, TemplateScope};
use crate::schema::{
    ai_models, conversations, domains, messages, project_domains, projects, template_items,
    templates,
};
use crate::template::{CURRENT_DOMAIN_TOKEN, substitute};

const CONVERSATION_COLUMNS: usize = 5;
const MESSAGE_COLUMNS: usize = 6;

/// What to do with conversations that already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BuildMode {
    /// Leave them (and their messages) untouched.
    #[default]
    SkipExisting,
    /// Delete their messages, clear their timestamps and regenerate.
    Rebuild,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub template_id: i32,
    pub ai_model_id: i32,
    pub project_id: Option<i32>,
    pub mode: BuildMode,
    /// Include adult-content domains when building across all domains.
    pub include_adult: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BuildReport {
    pub domains_targeted: usize,
    /// Project links whose domain no longer exists.
    pub domains_skipped: usize,
    pub conversations_created: usize,
    pub conversations_rebuilt: usize,
    pub messages_created: usize,
}

/// Buffers rows and writes them in bounded multi-row inserts.
struct MessageWriter {
    buffer: Vec<NewMessage>,
    flush_at: usize,
    written: usize,
}

impl MessageWriter {
    fn new(flush_at: usize) -> Self {
        let flush_at = flush_at.max(1);
        Self {
            buffer: Vec::with_capacity(flush_at),
            flush_at,
            written: 0,
        }
    }

    fn push(&mut self, conn: &mut SqliteConnection, message: NewMessage) -> Result<(), RankError> {
        self.buffer.push(message);
        if self.buffer.len() >= self.flush_at {
            self.flush(conn)?;
        }
        Ok(())
    }

    fn flush(&mut self, conn: &mut SqliteConnection) -> Result<(), RankError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        for chunk in self.buffer.chunks(rows_per_statement(MESSAGE_COLUMNS)) {
            self.written += diesel::insert_into(messages::table)
                .values(chunk)
                .execute(conn)?;
        }
        debug!(rows = self.buffer.len(), "message batch flushed");
        self.buffer.clear();
        Ok(())
    }
}

fn load_template(conn: &mut SqliteConnection, template_id: i32) -> Result<Template, RankError> {
    let template = templates::table
        .find(template_id)
        .select(Template::as_select())
        .first(conn)
        .optional()?
        .ok_or(RankError::NotFound {
            entity: "template",
            id: template_id,
        })?;
    if template.scope()? == TemplateScope::Global {
        return Err(RankError::InvalidInput(format!(
            "template {template_id} has global scope and is not expanded per domain"
        )));
    }
    Ok(template)
}

fn require_model_and_project(
    conn: &mut SqliteConnection,
    request: &BuildRequest,
) -> Result<(), RankError> {
    let models: i64 = ai_models::table
        .find(request.ai_model_id)
        .count()
        .get_result(conn)?;
    if models == 0 {
        return Err(RankError::NotFound {
            entity: "ai_model",
            id: request.ai_model_id,
        });
    }
    if let Some(project_id) = request.project_id {
        let projects: i64 = projects::table.find(project_id).count().get_result(conn)?;
        if projects == 0 {
            return Err(RankError::NotFound {
                entity: "project",
                id: project_id,
            });
        }
    }
    Ok(())
}

/// Domains to expand over, plus the number of dangling project links skipped.
fn target_domains(
    conn: &mut SqliteConnection,
    request: &BuildRequest,
) -> Result<(Vec<(i32, String)>, usize), RankError> {
    let Some(project_id) = request.project_id else {
        let mut query = domains::table
            .order(domains::id)
            .select((domains::id, domains::domain))
            .into_boxed();
        if !request.include_adult {
            query = query.filter(domains::adult_content.eq(false));
        }
        return Ok((query.load(conn)?, 0));
    };

    let linked: Vec<i32> = project_domains::table
        .filter(project_domains::project_id.eq(project_id))
        .order(project_domains::domain_id)
        .select(project_domains::domain_id)
        .load(conn)?;

    let mut found = Vec::with_capacity(linked.len());
    for chunk in linked.chunks(rows_per_statement(1)) {
        let rows: Vec<(i32, String)> = domains::table
            .filter(domains::id.eq_any(chunk))
            .order(domains::id)
            .select((domains::id, domains::domain))
            .load(conn)?;
        found.extend(rows);
    }

    let present: HashSet<i32> = found.iter().map(|(id, _)| *id).collect();
    let mut skipped = 0;
    for domain_id in linked.iter().filter(|id| !present.contains(id)) {
        warn!(project_id, domain_id, "project links a missing domain, skipping");
        skipped += 1;
    }
    Ok((found, skipped))
}

/// Conversation ids by domain for the request's (template, project, model).
fn conversation_ids(
    conn: &mut SqliteConnection,
    request: &BuildRequest,
) -> Result<HashMap<i32, i32>, RankError> {
    let mut query = conversations::table
        .filter(conversations::template_id.eq(request.template_id))
        .filter(conversations::ai_model_id.eq(request.ai_model_id))
        .select((conversations::domain_id, conversations::id))
        .into_boxed();
    query = match request.project_id {
        Some(project_id) => query.filter(conversations::project_id.eq(project_id)),
        None => query.filter(conversations::project_id.is_null()),
    };
    let rows: Vec<(i32, i32)> = query.load(conn)?;
    Ok(rows.into_iter().collect())
}

/// Builds conversations and messages for one template.
///
/// # Errors
/// Fails before writing anything when the template, AI model or project does
/// not exist, or when the template has global scope.
pub fn build(
    conn: &mut SqliteConnection,
    policy: &QueuePolicy,
    request: &BuildRequest,
) -> Result<BuildReport, RankError> {
    let template = load_template(conn, request.template_id)?;
    require_model_and_project(conn, request)?;

    let items: Vec<TemplateItem> = TemplateItem::belonging_to(&template)
        .order((template_items::sort_order, template_items::id))
        .select(TemplateItem::as_select())
        .load(conn)?;

    let (targets, domains_skipped) = target_domains(conn, request)?;
    let mut report = BuildReport {
        domains_targeted: targets.len(),
        domains_skipped,
        ..BuildReport::default()
    };
    let flush_at = policy.insert_batch_size.max(1);

    // Conversations.
    let existing = conversation_ids(conn, request)?;
    let now = Utc::now().naive_utc();
    let new_conversations: Vec<NewConversation> = targets
        .iter()
        .filter(|(domain_id, _)| !existing.contains_key(domain_id))
        .map(|(domain_id, _)| NewConversation {
            template_id: request.template_id,
            domain_id: *domain_id,
            project_id: request.project_id,
            ai_model_id: request.ai_model_id,
            created_at: now,
        })
        .collect();
    let per_statement = flush_at.min(rows_per_statement(CONVERSATION_COLUMNS));
    for chunk in new_conversations.chunks(per_statement) {
        report.conversations_created += diesel::insert_or_ignore_into(conversations::table)
            .values(chunk)
            .execute(conn)?;
    }

    if request.mode == BuildMode::Rebuild {
        let rebuild: Vec<i32> = targets
            .iter()
            .filter_map(|(domain_id, _)| existing.get(domain_id).copied())
            .collect();
        for chunk in rebuild.chunks(rows_per_statement(1)) {
            conn.transaction(|conn| {
                diesel::delete(messages::table.filter(messages::conversation_id.eq_any(chunk)))
                    .execute(conn)?;
                diesel::update(conversations::table.filter(conversations::id.eq_any(chunk)))
                    .set((
                        conversations::requested_at.eq(None::<chrono::NaiveDateTime>),
                        conversations::answered_at.eq(None::<chrono::NaiveDateTime>),
                    ))
                    .execute(conn)?;
                Ok::<_, RankError>(())
            })?;
        }
        report.conversations_rebuilt = rebuild.len();
    }

    // Messages for every targeted conversation that has none.
    let by_domain = conversation_ids(conn, request)?;
    let target_conversations: Vec<i32> = targets
        .iter()
        .filter_map(|(domain_id, _)| by_domain.get(domain_id).copied())
        .collect();
    let mut filled = HashSet::new();
    for chunk in target_conversations.chunks(rows_per_statement(1)) {
        let with_messages: Vec<i32> = messages::table
            .filter(messages::conversation_id.eq_any(chunk))
            .select(messages::conversation_id)
            .distinct()
            .load(conn)?;
        filled.extend(with_messages);
    }

    let mut writer = MessageWriter::new(flush_at);
    for (domain_id, domain_name) in &targets {
        let Some(&conversation_id) = by_domain.get(domain_id) else {
            continue;
        };
        if filled.contains(&conversation_id) {
            continue;
        }
        for item in &items {
            writer.push(
                conn,
                NewMessage {
                    conversation_id,
                    template_item_id: Some(item.id),
                    title: item
                        .title
                        .as_deref()
                        .map(|t| substitute(t, CURRENT_DOMAIN_TOKEN, domain_name)),
                    prompt: substitute(&item.prompt, CURRENT_DOMAIN_TOKEN, domain_name),
                    visible: item.visible,
                    sort_order: item.sort_order,
                },
            )?;
        }
    }
    writer.flush(conn)?;
    report.messages_created = writer.written;

    info!(
        template_id = request.template_id,
        ai_model_id = request.ai_model_id,
        project_id = ?request.project_id,
        domains = report.domains_targeted,
        skipped = report.domains_skipped,
        created = report.conversations_created,
        rebuilt = report.conversations_rebuilt,
        messages = report.messages_created,
        "conversations built"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::test_db;
    use crate::ingest::{assign_domains, ensure_project, import_domains};
    use crate::models::{Conversation, Message, NewProjectDomain};
    use crate::template::{ensure_ai_model, install_template, parse_template};

    const THREE_ITEMS: &str = r#"
name: Research
items:
  - title: "SWOT for @currentDomain"
    prompt: "Conduct a SWOT analysis for @currentDomain"
    order: 1
  - prompt: "Who competes with @currentDomain?"
    order: 2
  - prompt: "Buyer personas for @currentDomain"
    visible: false
    order: 3
"#;

    struct Fixture {
        template_id: i32,
        ai_model_id: i32,
    }

    fn fixture(conn: &mut SqliteConnection) -> Fixture {
        let template_id = install_template(conn, &parse_template(THREE_ITEMS).unwrap(), None).unwrap();
        let ai_model_id = ensure_ai_model(conn, "test", "gpt-test").unwrap();
        import_domains(conn, ["a.com", "b.com"]).unwrap();
        Fixture {
            template_id,
            ai_model_id,
        }
    }

    fn request(f: &Fixture) -> BuildRequest {
        BuildRequest {
            template_id: f.template_id,
            ai_model_id: f.ai_model_id,
            project_id: None,
            mode: BuildMode::SkipExisting,
            include_adult: false,
        }
    }

    fn all_messages(conn: &mut SqliteConnection) -> Vec<Message> {
        messages::table
            .order((messages::conversation_id, messages::sort_order))
            .select(Message::as_select())
            .load(conn)
            .unwrap()
    }

    #[test]
    fn builds_one_conversation_per_domain_and_one_message_per_item() {
        let test = test_db();
        let mut conn = test.conn();
        let f = fixture(&mut conn);

        let report = build(&mut conn, &QueuePolicy::development(), &request(&f)).unwrap();
        assert_eq!(report.conversations_created, 2);
        assert_eq!(report.messages_created, 6);

        let messages = all_messages(&mut conn);
        assert_eq!(messages.len(), 6);
        assert!(messages.iter().all(|m| !m.prompt.contains(CURRENT_DOMAIN_TOKEN)));
        assert_eq!(messages[0].prompt, "Conduct a SWOT analysis for a.com");
        assert_eq!(messages[0].title.as_deref(), Some("SWOT for a.com"));
        assert_eq!(messages[3].prompt, "Conduct a SWOT analysis for b.com");
        assert_eq!(
            messages.iter().map(|m| m.sort_order).collect::<Vec<_>>(),
            vec![1, 2, 3, 1, 2, 3]
        );
        assert!(!messages[2].visible);
    }

    #[test]
    fn building_twice_creates_no_duplicates() {
        let test = test_db();
        let mut conn = test.conn();
        let f = fixture(&mut conn);

        build(&mut conn, &QueuePolicy::development(), &request(&f)).unwrap();
        let again = build(&mut conn, &QueuePolicy::development(), &request(&f)).unwrap();
        assert_eq!(again.conversations_created, 0);
        assert_eq!(again.messages_created, 0);

        let conversations: i64 = conversations::table.count().get_result(&mut conn).unwrap();
        assert_eq!(conversations, 2);
        assert_eq!(all_messages(&mut conn).len(), 6);
    }

    #[test]
    fn unique_index_rejects_a_duplicate_pairing() {
        let test = test_db();
        let mut conn = test.conn();
        let f = fixture(&mut conn);
        build(&mut conn, &QueuePolicy::development(), &request(&f)).unwrap();

        let domain_id: i32 = domains::table.select(domains::id).first(&mut conn).unwrap();
        let duplicate = NewConversation {
            template_id: f.template_id,
            domain_id,
            project_id: None,
            ai_model_id: f.ai_model_id,
            created_at: Utc::now().naive_utc(),
        };
        assert!(
            diesel::insert_into(conversations::table)
                .values(&duplicate)
                .execute(&mut conn)
                .is_err()
        );
    }

    #[test]
    fn rebuild_regenerates_messages_and_clears_timestamps() {
        let test = test_db();
        let mut conn = test.conn();
        let f = fixture(&mut conn);
        build(&mut conn, &QueuePolicy::development(), &request(&f)).unwrap();

        let now = Utc::now().naive_utc();
        diesel::update(messages::table)
            .set(messages::answered_at.eq(Some(now)))
            .execute(&mut conn)
            .unwrap();
        diesel::update(conversations::table)
            .set((
                conversations::requested_at.eq(Some(now)),
                conversations::answered_at.eq(Some(now)),
            ))
            .execute(&mut conn)
            .unwrap();

        let mut rebuild = request(&f);
        rebuild.mode = BuildMode::Rebuild;
        let report = build(&mut conn, &QueuePolicy::development(), &rebuild).unwrap();
        assert_eq!(report.conversations_created, 0);
        assert_eq!(report.conversations_rebuilt, 2);
        assert_eq!(report.messages_created, 6);

        let messages = all_messages(&mut conn);
        assert_eq!(messages.len(), 6);
        assert!(messages.iter().all(|m| m.answered_at.is_none()));
        let conversations: Vec<Conversation> = conversations::table
            .select(Conversation::as_select())
            .load(&mut conn)
            .unwrap();
        assert!(
            conversations
                .iter()
                .all(|c| c.requested_at.is_none() && c.answered_at.is_none())
        );
    }

    #[test]
    fn project_build_skips_dangling_domains() {
        let test = test_db();
        let mut conn = test.conn();
        let f = fixture(&mut conn);
        let project_id = ensure_project(&mut conn, "acme").unwrap();
        assign_domains(&mut conn, project_id, &["b.com"]).unwrap();
        diesel::insert_into(project_domains::table)
            .values(&NewProjectDomain {
                project_id,
                domain_id: 999,
            })
            .execute(&mut conn)
            .unwrap();

        let mut scoped = request(&f);
        scoped.project_id = Some(project_id);
        let report = build(&mut conn, &QueuePolicy::development(), &scoped).unwrap();
        assert_eq!(report.domains_targeted, 1);
        assert_eq!(report.domains_skipped, 1);
        assert_eq!(report.conversations_created, 1);
        assert_eq!(report.messages_created, 3);

        // The unscoped pairing for the same domain is a different conversation.
        let unscoped = build(&mut conn, &QueuePolicy::development(), &request(&f)).unwrap();
        assert_eq!(unscoped.conversations_created, 2);
        let owned: Vec<Option<i32>> = conversations::table
            .order(conversations::id)
            .select(conversations::project_id)
            .load(&mut conn)
            .unwrap();
        assert_eq!(owned, vec![Some(project_id), None, None]);
    }

    #[test]
    fn adult_domains_are_excluded_unless_requested() {
        let test = test_db();
        let mut conn = test.conn();
        let f = fixture(&mut conn);
        diesel::update(domains::table.filter(domains::domain.eq("b.com")))
            .set(domains::adult_content.eq(true))
            .execute(&mut conn)
            .unwrap();

        let report = build(&mut conn, &QueuePolicy::development(), &request(&f)).unwrap();
        assert_eq!(report.conversations_created, 1);

        let mut with_adult = request(&f);
        with_adult.include_adult = true;
        let report = build(&mut conn, &QueuePolicy::development(), &with_adult).unwrap();
        assert_eq!(report.conversations_created, 1);
        assert_eq!(report.messages_created, 3);
    }

    #[test]
    fn small_flush_batches_still_write_everything() {
        let test = test_db();
        let mut conn = test.conn();
        let f = fixture(&mut conn);
        import_domains(&mut conn, ["c.com", "d.com", "e.com"]).unwrap();
        let policy = QueuePolicy {
            insert_batch_size: 2,
            ..QueuePolicy::development()
        };

        let report = build(&mut conn, &policy, &request(&f)).unwrap();
        assert_eq!(report.conversations_created, 5);
        assert_eq!(report.messages_created, 15);
    }

    #[test]
    fn empty_conversations_are_filled_on_the_next_run() {
        let test = test_db();
        let mut conn = test.conn();
        let f = fixture(&mut conn);
        build(&mut conn, &QueuePolicy::development(), &request(&f)).unwrap();

        let first: i32 = conversations::table
            .order(conversations::id)
            .select(conversations::id)
            .first(&mut conn)
            .unwrap();
        diesel::delete(messages::table.filter(messages::conversation_id.eq(first)))
            .execute(&mut conn)
            .unwrap();

        let report = build(&mut conn, &QueuePolicy::development(), &request(&f)).unwrap();
        assert_eq!(report.conversations_created, 0);
        assert_eq!(report.messages_created, 3);
    }

    #[test]
    fn invalid_references_fail_loudly() {
        let test = test_db();
        let mut conn = test.conn();
        let f = fixture(&mut conn);

        let mut bad = request(&f);
        bad.template_id = 404;
        assert!(matches!(
            build(&mut conn, &QueuePolicy::development(), &bad),
            Err(RankError::NotFound { entity: "template", id: 404 })
        ));

        let mut bad = request(&f);
        bad.ai_model_id = 404;
        assert!(matches!(
            build(&mut conn, &QueuePolicy::development(), &bad),
            Err(RankError::NotFound { entity: "ai_model", .. })
        ));

        let mut bad = request(&f);
        bad.project_id = Some(404);
        assert!(matches!(
            build(&mut conn, &QueuePolicy::development(), &bad),
            Err(RankError::NotFound { entity: "project", .. })
        ));

        let global = install_template(
            &mut conn,
            &parse_template("name: G\nscope: global\nitems:\n  - prompt: p\n    order: 1\n").unwrap(),
            None,
        )
        .unwrap();
        let mut bad = request(&f);
        bad.template_id = global;
        assert!(matches!(
            build(&mut conn, &QueuePolicy::development(), &bad),
            Err(RankError::InvalidInput(_))
        ));

        let conversations: i64 = conversations::table.count().get_result(&mut conn).unwrap();
        assert_eq!(conversations, 0);
    }
}
