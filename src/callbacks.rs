//! # Result callbacks
//!
//! Apply a completed LLM response to its keyword, message or domain record.
//!
//! The model is not bound to return pure JSON, so the embedded object is cut
//! out between the first `{` and the last `}` ([`extract_json_object`]) before
//! parsing. Each callback is all-or-nothing: either the record is fully
//! answered, or its "requested" mark is cleared so the record returns to the
//! available pool. `answered_at` is a one-way latch; a second delivery of the
//! same result is reported as [`CallbackOutcome::AlreadyAnswered`] and changes
//! nothing, statistics included.
//!
//! Parse failures never escape a callback. Database failures while storing an
//! answer trigger the revert path; only a missing statistic key is returned as
//! an error.

use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use pulldown_cmark::{Options, Parser, html};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::broker::{ResultStatus, TaskKind};
use crate::db::rows_per_statement;
use crate::error::{RankError, ResponseError};
use crate::ingest::normalize_domain;
use crate::models::{
    BrandType, Domain, Keyword, Message, NewBrand, NewBrandDomain, NewDomainCompetitor, RenderMode,
};
use crate::schema::{
    brand_domains, brands, conversations, domain_competitors, domains, keywords, messages,
    template_items,
};
use crate::statistics::{self, StatKey};

/// What a callback did with a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Answered,
    /// The record was answered before; nothing changed.
    AlreadyAnswered,
    /// The response was rejected and the record returned to the pool.
    Reverted(String),
    /// The target record no longer exists.
    Missing,
}

impl CallbackOutcome {
    pub fn result_status(&self) -> ResultStatus {
        match self {
            CallbackOutcome::Answered | CallbackOutcome::AlreadyAnswered => {
                ResultStatus::Succeeded
            }
            CallbackOutcome::Reverted(_) | CallbackOutcome::Missing => ResultStatus::Reverted,
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            CallbackOutcome::Answered => None,
            CallbackOutcome::AlreadyAnswered => Some("already answered".to_string()),
            CallbackOutcome::Reverted(reason) => Some(reason.clone()),
            CallbackOutcome::Missing => Some("record missing".to_string()),
        }
    }
}

/// Returns the substring from the first `{` to the last `}` inclusive.
pub fn extract_json_object(raw: &str) -> Result<&str, ResponseError> {
    match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if start < end => Ok(&raw[start..=end]),
        _ => Err(ResponseError::NoJsonObject),
    }
}

fn parse_embedded<T: serde::de::DeserializeOwned>(raw: &str) -> Result<(T, Value), ResponseError> {
    let value: Value = serde_json::from_str(extract_json_object(raw)?)?;
    let typed = serde_json::from_value(value.clone())?;
    Ok((typed, value))
}

/// The five fields a keyword response must carry.
///
/// Values are kept as raw JSON: models answer `"none"`, a string, or a list
/// for the query fields.
#[derive(Debug, Deserialize)]
pub struct KeywordEnrichment {
    pub user_intent: Value,
    pub natural_language_question: Value,
    pub ai_answer: Value,
    pub likely_previous_queries: Value,
    pub likely_next_queries: Value,
}

pub fn parse_keyword_response(raw: &str) -> Result<(KeywordEnrichment, Value), ResponseError> {
    parse_embedded(raw)
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Runs the callback matching a task kind.
pub fn on_result(
    conn: &mut SqliteConnection,
    kind: TaskKind,
    target_id: i32,
    raw: &str,
) -> Result<CallbackOutcome, RankError> {
    match kind {
        TaskKind::Keyword => on_keyword_result(conn, raw, target_id),
        TaskKind::Message => on_message_result(conn, raw, target_id),
        TaskKind::Business => on_business_result(conn, raw, target_id),
    }
}

/// Stores the outcome of `store`, falling back to `revert` when storing fails.
fn store_or_revert(
    conn: &mut SqliteConnection,
    entity: &'static str,
    id: i32,
    store: impl FnOnce(&mut SqliteConnection) -> Result<CallbackOutcome, RankError>,
    revert: impl FnOnce(&mut SqliteConnection, String) -> Result<CallbackOutcome, RankError>,
) -> Result<CallbackOutcome, RankError> {
    match store(conn) {
        Ok(outcome) => Ok(outcome),
        Err(err @ RankError::MissingStatistic(_)) => Err(err),
        Err(err) => {
            warn!(entity, id, error = %err, "failed to store answer, reverting");
            revert(conn, err.to_string())
        }
    }
}

// --- keywords -------------------------------------------------------------

/// Applies a keyword intent response.
///
/// Statistics: `pending -> answered` on success (`available -> answered` when
/// a queue reset already returned the keyword to the pool), `pending ->
/// available` on revert.
pub fn on_keyword_result(
    conn: &mut SqliteConnection,
    raw: &str,
    keyword_id: i32,
) -> Result<CallbackOutcome, RankError> {
    let outcome = match parse_keyword_response(raw) {
        Ok(parsed) => store_or_revert(
            conn,
            "keyword",
            keyword_id,
            |conn| store_keyword_answer(conn, keyword_id, &parsed),
            |conn, reason| revert_keyword(conn, keyword_id, reason),
        )?,
        Err(err) => {
            debug!(keyword_id, error = %err, "keyword response rejected");
            revert_keyword(conn, keyword_id, err.to_string())?
        }
    };

    match &outcome {
        CallbackOutcome::Reverted(reason) => {
            warn!(keyword_id, reason = %reason, "keyword returned to the pool")
        }
        other => debug!(keyword_id, outcome = ?other, "keyword result applied"),
    }
    Ok(outcome)
}

fn load_keyword(conn: &mut SqliteConnection, id: i32) -> Result<Option<Keyword>, RankError> {
    Ok(keywords::table
        .find(id)
        .select(Keyword::as_select())
        .first(conn)
        .optional()?)
}

fn store_keyword_answer(
    conn: &mut SqliteConnection,
    keyword_id: i32,
    (enrichment, raw_json): &(KeywordEnrichment, Value),
) -> Result<CallbackOutcome, RankError> {
    conn.immediate_transaction(|conn| {
        let Some(keyword) = load_keyword(conn, keyword_id)? else {
            return Ok(CallbackOutcome::Missing);
        };
        if keyword.answered_at.is_some() {
            return Ok(CallbackOutcome::AlreadyAnswered);
        }

        diesel::update(keywords::table.find(keyword_id))
            .set((
                keywords::user_intent.eq(text(&enrichment.user_intent)),
                keywords::natural_language_question
                    .eq(text(&enrichment.natural_language_question)),
                keywords::ai_answer.eq(text(&enrichment.ai_answer)),
                keywords::likely_previous_queries
                    .eq(Some(enrichment.likely_previous_queries.to_string())),
                keywords::likely_next_queries.eq(Some(enrichment.likely_next_queries.to_string())),
                keywords::json_response.eq(Some(raw_json.to_string())),
                keywords::answered_at.eq(Some(now())),
            ))
            .execute(conn)?;

        let from = if keyword.requested_at.is_some() {
            StatKey::KeywordsPending
        } else {
            StatKey::KeywordsAvailable
        };
        statistics::transfer(conn, from, StatKey::KeywordsAnswered, 1)?;
        Ok(CallbackOutcome::Answered)
    })
}

fn revert_keyword(
    conn: &mut SqliteConnection,
    keyword_id: i32,
    reason: String,
) -> Result<CallbackOutcome, RankError> {
    conn.immediate_transaction(|conn| {
        let Some(keyword) = load_keyword(conn, keyword_id)? else {
            return Ok(CallbackOutcome::Missing);
        };
        if keyword.answered_at.is_some() {
            return Ok(CallbackOutcome::AlreadyAnswered);
        }
        if keyword.requested_at.is_some() {
            diesel::update(keywords::table.find(keyword_id))
                .set(keywords::requested_at.eq(None::<NaiveDateTime>))
                .execute(conn)?;
            statistics::transfer(conn, StatKey::KeywordsPending, StatKey::KeywordsAvailable, 1)?;
        }
        Ok(CallbackOutcome::Reverted(reason))
    })
}

// --- messages -------------------------------------------------------------

pub fn render_markdown(source: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    let parser = Parser::new_ext(source, options);
    let mut out = String::with_capacity(source.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out
}

/// Applies a message response and completes its conversation when it was the last one.
///
/// `markdown` items store rendered HTML next to the raw text; `json` items
/// store the embedded object and revert when there is none.
pub fn on_message_result(
    conn: &mut SqliteConnection,
    raw: &str,
    message_id: i32,
) -> Result<CallbackOutcome, RankError> {
    let outcome = store_or_revert(
        conn,
        "message",
        message_id,
        |conn| store_message_answer(conn, message_id, raw),
        |conn, reason| revert_message(conn, message_id, reason),
    )?;
    if let CallbackOutcome::Reverted(reason) = &outcome {
        warn!(message_id, reason = %reason, "message returned to the pool");
    }
    Ok(outcome)
}

fn store_message_answer(
    conn: &mut SqliteConnection,
    message_id: i32,
    raw: &str,
) -> Result<CallbackOutcome, RankError> {
    conn.immediate_transaction(|conn| {
        let row: Option<(Message, Option<String>)> = messages::table
            .left_join(template_items::table)
            .filter(messages::id.eq(message_id))
            .select((Message::as_select(), template_items::mode.nullable()))
            .first(conn)
            .optional()?;
        let Some((message, mode)) = row else {
            return Ok(CallbackOutcome::Missing);
        };
        if message.answered_at.is_some() {
            return Ok(CallbackOutcome::AlreadyAnswered);
        }

        let answered_at = now();
        match mode.as_deref().map(RenderMode::from_column).unwrap_or_default() {
            RenderMode::Markdown => {
                diesel::update(messages::table.find(message_id))
                    .set((
                        messages::response.eq(Some(raw)),
                        messages::markdown_response.eq(Some(render_markdown(raw))),
                        messages::answered_at.eq(Some(answered_at)),
                    ))
                    .execute(conn)?;
            }
            RenderMode::Json => {
                let parsed = extract_json_object(raw).and_then(|json| {
                    serde_json::from_str::<Value>(json).map_err(ResponseError::from)
                });
                let value = match parsed {
                    Ok(value) => value,
                    Err(err) => {
                        diesel::update(messages::table.find(message_id))
                            .set(messages::requested_at.eq(None::<NaiveDateTime>))
                            .execute(conn)?;
                        return Ok(CallbackOutcome::Reverted(err.to_string()));
                    }
                };
                diesel::update(messages::table.find(message_id))
                    .set((
                        messages::response.eq(Some(raw)),
                        messages::json_response.eq(Some(value.to_string())),
                        messages::answered_at.eq(Some(answered_at)),
                    ))
                    .execute(conn)?;
            }
        }

        if complete_conversation(conn, message.conversation_id, answered_at)? {
            info!(
                conversation_id = message.conversation_id,
                "conversation answered"
            );
        }
        Ok(CallbackOutcome::Answered)
    })
}

/// Stamps the conversation answered when it has messages and none is unanswered.
fn complete_conversation(
    conn: &mut SqliteConnection,
    conversation_id: i32,
    answered_at: NaiveDateTime,
) -> Result<bool, RankError> {
    let total: i64 = messages::table
        .filter(messages::conversation_id.eq(conversation_id))
        .count()
        .get_result(conn)?;
    let unanswered: i64 = messages::table
        .filter(messages::conversation_id.eq(conversation_id))
        .filter(messages::answered_at.is_null())
        .count()
        .get_result(conn)?;
    if total == 0 || unanswered > 0 {
        return Ok(false);
    }
    let updated = diesel::update(
        conversations::table
            .find(conversation_id)
            .filter(conversations::answered_at.is_null()),
    )
    .set(conversations::answered_at.eq(Some(answered_at)))
    .execute(conn)?;
    Ok(updated > 0)
}

fn revert_message(
    conn: &mut SqliteConnection,
    message_id: i32,
    reason: String,
) -> Result<CallbackOutcome, RankError> {
    conn.immediate_transaction(|conn| {
        let answered: Option<Option<NaiveDateTime>> = messages::table
            .find(message_id)
            .select(messages::answered_at)
            .first(conn)
            .optional()?;
        match answered {
            None => Ok(CallbackOutcome::Missing),
            Some(Some(_)) => Ok(CallbackOutcome::AlreadyAnswered),
            Some(None) => {
                diesel::update(messages::table.find(message_id))
                    .set(messages::requested_at.eq(None::<NaiveDateTime>))
                    .execute(conn)?;
                Ok(CallbackOutcome::Reverted(reason))
            }
        }
    })
}

// --- business data --------------------------------------------------------

/// Business profile of a domain as returned by the model.
#[derive(Debug, Deserialize)]
pub struct BusinessProfile {
    pub business_name: String,
    #[serde(default)]
    pub naics_code: Value,
    #[serde(default)]
    pub brands: Vec<String>,
    #[serde(default)]
    pub products: Vec<String>,
    #[serde(default)]
    pub competitor_brands: Vec<String>,
    #[serde(default)]
    pub competitor_products: Vec<String>,
    #[serde(default)]
    pub competitors: Vec<String>,
}

impl BusinessProfile {
    /// Distinct brand names with every tag they were given.
    fn tagged_brands(&self) -> BTreeMap<String, Vec<BrandType>> {
        let mut tagged: BTreeMap<String, Vec<BrandType>> = BTreeMap::new();
        let lists = [
            (&self.brands, BrandType::Brand),
            (&self.products, BrandType::Product),
            (&self.competitor_brands, BrandType::CompetitorBrand),
            (&self.competitor_products, BrandType::CompetitorProduct),
        ];
        for (names, brand_type) in lists {
            for name in names {
                let name = name.trim();
                if name.is_empty() || name.eq_ignore_ascii_case("none") {
                    continue;
                }
                let tags = tagged.entry(name.to_string()).or_default();
                if !tags.contains(&brand_type) {
                    tags.push(brand_type);
                }
            }
        }
        tagged
    }
}

pub fn parse_business_response(raw: &str) -> Result<(BusinessProfile, Value), ResponseError> {
    parse_embedded(raw)
}

/// Applies a business-data response to a domain.
///
/// Brands are created as needed and tagged through `brand_domains`; listed
/// competitors are linked only when they are tracked domains. On failure
/// `business_requested_at` is cleared and `business_json` stays `NULL`.
pub fn on_business_result(
    conn: &mut SqliteConnection,
    raw: &str,
    domain_id: i32,
) -> Result<CallbackOutcome, RankError> {
    let outcome = match parse_business_response(raw) {
        Ok(parsed) => store_or_revert(
            conn,
            "domain",
            domain_id,
            |conn| store_business_profile(conn, domain_id, &parsed),
            |conn, reason| revert_business(conn, domain_id, reason),
        )?,
        Err(err) => revert_business(conn, domain_id, err.to_string())?,
    };
    if let CallbackOutcome::Reverted(reason) = &outcome {
        warn!(domain_id, reason = %reason, "business data rejected");
    }
    Ok(outcome)
}

fn store_business_profile(
    conn: &mut SqliteConnection,
    domain_id: i32,
    (profile, raw_json): &(BusinessProfile, Value),
) -> Result<CallbackOutcome, RankError> {
    conn.immediate_transaction(|conn| {
        let domain: Option<Domain> = domains::table
            .find(domain_id)
            .select(Domain::as_select())
            .first(conn)
            .optional()?;
        let Some(domain) = domain else {
            return Ok(CallbackOutcome::Missing);
        };
        if domain.business_json.is_some() {
            return Ok(CallbackOutcome::AlreadyAnswered);
        }

        let now = now();
        diesel::update(domains::table.find(domain_id))
            .set((
                domains::business_json.eq(Some(raw_json.to_string())),
                domains::business_name.eq(Some(profile.business_name.trim())),
                domains::naics_code.eq(text(&profile.naics_code)),
                domains::business_enriched_at.eq(Some(now)),
            ))
            .execute(conn)?;

        let tagged = profile.tagged_brands();
        let brand_links = link_brands(conn, domain_id, &tagged, now)?;
        let competitor_links = link_competitors(conn, &domain, &profile.competitors, now)?;

        info!(
            domain_id,
            domain = %domain.domain,
            brands = tagged.len(),
            brand_links,
            competitor_links,
            "business data stored"
        );
        Ok(CallbackOutcome::Answered)
    })
}

fn link_brands(
    conn: &mut SqliteConnection,
    domain_id: i32,
    tagged: &BTreeMap<String, Vec<BrandType>>,
    now: NaiveDateTime,
) -> Result<usize, RankError> {
    if tagged.is_empty() {
        return Ok(0);
    }
    let new_brands: Vec<NewBrand> = tagged
        .keys()
        .map(|brand| NewBrand {
            brand: brand.clone(),
            created_at: now,
        })
        .collect();
    for chunk in new_brands.chunks(rows_per_statement(2)) {
        diesel::insert_or_ignore_into(brands::table)
            .values(chunk)
            .execute(conn)?;
    }

    let names: Vec<&String> = tagged.keys().collect();
    let mut links = Vec::new();
    for chunk in names.chunks(rows_per_statement(1)) {
        let ids: Vec<(i32, String)> = brands::table
            .filter(brands::brand.eq_any(chunk))
            .select((brands::id, brands::brand))
            .load(conn)?;
        for (brand_id, brand) in ids {
            for brand_type in tagged.get(&brand).into_iter().flatten() {
                links.push(NewBrandDomain {
                    brand_id,
                    domain_id,
                    brand_type: brand_type.as_str().to_string(),
                });
            }
        }
    }

    let mut linked = 0;
    for chunk in links.chunks(rows_per_statement(3)) {
        linked += diesel::insert_or_ignore_into(brand_domains::table)
            .values(chunk)
            .execute(conn)?;
    }
    Ok(linked)
}

fn link_competitors(
    conn: &mut SqliteConnection,
    domain: &Domain,
    competitors: &[String],
    now: NaiveDateTime,
) -> Result<usize, RankError> {
    let names: Vec<String> = competitors
        .iter()
        .filter_map(|name| normalize_domain(name))
        .filter(|name| name != &domain.domain)
        .collect();
    if names.is_empty() {
        return Ok(0);
    }

    let mut linked = 0;
    for chunk in names.chunks(rows_per_statement(1)) {
        let ids: Vec<i32> = domains::table
            .filter(domains::domain.eq_any(chunk))
            .select(domains::id)
            .load(conn)?;
        let rows: Vec<NewDomainCompetitor> = ids
            .into_iter()
            .map(|competitor_id| NewDomainCompetitor {
                domain_id: domain.id,
                competitor_id,
                created_at: now,
                updated_at: now,
            })
            .collect();
        for rows in rows.chunks(rows_per_statement(4)) {
            linked += diesel::insert_or_ignore_into(domain_competitors::table)
                .values(rows)
                .execute(conn)?;
        }
    }
    Ok(linked)
}

fn revert_business(
    conn: &mut SqliteConnection,
    domain_id: i32,
    reason: String,
) -> Result<CallbackOutcome, RankError> {
    conn.immediate_transaction(|conn| {
        let business_json: Option<Option<String>> = domains::table
            .find(domain_id)
            .select(domains::business_json)
            .first(conn)
            .optional()?;
        match business_json {
            None => Ok(CallbackOutcome::Missing),
            Some(Some(_)) => Ok(CallbackOutcome::AlreadyAnswered),
            Some(None) => {
                diesel::update(domains::table.find(domain_id))
                    .set(domains::business_requested_at.eq(None::<NaiveDateTime>))
                    .execute(conn)?;
                Ok(CallbackOutcome::Reverted(reason))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PromptSet, QueuePolicy};
    use crate::db::testing::test_db;
    use crate::ingest::{import_domains, import_keywords};
    use crate::models::{NewConversation, NewMessage};
    use crate::refill::refill;
    use crate::schema::brand_keywords;
    use crate::template::{TemplateDefinition, install_template, parse_template};

    const ROUND_TRIP: &str = r#"Sure! {"user_intent": "buy shoes", "natural_language_question": "What are the best running shoes?", "ai_answer": "...", "likely_previous_queries": ["running gear"], "likely_next_queries": ["shoe reviews"]}"#;

    fn keyword(conn: &mut SqliteConnection, text: &str) -> Keyword {
        keywords::table
            .filter(keywords::keyword.eq(text))
            .select(Keyword::as_select())
            .first(conn)
            .unwrap()
    }

    /// Imports and refills `texts`, leaving every keyword pending.
    fn pending_keywords(conn: &mut SqliteConnection, texts: &[&str]) {
        import_keywords(conn, texts.iter().copied()).unwrap();
        refill(conn, &QueuePolicy::development(), &PromptSet::default()).unwrap();
    }

    #[test]
    fn extracts_the_outermost_object() {
        assert_eq!(extract_json_object(r#"x {"a": {"b": 1}} y"#).unwrap(), r#"{"a": {"b": 1}}"#);
        assert!(matches!(
            extract_json_object("no braces here"),
            Err(ResponseError::NoJsonObject)
        ));
        assert!(matches!(
            extract_json_object("} backwards {"),
            Err(ResponseError::NoJsonObject)
        ));
    }

    #[test]
    fn keyword_round_trip() {
        let test = test_db();
        let mut conn = test.conn();
        pending_keywords(&mut conn, &["best running shoes"]);
        let before = statistics::snapshot(&mut conn).unwrap();
        let id = keyword(&mut conn, "best running shoes").id;

        let outcome = on_keyword_result(&mut conn, ROUND_TRIP, id).unwrap();
        assert_eq!(outcome, CallbackOutcome::Answered);

        let stored = keyword(&mut conn, "best running shoes");
        assert_eq!(stored.user_intent.as_deref(), Some("buy shoes"));
        assert_eq!(
            stored.natural_language_question.as_deref(),
            Some("What are the best running shoes?")
        );
        assert_eq!(stored.likely_next_queries.as_deref(), Some(r#"["shoe reviews"]"#));
        assert!(stored.answered_at.is_some());
        assert!(stored.json_response.is_some());

        let after = statistics::snapshot(&mut conn).unwrap();
        assert_eq!(after.answered, before.answered + 1);
        assert_eq!(after.pending, before.pending - 1);
        assert!(after.is_consistent());
    }

    #[test]
    fn keyword_callback_is_idempotent() {
        let test = test_db();
        let mut conn = test.conn();
        pending_keywords(&mut conn, &["best running shoes"]);
        let id = keyword(&mut conn, "best running shoes").id;

        on_keyword_result(&mut conn, ROUND_TRIP, id).unwrap();
        let once = keyword(&mut conn, "best running shoes");
        let stats_once = statistics::snapshot(&mut conn).unwrap();

        let again = on_keyword_result(&mut conn, ROUND_TRIP, id).unwrap();
        assert_eq!(again, CallbackOutcome::AlreadyAnswered);
        assert_eq!(keyword(&mut conn, "best running shoes"), once);
        assert_eq!(statistics::snapshot(&mut conn).unwrap(), stats_once);

        // A malformed late duplicate does not un-answer it either.
        let late = on_keyword_result(&mut conn, "garbage", id).unwrap();
        assert_eq!(late, CallbackOutcome::AlreadyAnswered);
        assert_eq!(keyword(&mut conn, "best running shoes"), once);
    }

    #[test]
    fn malformed_response_reverts_the_keyword() {
        let test = test_db();
        let mut conn = test.conn();
        pending_keywords(&mut conn, &["socks"]);
        let id = keyword(&mut conn, "socks").id;

        let outcome = on_keyword_result(&mut conn, "I cannot help with that.", id).unwrap();
        assert!(matches!(outcome, CallbackOutcome::Reverted(_)));

        let stored = keyword(&mut conn, "socks");
        assert!(stored.requested_at.is_none());
        assert!(stored.answered_at.is_none());

        let stats = statistics::snapshot(&mut conn).unwrap();
        assert_eq!((stats.available, stats.pending, stats.answered), (1, 0, 0));
    }

    #[test]
    fn missing_key_reverts_the_keyword() {
        let test = test_db();
        let mut conn = test.conn();
        pending_keywords(&mut conn, &["socks"]);
        let id = keyword(&mut conn, "socks").id;

        let raw = r#"{"user_intent": "buy", "ai_answer": "wool"}"#;
        let outcome = on_keyword_result(&mut conn, raw, id).unwrap();
        assert!(matches!(outcome, CallbackOutcome::Reverted(reason) if reason.contains("missing field")));
        let stored = keyword(&mut conn, "socks");
        assert!(stored.requested_at.is_none());
        assert!(stored.user_intent.is_none());
    }

    #[test]
    fn late_answer_after_reset_counts_from_available() {
        let test = test_db();
        let mut conn = test.conn();
        import_keywords(&mut conn, ["socks"]).unwrap();
        let id = keyword(&mut conn, "socks").id;

        // Never requested (or reset since): still answered, taken from available.
        let outcome = on_keyword_result(&mut conn, ROUND_TRIP, id).unwrap();
        assert_eq!(outcome, CallbackOutcome::Answered);
        let stats = statistics::snapshot(&mut conn).unwrap();
        assert_eq!((stats.available, stats.pending, stats.answered), (0, 0, 1));
        assert!(stats.is_consistent());
    }

    #[test]
    fn missing_keyword_is_reported() {
        let test = test_db();
        let mut conn = test.conn();
        assert_eq!(
            on_keyword_result(&mut conn, ROUND_TRIP, 999).unwrap(),
            CallbackOutcome::Missing
        );
    }

    struct ConversationFixture {
        conversation_id: i32,
        message_ids: Vec<i32>,
    }

    fn conversation(conn: &mut SqliteConnection, definition: &TemplateDefinition) -> ConversationFixture {
        let template_id = install_template(conn, definition, None).unwrap();
        import_domains(conn, ["a.com"]).unwrap();
        let domain_id: i32 = domains::table.select(domains::id).first(conn).unwrap();
        let ai_model_id = crate::template::ensure_ai_model(conn, "test", "gpt-test").unwrap();
        let conversation_id = diesel::insert_into(conversations::table)
            .values(&NewConversation {
                template_id,
                domain_id,
                project_id: None,
                ai_model_id,
                created_at: now(),
            })
            .returning(conversations::id)
            .get_result::<i32>(conn)
            .unwrap();

        let items: Vec<(i32, String, i32)> = template_items::table
            .filter(template_items::template_id.eq(template_id))
            .order(template_items::sort_order)
            .select((template_items::id, template_items::prompt, template_items::sort_order))
            .load(conn)
            .unwrap();
        let rows: Vec<NewMessage> = items
            .into_iter()
            .map(|(item_id, prompt, sort_order)| NewMessage {
                conversation_id,
                template_item_id: Some(item_id),
                title: None,
                prompt,
                visible: true,
                sort_order,
            })
            .collect();
        diesel::insert_into(messages::table).values(&rows).execute(conn).unwrap();
        let message_ids = messages::table
            .filter(messages::conversation_id.eq(conversation_id))
            .order(messages::sort_order)
            .select(messages::id)
            .load(conn)
            .unwrap();
        ConversationFixture {
            conversation_id,
            message_ids,
        }
    }

    fn message(conn: &mut SqliteConnection, id: i32) -> Message {
        messages::table
            .find(id)
            .select(Message::as_select())
            .first(conn)
            .unwrap()
    }

    fn conversation_answered(conn: &mut SqliteConnection, id: i32) -> bool {
        conversations::table
            .find(id)
            .select(conversations::answered_at)
            .first::<Option<NaiveDateTime>>(conn)
            .unwrap()
            .is_some()
    }

    #[test]
    fn markdown_messages_complete_the_conversation() {
        let test = test_db();
        let mut conn = test.conn();
        let definition = parse_template(
            r#"
name: Research
items:
  - prompt: "SWOT for @currentDomain"
    order: 1
  - prompt: "Personas for @currentDomain"
    order: 2
"#,
        )
        .unwrap();
        let fixture = conversation(&mut conn, &definition);

        let table = "| S | W |\n|---|---|\n| brand | price |\n";
        let outcome = on_message_result(&mut conn, table, fixture.message_ids[0]).unwrap();
        assert_eq!(outcome, CallbackOutcome::Answered);
        let first = message(&mut conn, fixture.message_ids[0]);
        assert_eq!(first.response.as_deref(), Some(table));
        assert!(first.markdown_response.unwrap().contains("<table>"));
        assert!(!conversation_answered(&mut conn, fixture.conversation_id));

        on_message_result(&mut conn, "**done**", fixture.message_ids[1]).unwrap();
        assert!(conversation_answered(&mut conn, fixture.conversation_id));

        assert_eq!(
            on_message_result(&mut conn, "again", fixture.message_ids[1]).unwrap(),
            CallbackOutcome::AlreadyAnswered
        );
    }

    #[test]
    fn hidden_unanswered_message_keeps_the_conversation_open() {
        let test = test_db();
        let mut conn = test.conn();
        let definition = parse_template(
            "name: T\nitems:\n  - prompt: shown\n    order: 1\n  - prompt: hidden\n    visible: false\n    order: 2\n",
        )
        .unwrap();
        let fixture = conversation(&mut conn, &definition);
        diesel::update(messages::table.find(fixture.message_ids[1]))
            .set(messages::visible.eq(false))
            .execute(&mut conn)
            .unwrap();

        on_message_result(&mut conn, "visible answer", fixture.message_ids[0]).unwrap();
        assert!(!conversation_answered(&mut conn, fixture.conversation_id));

        on_message_result(&mut conn, "hidden answer", fixture.message_ids[1]).unwrap();
        assert!(conversation_answered(&mut conn, fixture.conversation_id));
    }

    #[test]
    fn json_message_without_object_is_reverted() {
        let test = test_db();
        let mut conn = test.conn();
        let definition = parse_template(
            r#"
name: Brands
items:
  - prompt: "Brands of @currentDomain as JSON"
    mode: json
    order: 1
"#,
        )
        .unwrap();
        let fixture = conversation(&mut conn, &definition);
        let id = fixture.message_ids[0];
        diesel::update(messages::table.find(id))
            .set(messages::requested_at.eq(Some(now())))
            .execute(&mut conn)
            .unwrap();

        let outcome = on_message_result(&mut conn, "no json today", id).unwrap();
        assert!(matches!(outcome, CallbackOutcome::Reverted(_)));
        let reverted = message(&mut conn, id);
        assert!(reverted.requested_at.is_none());
        assert!(reverted.answered_at.is_none());
        assert!(!conversation_answered(&mut conn, fixture.conversation_id));

        let outcome = on_message_result(&mut conn, r#"Here: {"brands": ["Acme"]}"#, id).unwrap();
        assert_eq!(outcome, CallbackOutcome::Answered);
        assert_eq!(
            message(&mut conn, id).json_response.as_deref(),
            Some(r#"{"brands":["Acme"]}"#)
        );
        assert!(conversation_answered(&mut conn, fixture.conversation_id));
    }

    #[test]
    fn message_without_template_item_renders_markdown() {
        let test = test_db();
        let mut conn = test.conn();
        let definition = parse_template("name: T\nitems:\n  - prompt: p\n    order: 1\n").unwrap();
        let fixture = conversation(&mut conn, &definition);
        diesel::delete(template_items::table).execute(&mut conn).unwrap();

        let outcome = on_message_result(&mut conn, "# Title", fixture.message_ids[0]).unwrap();
        assert_eq!(outcome, CallbackOutcome::Answered);
        let stored = message(&mut conn, fixture.message_ids[0]);
        assert_eq!(stored.markdown_response.as_deref(), Some("<h1>Title</h1>\n"));
    }

    fn domain(conn: &mut SqliteConnection, name: &str) -> Domain {
        domains::table
            .filter(domains::domain.eq(name))
            .select(Domain::as_select())
            .first(conn)
            .unwrap()
    }

    #[test]
    fn business_profile_links_brands_and_competitors() {
        let test = test_db();
        let mut conn = test.conn();
        import_domains(&mut conn, ["shoes.com", "rival.com"]).unwrap();
        let target = domain(&mut conn, "shoes.com");

        let raw = r#"Profile follows:
{"business_name": "Shoes Inc", "naics_code": 448210,
 "brands": ["Stride", " Stride "], "products": ["Stride", "Trail Pro"],
 "competitor_brands": ["Rival"], "competitor_products": [],
 "competitors": ["https://www.rival.com/", "untracked.com", "shoes.com"]}"#;
        let outcome = on_business_result(&mut conn, raw, target.id).unwrap();
        assert_eq!(outcome, CallbackOutcome::Answered);

        let stored = domain(&mut conn, "shoes.com");
        assert_eq!(stored.business_name.as_deref(), Some("Shoes Inc"));
        assert_eq!(stored.naics_code.as_deref(), Some("448210"));
        assert!(stored.business_json.is_some());
        assert!(stored.business_enriched_at.is_some());

        let brand_names: Vec<String> = brands::table
            .order(brands::brand)
            .select(brands::brand)
            .load(&mut conn)
            .unwrap();
        assert_eq!(brand_names, vec!["Rival", "Stride", "Trail Pro"]);

        let tags: Vec<String> = brand_domains::table
            .inner_join(brands::table)
            .filter(brands::brand.eq("Stride"))
            .order(brand_domains::brand_type)
            .select(brand_domains::brand_type)
            .load(&mut conn)
            .unwrap();
        assert_eq!(tags, vec!["brand", "product"]);

        let rival = domain(&mut conn, "rival.com");
        let competitors: Vec<i32> = domain_competitors::table
            .filter(domain_competitors::domain_id.eq(target.id))
            .select(domain_competitors::competitor_id)
            .load(&mut conn)
            .unwrap();
        assert_eq!(competitors, vec![rival.id]);

        // Nothing is indexed against keywords yet.
        let indexed: i64 = brand_keywords::table.count().get_result(&mut conn).unwrap();
        assert_eq!(indexed, 0);
    }

    #[test]
    fn invalid_business_profile_clears_the_request() {
        let test = test_db();
        let mut conn = test.conn();
        import_domains(&mut conn, ["shoes.com"]).unwrap();
        let target = domain(&mut conn, "shoes.com");
        diesel::update(domains::table.find(target.id))
            .set((
                domains::business_requested_at.eq(Some(now())),
                domains::business_attempts.eq(1),
            ))
            .execute(&mut conn)
            .unwrap();

        let outcome = on_business_result(&mut conn, r#"{"naics_code": "448210"}"#, target.id).unwrap();
        assert!(matches!(outcome, CallbackOutcome::Reverted(_)));

        let stored = domain(&mut conn, "shoes.com");
        assert!(stored.business_requested_at.is_none());
        assert!(stored.business_json.is_none());
        assert_eq!(stored.business_attempts, 1);
    }

    #[test]
    fn outcome_maps_to_result_status() {
        assert_eq!(CallbackOutcome::Answered.result_status(), ResultStatus::Succeeded);
        assert_eq!(
            CallbackOutcome::Reverted("bad".into()).result_status(),
            ResultStatus::Reverted
        );
        assert_eq!(CallbackOutcome::Missing.detail().as_deref(), Some("record missing"));
    }
}
