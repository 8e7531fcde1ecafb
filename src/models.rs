//! # Database models
//!
//! Data structures that map to the SQLite schema via **Diesel**.
//!
//! Row types (`Domain`, `Keyword`, `Conversation`, ...) derive `Queryable` +
//! `Selectable` and are always loaded with `X::as_select()`. Insert types
//! (`NewDomain`, `NewKeyword`, ...) carry no primary key and treat `None` as
//! SQL `NULL`, which keeps them usable in multi-row `VALUES` batches on SQLite.
//!
//! ## Basic usage
//!
//! ```no_run
//! use diesel::prelude::*;
//! use topranks::models::{Keyword, NewKeyword};
//! use topranks::schema::keywords;
//!
//! # fn demo(conn: &mut SqliteConnection) -> Result<(), Box<dyn std::error::Error>> {
//! let now = chrono::Utc::now().naive_utc();
//! diesel::insert_or_ignore_into(keywords::table)
//!     .values(&vec![NewKeyword { keyword: "best running shoes".into(), created_at: now }])
//!     .execute(conn)?;
//!
//! let pending: Vec<Keyword> = keywords::table
//!     .filter(keywords::requested_at.is_not_null())
//!     .filter(keywords::answered_at.is_null())
//!     .select(Keyword::as_select())
//!     .load(conn)?;
//! # Ok(()) }
//! ```

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::RankError;

/// A tracked website.
///
/// `business_attempts` counts dispatched business-data requests; `business_json`
/// stays `NULL` until a response parses successfully.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::domains)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Domain {
    pub id: i32,
    /// Registrable domain name, unique.
    pub domain: String,
    pub rank: Option<i32>,
    pub keyword_count: Option<i64>,
    pub traffic: Option<i64>,
    pub cost: Option<f64>,
    pub adult_content: bool,
    pub business_json: Option<String>,
    pub business_name: Option<String>,
    pub naics_code: Option<String>,
    pub business_attempts: i32,
    pub business_requested_at: Option<NaiveDateTime>,
    pub business_enriched_at: Option<NaiveDateTime>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::domains)]
#[diesel(treat_none_as_default_value = false)]
pub struct NewDomain {
    pub domain: String,
    pub rank: Option<i32>,
    pub keyword_count: Option<i64>,
    pub traffic: Option<i64>,
    pub cost: Option<f64>,
    pub adult_content: bool,
}

/// Self-referential competitor link between two domains.
#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::domain_competitors)]
pub struct NewDomainCompetitor {
    pub domain_id: i32,
    pub competitor_id: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// A search term enriched with LLM-derived intent metadata.
///
/// ### Queue state
/// - *available*: `requested_at` and `answered_at` are both `NULL`
/// - *pending*: `requested_at` set, `answered_at` `NULL`
/// - *answered*: `answered_at` set (a one-way latch)
///
/// `likely_previous_queries`, `likely_next_queries` and `json_response` hold
/// serialized JSON.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::keywords)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Keyword {
    pub id: i32,
    pub keyword: String,
    pub requested_at: Option<NaiveDateTime>,
    pub answered_at: Option<NaiveDateTime>,
    pub user_intent: Option<String>,
    pub natural_language_question: Option<String>,
    pub ai_answer: Option<String>,
    pub likely_previous_queries: Option<String>,
    pub likely_next_queries: Option<String>,
    pub json_response: Option<String>,
    pub created_at: NaiveDateTime,
}

impl Keyword {
    /// `true` while the keyword is submitted but not answered.
    pub fn is_pending(&self) -> bool {
        self.requested_at.is_some() && self.answered_at.is_none()
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::keywords)]
pub struct NewKeyword {
    pub keyword: String,
    pub created_at: NaiveDateTime,
}

/// A named counter row.
#[derive(Queryable, Selectable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::statistics)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Statistic {
    pub id: i32,
    pub key: String,
    pub value: i64,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::statistics)]
pub struct NewStatistic<'a> {
    pub key: &'a str,
    pub value: i64,
}

/// A tenant grouping a subset of domains.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::projects)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Project {
    pub id: i32,
    pub project: String,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::projects)]
pub struct NewProject {
    pub project: String,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::project_domains)]
pub struct NewProjectDomain {
    pub project_id: i32,
    pub domain_id: i32,
}

/// A language model that conversations can be answered with.
///
/// `model` is the identifier sent to the provider (e.g. `gpt-3.5-turbo`).
#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::ai_models)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct AiModel {
    pub id: i32,
    pub name: String,
    pub model: String,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::ai_models)]
pub struct NewAiModel {
    pub name: String,
    pub model: String,
}

/// Whether a template is expanded once per domain or stands alone.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TemplateScope {
    Global,
    #[default]
    PerDomain,
}

impl TemplateScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateScope::Global => "global",
            TemplateScope::PerDomain => "per_domain",
        }
    }

    pub fn parse(value: &str) -> Result<Self, RankError> {
        match value {
            "global" => Ok(TemplateScope::Global),
            "per_domain" => Ok(TemplateScope::PerDomain),
            other => Err(RankError::InvalidInput(format!(
                "unknown template scope: {other}"
            ))),
        }
    }
}

/// How a message response is post-processed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    #[default]
    Markdown,
    Json,
}

impl RenderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderMode::Markdown => "markdown",
            RenderMode::Json => "json",
        }
    }

    /// Unknown values fall back to markdown, which never rejects a response.
    pub fn from_column(value: &str) -> Self {
        match value {
            "json" => RenderMode::Json,
            _ => RenderMode::Markdown,
        }
    }
}

/// A reusable, ordered set of prompts.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::templates)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Template {
    pub id: i32,
    pub name: String,
    pub scope: String,
    pub project_id: Option<i32>,
    pub created_at: NaiveDateTime,
}

impl Template {
    pub fn scope(&self) -> Result<TemplateScope, RankError> {
        TemplateScope::parse(&self.scope)
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::templates)]
#[diesel(treat_none_as_default_value = false)]
pub struct NewTemplate {
    pub name: String,
    pub scope: String,
    pub project_id: Option<i32>,
    pub created_at: NaiveDateTime,
}

/// One prompt definition inside a [`Template`].
///
/// `prompt` may contain placeholder tokens such as `@currentDomain`.
#[derive(Queryable, Selectable, Identifiable, Associations, Debug, Clone, PartialEq)]
#[diesel(belongs_to(Template))]
#[diesel(table_name = crate::schema::template_items)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct TemplateItem {
    pub id: i32,
    pub template_id: i32,
    pub title: Option<String>,
    pub prompt: String,
    pub mode: String,
    pub visible: bool,
    pub sort_order: i32,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::template_items)]
#[diesel(treat_none_as_default_value = false)]
pub struct NewTemplateItem {
    pub template_id: i32,
    pub title: Option<String>,
    pub prompt: String,
    pub mode: String,
    pub visible: bool,
    pub sort_order: i32,
}

/// The materialized pairing of one template with one domain.
///
/// At most one row exists per `(template, domain, project, ai_model)`; the
/// schema enforces it with an expression unique index.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::conversations)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Conversation {
    pub id: i32,
    pub template_id: i32,
    pub domain_id: i32,
    pub project_id: Option<i32>,
    pub ai_model_id: i32,
    pub requested_at: Option<NaiveDateTime>,
    pub answered_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::conversations)]
#[diesel(treat_none_as_default_value = false)]
pub struct NewConversation {
    pub template_id: i32,
    pub domain_id: i32,
    pub project_id: Option<i32>,
    pub ai_model_id: i32,
    pub created_at: NaiveDateTime,
}

/// One materialized prompt within a [`Conversation`].
#[derive(Queryable, Selectable, Identifiable, Associations, Debug, Clone, PartialEq)]
#[diesel(belongs_to(Conversation))]
#[diesel(table_name = crate::schema::messages)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Message {
    pub id: i32,
    pub conversation_id: i32,
    pub template_item_id: Option<i32>,
    pub title: Option<String>,
    /// Prompt text with placeholders already substituted.
    pub prompt: String,
    pub visible: bool,
    /// Display order within the conversation; independent of completion order.
    pub sort_order: i32,
    pub requested_at: Option<NaiveDateTime>,
    pub answered_at: Option<NaiveDateTime>,
    pub response: Option<String>,
    pub markdown_response: Option<String>,
    pub json_response: Option<String>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::messages)]
#[diesel(treat_none_as_default_value = false)]
pub struct NewMessage {
    pub conversation_id: i32,
    pub template_item_id: Option<i32>,
    pub title: Option<String>,
    pub prompt: String,
    pub visible: bool,
    pub sort_order: i32,
}

/// A product or company brand seen during business-data enrichment.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::brands)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Brand {
    pub id: i32,
    pub brand: String,
    pub keyword_indexed_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::brands)]
pub struct NewBrand {
    pub brand: String,
    pub created_at: NaiveDateTime,
}

/// Tag carried by the brand ↔ domain join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrandType {
    Brand,
    Product,
    CompetitorBrand,
    CompetitorProduct,
}

impl BrandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrandType::Brand => "brand",
            BrandType::Product => "product",
            BrandType::CompetitorBrand => "competitor_brand",
            BrandType::CompetitorProduct => "competitor_product",
        }
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::brand_domains)]
pub struct NewBrandDomain {
    pub brand_id: i32,
    pub domain_id: i32,
    pub brand_type: String,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::brand_keywords)]
pub struct NewBrandKeyword {
    pub brand_id: i32,
    pub keyword_id: i32,
}

/// A queued or running unit of work in the broker table.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::tasks)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Task {
    pub id: i32,
    pub kind: String,
    pub target_id: i32,
    pub prompt: String,
    pub model: Option<String>,
    pub state: String,
    pub attempts: i32,
    pub available_at: NaiveDateTime,
    pub locked_by: Option<String>,
    pub locked_at: Option<NaiveDateTime>,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::tasks)]
#[diesel(treat_none_as_default_value = false)]
pub struct NewTask {
    pub kind: String,
    pub target_id: i32,
    pub prompt: String,
    pub model: Option<String>,
    pub state: String,
    pub attempts: i32,
    pub available_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

/// A finished task, as kept by the result backend.
#[derive(Queryable, Selectable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::task_results)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct TaskResult {
    pub id: i32,
    pub task_id: i32,
    pub kind: String,
    pub target_id: i32,
    pub status: String,
    pub detail: Option<String>,
    pub finished_at: NaiveDateTime,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::task_results)]
#[diesel(treat_none_as_default_value = false)]
pub struct NewTaskResult {
    pub task_id: i32,
    pub kind: String,
    pub target_id: i32,
    pub status: String,
    pub detail: Option<String>,
    pub finished_at: NaiveDateTime,
}
