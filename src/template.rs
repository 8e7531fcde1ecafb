//! # Template catalogue
//!
//! Templates are reusable, ordered prompt sets. Each item's prompt may contain
//! placeholder tokens that the builder replaces when it materializes messages:
//!
//! - [`CURRENT_DOMAIN_TOKEN`] (`@currentDomain`) becomes the domain name,
//! - [`CURRENT_KEYWORD_TOKEN`] (`@currentKeyword`) becomes the keyword text.
//!
//! Definitions are small YAML documents:
//!
//! ```yaml
//! name: "Market Research"
//! scope: per_domain
//! items:
//!   - title: "SWOT Analysis"
//!     prompt: "Conduct a SWOT analysis for @currentDomain and present results in a table"
//!     order: 1
//!   - prompt: "List the brands sold by @currentDomain as a JSON object"
//!     mode: json
//!     visible: false
//!     order: 2
//! ```
//!
//! Two definitions ship with the crate and are installed by
//! [`seed_default_templates`] on a fresh database.
//!
//! ## Installing a template
//!
//! ```no_run
//! use topranks::template::{install_template, load_template};
//!
//! # fn demo(conn: &mut diesel::SqliteConnection) -> Result<(), topranks::error::RankError> {
//! let definition = load_template("templates/market_research.yaml")?;
//! let template_id = install_template(conn, &definition, None)?;
//! println!("installed template {template_id}");
//! # Ok(()) }
//! ```

use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use tracing::{info, warn};

use crate::error::RankError;
use crate::models::{NewAiModel, NewTemplate, NewTemplateItem, RenderMode, TemplateScope};
use crate::schema::{ai_models, template_items, templates};

pub const CURRENT_DOMAIN_TOKEN: &str = "@currentDomain";
pub const CURRENT_KEYWORD_TOKEN: &str = "@currentKeyword";

/// Keyword intent prompt. The response is expected to embed one JSON object.
pub const KEYWORD_PROMPT: &str = "If a user searches for @currentKeyword, what is their user intent, how would you rephrase this as a natural language question, please answer the natural language question, what was their likely previous query, and what could be their next query? Provide your response as a simple JSON object, with keys \"user_intent\", \"natural_language_question\", \"ai_answer\", \"likely_previous_queries\", and \"likely_next_queries\". If this is likely to be their first or last query in their journey, answer \"none\" in the field";

/// Business profile prompt for a domain.
pub const BUSINESS_PROMPT: &str = "Describe the business behind the website @currentDomain. Provide your response as a simple JSON object, with keys \"business_name\", \"naics_code\", \"brands\", \"products\", \"competitor_brands\", \"competitor_products\", and \"competitors\". \"naics_code\" is the most specific NAICS code that fits the business. Every other key except \"business_name\" holds a list of strings; \"competitors\" lists the website domains of competing businesses. Use an empty list when you do not know";

/// Name and provider identifier of the AI model row created on a fresh database.
pub const DEFAULT_AI_MODEL: (&str, &str) = ("GPT-3.5 Turbo", "gpt-3.5-turbo");

/// Built-in definitions as `(file name, YAML)`; `init` also writes them to the config directory.
pub const BUILTIN_TEMPLATES: [(&str, &str); 2] = [
    (
        "market_research.yaml",
        include_str!("../templates/market_research.yaml"),
    ),
    (
        "competitive_analysis.yaml",
        include_str!("../templates/competitive_analysis.yaml"),
    ),
];

/// A template as written in YAML.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TemplateDefinition {
    pub name: String,
    #[serde(default)]
    pub scope: TemplateScope,
    pub items: Vec<ItemDefinition>,
}

/// One prompt inside a [`TemplateDefinition`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ItemDefinition {
    #[serde(default)]
    pub title: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub mode: RenderMode,
    #[serde(default = "default_visible")]
    pub visible: bool,
    pub order: i32,
}

fn default_visible() -> bool {
    true
}

/// Replaces every occurrence of `token` in `text` with `value`.
pub fn substitute(text: &str, token: &str, value: &str) -> String {
    text.replace(token, value)
}

pub fn parse_template(yaml: &str) -> Result<TemplateDefinition, RankError> {
    let definition: TemplateDefinition = serde_yaml::from_str(yaml)?;
    if definition.items.is_empty() {
        return Err(RankError::InvalidInput(format!(
            "template `{}` has no items",
            definition.name
        )));
    }
    Ok(definition)
}

/// Reads a template definition from a YAML file.
pub fn load_template(path: impl AsRef<Path>) -> Result<TemplateDefinition, RankError> {
    let path = path.as_ref();
    info!("Loading template: {}", path.display());
    let content = fs::read_to_string(path)?;
    parse_template(&content)
}

/// Stores a definition and its items, returning the new template id.
///
/// A template with the same name already owned by `project_id` is rejected by
/// the unique index and surfaces as a database error.
pub fn install_template(
    conn: &mut SqliteConnection,
    definition: &TemplateDefinition,
    project_id: Option<i32>,
) -> Result<i32, RankError> {
    conn.transaction(|conn| {
        let template_id = diesel::insert_into(templates::table)
            .values(&NewTemplate {
                name: definition.name.clone(),
                scope: definition.scope.as_str().to_string(),
                project_id,
                created_at: Utc::now().naive_utc(),
            })
            .returning(templates::id)
            .get_result::<i32>(conn)?;

        let items: Vec<NewTemplateItem> = definition
            .items
            .iter()
            .map(|item| NewTemplateItem {
                template_id,
                title: item.title.clone(),
                prompt: item.prompt.clone(),
                mode: item.mode.as_str().to_string(),
                visible: item.visible,
                sort_order: item.order,
            })
            .collect();
        diesel::insert_into(template_items::table)
            .values(&items)
            .execute(conn)?;

        info!(
            template_id,
            name = %definition.name,
            items = items.len(),
            "template installed"
        );
        Ok(template_id)
    })
}

/// Returns the id of the AI model named `name`, creating it if needed.
pub fn ensure_ai_model(
    conn: &mut SqliteConnection,
    name: &str,
    model: &str,
) -> Result<i32, RankError> {
    diesel::insert_or_ignore_into(ai_models::table)
        .values(&NewAiModel {
            name: name.to_string(),
            model: model.to_string(),
        })
        .execute(conn)?;
    let id = ai_models::table
        .filter(ai_models::name.eq(name))
        .select(ai_models::id)
        .first::<i32>(conn)?;
    Ok(id)
}

/// Installs the built-in templates and the default AI model on an empty catalogue.
///
/// Returns the number of templates installed; `0` when any template already exists.
pub fn seed_default_templates(conn: &mut SqliteConnection) -> Result<usize, RankError> {
    ensure_ai_model(conn, DEFAULT_AI_MODEL.0, DEFAULT_AI_MODEL.1)?;

    let existing: i64 = templates::table.count().get_result(conn)?;
    if existing > 0 {
        warn!(
            existing,
            "templates already exist, skipping built-in template seed"
        );
        return Ok(0);
    }

    let mut installed = 0;
    for (_, yaml) in BUILTIN_TEMPLATES {
        let definition = parse_template(yaml)?;
        install_template(conn, &definition, None)?;
        installed += 1;
    }
    Ok(installed)
}
