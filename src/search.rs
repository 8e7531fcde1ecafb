//! Full-text search over keyword answers, and brand-to-keyword indexing.
//!
//! `keywords_fts` is an FTS5 external-content table over `keywords.ai_answer`,
//! kept current by triggers in the schema. User text never reaches `MATCH`
//! verbatim: it is split into word tokens and each token is quoted, so FTS5
//! operators in the input are treated as plain words.

use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Double, Integer, Nullable, Text};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::db::rows_per_statement;
use crate::error::RankError;
use crate::models::{Brand, NewBrandKeyword};
use crate::schema::{brand_keywords, brands};

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("word pattern is a valid regex"));

const SEARCH_SQL: &str = "SELECT k.id, k.keyword, k.ai_answer, bm25(keywords_fts) AS score \
     FROM keywords_fts JOIN keywords k ON k.id = keywords_fts.rowid \
     WHERE keywords_fts MATCH ? \
     ORDER BY score, k.id \
     LIMIT ?";

const MATCHING_IDS_SQL: &str = "SELECT rowid AS id FROM keywords_fts WHERE keywords_fts MATCH ?";

/// A keyword whose answer matched a search, best match first.
#[derive(QueryableByName, Debug, Clone, PartialEq, Serialize)]
pub struct KeywordHit {
    #[diesel(sql_type = Integer)]
    pub id: i32,
    #[diesel(sql_type = Text)]
    pub keyword: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub ai_answer: Option<String>,
    /// `bm25` rank; lower is better.
    #[diesel(sql_type = Double)]
    pub score: f64,
}

#[derive(QueryableByName)]
struct MatchedId {
    #[diesel(sql_type = Integer)]
    id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BrandIndexReport {
    pub brands: usize,
    pub links: usize,
}

fn quote(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

/// Builds an FTS5 query requiring every word of `query`; `None` if it has no words.
pub fn match_all_words(query: &str) -> Option<String> {
    let terms: Vec<String> = WORD.find_iter(query).map(|m| quote(m.as_str())).collect();
    (!terms.is_empty()).then(|| terms.join(" "))
}

/// Builds an FTS5 phrase query for `phrase`; `None` if it has no words.
pub fn match_phrase(phrase: &str) -> Option<String> {
    let words: Vec<&str> = WORD.find_iter(phrase).map(|m| m.as_str()).collect();
    (!words.is_empty()).then(|| quote(&words.join(" ")))
}

/// Ranked search over answered keywords.
pub fn search_keywords(
    conn: &mut SqliteConnection,
    query: &str,
    limit: i64,
) -> Result<Vec<KeywordHit>, RankError> {
    let Some(expression) = match_all_words(query) else {
        return Ok(Vec::new());
    };
    debug!(%expression, limit, "searching keywords");
    let hits = diesel::sql_query(SEARCH_SQL)
        .bind::<Text, _>(expression)
        .bind::<BigInt, _>(limit.max(0))
        .load::<KeywordHit>(conn)?;
    Ok(hits)
}

/// Links up to `batch` unindexed brands to the keywords whose answers mention them.
///
/// Each brand is stamped `keyword_indexed_at` in the same transaction as its
/// links, so a brand is indexed once; brands with no searchable words are
/// stamped without links. A brand stamped by a concurrent pass is skipped.
pub fn index_brands(conn: &mut SqliteConnection, batch: i64) -> Result<BrandIndexReport, RankError> {
    let pending: Vec<Brand> = brands::table
        .filter(brands::keyword_indexed_at.is_null())
        .order(brands::id)
        .limit(batch.max(0))
        .select(Brand::as_select())
        .load(conn)?;

    let mut report = BrandIndexReport::default();
    for brand in pending {
        let links = conn.immediate_transaction(|conn| {
            let indexed: Option<NaiveDateTime> = brands::table
                .find(brand.id)
                .select(brands::keyword_indexed_at)
                .first(conn)?;
            if indexed.is_some() {
                return Ok::<_, RankError>(None);
            }
            let mut links = 0;
            if let Some(phrase) = match_phrase(&brand.brand) {
                let rows: Vec<NewBrandKeyword> = diesel::sql_query(MATCHING_IDS_SQL)
                    .bind::<Text, _>(phrase)
                    .load::<MatchedId>(conn)?
                    .into_iter()
                    .map(|m| NewBrandKeyword {
                        brand_id: brand.id,
                        keyword_id: m.id,
                    })
                    .collect();
                for chunk in rows.chunks(rows_per_statement(2)) {
                    links += diesel::insert_or_ignore_into(brand_keywords::table)
                        .values(chunk)
                        .execute(conn)?;
                }
            }
            diesel::update(brands::table.find(brand.id))
                .set(brands::keyword_indexed_at.eq(Some(Utc::now().naive_utc())))
                .execute(conn)?;
            Ok(Some(links))
        })?;
        let Some(links) = links else {
            debug!(brand_id = brand.id, "brand indexed elsewhere, skipping");
            continue;
        };
        debug!(brand_id = brand.id, brand = %brand.brand, links, "brand indexed");
        report.brands += 1;
        report.links += links;
    }

    info!(brands = report.brands, links = report.links, "brands indexed");
    Ok(report)
}
