//! # Statistic Store
//!
//! A keyed counter table used for dashboards and queue-depth decisions without
//! scanning the keyword table. The four keyword counters satisfy
//!
//! ```text
//! keywords_available + keywords_pending + keywords_answered == keywords_total
//! ```
//!
//! whenever no transaction is in flight.
//!
//! Every mutation is a single `UPDATE ... SET value = value + ? RETURNING value`
//! inside a transaction (a savepoint when nested), so concurrent callers
//! serialize on SQLite's write lock and no update is lost. Keys are seeded at
//! setup by [`seed`]; a missing key is reported as
//! [`RankError::MissingStatistic`] and never created lazily.

use diesel::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::RankError;
use crate::models::NewStatistic;
use crate::schema::{keywords, statistics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatKey {
    KeywordsTotal,
    KeywordsAvailable,
    KeywordsPending,
    KeywordsAnswered,
}

impl StatKey {
    pub const ALL: [StatKey; 4] = [
        StatKey::KeywordsTotal,
        StatKey::KeywordsAvailable,
        StatKey::KeywordsPending,
        StatKey::KeywordsAnswered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatKey::KeywordsTotal => "keywords_total",
            StatKey::KeywordsAvailable => "keywords_available",
            StatKey::KeywordsPending => "keywords_pending",
            StatKey::KeywordsAnswered => "keywords_answered",
        }
    }
}

/// Point-in-time read of the four keyword counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeywordStatistics {
    pub total: i64,
    pub available: i64,
    pub pending: i64,
    pub answered: i64,
}

impl KeywordStatistics {
    pub fn is_consistent(&self) -> bool {
        self.available + self.pending + self.answered == self.total
    }
}

pub fn get(conn: &mut SqliteConnection, key: StatKey) -> Result<i64, RankError> {
    statistics::table
        .filter(statistics::key.eq(key.as_str()))
        .select(statistics::value)
        .first::<i64>(conn)
        .optional()?
        .ok_or_else(|| RankError::MissingStatistic(key.as_str().to_string()))
}

/// Adds `delta` (possibly negative) and returns the new value.
pub fn add(conn: &mut SqliteConnection, key: StatKey, delta: i64) -> Result<i64, RankError> {
    conn.transaction(|conn| {
        let value = diesel::update(statistics::table.filter(statistics::key.eq(key.as_str())))
            .set(statistics::value.eq(statistics::value + delta))
            .returning(statistics::value)
            .get_result::<i64>(conn)
            .optional()?
            .ok_or_else(|| RankError::MissingStatistic(key.as_str().to_string()))?;
        debug!(key = key.as_str(), delta, value, "statistic updated");
        Ok(value)
    })
}

pub fn set(conn: &mut SqliteConnection, key: StatKey, value: i64) -> Result<(), RankError> {
    conn.transaction(|conn| {
        let updated = diesel::update(statistics::table.filter(statistics::key.eq(key.as_str())))
            .set(statistics::value.eq(value))
            .execute(conn)?;
        if updated == 0 {
            return Err(RankError::MissingStatistic(key.as_str().to_string()));
        }
        Ok(())
    })
}

/// Moves `count` units from one counter to another in one transaction.
pub fn transfer(
    conn: &mut SqliteConnection,
    from: StatKey,
    to: StatKey,
    count: i64,
) -> Result<(), RankError> {
    if count == 0 {
        return Ok(());
    }
    conn.transaction(|conn| {
        add(conn, from, -count)?;
        add(conn, to, count)?;
        Ok(())
    })
}

/// Inserts any missing keyword counters with value `0`.
pub fn seed(conn: &mut SqliteConnection) -> Result<usize, RankError> {
    let rows: Vec<NewStatistic<'_>> = StatKey::ALL
        .iter()
        .map(|key| NewStatistic {
            key: key.as_str(),
            value: 0,
        })
        .collect();
    let inserted = diesel::insert_or_ignore_into(statistics::table)
        .values(&rows)
        .execute(conn)?;
    Ok(inserted)
}

pub fn snapshot(conn: &mut SqliteConnection) -> Result<KeywordStatistics, RankError> {
    Ok(KeywordStatistics {
        total: get(conn, StatKey::KeywordsTotal)?,
        available: get(conn, StatKey::KeywordsAvailable)?,
        pending: get(conn, StatKey::KeywordsPending)?,
        answered: get(conn, StatKey::KeywordsAnswered)?,
    })
}

/// Recomputes every keyword counter from the keyword table.
///
/// Holds the write lock for the duration, so no keyword changes state while
/// the counts are taken.
pub fn recount(conn: &mut SqliteConnection) -> Result<KeywordStatistics, RankError> {
    let counts = conn.immediate_transaction(|conn| {
        let total: i64 = keywords::table.count().get_result(conn)?;
        let available: i64 = keywords::table
            .filter(keywords::answered_at.is_null())
            .filter(keywords::requested_at.is_null())
            .count()
            .get_result(conn)?;
        let pending: i64 = keywords::table
            .filter(keywords::answered_at.is_null())
            .filter(keywords::requested_at.is_not_null())
            .count()
            .get_result(conn)?;
        let answered: i64 = keywords::table
            .filter(keywords::answered_at.is_not_null())
            .count()
            .get_result(conn)?;

        set(conn, StatKey::KeywordsTotal, total)?;
        set(conn, StatKey::KeywordsAvailable, available)?;
        set(conn, StatKey::KeywordsPending, pending)?;
        set(conn, StatKey::KeywordsAnswered, answered)?;

        Ok::<_, RankError>(KeywordStatistics {
            total,
            available,
            pending,
            answered,
        })
    })?;

    info!(
        total = counts.total,
        available = counts.available,
        pending = counts.pending,
        answered = counts.answered,
        "keyword statistics recounted"
    );
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::test_db;
    use crate::models::NewKeyword;
    use std::thread;

    #[test]
    fn seeded_keys_start_at_zero() {
        let test = test_db();
        let mut conn = test.conn();
        let stats = snapshot(&mut conn).unwrap();
        assert_eq!(
            stats,
            KeywordStatistics {
                total: 0,
                available: 0,
                pending: 0,
                answered: 0
            }
        );
        // Seeding again leaves existing rows alone.
        add(&mut conn, StatKey::KeywordsTotal, 3).unwrap();
        assert_eq!(seed(&mut conn).unwrap(), 0);
        assert_eq!(get(&mut conn, StatKey::KeywordsTotal).unwrap(), 3);
    }

    #[test]
    fn add_and_set() {
        let test = test_db();
        let mut conn = test.conn();
        assert_eq!(add(&mut conn, StatKey::KeywordsPending, 5).unwrap(), 5);
        assert_eq!(add(&mut conn, StatKey::KeywordsPending, -2).unwrap(), 3);
        set(&mut conn, StatKey::KeywordsPending, 42).unwrap();
        assert_eq!(get(&mut conn, StatKey::KeywordsPending).unwrap(), 42);
    }

    #[test]
    fn missing_key_is_fatal() {
        let test = test_db();
        let mut conn = test.conn();
        diesel::delete(statistics::table.filter(statistics::key.eq("keywords_answered")))
            .execute(&mut conn)
            .unwrap();

        assert!(matches!(
            get(&mut conn, StatKey::KeywordsAnswered),
            Err(RankError::MissingStatistic(key)) if key == "keywords_answered"
        ));
        assert!(add(&mut conn, StatKey::KeywordsAnswered, 1).is_err());
        assert!(set(&mut conn, StatKey::KeywordsAnswered, 1).is_err());
        assert!(snapshot(&mut conn).is_err());
    }

    #[test]
    fn transfer_keeps_the_sum() {
        let test = test_db();
        let mut conn = test.conn();
        set(&mut conn, StatKey::KeywordsTotal, 10).unwrap();
        set(&mut conn, StatKey::KeywordsAvailable, 10).unwrap();

        transfer(&mut conn, StatKey::KeywordsAvailable, StatKey::KeywordsPending, 4).unwrap();
        transfer(&mut conn, StatKey::KeywordsPending, StatKey::KeywordsAnswered, 1).unwrap();

        let stats = snapshot(&mut conn).unwrap();
        assert_eq!((stats.available, stats.pending, stats.answered), (6, 3, 1));
        assert!(stats.is_consistent());
    }

    #[test]
    fn concurrent_adds_are_not_lost() {
        let test = test_db();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let db = test.db.clone();
                thread::spawn(move || {
                    let mut conn = db.connect().unwrap();
                    for _ in 0..25 {
                        add(&mut conn, StatKey::KeywordsAnswered, 1).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut conn = test.conn();
        assert_eq!(get(&mut conn, StatKey::KeywordsAnswered).unwrap(), 100);
    }

    #[test]
    fn recount_restores_the_invariant() {
        let test = test_db();
        let mut conn = test.conn();
        let now = chrono::Utc::now().naive_utc();
        let rows: Vec<NewKeyword> = ["a", "b", "c", "d"]
            .iter()
            .map(|k| NewKeyword {
                keyword: k.to_string(),
                created_at: now,
            })
            .collect();
        diesel::insert_into(keywords::table)
            .values(&rows)
            .execute(&mut conn)
            .unwrap();
        diesel::update(keywords::table.filter(keywords::keyword.eq("a")))
            .set(keywords::requested_at.eq(Some(now)))
            .execute(&mut conn)
            .unwrap();
        diesel::update(keywords::table.filter(keywords::keyword.eq("b")))
            .set((
                keywords::requested_at.eq(Some(now)),
                keywords::answered_at.eq(Some(now)),
            ))
            .execute(&mut conn)
            .unwrap();
        // Drifted counters.
        set(&mut conn, StatKey::KeywordsTotal, 99).unwrap();

        let stats = recount(&mut conn).unwrap();
        assert_eq!(
            stats,
            KeywordStatistics {
                total: 4,
                available: 2,
                pending: 1,
                answered: 1
            }
        );
        assert_eq!(snapshot(&mut conn).unwrap(), stats);
    }
}
