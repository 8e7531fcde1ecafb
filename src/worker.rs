//! # Worker pool
//!
//! Executes broker tasks: claim, wait for rate-limit admission, call the LLM,
//! run the matching result callback, record the result.
//!
//! Every loop in a process shares one `governor` limiter, so
//! `requests_per_minute` bounds the whole pool. Database work runs on the
//! blocking thread pool with a fresh connection per step; SQLite serializes
//! the writers.
//!
//! A task flushed by a queue reset while its LLM call was in flight is
//! discarded: no callback runs and no result is recorded.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use topranks::{api::OpenAiClient, config::load_config, worker::run_pool};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("config.yaml")?;
//! let client = Arc::new(OpenAiClient::new(&config)?);
//! let report = run_pool(&config, client, CancellationToken::new()).await?;
//! println!("processed {} tasks", report.processed);
//! # Ok(()) }
//! ```

use chrono::{NaiveDateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::Completion;
use crate::broker::{self, ResultStatus, RetryOutcome, TaskKind};
use crate::callbacks::{self, CallbackOutcome};
use crate::config::{PromptSet, QueuePolicy, TopRanksConfig, WorkerSettings};
use crate::db::Database;
use crate::error::RankError;
use crate::models::Task;
use crate::refill;
use crate::statistics;

pub type Limiter = DefaultDirectRateLimiter;

/// A process-wide admission limiter allowing `requests_per_minute` calls.
pub fn rate_limiter(requests_per_minute: u32) -> Limiter {
    let rpm = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
    RateLimiter::direct(Quota::per_minute(rpm))
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// What one claim/execute/finish cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The callback ran and the result was recorded.
    Finished {
        task_id: i32,
        kind: TaskKind,
        outcome: CallbackOutcome,
    },
    /// The LLM call failed; the broker requeued or failed the task.
    Retried { task_id: i32, retry: RetryOutcome },
    /// The task was flushed while in flight; its response was dropped.
    Discarded { task_id: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PoolReport {
    pub processed: usize,
    /// Keyword tasks submitted by the scheduled refill.
    pub refilled: usize,
}

/// One task loop.
#[derive(Clone)]
pub struct Worker {
    id: String,
    db: Database,
    client: Arc<dyn Completion>,
    limiter: Arc<Limiter>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        db: Database,
        client: Arc<dyn Completion>,
        limiter: Arc<Limiter>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id: id.into(),
            db,
            client,
            limiter,
            settings,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs `op` on the blocking pool with a fresh connection.
    async fn with_conn<T, F>(&self, op: F) -> Result<T, RankError>
    where
        T: Send + 'static,
        F: FnOnce(&mut diesel::SqliteConnection) -> Result<T, RankError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.connect()?;
            op(&mut conn)
        })
        .await?
    }

    /// Performs one claim/execute/finish cycle; `None` when nothing is runnable.
    pub async fn process_next(&self) -> Result<Option<TaskOutcome>, RankError> {
        let worker_id = self.id.clone();
        let claimed = self
            .with_conn(move |conn| broker::claim(conn, &worker_id, now()))
            .await?;
        let Some(task) = claimed else {
            return Ok(None);
        };

        let kind = match TaskKind::parse(&task.kind) {
            Ok(kind) => kind,
            Err(err) => {
                warn!(task_id = task.id, kind = %task.kind, "dropping task of unknown kind");
                let detail = err.to_string();
                self.with_conn(move |conn| {
                    broker::complete(conn, &task, ResultStatus::Failed, Some(detail), now())
                })
                .await?;
                return Err(err);
            }
        };

        self.limiter.until_ready().await;
        debug!(worker_id = %self.id, task_id = task.id, kind = kind.as_str(), "calling LLM");
        let response = self
            .client
            .complete(&task.prompt, task.model.as_deref())
            .await;

        match response {
            Ok(raw) => self.finish(task, kind, raw).await.map(Some),
            Err(err) => {
                warn!(task_id = task.id, error = %err, "LLM call failed");
                let task_id = task.id;
                let settings = self.settings.clone();
                let retry = self
                    .with_conn(move |conn| {
                        broker::retry(conn, &task, &err.to_string(), &settings, now())
                    })
                    .await?;
                Ok(Some(TaskOutcome::Retried { task_id, retry }))
            }
        }
    }

    async fn finish(&self, task: Task, kind: TaskKind, raw: String) -> Result<TaskOutcome, RankError> {
        let settings = self.settings.clone();
        self.with_conn(move |conn| {
            let task_id = task.id;
            if !broker::is_held(conn, &task)? {
                info!(task_id, "task flushed while in flight, discarding result");
                return Ok(TaskOutcome::Discarded { task_id });
            }

            let outcome = match callbacks::on_result(conn, kind, task.target_id, &raw) {
                Ok(outcome) => outcome,
                Err(err) => {
                    // Leave the task retryable rather than stuck in `running`.
                    broker::retry(conn, &task, &err.to_string(), &settings, now())?;
                    return Err(err);
                }
            };
            let recorded =
                broker::complete(conn, &task, outcome.result_status(), outcome.detail(), now())?;
            if !recorded {
                info!(task_id, "task flushed before its result was recorded");
            }
            Ok(TaskOutcome::Finished {
                task_id,
                kind,
                outcome,
            })
        })
        .await
    }

    /// Processes tasks until `shutdown` is cancelled; returns the number handled.
    ///
    /// A missing statistic key stops the whole pool.
    pub async fn run(self, shutdown: CancellationToken) -> Result<usize, RankError> {
        let idle = Duration::from_millis(self.settings.idle_poll_ms);
        let mut processed = 0;
        info!(worker_id = %self.id, "worker started");
        while !shutdown.is_cancelled() {
            match self.process_next().await {
                Ok(Some(_)) => {
                    processed += 1;
                    continue;
                }
                Ok(None) => {}
                Err(err @ RankError::MissingStatistic(_)) => {
                    error!(worker_id = %self.id, error = %err, "statistics are not seeded, stopping");
                    shutdown.cancel();
                    return Err(err);
                }
                Err(err) => error!(worker_id = %self.id, error = %err, "task processing failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
        }
        info!(worker_id = %self.id, processed, "worker stopped");
        Ok(processed)
    }
}

/// Periodic refill and stale-task recovery.
async fn maintain(
    db: Database,
    policy: QueuePolicy,
    prompts: PromptSet,
    settings: WorkerSettings,
    shutdown: CancellationToken,
) -> Result<usize, RankError> {
    let mut ticker = tokio::time::interval(Duration::from_secs(settings.refill_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let stale_after = Duration::from_secs(settings.stale_task_secs);
    let mut submitted = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let (db, prompts) = (db.clone(), prompts.clone());
        let pass = tokio::task::spawn_blocking(move || {
            let mut conn = db.connect()?;
            broker::recover_stale(&mut conn, now(), stale_after)?;
            refill::refill(&mut conn, &policy, &prompts)
        })
        .await?;
        match pass {
            Ok(report) => submitted += report.submitted,
            Err(err @ RankError::MissingStatistic(_)) => {
                shutdown.cancel();
                return Err(err);
            }
            Err(err) => warn!(error = %err, "scheduled refill failed"),
        }
    }
    Ok(submitted)
}

/// Runs `worker.concurrency` task loops (plus the refill scheduler when
/// `refill_interval_secs > 0`) until `shutdown` is cancelled.
///
/// # Errors
/// Fails at startup when the statistics are not seeded, and afterwards with
/// the first fatal error reported by any loop.
pub async fn run_pool(
    config: &TopRanksConfig,
    client: Arc<dyn Completion>,
    shutdown: CancellationToken,
) -> Result<PoolReport, RankError> {
    let db = Database::new(config.db_url.clone());
    let settings = config.worker.clone();
    let stale_after = Duration::from_secs(settings.stale_task_secs);
    {
        let db = db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.connect()?;
            statistics::snapshot(&mut conn)?;
            broker::recover_stale(&mut conn, now(), stale_after)
        })
        .await??;
    }

    let limiter = Arc::new(rate_limiter(settings.requests_per_minute));
    let concurrency = settings.concurrency.max(1);
    info!(
        concurrency,
        requests_per_minute = settings.requests_per_minute,
        refill_interval_secs = settings.refill_interval_secs,
        "worker pool starting"
    );

    let loops: Vec<_> = (0..concurrency)
        .map(|n| {
            let worker = Worker::new(
                format!("worker-{}-{n}", std::process::id()),
                db.clone(),
                client.clone(),
                limiter.clone(),
                settings.clone(),
            );
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect();
    let scheduler = (settings.refill_interval_secs > 0).then(|| {
        tokio::spawn(maintain(
            db.clone(),
            config.queue_policy(),
            config.prompts.clone(),
            settings.clone(),
            shutdown.clone(),
        ))
    });

    let mut report = PoolReport::default();
    let mut first_error = None;
    for joined in futures::future::join_all(loops).await {
        match joined.map_err(RankError::from).and_then(|r| r) {
            Ok(processed) => report.processed += processed,
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }
    // Task loops only end on shutdown, so the scheduler is stopping too.
    if let Some(scheduler) = scheduler {
        match scheduler.await.map_err(RankError::from).and_then(|r| r) {
            Ok(submitted) => report.refilled = submitted,
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }

    info!(
        processed = report.processed,
        refilled = report.refilled,
        "worker pool stopped"
    );
    match first_error {
        Some(err) => Err(err),
        None => Ok(report),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::ScriptedCompletion;
    use crate::db::testing::{TestDb, test_db};
    use crate::error::LlmError;
    use crate::ingest::import_keywords;
    use crate::models::{Keyword, TaskResult};
    use crate::schema::{keywords, statistics as statistics_table, task_results};
    use async_trait::async_trait;
    use diesel::prelude::*;

    const ROUND_TRIP: &str = r#"Sure! {"user_intent": "buy shoes", "natural_language_question": "What are the best running shoes?", "ai_answer": "...", "likely_previous_queries": ["running gear"], "likely_next_queries": ["shoe reviews"]}"#;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            concurrency: 2,
            refill_interval_secs: 0,
            idle_poll_ms: 10,
            task_max_retries: 2,
            task_retry_backoff_secs: 0,
            ..WorkerSettings::default()
        }
    }

    fn worker(test: &TestDb, client: Arc<dyn Completion>) -> Worker {
        Worker::new(
            "test-worker",
            test.db.clone(),
            client,
            Arc::new(rate_limiter(6000)),
            settings(),
        )
    }

    fn queue_keywords(test: &TestDb, texts: &[&str]) {
        let mut conn = test.conn();
        import_keywords(&mut conn, texts).unwrap();
        refill::refill(&mut conn, &QueuePolicy::development(), &PromptSet::default()).unwrap();
    }

    fn results(test: &TestDb) -> Vec<TaskResult> {
        task_results::table
            .order(task_results::id)
            .select(TaskResult::as_select())
            .load(&mut test.conn())
            .unwrap()
    }

    #[tokio::test]
    async fn round_trip_answers_the_keyword() {
        let test = test_db();
        queue_keywords(&test, &["best running shoes"]);
        let client = Arc::new(ScriptedCompletion::new([Ok(ROUND_TRIP.to_string())]));
        let worker = worker(&test, client.clone());

        let outcome = worker.process_next().await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            TaskOutcome::Finished {
                kind: TaskKind::Keyword,
                outcome: CallbackOutcome::Answered,
                ..
            }
        ));
        assert!(client.prompts()[0].contains("best running shoes"));

        let mut conn = test.conn();
        let keyword: Keyword = keywords::table
            .select(Keyword::as_select())
            .first(&mut conn)
            .unwrap();
        assert_eq!(keyword.user_intent.as_deref(), Some("buy shoes"));
        assert!(keyword.answered_at.is_some());

        let stats = statistics::snapshot(&mut conn).unwrap();
        assert_eq!((stats.pending, stats.answered), (0, 1));
        assert_eq!(results(&test)[0].status, "succeeded");
        assert_eq!(broker::depth(&mut conn).unwrap().total(), 0);

        assert!(worker.process_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_response_reverts_and_records() {
        let test = test_db();
        queue_keywords(&test, &["socks"]);
        let client = Arc::new(ScriptedCompletion::new([Ok("I cannot help.".to_string())]));

        let outcome = worker(&test, client).process_next().await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            TaskOutcome::Finished {
                outcome: CallbackOutcome::Reverted(_),
                ..
            }
        ));

        let mut conn = test.conn();
        let keyword: Keyword = keywords::table
            .select(Keyword::as_select())
            .first(&mut conn)
            .unwrap();
        assert!(keyword.requested_at.is_none());
        assert!(keyword.answered_at.is_none());
        assert_eq!(statistics::snapshot(&mut conn).unwrap().available, 1);
        assert_eq!(results(&test)[0].status, "reverted");
    }

    #[tokio::test]
    async fn llm_failure_requeues_then_fails() {
        let test = test_db();
        queue_keywords(&test, &["socks"]);
        let exhausted = || {
            Err(LlmError::Exhausted {
                attempts: 6,
                last: "timeout".into(),
            })
        };
        let client = Arc::new(ScriptedCompletion::new([exhausted(), exhausted(), exhausted()]));
        let worker = worker(&test, client);

        for attempts in 1..=2 {
            let outcome = worker.process_next().await.unwrap().unwrap();
            assert!(matches!(
                outcome,
                TaskOutcome::Retried {
                    retry: RetryOutcome::Requeued { attempts: a, .. },
                    ..
                } if a == attempts
            ));
        }
        let outcome = worker.process_next().await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            TaskOutcome::Retried {
                retry: RetryOutcome::Failed,
                ..
            }
        ));

        // The keyword stays pending until a queue reset.
        let mut conn = test.conn();
        assert_eq!(refill::pending_keyword_count(&mut conn).unwrap(), 1);
        assert_eq!(results(&test)[0].status, "failed");
    }

    /// Flushes the broker while the "LLM call" is in flight.
    struct FlushingCompletion {
        db: Database,
    }

    #[async_trait]
    impl Completion for FlushingCompletion {
        async fn complete(&self, _prompt: &str, _model: Option<&str>) -> Result<String, LlmError> {
            let mut conn = self.db.connect().unwrap();
            broker::flush(&mut conn).unwrap();
            Ok(ROUND_TRIP.to_string())
        }
    }

    #[tokio::test]
    async fn flushed_task_result_is_discarded() {
        let test = test_db();
        queue_keywords(&test, &["socks"]);
        let client = Arc::new(FlushingCompletion {
            db: test.db.clone(),
        });

        let outcome = worker(&test, client).process_next().await.unwrap().unwrap();
        assert!(matches!(outcome, TaskOutcome::Discarded { .. }));

        let mut conn = test.conn();
        let keyword: Keyword = keywords::table
            .select(Keyword::as_select())
            .first(&mut conn)
            .unwrap();
        assert!(keyword.answered_at.is_none());
        assert!(results(&test).is_empty());
    }

    #[tokio::test]
    async fn missing_statistics_stop_the_pool() {
        let test = test_db();
        queue_keywords(&test, &["socks"]);
        diesel::delete(statistics_table::table)
            .execute(&mut test.conn())
            .unwrap();

        let mut config = TopRanksConfig::starter(test.db.url().to_string());
        config.worker = settings();
        let client = Arc::new(ScriptedCompletion::new([]));
        let result = run_pool(&config, client, CancellationToken::new()).await;
        assert!(matches!(result, Err(RankError::MissingStatistic(_))));
    }

    #[tokio::test]
    async fn pool_drains_the_queue_and_stops_on_shutdown() {
        let test = test_db();
        queue_keywords(&test, &["a", "b", "c"]);
        let client = Arc::new(ScriptedCompletion::new(
            (0..3).map(|_| Ok(ROUND_TRIP.to_string())),
        ));
        let mut config = TopRanksConfig::starter(test.db.url().to_string());
        config.worker = settings();

        let shutdown = CancellationToken::new();
        let pool = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { run_pool(&config, client, shutdown).await }
        });

        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let answered = statistics::snapshot(&mut test.conn()).unwrap().answered;
                if answered == 3 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(drained.is_ok());

        shutdown.cancel();
        let report = pool.await.unwrap().unwrap();
        assert_eq!(report.processed, 3);
        assert!(statistics::snapshot(&mut test.conn()).unwrap().is_consistent());
    }
}
