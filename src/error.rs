//! Error types shared across the crate.
//!
//! [`RankError`] is what every operation returns. [`LlmError`] describes the
//! LLM client's failure classes so callers can tell a transient hiccup
//! from an exhausted retry budget. [`ResponseError`] covers malformed model
//! output; it never leaves a result callback, which reverts the record instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RankError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("failed to connect to {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: diesel::ConnectionError,
    },

    /// Statistic keys are seeded at setup; a missing one is fatal.
    #[error("statistic `{0}` has not been seeded; run `topranks init` first")]
    MissingStatistic(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i32 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl From<tokio::task::JoinError> for RankError {
    fn from(err: tokio::task::JoinError) -> Self {
        RankError::Worker(err.to_string())
    }
}

/// Failure classes of a completion call.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LlmError {
    /// Connection errors, rate limits and generic API errors; worth retrying.
    #[error("transient LLM failure: {0}")]
    Transient(String),

    /// Errors no retry can fix (bad request arguments, client setup).
    #[error("LLM request rejected: {0}")]
    Fatal(String),

    #[error("LLM call failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("LLM returned an empty completion")]
    EmptyResponse,
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Transient(_) | LlmError::EmptyResponse)
    }
}

/// Malformed model output.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("response contains no `{{...}}` block")]
    NoJsonObject,

    #[error("embedded JSON is invalid: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(LlmError::Transient("503".into()).is_transient());
        assert!(LlmError::EmptyResponse.is_transient());
        assert!(!LlmError::Fatal("bad model".into()).is_transient());
        assert!(
            !LlmError::Exhausted {
                attempts: 6,
                last: "timeout".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn missing_statistic_message_names_the_key() {
        let err = RankError::MissingStatistic("keywords_total".into());
        assert!(err.to_string().contains("keywords_total"));
    }
}
