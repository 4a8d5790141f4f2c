//! Pipeline error types
//!
//! Every fallible component returns `PipelineError` so callers pick their own
//! retry / drop / dead-letter policy. `is_transient()` is what the retry
//! helpers consult.

use std::time::Duration;
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network hiccup, timeout, 5xx or indexer throttling. Safe to retry.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Breaker is open. Callers must not busy-retry before `remaining` elapses.
    #[error("Circuit open, retry in {}ms", remaining.as_millis())]
    CircuitOpen { remaining: Duration },

    #[error("All providers unavailable")]
    AllProvidersUnavailable,

    /// Indexer answered but the payload was an error we should not retry.
    #[error("Indexer error: {0}")]
    Indexer(String),

    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Contract submission failed: {0}")]
    ContractSubmission(String),

    #[error("Dead-letter store error: {0}")]
    DeadLetter(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientNetwork(_) | PipelineError::ContractSubmission(_)
        )
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PipelineError::Decode(err.to_string())
        } else {
            PipelineError::TransientNetwork(err.to_string())
        }
    }
}

impl From<ethers::providers::ProviderError> for PipelineError {
    fn from(err: ethers::providers::ProviderError) -> Self {
        match err {
            ethers::providers::ProviderError::SerdeJson(e) => PipelineError::Decode(e.to_string()),
            other => PipelineError::TransientNetwork(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Decode(err.to_string())
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::DeadLetter(err.to_string())
    }
}
