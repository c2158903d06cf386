use crate::oracle::EvaluationFailure;
use looptune_ir::LegalityViolation;
use thiserror::Error;

/// Terminal search failures. Per-candidate problems never surface here.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("baseline kernel could not be evaluated: {0}")]
    BaselineFailed(#[source] EvaluationFailure),
    #[error("root kernel is not a legal loop nest: {0}")]
    IllegalRoot(#[source] LegalityViolation),
    #[error("invalid search configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to start worker pool: {0}")]
    WorkerPool(String),
}
