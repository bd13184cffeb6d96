// src/infra/errors.rs - Error types for roadopt

use thiserror::Error;

use crate::oracle::protocol::{CommandKind, ReplyStatus};

/// Failures of the oracle channel or of a single oracle command.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    // Channel errors (fatal to the affected session)
    #[error("Oracle connection error: {0}")]
    Connection(String),

    #[error("Oracle protocol error: {0}")]
    Protocol(String),

    #[error("Oracle '{kind}' timed out after {after_ms}ms")]
    Timeout { kind: CommandKind, after_ms: u64 },

    // Command errors (recoverable per candidate)
    #[error("Oracle rejected '{kind}' ({status:?}): {message}")]
    CommandFailed {
        kind: CommandKind,
        status: ReplyStatus,
        message: String,
    },

    #[error("Oracle message encoding error: {0}")]
    Encoding(String),
}

impl OracleError {
    /// True for errors that poison the whole session rather than one command.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            OracleError::Connection(_) | OracleError::Protocol(_) | OracleError::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for OracleError {
    fn from(e: serde_json::Error) -> Self {
        OracleError::Encoding(e.to_string())
    }
}

/// Failure to turn one configuration into a fitness value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error("Objective '{expr}' returned no value")]
    MissingObjective { expr: String },

    #[error("Objective '{expr}' is not a finite non-negative number: {content}")]
    NonNumericObjective { expr: String, content: String },

    #[error("Adjacency query returned an unexpected value: {content}")]
    MalformedAdjacency { content: String },
}

impl EvaluationError {
    /// Whether a search can absorb this failure by scoring the candidate as worst.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EvaluationError::Oracle(e) => !e.is_session_fatal(),
            EvaluationError::MissingObjective { .. }
            | EvaluationError::NonNumericObjective { .. }
            | EvaluationError::MalformedAdjacency { .. } => true,
        }
    }
}

/// Errors surfaced by a search strategy.
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("No legal actions from a configuration with {closed} closed segments")]
    NoLegalActions { closed: usize },

    #[error("Search invariant violated: {0}")]
    Invariant(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("All {sessions} oracle sessions were lost")]
    AllSessionsLost { sessions: usize },
}

impl From<OracleError> for SearchError {
    fn from(e: OracleError) -> Self {
        SearchError::Evaluation(EvaluationError::Oracle(e))
    }
}
