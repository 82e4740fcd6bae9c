use serde::Serialize;
use thiserror::Error;

/// What a caller should do about a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
    FixInput,
    TryAgainLater,
}

#[derive(Debug, Error)]
pub enum SppError {
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("model expects {expected} features but received {actual}")]
    ModelInputShape { expected: usize, actual: usize },
    #[error("store {operation} failed: {message}")]
    StoreConnectivity {
        operation: String,
        retryable: bool,
        message: String,
    },
    #[error("store changed during reconciliation (expected {expected_rows} rows, found {actual_rows})")]
    ConcurrentModification {
        expected_rows: usize,
        actual_rows: usize,
    },
    #[error("batch append interrupted after {committed} committed rows: {source}")]
    PartialBatch {
        committed: usize,
        #[source]
        source: Box<SppError>,
    },
}

impl SppError {
    pub fn store(operation: impl Into<String>, retryable: bool, message: impl Into<String>) -> Self {
        Self::StoreConnectivity {
            operation: operation.into(),
            retryable,
            message: message.into(),
        }
    }

    pub fn action(&self) -> UserAction {
        match self {
            Self::SchemaMismatch(_) | Self::InvalidInput(_) | Self::ModelInputShape { .. } => {
                UserAction::FixInput
            }
            Self::StoreConnectivity { .. }
            | Self::ConcurrentModification { .. }
            | Self::PartialBatch { .. } => UserAction::TryAgainLater,
        }
    }

    /// Reads can be retried blindly; appends cannot, so this only reports
    /// whether the failure itself was transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreConnectivity { retryable, .. } => *retryable,
            Self::ConcurrentModification { .. } | Self::PartialBatch { .. } => true,
            _ => false,
        }
    }

    pub fn user_message(&self) -> String {
        match self.action() {
            UserAction::FixInput => format!("Please fix your input: {self}"),
            UserAction::TryAgainLater => format!("Please try again later: {self}"),
        }
    }
}

pub type SppResult<T> = Result<T, SppError>;
