use thiserror::Error;
use uuid::Uuid;

use crate::store::state::JobState;

#[derive(Error, Debug)]
pub enum ConductorError {
    /// The requested state change is either absent from the allowed-transition
    /// table or lost a race against a concurrent transition. The two cases are
    /// deliberately indistinguishable to callers.
    #[error("invalid job state transition from {from} to {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("{0}")]
    Validation(String),

    #[error("store failure: {0}")]
    Store(#[from] sqlx::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ConductorError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;
