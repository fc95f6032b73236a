use assignment_coordination::error::Error as StoreError;
use thiserror::Error;

use crate::types::{Epoch, Task, WorkerId};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Store(StoreError),

    #[error("worker {0} is already registered and live")]
    Registration(WorkerId),

    #[error(transparent)]
    StaleWrite(#[from] StaleWriteError),

    #[error("failed to start task {task}: {reason}")]
    ConnectorStart { task: Task, reason: String },

    #[error("failed to stop task {task}: {reason}")]
    ConnectorStop { task: Task, reason: String },

    #[error("coordination session lost")]
    SessionLost,

    #[error("configuration error: {0}")]
    Configuration(String),
}

/// A publish lost the race against a table computed from newer state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("stale assignment write at epoch {attempted}, store is at epoch {current}")]
pub struct StaleWriteError {
    pub attempted: Epoch,
    pub current: Epoch,
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SessionLost => Self::SessionLost,
            other => Self::Store(other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(e.into())
    }
}

impl Error {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::Store(StoreError::InvalidState(msg.into()))
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Transport or session trouble that is worth retrying, as opposed to a
    /// conflict or a bad configuration.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store(_) | Error::SessionLost)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
