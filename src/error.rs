use thiserror::Error;

use crate::engine::EngineError;

/// Errors raised while driving jobs against the catalog and the query engine.
///
/// The split matters operationally: faults of a single job mark that job
/// FAILED and processing moves on, while catalog connectivity faults abort
/// the whole discovery pass and trigger a session refresh. See
/// [`ControllerError::is_job_failure`].
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Catalog RPC failed: {0}")]
    Transport(tonic::Status),

    #[error("Catalog connection failed: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Principal {principal} lacks {action} permission on {resource}")]
    Authorization {
        principal: String,
        action: String,
        resource: String,
    },

    #[error("Query engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Malformed payload: {0}")]
    Payload(String),

    #[error("Invalid target reference: {0}")]
    InvalidTarget(String),
}

impl ControllerError {
    /// Classifies a status returned by a catalog RPC. NOT_FOUND is reported
    /// for resources a job referenced but that do not exist, so it is a fault
    /// of that job; every other status means the session or the connection is
    /// unhealthy.
    pub fn from_status(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::NotFound => ControllerError::NotFound(status.message().to_string()),
            _ => ControllerError::Transport(status),
        }
    }

    /// True for faults attributable to a single job rather than to the
    /// catalog session or connection.
    pub fn is_job_failure(&self) -> bool {
        matches!(
            self,
            ControllerError::NotFound(_)
                | ControllerError::Authorization { .. }
                | ControllerError::Engine(_)
                | ControllerError::Payload(_)
                | ControllerError::InvalidTarget(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;
