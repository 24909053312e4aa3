use thiserror::Error;

/// Error taxonomy for the orchestration core.
///
/// Callers map variants onto transport-level responses: `NotFound` and
/// `Validation` are caller mistakes (404/400 equivalents), `ExternalService`
/// is a collaborator failure that batch operations degrade around, and
/// `Internal` is an unexpected storage or serialization failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{service} error: {message}")]
    ExternalService { service: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn external(service: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::ExternalService {
            service: service.into(),
            message: message.to_string(),
        }
    }

    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Error::Internal(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization failed: {e}"))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Internal(format!("store failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
