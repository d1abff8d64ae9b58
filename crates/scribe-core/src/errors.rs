/// Core error type.
///
/// Adapter crates map their specific errors into this type so the orchestration
/// layer can tell permanent input failures from retryable external ones.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("unknown job kind: {0}")]
    UnknownKind(String),

    #[error("invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("invalid callback data: {0}")]
    InvalidCallback(String),

    #[error("expired: {0}")]
    Expired(String),
}

impl Error {
    /// Permanent input failures are rejected immediately and never retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::UnknownKind(_) | Error::InvalidPayload(_) | Error::InvalidCallback(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
