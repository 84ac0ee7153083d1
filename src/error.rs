use thiserror::Error;

/// Failure modes of the ingestion pipeline.
///
/// Inner handlers propagate these with `?`; only the webhook router and the
/// background runner turn them into log lines.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway returned {status}: {body}")]
    Gateway { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed payload: {0}")]
    Payload(String),

    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    #[error("concurrent update conflict: {0}")]
    Conflict(String),
}

impl IngestError {
    pub fn payload(message: impl Into<String>) -> Self {
        IngestError::Payload(message.into())
    }
}
