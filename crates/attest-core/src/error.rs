use thiserror::Error;

pub type AttestResult<T> = Result<T, AttestError>;

#[derive(Debug, Error)]
pub enum AttestError {
    #[error("store error: {0}")]
    Store(String),

    #[error("hash error: {0}")]
    Hash(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
