use attest_core::AttestError;
use attest_store::StoreError;
use thiserror::Error;

pub type HashResult<T> = Result<T, HashError>;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("no digest algorithms configured")]
    NoLanes,

    #[error("init bytes supplied for {given} lanes, but {expected} lanes are configured")]
    InitLaneMismatch { expected: usize, given: usize },

    #[error("invalid sample modulus {0}: must be positive")]
    InvalidModulus(i64),

    #[error("invalid substance pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<HashError> for AttestError {
    fn from(e: HashError) -> Self {
        AttestError::Hash(e.to_string())
    }
}
