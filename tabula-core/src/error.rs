use thiserror::Error;

/// Failures while decoding or merging replicated data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocError {
    /// Bytes could not be parsed at all (truncated, garbage).
    #[error("decode error: {0}")]
    Decode(String),

    #[error("unknown format tag: {0:#04x}")]
    UnknownFormat(u8),

    #[error("empty payload")]
    Empty,

    /// Parsed fine but could not be integrated into the document.
    #[error("integrity violation: {0}")]
    Integrity(String),
}

impl DocError {
    pub fn is_integrity(&self) -> bool {
        matches!(self, DocError::Integrity(_))
    }
}

impl From<yrs::encoding::read::Error> for DocError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocError::Decode(e.to_string())
    }
}

pub type DocResult<T> = Result<T, DocError>;
