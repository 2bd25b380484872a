//! Errors

/// Result wrapper
pub type Result<T> = std::result::Result<T, Error>;

/// Crate errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("header checksum mismatch: stored {stored:o}, computed {computed:o}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("truncated header: {0} of 512 bytes available")]
    TruncatedHeader(usize),

    #[error("invalid octal digit in {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("entry has an empty file name")]
    EmptyName,

    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            err => std::io::Error::new(std::io::ErrorKind::InvalidData, err),
        }
    }
}
