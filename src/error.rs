use thiserror::Error;

/// Failure classes for the transcode pipeline. Decode errors are the only
/// recoverable kind; everything else unwinds to a nonzero exit.
#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("cannot open input '{path}': {reason}")]
    OpenInput { path: String, reason: String },

    #[error("cannot open output '{path}': {reason}")]
    OpenOutput { path: String, reason: String },

    #[error("codec setup failed: {0}")]
    CodecInit(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

pub type Result<T> = std::result::Result<T, TranscodeError>;
