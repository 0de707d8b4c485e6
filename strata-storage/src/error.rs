use std::array::TryFromSliceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("Invalid format")]
    InvalidFormat,
    #[error("IO Error")]
    IOError,
    #[error("key too long({0} bytes)")]
    KeyTooLong(usize),
    #[error("value too large({0} bytes)")]
    ValueTooLarge(usize),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    // existing data file was created with different block size.
    #[error("config mismatch with data file")]
    ConfigMismatch,
    // slice errors
    #[error("slice shutdown")]
    SliceShutdown,
    #[error("slice poisoned by a failed operation")]
    SlicePoisoned,
    #[error("tree invariant violated: {0}")]
    InvariantViolation(String),
}

impl From<TryFromSliceError> for Error {
    #[inline]
    fn from(_src: TryFromSliceError) -> Error {
        Error::InvalidFormat
    }
}

impl From<std::io::Error> for Error {
    #[inline]
    fn from(_src: std::io::Error) -> Self {
        Error::IOError
    }
}

impl From<toml::de::Error> for Error {
    #[inline]
    fn from(src: toml::de::Error) -> Self {
        Error::InvalidConfig(src.message().to_string())
    }
}
