use std::io;
use thiserror::Error;

/// Coarse classification of [`Error`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad configuration, out-of-range window/bounds or NaN trace data.
    InvalidArgument,
    /// Random key datasets, non byte-valued leakage models.
    UnsupportedOperation,
    /// Trace store or power model access failure.
    IoFailure,
    /// Covariance matrix not positive-definite.
    NumericInstability,
    /// Invariant violation.
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error("Failed to read npy file")]
    NpyError(#[from] ndarray_npy::ReadNpyError),
    #[error("Failed to write csv table")]
    CsvError(#[from] csv::Error),
    #[error("Failed to save/load tarot data")]
    SaveLoadError(#[from] serde_json::Error),
    #[error("Power model failure: {0}")]
    ModelError(String),
    #[error("Numeric instability: {0}")]
    NumericInstability(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            Error::IoError(_)
            | Error::NpyError(_)
            | Error::CsvError(_)
            | Error::SaveLoadError(_)
            | Error::ModelError(_) => ErrorKind::IoFailure,
            Error::NumericInstability(_) => ErrorKind::NumericInstability,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }
}
