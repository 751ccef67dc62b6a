use fieldx::error::FieldXError;
use thiserror::Error;

use crate::traits::SqlError;
use crate::traits::StoreError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown field '{field}' for table '{table}'")]
    InvalidField { table: String, field: String },

    #[error("field '{field}' expects {expected}, got {got}")]
    InvalidType {
        field:    String,
        expected: String,
        got:      String,
    },

    #[error("expected {expected} {what} value(s), got {got}")]
    CountMismatch {
        what:     &'static str,
        expected: usize,
        got:      usize,
    },

    /// The SQL store holds no row for the requested condition.
    #[error("no data")]
    NoData,

    #[error("remote store error: {0}")]
    RemoteStore(#[from] StoreError),

    #[error("sql store error: {0}")]
    SqlStore(#[from] SqlError),

    #[error("lock '{0}' was not acquired in time")]
    LockTimeout(String),

    #[error("cannot decode field '{field}': {reason}")]
    EncodingMismatch { field: String, reason: String },

    #[error("deferred write for '{key}' failed: {source}")]
    AsyncWriteFailed {
        key:    String,
        #[source]
        source: SqlError,
    },

    #[error("operation deadline exceeded")]
    DeadlineExceeded,
}

impl From<FieldXError> for Error {
    fn from(err: FieldXError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

impl Error {
    pub(crate) fn config<S: ToString>(msg: S) -> Self {
        Self::InvalidConfig(msg.to_string())
    }

    pub(crate) fn mismatch<F: ToString, R: ToString>(field: F, reason: R) -> Self {
        Self::EncodingMismatch {
            field:  field.to_string(),
            reason: reason.to_string(),
        }
    }

    #[inline]
    pub fn is_no_data(&self) -> bool {
        matches!(self, Self::NoData)
    }

    /// True for errors caused by the caller's input rather than by a backend.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidField { .. } | Self::InvalidType { .. } | Self::CountMismatch { .. }
        )
    }
}
