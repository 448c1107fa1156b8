//! Error type shared by every fallible operation in the crate.

use thiserror::Error;

use crate::backend::BackendError;

/// Coarse classification of [`Error`] used by callers that branch on failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    GraphInconsistency,
    StaleState,
    DeviceMismatch,
    ArgumentMismatch,
    VersionMismatch,
    Backend,
    Serialization,
    Io,
}

#[derive(Debug, Error)]
pub enum Error {
    /// The graph violates a structural invariant (unknown node, unreachable variable,
    /// unresolved placeholder, cycle).
    #[error("graph inconsistency: {0}")]
    GraphInconsistency(String),
    /// A backprop state no longer matches the values it was recorded against.
    #[error("stale backprop state: {0}")]
    StaleState(String),
    #[error("device mismatch: {0}")]
    DeviceMismatch(String),
    #[error("argument mismatch: {0}")]
    ArgumentMismatch(String),
    #[error("unsupported graph dictionary version {found} (supported: {supported:?})")]
    VersionMismatch {
        found: u32,
        supported: &'static [u32],
    },
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("malformed graph encoding: {0}")]
    Format(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::GraphInconsistency(_) => ErrorKind::GraphInconsistency,
            Error::StaleState(_) => ErrorKind::StaleState,
            Error::DeviceMismatch(_) => ErrorKind::DeviceMismatch,
            Error::ArgumentMismatch(_) => ErrorKind::ArgumentMismatch,
            Error::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            Error::Backend(_) => ErrorKind::Backend,
            Error::Format(_) | Error::Json(_) | Error::Bincode(_) => ErrorKind::Serialization,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn graph(message: impl Into<String>) -> Self {
        Error::GraphInconsistency(message.into())
    }

    pub(crate) fn stale(message: impl Into<String>) -> Self {
        Error::StaleState(message.into())
    }

    pub(crate) fn device(message: impl Into<String>) -> Self {
        Error::DeviceMismatch(message.into())
    }

    pub(crate) fn argument(message: impl Into<String>) -> Self {
        Error::ArgumentMismatch(message.into())
    }

    pub(crate) fn format(message: impl Into<String>) -> Self {
        Error::Format(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Returns early with the given error constructor when the condition does not hold.
macro_rules! ensure {
    ($cond:expr, $ctor:ident, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::Error::$ctor(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure;
