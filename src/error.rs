use derive_more::From;
use std::sync::Arc;

pub type Result<T> = core::result::Result<T, Error>;

/// Rejection from a caller-supplied fetch. Cloned to every awaiter of the
/// same in-flight request, so the message is kept behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("fetch failed for {key}: {message}")]
pub struct FetchFailure {
    pub key: String,
    pub message: Arc<str>,
}

impl FetchFailure {
    #[must_use]
    pub fn new(key: impl Into<String>, message: impl Into<Arc<str>>) -> Self {
        Self {
            key: key.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Fetch(FetchFailure),

    #[from]
    Json(serde_json::Error),

    /// Value stored under `key` is not of the requested type
    TypeMismatch { key: String, expected: &'static str },

    /// Poll task id already in use and replacement was not requested
    TaskExists(String),

    UnknownTask(String),

    InvalidInterval(String),

    /// Scheduler was shut down; no new poll tasks are accepted
    SchedulerStopped,

    /// Custom error message
    Custom(String),
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::Fetch(failure) => write!(fmt, "{failure}"),
            Self::Json(e) => write!(fmt, "invalid configuration: {e}"),
            Self::TypeMismatch { key, expected } => {
                write!(fmt, "value cached under {key} is not a {expected}")
            }
            Self::TaskExists(id) => write!(fmt, "poll task {id} is already registered"),
            Self::UnknownTask(id) => write!(fmt, "poll task {id} is not registered"),
            Self::InvalidInterval(msg) => write!(fmt, "invalid poll interval: {msg}"),
            Self::SchedulerStopped => write!(fmt, "polling scheduler is shut down"),
            Self::Custom(msg) => write!(fmt, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Fetch(failure) => Some(failure),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}
