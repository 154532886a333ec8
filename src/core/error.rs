use crate::client::Status;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Status(#[from] Status),

    #[error("Session pool exhausted: no session became available within {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("Session pool is closed")]
    PoolClosed,

    #[error("Transaction deadline exceeded after {elapsed:?} ({attempts} attempts)")]
    DeadlineExceeded {
        elapsed: Duration,
        attempts: u32,
        #[source]
        last_cause: Option<Box<Error>>,
    },

    #[error("Application error: {0}")]
    Application(#[from] anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// How the retry engine treats a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Lost a concurrency conflict; retry the whole transaction.
    Abort,
    /// The service no longer knows the session; retry on a fresh one.
    InvalidSession,
    /// Not retryable; surfaced verbatim.
    Fatal,
    /// The caller's time budget is gone.
    DeadlineExceeded,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Abort | ErrorClass::InvalidSession)
    }
}

impl Error {
    /// Classify this error for the retry engine.
    ///
    /// Application errors that wrap a service `Status` (for example a status
    /// propagated with `?` through `anyhow`) are classified as that status.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Status(status) => status.class(),
            Error::DeadlineExceeded { .. } => ErrorClass::DeadlineExceeded,
            Error::Application(err) => {
                if let Some(status) = err.downcast_ref::<Status>() {
                    status.class()
                } else if let Some(inner) = err.downcast_ref::<Error>() {
                    inner.class()
                } else {
                    ErrorClass::Fatal
                }
            }
            Error::PoolExhausted { .. } | Error::PoolClosed | Error::Config(_) => {
                ErrorClass::Fatal
            }
        }
    }

    /// The underlying service status, if any
    pub fn status(&self) -> Option<&Status> {
        match self {
            Error::Status(status) => Some(status),
            Error::Application(err) => err
                .downcast_ref::<Status>()
                .or_else(|| err.downcast_ref::<Error>().and_then(Error::status)),
            _ => None,
        }
    }

    /// Minimum delay the service asked for before retrying
    pub fn retry_delay(&self) -> Option<Duration> {
        self.status().and_then(|status| status.retry_delay)
    }

    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Error::PoolExhausted { .. })
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Error::DeadlineExceeded { .. })
    }

    /// Last retryable error seen before the deadline ran out
    pub fn last_cause(&self) -> Option<&Error> {
        match self {
            Error::DeadlineExceeded { last_cause, .. } => last_cause.as_deref(),
            _ => None,
        }
    }
}
