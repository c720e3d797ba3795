//! Result types returned by storage sessions and by the view.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cursor::HeapCursor;

/// Reason code carried by an [`ErrorResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The session does not support this request kind.
    NotImplemented,
    /// The request is malformed.
    IllegalArgument,
    /// Unexpected storage failure.
    Exception,
    /// A referenced feature or collection does not exist.
    NotFound,
    /// A write conflicts with the stored state.
    Conflict,
    /// The storage did not answer in time.
    Timeout,
    /// Too many concurrent tasks.
    TooManyTasks,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotImplemented => "not_implemented",
            ErrorCode::IllegalArgument => "illegal_argument",
            ErrorCode::Exception => "exception",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::Timeout => "timeout",
            ErrorCode::TooManyTasks => "too_many_tasks",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error answer from a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{reason}] {message}")]
pub struct ErrorResult {
    pub reason: ErrorCode,
    pub message: String,
}

impl ErrorResult {
    pub fn new(reason: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotImplemented, message)
    }
}

/// Successful answer: a materialized cursor over the result rows.
#[derive(Debug, Clone)]
pub struct SuccessResult<C> {
    pub cursor: HeapCursor<C>,
}

impl<C> SuccessResult<C> {
    #[must_use]
    pub fn new(rows: Vec<C>) -> Self {
        Self {
            cursor: HeapCursor::new(rows),
        }
    }
}

/// Answer of a storage session to a request.
#[derive(Debug, Clone)]
pub enum StorageResult<C> {
    Success(SuccessResult<C>),
    Error(ErrorResult),
}

impl<C> StorageResult<C> {
    /// Success result wrapping the given rows.
    #[must_use]
    pub fn success(rows: Vec<C>) -> Self {
        StorageResult::Success(SuccessResult::new(rows))
    }

    pub fn error(reason: ErrorCode, message: impl Into<String>) -> Self {
        StorageResult::Error(ErrorResult::new(reason, message))
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, StorageResult::Success(_))
    }

    /// The error answer, if this is one.
    #[must_use]
    pub fn as_error(&self) -> Option<&ErrorResult> {
        match self {
            StorageResult::Error(e) => Some(e),
            StorageResult::Success(_) => None,
        }
    }

    /// Unwraps the cursor, turning an error answer into `Err`.
    ///
    /// # Errors
    ///
    /// Returns the [`ErrorResult`] if this is an error answer.
    pub fn into_cursor(self) -> Result<HeapCursor<C>, ErrorResult> {
        match self {
            StorageResult::Success(s) => Ok(s.cursor),
            StorageResult::Error(e) => Err(e),
        }
    }

    /// Unwraps the rows, turning an error answer into `Err`.
    ///
    /// # Errors
    ///
    /// Returns the [`ErrorResult`] if this is an error answer.
    pub fn into_rows(self) -> Result<Vec<C>, ErrorResult> {
        self.into_cursor().map(HeapCursor::into_rows)
    }
}
