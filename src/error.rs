// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Error taxonomy for the scheduler.

use thiserror::Error;

/// Errors surfaced by the scheduler's public API and its parsers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    /// A scheduling call was given a bad option or spec.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of what was wrong.
        message: String,
    },

    /// A duration string did not match the duration grammar.
    #[error("invalid duration {input:?}: {reason}")]
    InvalidDuration {
        /// The offending input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A cron expression did not parse, or could never fire.
    #[error("invalid cron expression {input:?}: {reason}")]
    InvalidCron {
        /// The offending input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An absolute-time string did not match the accepted grammar.
    #[error("invalid time string {input:?}: {reason}")]
    InvalidTimeString {
        /// The offending input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A job id was not present in the scheduler.
    #[error("job not found: {0}")]
    NotFound(String),

    /// A running job's execution exceeded its timeout and was interrupted.
    #[error("job timed out")]
    TimeoutError,

    /// A user callable returned or panicked with an error.
    #[error("callback error: {0}")]
    CallbackError(String),
}

impl SchedulerError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_duration(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDuration {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_cron(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCron {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_time_string(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTimeString {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SchedulerError>;
