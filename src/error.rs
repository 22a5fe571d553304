//! Error types used by the eventvisor runtime.
//!
//! This module defines two main error enums:
//!
//! - [`RepeatError`] — control-flow errors for repeat loops (deliberate abort vs. transient failure).
//! - [`BusError`] — errors raised by eventbus operations (connect, declare, publish, dispatch).
//!
//! Both types provide helper methods (`as_label`) for logging, and [`BusError`]
//! additionally exposes [`BusError::is_retryable`] for the publish retry policy.

use std::time::Duration;
use thiserror::Error;

/// # Errors produced by a repeat loop body.
///
/// Returned from [`Repeat::prepare`](crate::Repeat::prepare) and
/// [`Repeat::run`](crate::Repeat::run) to steer the outer loop:
/// a deliberate abort stops the loop silently, any other failure is
/// logged once per streak and the loop continues.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RepeatError {
    /// Deliberate, permanent stop. The loop exits without an error log.
    #[error("repeat cancelled")]
    Cancelled,

    /// Transient failure. The loop logs the first failure of a streak and keeps going.
    #[error("repeat iteration failed: {error}")]
    Failed {
        /// The underlying error message.
        error: String,
    },
}

impl RepeatError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use eventvisor::RepeatError;
    ///
    /// assert_eq!(RepeatError::Cancelled.as_label(), "repeat_cancelled");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RepeatError::Cancelled => "repeat_cancelled",
            RepeatError::Failed { .. } => "repeat_failed",
        }
    }

    /// Shorthand for a [`RepeatError::Failed`] with the given message.
    pub fn failed(error: impl Into<String>) -> Self {
        RepeatError::Failed {
            error: error.into(),
        }
    }
}

impl From<BusError> for RepeatError {
    fn from(err: BusError) -> Self {
        RepeatError::Failed {
            error: err.to_string(),
        }
    }
}

/// # Errors produced by eventbus operations.
///
/// These cover the whole broker interaction surface:
/// - [`BusError::Connection`] — broker unreachable or transport closed.
/// - [`BusError::Timeout`] — a single broker interaction exceeded its bound.
/// - [`BusError::Protocol`] — the broker rejected an operation (e.g. exchange type mismatch).
/// - [`BusError::Callback`] — a listener callback failed; always isolated, never propagated.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BusError {
    /// Broker unreachable, or the transport dropped mid-operation.
    #[error("connection error: {reason}")]
    Connection {
        /// Human-readable failure description.
        reason: String,
    },

    /// An interaction with the broker exceeded its bound.
    #[error("timed out after {timeout:?}")]
    Timeout {
        /// The timeout that was exceeded.
        timeout: Duration,
    },

    /// The broker rejected an operation outright. Not retryable.
    #[error("protocol error: {reason}")]
    Protocol {
        /// Rejection reason as reported by the broker.
        reason: String,
    },

    /// A listener callback returned an error. Logged and dropped at the dispatch site.
    #[error("callback error: {reason}")]
    Callback {
        /// The callback's error message.
        reason: String,
    },
}

impl BusError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use eventvisor::BusError;
    ///
    /// let err = BusError::connection("refused");
    /// assert_eq!(err.as_label(), "bus_connection");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            BusError::Connection { .. } => "bus_connection",
            BusError::Timeout { .. } => "bus_timeout",
            BusError::Protocol { .. } => "bus_protocol",
            BusError::Callback { .. } => "bus_callback",
        }
    }

    /// Indicates whether the operation is safe to retry on the same or a fresh connection.
    ///
    /// Returns `true` for [`BusError::Connection`] and [`BusError::Timeout`].
    /// Protocol rejections are deterministic; retrying them cannot help.
    ///
    /// # Example
    /// ```
    /// use std::time::Duration;
    /// use eventvisor::BusError;
    ///
    /// assert!(BusError::connection("reset").is_retryable());
    /// assert!(BusError::Timeout { timeout: Duration::from_secs(5) }.is_retryable());
    /// assert!(!BusError::protocol("exchange type mismatch").is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(self, BusError::Connection { .. } | BusError::Timeout { .. })
    }

    /// Shorthand for a [`BusError::Connection`].
    pub fn connection(reason: impl Into<String>) -> Self {
        BusError::Connection {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`BusError::Protocol`].
    pub fn protocol(reason: impl Into<String>) -> Self {
        BusError::Protocol {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`BusError::Callback`].
    pub fn callback(reason: impl Into<String>) -> Self {
        BusError::Callback {
            reason: reason.into(),
        }
    }
}
