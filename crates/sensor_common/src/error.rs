//! Error types for sensor telemetry.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy shared by the store, the orchestration service and the
/// collectors.
///
/// The type is `Clone` because a single coalesced upstream outcome is handed
/// to every waiter of that call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    /// Invalid wiring at startup (zero durations, empty source lists).
    #[error("Construction error: {0}")]
    Construction(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid range: <from> {from} is after <to> {to}")]
    InvalidRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },

    /// Inspector, provider or store failure, with the chain of contexts it
    /// travelled through.
    #[error("Upstream error: {context}: {message}")]
    Upstream { context: String, message: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TelemetryError {
    pub fn construction(message: impl Into<String>) -> Self {
        Self::Construction(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn upstream(context: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Upstream {
            context: context.into(),
            message: cause.to_string(),
        }
    }

    /// Wrap this error as an upstream failure under `ctx`.
    ///
    /// Nested upstream errors keep their message and gain a context prefix.
    /// Timeouts and cancellations keep their identity so callers can still
    /// tell them apart.
    pub fn context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            Self::Upstream { context, message } => Self::Upstream {
                context: format!("{}: {}", ctx, context),
                message,
            },
            Self::Timeout(_) | Self::Cancelled => self,
            other => Self::Upstream {
                context: ctx,
                message: other.to_string(),
            },
        }
    }

    /// Caller mistakes that must never be retried.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::InvalidRange { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream { .. } | Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, TelemetryError>;
