//! Unified error handling for the scrapefleet crate
//!
//! Each subsystem owns a `thiserror` enum. This module ties them together in
//! a single [`Error`] type and classifies every failure into the taxonomy the
//! coordinator uses to decide what to surface and what to retry.
//!
//! # Architecture
//!
//! - [`FleetErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use scrapefleet::error::{Error, ErrorCategory, FleetErrorTrait};
//!
//! fn handle_error(err: Error) {
//!     match err.category() {
//!         ErrorCategory::Ingestion => mark_task_failed(err.user_message()),
//!         _ if err.is_recoverable() => retry_later(),
//!         _ => eprintln!("Fatal error: {err}"),
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::control::ControlError;
pub use crate::coordination::CoordinationError;
pub use crate::coordinator::client::ClientError;
pub use crate::ingest::{ExtractionError, IngestError};
pub use crate::lock::LockError;
pub use crate::storage::StoreError;
pub use crate::worker::RunnerError;

/// Common trait for all scrapefleet error types
pub trait FleetErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;

    /// Message suitable for a task or worker error column
    fn user_message(&self) -> String {
        self.to_string()
    }
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Lease already held or conditional update lost the race
    Contention,
    /// Malformed or empty scraper output
    Ingestion,
    /// Durable store write or read failure
    Persistence,
    /// Missed heartbeats
    Liveness,
    /// Command or lifecycle channel failure
    ControlPlane,
    /// Configuration and validation errors
    Config,
    /// HTTP and transport errors between worker and coordinator
    Network,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contention => "contention",
            Self::Ingestion => "ingestion",
            Self::Persistence => "persistence",
            Self::Liveness => "liveness",
            Self::ControlPlane => "control_plane",
            Self::Config => "config",
            Self::Network => "network",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the scrapefleet crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl FleetErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Coordination(e) => e.is_recoverable(),
            Self::Store(e) => e.is_recoverable(),
            Self::Lock(e) => e.is_recoverable(),
            Self::Ingest(e) => e.is_recoverable(),
            Self::Control(e) => e.is_recoverable(),
            Self::Client(e) => e.is_recoverable(),
            Self::Runner(e) => e.is_recoverable(),
            Self::Config(_) => false,
            Self::Io(_) => true,
            Self::Json(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Coordination(e) => e.category(),
            Self::Store(e) => e.category(),
            Self::Lock(e) => e.category(),
            Self::Ingest(e) => e.category(),
            Self::Control(e) => e.category(),
            Self::Client(e) => e.category(),
            Self::Runner(e) => e.category(),
            Self::Config(_) => ErrorCategory::Config,
            Self::Io(_) | Self::Json(_) | Self::Other { .. } => ErrorCategory::Other,
        }
    }

    fn user_message(&self) -> String {
        match self {
            Self::Ingest(e) => e.user_message(),
            Self::Other { context, .. } => context.clone(),
            other => other.to_string(),
        }
    }
}

impl Error {
    /// Create an error wrapping a source
    pub fn wrap<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result alias using the unified error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_persistence() {
        let err: Error = StoreError::Pool("down".into()).into();
        assert_eq!(err.category(), ErrorCategory::Persistence);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_ingestion_errors_are_not_recoverable() {
        let err: Error = IngestError::NoValidRecords { rejected: 3 }.into();
        assert_eq!(err.category(), ErrorCategory::Ingestion);
        assert!(!err.is_recoverable());
        assert!(err.user_message().contains("no valid records"));
    }

    #[test]
    fn test_control_plane_category() {
        let err: Error = CoordinationError::Injected("publish".into()).into();
        assert_eq!(err.category(), ErrorCategory::ControlPlane);
    }

    #[test]
    fn test_other_error_context() {
        let err = Error::wrap("loading snapshot", io::Error::new(io::ErrorKind::Other, "eof"));
        assert_eq!(err.to_string(), "loading snapshot");
        assert_eq!(err.category(), ErrorCategory::Other);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::ControlPlane.to_string(), "control_plane");
    }
}
