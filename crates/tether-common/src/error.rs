//! Error types for the Tether syncer
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the resource or target it concerns, and [`Error::kind`]
//! maps every error onto the taxonomy the synchronizer and lifecycle manager
//! use to decide between retrying, degrading and surfacing a condition.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Error categories driving retry and escalation decisions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network failure or timeout talking to either side; retried forever
    TransientConnectivity,
    /// Write rejected because the remote resource version moved
    OptimisticConflict,
    /// Object rejected by the receiving side's admission or schema rules
    Validation,
    /// Object does not exist
    NotFound,
    /// Termination cleanup step failed; blocks finalizer removal
    LifecycleCleanup,
    /// Anything else (RBAC, serialization, programming errors)
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransientConnectivity => write!(f, "transient_connectivity"),
            Self::OptimisticConflict => write!(f, "optimistic_conflict"),
            Self::Validation => write!(f, "validation"),
            Self::NotFound => write!(f, "not_found"),
            Self::LifecycleCleanup => write!(f, "lifecycle_cleanup"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Main error type for Tether operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Object or spec failed validation
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource (or SyncTarget) with invalid content
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.workspace")
        field: Option<String>,
    },

    /// Optimistic-concurrency precondition failed
    #[error("conflict writing {resource}: {message}")]
    Conflict {
        /// Resource whose write was rejected
        resource: String,
        /// Description of the conflict
        message: String,
    },

    /// Connectivity failure or timeout
    #[error("connectivity error [{target}]: {message}")]
    Connectivity {
        /// Which side or endpoint was unreachable (e.g., "physical", "logical")
        target: String,
        /// Description of what failed
        message: String,
    },

    /// Object not found
    #[error("{resource} not found")]
    NotFound {
        /// Resource that was looked up
        resource: String,
    },

    /// Termination cleanup step failed
    #[error("cleanup error for {target} during {step}: {message}")]
    Cleanup {
        /// SyncTarget being terminated
        target: String,
        /// Cleanup step that failed (e.g., "agent-teardown", "object-cleanup")
        step: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Configuration error
    #[error("configuration error: {message}")]
    Config {
        /// Description of the invalid configuration
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "synchronizer", "discovery")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an optimistic-concurrency conflict error
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a connectivity error for the given side
    pub fn connectivity(target: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Connectivity {
            target: target.into(),
            message: msg.into(),
        }
    }

    /// Create a connectivity error for a remote call that exceeded its deadline
    pub fn timeout(target: impl Into<String>, operation: &str, after: Duration) -> Self {
        Self::Connectivity {
            target: target.into(),
            message: format!("{} timed out after {}s", operation, after.as_secs()),
        }
    }

    /// Create a not-found error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a cleanup error for a termination step
    pub fn cleanup(
        target: impl Into<String>,
        step: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Cleanup {
            target: target.into(),
            step: step.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify this error into the syncer's error taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => match ae.code {
                    409 => ErrorKind::OptimisticConflict,
                    400 | 422 => ErrorKind::Validation,
                    404 | 410 => ErrorKind::NotFound,
                    408 | 429 | 500..=599 => ErrorKind::TransientConnectivity,
                    _ => ErrorKind::Internal,
                },
                kube::Error::SerdeError(_) => ErrorKind::Internal,
                // Transport, TLS, and connection-level failures
                _ => ErrorKind::TransientConnectivity,
            },
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Conflict { .. } => ErrorKind::OptimisticConflict,
            Error::Connectivity { .. } => ErrorKind::TransientConnectivity,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Cleanup { .. } => ErrorKind::LifecycleCleanup,
            Error::Serialization { .. } => ErrorKind::Internal,
            Error::Config { .. } => ErrorKind::Validation,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation errors require an operator or spec fix and are not retried.
    pub fn is_retryable(&self) -> bool {
        self.kind() != ErrorKind::Validation
    }

    /// Check if this is an optimistic-concurrency conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::OptimisticConflict
    }

    /// Check if this is a not-found error (HTTP 404)
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Get the resource name if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. } => Some(resource),
            Error::Conflict { resource, .. } => Some(resource),
            Error::NotFound { resource } => Some(resource),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Cleanup { step, .. } => Some(step),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
