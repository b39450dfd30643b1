//! Error taxonomy for the task-execution core.
//!
//! Three families, never mixed:
//! - [`ClusterError`]: outcomes of control-plane CRUD calls, classified the
//!   way the lifecycle manager branches on them.
//! - [`BackoffError`]: control-flow signals from the backoff layer; shapes
//!   retry cadence only and never reaches an end user.
//! - [`StoreError`]: workflow-store outcomes, including the staleness and
//!   termination signals the scheduler consumes to skip a pass.
//!
//! Fatal paths are `anyhow::Error` with the upstream reason code attached as
//! context.

use chrono::{DateTime, Utc};

/// Classified failure from a control-plane CRUD call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object gone: {0}")]
    Gone(String),
    #[error("resource version expired: {0}")]
    Expired(String),
    #[error("object already exists: {0}")]
    AlreadyExists(String),
    #[error("forbidden: {message}")]
    Forbidden { message: String },
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("request entity too large: {0}")]
    TooLarge(String),
    #[error("{reason}: {message}")]
    Api { reason: String, message: String },
}

impl ClusterError {
    /// Not-found, gone and version-expired all mean the object is no longer
    /// observable; callers treat them identically.
    pub fn is_not_exists(&self) -> bool {
        matches!(
            self,
            ClusterError::NotFound(_) | ClusterError::Gone(_) | ClusterError::Expired(_)
        )
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists(_))
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, ClusterError::Forbidden { .. })
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, ClusterError::Invalid(_) | ClusterError::BadRequest(_))
    }

    pub fn is_too_large(&self) -> bool {
        matches!(self, ClusterError::TooLarge(_))
    }

    /// Upstream reason code, used to annotate fatal errors for operators.
    pub fn reason(&self) -> &'static str {
        match self {
            ClusterError::NotFound(_) => "NotFound",
            ClusterError::Gone(_) => "Gone",
            ClusterError::Expired(_) => "Expired",
            ClusterError::AlreadyExists(_) => "AlreadyExists",
            ClusterError::Forbidden { .. } => "Forbidden",
            ClusterError::Invalid(_) => "Invalid",
            ClusterError::BadRequest(_) => "BadRequest",
            ClusterError::TooLarge(_) => "RequestEntityTooLarge",
            ClusterError::Api { .. } => "ApiError",
        }
    }
}

/// Control-flow result of routing an operation through a backoff handler.
#[derive(Debug, thiserror::Error)]
pub enum BackoffError {
    /// The operation was attempted and failed; the window has grown.
    #[error("operation failed, backing off: {source}")]
    Rejected {
        #[source]
        source: ClusterError,
    },
    /// The window is active and the request exceeds a resource ceiling; the
    /// operation was never invoked.
    #[error("backoff active until {next_eligible}, request exceeds resource ceiling")]
    Blocked { next_eligible: DateTime<Utc> },
}

impl BackoffError {
    /// The underlying cluster failure, when the operation actually ran.
    pub fn cluster_error(&self) -> Option<&ClusterError> {
        match self {
            BackoffError::Rejected { source } => Some(source),
            BackoffError::Blocked { .. } => None,
        }
    }
}

/// Outcome of a workflow-store call.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The workflow is known terminated; skip this pass.
    #[error("workflow terminated")]
    Terminated,
    /// The stored version token matches the last-accepted one; no new data.
    #[error("workflow is stale, no new data")]
    Stale,
    #[error("workflow not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// True for the signals the scheduler consumes to skip a reconciliation
    /// pass rather than surface a failure.
    pub fn is_skip_signal(&self) -> bool {
        matches!(self, StoreError::Terminated | StoreError::Stale)
    }
}
