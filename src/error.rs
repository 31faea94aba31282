//! Error taxonomy shared by the coordinator, the router and the data plane.

use thiserror::Error;

/// Why a conflict was reported. Both kinds are retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// The observed document version is no longer the live one (409)
    Version,
    /// The data plane reported a transient lock, e.g. concurrent DDL (423)
    Lock,
}

#[derive(Debug, Error)]
pub enum SyncError {
    // ========== Retryable ==========
    /// Version mismatch or transient lock
    #[error("{message}")]
    Conflict { kind: ConflictKind, message: String },

    /// Data plane unreachable or timed out
    #[error("connectivity error: {0}")]
    Connectivity(String),

    // ========== Fatal ==========
    /// Missing required field, malformed foreign key target, bad document
    #[error("validation error: {0}")]
    Validation(String),

    /// Tenant or role lacks the rights for this operation
    #[error("permission denied: {0}")]
    Permission(String),

    /// DeploymentConfig exists but its endpoint or credential is unusable
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Change-feed payload could not be interpreted
    #[error("malformed feed payload: {0}")]
    MalformedPayload(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Message surfaced once the conflict retry budget is exhausted.
pub const MODIFIED_BY_ANOTHER_USER: &str =
    "The schema was modified by another user. Refresh and retry your change.";

impl SyncError {
    pub fn version_conflict(message: impl Into<String>) -> Self {
        SyncError::Conflict {
            kind: ConflictKind::Version,
            message: message.into(),
        }
    }

    pub fn lock_conflict(message: impl Into<String>) -> Self {
        SyncError::Conflict {
            kind: ConflictKind::Lock,
            message: message.into(),
        }
    }

    /// Conflicts and connectivity failures count against the retry budget;
    /// everything else is surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Conflict { .. } | SyncError::Connectivity(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict { .. })
    }

    /// HTTP-style status hint carried in apply responses.
    pub fn status_hint(&self) -> u16 {
        match self {
            SyncError::Conflict {
                kind: ConflictKind::Version,
                ..
            } => 409,
            SyncError::Conflict {
                kind: ConflictKind::Lock,
                ..
            } => 423,
            SyncError::Connectivity(_) => 503,
            SyncError::Validation(_) | SyncError::MalformedPayload(_) => 400,
            SyncError::Permission(_) => 403,
            SyncError::NotFound(_) => 404,
            SyncError::Configuration(_) | SyncError::Internal(_) => 500,
        }
    }

    /// Rebuild an error from a status hint returned by a remote apply endpoint.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            409 => SyncError::version_conflict(message),
            423 => SyncError::lock_conflict(message),
            502..=504 => SyncError::Connectivity(message),
            400 | 422 => SyncError::Validation(message),
            401 | 403 => SyncError::Permission(message),
            404 => SyncError::NotFound(message),
            _ => SyncError::Internal(anyhow::anyhow!(message)),
        }
    }

    /// Classify a control-plane store failure. Store errors carrying a sqlx
    /// error (possibly under context) keep its category, so a pool timeout
    /// stays a retryable connectivity error.
    pub fn from_store(err: anyhow::Error) -> Self {
        match err.downcast::<sqlx::Error>() {
            Ok(err) => SyncError::from(err),
            Err(err) => SyncError::Internal(err),
        }
    }
}

/// Classify a sqlx failure coming back from the data plane.
impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => SyncError::Connectivity(err.to_string()),
            sqlx::Error::Tls(_) | sqlx::Error::Configuration(_) => {
                SyncError::Configuration(err.to_string())
            }
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // lock_not_available, deadlock_detected, serialization_failure
                Some("55P03") | Some("40P01") | Some("40001") => {
                    SyncError::lock_conflict(db.message().to_string())
                }
                // invalid_password, invalid_authorization_specification
                Some("28P01") | Some("28000") => SyncError::Configuration(db.message().to_string()),
                Some(code) if code.starts_with("42") || code.starts_with("23") => {
                    SyncError::Validation(db.message().to_string())
                }
                _ => SyncError::Internal(anyhow::Error::new(err)),
            },
            _ => SyncError::Internal(anyhow::Error::new(err)),
        }
    }
}
