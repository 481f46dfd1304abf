use crate::path_safety::PathError;

/// Failures of distribution operations, one variant per way a caller must
/// react to them.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// A required parameter is missing or empty.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The requested path would resolve outside the file root.
    #[error("path violation: {0}")]
    PathViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Filesystem or scan failure; fatal to the operation.
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl From<PathError> for ServiceError {
    fn from(e: PathError) -> Self {
        match e {
            PathError::Violation { .. } => ServiceError::PathViolation(e.to_string()),
            PathError::Io { .. } => ServiceError::Io(anyhow::Error::new(e)),
        }
    }
}
