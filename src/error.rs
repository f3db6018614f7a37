//! Error types for data collector operations

use thiserror::Error;

/// Main error type for data collector operations
#[derive(Error, Debug)]
pub enum DcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid container format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported container version: {0}.{1}")]
    UnsupportedVersion(u16, u16),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Inconsistent file-set: {0}")]
    InconsistentFileset(String),

    #[error("Topology mismatch: {0}")]
    TopologyMismatch(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Access not permitted: {0}")]
    NotPermitted(String),

    #[error("Collective inconsistency: {0}")]
    CollectiveInconsistency(String),
}

/// Coarse classification of a [`DcError`].
///
/// Back-end details (format, codec and serialization failures) all classify
/// as [`ErrorKind::Io`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    ShapeMismatch,
    TypeMismatch,
    InconsistentFileset,
    TopologyMismatch,
    UnsupportedOperation,
    Io,
    CollectiveInconsistency,
}

impl DcError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            DcError::Io(_)
            | DcError::InvalidFormat(_)
            | DcError::UnsupportedVersion(..)
            | DcError::Compression(_)
            | DcError::Decompression(_)
            | DcError::Serialization(_) => ErrorKind::Io,
            DcError::InvalidArgument(_) | DcError::Configuration(_) => ErrorKind::InvalidArgument,
            DcError::NotFound(_) => ErrorKind::NotFound,
            DcError::ShapeMismatch(_) => ErrorKind::ShapeMismatch,
            DcError::TypeMismatch(_) => ErrorKind::TypeMismatch,
            DcError::InconsistentFileset(_) => ErrorKind::InconsistentFileset,
            DcError::TopologyMismatch(_) => ErrorKind::TopologyMismatch,
            DcError::Unsupported(_) | DcError::NotPermitted(_) => ErrorKind::UnsupportedOperation,
            DcError::CollectiveInconsistency(_) => ErrorKind::CollectiveInconsistency,
        }
    }
}

/// Specialized Result type for data collector operations
pub type Result<T> = std::result::Result<T, DcError>;

impl From<bincode::Error> for DcError {
    fn from(err: bincode::Error) -> Self {
        DcError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for DcError {
    fn from(err: serde_json::Error) -> Self {
        DcError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_errors_are_io() {
        assert_eq!(DcError::InvalidFormat("x".into()).kind(), ErrorKind::Io);
        assert_eq!(DcError::Decompression("x".into()).kind(), ErrorKind::Io);
        assert_eq!(DcError::UnsupportedVersion(9, 0).kind(), ErrorKind::Io);
    }

    #[test]
    fn test_access_violation_is_unsupported() {
        let err = DcError::NotPermitted("remove in read mode".into());
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert!(err.to_string().contains("remove in read mode"));
    }
}
