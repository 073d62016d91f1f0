// FSAL Errors
//
// Every failure that crosses the store boundary is expressed as an FsalError.
// Store-specific error types never leave the backend modules.

use std::io;
use thiserror::Error;

/// Errors produced by the filesystem abstraction layer
#[derive(Debug, Error)]
pub enum FsalError {
    /// Path is malformed (empty, empty segment, NUL byte)
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// An entry (or an intermediate directory) does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Traversal went through something that is not a directory
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// A file operation was attempted on a directory
    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The backing store lacks the capability the call needs
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// No store of the requested kind was configured
    #[error("Backend not configured: {0}")]
    NotConfigured(String),

    #[error("IO error on {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl FsalError {
    /// Wrap a backing-store I/O error with the operation it came from
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        let context = context.into();
        match source.kind() {
            io::ErrorKind::NotFound => FsalError::NotFound(context),
            io::ErrorKind::PermissionDenied => FsalError::PermissionDenied(context),
            io::ErrorKind::AlreadyExists => FsalError::AlreadyExists(context),
            _ => FsalError::Io { context, source },
        }
    }
}

/// Result alias used throughout the FSAL
pub type Result<T> = std::result::Result<T, FsalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_kind_mapping() {
        let err = FsalError::io("open /a", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, FsalError::NotFound(ref c) if c == "open /a"));

        let err = FsalError::io("open /b", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, FsalError::PermissionDenied(_)));

        let err = FsalError::io("write /c", io::Error::other("disk on fire"));
        assert!(matches!(err, FsalError::Io { .. }));
        assert!(err.to_string().contains("disk on fire"));
    }
}
