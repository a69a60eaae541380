//! The error taxonomy shared by every layer of the stack.
//!
//! Plugins return these directly; the dispatcher normalises whatever else
//! leaks through into one of the closed set of kinds below, and the FUSE
//! adapter maps kinds onto errnos.

use thiserror::Error;

/// Wire-level tag for a [`VfsError`].
///
/// This is the closed set of error categories the protocol speaks. Every
/// error carries exactly one kind plus a free-form message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    IsADirectory,
    NotADirectory,
    PermissionDenied,
    ReadOnly,
    InvalidArgument,
    NotSupported,
    CapacityExceeded,
    LeaseExpired,
    SymlinkLoop,
    Io,
    Other,
}

impl ErrorKind {
    /// The kind tag as it appears on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not-found",
            Self::AlreadyExists => "already-exists",
            Self::IsADirectory => "is-directory",
            Self::NotADirectory => "not-directory",
            Self::PermissionDenied => "permission-denied",
            Self::ReadOnly => "read-only",
            Self::InvalidArgument => "invalid-argument",
            Self::NotSupported => "not-supported",
            Self::CapacityExceeded => "capacity-exceeded",
            Self::LeaseExpired => "lease-expired",
            Self::SymlinkLoop => "symlink-loop",
            Self::Io => "io",
            Self::Other => "other",
        }
    }
}

/// Error type for every filesystem operation.
#[derive(Debug, Error)]
pub enum VfsError {
    /// File or directory not found. Also returned for unknown or expired
    /// handle ids.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Expected a file, found a directory.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Permission denied (includes chroot escapes).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The backend is read-only.
    #[error("read-only filesystem: {0}")]
    ReadOnly(String),

    /// Malformed path, flag combination, or argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The plugin does not implement this operation. Callers may fall back.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The handle table is at capacity.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The handle's lease has lapsed.
    #[error("lease expired: {0}")]
    LeaseExpired(String),

    /// Symlink chain exceeded the resolution depth limit.
    #[error("symlink loop: {0}")]
    SymlinkLoop(String),

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[source] std::io::Error),

    /// Anything that fits no other category.
    #[error("{0}")]
    Other(String),
}

impl VfsError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn read_only(path: impl Into<String>) -> Self {
        Self::ReadOnly(path.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_supported(op: impl Into<String>) -> Self {
        Self::NotSupported(op.into())
    }

    pub fn capacity_exceeded(msg: impl Into<String>) -> Self {
        Self::CapacityExceeded(msg.into())
    }

    pub fn symlink_loop(path: impl Into<String>) -> Self {
        Self::SymlinkLoop(path.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// The wire-level kind tag for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::IsADirectory(_) => ErrorKind::IsADirectory,
            Self::NotADirectory(_) => ErrorKind::NotADirectory,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::ReadOnly(_) => ErrorKind::ReadOnly,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            Self::LeaseExpired(_) => ErrorKind::LeaseExpired,
            Self::SymlinkLoop(_) => ErrorKind::SymlinkLoop,
            Self::Io(_) => ErrorKind::Io,
            Self::Other(_) => ErrorKind::Other,
        }
    }
}

/// Recognise the standard I/O categories; everything else stays `Io`.
impl From<std::io::Error> for VfsError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as K;
        match e.kind() {
            K::NotFound => Self::NotFound(e.to_string()),
            K::AlreadyExists => Self::AlreadyExists(e.to_string()),
            K::PermissionDenied => Self::PermissionDenied(e.to_string()),
            K::InvalidInput => Self::InvalidArgument(e.to_string()),
            _ => Self::Io(e),
        }
    }
}

/// Result alias used throughout the crate.
pub type VfsResult<T> = Result<T, VfsError>;
