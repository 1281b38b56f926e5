//! VFS error types.

use std::io;

use rustix::io::Errno;
use thiserror::Error;

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A `can_*` check failed.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a regular file.
    #[error("not a file: {0}")]
    NotAFile(String),

    /// Expected a file, found a directory.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Optional operation declined by the filesystem.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Extended attribute lookup miss.
    #[error("no such attribute: {0}")]
    AttributeNotFound(String),

    /// A usage quota would be exceeded.
    #[error("no space left: {0}")]
    NoSpace(String),

    /// A length beyond what a buffered file can hold.
    #[error("file too large: {0}")]
    FileTooLarge(String),

    /// Invalid path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Invalid argument, e.g. moving a directory into itself.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The request was cancelled.
    #[error("interrupted")]
    Interrupted,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create a NotAFile error.
    pub fn not_a_file(path: impl Into<String>) -> Self {
        Self::NotAFile(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create a DirectoryNotEmpty error.
    pub fn directory_not_empty(path: impl Into<String>) -> Self {
        Self::DirectoryNotEmpty(path.into())
    }

    /// Create a NotSupported error.
    pub fn not_supported(op: impl Into<String>) -> Self {
        Self::NotSupported(op.into())
    }

    /// Create an AttributeNotFound error.
    pub fn attribute_not_found(name: impl Into<String>) -> Self {
        Self::AttributeNotFound(name.into())
    }

    /// Create a NoSpace error.
    pub fn no_space(msg: impl Into<String>) -> Self {
        Self::NoSpace(msg.into())
    }

    /// Create a FileTooLarge error.
    pub fn file_too_large(msg: impl Into<String>) -> Self {
        Self::FileTooLarge(msg.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create an InvalidArgument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// True when an optional operation was declined rather than failed.
    ///
    /// Tree helpers turn declined calls into the operation's default value.
    pub fn is_declined(&self) -> bool {
        matches!(self, VfsError::NotSupported(_))
    }

    /// The errno this error is reported as at the kernel boundary.
    pub fn errno(&self) -> Errno {
        match self {
            VfsError::NotFound(_) => Errno::NOENT,
            VfsError::AlreadyExists(_) => Errno::EXIST,
            VfsError::PermissionDenied(_) => Errno::ACCESS,
            VfsError::NotADirectory(_) => Errno::NOTDIR,
            VfsError::NotAFile(_) => Errno::INVAL,
            VfsError::IsADirectory(_) => Errno::ISDIR,
            VfsError::DirectoryNotEmpty(_) => Errno::NOTEMPTY,
            VfsError::NotSupported(_) => Errno::NOTSUP,
            VfsError::AttributeNotFound(_) => Errno::NODATA,
            VfsError::NoSpace(_) => Errno::NOSPC,
            VfsError::FileTooLarge(_) => Errno::FBIG,
            VfsError::InvalidPath(_) | VfsError::InvalidArgument(_) => Errno::INVAL,
            VfsError::Interrupted => Errno::INTR,
            VfsError::Io(e) => Errno::from_io_error(e).unwrap_or(Errno::IO),
            VfsError::Other(_) => Errno::IO,
        }
    }
}

/// Convert VfsError to std::io::Error for compatibility.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VfsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            VfsError::PermissionDenied(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            VfsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            VfsError::IsADirectory(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            VfsError::DirectoryNotEmpty(msg) => {
                io::Error::new(io::ErrorKind::DirectoryNotEmpty, msg)
            }
            VfsError::NotSupported(msg) => io::Error::new(io::ErrorKind::Unsupported, msg),
            VfsError::NoSpace(msg) => io::Error::new(io::ErrorKind::StorageFull, msg),
            VfsError::FileTooLarge(msg) => io::Error::new(io::ErrorKind::FileTooLarge, msg),
            VfsError::NotAFile(msg)
            | VfsError::InvalidPath(msg)
            | VfsError::InvalidArgument(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VfsError::Interrupted => io::Error::new(io::ErrorKind::Interrupted, "interrupted"),
            VfsError::Io(e) => e,
            e @ VfsError::AttributeNotFound(_) => io::Error::from_raw_os_error(e.errno().raw_os_error()),
            VfsError::Other(msg) => io::Error::other(msg),
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;

/// Treat a declined operation as its default value.
pub fn or_default<T>(result: VfsResult<T>, default: T) -> VfsResult<T> {
    match result {
        Err(e) if e.is_declined() => Ok(default),
        other => other,
    }
}
