use std::io;

use thiserror::Error;

/// A Result type alias over [`FsError`] to minimise repetition.
pub type Result<T> = std::result::Result<T, FsError>;

/// Failures surfaced by the filesystem core.
///
/// Every error translates to exactly one of four errno values via
/// [`FsError::errno`]: `ENOENT`, `EACCES`, `EINVAL`, or `EIO`.
#[derive(Debug, Error)]
pub enum FsError {
    /// A backing path, archive entry, or child name does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The backing store denied access.
    #[error("permission denied: {0}")]
    Permission(String),
    /// An archive, entry, or reader could not be constructed.
    #[error("invalid: {0}")]
    Invalid(String),
    /// A read, seek, or discard failed after opening.
    #[error("i/o error: {0}")]
    Io(#[source] io::Error),
    /// The operation observed a cancellation signal.
    #[error("operation aborted")]
    Aborted,
    /// An entry reader was asked to move backward but its stream does not
    /// support seeking. Recoverable by reopening the entry.
    #[error("rewind requested on a non-seekable entry stream")]
    NonSeekableRewind,
    /// A reference was released against an archive reader that had already
    /// dropped to zero references.
    #[error("archive reader is already closed")]
    AlreadyClosed,
}

impl FsError {
    /// The errno to hand back to the transport.
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::Permission(_) => libc::EACCES,
            FsError::Invalid(_) => libc::EINVAL,
            FsError::Io(_)
            | FsError::Aborted
            | FsError::NonSeekableRewind
            | FsError::AlreadyClosed => libc::EIO,
        }
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> FsError {
        match err.kind() {
            io::ErrorKind::NotFound => FsError::NotFound(err.to_string()),
            io::ErrorKind::PermissionDenied => FsError::Permission(err.to_string()),
            _ => FsError::Io(err),
        }
    }
}

impl From<zip::result::ZipError> for FsError {
    fn from(err: zip::result::ZipError) -> FsError {
        match err {
            zip::result::ZipError::Io(err) => err.into(),
            zip::result::ZipError::FileNotFound => {
                FsError::NotFound("entry not found in archive".to_owned())
            }
            other => FsError::Invalid(other.to_string()),
        }
    }
}
