use std::path::PathBuf;

use thiserror::Error;

/// The primary error type for all operations in the `repack` crate.
#[derive(Debug, Error)]
pub enum ArchiverError {
    /// A source or archive path given to `pack`/`unpack` does not exist.
    #[error("path '{}' does not exist", .0.display())]
    PathNotFound(PathBuf),

    /// The packing source exists but is not a directory.
    #[error("'{}' is not a directory", .0.display())]
    NotADirectory(PathBuf),

    /// The archive to unpack is a directory.
    #[error("'{}' is a directory", .0.display())]
    IsADirectory(PathBuf),

    /// The destination of a pack or unpack already exists.
    #[error("destination '{}' already exists", .0.display())]
    AlreadyExists(PathBuf),

    /// A payload writer was opened twice without being closed in between.
    #[error("payload output is already open")]
    AlreadyOpen,

    /// An I/O error occurred, typically while reading or writing a file.
    /// Includes the path where the error happened, if known.
    #[error("I/O error on path '{}': {source}", .path.display())]
    Io { source: std::io::Error, path: PathBuf },

    /// The trailer or compressed header could not be located, read or decoded.
    #[error("corrupt archive header: {0}")]
    CorruptHeader(String),

    /// The decompressed header bytes do not follow the record layout.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// The payload stream ended with a different byte count than the header declares.
    #[error("truncated payload: expected {expected} bytes, read {actual}")]
    TruncatedPayload { expected: u64, actual: u64 },

    /// The payload reader ran out of bytes in the middle of a blob.
    #[error("short read: requested {requested} bytes, only {available} available")]
    ShortRead { requested: u64, available: u64 },

    /// A tree mutator was called with an unusable name or path.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Reading a source container or writing a rebuilt one failed.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// A value does not fit the fixed-width fields of the archive format.
    #[error("too large for the archive format: {0}")]
    TooLarge(String),
}

impl ArchiverError {
    /// Wraps an I/O error together with the path it happened on.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ArchiverError::Io { source, path: path.into() }
    }
}

// Generic IO error conversion that doesn't require a path
impl From<std::io::Error> for ArchiverError {
    fn from(err: std::io::Error) -> Self {
        ArchiverError::Io { source: err, path: PathBuf::new() }
    }
}

impl From<xz2::stream::Error> for ArchiverError {
    fn from(err: xz2::stream::Error) -> Self {
        ArchiverError::Io { source: err.into(), path: PathBuf::new() }
    }
}

impl From<serde_json::Error> for ArchiverError {
    fn from(err: serde_json::Error) -> Self {
        ArchiverError::Io { source: err.into(), path: PathBuf::new() }
    }
}
