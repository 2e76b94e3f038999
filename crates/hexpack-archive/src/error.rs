//! Error types for the archive codec.

/// Archive errors.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// A required outer-archive entry is absent.
    #[error("archive is missing required file: {name}")]
    MissingFile { name: String },

    /// The VERSION entry names a format this client does not support.
    #[error("unsupported archive version: {version:?}")]
    UnsupportedVersion { version: String },

    /// The recomputed digest disagrees with the CHECKSUM entry.
    #[error("archive checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// The recomputed digest disagrees with the registry's checksum.
    #[error("registry checksum mismatch: expected {expected}, got {actual}")]
    RegistryChecksumMismatch { expected: String, actual: String },

    /// An inner entry would escape the destination or is not a regular file.
    #[error("unsafe path in archive: {path}")]
    UnsafePath { path: String },

    /// A package must contain at least one file.
    #[error("package contains no files")]
    EmptyPackage,

    /// The metadata entry is not canonical term text.
    #[error("invalid package metadata: {message}")]
    InvalidMetadata { message: String },

    /// Underlying I/O failure.
    #[error("archive i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for archive operations.
pub type ArchiveResult<T> = Result<T, ArchiveError>;
