//! Error types for version and requirement parsing.

/// Version parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    /// Malformed semantic version text.
    #[error("invalid version: {input:?}")]
    InvalidVersion { input: String },

    /// Malformed requirement text.
    #[error("invalid requirement: {input:?}")]
    InvalidRequirement { input: String },
}

/// Result type for version operations.
pub type VersionResult<T> = Result<T, VersionError>;
