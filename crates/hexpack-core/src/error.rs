//! Error taxonomy for the client core.

use hexpack_archive::ArchiveError;
use hexpack_version::VersionError;

/// A requirement that participated in a resolution failure, with the path
/// that introduced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRequirement {
    /// Rendered requirement, e.g. `~> 1.0`.
    pub requirement: String,

    /// Breadcrumb naming where the requirement came from.
    pub from: String,
}

fn render_conflict(requirements: &[FailedRequirement]) -> String {
    requirements
        .iter()
        .map(|r| format!("{} (from {})", r.requirement, r.from))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed version or requirement text.
    #[error(transparent)]
    Version(#[from] VersionError),

    /// Archive format or integrity failure.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Registry envelope signature failed verification.
    #[error("registry signature verification failed for repo {repo}")]
    BadSignature { repo: String },

    /// Registry payload names a different repository or package.
    #[error("registry origin mismatch: expected {expected_repo}/{expected_name}, got {found_repo}/{found_name}")]
    OriginMismatch {
        expected_repo: String,
        expected_name: String,
        found_repo: String,
        found_name: String,
    },

    /// Protobuf payload failed to decode.
    #[error("failed to decode registry payload: {message}")]
    WireDecode { message: String },

    /// Network failure the client retries.
    #[error("transient http error: {message}")]
    HttpTransient { message: String },

    /// Network failure the client does not retry.
    #[error("http error {status}: {message}")]
    HttpPermanent { status: u16, message: String },

    /// The solver exhausted every candidate for a package.
    #[error("unable to resolve {name}: conflicting requirements: {}", render_conflict(.requirements))]
    ResolutionConflict {
        name: String,
        requirements: Vec<FailedRequirement>,
    },

    /// The same package name was demanded from different repositories.
    #[error("package {name} required from conflicting repos: {}", .repos.join(", "))]
    RepoConflict { name: String, repos: Vec<String> },

    /// A locked checksum disagrees with the registry.
    #[error("lock checksum for {name} {version} disagrees with registry: locked {locked}, registry {registry}")]
    LockMismatch {
        name: String,
        version: String,
        locked: String,
        registry: String,
    },

    /// Cache miss while the offline flag is set.
    #[error("package {repo}/{name} not in cache and offline mode is enabled")]
    OfflineMissing { repo: String, name: String },

    /// The operation was cancelled before completing.
    #[error("operation cancelled")]
    Cancelled,

    /// A deduplicated fetch failed; the original error went to another waiter.
    #[error("fetch failed: {message}")]
    Fetch { message: String },

    /// Lockfile read or parse failure.
    #[error("lockfile error: {message}")]
    Lockfile { message: String },

    /// Configuration failure.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the repository client's retry policy applies.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::HttpTransient { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        // Connection-level failures are transient by definition; anything with
        // a status has already been mapped by the http layer.
        Self::HttpTransient {
            message: err.to_string(),
        }
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Self::WireDecode {
            message: err.to_string(),
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
