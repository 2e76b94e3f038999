//! Domain types decoded from the registry protocol.

use hexpack_version::{Requirement, Version};

/// Outcome of a conditional package fetch.
#[derive(Debug, Clone)]
pub enum PackageOutcome {
    /// The server's copy matches the etag we sent.
    NotModified,

    /// A fresh signed envelope.
    Fresh {
        /// Raw envelope bytes, still to be verified.
        body: Vec<u8>,
        /// New etag for the next conditional request.
        etag: Option<String>,
    },
}

/// One release of a package, decoded and verified.
#[derive(Debug, Clone)]
pub struct Release {
    /// Release version.
    pub version: Version,

    /// SHA-256 checksum of the release's outer archive.
    pub checksum: Vec<u8>,

    /// Declared dependencies, in registry order.
    pub dependencies: Vec<DependencyDecl>,

    /// Build-tool managers able to build this release.
    pub managers: Vec<String>,

    /// Retirement marker, when the release should not be newly selected.
    pub retired: Option<Retirement>,
}

impl Release {
    /// The checksum as lowercase hex.
    pub fn checksum_hex(&self) -> String {
        hex::encode(&self.checksum)
    }
}

/// A dependency declared by a release.
#[derive(Debug, Clone)]
pub struct DependencyDecl {
    /// Hosting repository; `None` inherits the parent package's repository.
    pub repo: Option<String>,

    /// Package name.
    pub name: String,

    /// Version requirement; `None` matches any version.
    pub requirement: Option<Requirement>,

    /// Optional dependencies only constrain when pulled in by another path.
    pub optional: bool,

    /// Application alias; `None` when it equals the package name.
    pub app: Option<String>,
}

impl DependencyDecl {
    /// The application alias, defaulting to the package name.
    pub fn app_name(&self) -> &str {
        self.app.as_deref().unwrap_or(&self.name)
    }
}

/// Retirement marker for a release.
#[derive(Debug, Clone)]
pub struct Retirement {
    /// Reason label, e.g. `security`.
    pub reason: String,

    /// Free-form elaboration from the publisher.
    pub message: Option<String>,
}
