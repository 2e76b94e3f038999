//! Wire messages for the registry protocol.
//!
//! The registry serves each package as a [`Signed`] envelope whose payload is
//! a serialized [`Package`]. Messages are hand-annotated prost structs with
//! the field tags fixed by the protocol.

/// A signed registry payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Signed {
    /// Serialized [`Package`].
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,

    /// RSA-SHA512 signature over `payload`.
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
}

/// All releases of one package in one repository.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Package {
    #[prost(string, tag = "1")]
    pub repository: String,

    #[prost(string, tag = "2")]
    pub name: String,

    #[prost(message, repeated, tag = "3")]
    pub releases: Vec<Release>,
}

/// One release of a package.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Release {
    #[prost(string, tag = "1")]
    pub version: String,

    /// SHA-256 over the release's outer archive contents.
    #[prost(bytes = "vec", tag = "2")]
    pub inner_checksum: Vec<u8>,

    #[prost(message, repeated, tag = "3")]
    pub dependencies: Vec<Dependency>,

    #[prost(message, optional, tag = "4")]
    pub retired: Option<RetirementStatus>,
}

/// A declared dependency of a release.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Dependency {
    #[prost(string, tag = "1")]
    pub package: String,

    #[prost(string, tag = "2")]
    pub requirement: String,

    #[prost(bool, tag = "3")]
    pub optional: bool,

    /// Application alias, when it differs from the package name.
    #[prost(string, tag = "4")]
    pub app: String,

    /// Hosting repository, when it differs from the parent package's.
    #[prost(string, tag = "5")]
    pub repository: String,
}

/// Marks a release that should not be selected by new resolutions.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RetirementStatus {
    #[prost(enumeration = "RetirementReason", tag = "1")]
    pub reason: i32,

    #[prost(string, optional, tag = "2")]
    pub message: Option<String>,
}

/// Why a release was retired.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum RetirementReason {
    Other = 0,
    Invalid = 1,
    Security = 2,
    Deprecated = 3,
    Renamed = 4,
}

impl RetirementReason {
    /// Human-readable label for diagnostics.
    pub fn label(self) -> &'static str {
        match self {
            RetirementReason::Other => "other",
            RetirementReason::Invalid => "invalid",
            RetirementReason::Security => "security",
            RetirementReason::Deprecated => "deprecated",
            RetirementReason::Renamed => "renamed",
        }
    }
}
