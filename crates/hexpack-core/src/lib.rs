//! Package-manager client core.
//!
//! This crate implements the registry-facing core of the hexpack client:
//!
//! - Signed registry fetch and verification (RSA-SHA512 envelopes over
//!   protobuf payloads)
//! - A per-process registry store with envelope persistence
//! - Backtracking version resolution with overrides, optional edges and
//!   lockfile pinning
//! - Bounded, deduplicated tarball fetching with checksum verification
//! - Canonical lockfile serialization
//!
//! # Quick Start
//!
//! ```no_run
//! use hexpack_core::{Config, DependencyNode, Session};
//! use hexpack_version::Requirement;
//!
//! # async fn example() -> hexpack_core::Result<()> {
//! let session = Session::new(Config::from_env())?;
//! let tree = vec![
//!     DependencyNode::new("plug").with_requirement("~> 1.10".parse().unwrap()),
//! ];
//! let resolution = session
//!     .converge(&tree, "mix.lock".as_ref(), &Default::default())
//!     .await?;
//! println!("resolved {} packages", resolution.packages.len());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod converge;
pub mod error;
pub mod fetch;
pub mod lockfile;
pub mod proto;
pub mod registry;
pub mod resolver;
pub mod types;

pub use client::{decode_package, verify_envelope, ProgressFn, RepoClient};
pub use config::{Clock, Config, RepoConfig, SystemClock, DEFAULT_REPO};
pub use converge::Session;
pub use error::{Error, FailedRequirement, Result};
pub use fetch::{FetchPool, Fingerprint, JobContext};
pub use lockfile::{from_resolution, LockedPackage, Lockfile};
pub use registry::{CachedPackage, RegistryStore};
pub use resolver::{resolve, DependencyNode, Resolution, Resolved, Selection};
pub use types::{DependencyDecl, PackageOutcome, Release, Retirement};
