//! Package tarball codec.
//!
//! Packages travel as an *outer* uncompressed ustar archive wrapping a
//! version tag, a checksum, canonical-term metadata and the gzip-compressed
//! *inner* tar of the package's files:
//!
//! ```text
//! VERSION           ASCII decimal format version ("2" or "3")
//! CHECKSUM          hex SHA-256 over VERSION || metadata || contents.tar.gz
//! metadata.config   canonical term records (metadata.exs in format 2)
//! contents.tar.gz   gzip-compressed tar of the package files
//! ```
//!
//! [`pack`] builds an archive from metadata and files; [`unpack`] verifies
//! the checksum discipline and extracts under a destination, refusing
//! symlinks and escaping paths.

mod checksum;
mod error;
mod metadata;
mod tarball;

pub use checksum::{sha256_concat, to_hex, CHECKSUM_LEN};
pub use error::{ArchiveError, ArchiveResult};
pub use metadata::{parse_metadata, parse_records, render_metadata, Metadata, Term};
pub use tarball::{inspect, pack, unpack, InspectedPackage, UnpackOptions, FORMAT_VERSION};
