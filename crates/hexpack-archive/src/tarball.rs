//! Outer/inner tarball creation and verified extraction.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::path::{Component, Path};
use std::time::SystemTime;

use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use hexpack_version::Version;
use tar::{Builder, EntryType, Header};
use tracing::debug;

use crate::checksum::{sha256_concat, to_hex, CHECKSUM_LEN};
use crate::error::{ArchiveError, ArchiveResult};
use crate::metadata::{parse_metadata, render_metadata, Metadata};

/// Format version written by [`pack`].
pub const FORMAT_VERSION: &str = "3";

/// Format versions [`unpack`] accepts.
const SUPPORTED_VERSIONS: &[&str] = &["2", "3"];

/// Sidecar written at the destination root after extraction.
const METADATA_SIDECAR: &str = "hex_metadata.config";

/// The metadata entry name for a given format version.
fn metadata_entry_name(version: &str) -> &'static str {
    if version == "2" {
        "metadata.exs"
    } else {
        "metadata.config"
    }
}

/// Options for [`unpack`].
#[derive(Debug, Clone, Default)]
pub struct UnpackOptions {
    /// Registry checksum to cross-check the recomputed digest against.
    pub registry_checksum: Option<Vec<u8>>,

    /// Timestamp applied to extracted files. Defaults to the current time.
    pub touch_time: Option<SystemTime>,
}

impl UnpackOptions {
    /// Cross-check the archive digest against a registry checksum.
    pub fn with_registry_checksum(mut self, checksum: impl Into<Vec<u8>>) -> Self {
        self.registry_checksum = Some(checksum.into());
        self
    }

    /// Fix the mtime applied to extracted files.
    pub fn with_touch_time(mut self, time: SystemTime) -> Self {
        self.touch_time = Some(time);
        self
    }
}

/// Verified contents of an outer archive, before extraction.
#[derive(Debug, Clone)]
pub struct InspectedPackage {
    /// Format version from the VERSION entry.
    pub format_version: String,

    /// Parsed package metadata.
    pub metadata: Metadata,

    /// Recomputed digest over VERSION || metadata || contents.tar.gz.
    pub checksum: [u8; CHECKSUM_LEN],
}

/// Build an outer archive from metadata and a file list.
///
/// The inner archive is a deterministic gzip-compressed tar: fixed header
/// fields and an epoch mtime, so packing the same inputs yields identical
/// bytes. An empty file list is refused.
pub fn pack(metadata: &Metadata, files: &[(String, Vec<u8>)]) -> ArchiveResult<Vec<u8>> {
    if files.is_empty() {
        return Err(ArchiveError::EmptyPackage);
    }

    if let Some(version) = metadata.get("version").and_then(|t| t.as_binary()) {
        Version::parse(version).map_err(|e| ArchiveError::InvalidMetadata {
            message: e.to_string(),
        })?;
    }

    let metadata_bytes = render_metadata(metadata).into_bytes();
    let contents = build_inner(files)?;
    let checksum = sha256_concat(&[FORMAT_VERSION.as_bytes(), &metadata_bytes, &contents]);

    let mut outer = Builder::new(Vec::new());
    append_entry(&mut outer, "VERSION", FORMAT_VERSION.as_bytes())?;
    append_entry(&mut outer, "CHECKSUM", to_hex(&checksum).as_bytes())?;
    append_entry(&mut outer, metadata_entry_name(FORMAT_VERSION), &metadata_bytes)?;
    append_entry(&mut outer, "contents.tar.gz", &contents)?;

    let bytes = outer.into_inner()?;
    debug!(
        files = files.len(),
        bytes = bytes.len(),
        checksum = %to_hex(&checksum),
        "packed archive"
    );
    Ok(bytes)
}

fn build_inner(files: &[(String, Vec<u8>)]) -> ArchiveResult<Vec<u8>> {
    let encoder = GzBuilder::new()
        .mtime(0)
        .operating_system(255)
        .write(Vec::new(), Compression::best());
    let mut tar = Builder::new(encoder);

    for (path, contents) in files {
        append_entry(&mut tar, path, contents)?;
    }

    let encoder = tar.into_inner()?;
    Ok(encoder.finish()?)
}

fn append_entry<W: Write>(tar: &mut Builder<W>, path: &str, data: &[u8]) -> ArchiveResult<()> {
    let mut header = Header::new_ustar();
    header.set_path(path)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_cksum();
    tar.append(&header, data)?;
    Ok(())
}

/// Read the outer archive and verify its checksum discipline without
/// touching the filesystem.
pub fn inspect(tarball: &[u8], registry_checksum: Option<&[u8]>) -> ArchiveResult<InspectedPackage> {
    let entries = read_outer(tarball)?;

    let version_bytes = entries
        .get("VERSION")
        .ok_or_else(|| missing("VERSION"))?
        .clone();
    let format_version = String::from_utf8_lossy(&version_bytes).trim().to_string();
    if !SUPPORTED_VERSIONS.contains(&format_version.as_str()) {
        return Err(ArchiveError::UnsupportedVersion {
            version: format_version,
        });
    }

    let metadata_name = metadata_entry_name(&format_version);
    let checksum_entry = entries.get("CHECKSUM").ok_or_else(|| missing("CHECKSUM"))?;
    let metadata_bytes = entries.get(metadata_name).ok_or_else(|| missing(metadata_name))?;
    let contents = entries
        .get("contents.tar.gz")
        .ok_or_else(|| missing("contents.tar.gz"))?;

    let computed = sha256_concat(&[&version_bytes, metadata_bytes, contents]);
    let claimed = String::from_utf8_lossy(checksum_entry).trim().to_ascii_lowercase();
    if claimed != to_hex(&computed) {
        return Err(ArchiveError::ChecksumMismatch {
            expected: claimed,
            actual: to_hex(&computed),
        });
    }

    if let Some(registry_checksum) = registry_checksum {
        if registry_checksum != computed {
            return Err(ArchiveError::RegistryChecksumMismatch {
                expected: to_hex(registry_checksum),
                actual: to_hex(&computed),
            });
        }
    }

    let metadata = parse_metadata(&String::from_utf8_lossy(metadata_bytes))?;

    Ok(InspectedPackage {
        format_version,
        metadata,
        checksum: computed,
    })
}

/// Verify and extract an archive under `dest`.
///
/// Regular files and directories are recreated; symlinks, hardlinks,
/// absolute paths and parent-escaping names are refused. Every extracted
/// file's mtime is touched so downstream build caches see fresh inputs, and
/// the canonical metadata is written to `hex_metadata.config` at the
/// destination root.
pub fn unpack(tarball: &[u8], dest: &Path, options: &UnpackOptions) -> ArchiveResult<InspectedPackage> {
    let inspected = inspect(tarball, options.registry_checksum.as_deref())?;

    let entries = read_outer(tarball)?;
    let contents = entries
        .get("contents.tar.gz")
        .ok_or_else(|| missing("contents.tar.gz"))?;

    let touch_time = options.touch_time.unwrap_or_else(SystemTime::now);
    extract_inner(contents, dest, touch_time)?;

    let sidecar = render_metadata(&inspected.metadata);
    std::fs::write(dest.join(METADATA_SIDECAR), sidecar)?;

    debug!(
        dest = %dest.display(),
        version = %inspected.format_version,
        checksum = %to_hex(&inspected.checksum),
        "unpacked archive"
    );
    Ok(inspected)
}

fn read_outer(tarball: &[u8]) -> ArchiveResult<BTreeMap<String, Vec<u8>>> {
    let mut archive = tar::Archive::new(Cursor::new(tarball));
    let mut entries = BTreeMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        entries.insert(name, data);
    }

    Ok(entries)
}

fn extract_inner(contents: &[u8], dest: &Path, touch_time: SystemTime) -> ArchiveResult<()> {
    let decoder = GzDecoder::new(Cursor::new(contents));
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let rendered = path.to_string_lossy().into_owned();

        let mut safe = std::path::PathBuf::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => safe.push(part),
                Component::CurDir => {}
                _ => return Err(ArchiveError::UnsafePath { path: rendered }),
            }
        }
        if safe.as_os_str().is_empty() {
            continue;
        }

        match entry.header().entry_type() {
            EntryType::Directory => {
                std::fs::create_dir_all(dest.join(&safe))?;
            }
            EntryType::Regular => {
                let target = dest.join(&safe);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut file = std::fs::File::create(&target)?;
                std::io::copy(&mut entry, &mut file)?;
                file.set_modified(touch_time)?;
            }
            _ => return Err(ArchiveError::UnsafePath { path: rendered }),
        }
    }

    Ok(())
}

fn missing(name: &str) -> ArchiveError {
    ArchiveError::MissingFile {
        name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Term;
    use tempfile::TempDir;

    fn sample_metadata() -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("app".into(), Term::binary("demo"));
        metadata.insert("name".into(), Term::binary("demo"));
        metadata.insert("version".into(), Term::binary("1.0.0"));
        metadata
    }

    fn sample_files() -> Vec<(String, Vec<u8>)> {
        vec![
            ("mix.exs".to_string(), b"contents".to_vec()),
            ("lib/demo.ex".to_string(), b"defmodule Demo do\nend\n".to_vec()),
        ]
    }

    /// Rebuild an outer archive from raw parts, bypassing `pack`'s checks.
    fn build_outer(
        version: &[u8],
        checksum: &[u8],
        metadata_name: &str,
        metadata: &[u8],
        contents: &[u8],
    ) -> Vec<u8> {
        let mut outer = Builder::new(Vec::new());
        append_entry(&mut outer, "VERSION", version).unwrap();
        append_entry(&mut outer, "CHECKSUM", checksum).unwrap();
        append_entry(&mut outer, metadata_name, metadata).unwrap();
        append_entry(&mut outer, "contents.tar.gz", contents).unwrap();
        outer.into_inner().unwrap()
    }

    /// Like `build_inner`, but writes the raw path bytes into the header
    /// directly instead of going through `Header::set_path`, so callers can
    /// craft entries (e.g. `../evil.sh`) that the `tar` crate's own
    /// `set_path` validation would otherwise reject.
    fn build_inner_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzBuilder::new()
            .mtime(0)
            .operating_system(255)
            .write(Vec::new(), Compression::best());
        let mut tar = Builder::new(encoder);

        for (path, data) in files {
            let mut header = Header::new_ustar();
            let name = header.as_old_mut().name.as_mut();
            let bytes = path.as_bytes();
            name[..bytes.len()].copy_from_slice(bytes);
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(0);
            header.set_cksum();
            tar.append(&header, *data).unwrap();
        }

        let encoder = tar.into_inner().unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let tarball = pack(&sample_metadata(), &sample_files()).unwrap();
        let dest = TempDir::new().unwrap();

        let unpacked = unpack(&tarball, dest.path(), &UnpackOptions::default()).unwrap();
        assert_eq!(unpacked.format_version, "3");
        assert_eq!(unpacked.metadata, sample_metadata());

        let mix = std::fs::read(dest.path().join("mix.exs")).unwrap();
        assert_eq!(mix, b"contents");
        let lib = std::fs::read(dest.path().join("lib/demo.ex")).unwrap();
        assert_eq!(lib, b"defmodule Demo do\nend\n");

        let sidecar = std::fs::read_to_string(dest.path().join(METADATA_SIDECAR)).unwrap();
        assert_eq!(sidecar, render_metadata(&sample_metadata()));
    }

    #[test]
    fn test_pack_deterministic() {
        let a = pack(&sample_metadata(), &sample_files()).unwrap();
        let b = pack(&sample_metadata(), &sample_files()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_pack_empty_file_list() {
        let err = pack(&sample_metadata(), &[]).unwrap_err();
        assert!(matches!(err, ArchiveError::EmptyPackage));
    }

    #[test]
    fn test_pack_invalid_metadata_version() {
        let mut metadata = sample_metadata();
        metadata.insert("version".into(), Term::binary("not-a-version"));
        let err = pack(&metadata, &sample_files()).unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidMetadata { .. }));
    }

    #[test]
    fn test_registry_checksum_accept_and_reject() {
        let tarball = pack(&sample_metadata(), &sample_files()).unwrap();
        let inspected = inspect(&tarball, None).unwrap();

        assert!(inspect(&tarball, Some(inspected.checksum.as_slice())).is_ok());

        let mut wrong = inspected.checksum;
        wrong[0] ^= 0xff;
        let err = inspect(&tarball, Some(wrong.as_slice())).unwrap_err();
        assert!(matches!(err, ArchiveError::RegistryChecksumMismatch { .. }));
    }

    #[test]
    fn test_contents_bit_flip_fails_checksum() {
        let tarball = pack(&sample_metadata(), &sample_files()).unwrap();
        let entries = read_outer(&tarball).unwrap();

        let mut contents = entries["contents.tar.gz"].clone();
        let last = contents.len() - 1;
        contents[last] ^= 0x01;

        let tampered = build_outer(
            &entries["VERSION"],
            &entries["CHECKSUM"],
            "metadata.config",
            &entries["metadata.config"],
            &contents,
        );

        let err = inspect(&tampered, None).unwrap_err();
        assert!(matches!(err, ArchiveError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_unsupported_version() {
        let metadata = render_metadata(&sample_metadata()).into_bytes();
        let contents = build_inner_tar(&[("mix.exs", b"x")]);
        let checksum = sha256_concat(&[b"1", &metadata, &contents]);
        let tarball = build_outer(b"1", to_hex(&checksum).as_bytes(), "metadata.config", &metadata, &contents);

        let err = inspect(&tarball, None).unwrap_err();
        assert!(matches!(err, ArchiveError::UnsupportedVersion { version } if version == "1"));
    }

    #[test]
    fn test_format_version_2_uses_metadata_exs() {
        let metadata = render_metadata(&sample_metadata()).into_bytes();
        let contents = build_inner_tar(&[("mix.exs", b"x")]);
        let checksum = sha256_concat(&[b"2", &metadata, &contents]);
        let tarball = build_outer(b"2", to_hex(&checksum).as_bytes(), "metadata.exs", &metadata, &contents);

        let inspected = inspect(&tarball, None).unwrap();
        assert_eq!(inspected.format_version, "2");
    }

    #[test]
    fn test_checksum_case_insensitive_on_read() {
        let metadata = render_metadata(&sample_metadata()).into_bytes();
        let contents = build_inner_tar(&[("mix.exs", b"x")]);
        let checksum = sha256_concat(&[b"3", &metadata, &contents]);
        let upper = to_hex(&checksum).to_ascii_uppercase();
        let tarball = build_outer(b"3", upper.as_bytes(), "metadata.config", &metadata, &contents);

        assert!(inspect(&tarball, None).is_ok());
    }

    #[test]
    fn test_missing_entry() {
        let metadata = render_metadata(&sample_metadata()).into_bytes();
        let contents = build_inner_tar(&[("mix.exs", b"x")]);
        let checksum = sha256_concat(&[b"3", &metadata, &contents]);

        // No contents.tar.gz entry at all.
        let mut outer = Builder::new(Vec::new());
        append_entry(&mut outer, "VERSION", b"3").unwrap();
        append_entry(&mut outer, "CHECKSUM", to_hex(&checksum).as_bytes()).unwrap();
        append_entry(&mut outer, "metadata.config", &metadata).unwrap();
        let tarball = outer.into_inner().unwrap();

        let err = inspect(&tarball, None).unwrap_err();
        assert!(matches!(err, ArchiveError::MissingFile { name } if name == "contents.tar.gz"));
    }

    #[test]
    fn test_parent_escaping_path_rejected() {
        let metadata = render_metadata(&sample_metadata()).into_bytes();
        let contents = build_inner_tar(&[("../evil.sh", b"#!/bin/sh\n")]);
        let checksum = sha256_concat(&[b"3", &metadata, &contents]);
        let tarball = build_outer(b"3", to_hex(&checksum).as_bytes(), "metadata.config", &metadata, &contents);

        let dest = TempDir::new().unwrap();
        let err = unpack(&tarball, dest.path(), &UnpackOptions::default()).unwrap_err();
        assert!(matches!(err, ArchiveError::UnsafePath { .. }));
        assert!(!dest.path().parent().unwrap().join("evil.sh").exists());
    }

    #[test]
    fn test_symlink_rejected() {
        let encoder = GzBuilder::new().mtime(0).write(Vec::new(), Compression::best());
        let mut tar = Builder::new(encoder);
        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::Symlink);
        header.set_path("link").unwrap();
        header.set_link_name("/etc/passwd").unwrap();
        header.set_size(0);
        header.set_cksum();
        tar.append(&header, std::io::empty()).unwrap();
        let contents = tar.into_inner().unwrap().finish().unwrap();

        let metadata = render_metadata(&sample_metadata()).into_bytes();
        let checksum = sha256_concat(&[b"3", &metadata, &contents]);
        let tarball = build_outer(b"3", to_hex(&checksum).as_bytes(), "metadata.config", &metadata, &contents);

        let dest = TempDir::new().unwrap();
        let err = unpack(&tarball, dest.path(), &UnpackOptions::default()).unwrap_err();
        assert!(matches!(err, ArchiveError::UnsafePath { path } if path == "link"));
    }

    #[test]
    fn test_touch_time_applied() {
        let tarball = pack(&sample_metadata(), &sample_files()).unwrap();
        let dest = TempDir::new().unwrap();

        let touch = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        let options = UnpackOptions::default().with_touch_time(touch);
        unpack(&tarball, dest.path(), &options).unwrap();

        let modified = std::fs::metadata(dest.path().join("mix.exs"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(modified, touch);
    }
}
