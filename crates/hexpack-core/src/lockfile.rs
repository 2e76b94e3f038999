//! Lockfile serialization.
//!
//! The lockfile commits a resolution as canonical term records, one per
//! package, sorted by name:
//!
//! ```text
//! {<<"mime">>,{<<"mime">>,<<"1.6.0">>,<<"0e39...">>,[mix],[],<<"hexpm">>}}.
//! {<<"plug">>,{<<"plug">>,<<"1.10.0">>,<<"a1b2...">>,[mix],[<<"mime">>],<<"hexpm">>}}.
//! ```
//!
//! The value tuple is `(app, version, checksum, managers, deps, repo)`.
//! Formatting is normalized, so re-serializing an unchanged lock yields
//! byte-identical output. Reading tolerates the legacy shapes without `repo`
//! and/or `managers` and migrates them in memory only; the file is not
//! rewritten until the next lock write.

use std::collections::BTreeMap;
use std::path::Path;

use tokio::fs;
use tracing::{debug, info, warn};

use hexpack_archive::{parse_metadata, render_metadata, Metadata, Term};
use hexpack_version::Version;

use crate::config::DEFAULT_REPO;
use crate::error::{Error, Result};
use crate::registry::{write_atomic, RegistryStore};
use crate::resolver::{Resolution, Selection};

/// One locked package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedPackage {
    /// Application alias the package is depended upon as.
    pub app: String,

    /// Package name.
    pub name: String,

    /// Locked version.
    pub version: Version,

    /// Registry checksum, lowercase hex.
    pub checksum: String,

    /// Build-tool managers, sorted.
    pub managers: Vec<String>,

    /// Names of the package's resolved dependencies, sorted.
    pub deps: Vec<String>,

    /// Hosting repository.
    pub repo: String,
}

/// The whole lockfile: name to locked package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lockfile {
    pub packages: BTreeMap<String, LockedPackage>,
}

impl Lockfile {
    /// Parse lockfile text.
    pub fn parse(text: &str) -> Result<Self> {
        let records = parse_metadata(text).map_err(|e| Error::Lockfile {
            message: format!("failed to parse lockfile: {}", e),
        })?;

        let mut packages = BTreeMap::new();
        for (name, value) in records {
            let package = parse_entry(&name, value)?;
            packages.insert(name, package);
        }
        Ok(Self { packages })
    }

    /// Render the canonical text form.
    pub fn render(&self) -> String {
        let mut records = Metadata::new();
        for (name, package) in &self.packages {
            records.insert(name.clone(), entry_term(package));
        }
        render_metadata(&records)
    }

    /// Load a lockfile; a missing file is an empty lock.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path).await {
            Ok(text) => {
                let lock = Self::parse(&text)?;
                debug!(path = %path.display(), packages = lock.packages.len(), "loaded lockfile");
                Ok(lock)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no lockfile yet");
                Ok(Self::default())
            }
            Err(e) => Err(Error::Lockfile {
                message: format!("failed to read lockfile: {}", e),
            }),
        }
    }

    /// Write the lockfile atomically, holding an advisory lock for the
    /// duration of the write.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let _guard = LockGuard::acquire(path)?;

        write_atomic(path, self.render().as_bytes()).await?;
        info!(path = %path.display(), packages = self.packages.len(), "wrote lockfile");
        Ok(())
    }

    /// The pinned selections, as resolver input.
    pub fn selections(&self) -> BTreeMap<String, Selection> {
        self.packages
            .iter()
            .map(|(name, package)| {
                (
                    name.clone(),
                    Selection {
                        repo: package.repo.clone(),
                        version: package.version.clone(),
                    },
                )
            })
            .collect()
    }

    /// The locked package for `name`.
    pub fn get(&self, name: &str) -> Option<&LockedPackage> {
        self.packages.get(name)
    }
}

/// Build a lockfile from a resolution and the registry store.
pub fn from_resolution(resolution: &Resolution, store: &RegistryStore) -> Result<Lockfile> {
    // A dependency declared under an alias is locked under that alias.
    let mut aliases: BTreeMap<String, String> = BTreeMap::new();
    for (name, selection) in &resolution.packages {
        if let Some(deps) = store.deps(&selection.repo, name, &selection.version) {
            for dep in deps {
                if let Some(app) = &dep.app {
                    aliases.insert(dep.name.clone(), app.clone());
                }
            }
        }
    }

    let mut packages = BTreeMap::new();
    for (name, selection) in &resolution.packages {
        let release = store
            .release(&selection.repo, name, &selection.version)
            .ok_or_else(|| Error::Lockfile {
                message: format!(
                    "registry store has no release for {} {}",
                    name, selection.version
                ),
            })?;

        let mut managers = release.managers.clone();
        managers.sort();
        managers.dedup();

        let mut deps: Vec<String> = release
            .dependencies
            .iter()
            .filter(|dep| resolution.packages.contains_key(&dep.name))
            .map(|dep| dep.name.clone())
            .collect();
        deps.sort();
        deps.dedup();

        packages.insert(
            name.clone(),
            LockedPackage {
                app: aliases.get(name).cloned().unwrap_or_else(|| name.clone()),
                name: name.clone(),
                version: selection.version.clone(),
                checksum: release.checksum_hex(),
                managers,
                deps,
                repo: selection.repo.clone(),
            },
        );
    }

    Ok(Lockfile { packages })
}

fn entry_term(package: &LockedPackage) -> Term {
    Term::Tuple(vec![
        Term::binary(&package.app),
        Term::binary(package.version.to_string()),
        Term::binary(&package.checksum),
        Term::List(package.managers.iter().map(Term::atom).collect()),
        Term::List(package.deps.iter().map(Term::binary).collect()),
        Term::binary(&package.repo),
    ])
}

fn parse_entry(name: &str, value: Term) -> Result<LockedPackage> {
    let bad = |message: String| Error::Lockfile { message };

    let Term::Tuple(fields) = value else {
        return Err(bad(format!("entry for {} is not a tuple", name)));
    };

    // Canonical: (app, version, checksum, managers, deps, repo).
    // Legacy:    (app, version, checksum, managers, deps)
    //            (app, version, checksum, deps)
    let (app, version, checksum, managers, deps, repo) = match fields.len() {
        6 => {
            let mut it = fields.into_iter();
            let app = it.next();
            let version = it.next();
            let checksum = it.next();
            let managers = it.next();
            let deps = it.next();
            let repo = it.next();
            (app, version, checksum, managers, deps, repo)
        }
        5 => {
            warn!(name, "lock entry has no repo; assuming {}", DEFAULT_REPO);
            let mut it = fields.into_iter();
            let app = it.next();
            let version = it.next();
            let checksum = it.next();
            let managers = it.next();
            let deps = it.next();
            (app, version, checksum, managers, deps, None)
        }
        4 => {
            warn!(name, "lock entry has no managers or repo; assuming defaults");
            let mut it = fields.into_iter();
            let app = it.next();
            let version = it.next();
            let checksum = it.next();
            let deps = it.next();
            (app, version, checksum, None, deps, None)
        }
        n => return Err(bad(format!("entry for {} has unexpected arity {}", name, n))),
    };

    let binary = |term: Option<Term>, field: &str| -> Result<String> {
        match term {
            Some(Term::Binary(text)) => Ok(text),
            other => Err(bad(format!(
                "entry for {}: field {} is not a binary: {:?}",
                name, field, other
            ))),
        }
    };

    let app = binary(app, "app")?;
    let version = Version::parse(&binary(version, "version")?)?;
    let checksum = binary(checksum, "checksum")?.to_ascii_lowercase();

    let mut managers = match managers {
        None => vec!["mix".to_string()],
        Some(Term::List(items)) => items
            .into_iter()
            .map(|item| match item {
                Term::Atom(manager) => Ok(manager),
                other => Err(bad(format!(
                    "entry for {}: manager is not an atom: {:?}",
                    name, other
                ))),
            })
            .collect::<Result<Vec<_>>>()?,
        other => {
            return Err(bad(format!(
                "entry for {}: managers is not a list: {:?}",
                name, other
            )))
        }
    };
    managers.sort();
    managers.dedup();

    let mut deps = match deps {
        Some(Term::List(items)) => items
            .into_iter()
            .map(|item| match item {
                Term::Binary(dep) => Ok(dep),
                other => Err(bad(format!(
                    "entry for {}: dep ref is not a binary: {:?}",
                    name, other
                ))),
            })
            .collect::<Result<Vec<_>>>()?,
        other => {
            return Err(bad(format!(
                "entry for {}: deps is not a list: {:?}",
                name, other
            )))
        }
    };
    deps.sort();
    deps.dedup();

    let repo = match repo {
        None => DEFAULT_REPO.to_string(),
        Some(term) => binary(Some(term), "repo")?,
    };

    Ok(LockedPackage {
        app,
        name: name.to_string(),
        version,
        checksum,
        managers,
        deps,
        repo,
    })
}

/// Advisory lock held while writing the lockfile.
struct LockGuard {
    _file: std::fs::File,
}

impl LockGuard {
    fn acquire(path: &Path) -> Result<Self> {
        let lock_path = path.with_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;

        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            nix::fcntl::flock(file.as_raw_fd(), nix::fcntl::FlockArg::LockExclusive).map_err(
                |e| Error::Lockfile {
                    message: format!("failed to lock {}: {}", lock_path.display(), e),
                },
            )?;
        }

        Ok(Self { _file: file })
    }
}
