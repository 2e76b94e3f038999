//! Top-level operations: resolve, fetch, converge.
//!
//! [`Session`] wires the client, registry store and fetch pools together.
//! `converge` is the all-or-nothing composition: resolve the tree, fetch and
//! verify every tarball, and only then commit the lockfile. A single failed
//! fetch leaves the lock untouched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info};

use hexpack_archive::{unpack, UnpackOptions};

use crate::client::RepoClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetch::{FetchPool, Fingerprint};
use crate::lockfile::{self, Lockfile};
use crate::registry::{write_atomic, RegistryStore};
use crate::resolver::{self, DependencyNode, Resolution, Resolved};
use crate::types::{PackageOutcome, Release};

/// A configured client session.
///
/// Built once per run; the registry and tarball pools share one concurrency
/// bound so `http_concurrency` covers all network work together.
pub struct Session {
    config: Config,
    client: RepoClient,
    store: Arc<RegistryStore>,
    registry_pool: Arc<FetchPool<PackageOutcome>>,
    tarball_pool: Arc<FetchPool<Vec<u8>>>,
}

impl Session {
    /// Create a session from a configuration snapshot.
    pub fn new(config: Config) -> Result<Self> {
        let client = RepoClient::new(&config)?;
        let store = Arc::new(RegistryStore::new(config.registry_cache_dir()));
        let semaphore = Arc::new(Semaphore::new(config.http_concurrency.max(1)));

        Ok(Self {
            client,
            store,
            registry_pool: Arc::new(FetchPool::with_semaphore(Arc::clone(&semaphore))),
            tarball_pool: Arc::new(FetchPool::with_semaphore(semaphore)),
            config,
        })
    }

    /// The configuration this session runs under.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The registry store.
    pub fn store(&self) -> &Arc<RegistryStore> {
        &self.store
    }

    /// Cooperatively cancel outstanding work.
    pub fn shutdown(&self) {
        self.registry_pool.shutdown();
        self.tarball_pool.shutdown();
    }

    /// The release list for a package, fetching it if necessary.
    pub async fn get_registry(&self, repo: &str, name: &str) -> Result<Vec<Release>> {
        self.store
            .ensure(&self.config, &self.client, &self.registry_pool, repo, name)
            .await?;
        self.store
            .get(repo, name)
            .map(|package| package.releases.clone())
            .ok_or_else(|| Error::Config {
                message: format!("registry entry for {}/{} vanished", repo, name),
            })
    }

    /// Resolve the dependency tree, prefetching registry entries on demand.
    pub async fn resolve(&self, tree: &[DependencyNode], lock: &Lockfile) -> Result<Resolution> {
        let mut requests = Vec::new();
        collect_tree_packages(tree, &mut requests);
        self.store
            .prefetch(&self.config, &self.client, &self.registry_pool, &requests)
            .await?;

        let pinned = lock.selections();
        loop {
            match resolver::resolve(&self.store, tree, &pinned)? {
                Resolved::Complete(resolution) => {
                    debug!(packages = resolution.packages.len(), "resolution complete");
                    return Ok(resolution);
                }
                Resolved::Missing(missing) => {
                    debug!(missing = missing.len(), "prefetching transitive packages");
                    self.store
                        .prefetch(&self.config, &self.client, &self.registry_pool, &missing)
                        .await?;
                }
            }
        }
    }

    /// Fetch and verify every resolved tarball; unpack those with a
    /// destination.
    ///
    /// Tarballs are cached content-addressed: a cached copy is reused when
    /// it still matches the registry checksum and re-fetched otherwise.
    /// Any failure fails the whole operation.
    pub async fn fetch(
        &self,
        resolution: &Resolution,
        destinations: &BTreeMap<String, PathBuf>,
    ) -> Result<()> {
        let mut tasks = tokio::task::JoinSet::new();

        for (name, selection) in &resolution.packages {
            let checksum = self
                .store
                .checksum(&selection.repo, name, &selection.version)
                .ok_or_else(|| Error::Config {
                    message: format!("no registry checksum for {} {}", name, selection.version),
                })?;

            let repo = self.config.repo(&selection.repo)?.clone();
            let client = self.client.clone();
            let pool = Arc::clone(&self.tarball_pool);
            let cache_path = self
                .config
                .tarball_cache_dir()
                .join(&selection.repo)
                .join(format!("{}-{}.tar", name, selection.version));
            let dest = destinations.get(name).cloned();
            let touch_time = self.config.clock.now();
            let name = name.clone();
            let version = selection.version.clone();

            tasks.spawn(async move {
                let fingerprint = Fingerprint::tarball(&repo.name, &name, &version);
                let job_checksum = checksum.clone();
                let tarball = pool
                    .run(fingerprint, None, move |ctx| async move {
                        ctx.check_cancelled()?;

                        if let Ok(cached) = tokio::fs::read(&cache_path).await {
                            if hexpack_archive::inspect(&cached, Some(job_checksum.as_slice())).is_ok() {
                                debug!(name = %name, version = %version, "tarball cache hit");
                                return Ok(cached);
                            }
                            debug!(
                                name = %name,
                                version = %version,
                                "cached tarball no longer matches registry checksum"
                            );
                        }

                        let bytes = client.get_tarball(&repo, &name, &version).await?;
                        ctx.check_cancelled()?;
                        hexpack_archive::inspect(&bytes, Some(job_checksum.as_slice()))?;

                        if let Some(parent) = cache_path.parent() {
                            tokio::fs::create_dir_all(parent).await?;
                        }
                        write_atomic(&cache_path, &bytes).await?;
                        Ok(bytes)
                    })
                    .await?;

                if let Some(dest) = dest {
                    tokio::fs::create_dir_all(&dest).await?;
                    let options = UnpackOptions::default()
                        .with_registry_checksum(checksum)
                        .with_touch_time(touch_time);
                    unpack(&tarball, &dest, &options)?;
                }
                Ok::<(), Error>(())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|e| Error::Fetch {
                message: format!("fetch task failed: {}", e),
            })??;
        }
        Ok(())
    }

    /// Resolve, fetch everything, then commit the lockfile.
    pub async fn converge(
        &self,
        tree: &[DependencyNode],
        lock_path: &Path,
        destinations: &BTreeMap<String, PathBuf>,
    ) -> Result<Resolution> {
        let lock = Lockfile::load(lock_path).await?;
        let resolution = self.resolve(tree, &lock).await?;
        self.check_lock_checksums(&lock, &resolution)?;

        self.fetch(&resolution, destinations).await?;

        let new_lock = lockfile::from_resolution(&resolution, &self.store)?;
        new_lock.save(lock_path).await?;
        info!(packages = resolution.packages.len(), "converged");
        Ok(resolution)
    }

    /// A lock entry that stays at its pinned version must agree with the
    /// registry about the checksum; disagreement is a trust failure.
    fn check_lock_checksums(&self, lock: &Lockfile, resolution: &Resolution) -> Result<()> {
        for (name, locked) in &lock.packages {
            let Some(selection) = resolution.packages.get(name) else {
                continue;
            };
            if selection.version != locked.version || selection.repo != locked.repo {
                continue;
            }
            let Some(registry_checksum) =
                self.store.checksum(&selection.repo, name, &selection.version)
            else {
                continue;
            };
            let registry_hex = hex::encode(&registry_checksum);
            if registry_hex != locked.checksum {
                return Err(Error::LockMismatch {
                    name: name.clone(),
                    version: selection.version.to_string(),
                    locked: locked.checksum.clone(),
                    registry: registry_hex,
                });
            }
        }
        Ok(())
    }
}

fn collect_tree_packages(tree: &[DependencyNode], out: &mut Vec<(String, String)>) {
    for node in tree {
        out.push((node.repo.clone(), node.name.clone()));
        collect_tree_packages(&node.children, out);
    }
}
