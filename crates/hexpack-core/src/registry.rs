//! Per-process registry store.
//!
//! Caches the decoded release lists per `(repo, name)` behind a
//! single-writer/many-reader lock; entries are `Arc`s so updates just swap
//! the pointer. On disk the store persists the *raw signed envelope* per
//! package, so signature verification is repeated on every load and a
//! tampered cache never becomes trusted state.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use hexpack_version::Version;

use crate::client::{decode_package, verify_envelope, RepoClient};
use crate::config::{Config, RepoConfig};
use crate::error::{Error, Result};
use crate::fetch::{FetchPool, Fingerprint};
use crate::types::{DependencyDecl, PackageOutcome, Release};

/// One cached package: the releases and the etag they were fetched under.
#[derive(Debug, Clone)]
pub struct CachedPackage {
    /// ETag for the next conditional request.
    pub etag: Option<String>,

    /// Releases sorted by ascending version.
    pub releases: Vec<Release>,
}

/// Sidecar metadata persisted next to the raw envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EnvelopeMeta {
    #[serde(default)]
    etag: Option<String>,
}

/// In-memory registry cache with envelope persistence.
#[derive(Debug)]
pub struct RegistryStore {
    entries: RwLock<HashMap<(String, String), Arc<CachedPackage>>>,
    cache_dir: PathBuf,
}

impl RegistryStore {
    /// A store persisting envelopes under `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            cache_dir: cache_dir.into(),
        }
    }

    /// The cached package, if present in memory.
    pub fn get(&self, repo: &str, name: &str) -> Option<Arc<CachedPackage>> {
        self.entries
            .read()
            .expect("registry store lock poisoned")
            .get(&(repo.to_string(), name.to_string()))
            .cloned()
    }

    /// Insert or replace a package entry.
    pub fn insert(&self, repo: &str, name: &str, mut package: CachedPackage) {
        package.releases.sort_by(|a, b| a.version.cmp(&b.version));
        self.entries
            .write()
            .expect("registry store lock poisoned")
            .insert(
                (repo.to_string(), name.to_string()),
                Arc::new(package),
            );
    }

    /// Versions of a package, ascending.
    pub fn versions(&self, repo: &str, name: &str) -> Option<Vec<Version>> {
        self.get(repo, name)
            .map(|p| p.releases.iter().map(|r| r.version.clone()).collect())
    }

    /// One release of a package.
    pub fn release(&self, repo: &str, name: &str, version: &Version) -> Option<Release> {
        self.get(repo, name)?
            .releases
            .iter()
            .find(|r| &r.version == version)
            .cloned()
    }

    /// The registry checksum for a release.
    pub fn checksum(&self, repo: &str, name: &str, version: &Version) -> Option<Vec<u8>> {
        self.release(repo, name, version).map(|r| r.checksum)
    }

    /// The declared dependencies of a release.
    pub fn deps(&self, repo: &str, name: &str, version: &Version) -> Option<Vec<DependencyDecl>> {
        self.release(repo, name, version).map(|r| r.dependencies)
    }

    /// The current etag for a package, if any.
    pub fn etag(&self, repo: &str, name: &str) -> Option<String> {
        self.get(repo, name).and_then(|p| p.etag.clone())
    }

    /// Make sure `(repo, name)` is present, fetching or loading as needed.
    pub async fn ensure(
        self: &Arc<Self>,
        config: &Config,
        client: &RepoClient,
        pool: &Arc<FetchPool<PackageOutcome>>,
        repo: &str,
        name: &str,
    ) -> Result<()> {
        self.prefetch(config, client, pool, &[(repo.to_string(), name.to_string())])
            .await
    }

    /// Fan out conditional registry fetches through the pool.
    ///
    /// A 200 replaces the entry after envelope verification; a 304 keeps the
    /// existing entry. Offline mode serves from the persisted envelopes only.
    pub async fn prefetch(
        self: &Arc<Self>,
        config: &Config,
        client: &RepoClient,
        pool: &Arc<FetchPool<PackageOutcome>>,
        requests: &[(String, String)],
    ) -> Result<()> {
        let unique: BTreeSet<_> = requests.iter().cloned().collect();
        let mut tasks = tokio::task::JoinSet::new();

        for (repo_name, name) in unique {
            let repo = config.repo(&repo_name)?.clone();
            let store = Arc::clone(self);
            let client = client.clone();
            let pool = Arc::clone(pool);
            let offline = config.offline;
            tasks.spawn(async move {
                store
                    .refresh_one(offline, &repo, &client, &pool, &name)
                    .await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|e| Error::Fetch {
                message: format!("registry fetch task failed: {}", e),
            })??;
        }
        Ok(())
    }

    async fn refresh_one(
        &self,
        offline: bool,
        repo: &RepoConfig,
        client: &RepoClient,
        pool: &FetchPool<PackageOutcome>,
        name: &str,
    ) -> Result<()> {
        // Warm from disk so conditional requests carry the persisted etag and
        // offline mode has something to serve.
        if self.get(&repo.name, name).is_none() {
            if let Err(e) = self.load_persisted(repo, name).await {
                debug!(repo = %repo.name, name, error = %e, "no usable persisted envelope");
            }
        }

        if offline {
            if self.get(&repo.name, name).is_some() {
                return Ok(());
            }
            return Err(Error::OfflineMissing {
                repo: repo.name.clone(),
                name: name.to_string(),
            });
        }

        let etag = self.etag(&repo.name, name);
        let fingerprint = Fingerprint::registry(&repo.name, name, etag.as_deref());

        let outcome = {
            let client = client.clone();
            let repo = repo.clone();
            let name = name.to_string();
            pool.run(fingerprint, None, move |ctx| async move {
                ctx.check_cancelled()?;
                client.get_package(&repo, &name, etag.as_deref()).await
            })
            .await?
        };

        match outcome {
            PackageOutcome::NotModified => {
                debug!(repo = %repo.name, name, "registry entry still fresh");
                Ok(())
            }
            PackageOutcome::Fresh { body, etag } => {
                let payload = verify_envelope(&body, repo)?;
                let releases = decode_package(&payload, repo, name)?;
                debug!(
                    repo = %repo.name,
                    name,
                    releases = releases.len(),
                    "registry entry updated"
                );
                self.insert(
                    &repo.name,
                    name,
                    CachedPackage {
                        etag: etag.clone(),
                        releases,
                    },
                );
                if let Err(e) = self.persist(&repo.name, name, &body, etag.as_deref()).await {
                    warn!(repo = %repo.name, name, error = %e, "failed to persist envelope");
                }
                Ok(())
            }
        }
    }

    /// Verify and load a persisted envelope into memory.
    async fn load_persisted(&self, repo: &RepoConfig, name: &str) -> Result<()> {
        let path = self.envelope_path(&repo.name, name);
        let body = fs::read(&path).await?;

        let payload = verify_envelope(&body, repo)?;
        let releases = decode_package(&payload, repo, name)?;

        let meta_path = self.meta_path(&repo.name, name);
        let etag = match fs::read_to_string(&meta_path).await {
            Ok(text) => serde_json::from_str::<EnvelopeMeta>(&text)
                .ok()
                .and_then(|m| m.etag),
            Err(_) => None,
        };

        debug!(repo = %repo.name, name, "loaded persisted envelope");
        self.insert(&repo.name, name, CachedPackage { etag, releases });
        Ok(())
    }

    async fn persist(
        &self,
        repo: &str,
        name: &str,
        envelope: &[u8],
        etag: Option<&str>,
    ) -> Result<()> {
        let path = self.envelope_path(repo, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        write_atomic(&path, envelope).await?;

        let meta = EnvelopeMeta {
            etag: etag.map(String::from),
        };
        let meta_json = serde_json::to_vec(&meta).map_err(|e| Error::Config {
            message: format!("failed to serialize envelope metadata: {}", e),
        })?;
        write_atomic(&self.meta_path(repo, name), &meta_json).await?;
        Ok(())
    }

    fn envelope_path(&self, repo: &str, name: &str) -> PathBuf {
        self.cache_dir.join(repo).join(name)
    }

    fn meta_path(&self, repo: &str, name: &str) -> PathBuf {
        self.cache_dir.join(repo).join(format!("{}.meta.json", name))
    }
}

/// Write to a temp file, then rename into place.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, contents).await?;
    fs::rename(&temp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto;
    use prost::Message;
    use tempfile::TempDir;

    fn wire_release(version: &str) -> proto::Release {
        proto::Release {
            version: version.to_string(),
            inner_checksum: vec![0xcd; 32],
            dependencies: Vec::new(),
            retired: None,
        }
    }

    fn envelope_for(repo: &str, name: &str, versions: &[&str]) -> Vec<u8> {
        let package = proto::Package {
            repository: repo.to_string(),
            name: name.to_string(),
            releases: versions.iter().map(|v| wire_release(v)).collect(),
        };
        proto::Signed {
            payload: package.encode_to_vec(),
            signature: Vec::new(),
        }
        .encode_to_vec()
    }

    fn unverified_repo(name: &str, url: &str) -> RepoConfig {
        RepoConfig::new(name, url).with_no_verify_signature()
    }

    fn decoded(repo: &RepoConfig, name: &str, versions: &[&str]) -> CachedPackage {
        let envelope = envelope_for(&repo.name, name, versions);
        let payload = verify_envelope(&envelope, repo).unwrap();
        CachedPackage {
            etag: None,
            releases: decode_package(&payload, repo, name).unwrap(),
        }
    }

    fn v(text: &str) -> Version {
        Version::parse(text).unwrap()
    }

    #[test]
    fn test_selectors() {
        let store = RegistryStore::new("/tmp/unused");
        let repo = unverified_repo("hexpm", "https://repo.hex.pm");
        // Inserted out of order; the store normalizes to ascending.
        store.insert("hexpm", "plug", decoded(&repo, "plug", &["1.1.0", "1.0.0", "1.2.0"]));

        let versions = store.versions("hexpm", "plug").unwrap();
        assert_eq!(versions, vec![v("1.0.0"), v("1.1.0"), v("1.2.0")]);

        assert_eq!(
            store.checksum("hexpm", "plug", &v("1.1.0")).unwrap(),
            vec![0xcd; 32]
        );
        assert!(store.deps("hexpm", "plug", &v("1.2.0")).unwrap().is_empty());
        assert!(store.release("hexpm", "plug", &v("9.9.9")).is_none());
        assert!(store.get("hexpm", "other").is_none());
    }

    #[tokio::test]
    async fn test_prefetch_fresh_and_not_modified() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let envelope = envelope_for("hexpm", "plug", &["1.0.0"]);

        Mock::given(method("GET"))
            .and(path("/packages/plug"))
            .and(header("if-none-match", "\"etag-1\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/packages/plug"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(envelope.clone())
                    .insert_header("etag", "\"etag-1\""),
            )
            .mount(&server)
            .await;

        let cache = TempDir::new().unwrap();
        let config = Config::default()
            .with_home(cache.path())
            .with_repo(unverified_repo("hexpm", &server.uri()));
        let store = Arc::new(RegistryStore::new(config.registry_cache_dir()));
        let client = RepoClient::new(&config).unwrap();
        let pool = Arc::new(FetchPool::new(4));

        store
            .prefetch(&config, &client, &pool, &[("hexpm".into(), "plug".into())])
            .await
            .unwrap();

        let entry = store.get("hexpm", "plug").unwrap();
        assert_eq!(entry.etag.as_deref(), Some("\"etag-1\""));
        assert_eq!(entry.releases.len(), 1);

        // Second prefetch sends the etag and keeps the entry on 304.
        store
            .prefetch(&config, &client, &pool, &[("hexpm".into(), "plug".into())])
            .await
            .unwrap();
        let entry = store.get("hexpm", "plug").unwrap();
        assert_eq!(entry.releases.len(), 1);
    }

    #[tokio::test]
    async fn test_offline_serves_persisted_envelope() {
        let cache = TempDir::new().unwrap();
        let config = Config::default()
            .with_home(cache.path())
            .with_offline(true)
            .with_repo(unverified_repo("hexpm", "http://unreachable.invalid"));
        let store = Arc::new(RegistryStore::new(config.registry_cache_dir()));
        let client = RepoClient::new(&config).unwrap();
        let pool = Arc::new(FetchPool::new(4));

        // Persist an envelope as a previous run would have.
        let envelope = envelope_for("hexpm", "plug", &["1.0.0", "1.1.0"]);
        let path = config.registry_cache_dir().join("hexpm").join("plug");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, &envelope).unwrap();

        store
            .prefetch(&config, &client, &pool, &[("hexpm".into(), "plug".into())])
            .await
            .unwrap();
        assert_eq!(store.versions("hexpm", "plug").unwrap().len(), 2);

        // A package with no persisted envelope is an offline miss.
        let err = store
            .prefetch(&config, &client, &pool, &[("hexpm".into(), "ecto".into())])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OfflineMissing { name, .. } if name == "ecto"));
    }

    #[tokio::test]
    async fn test_persisted_envelope_reverified_on_load() {
        let cache = TempDir::new().unwrap();
        // Verification enabled, no key configured: loading must fail rather
        // than trust the cached bytes.
        let repo = RepoConfig::new("hexpm", "http://unreachable.invalid");
        let config = Config::default()
            .with_home(cache.path())
            .with_offline(true)
            .with_repo(repo);
        let store = Arc::new(RegistryStore::new(config.registry_cache_dir()));
        let client = RepoClient::new(&config).unwrap();
        let pool = Arc::new(FetchPool::new(4));

        let envelope = envelope_for("hexpm", "plug", &["1.0.0"]);
        let path = config.registry_cache_dir().join("hexpm").join("plug");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, &envelope).unwrap();

        let err = store
            .prefetch(&config, &client, &pool, &[("hexpm".into(), "plug".into())])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OfflineMissing { .. }));
    }
}
