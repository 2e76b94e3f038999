//! Process-wide configuration snapshot.
//!
//! The [`Config`] is built once at startup, usually from the environment,
//! and treated as read-mostly afterwards. The `with_*` setters exist for test
//! fixtures.
//!
//! | Environment Variable | Description |
//! |----------------------|-------------|
//! | `HEX_HOME` | Client home directory (cache lives underneath) |
//! | `HEX_API_URL` | API base URL |
//! | `HEX_MIRROR` | Override the default repository URL |
//! | `HEX_OFFLINE` | Serve only from the local cache |
//! | `HEX_UNSAFE_HTTPS` | Skip TLS certificate verification |
//! | `HEX_UNSAFE_REGISTRY` | Skip registry signature/origin verification |
//! | `HEX_HTTP_CONCURRENCY` | Maximum concurrent fetches |
//! | `HTTP_PROXY` / `HTTPS_PROXY` | Proxy URLs |

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Default repository name.
pub const DEFAULT_REPO: &str = "hexpm";

/// Default repository URL.
pub const DEFAULT_REPO_URL: &str = "https://repo.hex.pm";

/// Default API base URL.
pub const DEFAULT_API_URL: &str = "https://hex.pm/api";

/// Default fetch concurrency.
pub const DEFAULT_HTTP_CONCURRENCY: usize = 8;

/// Default per-request total timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// The default repository's pinned signing key.
pub const HEXPM_PUBLIC_KEY: &str = "-----BEGIN PUBLIC KEY-----
MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEApqREcFDt5vV21JVe2QNB
Edvzk6w36aNFhVGWN5toNJRjRJ6m4hIuG4KaXtDWVLjnvct6MYMfqhC79HAGwyF+
IqR6Q6a5bbFSsImgBJwz1oadoVKD6ZNetAuCIK84cjMrEFRkELtEIPNHblCzUkkM
3rS9+DPlnfG8hBvGi6tvQIuZmXGCxF/73hU0/MyGhbtBlPXXbJiEn3SQoGF8GqQ3
IwjP7fla7US+V4L9+0IQsHY9jqDc1Q/cRLCDgYRZ7Gn+Cp1OpiOBrrjoLkwmCPHb
yVgb8q5Ub3pwLdBbTotpmXKbvs3zGGJZaF3tMUi4jPfVAgMBAAE=
-----END PUBLIC KEY-----
";

/// Clock capability: the single time source used by the core.
///
/// Production uses [`SystemClock`]; tests substitute a fixed clock.
pub trait Clock: fmt::Debug + Send + Sync {
    fn now(&self) -> SystemTime;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Configuration for one upstream repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Repository name, e.g. `hexpm`.
    pub name: String,

    /// Base URL for packages, tarballs and the public key.
    pub url: String,

    /// PEM-encoded RSA public key used to verify signed payloads.
    #[serde(default)]
    pub public_key: Option<String>,

    /// Authentication key sent in the `Authorization` header.
    #[serde(default)]
    pub auth_key: Option<String>,

    /// Skip signature verification for this repository.
    #[serde(default)]
    pub no_verify_signature: bool,

    /// Skip payload origin verification for this repository.
    #[serde(default)]
    pub no_verify_origin: bool,
}

impl RepoConfig {
    /// A repository with only a name and URL; verification keys unset.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            public_key: None,
            auth_key: None,
            no_verify_signature: false,
            no_verify_origin: false,
        }
    }

    /// The default `hexpm` repository with its pinned key.
    pub fn hexpm() -> Self {
        Self::new(DEFAULT_REPO, DEFAULT_REPO_URL).with_public_key(HEXPM_PUBLIC_KEY)
    }

    /// Set the verification key.
    pub fn with_public_key(mut self, pem: impl Into<String>) -> Self {
        self.public_key = Some(pem.into());
        self
    }

    /// Set the authentication key.
    pub fn with_auth_key(mut self, key: impl Into<String>) -> Self {
        self.auth_key = Some(key.into());
        self
    }

    /// Skip signature verification.
    pub fn with_no_verify_signature(mut self) -> Self {
        self.no_verify_signature = true;
        self
    }

    /// Skip origin verification.
    pub fn with_no_verify_origin(mut self) -> Self {
        self.no_verify_origin = true;
        self
    }
}

/// Process-wide configuration snapshot.
#[derive(Debug, Clone)]
pub struct Config {
    /// Client home directory; caches live underneath.
    pub home: PathBuf,

    /// API base URL.
    pub api_url: String,

    /// Configured repositories by name.
    pub repos: BTreeMap<String, RepoConfig>,

    /// Maximum concurrent fetches.
    pub http_concurrency: usize,

    /// Per-request total timeout.
    pub http_timeout: Duration,

    /// Serve only from the local cache.
    pub offline: bool,

    /// Skip TLS certificate verification.
    pub unsafe_https: bool,

    /// HTTP proxy URL.
    pub http_proxy: Option<String>,

    /// HTTPS proxy URL.
    pub https_proxy: Option<String>,

    /// Command used to render package diffs.
    pub diff_command: String,

    /// Time source.
    pub clock: Arc<dyn Clock>,
}

impl Default for Config {
    fn default() -> Self {
        let mut repos = BTreeMap::new();
        repos.insert(DEFAULT_REPO.to_string(), RepoConfig::hexpm());

        Self {
            home: default_home(),
            api_url: DEFAULT_API_URL.to_string(),
            repos,
            http_concurrency: DEFAULT_HTTP_CONCURRENCY,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            offline: false,
            unsafe_https: false,
            http_proxy: None,
            https_proxy: None,
            diff_command: "git diff --no-index __old__ __new__".to_string(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl Config {
    /// Build a configuration from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(home) = std::env::var("HEX_HOME") {
            config.home = PathBuf::from(home);
        }
        if let Ok(url) = std::env::var("HEX_API_URL") {
            config.api_url = url;
        }
        if let Ok(mirror) = std::env::var("HEX_MIRROR") {
            if let Some(repo) = config.repos.get_mut(DEFAULT_REPO) {
                repo.url = mirror.trim_end_matches('/').to_string();
            }
        }
        config.offline = env_flag("HEX_OFFLINE");
        config.unsafe_https = env_flag("HEX_UNSAFE_HTTPS");
        if env_flag("HEX_UNSAFE_REGISTRY") {
            for repo in config.repos.values_mut() {
                repo.no_verify_signature = true;
                repo.no_verify_origin = true;
            }
        }
        if let Some(concurrency) = std::env::var("HEX_HTTP_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.http_concurrency = concurrency;
        }
        config.http_proxy = std::env::var("HTTP_PROXY").ok();
        config.https_proxy = std::env::var("HTTPS_PROXY").ok();

        config
    }

    /// The repository configuration for `name`.
    pub fn repo(&self, name: &str) -> crate::Result<&RepoConfig> {
        self.repos.get(name).ok_or_else(|| crate::Error::Config {
            message: format!("unknown repository: {}", name),
        })
    }

    /// Directory holding cached registry envelopes.
    pub fn registry_cache_dir(&self) -> PathBuf {
        self.home.join("cache").join("registry")
    }

    /// Directory holding cached package tarballs.
    pub fn tarball_cache_dir(&self) -> PathBuf {
        self.home.join("cache").join("tarballs")
    }

    /// Set the home directory.
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }

    /// Add or replace a repository.
    pub fn with_repo(mut self, repo: RepoConfig) -> Self {
        self.repos.insert(repo.name.clone(), repo);
        self
    }

    /// Set the offline flag.
    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Set the fetch concurrency.
    pub fn with_http_concurrency(mut self, concurrency: usize) -> Self {
        self.http_concurrency = concurrency;
        self
    }

    /// Set the per-request timeout.
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Substitute the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| Path::new(".").to_path_buf())
        .join(".hex")
}
