//! Repository client: signed registry fetch and tarball download.
//!
//! Public API carries no status-code knowledge; all HTTP mapping and the
//! retry policy live in `http.rs`. Envelope verification ([`verify_envelope`])
//! and payload decoding ([`decode_package`]) are pure and usable without a
//! client instance.

use prost::Message;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use sha2::Sha512;
use tracing::debug;

use hexpack_version::{Requirement, Version};

use crate::config::{Config, RepoConfig};
use crate::error::{Error, Result};
use crate::proto;
use crate::types::{DependencyDecl, PackageOutcome, Release, Retirement};

mod http;

use http::{FetchOutcome, HttpBackend};
pub use http::ProgressFn;

const USER_AGENT_VALUE: &str = concat!("hexpack/", env!("CARGO_PKG_VERSION"));

/// Client for one or more configured repositories.
#[derive(Debug, Clone)]
pub struct RepoClient {
    http: HttpBackend,
}

impl RepoClient {
    /// Build a client from the configuration snapshot.
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT_VALUE)
            .timeout(config.http_timeout);

        if config.unsafe_https {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(proxy) = &config.http_proxy {
            builder = builder.proxy(reqwest::Proxy::http(proxy).map_err(|e| Error::Config {
                message: format!("invalid HTTP_PROXY: {}", e),
            })?);
        }
        if let Some(proxy) = &config.https_proxy {
            builder = builder.proxy(reqwest::Proxy::https(proxy).map_err(|e| Error::Config {
                message: format!("invalid HTTPS_PROXY: {}", e),
            })?);
        }

        let client = builder.build().map_err(|e| Error::Config {
            message: format!("failed to create HTTP client: {}", e),
        })?;

        Ok(Self {
            http: HttpBackend { client },
        })
    }

    /// Conditionally fetch a package's signed envelope.
    pub async fn get_package(
        &self,
        repo: &RepoConfig,
        name: &str,
        etag: Option<&str>,
    ) -> Result<PackageOutcome> {
        let url = format!("{}/packages/{}", repo.url.trim_end_matches('/'), name);
        debug!(url = %url, etag = ?etag, "fetching package");

        match self
            .http
            .get(&url, repo.auth_key.as_deref(), etag, None)
            .await?
        {
            FetchOutcome::NotModified => Ok(PackageOutcome::NotModified),
            FetchOutcome::Body { bytes, etag } => Ok(PackageOutcome::Fresh { body: bytes, etag }),
        }
    }

    /// Fetch a release tarball.
    pub async fn get_tarball(
        &self,
        repo: &RepoConfig,
        name: &str,
        version: &Version,
    ) -> Result<Vec<u8>> {
        self.get_tarball_with_progress(repo, name, version, None)
            .await
    }

    /// Fetch a release tarball, reporting received bytes to `progress`.
    pub async fn get_tarball_with_progress(
        &self,
        repo: &RepoConfig,
        name: &str,
        version: &Version,
        progress: Option<ProgressFn>,
    ) -> Result<Vec<u8>> {
        let url = format!(
            "{}/tarballs/{}-{}.tar",
            repo.url.trim_end_matches('/'),
            name,
            version
        );
        debug!(url = %url, "fetching tarball");

        match self
            .http
            .get(&url, repo.auth_key.as_deref(), None, progress.as_ref())
            .await?
        {
            FetchOutcome::Body { bytes, .. } => Ok(bytes),
            FetchOutcome::NotModified => Err(Error::HttpPermanent {
                status: 304,
                message: "unexpected 304 for tarball request".to_string(),
            }),
        }
    }

    /// Fetch a repository's PEM-encoded public key.
    pub async fn get_public_key(&self, repo: &RepoConfig) -> Result<Vec<u8>> {
        let url = format!("{}/public_key", repo.url.trim_end_matches('/'));
        debug!(url = %url, "fetching public key");

        match self
            .http
            .get(&url, repo.auth_key.as_deref(), None, None)
            .await?
        {
            FetchOutcome::Body { bytes, .. } => Ok(bytes),
            FetchOutcome::NotModified => Err(Error::HttpPermanent {
                status: 304,
                message: "unexpected 304 for public key request".to_string(),
            }),
        }
    }
}

/// Decode a signed envelope and verify its signature against the repo's key.
///
/// Verification is skipped when the repo sets `no_verify_signature`. A bad
/// signature is a trust failure and is never retried.
pub fn verify_envelope(envelope: &[u8], repo: &RepoConfig) -> Result<Vec<u8>> {
    let signed = proto::Signed::decode(envelope)?;

    if repo.no_verify_signature {
        debug!(repo = %repo.name, "signature verification disabled");
        return Ok(signed.payload);
    }

    let bad_signature = || Error::BadSignature {
        repo: repo.name.clone(),
    };

    let pem = repo.public_key.as_deref().ok_or_else(|| Error::Config {
        message: format!("repository {} has no public key configured", repo.name),
    })?;
    let key = RsaPublicKey::from_public_key_pem(pem).map_err(|e| Error::Config {
        message: format!("invalid public key for repository {}: {}", repo.name, e),
    })?;

    let verifying_key = VerifyingKey::<Sha512>::new(key);
    let signature = Signature::try_from(signed.signature.as_slice()).map_err(|_| bad_signature())?;
    verifying_key
        .verify(&signed.payload, &signature)
        .map_err(|_| bad_signature())?;

    Ok(signed.payload)
}

/// Decode a package payload and verify it names the expected origin.
///
/// Origin verification is skipped when the repo sets `no_verify_origin`.
pub fn decode_package(payload: &[u8], repo: &RepoConfig, name: &str) -> Result<Vec<Release>> {
    let package = proto::Package::decode(payload)?;

    if !repo.no_verify_origin && (package.repository != repo.name || package.name != name) {
        return Err(Error::OriginMismatch {
            expected_repo: repo.name.clone(),
            expected_name: name.to_string(),
            found_repo: package.repository,
            found_name: package.name,
        });
    }

    package.releases.into_iter().map(decode_release).collect()
}

fn decode_release(release: proto::Release) -> Result<Release> {
    let version = Version::parse(&release.version)?;

    let dependencies = release
        .dependencies
        .into_iter()
        .map(|dep| {
            let requirement = if dep.requirement.is_empty() {
                None
            } else {
                Some(Requirement::parse(&dep.requirement)?)
            };
            Ok(DependencyDecl {
                repo: (!dep.repository.is_empty()).then_some(dep.repository),
                name: dep.package,
                requirement,
                optional: dep.optional,
                app: (!dep.app.is_empty()).then_some(dep.app),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let retired = release.retired.map(|status| {
        let reason = proto::RetirementReason::try_from(status.reason)
            .map(|r| r.label())
            .unwrap_or("other");
        Retirement {
            reason: reason.to_string(),
            message: status.message,
        }
    });

    Ok(Release {
        version,
        checksum: release.inner_checksum,
        dependencies,
        // Registry payloads carry no manager information; this client
        // manages mix builds.
        managers: vec!["mix".to_string()],
        retired,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use rsa::pkcs1v15::SigningKey;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::signature::{SignatureEncoding, Signer};
    use rsa::RsaPrivateKey;

    fn test_keypair() -> (RsaPrivateKey, String) {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).expect("generate key");
        let pem = private
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .expect("encode public key");
        (private, pem)
    }

    fn sign(private: &RsaPrivateKey, payload: &[u8]) -> Vec<u8> {
        let signing_key = SigningKey::<Sha512>::new(private.clone());
        signing_key.sign(payload).to_bytes().to_vec()
    }

    fn empty_package(repo: &str, name: &str) -> Vec<u8> {
        proto::Package {
            repository: repo.to_string(),
            name: name.to_string(),
            releases: Vec::new(),
        }
        .encode_to_vec()
    }

    #[test]
    fn test_verify_and_decode_happy_path() {
        let (private, pem) = test_keypair();
        let repo = RepoConfig::new("hexpm", "https://repo.hex.pm").with_public_key(pem);

        let payload = empty_package("hexpm", "ecto");
        let envelope = proto::Signed {
            signature: sign(&private, &payload),
            payload: payload.clone(),
        }
        .encode_to_vec();

        let verified = verify_envelope(&envelope, &repo).unwrap();
        assert_eq!(verified, payload);

        let releases = decode_package(&verified, &repo, "ecto").unwrap();
        assert!(releases.is_empty());
    }

    #[test]
    fn test_verify_tampered_signature() {
        let (private, pem) = test_keypair();
        let repo = RepoConfig::new("hexpm", "https://repo.hex.pm").with_public_key(pem);

        let payload = empty_package("hexpm", "ecto");
        let mut signature = sign(&private, &payload);
        signature[0] ^= 0xff;
        let envelope = proto::Signed { payload, signature }.encode_to_vec();

        let err = verify_envelope(&envelope, &repo).unwrap_err();
        assert!(matches!(err, Error::BadSignature { repo } if repo == "hexpm"));
    }

    #[test]
    fn test_verify_garbage_signature() {
        let (private, pem) = test_keypair();
        let _ = private;
        let repo = RepoConfig::new("hexpm", "https://repo.hex.pm").with_public_key(pem);

        let envelope = proto::Signed {
            payload: empty_package("hexpm", "ecto"),
            signature: b"foobar".to_vec(),
        }
        .encode_to_vec();

        let err = verify_envelope(&envelope, &repo).unwrap_err();
        assert!(matches!(err, Error::BadSignature { .. }));
    }

    #[test]
    fn test_verify_skipped_when_disabled() {
        let repo = RepoConfig::new("hexpm", "https://repo.hex.pm").with_no_verify_signature();

        let payload = empty_package("hexpm", "ecto");
        let envelope = proto::Signed {
            payload: payload.clone(),
            signature: b"foobar".to_vec(),
        }
        .encode_to_vec();

        assert_eq!(verify_envelope(&envelope, &repo).unwrap(), payload);
    }

    #[test]
    fn test_origin_mismatch() {
        let repo = RepoConfig::new("other", "https://repo.other.dev").with_no_verify_signature();
        let payload = empty_package("hexpm", "ecto");

        let err = decode_package(&payload, &repo, "ecto").unwrap_err();
        match err {
            Error::OriginMismatch {
                expected_repo,
                found_repo,
                ..
            } => {
                assert_eq!(expected_repo, "other");
                assert_eq!(found_repo, "hexpm");
            }
            other => panic!("expected OriginMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_origin_mismatch_suppressed() {
        let repo = RepoConfig::new("other", "https://repo.other.dev")
            .with_no_verify_signature()
            .with_no_verify_origin();
        let payload = empty_package("hexpm", "ecto");

        assert!(decode_package(&payload, &repo, "ecto").is_ok());
    }

    #[test]
    fn test_decode_release_fields() {
        let payload = proto::Package {
            repository: "hexpm".into(),
            name: "phoenix".into(),
            releases: vec![proto::Release {
                version: "1.7.0".into(),
                inner_checksum: vec![0xaa; 32],
                dependencies: vec![
                    proto::Dependency {
                        package: "plug".into(),
                        requirement: "~> 1.14".into(),
                        optional: false,
                        app: String::new(),
                        repository: String::new(),
                    },
                    proto::Dependency {
                        package: "jason".into(),
                        requirement: "~> 1.0".into(),
                        optional: true,
                        app: "jason_app".into(),
                        repository: "acme".into(),
                    },
                ],
                retired: Some(proto::RetirementStatus {
                    reason: proto::RetirementReason::Deprecated as i32,
                    message: Some("use 1.7.1".into()),
                }),
            }],
        }
        .encode_to_vec();

        let repo = RepoConfig::new("hexpm", "https://repo.hex.pm").with_no_verify_signature();
        let releases = decode_package(&payload, &repo, "phoenix").unwrap();
        assert_eq!(releases.len(), 1);

        let release = &releases[0];
        assert_eq!(release.version, Version::parse("1.7.0").unwrap());
        assert_eq!(release.checksum_hex(), "aa".repeat(32));
        assert_eq!(release.managers, vec!["mix"]);

        let plug = &release.dependencies[0];
        assert_eq!(plug.name, "plug");
        assert!(plug.repo.is_none());
        assert!(!plug.optional);
        assert_eq!(plug.app_name(), "plug");

        let jason = &release.dependencies[1];
        assert!(jason.optional);
        assert_eq!(jason.repo.as_deref(), Some("acme"));
        assert_eq!(jason.app_name(), "jason_app");

        let retired = release.retired.as_ref().unwrap();
        assert_eq!(retired.reason, "deprecated");
        assert_eq!(retired.message.as_deref(), Some("use 1.7.1"));
    }

    #[test]
    fn test_decode_bad_version_fails() {
        let payload = proto::Package {
            repository: "hexpm".into(),
            name: "broken".into(),
            releases: vec![proto::Release {
                version: "not-a-version".into(),
                inner_checksum: Vec::new(),
                dependencies: Vec::new(),
                retired: None,
            }],
        }
        .encode_to_vec();

        let repo = RepoConfig::new("hexpm", "https://repo.hex.pm").with_no_verify_signature();
        let err = decode_package(&payload, &repo, "broken").unwrap_err();
        assert!(matches!(err, Error::Version(_)));
    }
}

#[cfg(test)]
mod http_tests {
    use super::*;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> Config {
        Config::default().with_http_timeout(std::time::Duration::from_secs(5))
    }

    fn repo_for(server: &MockServer) -> RepoConfig {
        RepoConfig::new("hexpm", server.uri())
    }

    #[tokio::test]
    async fn test_get_package_fresh() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/packages/ecto"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"envelope".to_vec())
                    .insert_header("etag", "\"abc123\""),
            )
            .mount(&server)
            .await;

        let client = RepoClient::new(&test_config()).unwrap();
        let outcome = client
            .get_package(&repo_for(&server), "ecto", None)
            .await
            .unwrap();

        match outcome {
            PackageOutcome::Fresh { body, etag } => {
                assert_eq!(body, b"envelope");
                assert_eq!(etag.as_deref(), Some("\"abc123\""));
            }
            other => panic!("expected Fresh, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_package_not_modified() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/packages/ecto"))
            .and(header("if-none-match", "\"abc123\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let client = RepoClient::new(&test_config()).unwrap();
        let outcome = client
            .get_package(&repo_for(&server), "ecto", Some("\"abc123\""))
            .await
            .unwrap();

        assert!(matches!(outcome, PackageOutcome::NotModified));
    }

    #[tokio::test]
    async fn test_auth_header_present_iff_key() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/packages/private"))
            .and(header("authorization", "secret-key"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let client = RepoClient::new(&test_config()).unwrap();
        let repo = repo_for(&server).with_auth_key("secret-key");
        let outcome = client.get_package(&repo, "private", None).await.unwrap();
        assert!(matches!(outcome, PackageOutcome::Fresh { .. }));
    }

    #[tokio::test]
    async fn test_no_auth_header_without_key() {
        let server = MockServer::start().await;

        // A request carrying an Authorization header hits this mock and fails.
        Mock::given(method("GET"))
            .and(path("/packages/public"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/packages/public"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;

        let client = RepoClient::new(&test_config()).unwrap();
        let outcome = client
            .get_package(&repo_for(&server), "public", None)
            .await
            .unwrap();
        assert!(matches!(outcome, PackageOutcome::Fresh { .. }));
    }

    #[tokio::test]
    async fn test_4xx_is_permanent_and_not_retried() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/packages/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = RepoClient::new(&test_config()).unwrap();
        let err = client
            .get_package(&repo_for(&server), "missing", None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::HttpPermanent { status: 404, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_5xx_retried_twice_then_fails() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/packages/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = RepoClient::new(&test_config()).unwrap();
        let err = client
            .get_package(&repo_for(&server), "flaky", None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::HttpTransient { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_get_tarball_with_progress() {
        let server = MockServer::start().await;
        let body = vec![0x42u8; 4096];

        Mock::given(method("GET"))
            .and(path("/tarballs/demo-1.0.0.tar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let seen = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        let seen_in_callback = seen.clone();
        let progress: ProgressFn = std::sync::Arc::new(move |bytes| {
            seen_in_callback.store(bytes, std::sync::atomic::Ordering::SeqCst);
        });

        let client = RepoClient::new(&test_config()).unwrap();
        let version = Version::parse("1.0.0").unwrap();
        let fetched = client
            .get_tarball_with_progress(&repo_for(&server), "demo", &version, Some(progress))
            .await
            .unwrap();

        assert_eq!(fetched, body);
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 4096);
    }

    #[tokio::test]
    async fn test_get_public_key() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/public_key"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"-----BEGIN PUBLIC KEY-----".to_vec()))
            .mount(&server)
            .await;

        let client = RepoClient::new(&test_config()).unwrap();
        let key = client.get_public_key(&repo_for(&server)).await.unwrap();
        assert!(key.starts_with(b"-----BEGIN PUBLIC KEY-----"));
    }
}
