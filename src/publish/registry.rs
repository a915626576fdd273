//! Artifact registry client.
//!
//! [`HttpRegistry`] speaks the OCI distribution API. Blobs and per-platform
//! manifests are pushed by digest first, so nothing is reachable by tag until
//! the final index `PUT`, which makes the tag appear atomically.

use std::collections::BTreeSet;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};

use super::{BuildOutput, Platform, oci};
use crate::errors::PublishError;

/// What the registry holds under a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArtifact {
    pub digest: String,
    pub platforms: BTreeSet<Platform>,
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Registry-qualified repository this client publishes to.
    fn repository(&self) -> &str;

    /// Artifact currently under `tag`, if any.
    async fn lookup(&self, tag: &str) -> Result<Option<RemoteArtifact>, PublishError>;

    /// Upload `output` and make it visible under `tag`. Returns the index digest.
    async fn push(&self, output: &BuildOutput, tag: &str) -> Result<String, PublishError>;

    /// Point `alias` at whatever `tag` currently references.
    async fn alias(&self, tag: &str, alias: &str) -> Result<(), PublishError>;
}

#[derive(Debug, Clone)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

/// OCI distribution API client for a single repository.
pub struct HttpRegistry {
    client: reqwest::Client,
    repository: String,
    base: Url,
    name: String,
    credentials: Option<RegistryCredentials>,
}

impl HttpRegistry {
    /// `repository` is `host[:port]/path/to/name`. `insecure` switches to plain HTTP.
    pub fn new(
        repository: &str,
        credentials: Option<RegistryCredentials>,
        insecure: bool,
    ) -> Result<Self, PublishError> {
        let (host, name) = split_repository(repository).ok_or_else(|| PublishError::Refused {
            status: 0,
            message: format!(
                "invalid repository '{}': expected host/name, e.g. registry.example.com/team/app",
                repository
            ),
        })?;
        let scheme = if insecure { "http" } else { "https" };
        let base = Url::parse(&format!("{}://{}/v2/", scheme, host)).map_err(|e| PublishError::Refused {
            status: 0,
            message: format!("invalid registry host '{}': {}", host, e),
        })?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("promote/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PublishError::Transient(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            repository: repository.to_string(),
            base,
            name: name.to_string(),
            credentials,
        })
    }

    fn url(&self, path: &str) -> Result<Url, PublishError> {
        self.base
            .join(&format!("{}/{}", self.name, path))
            .map_err(|e| PublishError::Refused {
                status: 0,
                message: format!("invalid registry path '{}': {}", path, e),
            })
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let req = self.client.request(method, url);
        match &self.credentials {
            Some(c) => req.basic_auth(&c.username, Some(&c.password)),
            None => req,
        }
    }

    async fn fetch_index(&self, reference: &str) -> Result<Option<(String, Vec<u8>)>, PublishError> {
        let resp = self
            .request(Method::GET, self.url(&format!("manifests/{}", reference))?)
            .header("Accept", oci::INDEX_MEDIA_TYPE)
            .send()
            .await
            .map_err(network_error)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), &format!("GET manifest {}", reference)));
        }
        let header_digest = resp
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await.map_err(network_error)?.to_vec();
        let digest = header_digest.unwrap_or_else(|| oci::sha256_digest(&body));
        Ok(Some((digest, body)))
    }

    async fn blob_exists(&self, digest: &str) -> Result<bool, PublishError> {
        let resp = self
            .request(Method::HEAD, self.url(&format!("blobs/{}", digest))?)
            .send()
            .await
            .map_err(network_error)?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(status_error(s, &format!("HEAD blob {}", digest))),
        }
    }

    async fn upload_blob(&self, digest: &str, bytes: &[u8]) -> Result<(), PublishError> {
        if self.blob_exists(digest).await? {
            tracing::debug!(digest, "blob already present");
            return Ok(());
        }

        let start = self
            .request(Method::POST, self.url("blobs/uploads/")?)
            .send()
            .await
            .map_err(network_error)?;
        if !start.status().is_success() {
            return Err(status_error(start.status(), "start blob upload"));
        }
        let location = start
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| PublishError::Transient("blob upload response had no Location".to_string()))?;
        let mut upload = start.url().join(location).map_err(|e| PublishError::Refused {
            status: start.status().as_u16(),
            message: format!("bad upload location '{}': {}", location, e),
        })?;
        upload.query_pairs_mut().append_pair("digest", digest);

        let resp = self
            .request(Method::PUT, upload)
            .header("Content-Type", "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(network_error)?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), &format!("upload blob {}", digest)));
        }
        tracing::debug!(digest, size = bytes.len(), "blob uploaded");
        Ok(())
    }

    async fn put_manifest(&self, reference: &str, media_type: &str, body: Vec<u8>) -> Result<(), PublishError> {
        let resp = self
            .request(Method::PUT, self.url(&format!("manifests/{}", reference))?)
            .header("Content-Type", media_type)
            .body(body)
            .send()
            .await
            .map_err(network_error)?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), &format!("PUT manifest {}", reference)));
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryClient for HttpRegistry {
    fn repository(&self) -> &str {
        &self.repository
    }

    async fn lookup(&self, tag: &str) -> Result<Option<RemoteArtifact>, PublishError> {
        let Some((digest, body)) = self.fetch_index(tag).await? else {
            return Ok(None);
        };
        let platforms = oci::index_platforms(&body).ok_or_else(|| PublishError::Conflict {
            tag: tag.to_string(),
            message: "tag holds something other than a multi-platform index".to_string(),
        })?;
        Ok(Some(RemoteArtifact {
            digest,
            platforms: platforms.into_iter().collect(),
        }))
    }

    async fn push(&self, output: &BuildOutput, tag: &str) -> Result<String, PublishError> {
        // Variants upload concurrently; nothing is visible until the index lands.
        futures::future::try_join_all(output.variants().iter().map(|variant| async move {
            let config = oci::config_blob(&variant.platform);
            self.upload_blob(&oci::sha256_digest(&config), &config).await?;
            self.upload_blob(&variant.digest, &variant.bytes).await?;

            let manifest = oci::image_manifest(variant);
            let manifest_digest = oci::sha256_digest(&manifest);
            self.put_manifest(&manifest_digest, oci::MANIFEST_MEDIA_TYPE, manifest)
                .await
        }))
        .await?;

        let index = oci::image_index(output);
        let digest = oci::sha256_digest(&index);
        self.put_manifest(tag, oci::INDEX_MEDIA_TYPE, index).await?;
        tracing::info!(repository = %self.repository, tag, digest = %digest, "index pushed");
        Ok(digest)
    }

    async fn alias(&self, tag: &str, alias: &str) -> Result<(), PublishError> {
        let (_, body) = self.fetch_index(tag).await?.ok_or_else(|| PublishError::Refused {
            status: 404,
            message: format!("cannot alias missing tag {}", tag),
        })?;
        self.put_manifest(alias, oci::INDEX_MEDIA_TYPE, body).await
    }
}

/// Split `host[:port]/name` into host and repository name.
pub fn split_repository(repository: &str) -> Option<(&str, &str)> {
    let (host, name) = repository.trim().split_once('/')?;
    let host_ok = !host.is_empty() && (host.contains('.') || host.contains(':') || host == "localhost");
    let name_ok = !name.is_empty()
        && name.split('/').all(|seg| {
            !seg.is_empty()
                && seg
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        });
    (host_ok && name_ok).then_some((host, name))
}

/// 401/403 are credential problems; 408/429/5xx are worth retrying; any
/// other status means the registry refused the content itself.
pub fn status_error(status: StatusCode, what: &str) -> PublishError {
    let message = format!("{} returned {}", what, status);
    match status.as_u16() {
        401 | 403 => PublishError::Auth(message),
        408 | 429 | 500..=599 => PublishError::Transient(message),
        code => PublishError::Refused { status: code, message },
    }
}

fn network_error(err: reqwest::Error) -> PublishError {
    PublishError::Transient(format!("registry request failed: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{Classify, ErrorKind};

    #[test]
    fn test_split_repository() {
        assert_eq!(
            split_repository("registry.example.com/team/app"),
            Some(("registry.example.com", "team/app"))
        );
        assert_eq!(split_repository("localhost:5000/app"), Some(("localhost:5000", "app")));
        assert_eq!(split_repository("localhost/app"), Some(("localhost", "app")));
        assert_eq!(split_repository("app"), None);
        assert_eq!(split_repository("team/app"), None);
        assert_eq!(split_repository("registry.example.com/Team/App"), None);
        assert_eq!(split_repository("registry.example.com//app"), None);
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(status_error(StatusCode::UNAUTHORIZED, "x").kind(), ErrorKind::AuthFailure);
        assert_eq!(status_error(StatusCode::FORBIDDEN, "x").kind(), ErrorKind::AuthFailure);
        assert_eq!(
            status_error(StatusCode::SERVICE_UNAVAILABLE, "x").kind(),
            ErrorKind::TransientPublishFailure
        );
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS, "x").kind(),
            ErrorKind::TransientPublishFailure
        );
        assert_eq!(
            status_error(StatusCode::BAD_REQUEST, "x").kind(),
            ErrorKind::BuildFailure
        );
    }

    #[test]
    fn test_new_builds_v2_base_url() {
        let registry = HttpRegistry::new("localhost:5000/team/app", None, true).unwrap();
        assert_eq!(registry.repository(), "localhost:5000/team/app");
        assert_eq!(
            registry.url("manifests/abc1234").unwrap().as_str(),
            "http://localhost:5000/v2/team/app/manifests/abc1234"
        );
    }

    #[test]
    fn test_new_rejects_bare_name() {
        assert!(HttpRegistry::new("myapp", None, false).is_err());
    }
}
