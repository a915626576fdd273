//! Artifact publication.
//!
//! ## Overview
//!
//! [`Publisher::publish`] turns a revision into an [`ArtifactRef`]:
//!
//! ```text
//!   build (Builder)           no registry traffic before this succeeds
//!        │
//!   lookup(tag)               existing index with same platforms → reuse
//!        │
//!   push(output, tag)         blobs + manifests by digest, then the index
//!        │                    under the tag (the atomic visibility point)
//!   alias(tag, "latest")      best effort, failures only logged
//! ```
//!
//! | Module     | Responsibility                                          |
//! |------------|---------------------------------------------------------|
//! | `builder`  | `Builder` trait, `CommandBuilder` (external build tool) |
//! | `registry` | `RegistryClient` trait, `HttpRegistry` (OCI API)        |
//! | `oci`      | Deterministic manifest/index construction               |

pub mod builder;
pub mod oci;
pub mod registry;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::errors::PublishError;
use crate::retry::{RetryPolicy, with_retry};
use crate::revision::Revision;

pub use builder::{Builder, CommandBuilder};
pub use registry::{HttpRegistry, RegistryClient, RegistryCredentials, RemoteArtifact};

/// Target platform in `os/arch[/variant]` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Platform {
    os: String,
    architecture: String,
    variant: Option<String>,
}

impl Platform {
    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }

    /// Form usable in file names: `linux-arm64-v8`.
    pub fn slug(&self) -> String {
        self.to_string().replace('/', "-")
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let valid = |p: &str| {
            !p.is_empty()
                && p.chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        };
        match parts.as_slice() {
            [os, arch] if valid(os) && valid(arch) => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: None,
            }),
            [os, arch, variant] if valid(os) && valid(arch) && valid(variant) => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: Some(variant.to_string()),
            }),
            _ => Err(format!(
                "Invalid platform '{}'. Expected os/arch or os/arch/variant, e.g. linux/amd64",
                s
            )),
        }
    }
}

impl TryFrom<String> for Platform {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Platform> for String {
    fn from(value: Platform) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.variant {
            Some(variant) => write!(f, "{}/{}/{}", self.os, self.architecture, variant),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

/// Build output for one platform.
#[derive(Debug, Clone)]
pub struct PlatformArtifact {
    pub platform: Platform,
    pub bytes: Vec<u8>,
    /// `sha256:` digest of `bytes`.
    pub digest: String,
}

impl PlatformArtifact {
    pub fn new(platform: Platform, bytes: Vec<u8>) -> Self {
        let digest = oci::sha256_digest(&bytes);
        Self {
            platform,
            bytes,
            digest,
        }
    }
}

/// Everything one build produced, one variant per platform, sorted by platform.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    variants: Vec<PlatformArtifact>,
}

impl BuildOutput {
    pub fn new(mut variants: Vec<PlatformArtifact>) -> Self {
        variants.sort_by(|a, b| a.platform.cmp(&b.platform));
        variants.dedup_by(|a, b| a.platform == b.platform);
        Self { variants }
    }

    pub fn variants(&self) -> &[PlatformArtifact] {
        &self.variants
    }

    pub fn platforms(&self) -> BTreeSet<Platform> {
        self.variants.iter().map(|v| v.platform.clone()).collect()
    }

    /// Digest the image index for this output will have in any registry.
    pub fn index_digest(&self) -> String {
        oci::sha256_digest(&oci::image_index(self))
    }
}

/// Published, immutable artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Registry-qualified repository, e.g. `registry.example.com/team/myapp`.
    pub repository: String,
    /// Revision-derived tag.
    pub tag: String,
    pub platforms: BTreeSet<Platform>,
    pub digest: String,
}

impl ArtifactRef {
    /// `repository:tag`, the form written into desired-state documents.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.reference(), self.digest)
    }
}

/// Per-tag async locks so two in-process runs for the same revision never
/// race on the tag.
#[derive(Default)]
struct TagLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TagLocks {
    fn get(&self, tag: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(tag.to_string()).or_default())
    }
}

/// Builds and uploads artifacts, idempotently per revision.
pub struct Publisher {
    builder: Arc<dyn Builder>,
    registry: Arc<dyn RegistryClient>,
    retry: RetryPolicy,
    alias: Option<String>,
    locks: TagLocks,
}

impl Publisher {
    pub fn new(builder: Arc<dyn Builder>, registry: Arc<dyn RegistryClient>, retry: RetryPolicy) -> Self {
        Self {
            builder,
            registry,
            retry,
            alias: Some("latest".to_string()),
            locks: TagLocks::default(),
        }
    }

    /// Floating alias moved after each successful publish; `None` disables it.
    pub fn with_alias(mut self, alias: Option<String>) -> Self {
        self.alias = alias.filter(|a| !a.trim().is_empty());
        self
    }

    pub fn repository(&self) -> &str {
        self.registry.repository()
    }

    /// Reference `publish` would produce, without building or uploading.
    /// The digest is unknown and left empty.
    pub fn planned(&self, revision: &Revision, platforms: &[Platform]) -> ArtifactRef {
        ArtifactRef {
            repository: self.repository().to_string(),
            tag: revision.as_str().to_string(),
            platforms: platforms.iter().cloned().collect(),
            digest: String::new(),
        }
    }

    pub async fn publish(
        &self,
        revision: &Revision,
        context: &Path,
        platforms: &[Platform],
    ) -> Result<ArtifactRef, PublishError> {
        let tag = revision.as_str().to_string();
        let wanted: BTreeSet<Platform> = platforms.iter().cloned().collect();
        if wanted.is_empty() {
            return Err(PublishError::Build {
                platform: "-".to_string(),
                message: "no target platforms configured".to_string(),
            });
        }

        let lock = self.locks.get(&tag);
        let _guard = lock.lock().await;

        let ordered: Vec<Platform> = wanted.iter().cloned().collect();
        let output = self.builder.build(revision, context, &ordered).await?;
        if output.platforms() != wanted {
            return Err(PublishError::Build {
                platform: ordered
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
                message: "builder did not produce every requested platform".to_string(),
            });
        }
        let local_digest = output.index_digest();

        let registry = &self.registry;
        let existing = with_retry(&self.retry, "registry lookup", |_| registry.lookup(&tag)).await?;

        let digest = match existing {
            Some(remote) => self.reconcile(&tag, &wanted, &local_digest, remote)?,
            None => {
                let output = &output;
                let tag = tag.as_str();
                with_retry(&self.retry, "registry push", |attempt| async move {
                    // A push that timed out may still have landed.
                    if attempt > 1
                        && let Some(remote) = registry.lookup(tag).await?
                        && remote.platforms == output.platforms()
                    {
                        tracing::info!(tag, attempt, "earlier push attempt landed, not re-uploading");
                        return Ok(remote.digest);
                    }
                    registry.push(output, tag).await
                })
                .await?
            }
        };

        let artifact = ArtifactRef {
            repository: self.registry.repository().to_string(),
            tag: tag.clone(),
            platforms: wanted,
            digest,
        };
        tracing::info!(artifact = %artifact, "artifact published");

        self.move_alias(&tag).await;
        Ok(artifact)
    }

    /// Decide what to do with an artifact already under the tag.
    fn reconcile(
        &self,
        tag: &str,
        wanted: &BTreeSet<Platform>,
        local_digest: &str,
        remote: RemoteArtifact,
    ) -> Result<String, PublishError> {
        if &remote.platforms != wanted {
            return Err(PublishError::Conflict {
                tag: tag.to_string(),
                message: format!(
                    "published for [{}], requested [{}]",
                    join_platforms(&remote.platforms),
                    join_platforms(wanted)
                ),
            });
        }
        if remote.digest != local_digest {
            // Non-reproducible build; the first published artifact stays authoritative.
            tracing::warn!(
                tag,
                remote = %remote.digest,
                local = %local_digest,
                "rebuild differs from published artifact, keeping the published one"
            );
        } else {
            tracing::info!(tag, digest = %remote.digest, "artifact already published, skipping upload");
        }
        Ok(remote.digest)
    }

    async fn move_alias(&self, tag: &str) {
        let Some(alias) = self.alias.as_deref() else {
            return;
        };
        let once = RetryPolicy::once(self.retry.call_timeout);
        let registry = &self.registry;
        if let Err(e) = with_retry(&once, "alias update", |_| registry.alias(tag, alias)).await {
            tracing::warn!(tag, alias, error = %e, "failed to move alias (artifact is still published)");
        }
    }
}

fn join_platforms(platforms: &BTreeSet<Platform>) -> String {
    platforms
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{Classify, ErrorKind};
    use crate::testing::{MemoryRegistry, RegistryFault, ScriptedBuilder, fast_retry};

    fn platforms(list: &[&str]) -> Vec<Platform> {
        list.iter().map(|p| p.parse().unwrap()).collect()
    }

    fn rev(id: &str) -> Revision {
        Revision::parse(id).unwrap()
    }

    fn publisher(builder: &Arc<ScriptedBuilder>, registry: &Arc<MemoryRegistry>) -> Publisher {
        Publisher::new(builder.clone(), registry.clone(), fast_retry())
    }

    #[test]
    fn test_platform_parse_and_display() {
        let p: Platform = "linux/arm64/v8".parse().unwrap();
        assert_eq!(p.os(), "linux");
        assert_eq!(p.architecture(), "arm64");
        assert_eq!(p.variant(), Some("v8"));
        assert_eq!(p.to_string(), "linux/arm64/v8");
        assert_eq!(p.slug(), "linux-arm64-v8");
        assert!("linux".parse::<Platform>().is_err());
        assert!("Linux/AMD64".parse::<Platform>().is_err());
        assert!("linux//amd64".parse::<Platform>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_returns_revision_tagged_ref() {
        let builder = Arc::new(ScriptedBuilder::default());
        let registry = Arc::new(MemoryRegistry::new("registry.test/myapp"));
        let artifact = publisher(&builder, &registry)
            .publish(&rev("abc1234"), Path::new("."), &platforms(&["linux/amd64"]))
            .await
            .unwrap();
        assert_eq!(artifact.reference(), "registry.test/myapp:abc1234");
        assert_eq!(artifact.platforms.len(), 1);
        assert!(artifact.digest.starts_with("sha256:"));
        assert_eq!(registry.uploads(), 1);
        assert_eq!(registry.tag_digest("latest"), Some(artifact.digest.clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_twice_uploads_once() {
        let builder = Arc::new(ScriptedBuilder::default());
        let registry = Arc::new(MemoryRegistry::new("registry.test/myapp"));
        let publisher = publisher(&builder, &registry);
        let targets = platforms(&["linux/amd64", "linux/arm64"]);
        let first = publisher.publish(&rev("abc1234"), Path::new("."), &targets).await.unwrap();
        let second = publisher.publish(&rev("abc1234"), Path::new("."), &targets).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.uploads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_publish_of_same_revision_uploads_once() {
        let builder = Arc::new(ScriptedBuilder::default());
        let registry = Arc::new(MemoryRegistry::new("registry.test/myapp"));
        let publisher = Arc::new(publisher(&builder, &registry));
        let targets = platforms(&["linux/amd64"]);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let publisher = Arc::clone(&publisher);
                let targets = targets.clone();
                tokio::spawn(async move {
                    publisher.publish(&rev("abc1234"), Path::new("."), &targets).await
                })
            })
            .collect();
        let refs: Vec<ArtifactRef> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();
        assert!(refs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(registry.uploads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_failure_never_touches_registry() {
        let builder = Arc::new(ScriptedBuilder::failing("compile error"));
        let registry = Arc::new(MemoryRegistry::new("registry.test/myapp"));
        let err = publisher(&builder, &registry)
            .publish(&rev("abc1234"), Path::new("."), &platforms(&["linux/amd64"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BuildFailure);
        assert_eq!(registry.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_push_then_success_leaves_one_artifact() {
        let builder = Arc::new(ScriptedBuilder::default());
        let registry = Arc::new(MemoryRegistry::new("registry.test/myapp"));
        registry.fail_push(RegistryFault::Transient, 1);
        let artifact = publisher(&builder, &registry)
            .publish(&rev("abc1234"), Path::new("."), &platforms(&["linux/amd64"]))
            .await
            .unwrap();
        assert_eq!(registry.uploads(), 1);
        assert_eq!(registry.tag_digest("abc1234"), Some(artifact.digest));
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_reported_failed_but_landed_is_not_repeated() {
        let builder = Arc::new(ScriptedBuilder::default());
        let registry = Arc::new(MemoryRegistry::new("registry.test/myapp"));
        registry.fail_push(RegistryFault::LandedThenTransient, 1);
        publisher(&builder, &registry)
            .publish(&rev("abc1234"), Path::new("."), &platforms(&["linux/amd64"]))
            .await
            .unwrap();
        assert_eq!(registry.uploads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_not_retried() {
        let builder = Arc::new(ScriptedBuilder::default());
        let registry = Arc::new(MemoryRegistry::new("registry.test/myapp"));
        registry.fail_push(RegistryFault::Auth, 10);
        let err = publisher(&builder, &registry)
            .publish(&rev("abc1234"), Path::new("."), &platforms(&["linux/amd64"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
        assert_eq!(registry.push_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhaustion_is_reported() {
        let builder = Arc::new(ScriptedBuilder::default());
        let registry = Arc::new(MemoryRegistry::new("registry.test/myapp"));
        registry.fail_push(RegistryFault::Transient, 100);
        let err = publisher(&builder, &registry)
            .publish(&rev("abc1234"), Path::new("."), &platforms(&["linux/amd64"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientPublishFailure);
        assert_eq!(registry.push_attempts(), fast_retry().max_attempts);
        assert_eq!(registry.tag_digest("abc1234"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alias_failure_does_not_fail_publish() {
        let builder = Arc::new(ScriptedBuilder::default());
        let registry = Arc::new(MemoryRegistry::new("registry.test/myapp"));
        registry.fail_alias(true);
        let artifact = publisher(&builder, &registry)
            .publish(&rev("abc1234"), Path::new("."), &platforms(&["linux/amd64"]))
            .await;
        assert!(artifact.is_ok());
        assert_eq!(registry.tag_digest("latest"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alias_can_be_disabled() {
        let builder = Arc::new(ScriptedBuilder::default());
        let registry = Arc::new(MemoryRegistry::new("registry.test/myapp"));
        publisher(&builder, &registry)
            .with_alias(None)
            .publish(&rev("abc1234"), Path::new("."), &platforms(&["linux/amd64"]))
            .await
            .unwrap();
        assert_eq!(registry.tag_digest("latest"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_platform_set_conflicts() {
        let builder = Arc::new(ScriptedBuilder::default());
        let registry = Arc::new(MemoryRegistry::new("registry.test/myapp"));
        let publisher = publisher(&builder, &registry);
        publisher
            .publish(&rev("abc1234"), Path::new("."), &platforms(&["linux/amd64"]))
            .await
            .unwrap();
        let err = publisher
            .publish(
                &rev("abc1234"),
                Path::new("."),
                &platforms(&["linux/amd64", "linux/arm64"]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArtifactConflict);
        assert_eq!(registry.uploads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_reproducible_rebuild_keeps_published_digest() {
        let builder = Arc::new(ScriptedBuilder::default());
        let registry = Arc::new(MemoryRegistry::new("registry.test/myapp"));
        let publisher = publisher(&builder, &registry);
        let targets = platforms(&["linux/amd64"]);
        let first = publisher.publish(&rev("abc1234"), Path::new("."), &targets).await.unwrap();
        builder.set_salt("different bytes");
        let second = publisher.publish(&rev("abc1234"), Path::new("."), &targets).await.unwrap();
        assert_eq!(first.digest, second.digest);
        assert_eq!(registry.uploads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_platform_list_is_a_build_failure() {
        let builder = Arc::new(ScriptedBuilder::default());
        let registry = Arc::new(MemoryRegistry::new("registry.test/myapp"));
        let err = publisher(&builder, &registry)
            .publish(&rev("abc1234"), Path::new("."), &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BuildFailure);
        assert_eq!(builder.builds(), 0);
    }
}
