//! OCI manifest construction.
//!
//! Each platform variant becomes a single-layer image manifest; the variants
//! are tied together by one image index. Everything here is deterministic
//! (`serde_json` maps are ordered), so the index digest of a build can be
//! computed locally and compared with what the registry already holds.

use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use super::{BuildOutput, Platform, PlatformArtifact};

pub const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";

/// `sha256:<hex>` digest of `bytes`.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Image config blob for a platform variant.
pub fn config_blob(platform: &Platform) -> Vec<u8> {
    let mut config = json!({
        "architecture": platform.architecture(),
        "os": platform.os(),
        "rootfs": { "type": "layers", "diff_ids": [] },
    });
    if let Some(variant) = platform.variant() {
        config["variant"] = Value::String(variant.to_string());
    }
    // Serializing a `Value` cannot fail.
    serde_json::to_vec(&config).unwrap_or_default()
}

/// Image manifest for one variant: its config blob plus the artifact as a layer.
pub fn image_manifest(variant: &PlatformArtifact) -> Vec<u8> {
    let config = config_blob(&variant.platform);
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": MANIFEST_MEDIA_TYPE,
        "config": {
            "mediaType": CONFIG_MEDIA_TYPE,
            "digest": sha256_digest(&config),
            "size": config.len(),
        },
        "layers": [{
            "mediaType": LAYER_MEDIA_TYPE,
            "digest": variant.digest,
            "size": variant.bytes.len(),
        }],
    });
    serde_json::to_vec(&manifest).unwrap_or_default()
}

/// Image index referencing every variant's manifest, in platform order.
pub fn image_index(output: &BuildOutput) -> Vec<u8> {
    let manifests: Vec<Value> = output
        .variants()
        .iter()
        .map(|variant| {
            let manifest = image_manifest(variant);
            let mut platform = json!({
                "architecture": variant.platform.architecture(),
                "os": variant.platform.os(),
            });
            if let Some(v) = variant.platform.variant() {
                platform["variant"] = Value::String(v.to_string());
            }
            json!({
                "mediaType": MANIFEST_MEDIA_TYPE,
                "digest": sha256_digest(&manifest),
                "size": manifest.len(),
                "platform": platform,
            })
        })
        .collect();

    let index = json!({
        "schemaVersion": 2,
        "mediaType": INDEX_MEDIA_TYPE,
        "manifests": manifests,
    });
    serde_json::to_vec(&index).unwrap_or_default()
}

/// Platforms listed by an image index, or `None` if `body` is not an index.
pub fn index_platforms(body: &[u8]) -> Option<Vec<Platform>> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let manifests = value.get("manifests")?.as_array()?;
    manifests
        .iter()
        .map(|entry| {
            let platform = entry.get("platform")?;
            let os = platform.get("os")?.as_str()?;
            let arch = platform.get("architecture")?.as_str()?;
            let spec = match platform.get("variant").and_then(Value::as_str) {
                Some(variant) => format!("{}/{}/{}", os, arch, variant),
                None => format!("{}/{}", os, arch),
            };
            spec.parse().ok()
        })
        .collect()
}
