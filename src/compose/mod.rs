//! Proposal composition.
//!
//! [`compose`] is pure: it reads the current desired-state document and an
//! [`ArtifactRef`] and returns the smallest [`DocumentDiff`] that points the
//! document at the artifact. The document is parsed with `serde_yaml` to
//! find which values to change, and the edits are then made line by line so
//! comments, quoting and ordering survive untouched.
//!
//! Two kinds of field are rewritten:
//! - `image:` values whose repository matches the artifact's repository
//! - `app.kubernetes.io/version` labels still carrying the old image tag

mod diff;

pub use diff::{DocumentDiff, LineEdit};

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_yaml::Value;

use crate::errors::ComposeError;
use crate::publish::ArtifactRef;

pub const VERSION_LABEL: &str = "app.kubernetes.io/version";

static IMAGE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(\s*(?:-\s+)?image:\s*)(["']?)([^"'\s#]+)(["']?)(\s*(?:#.*)?)$"#).unwrap()
});

static VERSION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(\s*(?:-\s+)?["']?app\.kubernetes\.io/version["']?:\s*)(["']?)([^"'\s#]*)(["']?)(\s*(?:#.*)?)$"#,
    )
    .unwrap()
});

/// Desired-state document as read from the state store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub path: String,
    pub content: String,
}

impl Document {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Image reference split into repository, tag and digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef<'a> {
    pub repository: &'a str,
    pub tag: Option<&'a str>,
    pub digest: Option<&'a str>,
}

impl<'a> ImageRef<'a> {
    pub fn parse(image: &'a str) -> Self {
        let (name, digest) = match image.split_once('@') {
            Some((name, digest)) => (name, Some(digest)),
            None => (image, None),
        };
        // A ':' after the last '/' separates the tag; one before it is a port.
        let slash = name.rfind('/').map_or(0, |i| i + 1);
        match name[slash..].rfind(':') {
            Some(i) => Self {
                repository: &name[..slash + i],
                tag: Some(&name[slash + i + 1..]),
                digest,
            },
            None => Self {
                repository: name,
                tag: None,
                digest,
            },
        }
    }

    /// Whether this reference names the artifact's repository, either fully
    /// qualified or as a registry-relative suffix (`team/app` for
    /// `registry.example.com/team/app`).
    pub fn matches(&self, repository: &str) -> bool {
        self.repository == repository
            || repository
                .strip_suffix(self.repository)
                .is_some_and(|head| head.ends_with('/'))
    }
}

/// Values found by walking the parsed documents.
#[derive(Debug, Default)]
struct Found {
    images: Vec<String>,
    versions: Vec<String>,
}

pub fn compose(document: &Document, artifact: &ArtifactRef) -> Result<DocumentDiff, ComposeError> {
    let found = scan(&document.content)?;

    let target = artifact.reference();
    let matching: Vec<&String> = found
        .images
        .iter()
        .filter(|image| ImageRef::parse(image).matches(&artifact.repository))
        .collect();
    if matching.is_empty() {
        return Err(ComposeError::NoImage {
            repository: artifact.repository.clone(),
        });
    }

    let old_tags: Vec<&str> = matching
        .iter()
        .filter(|image| image.as_str() != target)
        .filter_map(|image| ImageRef::parse(image).tag)
        .collect();
    let stale_versions = found
        .versions
        .iter()
        .filter(|v| old_tags.contains(&v.as_str()) && v.as_str() != artifact.tag)
        .count();

    let mut edits = Vec::new();
    let mut image_lines = 0;
    let mut version_lines = 0;

    for (idx, line) in document.content.lines().enumerate() {
        if let Some(caps) = IMAGE_LINE.captures(line) {
            let value = &caps[3];
            if !ImageRef::parse(value).matches(&artifact.repository) {
                continue;
            }
            image_lines += 1;
            if value != target {
                edits.push(LineEdit {
                    line: idx + 1,
                    old: line.to_string(),
                    new: format!("{}{}{}{}{}", &caps[1], &caps[2], target, &caps[4], &caps[5]),
                });
            }
        } else if let Some(caps) = VERSION_LINE.captures(line) {
            let value = &caps[3];
            if !old_tags.contains(&value) || value == artifact.tag {
                continue;
            }
            version_lines += 1;
            // Keep the label a string; an unquoted tag like `1.10` would parse as a float.
            let (open, close) = if caps[2].is_empty() {
                ("\"", "\"")
            } else {
                (&caps[2], &caps[4])
            };
            edits.push(LineEdit {
                line: idx + 1,
                old: line.to_string(),
                new: format!("{}{}{}{}{}", &caps[1], open, artifact.tag, close, &caps[5]),
            });
        }
    }

    if image_lines != matching.len() {
        return Err(ComposeError::Shape(format!(
            "{}: found {} image reference(s) to {} but {} editable `image:` line(s); \
             flow-style mappings, multi-line scalars and block-text occurrences are not supported",
            document.path,
            matching.len(),
            artifact.repository,
            image_lines
        )));
    }
    if version_lines != stale_versions {
        return Err(ComposeError::Shape(format!(
            "{}: {} label is not written as a plain `key: value` line",
            document.path, VERSION_LABEL
        )));
    }

    Ok(DocumentDiff {
        path: document.path.clone(),
        edits,
    })
}

/// Parse every YAML document in `content` and collect image and version values.
fn scan(content: &str) -> Result<Found, ComposeError> {
    if content.trim().is_empty() {
        return Err(ComposeError::Shape("document is empty".to_string()));
    }
    let mut found = Found::default();
    let mut any = false;
    for (n, doc) in serde_yaml::Deserializer::from_str(content).enumerate() {
        let value = Value::deserialize(doc)?;
        match value {
            Value::Null => continue,
            Value::Mapping(_) => {
                any = true;
                walk(&value, &mut found);
            }
            _ => {
                return Err(ComposeError::Shape(format!(
                    "document {} is not a mapping",
                    n + 1
                )));
            }
        }
    }
    if !any {
        return Err(ComposeError::Shape("document is empty".to_string()));
    }
    Ok(found)
}

fn walk(value: &Value, found: &mut Found) {
    match value {
        Value::Mapping(map) => {
            for (key, child) in map {
                match (key.as_str(), child) {
                    (Some("image"), Value::String(image)) => found.images.push(image.clone()),
                    (Some("labels"), Value::Mapping(labels)) => {
                        if let Some(version) = labels.get(VERSION_LABEL).and_then(scalar_text) {
                            found.versions.push(version);
                        }
                    }
                    _ => {}
                }
                walk(child, found);
            }
        }
        Value::Sequence(items) => items.iter().for_each(|item| walk(item, found)),
        Value::Tagged(tagged) => walk(&tagged.value, found),
        _ => {}
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn artifact(repository: &str, tag: &str) -> ArtifactRef {
        ArtifactRef {
            repository: repository.into(),
            tag: tag.into(),
            platforms: BTreeSet::new(),
            digest: "sha256:00".into(),
        }
    }

    const DEPLOYMENT: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: myapp
  labels:
    app.kubernetes.io/name: myapp
    app.kubernetes.io/version: \"initial\"
spec:
  template:
    spec:
      containers:
        - name: app
          image: myapp:initial # bumped by the pipeline
        - name: sidecar
          image: envoyproxy/envoy:v1.30
";

    #[test]
    fn test_replaces_image_and_version_label() {
        let doc = Document::new("deploy/app.yaml", DEPLOYMENT);
        let diff = compose(&doc, &artifact("myapp", "abc1234")).unwrap();
        assert_eq!(diff.edits.len(), 2);
        assert_eq!(diff.edits[0].line, 7);
        assert_eq!(diff.edits[0].new, "    app.kubernetes.io/version: \"abc1234\"");
        assert_eq!(diff.edits[1].line, 13);
        assert_eq!(diff.edits[1].new, "          image: myapp:abc1234 # bumped by the pipeline");

        let patched = diff.apply(DEPLOYMENT).unwrap();
        assert!(patched.contains("image: envoyproxy/envoy:v1.30"));
        assert!(!patched.contains("myapp:initial"));
    }

    #[test]
    fn test_already_current_document_yields_empty_diff() {
        let doc = Document::new("deploy/app.yaml", DEPLOYMENT);
        let first = compose(&doc, &artifact("myapp", "abc1234")).unwrap();
        let updated = Document::new("deploy/app.yaml", first.apply(DEPLOYMENT).unwrap());
        let second = compose(&updated, &artifact("myapp", "abc1234")).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_minimal_scenario_document() {
        let doc = Document::new("app.yaml", "image: myapp:initial\n");
        let diff = compose(&doc, &artifact("myapp", "abc1234")).unwrap();
        assert_eq!(diff.apply(&doc.content).unwrap(), "image: myapp:abc1234\n");
    }

    #[test]
    fn test_unrelated_label_is_left_alone() {
        let content = "\
metadata:
  labels:
    app.kubernetes.io/version: \"2.0\"
image: myapp:initial
";
        let diff = compose(&Document::new("a.yaml", content), &artifact("myapp", "abc1234")).unwrap();
        assert_eq!(diff.edits.len(), 1);
        assert_eq!(diff.edits[0].line, 4);
    }

    #[test]
    fn test_registry_relative_name_matches_qualified_repository() {
        let content = "image: \"team/myapp:initial\"\n";
        let diff = compose(
            &Document::new("a.yaml", content),
            &artifact("registry.example.com/team/myapp", "abc1234"),
        )
        .unwrap();
        assert_eq!(diff.edits[0].new, "image: \"registry.example.com/team/myapp:abc1234\"");
    }

    #[test]
    fn test_multi_document_stream() {
        let content = "\
kind: Service
metadata:
  name: myapp
---
kind: Deployment
spec:
  containers:
    - image: myapp:initial
";
        let diff = compose(&Document::new("a.yaml", content), &artifact("myapp", "def5678")).unwrap();
        assert_eq!(diff.edits.len(), 1);
        assert_eq!(diff.edits[0].new, "    - image: myapp:def5678");
    }

    #[test]
    fn test_digest_pinned_image_is_replaced() {
        let content = "image: myapp:initial@sha256:abcd\n";
        let diff = compose(&Document::new("a.yaml", content), &artifact("myapp", "abc1234")).unwrap();
        assert_eq!(diff.edits[0].new, "image: myapp:abc1234");
    }

    #[test]
    fn test_no_matching_image_is_unparseable() {
        let content = "image: other:1.0\n";
        let err = compose(&Document::new("a.yaml", content), &artifact("myapp", "abc1234")).unwrap_err();
        assert!(matches!(err, ComposeError::NoImage { .. }));
    }

    #[test]
    fn test_invalid_yaml_is_unparseable() {
        let err = compose(
            &Document::new("a.yaml", "image: [unclosed\n"),
            &artifact("myapp", "abc1234"),
        )
        .unwrap_err();
        assert!(matches!(err, ComposeError::Yaml(_)));
    }

    #[test]
    fn test_non_mapping_document_is_unparseable() {
        let err = compose(
            &Document::new("a.yaml", "- image: myapp:initial\n"),
            &artifact("myapp", "abc1234"),
        )
        .unwrap_err();
        assert!(matches!(err, ComposeError::Shape(_)));
    }

    #[test]
    fn test_flow_style_image_is_unparseable() {
        let err = compose(
            &Document::new("a.yaml", "containers: [{name: app, image: myapp:initial}]\n"),
            &artifact("myapp", "abc1234"),
        )
        .unwrap_err();
        assert!(matches!(err, ComposeError::Shape(_)));
    }

    #[test]
    fn test_image_text_inside_block_scalar_is_unparseable() {
        let content = "\
image: myapp:initial
notes: |
  image: myapp:initial
";
        let err = compose(&Document::new("a.yaml", content), &artifact("myapp", "abc1234")).unwrap_err();
        assert!(matches!(err, ComposeError::Shape(_)));
    }

    #[test]
    fn test_empty_document_is_unparseable() {
        let err = compose(&Document::new("a.yaml", ""), &artifact("myapp", "abc1234")).unwrap_err();
        assert!(matches!(err, ComposeError::Shape(_)));
    }

    #[test]
    fn test_image_ref_parse() {
        let r = ImageRef::parse("localhost:5000/team/app:v1@sha256:ff");
        assert_eq!(r.repository, "localhost:5000/team/app");
        assert_eq!(r.tag, Some("v1"));
        assert_eq!(r.digest, Some("sha256:ff"));
        let r = ImageRef::parse("localhost:5000/app");
        assert_eq!(r.repository, "localhost:5000/app");
        assert_eq!(r.tag, None);
        assert!(!ImageRef::parse("xmyapp:1").matches("myapp"));
        assert!(!ImageRef::parse("myapp:1").matches("registry.test/xmyapp"));
    }
}
