//! Revision identification.
//!
//! Turns the source reference carried by a trigger into a short identifier
//! that is safe to use both as an artifact tag and as a branch-name suffix:
//! lowercase `[a-z0-9._-]`, starting with an alphanumeric, at most
//! [`MAX_REVISION_LEN`] characters.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::RevisionError;

/// Upper bound on identifier length (fits a DNS label and a registry tag).
pub const MAX_REVISION_LEN: usize = 63;

/// Hex characters of content hash appended to non-commit references.
const HASH_SUFFIX_LEN: usize = 8;

/// Event that starts a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    /// Source revision as given by the caller (commit id, tag, branch name).
    /// When absent the build context's git `HEAD` is used.
    pub revision: Option<String>,
    /// Directory holding the files to build.
    pub context: PathBuf,
    /// Logical pipeline track the revision is promoted along.
    pub lane: String,
}

impl Trigger {
    pub fn new(revision: Option<&str>, context: impl Into<PathBuf>, lane: &str) -> Self {
        Self {
            revision: revision.map(str::to_string),
            context: context.into(),
            lane: lane.to_string(),
        }
    }
}

/// Immutable identifier of a source revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    /// Wrap an identifier that is already known to be well formed.
    pub fn parse(id: &str) -> Result<Self, RevisionError> {
        if is_well_formed(id) {
            Ok(Self(id.to_string()))
        } else {
            Err(RevisionError::Unusable {
                value: id.to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Branch used for this revision's proposal, e.g. `update-abc1234`.
    pub fn branch_name(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.0)
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives [`Revision`]s from triggers.
#[derive(Debug, Clone)]
pub struct RevisionIdentifier {
    abbrev_len: usize,
}

impl Default for RevisionIdentifier {
    fn default() -> Self {
        Self { abbrev_len: 7 }
    }
}

impl RevisionIdentifier {
    /// `abbrev_len` is clamped to 4..=40 (the range git itself accepts).
    pub fn new(abbrev_len: usize) -> Self {
        Self {
            abbrev_len: abbrev_len.clamp(4, 40),
        }
    }

    pub fn identify(&self, trigger: &Trigger) -> Result<Revision, RevisionError> {
        match trigger.revision.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => self.from_reference(raw),
            _ => self.from_checkout(&trigger.context),
        }
    }

    /// Identifier for an explicit reference. Commit ids are abbreviated;
    /// anything else is slugified and suffixed with a hash of the original,
    /// so distinct references never share an identifier.
    pub fn from_reference(&self, raw: &str) -> Result<Revision, RevisionError> {
        if is_commit_id(raw) {
            let id = raw.to_ascii_lowercase();
            let len = id.len().min(self.abbrev_len);
            return Ok(Revision(id[..len].to_string()));
        }

        let slug = slugify(raw);
        if slug.is_empty() {
            return Err(RevisionError::Unusable {
                value: raw.to_string(),
            });
        }
        if slug == raw && slug.len() <= MAX_REVISION_LEN {
            return Ok(Revision(slug));
        }

        let hash = short_hash(raw);
        let room = MAX_REVISION_LEN - HASH_SUFFIX_LEN - 1;
        let head = if slug.len() > room {
            slug[..room].trim_end_matches(['-', '.']).to_string()
        } else {
            slug
        };
        Ok(Revision(format!("{}-{}", head, hash)))
    }

    fn from_checkout(&self, context: &Path) -> Result<Revision, RevisionError> {
        let repo = git2::Repository::discover(context).map_err(|_| RevisionError::Missing)?;
        let head = repo
            .head()
            .and_then(|head| head.peel_to_commit())
            .map_err(|e| RevisionError::Unresolvable {
                path: context.to_path_buf(),
                message: e.message().to_string(),
            })?;
        let id = head.id().to_string();
        tracing::debug!(commit = %id, context = %context.display(), "resolved revision from HEAD");
        self.from_reference(&id)
    }
}

fn is_commit_id(raw: &str) -> bool {
    (4..=64).contains(&raw.len()) && raw.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Lowercase, map disallowed characters to `-`, collapse runs, and strip
/// leading/trailing separators. `..` and a `.lock` suffix are not allowed in
/// git ref names, so they are rewritten too.
pub fn slugify(raw: &str) -> String {
    let mapped: String = raw
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let mut slug = String::with_capacity(mapped.len());
    let mut prev: Option<char> = None;
    for c in mapped.chars() {
        let is_sep = c == '-' || c == '.';
        if is_sep && prev.is_some_and(|p| p == '-' || p == '.') {
            continue;
        }
        slug.push(c);
        prev = Some(c);
    }

    let mut slug = slug
        .trim_start_matches(['-', '.', '_'])
        .trim_end_matches(['-', '.'])
        .to_string();
    if let Some(stem) = slug.strip_suffix(".lock") {
        slug = format!("{}-lock", stem);
    }
    slug
}

fn short_hash(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(digest)[..HASH_SUFFIX_LEN].to_string()
}

fn is_well_formed(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_REVISION_LEN
        && id.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        && !id.contains("..")
}
