//! In-memory collaborators for tests.
//!
//! Compiled for unit tests and, through the `test-support` feature, for the
//! integration tests under `tests/`. Each fake counts its calls and can be
//! told to fail a number of times in a given way.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::{PublishError, SubmitError};
use crate::publish::{BuildOutput, Builder, Platform, PlatformArtifact, RegistryClient, RemoteArtifact};
use crate::retry::RetryPolicy;
use crate::revision::Revision;
use crate::submit::{ProposalRef, ProposalState, StateStoreClient};

/// Retry policy with short delays so paused-clock tests stay fast.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        call_timeout: Duration::from_secs(5),
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Builder ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct BuilderState {
    builds: u32,
    salt: String,
    failure: Option<(String, bool)>,
    delay: Duration,
}

/// Builder producing deterministic bytes from revision, platform and a salt.
#[derive(Debug, Default)]
pub struct ScriptedBuilder {
    state: Mutex<BuilderState>,
}

impl ScriptedBuilder {
    /// Builder whose every build fails.
    pub fn failing(message: &str) -> Self {
        let builder = Self::default();
        lock(&builder.state).failure = Some((message.to_string(), true));
        builder
    }

    /// Fail only the next build.
    pub fn fail_next(&self, message: &str) {
        lock(&self.state).failure = Some((message.to_string(), false));
    }

    /// Change the produced bytes, simulating a non-reproducible build.
    pub fn set_salt(&self, salt: &str) {
        lock(&self.state).salt = salt.to_string();
    }

    /// Make every build take `delay` of (tokio) time.
    pub fn set_delay(&self, delay: Duration) {
        lock(&self.state).delay = delay;
    }

    pub fn builds(&self) -> u32 {
        lock(&self.state).builds
    }
}

#[async_trait]
impl Builder for ScriptedBuilder {
    async fn build(
        &self,
        revision: &Revision,
        _context: &Path,
        platforms: &[Platform],
    ) -> Result<BuildOutput, PublishError> {
        let delay = lock(&self.state).delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = lock(&self.state);
        state.builds += 1;
        if let Some((message, persistent)) = state.failure.clone() {
            if !persistent {
                state.failure = None;
            }
            return Err(PublishError::Build {
                platform: platforms
                    .first()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                message,
            });
        }
        let variants = platforms
            .iter()
            .map(|p| {
                let bytes = format!("{}|{}|{}", revision, p, state.salt).into_bytes();
                PlatformArtifact::new(p.clone(), bytes)
            })
            .collect();
        Ok(BuildOutput::new(variants))
    }
}

// ── Registry ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryFault {
    Transient,
    Auth,
    /// The push lands but the client is told it failed.
    LandedThenTransient,
}

#[derive(Debug, Default)]
struct RegistryState {
    tags: HashMap<String, RemoteArtifact>,
    calls: u32,
    uploads: u32,
    push_attempts: u32,
    push_fault: Option<(RegistryFault, u32)>,
    fail_alias: bool,
}

pub struct MemoryRegistry {
    repository: String,
    state: Mutex<RegistryState>,
}

impl MemoryRegistry {
    pub fn new(repository: &str) -> Self {
        Self {
            repository: repository.to_string(),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Fail the next `times` pushes with `fault`.
    pub fn fail_push(&self, fault: RegistryFault, times: u32) {
        lock(&self.state).push_fault = Some((fault, times));
    }

    pub fn fail_alias(&self, fail: bool) {
        lock(&self.state).fail_alias = fail;
    }

    /// Every call of any kind.
    pub fn calls(&self) -> u32 {
        lock(&self.state).calls
    }

    /// Pushes that made content visible under a tag.
    pub fn uploads(&self) -> u32 {
        lock(&self.state).uploads
    }

    pub fn push_attempts(&self) -> u32 {
        lock(&self.state).push_attempts
    }

    pub fn tag_digest(&self, tag: &str) -> Option<String> {
        lock(&self.state).tags.get(tag).map(|a| a.digest.clone())
    }

    pub fn tags(&self) -> BTreeSet<String> {
        lock(&self.state).tags.keys().cloned().collect()
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    fn repository(&self) -> &str {
        &self.repository
    }

    async fn lookup(&self, tag: &str) -> Result<Option<RemoteArtifact>, PublishError> {
        let mut state = lock(&self.state);
        state.calls += 1;
        Ok(state.tags.get(tag).cloned())
    }

    async fn push(&self, output: &BuildOutput, tag: &str) -> Result<String, PublishError> {
        let mut state = lock(&self.state);
        state.calls += 1;
        state.push_attempts += 1;

        let fault = match state.push_fault {
            Some((fault, remaining)) if remaining > 0 => {
                state.push_fault = Some((fault, remaining - 1));
                Some(fault)
            }
            _ => None,
        };
        match fault {
            Some(RegistryFault::Transient) => {
                return Err(PublishError::Transient("503 Service Unavailable".into()));
            }
            Some(RegistryFault::Auth) => return Err(PublishError::Auth("401 Unauthorized".into())),
            _ => {}
        }

        let digest = output.index_digest();
        state.tags.insert(
            tag.to_string(),
            RemoteArtifact {
                digest: digest.clone(),
                platforms: output.platforms(),
            },
        );
        state.uploads += 1;

        if fault == Some(RegistryFault::LandedThenTransient) {
            return Err(PublishError::Transient("connection reset after upload".into()));
        }
        Ok(digest)
    }

    async fn alias(&self, tag: &str, alias: &str) -> Result<(), PublishError> {
        let mut state = lock(&self.state);
        state.calls += 1;
        if state.fail_alias {
            return Err(PublishError::Transient("alias update failed".into()));
        }
        let artifact = state
            .tags
            .get(tag)
            .cloned()
            .ok_or_else(|| PublishError::Refused {
                status: 404,
                message: format!("no tag {}", tag),
            })?;
        state.tags.insert(alias.to_string(), artifact);
        Ok(())
    }
}

// ── State store ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFault {
    Transient,
    Rejected,
    Auth,
}

#[derive(Debug, Default)]
struct StoreState {
    documents: HashMap<String, String>,
    branches: HashMap<String, HashMap<String, String>>,
    proposals: Vec<ProposalRef>,
    created: HashMap<u64, DateTime<Utc>>,
    write_calls: u32,
    write_fault: Option<(StoreFault, u32)>,
    fail_branch_deletes: bool,
}

/// State store holding documents, branches and proposals in memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<StoreState>,
}

impl MemoryStateStore {
    pub fn with_document(path: &str, content: &str) -> Self {
        let store = Self::default();
        store.set_document(path, content);
        store
    }

    /// Replace a document on the base branch.
    pub fn set_document(&self, path: &str, content: &str) {
        lock(&self.state)
            .documents
            .insert(path.to_string(), content.to_string());
    }

    pub fn document(&self, path: &str) -> Option<String> {
        lock(&self.state).documents.get(path).cloned()
    }

    /// Fail the next `times` branch writes with `fault`.
    pub fn fail_writes(&self, fault: StoreFault, times: u32) {
        lock(&self.state).write_fault = Some((fault, times));
    }

    pub fn fail_branch_deletes(&self, fail: bool) {
        lock(&self.state).fail_branch_deletes = fail;
    }

    /// Merge a proposal: its branch content lands on the base branch.
    pub fn merge(&self, number: u64) {
        let mut state = lock(&self.state);
        let Some(idx) = state.proposals.iter().position(|p| p.number == number) else {
            return;
        };
        state.proposals[idx].state = ProposalState::Merged;
        let branch = state.proposals[idx].branch.clone();
        if let Some(files) = state.branches.get(&branch).cloned() {
            state.documents.extend(files);
        }
    }

    /// Open a proposal that was not created by this pipeline.
    pub fn insert_foreign_proposal(&self, branch: &str, title: &str) {
        let mut state = lock(&self.state);
        let number = state.proposals.len() as u64 + 1;
        state.proposals.push(ProposalRef {
            number,
            url: format!("https://git.test/state/pull/{}", number),
            branch: branch.to_string(),
            title: title.to_string(),
            state: ProposalState::Open,
            body: String::new(),
        });
        state.created.insert(number, Utc::now());
    }

    pub fn open_proposals(&self) -> Vec<ProposalRef> {
        lock(&self.state)
            .proposals
            .iter()
            .filter(|p| p.is_open())
            .cloned()
            .collect()
    }

    pub fn proposal_count(&self) -> usize {
        lock(&self.state).proposals.len()
    }

    pub fn branch_content(&self, branch: &str, path: &str) -> Option<String> {
        lock(&self.state)
            .branches
            .get(branch)
            .and_then(|files| files.get(path).cloned())
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        lock(&self.state).branches.contains_key(branch)
    }

    pub fn write_calls(&self) -> u32 {
        lock(&self.state).write_calls
    }
}

#[async_trait]
impl StateStoreClient for MemoryStateStore {
    async fn read_document(&self, path: &str) -> Result<String, SubmitError> {
        lock(&self.state)
            .documents
            .get(path)
            .cloned()
            .ok_or_else(|| SubmitError::Rejected(format!("{} not found on base branch", path)))
    }

    async fn create_or_update_branch(
        &self,
        branch: &str,
        path: &str,
        content: &str,
        _message: &str,
    ) -> Result<(), SubmitError> {
        let mut state = lock(&self.state);
        state.write_calls += 1;
        if let Some((fault, remaining)) = state.write_fault
            && remaining > 0
        {
            state.write_fault = Some((fault, remaining - 1));
            return Err(match fault {
                StoreFault::Transient => SubmitError::Transient("502 Bad Gateway".into()),
                StoreFault::Rejected => SubmitError::Rejected("403 Resource not accessible by integration".into()),
                StoreFault::Auth => SubmitError::Auth("401 Bad credentials".into()),
            });
        }
        let mut files = state.documents.clone();
        files.insert(path.to_string(), content.to_string());
        state.branches.insert(branch.to_string(), files);
        Ok(())
    }

    async fn open_or_update_proposal(
        &self,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<ProposalRef, SubmitError> {
        let mut state = lock(&self.state);
        if !state.branches.contains_key(branch) {
            return Err(SubmitError::Rejected(format!("branch {} does not exist", branch)));
        }
        if let Some(existing) = state
            .proposals
            .iter_mut()
            .find(|p| p.branch == branch && p.is_open())
        {
            existing.title = title.to_string();
            existing.body = body.to_string();
            return Ok(existing.clone());
        }
        let number = state.proposals.len() as u64 + 1;
        let proposal = ProposalRef {
            number,
            url: format!("https://git.test/state/pull/{}", number),
            branch: branch.to_string(),
            title: title.to_string(),
            state: ProposalState::Open,
            body: body.to_string(),
        };
        state.proposals.push(proposal.clone());
        state.created.insert(number, Utc::now());
        Ok(proposal)
    }

    async fn close_proposal(&self, proposal: &ProposalRef) -> Result<(), SubmitError> {
        let mut state = lock(&self.state);
        if let Some(p) = state
            .proposals
            .iter_mut()
            .find(|p| p.number == proposal.number && p.is_open())
        {
            p.state = ProposalState::Closed;
        }
        Ok(())
    }

    async fn find_proposal(&self, branch: &str) -> Result<Option<ProposalRef>, SubmitError> {
        let state = lock(&self.state);
        let mut matching: Vec<&ProposalRef> = state.proposals.iter().filter(|p| p.branch == branch).collect();
        matching.sort_by_key(|p| (p.is_open(), p.number));
        Ok(matching.last().map(|p| (*p).clone()))
    }

    async fn list_open_proposals(&self) -> Result<Vec<ProposalRef>, SubmitError> {
        Ok(self.open_proposals())
    }

    async fn list_proposals_since(&self, since: DateTime<Utc>) -> Result<Vec<ProposalRef>, SubmitError> {
        let state = lock(&self.state);
        Ok(state
            .proposals
            .iter()
            .filter(|p| state.created.get(&p.number).is_some_and(|created| *created >= since))
            .cloned()
            .collect())
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), SubmitError> {
        let mut state = lock(&self.state);
        if state.fail_branch_deletes {
            return Err(SubmitError::Transient("ref deletion failed".into()));
        }
        state.branches.remove(branch);
        Ok(())
    }
}
