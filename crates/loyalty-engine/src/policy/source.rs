//! Policy sources: a versioned in-memory catalog with change notifications, and a JSON/YAML
//! document on disk.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::domain::{LifecycleState, Policy, PolicyId, PolicyScope};
use super::errors::SourceError;
use super::registry::{PolicySource, ScopeKey};
use super::validation::validate_policy;

const CHANGE_FEED_CAPACITY: usize = 256;

/// Notification emitted whenever a policy version is published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyChange {
    pub policy_id: PolicyId,
    pub version: u32,
    pub state: LifecycleState,
    pub scope: PolicyScope,
}

impl PolicyChange {
    fn of(policy: &Policy) -> Self {
        Self {
            policy_id: policy.id.clone(),
            version: policy.version,
            state: policy.state,
            scope: policy.scope.clone(),
        }
    }
}

#[derive(Default)]
struct Catalog {
    versions: BTreeMap<PolicyId, BTreeMap<u32, Policy>>,
    index: BTreeMap<ScopeKey, BTreeSet<PolicyId>>,
    unindexed: BTreeSet<PolicyId>,
}

impl Catalog {
    fn latest(&self, policy_id: &PolicyId) -> Option<&Policy> {
        self.versions
            .get(policy_id)
            .and_then(|versions| versions.values().next_back())
    }

    /// Highest published version that is not a draft. Drafts never displace a live version.
    fn serving(&self, policy_id: &PolicyId) -> Option<&Policy> {
        self.versions.get(policy_id).and_then(|versions| {
            versions
                .values()
                .rev()
                .find(|policy| policy.state != LifecycleState::Draft)
        })
    }

    fn unindex(&mut self, policy: &Policy) {
        if !policy.scope.is_indexable() {
            self.unindexed.remove(&policy.id);
            return;
        }
        for key in scope_keys(&policy.scope) {
            if let Some(ids) = self.index.get_mut(&key) {
                ids.remove(&policy.id);
                if ids.is_empty() {
                    self.index.remove(&key);
                }
            }
        }
    }

    fn reindex(&mut self, policy: &Policy) {
        if !policy.scope.is_indexable() {
            self.unindexed.insert(policy.id.clone());
            return;
        }
        for key in scope_keys(&policy.scope) {
            self.index.entry(key).or_default().insert(policy.id.clone());
        }
    }
}

fn scope_keys(scope: &PolicyScope) -> Vec<ScopeKey> {
    match &scope.tenant_id {
        Some(tenant_id) => scope
            .event_types
            .iter()
            .map(|event_type| ScopeKey::new(tenant_id.clone(), event_type.clone()))
            .collect(),
        None => Vec::new(),
    }
}

/// Versioned policy catalog held in memory.
///
/// Publishing retains every prior version for audit replay. Lookups walk a (tenant, event type)
/// index plus a small bucket of wildcard-scoped policies.
pub struct InMemoryPolicySource {
    catalog: RwLock<Catalog>,
    changes: broadcast::Sender<PolicyChange>,
}

impl Default for InMemoryPolicySource {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            catalog: RwLock::new(Catalog::default()),
            changes,
        }
    }
}

impl InMemoryPolicySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policies<I>(policies: I) -> Result<Self, SourceError>
    where
        I: IntoIterator<Item = Policy>,
    {
        let source = Self::default();
        for policy in policies {
            source.publish(policy)?;
        }
        Ok(source)
    }

    /// Publish a new version. The version must exceed every version already published under
    /// the same id.
    pub fn publish(&self, policy: Policy) -> Result<PolicyChange, SourceError> {
        validate_policy(&policy)?;

        let change = {
            let mut catalog = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(latest) = catalog.latest(&policy.id) {
                if policy.version <= latest.version {
                    return Err(SourceError::VersionConflict {
                        attempted: policy.version,
                        latest: latest.version,
                        policy_id: policy.id,
                    });
                }
            }

            let change = PolicyChange::of(&policy);
            let policy_id = policy.id.clone();
            let previous = catalog.serving(&policy_id).cloned();
            catalog
                .versions
                .entry(policy_id.clone())
                .or_default()
                .insert(policy.version, policy);

            if let Some(previous) = previous {
                catalog.unindex(&previous);
            }
            if let Some(serving) = catalog.serving(&policy_id).cloned() {
                catalog.reindex(&serving);
            }
            change
        };

        info!(
            policy_id = %change.policy_id,
            version = change.version,
            state = ?change.state,
            "policy version published"
        );
        // No subscribers is fine.
        let _ = self.changes.send(change.clone());
        Ok(change)
    }

    /// Publishes an ARCHIVED successor of the latest version, taking the policy out of service.
    pub fn archive(&self, policy_id: &PolicyId) -> Result<PolicyChange, SourceError> {
        let mut successor = self
            .latest(policy_id)
            .ok_or_else(|| SourceError::NotFound(policy_id.clone()))?;
        successor.version = successor.version.saturating_add(1);
        successor.state = LifecycleState::Archived;
        self.publish(successor)
    }

    pub fn latest(&self, policy_id: &PolicyId) -> Option<Policy> {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        catalog.latest(policy_id).cloned()
    }

    /// Version currently served to evaluations, if any.
    pub fn serving(&self, policy_id: &PolicyId) -> Option<Policy> {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        catalog.serving(policy_id).cloned()
    }

    pub fn version(&self, policy_id: &PolicyId, version: u32) -> Option<Policy> {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        catalog
            .versions
            .get(policy_id)
            .and_then(|versions| versions.get(&version))
            .cloned()
    }

    /// Every published version of a policy, oldest first.
    pub fn history(&self, policy_id: &PolicyId) -> Vec<Policy> {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        catalog
            .versions
            .get(policy_id)
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PolicyChange> {
        self.changes.subscribe()
    }

    pub fn len(&self) -> usize {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        catalog.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PolicySource for InMemoryPolicySource {
    fn list_active_policies(
        &self,
        tenant_id: &str,
        event_type: &str,
    ) -> Result<Vec<Policy>, SourceError> {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        let key = ScopeKey::new(tenant_id, event_type);

        let indexed = catalog.index.get(&key).into_iter().flatten();
        let ids: BTreeSet<&PolicyId> = indexed.chain(catalog.unindexed.iter()).collect();

        Ok(ids
            .into_iter()
            .filter_map(|id| catalog.serving(id))
            .filter(|policy| {
                policy.state == LifecycleState::Active
                    && policy.scope.matches(tenant_id, event_type)
            })
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
}

impl DocumentFormat {
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|extension| extension.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("yaml") | Some("yml") => DocumentFormat::Yaml,
            _ => DocumentFormat::Json,
        }
    }
}

/// On-disk policy document. May hold several versions of the same policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub policies: Vec<Policy>,
}

impl PolicyDocument {
    pub fn parse(raw: &str, format: DocumentFormat) -> Result<Self, String> {
        match format {
            DocumentFormat::Json => serde_json::from_str(raw).map_err(|err| err.to_string()),
            DocumentFormat::Yaml => serde_yaml::from_str(raw).map_err(|err| err.to_string()),
        }
    }

    /// Highest version of each policy id, ordered by id.
    pub fn latest_versions(&self) -> Vec<Policy> {
        let mut latest: BTreeMap<&PolicyId, &Policy> = BTreeMap::new();
        for policy in &self.policies {
            let replace = latest
                .get(&policy.id)
                .map_or(true, |current| policy.version > current.version);
            if replace {
                latest.insert(&policy.id, policy);
            }
        }
        latest.into_values().cloned().collect()
    }

    /// Highest non-draft version of each policy id, ordered by id. Ids with only drafts are
    /// left out.
    pub fn serving_versions(&self) -> Vec<Policy> {
        let mut serving: BTreeMap<&PolicyId, &Policy> = BTreeMap::new();
        for policy in &self.policies {
            if policy.state == LifecycleState::Draft {
                continue;
            }
            let replace = serving
                .get(&policy.id)
                .map_or(true, |current| policy.version > current.version);
            if replace {
                serving.insert(&policy.id, policy);
            }
        }
        serving.into_values().cloned().collect()
    }
}

/// Reads and parses a policy document without validating its policies.
pub fn read_policy_document(path: &Path) -> Result<PolicyDocument, SourceError> {
    let raw = fs::read_to_string(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    PolicyDocument::parse(&raw, DocumentFormat::from_path(path)).map_err(|detail| {
        SourceError::Parse {
            path: path.to_path_buf(),
            detail,
        }
    })
}

/// Reads a policy document, validates every policy and keeps the serving version of each.
/// One invalid policy rejects the whole document.
pub fn load_policy_document(path: &Path) -> Result<Vec<Policy>, SourceError> {
    let document = read_policy_document(path)?;
    for policy in &document.policies {
        validate_policy(policy)?;
    }
    Ok(document.serving_versions())
}

/// Policy document on disk, re-read on every registry cache miss.
///
/// Structurally invalid policies are logged and handed on as-is; the engine excludes them
/// per evaluation so one bad entry does not take its siblings down.
#[derive(Debug, Clone)]
pub struct FilePolicySource {
    path: PathBuf,
}

impl FilePolicySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PolicySource for FilePolicySource {
    fn list_active_policies(
        &self,
        tenant_id: &str,
        event_type: &str,
    ) -> Result<Vec<Policy>, SourceError> {
        let policies: Vec<Policy> = read_policy_document(&self.path)?
            .serving_versions()
            .into_iter()
            .filter(|policy| {
                policy.state == LifecycleState::Active
                    && policy.scope.matches(tenant_id, event_type)
            })
            .collect();

        for policy in &policies {
            if let Err(err) = validate_policy(policy) {
                warn!(
                    path = %self.path.display(),
                    policy_id = %policy.id,
                    version = policy.version,
                    error = %err,
                    "invalid policy in document"
                );
            }
        }
        Ok(policies)
    }
}
