//! Read-through policy cache keyed by (tenant, event type).
//!
//! Each scope is cached as an immutable [`PolicySnapshot`] behind an `Arc`. A refresh swaps the
//! whole entry, so an evaluation holding a snapshot never observes a partially updated policy
//! set. Expiry is checked on lookup; nothing runs on a background timer. Refreshes of one scope
//! are serialized: concurrent misses wait for the refresh in flight and share its snapshot.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::domain::{LifecycleState, Policy, PolicyContext, PolicyId};
use super::errors::{RegistryError, SourceError};
use super::resolver::precedence_order;
use super::source::PolicyChange;

/// External store the registry reads through to on a cache miss.
///
/// Implementations may block; the registry runs them on the blocking pool under a timeout.
pub trait PolicySource: Send + Sync {
    fn list_active_policies(
        &self,
        tenant_id: &str,
        event_type: &str,
    ) -> Result<Vec<Policy>, SourceError>;
}

impl<S: PolicySource + ?Sized> PolicySource for Arc<S> {
    fn list_active_policies(
        &self,
        tenant_id: &str,
        event_type: &str,
    ) -> Result<Vec<Policy>, SourceError> {
        (**self).list_active_policies(tenant_id, event_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeKey {
    pub tenant_id: String,
    pub event_type: String,
}

impl ScopeKey {
    pub fn new(tenant_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            event_type: event_type.into(),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.event_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySettings {
    pub cache_ttl: Duration,
    pub fetch_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(2),
        }
    }
}

/// Immutable view of the active policies for one scope, ordered by precedence then id.
#[derive(Debug)]
pub struct PolicySnapshot {
    key: ScopeKey,
    generation: u64,
    policies: Vec<Arc<Policy>>,
    fetched_at: Instant,
}

impl PolicySnapshot {
    fn new(key: ScopeKey, generation: u64, policies: Vec<Policy>) -> Self {
        let mut policies: Vec<Arc<Policy>> = policies
            .into_iter()
            .filter(|policy| {
                policy.state == LifecycleState::Active
                    && policy.scope.matches(&key.tenant_id, &key.event_type)
            })
            .map(Arc::new)
            .collect();
        policies.sort_by(|left, right| {
            precedence_order((left.precedence, &left.id), (right.precedence, &right.id))
        });

        Self {
            key,
            generation,
            policies,
            fetched_at: Instant::now(),
        }
    }

    pub fn key(&self) -> &ScopeKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn policies(&self) -> &[Arc<Policy>] {
        &self.policies
    }

    /// Policies whose active window contains `at`.
    pub fn candidates(&self, at: DateTime<Utc>) -> Vec<Arc<Policy>> {
        self.policies
            .iter()
            .filter(|policy| policy.is_eligible_at(at))
            .cloned()
            .collect()
    }

    pub fn contains(&self, policy_id: &PolicyId) -> bool {
        self.policies.iter().any(|policy| &policy.id == policy_id)
    }
}

struct CacheEntry {
    snapshot: Arc<PolicySnapshot>,
    stale: bool,
}

pub struct PolicyRegistry<S> {
    source: Arc<S>,
    settings: RegistrySettings,
    entries: RwLock<HashMap<ScopeKey, CacheEntry>>,
    refreshes: Mutex<HashMap<ScopeKey, Arc<AsyncMutex<()>>>>,
    generation: AtomicU64,
    invalidations: AtomicU64,
}

impl<S> PolicyRegistry<S>
where
    S: PolicySource + 'static,
{
    pub fn new(source: Arc<S>, settings: RegistrySettings) -> Self {
        Self {
            source,
            settings,
            entries: RwLock::new(HashMap::new()),
            refreshes: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn settings(&self) -> RegistrySettings {
        self.settings
    }

    /// Snapshot for a scope, refreshed from the source when missing, expired or invalidated.
    ///
    /// A failed refresh falls back to the previous snapshot when one exists.
    pub async fn snapshot(
        &self,
        tenant_id: &str,
        event_type: &str,
    ) -> Result<Arc<PolicySnapshot>, RegistryError> {
        let key = ScopeKey::new(tenant_id, event_type);

        let cached = self.cached(&key);
        if let Some((snapshot, stale)) = &cached {
            if !stale && snapshot.fetched_at.elapsed() < self.settings.cache_ttl {
                return Ok(Arc::clone(snapshot));
            }
        }
        let seen = cached.as_ref().map(|(snapshot, _)| snapshot.generation);

        let gate = self.refresh_gate(&key);
        let _refreshing = gate.lock().await;

        // Another caller may have refreshed the scope while we waited.
        let cached = self.cached(&key);
        if let Some((snapshot, stale)) = &cached {
            let refreshed = seen.map_or(true, |seen| snapshot.generation > seen);
            let fresh = snapshot.fetched_at.elapsed() < self.settings.cache_ttl;
            if !stale && (refreshed || fresh) {
                return Ok(Arc::clone(snapshot));
            }
        }

        let epoch = self.invalidations.load(Ordering::Acquire);
        match self.fetch(&key).await {
            Ok(policies) => {
                let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                let snapshot = Arc::new(PolicySnapshot::new(key.clone(), generation, policies));
                // An invalidation that landed mid-fetch may not be reflected in what we read.
                let stale = self.invalidations.load(Ordering::Acquire) != epoch;
                debug!(
                    scope = %key,
                    generation,
                    policies = snapshot.policies.len(),
                    stale,
                    "policy snapshot refreshed"
                );
                let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
                entries.insert(
                    key,
                    CacheEntry {
                        snapshot: Arc::clone(&snapshot),
                        stale,
                    },
                );
                Ok(snapshot)
            }
            Err(detail) => match cached {
                Some((snapshot, _)) => {
                    warn!(
                        scope = %key,
                        generation = snapshot.generation,
                        reason = %detail,
                        "policy source unavailable; serving stale snapshot"
                    );
                    Ok(snapshot)
                }
                None => Err(RegistryError::Unavailable {
                    tenant_id: key.tenant_id,
                    event_type: key.event_type,
                    detail,
                }),
            },
        }
    }

    fn cached(&self, key: &ScopeKey) -> Option<(Arc<PolicySnapshot>, bool)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .map(|entry| (Arc::clone(&entry.snapshot), entry.stale))
    }

    fn refresh_gate(&self, key: &ScopeKey) -> Arc<AsyncMutex<()>> {
        let mut gates = self.refreshes.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(key.clone()).or_default())
    }

    /// Active policies in scope for the context whose window contains its timestamp.
    pub async fn candidates(
        &self,
        context: &PolicyContext,
    ) -> Result<Vec<Arc<Policy>>, RegistryError> {
        let snapshot = self
            .snapshot(&context.tenant_id, &context.event_type)
            .await?;
        Ok(snapshot.candidates(context.timestamp))
    }

    async fn fetch(&self, key: &ScopeKey) -> Result<Vec<Policy>, String> {
        let source = Arc::clone(&self.source);
        let tenant_id = key.tenant_id.clone();
        let event_type = key.event_type.clone();
        let task = tokio::task::spawn_blocking(move || {
            source.list_active_policies(&tenant_id, &event_type)
        });

        match tokio::time::timeout(self.settings.fetch_timeout, task).await {
            Ok(Ok(Ok(policies))) => Ok(policies),
            Ok(Ok(Err(err))) => Err(err.to_string()),
            Ok(Err(join_err)) => Err(format!("policy fetch task failed: {join_err}")),
            Err(_) => Err(format!(
                "policy fetch exceeded {}ms",
                self.settings.fetch_timeout.as_millis()
            )),
        }
    }

    /// Marks every cached scope holding `policy_id` stale. Returns the number of scopes marked.
    pub fn invalidate(&self, policy_id: &PolicyId) -> usize {
        self.invalidate_where(|_, snapshot| snapshot.contains(policy_id))
    }

    pub fn invalidate_scope(&self, tenant_id: &str, event_type: &str) -> usize {
        let key = ScopeKey::new(tenant_id, event_type);
        self.invalidate_where(|candidate, _| candidate == &key)
    }

    pub fn invalidate_all(&self) -> usize {
        self.invalidate_where(|_, _| true)
    }

    /// Invalidation for a published change: scopes that held the policy plus scopes its new
    /// version now covers.
    pub fn invalidate_change(&self, change: &PolicyChange) -> usize {
        self.invalidate_where(|key, snapshot| {
            snapshot.contains(&change.policy_id)
                || change.scope.matches(&key.tenant_id, &key.event_type)
        })
    }

    fn invalidate_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&ScopeKey, &PolicySnapshot) -> bool,
    {
        self.invalidations.fetch_add(1, Ordering::AcqRel);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut marked = 0;
        for (key, entry) in entries.iter_mut() {
            if predicate(key, &entry.snapshot) {
                entry.stale = true;
                marked += 1;
            }
        }
        marked
    }

    pub fn cached_scopes(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Applies pushed change notifications until the channel closes or the registry is dropped.
    /// A lagging receiver invalidates everything.
    pub fn follow_changes(
        self: &Arc<Self>,
        mut changes: broadcast::Receiver<PolicyChange>,
    ) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let received = changes.recv().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                match received {
                    Ok(change) => {
                        let marked = registry.invalidate_change(&change);
                        debug!(
                            policy_id = %change.policy_id,
                            version = change.version,
                            marked,
                            "policy change applied to cache"
                        );
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        let marked = registry.invalidate_all();
                        warn!(skipped, marked, "policy change feed lagged; cache invalidated");
                    }
                    Err(RecvError::Closed) => {
                        info!("policy change feed closed");
                        break;
                    }
                }
            }
        })
    }
}
