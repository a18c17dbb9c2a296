// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Reference-counted session cache.
//!
//! Building a session means a round of provider calls for every node. Callers
//! that place replicas for several collections in one logical operation can
//! share a session through a [`SessionScope`]: while the policy reference is
//! unchanged, [`SessionCache::acquire`] hands out the cached session and its
//! latest derived state instead of rebuilding. Results never depend on hits.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use tracing::debug;

use crate::error::Result;
use crate::policy::Policy;
use crate::session::Session;

/// Opaque handle identifying one caller scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionScope(u64);

impl SessionScope {
    /// Numeric id of this scope.
    #[must_use]
    pub fn id(self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
struct CacheEntry {
    session: Arc<Session>,
    version: u64,
    refs: AtomicUsize,
}

impl CacheEntry {
    fn new(session: Arc<Session>, version: u64) -> Self {
        Self { session, version, refs: AtomicUsize::new(1) }
    }
}

/// A session handed out by the cache.
#[derive(Debug, Clone)]
pub struct SessionLease {
    scope: SessionScope,
    version: u64,
    session: Arc<Session>,
    reused: bool,
}

impl SessionLease {
    /// The leased session.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Cache version the lease was taken at; pass it back to
    /// [`SessionCache::release`].
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Scope the lease belongs to.
    #[must_use]
    pub fn scope(&self) -> SessionScope {
        self.scope
    }

    /// Whether the session came from the cache.
    #[must_use]
    pub fn is_reused(&self) -> bool {
        self.reused
    }
}

/// Caches at most one session per scope.
#[derive(Debug, Default)]
pub struct SessionCache {
    entries: DashMap<u64, CacheEntry>,
    version: AtomicU64,
    next_scope: AtomicU64,
}

impl SessionCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cache.
    pub fn global() -> &'static SessionCache {
        static GLOBAL: OnceLock<SessionCache> = OnceLock::new();
        GLOBAL.get_or_init(SessionCache::new)
    }

    /// Allocates a new scope handle.
    pub fn scope(&self) -> SessionScope {
        SessionScope(self.next_scope.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the scope's cached session if it was built for `policy` (by
    /// reference), otherwise builds one with `build` and caches it under a
    /// new version. Concurrent first acquisitions under the same policy all
    /// end up sharing one cached session.
    ///
    /// # Errors
    ///
    /// Returns the error of `build` unchanged.
    pub fn acquire<F>(&self, scope: SessionScope, policy: &Arc<Policy>, build: F) -> Result<SessionLease>
    where
        F: FnOnce() -> Result<Session>,
    {
        if let Some(entry) = self.entries.get(&scope.0) {
            if Arc::ptr_eq(entry.session.policy(), policy) {
                let refs = entry.refs.fetch_add(1, Ordering::AcqRel) + 1;
                counter!("rucket_placement_cache_hits").increment(1);
                debug!(scope = scope.0, version = entry.version, refs, "Reusing cached session");
                return Ok(SessionLease {
                    scope,
                    version: entry.version,
                    session: Arc::clone(&entry.session),
                    reused: true,
                });
            }
        }

        let session = Arc::new(build()?);
        let version = match self.entries.entry(scope.0) {
            Entry::Occupied(entry) if Arc::ptr_eq(entry.get().session.policy(), policy) => {
                // Another caller cached a session for this policy while we
                // were building. Share theirs and drop ours.
                let cached = entry.get();
                let refs = cached.refs.fetch_add(1, Ordering::AcqRel) + 1;
                counter!("rucket_placement_cache_hits").increment(1);
                debug!(scope = scope.0, version = cached.version, refs, "Discarded duplicate session build");
                return Ok(SessionLease {
                    scope,
                    version: cached.version,
                    session: Arc::clone(&cached.session),
                    reused: true,
                });
            }
            Entry::Occupied(mut entry) => {
                let version = self.next_version();
                entry.insert(CacheEntry::new(Arc::clone(&session), version));
                version
            }
            Entry::Vacant(entry) => {
                let version = self.next_version();
                entry.insert(CacheEntry::new(Arc::clone(&session), version));
                version
            }
        };
        counter!("rucket_placement_cache_misses").increment(1);
        debug!(scope = scope.0, version, "Cached new session");
        Ok(SessionLease { scope, version, session, reused: false })
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Replaces the cached session of the lease's version with `session`,
    /// typically the result of applying suggestions. Returns false if the
    /// entry was replaced or evicted in the meantime.
    pub fn update(&self, lease: &SessionLease, session: Session) -> bool {
        match self.entries.get_mut(&lease.scope.0) {
            Some(mut entry) if entry.version == lease.version => {
                entry.session = Arc::new(session);
                true
            }
            _ => false,
        }
    }

    /// Drops one reference taken at `version`. The entry is evicted once no
    /// references remain. Releases for superseded versions are ignored.
    pub fn release(&self, scope: SessionScope, version: u64) {
        let remaining = match self.entries.get(&scope.0) {
            Some(entry) if entry.version == version => entry
                .refs
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .map_or(0, |previous| previous - 1),
            _ => return,
        };
        if remaining == 0 {
            let evicted = self
                .entries
                .remove_if(&scope.0, |_, e| e.version == version && e.refs.load(Ordering::Acquire) == 0)
                .is_some();
            if evicted {
                debug!(scope = scope.0, version, "Evicted cached session");
            }
        }
    }

    /// Current reference count of the scope's entry.
    #[must_use]
    pub fn refcount(&self, scope: SessionScope) -> usize {
        self.entries.get(&scope.0).map_or(0, |e| e.refs.load(Ordering::Acquire))
    }

    /// Latest version stamp handed out.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Cached session of a scope.
    #[must_use]
    pub fn cached(&self, scope: SessionScope) -> Option<Arc<Session>> {
        self.entries.get(&scope.0).map(|e| Arc::clone(&e.session))
    }

    /// Number of cached sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::provider::InMemoryCluster;

    fn cluster() -> Arc<InMemoryCluster> {
        Arc::new(InMemoryCluster::new().with_node("n1", [("cores", json!(1))]))
    }

    fn policy() -> Arc<Policy> {
        Arc::new(Policy::parse(r##"{"cluster-policy": [{"replica": "<2", "node": "#ANY"}]}"##).unwrap())
    }

    fn builder(
        policy: &Arc<Policy>,
        cluster: &Arc<InMemoryCluster>,
    ) -> impl FnOnce() -> Result<Session> {
        let policy = Arc::clone(policy);
        let cluster = Arc::clone(cluster);
        move || Session::build(policy, cluster.clone(), cluster.as_ref())
    }

    #[test]
    fn test_reuse_under_same_policy() {
        let cache = SessionCache::new();
        let scope = cache.scope();
        let (cluster, policy) = (cluster(), policy());

        let first = cache.acquire(scope, &policy, builder(&policy, &cluster)).unwrap();
        let second = cache.acquire(scope, &policy, builder(&policy, &cluster)).unwrap();
        assert!(!first.is_reused());
        assert!(second.is_reused());
        assert!(Arc::ptr_eq(first.session(), second.session()));
        assert_eq!(first.version(), second.version());
        assert_eq!(cache.refcount(scope), 2);
    }

    #[test]
    fn test_new_policy_reference_rebuilds() {
        let cache = SessionCache::new();
        let scope = cache.scope();
        let cluster = cluster();
        let (old, new) = (policy(), policy());

        let first = cache.acquire(scope, &old, builder(&old, &cluster)).unwrap();
        let second = cache.acquire(scope, &new, builder(&new, &cluster)).unwrap();
        assert!(!Arc::ptr_eq(first.session(), second.session()));
        assert!(second.version() > first.version());
        assert_eq!(cache.version(), second.version());

        cache.release(scope, first.version());
        assert_eq!(cache.refcount(scope), 1);
        cache.release(scope, second.version());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_refcount_never_negative() {
        let cache = SessionCache::new();
        let scope = cache.scope();
        let (cluster, policy) = (cluster(), policy());

        let lease = cache.acquire(scope, &policy, builder(&policy, &cluster)).unwrap();
        cache.release(scope, lease.version());
        cache.release(scope, lease.version());
        assert_eq!(cache.refcount(scope), 0);
        assert!(cache.cached(scope).is_none());

        let again = cache.acquire(scope, &policy, builder(&policy, &cluster)).unwrap();
        assert!(!again.is_reused());
        assert_eq!(cache.refcount(scope), 1);
    }

    #[test]
    fn test_scopes_are_independent() {
        let cache = SessionCache::new();
        let (a, b) = (cache.scope(), cache.scope());
        assert_ne!(a, b);
        let (cluster, policy) = (cluster(), policy());

        let la = cache.acquire(a, &policy, builder(&policy, &cluster)).unwrap();
        let lb = cache.acquire(b, &policy, builder(&policy, &cluster)).unwrap();
        assert!(!Arc::ptr_eq(la.session(), lb.session()));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_update_replaces_cached_session() {
        let cache = SessionCache::new();
        let scope = cache.scope();
        let (cluster, policy) = (cluster(), policy());

        let lease = cache.acquire(scope, &policy, builder(&policy, &cluster)).unwrap();
        let next = lease.session().with_policy_mapping(&[("c".to_string(), "p".to_string())].into());
        assert!(cache.update(&lease, next));
        let cached = cache.cached(scope).unwrap();
        assert_eq!(cached.generation(), 1);
        assert!(!Arc::ptr_eq(&cached, lease.session()));

        let stale = SessionLease { version: lease.version() + 100, ..lease.clone() };
        assert!(!cache.update(&stale, (*cached).clone()));
    }

    #[test]
    fn test_build_error_is_not_cached() {
        let cache = SessionCache::new();
        let scope = cache.scope();
        let policy = policy();
        let result = cache.acquire(scope, &policy, || {
            Err(crate::error::PolicyError::Provider("down".into()))
        });
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_global_is_shared() {
        let a = SessionCache::global();
        let b = SessionCache::global();
        assert!(std::ptr::eq(a, b));
        assert_ne!(a.scope(), b.scope());
    }

    #[test]
    fn test_concurrent_first_acquire_shares_one_session() {
        let cache = SessionCache::new();
        let scope = cache.scope();
        let (cluster, policy) = (cluster(), policy());
        let both_building = std::sync::Barrier::new(2);

        let leases: Vec<SessionLease> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(|| {
                        let build = builder(&policy, &cluster);
                        cache
                            .acquire(scope, &policy, || {
                                both_building.wait();
                                build()
                            })
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(Arc::ptr_eq(leases[0].session(), leases[1].session()));
        assert_eq!(leases[0].version(), leases[1].version());
        assert_eq!(leases.iter().filter(|l| l.is_reused()).count(), 1);
        assert_eq!(cache.refcount(scope), 2);
        assert_eq!(cache.version(), leases[0].version());

        let next = leases[1].session().with_policy_mapping(&[("c".to_string(), "p".to_string())].into());
        assert!(cache.update(&leases[1], next));
        cache.release(scope, leases[0].version());
        cache.release(scope, leases[1].version());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let cache = SessionCache::new();
        let scope = cache.scope();
        let (cluster, policy) = (cluster(), policy());
        let seed = cache.acquire(scope, &policy, builder(&policy, &cluster)).unwrap();

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..100 {
                        let lease = cache.acquire(scope, &policy, builder(&policy, &cluster)).unwrap();
                        assert!(lease.is_reused());
                        cache.release(scope, lease.version());
                    }
                });
            }
        });

        assert_eq!(cache.refcount(scope), 1);
        cache.release(scope, seed.version());
        assert!(cache.is_empty());
    }
}
