//! Memoized identity verification.
//!
//! [`CachingActorsRegistry`] sits in front of the expensive half of
//! authentication (the verifier call) and remembers the [`Actor`] it produced
//! per [`CredentialKey`].
//!
//! - Expiry is checked lazily on lookup; nothing sweeps in the background.
//! - With a maximum entry count, the least-recently-used entry is evicted
//!   when a new one would exceed it.
//! - Concurrent lookups for a key that is still being verified join the
//!   in-flight verification instead of starting another one.
//! - Rejections are handed to everyone waiting on that flight and then
//!   forgotten. The next lookup verifies again.
//!
//! portico runs on a multi-threaded runtime, so the map lives behind a mutex
//! and each in-flight verification is a [`Shared`] future.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use lru::LruCache;
use tokio::time::Instant;
use tracing::debug;

use crate::actor::{Actor, CredentialKey, Verdict};

type Flight = Shared<BoxFuture<'static, Verdict>>;

/// A cached verification result.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub actor: Actor,
    pub expires_at: Instant,
}

struct Inner {
    ready: LruCache<CredentialKey, CacheEntry>,
    pending: HashMap<CredentialKey, Flight>,
}

/// Memoizes verified actors per credential key. Clone to share.
#[derive(Clone)]
pub struct CachingActorsRegistry {
    ttl: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl CachingActorsRegistry {
    /// `ttl` is how long a verified actor is served from cache.
    /// `max_entries` bounds the cache; `None` leaves it unbounded.
    pub fn new(ttl: Duration, max_entries: Option<NonZeroUsize>) -> Self {
        let ready = match max_entries {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self {
            ttl,
            inner: Arc::new(Mutex::new(Inner { ready, pending: HashMap::new() })),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached actor for `key`, joins an in-flight verification,
    /// or starts one with `verify`.
    ///
    /// `verify` is only called when this lookup becomes the one doing the
    /// work.
    pub async fn resolve<F, Fut>(&self, key: &CredentialKey, verify: F) -> Verdict
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Verdict> + Send + 'static,
    {
        let flight = {
            let mut inner = lock(&self.inner);
            let now = Instant::now();
            let fresh = inner
                .ready
                .get(key)
                .filter(|entry| entry.expires_at > now)
                .map(|entry| entry.actor.clone());
            if let Some(actor) = fresh {
                debug!(key = %key, "actor cache hit");
                return Ok(actor);
            }
            inner.ready.pop(key);

            if let Some(flight) = inner.pending.get(key) {
                debug!(key = %key, "joining in-flight verification");
                flight.clone()
            } else {
                debug!(key = %key, "actor cache miss, verifying");
                let flight = self.launch(key.clone(), verify());
                inner.pending.insert(key.clone(), flight.clone());
                flight
            }
        };
        flight.await
    }

    fn launch<Fut>(&self, key: CredentialKey, verify: Fut) -> Flight
    where
        Fut: Future<Output = Verdict> + Send + 'static,
    {
        let ttl = self.ttl;
        let landing = Landing { key, inner: Arc::downgrade(&self.inner) };
        async move {
            let verdict = verify.await;
            if let (Ok(actor), Some(inner)) = (&verdict, landing.inner.upgrade()) {
                let entry = CacheEntry { actor: actor.clone(), expires_at: Instant::now() + ttl };
                lock(&inner).ready.put(landing.key.clone(), entry);
            }
            drop(landing);
            verdict
        }
        .boxed()
        .shared()
    }

    /// Number of cached entries, expired ones included until looked up.
    pub fn len(&self) -> usize {
        lock(&self.inner).ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unexpired entry for `key`, without touching recency.
    pub fn peek(&self, key: &CredentialKey) -> Option<CacheEntry> {
        let inner = lock(&self.inner);
        inner.ready.peek(key).filter(|e| e.expires_at > Instant::now()).cloned()
    }

    /// Drops the cached entry for `key`, e.g. after a password change.
    pub fn invalidate(&self, key: &CredentialKey) -> bool {
        lock(&self.inner).ready.pop(key).is_some()
    }

    pub fn clear(&self) {
        lock(&self.inner).ready.clear();
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the pending marker when a flight ends, including by panic.
struct Landing {
    key: CredentialKey,
    inner: Weak<Mutex<Inner>>,
}

impl Drop for Landing {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            lock(&inner).pending.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::join_all;

    use crate::actor::Rejection;

    fn counting(calls: &Arc<AtomicUsize>, verdict: Verdict) -> impl FnOnce() -> BoxFuture<'static, Verdict> {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                verdict
            }
            .boxed()
        }
    }

    fn registry(ttl_ms: u64, cap: Option<usize>) -> CachingActorsRegistry {
        CachingActorsRegistry::new(Duration::from_millis(ttl_ms), cap.and_then(NonZeroUsize::new))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_lookups_share_one_verification() {
        let reg = registry(60_000, None);
        let key = CredentialKey::derive("basic", "alice:pw");
        let calls = Arc::new(AtomicUsize::new(0));

        let lookups = (0..8).map(|_| reg.resolve(&key, counting(&calls, Ok(Actor::new("alice")))));
        let verdicts = join_all(lookups).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for v in verdicts {
            assert_eq!(v.unwrap().principal(), "alice");
        }
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_rejection_is_shared_but_not_cached() {
        let reg = registry(60_000, None);
        let key = CredentialKey::derive("basic", "mallory:guess");
        let calls = Arc::new(AtomicUsize::new(0));

        let lookups = (0..4).map(|_| reg.resolve(&key, counting(&calls, Err(Rejection::InvalidCredentials))));
        for v in join_all(lookups).await {
            assert_eq!(v, Err(Rejection::InvalidCredentials));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(reg.is_empty());

        let again = reg.resolve(&key, counting(&calls, Err(Rejection::InvalidCredentials))).await;
        assert!(again.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_never_served() {
        let reg = registry(1_000, None);
        let key = CredentialKey::derive("bearer", "tok");
        let calls = Arc::new(AtomicUsize::new(0));

        reg.resolve(&key, counting(&calls, Ok(Actor::new("svc")))).await.unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        reg.resolve(&key, counting(&calls, Ok(Actor::new("svc")))).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(reg.peek(&key).is_none());
        reg.resolve(&key, counting(&calls, Ok(Actor::new("svc")))).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_cache_evicts_least_recently_used() {
        let reg = registry(60_000, Some(2));
        let calls = Arc::new(AtomicUsize::new(0));
        let keys: Vec<_> = ["a", "b", "c"].iter().map(|k| CredentialKey::derive("bearer", k)).collect();

        reg.resolve(&keys[0], counting(&calls, Ok(Actor::new("a")))).await.unwrap();
        reg.resolve(&keys[1], counting(&calls, Ok(Actor::new("b")))).await.unwrap();
        // touch "a" so "b" becomes the eviction candidate
        reg.resolve(&keys[0], counting(&calls, Ok(Actor::new("a")))).await.unwrap();
        reg.resolve(&keys[2], counting(&calls, Ok(Actor::new("c")))).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(reg.len(), 2);
        assert!(reg.peek(&keys[0]).is_some());
        assert!(reg.peek(&keys[1]).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_forces_reverification() {
        let reg = registry(60_000, None);
        let key = CredentialKey::derive("basic", "bob:pw");
        let calls = Arc::new(AtomicUsize::new(0));
        reg.resolve(&key, counting(&calls, Ok(Actor::new("bob")))).await.unwrap();
        assert!(reg.invalidate(&key));
        reg.resolve(&key, counting(&calls, Ok(Actor::new("bob")))).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        reg.clear();
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_leader_does_not_strand_followers() {
        let reg = registry(60_000, None);
        let key = CredentialKey::derive("basic", "carol:pw");
        let calls = Arc::new(AtomicUsize::new(0));

        let leader = reg.resolve(&key, counting(&calls, Ok(Actor::new("carol"))));
        let follower = reg.resolve(&key, counting(&calls, Ok(Actor::new("carol"))));
        // Poll the leader once so it installs the flight, then drop it.
        let mut leader = Box::pin(leader);
        assert!(futures::poll!(leader.as_mut()).is_pending());
        drop(leader);

        assert_eq!(follower.await.unwrap().principal(), "carol");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
