//! Generic single-flight, store-backed value retrieval.
//!
//! For any key there is at most one loader invocation in flight per
//! process; concurrent callers join it and share its result. Flights run
//! in detached tasks, so a caller dropping its future cannot abort a
//! retrieval that may already have consumed a single-use credential, and
//! a deadline inside the flight bounds how long anyone can be stuck
//! behind a wedged refresh.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use selvage_common::lock::ProcessLock;
use selvage_common::store::StateStore;

use crate::error::OAuthError;

/// How a value came back from [`CachedGetter::get`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Freshness {
    /// Produced by the loader just now
    Fresh,
    /// Read from the backing store
    Stored,
}

/// Per-call retrieval options.
#[derive(Clone, Copy, Debug, Default)]
pub struct GetOptions {
    /// Invoke the loader even if the stored value is not stale
    pub force_refresh: bool,
    /// Accept a stored value even if it is stale
    pub allow_stale: bool,
}

impl GetOptions {
    /// Bypass staleness and refresh unconditionally.
    pub fn force() -> Self {
        Self {
            force_refresh: true,
            allow_stale: false,
        }
    }

    /// Take whatever the store has, stale or not.
    pub fn stale_ok() -> Self {
        Self {
            force_refresh: false,
            allow_stale: true,
        }
    }
}

/// Supplies fresh values and policy for a [`CachedGetter`].
#[async_trait]
pub trait Loader<K, V>: Send + Sync {
    /// Produce a fresh value; `stored` is whatever the backing store
    /// currently holds for this key.
    async fn load(&self, key: &K, stored: Option<V>) -> Result<V, OAuthError>;

    /// Whether a stored value is too old to use without refreshing.
    fn is_stale(&self, key: &K, value: &V) -> bool;

    /// Whether an error from [`Loader::load`] invalidates the stored
    /// value entirely.
    fn should_delete(&self, key: &K, error: &OAuthError) -> bool;

    /// Called after a freshly loaded value has been persisted.
    async fn on_updated(&self, _key: &K, _value: &V) {}

    /// Called after a stored value has been deleted because of `error`.
    async fn on_deleted(&self, _key: &K, _error: &OAuthError) {}
}

type FlightSlot<V> = Option<Result<(V, Freshness), Arc<OAuthError>>>;
type PendingMap<K, V> = Arc<StdMutex<HashMap<K, watch::Receiver<FlightSlot<V>>>>>;

/// Default bound on a full locked get-or-refresh sequence.
const FLIGHT_DEADLINE: Duration = Duration::from_secs(30);

/// Single-flight cached-value retrieval over a [`StateStore`].
pub struct CachedGetter<K, V, S, L> {
    store: S,
    loader: Arc<L>,
    lock: Option<Arc<dyn ProcessLock>>,
    pending: PendingMap<K, V>,
    deadline: Duration,
}

impl<K, V, S, L> CachedGetter<K, V, S, L>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: StateStore<K, V> + Clone + 'static,
    L: Loader<K, V> + 'static,
{
    pub fn new(store: S, loader: Arc<L>) -> Self {
        Self {
            store,
            loader,
            lock: None,
            pending: Arc::new(StdMutex::new(HashMap::new())),
            deadline: FLIGHT_DEADLINE,
        }
    }

    /// Guard the whole get-or-refresh sequence with a cross-process
    /// lock. The store-reconciliation fallback stays active either way;
    /// other devices may share the store without sharing the lock.
    pub fn with_lock(mut self, lock: Arc<dyn ProcessLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Override the flight deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Retrieve the value for `key`, refreshing per `options`.
    pub async fn get(&self, key: &K, options: GetOptions) -> Result<V, OAuthError> {
        loop {
            enum Role<V> {
                Join(watch::Receiver<FlightSlot<V>>),
                Own(watch::Sender<FlightSlot<V>>),
            }

            let role = {
                let mut pending = self.pending.lock().expect("pending map poisoned");
                if let Some(rx) = pending.get(key) {
                    Role::Join(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(None);
                    pending.insert(key.clone(), rx);
                    Role::Own(tx)
                }
            };

            match role {
                Role::Join(mut rx) => {
                    let outcome = match rx.wait_for(|slot| slot.is_some()).await {
                        Ok(slot) => slot.clone(),
                        // flight aborted without publishing; re-check
                        Err(_) => continue,
                    };
                    match outcome.expect("flight result present") {
                        Ok((value, Freshness::Fresh)) => return Ok(value),
                        Ok((value, Freshness::Stored)) if options.allow_stale => return Ok(value),
                        // a store-read result is not enough for this
                        // caller; loop and take ownership if needed
                        Ok(_) => continue,
                        Err(shared) => return Err(OAuthError::Shared(shared)),
                    }
                }
                Role::Own(tx) => return self.run_flight(key.clone(), options, tx).await,
            }
        }
    }

    async fn run_flight(
        &self,
        key: K,
        options: GetOptions,
        tx: watch::Sender<FlightSlot<V>>,
    ) -> Result<V, OAuthError> {
        let store = self.store.clone();
        let loader = self.loader.clone();
        let lock = self.lock.clone();
        let pending = self.pending.clone();
        let deadline = self.deadline;

        // Detached: dropping the caller must not cancel a refresh that
        // may already have submitted a single-use token.
        let handle = tokio::spawn(async move {
            let guard = PendingGuard {
                pending,
                key: key.clone(),
            };
            let result = tokio::time::timeout(
                deadline,
                flight(&store, loader.as_ref(), lock.as_deref(), &key, options),
            )
            .await
            .unwrap_or(Err(OAuthError::Deadline))
            .map_err(Arc::new);
            // Clear the pending entry before publishing, so a joiner that
            // rejects this result re-checks an already-clean map instead
            // of spinning on a completed flight.
            drop(guard);
            let _ = tx.send(Some(result.clone()));
            result
        });

        match handle.await {
            Ok(Ok((value, _))) => Ok(value),
            Ok(Err(shared)) => Err(match Arc::try_unwrap(shared) {
                Ok(error) => error,
                Err(shared) => OAuthError::Shared(shared),
            }),
            Err(join_error) => Err(OAuthError::TaskFailed(join_error.to_string().into())),
        }
    }
}

/// Clears the pending entry no matter how the flight ends; a panicking
/// loader must not leave a stuck flight other callers wait on forever.
struct PendingGuard<K: Eq + Hash, V> {
    pending: PendingMap<K, V>,
    key: K,
}

impl<K: Eq + Hash, V> Drop for PendingGuard<K, V> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.key);
        }
    }
}

async fn flight<K, V, S, L>(
    store: &S,
    loader: &L,
    lock: Option<&dyn ProcessLock>,
    key: &K,
    options: GetOptions,
) -> Result<(V, Freshness), OAuthError>
where
    K: Eq + Hash + Clone + Display + Send + Sync,
    V: Clone + Send + Sync,
    S: StateStore<K, V>,
    L: Loader<K, V> + ?Sized,
{
    let _guard = match lock {
        Some(lock) => Some(lock.acquire(&format!("selvage:get:{key}")).await?),
        None => None,
    };

    let stored = store.get(key).await;
    if !options.force_refresh {
        if let Some(value) = &stored {
            if options.allow_stale || !loader.is_stale(key, value) {
                return Ok((value.clone(), Freshness::Stored));
            }
        }
    }

    match loader.load(key, stored).await {
        Ok(value) => {
            store.set(key.clone(), value.clone()).await?;
            loader.on_updated(key, &value).await;
            Ok((value, Freshness::Fresh))
        }
        Err(error) => {
            if loader.should_delete(key, &error) {
                if let Err(_delete_error) = store.del(key).await {
                    // the original failure is what matters to the caller
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%key, error = %_delete_error, "failed to evict bad entry");
                }
                loader.on_deleted(key, &error).await;
            }
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use selvage_common::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct TestLoader {
        loads: AtomicUsize,
        fail: AtomicBool,
        stale: AtomicBool,
        delete_on_error: bool,
        deleted: AtomicBool,
        delay: Duration,
    }

    impl Default for TestLoader {
        fn default() -> Self {
            Self {
                loads: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                stale: AtomicBool::new(false),
                delete_on_error: false,
                deleted: AtomicBool::new(false),
                delay: Duration::from_millis(20),
            }
        }
    }

    #[async_trait]
    impl Loader<String, u32> for TestLoader {
        async fn load(&self, _key: &String, stored: Option<u32>) -> Result<u32, OAuthError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(OAuthError::TaskFailed("load failed".into()));
            }
            Ok(stored.unwrap_or(0) + 1)
        }
        fn is_stale(&self, _key: &String, _value: &u32) -> bool {
            self.stale.load(Ordering::SeqCst)
        }
        fn should_delete(&self, _key: &String, _error: &OAuthError) -> bool {
            self.delete_on_error
        }
        async fn on_deleted(&self, _key: &String, _error: &OAuthError) {
            self.deleted.store(true, Ordering::SeqCst);
        }
    }

    fn getter(
        loader: TestLoader,
    ) -> (
        CachedGetter<String, u32, MemoryStore<String, u32>, TestLoader>,
        Arc<TestLoader>,
        MemoryStore<String, u32>,
    ) {
        let loader = Arc::new(loader);
        let store = MemoryStore::default();
        (
            CachedGetter::new(store.clone(), loader.clone()),
            loader,
            store,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_gets_share_one_load() {
        let (getter, loader, _) = getter(TestLoader::default());
        let getter = Arc::new(getter);

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let getter = getter.clone();
            tasks.push(tokio::spawn(async move {
                getter.get(&"subject".to_string(), GetOptions::default()).await
            }));
        }
        let mut values = Vec::new();
        for task in tasks {
            values.push(task.await.unwrap().unwrap());
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1, "exactly one load");
        assert!(values.iter().all(|v| *v == values[0]), "all callers share it");
    }

    // current-thread runtime: every caller is polled (and joins the
    // flight) before the spawned flight can run, so the single-error
    // sharing is deterministic
    #[tokio::test]
    async fn concurrent_failures_share_one_error() {
        let mut loader = TestLoader::default();
        loader.fail = AtomicBool::new(true);
        let (getter, loader, store) = getter(loader);
        let key = "subject".to_string();

        let results = tokio::join!(
            getter.get(&key, GetOptions::default()),
            getter.get(&key, GetOptions::default()),
            getter.get(&key, GetOptions::default()),
            getter.get(&key, GetOptions::default()),
        );
        for err in [results.0, results.1, results.2, results.3].map(Result::unwrap_err) {
            assert!(matches!(err.as_root(), OAuthError::TaskFailed(_)));
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        // should_delete was false; nothing written either way
        assert_eq!(store.get(&key).await, None);
    }

    #[tokio::test]
    async fn second_get_uses_store_without_reloading() {
        let (getter, loader, _) = getter(TestLoader::default());
        let key = "subject".to_string();
        let first = getter.get(&key, GetOptions::default()).await.unwrap();
        let second = getter.get(&key, GetOptions::default()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_refresh_reloads() {
        let (getter, loader, _) = getter(TestLoader::default());
        let key = "subject".to_string();
        let first = getter.get(&key, GetOptions::default()).await.unwrap();
        let second = getter.get(&key, GetOptions::force()).await.unwrap();
        assert_eq!(second, first + 1);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_value_refreshes_unless_allowed() {
        let (getter, loader, _) = getter(TestLoader::default());
        let key = "subject".to_string();
        getter.get(&key, GetOptions::default()).await.unwrap();
        loader.stale.store(true, Ordering::SeqCst);

        // allow_stale: take the stored value as-is
        let stale = getter.get(&key, GetOptions::stale_ok()).await.unwrap();
        assert_eq!(stale, 1);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);

        // default: stale triggers a refresh
        let fresh = getter.get(&key, GetOptions::default()).await.unwrap();
        assert_eq!(fresh, 2);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_load_can_evict_stored_value() {
        let mut loader = TestLoader::default();
        loader.delete_on_error = true;
        let (getter, loader, store) = getter(loader);
        let key = "subject".to_string();

        store.set(key.clone(), 7).await.unwrap();
        loader.stale.store(true, Ordering::SeqCst);
        loader.fail.store(true, Ordering::SeqCst);

        getter.get(&key, GetOptions::default()).await.unwrap_err();
        assert_eq!(store.get(&key).await, None, "bad entry evicted");
        assert!(loader.deleted.load(Ordering::SeqCst), "deletion hook fired");
    }

    #[tokio::test]
    async fn deadline_bounds_a_stuck_load() {
        let mut loader = TestLoader::default();
        loader.delay = Duration::from_secs(60);
        let (getter, _, _) = getter(loader);
        let getter = getter.with_deadline(Duration::from_millis(50));
        let err = getter
            .get(&"subject".to_string(), GetOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err.as_root(), OAuthError::Deadline));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn caller_cancellation_does_not_abort_the_flight() {
        let (getter, loader, store) = getter(TestLoader::default());
        let getter = Arc::new(getter);
        let key = "subject".to_string();

        let task = {
            let getter = getter.clone();
            let key = key.clone();
            tokio::spawn(async move { getter.get(&key, GetOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        task.abort();
        let _ = task.await;

        // the detached flight still completes and persists
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get(&key).await, Some(1));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }
}
