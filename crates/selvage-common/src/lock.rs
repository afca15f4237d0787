//! Optional cross-process mutual exclusion.
//!
//! Platforms that can provide a real named lock (file locks, OS mutexes,
//! the Web Locks API behind a bridge) implement [`ProcessLock`]; the
//! session refresh machinery acquires it around the whole
//! get-or-refresh sequence when configured. When no lock is available the
//! caller falls back to store-read reconciliation, so implementations are
//! never required for correctness, only for efficiency.

use async_trait::async_trait;
use dashmap::DashMap;
use smol_str::SmolStr;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::store::StateStoreError;

/// Guard token returned by [`ProcessLock::acquire`]; the lock is released
/// when the token is dropped.
pub type LockGuard = Box<dyn Any + Send>;

/// A named, acquire-and-hold mutual exclusion primitive.
///
/// Implementations must be safe to call concurrently from many tasks, and
/// the returned guard must release the named lock on drop.
#[async_trait]
pub trait ProcessLock: Send + Sync {
    /// Acquire the named lock, waiting until it is available.
    async fn acquire(&self, name: &str) -> Result<LockGuard, StateStoreError>;
}

/// In-process lock provider: one `tokio::sync::Mutex` per name.
///
/// Serializes flows inside a single process only. Useful as a default and
/// in tests; it does NOT protect against other processes sharing the same
/// backing store.
#[derive(Default, Clone)]
pub struct LocalLock {
    locks: Arc<DashMap<SmolStr, Arc<Mutex<()>>>>,
}

#[async_trait]
impl ProcessLock for LocalLock {
    async fn acquire(&self, name: &str) -> Result<LockGuard, StateStoreError> {
        let mutex = {
            let entry = self.locks.entry(SmolStr::new(name)).or_default();
            entry.value().clone()
        };
        Ok(Box::new(mutex.lock_owned().await))
    }
}
