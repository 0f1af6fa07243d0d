//! # Condo Runtime
//!
//! Runtime pieces that sit between the pure reducers and the outside world.
//!
//! ## Core Components
//!
//! - **`EffectExecutor`**: executes effect descriptions returned by reducers and
//!   collects the feedback actions they produce
//! - **`LockRegistry`**: per-resource async locks, so that the check and the write
//!   of one resource (an area's day, a key) never interleave with another writer
//! - **metrics**: metric names and descriptions
//!
//! ## Example
//!
//! ```ignore
//! use condo_runtime::{EffectExecutor, LockRegistry};
//!
//! let locks = LockRegistry::new();
//! let _guard = locks.lock((area_id, date)).await;
//! let effects = reducer.reduce(&mut state, action, &env);
//! // ... persist ...
//! let feedback = EffectExecutor::run(effects).await;
//! ```

use condo_core::effect::Effect;
use futures::future::join_all;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

/// Metric names and registration
pub mod metrics;

/// Executes effects returned by reducers.
///
/// The effects of one reducer call are independent of each other and are
/// polled concurrently in the calling task.
#[derive(Debug, Clone, Copy, Default)]
pub struct EffectExecutor;

impl EffectExecutor {
    /// Run every effect and return the feedback actions, in declaration order.
    pub async fn run<A, I>(effects: I) -> Vec<A>
    where
        A: Send + 'static,
        I: IntoIterator<Item = Effect<A>>,
    {
        let pending: Vec<_> = effects
            .into_iter()
            .filter_map(|effect| match effect {
                Effect::None => None,
                Effect::Future(future) => Some(future),
            })
            .collect();
        if pending.is_empty() {
            return Vec::new();
        }

        let executed = u64::try_from(pending.len()).unwrap_or(u64::MAX);
        let feedback: Vec<A> = join_all(pending).await.into_iter().flatten().collect();

        ::metrics::counter!(crate::metrics::EFFECTS_EXECUTED).increment(executed);
        tracing::debug!(executed, feedback = feedback.len(), "effects executed");
        feedback
    }
}

/// Number of idle entries tolerated before the registry prunes itself.
const PRUNE_THRESHOLD: usize = 1024;

/// Registry of per-resource async locks.
///
/// Holding the guard for a key gives exclusive access to that resource for
/// every caller sharing the registry. Locks for different keys never contend.
pub struct LockRegistry<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K> LockRegistry<K>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for `key`, waiting for the current holder if any.
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if locks.len() >= PRUNE_THRESHOLD {
                // Only the registry holds an idle lock
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(key).or_default())
        };

        mutex.lock_owned().await
    }

    /// Number of resources currently tracked
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no resource is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Default for LockRegistry<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> std::fmt::Debug for LockRegistry<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Ping {
        Pong(u32),
    }

    #[tokio::test]
    async fn collects_feedback_in_order() {
        let effects = vec![
            Effect::None,
            Effect::Future(Box::pin(async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Some(Ping::Pong(1))
            })),
            Effect::Future(Box::pin(async { None })),
            Effect::Future(Box::pin(async { Some(Ping::Pong(2)) })),
        ];

        let feedback = EffectExecutor::run(effects).await;
        assert_eq!(feedback, vec![Ping::Pong(1), Ping::Pong(2)]);
    }

    #[tokio::test]
    async fn fire_and_forget_effects_all_run() {
        let counter = Arc::new(AtomicUsize::new(0));
        let effects: Vec<Effect<Ping>> = (0..5)
            .map(|_| {
                let counter = Arc::clone(&counter);
                Effect::fire_and_forget(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        let feedback = EffectExecutor::run(effects).await;
        assert!(feedback.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn lock_serializes_same_key() {
        let registry = Arc::new(LockRegistry::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                tokio::spawn(async move {
                    let _guard = registry.lock("pool").await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in join_all(tasks).await {
            assert!(task.is_ok());
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let registry = LockRegistry::new();
        let _pool = registry.lock("pool").await;
        let bbq = tokio::time::timeout(Duration::from_millis(50), registry.lock("bbq")).await;
        assert!(bbq.is_ok());
        assert_eq!(registry.len(), 2);
    }
}
