use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use futures::future::{BoxFuture, FutureExt, Shared};
use log::debug;

/// Resource classes whose refreshes are deduplicated independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Jobs,
    Coverage,
}

pub type SharedOutcome<T> = Shared<BoxFuture<'static, T>>;

/// Handle to an outstanding operation, new or joined
pub struct Coalesced<T: Clone> {
    /// Issuance number of the underlying call; increases with every new call
    pub ticket: u64,
    /// True when this request attached to a call that was already in flight
    pub joined: bool,
    handle: SharedOutcome<T>,
}

impl<T: Clone> Coalesced<T> {
    pub fn handle(&self) -> SharedOutcome<T> {
        self.handle.clone()
    }

    pub async fn wait(self) -> T {
        self.handle.await
    }
}

struct InFlight<T: Clone> {
    ticket: u64,
    handle: SharedOutcome<T>,
}

struct Registry<K, T: Clone> {
    inflight: HashMap<K, InFlight<T>>,
    next_ticket: u64,
}

/// Keeps at most one outstanding operation per key
///
/// A request made while an operation for the same key is in flight is handed
/// that operation's shared result instead of starting a second call. The
/// registration is cleared as soon as the operation settles, success or not.
pub struct RequestCoalescer<K, T: Clone> {
    registry: Arc<Mutex<Registry<K, T>>>,
}

impl<K, T: Clone> Clone for RequestCoalescer<K, T> {
    fn clone(&self) -> Self {
        Self { registry: Arc::clone(&self.registry) }
    }
}

impl<K, T> Default for RequestCoalescer<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> RequestCoalescer<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                inflight: HashMap::new(),
                next_ticket: 0,
            })),
        }
    }

    /// Start `operation` for `key`, or join the one already outstanding
    ///
    /// A new operation is spawned onto the runtime so it settles (and clears
    /// its registration) even if every caller drops its handle.
    pub fn run_exclusive<F, Fut>(&self, key: K, operation: F) -> Coalesced<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut registry = lock(&self.registry);

        if let Some(existing) = registry.inflight.get(&key) {
            debug!("Joining outstanding {:?} request #{}", key, existing.ticket);
            return Coalesced {
                ticket: existing.ticket,
                joined: true,
                handle: existing.handle.clone(),
            };
        }

        registry.next_ticket += 1;
        let ticket = registry.next_ticket;

        let settle_registry = Arc::clone(&self.registry);
        let settle_key = key.clone();
        let pending = operation();
        let handle = async move {
            let outcome = pending.await;
            let mut registry = lock(&settle_registry);
            if registry.inflight.get(&settle_key).map(|f| f.ticket) == Some(ticket) {
                registry.inflight.remove(&settle_key);
            }
            outcome
        }
        .boxed()
        .shared();

        registry.inflight.insert(key, InFlight { ticket, handle: handle.clone() });
        drop(registry);

        tokio::spawn(handle.clone());

        Coalesced { ticket, joined: false, handle }
    }

    pub fn is_outstanding(&self, key: &K) -> bool {
        lock(&self.registry).inflight.contains_key(key)
    }

    pub fn outstanding(&self) -> usize {
        lock(&self.registry).inflight.len()
    }
}

fn lock<K, T: Clone>(registry: &Mutex<Registry<K, T>>) -> MutexGuard<'_, Registry<K, T>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    type Outcome = Result<u32, String>;

    fn gated(
        calls: &Arc<AtomicUsize>,
        value: Outcome,
    ) -> (oneshot::Sender<()>, impl FnOnce() -> BoxFuture<'static, Outcome>) {
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let calls = Arc::clone(calls);
        let op = move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                let _ = gate_rx.await;
                value
            }
            .boxed()
        };
        (gate_tx, op)
    }

    #[tokio::test]
    async fn test_concurrent_same_class_makes_one_call() {
        let coalescer: RequestCoalescer<ResourceClass, Outcome> = RequestCoalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (gate, op) = gated(&calls, Ok(7));
        let first = coalescer.run_exclusive(ResourceClass::Jobs, op);
        let (_unused_gate, second_op) = gated(&calls, Ok(99));
        let second = coalescer.run_exclusive(ResourceClass::Jobs, second_op);

        assert!(!first.joined);
        assert!(second.joined);
        assert_eq!(first.ticket, second.ticket);

        gate.send(()).unwrap();
        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert_eq!(a, Ok(7));
        assert_eq!(b, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_classes_run_independently() {
        let coalescer: RequestCoalescer<ResourceClass, Outcome> = RequestCoalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (jobs_gate, jobs_op) = gated(&calls, Ok(1));
        let (cov_gate, cov_op) = gated(&calls, Ok(2));
        let jobs = coalescer.run_exclusive(ResourceClass::Jobs, jobs_op);
        let coverage = coalescer.run_exclusive(ResourceClass::Coverage, cov_op);

        assert!(!jobs.joined);
        assert!(!coverage.joined);
        assert_eq!(coalescer.outstanding(), 2);

        jobs_gate.send(()).unwrap();
        cov_gate.send(()).unwrap();
        assert_eq!(jobs.wait().await, Ok(1));
        assert_eq!(coverage.wait().await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_registration_cleared_after_failure() {
        let coalescer: RequestCoalescer<ResourceClass, Outcome> = RequestCoalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (gate, op) = gated(&calls, Err("timeout".to_string()));
        let first = coalescer.run_exclusive(ResourceClass::Jobs, op);
        gate.send(()).unwrap();
        assert_eq!(first.wait().await, Err("timeout".to_string()));
        assert!(!coalescer.is_outstanding(&ResourceClass::Jobs));

        let (gate, op) = gated(&calls, Ok(3));
        let retry = coalescer.run_exclusive(ResourceClass::Jobs, op);
        assert!(!retry.joined);
        assert_eq!(retry.ticket, 2);
        gate.send(()).unwrap();
        assert_eq!(retry.wait().await, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_operation_settles_without_waiters() {
        let coalescer: RequestCoalescer<ResourceClass, Outcome> = RequestCoalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (gate, op) = gated(&calls, Ok(5));
        drop(coalescer.run_exclusive(ResourceClass::Coverage, op));
        gate.send(()).unwrap();

        for _ in 0..50 {
            if !coalescer.is_outstanding(&ResourceClass::Coverage) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!coalescer.is_outstanding(&ResourceClass::Coverage));
    }
}
