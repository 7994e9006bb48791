use crate::keys::KeyGenerator;
use crate::ports::{OpFuture, Operation};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::Shared;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Handle on an execution that any number of callers can await
pub type SharedResult<T, E> = Shared<OpFuture<T, E>>;

struct PendingExecution<T, E> {
    id: u64,
    started_at: Instant,
    handle: SharedResult<T, E>,
}

/// Retires a pending execution when its task finishes, panics or is aborted
struct Retire<T, E> {
    table: Arc<DashMap<String, PendingExecution<T, E>>>,
    key: String,
    id: u64,
}

impl<T, E> Drop for Retire<T, E> {
    fn drop(&mut self) {
        self.table.remove_if(&self.key, |_, pending| pending.id == self.id);
    }
}

/// Ensures at most one in-flight execution per key.
///
/// The first caller for a key launches the operation on its own task;
/// concurrent callers attach to the same [`SharedResult`] and observe the same
/// settlement. Dropping every handle does not cancel the execution.
pub struct Deduplicator<T, E> {
    namespace: String,
    pending: Arc<DashMap<String, PendingExecution<T, E>>>,
    next_id: AtomicU64,
}

impl<T, E> Deduplicator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Join the in-flight execution for `key`, or launch `make()` as a new one.
    ///
    /// Check-and-register happens under the map's shard lock, so two callers
    /// can never both launch for the same key. `make()` itself runs after the
    /// lock is released and may call back into this deduplicator.
    pub fn run_or_join<F>(&self, key: &str, make: F) -> SharedResult<T, E>
    where
        F: FnOnce() -> OpFuture<T, E>,
    {
        let (handle, launch) = match self.pending.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                debug!(
                    namespace = %self.namespace,
                    key,
                    in_flight_ms = occupied.get().started_at.elapsed().as_millis() as u64,
                    "Joining in-flight execution"
                );
                return occupied.get().handle.clone();
            }
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let retire = Retire {
                    table: Arc::clone(&self.pending),
                    key: key.to_string(),
                    id,
                };
                let (launch, launched) = oneshot::channel::<OpFuture<T, E>>();

                let task = tokio::spawn(async move {
                    let _retire = retire;
                    match launched.await {
                        Ok(operation) => operation.await,
                        Err(_) => panic!("deduplicated execution was never started"),
                    }
                });

                let handle: OpFuture<T, E> = Box::pin(async move {
                    match task.await {
                        Ok(result) => result,
                        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                        Err(err) => panic!("deduplicated execution was aborted: {}", err),
                    }
                });
                let handle = handle.shared();

                vacant.insert(PendingExecution {
                    id,
                    started_at: Instant::now(),
                    handle: handle.clone(),
                });
                (handle, launch)
            }
        };

        debug!(namespace = %self.namespace, key, "Launching execution");
        // Fails only when the runtime already dropped the task
        let _ = launch.send(make());
        handle
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl<T, E> Debug for Deduplicator<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("namespace", &self.namespace)
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// An operation whose concurrent identical calls share one execution
pub struct Deduped<O, A, T, E> {
    inner: Arc<O>,
    keys: KeyGenerator<A>,
    dedup: Arc<Deduplicator<T, E>>,
    _marker: PhantomData<fn() -> (T, E)>,
}

impl<O, A, T, E> Deduped<O, A, T, E>
where
    O: Operation<A, T, E>,
    A: Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(inner: O, keys: KeyGenerator<A>, dedup: Arc<Deduplicator<T, E>>) -> Self {
        Self {
            inner: Arc::new(inner),
            keys,
            dedup,
            _marker: PhantomData,
        }
    }

    pub fn deduplicator(&self) -> &Arc<Deduplicator<T, E>> {
        &self.dedup
    }
}

impl<O, A, T, E> Operation<A, T, E> for Deduped<O, A, T, E>
where
    O: Operation<A, T, E>,
    A: Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn call(&self, args: A) -> OpFuture<T, E> {
        let key = match self.keys.generate(&args) {
            Ok(key) => key,
            Err(e) => {
                warn!(namespace = %self.dedup.namespace(), "Bypassing deduplication: {}", e);
                return self.inner.call(args);
            }
        };

        let inner = Arc::clone(&self.inner);
        Box::pin(self.dedup.run_or_join(&key, move || inner.call(args)))
    }
}
