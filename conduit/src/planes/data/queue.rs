use crate::ports::{OpFuture, Operation};
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct QueueItem {
    id: u64,
    enqueued_at: Instant,
    job: Job,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    draining: bool,
}

type QueueMap = DashMap<String, Arc<Mutex<QueueState>>>;

/// Runs work items one at a time per named queue, in arrival order.
///
/// Each queue is drained by a single task that exists only while the queue
/// has work. Different queues run independently of each other.
pub struct QueueSerializer {
    queues: Arc<QueueMap>,
    next_id: AtomicU64,
}

impl QueueSerializer {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Append `make` to `queue_id`. Never blocks; the returned ticket resolves
    /// with the item's output once it has run.
    ///
    /// `make` is not invoked until every earlier item of the queue settled.
    pub fn enqueue<F, Fut, T>(&self, queue_id: &str, make: F) -> QueueTicket<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let job: Job = Box::new(move || {
            Box::pin(async move {
                let outcome = AssertUnwindSafe(async move { make().await })
                    .catch_unwind()
                    .await;
                // The ticket may have been dropped; the work still counts as done
                let _ = tx.send(outcome);
            })
        });

        // Shard lock is held while pushing so an idle queue cannot be
        // retired between lookup and push
        let entry = self.queues.entry(queue_id.to_string()).or_default();
        let state = Arc::clone(entry.value());
        let start_drain = {
            let mut guard = state.lock();
            guard.items.push_back(QueueItem {
                id,
                enqueued_at: Instant::now(),
                job,
            });
            trace!(queue = queue_id, id, depth = guard.items.len(), "Enqueued item");
            !std::mem::replace(&mut guard.draining, true)
        };
        drop(entry);

        if start_drain {
            debug!(queue = queue_id, "Starting queue drain");
            tokio::spawn(drain(
                Arc::clone(&self.queues),
                queue_id.to_string(),
                Arc::clone(&state),
            ));
        }

        QueueTicket {
            id,
            queue_id: queue_id.to_string(),
            state,
            receiver: rx,
        }
    }

    /// Items waiting in `queue_id`, excluding the one currently running
    pub fn pending_len(&self, queue_id: &str) -> usize {
        self.queues
            .get(queue_id)
            .map(|state| state.lock().items.len())
            .unwrap_or(0)
    }

    /// Queues that currently have work
    pub fn active_queues(&self) -> usize {
        self.queues.len()
    }
}

impl Default for QueueSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for QueueSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSerializer")
            .field("active_queues", &self.queues.len())
            .finish()
    }
}

async fn drain(queues: Arc<QueueMap>, queue_id: String, state: Arc<Mutex<QueueState>>) {
    loop {
        let next = {
            let mut guard = state.lock();
            let next = guard.items.pop_front();
            if next.is_none() {
                guard.draining = false;
            }
            next
        };

        let Some(item) = next else {
            break;
        };
        debug!(
            queue = %queue_id,
            id = item.id,
            waited_ms = item.enqueued_at.elapsed().as_millis() as u64,
            "Dequeued item"
        );
        (item.job)().await;
    }

    queues.remove_if(&queue_id, |_, current| {
        let guard = current.lock();
        Arc::ptr_eq(current, &state) && !guard.draining && guard.items.is_empty()
    });
    debug!(queue = %queue_id, "Queue drained");
}

/// Resolves with the output of one queued item.
///
/// A panic raised by the item is resumed in whoever awaits the ticket.
pub struct QueueTicket<T> {
    id: u64,
    queue_id: String,
    state: Arc<Mutex<QueueState>>,
    receiver: oneshot::Receiver<std::thread::Result<T>>,
}

impl<T> QueueTicket<T> {
    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    /// Remove the item before it starts. An item that already started cannot
    /// be cancelled and the ticket is handed back.
    pub fn cancel(self) -> std::result::Result<(), Self> {
        let removed = {
            let mut guard = self.state.lock();
            match guard.items.iter().position(|item| item.id == self.id) {
                Some(index) => guard.items.remove(index),
                None => None,
            }
        };

        match removed {
            Some(_) => {
                debug!(queue = %self.queue_id, id = self.id, "Cancelled queued item");
                Ok(())
            }
            None => Err(self),
        }
    }
}

impl<T> Future for QueueTicket<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Ok(value))) => Poll::Ready(value),
            Poll::Ready(Ok(Err(panic))) => std::panic::resume_unwind(panic),
            Poll::Ready(Err(_)) => panic!(
                "queue item {} in '{}' was dropped before completion",
                self.id, self.queue_id
            ),
        }
    }
}

impl<T> Debug for QueueTicket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueTicket")
            .field("id", &self.id)
            .field("queue_id", &self.queue_id)
            .finish()
    }
}

/// An operation whose calls run one at a time through a named queue
pub struct Queued<O, A, T, E> {
    inner: Arc<O>,
    queue_id: String,
    serializer: Arc<QueueSerializer>,
    _marker: PhantomData<fn(A) -> (T, E)>,
}

impl<O, A, T, E> Queued<O, A, T, E> {
    pub fn new(inner: O, queue_id: impl Into<String>, serializer: Arc<QueueSerializer>) -> Self {
        Self {
            inner: Arc::new(inner),
            queue_id: queue_id.into(),
            serializer,
            _marker: PhantomData,
        }
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }
}

impl<O, A, T, E> Operation<A, T, E> for Queued<O, A, T, E>
where
    O: Operation<A, T, E>,
    A: Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    fn call(&self, args: A) -> OpFuture<T, E> {
        let inner = Arc::clone(&self.inner);
        Box::pin(self.serializer.enqueue(&self.queue_id, move || inner.call(args)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Error;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::sleep;

    type Log = Arc<Mutex<Vec<String>>>;

    fn job(
        log: Log,
        name: &'static str,
        ms: u64,
    ) -> impl FnOnce() -> BoxFuture<'static, &'static str> + Send + 'static {
        move || {
            Box::pin(async move {
                log.lock().push(format!("start {}", name));
                sleep(Duration::from_millis(ms)).await;
                log.lock().push(format!("end {}", name));
                name
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_items_run_in_arrival_order_without_overlap() {
        let queue = QueueSerializer::new();
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let a = queue.enqueue("ward-7", job(Arc::clone(&log), "a", 300));
        let b = queue.enqueue("ward-7", job(Arc::clone(&log), "b", 100));
        let c = queue.enqueue("ward-7", job(Arc::clone(&log), "c", 200));
        assert_eq!(queue.pending_len("ward-7"), 3);

        let (a, b, c) = tokio::join!(a, b, c);

        assert_eq!((a, b, c), ("a", "b", "c"));
        assert_eq!(
            *log.lock(),
            vec!["start a", "end a", "start b", "end b", "start c", "end c"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_queues_run_concurrently() {
        let queue = QueueSerializer::new();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let started = Instant::now();

        let a = queue.enqueue("ward-1", job(Arc::clone(&log), "a", 100));
        let b = queue.enqueue("ward-2", job(Arc::clone(&log), "b", 100));
        tokio::join!(a, b);

        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_removes_item_that_has_not_started() {
        let queue = QueueSerializer::new();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invoked);

        let first = queue.enqueue("ward-3", job(Arc::clone(&log), "first", 100));
        let second = queue.enqueue("ward-3", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { "second" }
        });

        assert!(second.cancel().is_ok());
        assert_eq!(first.await, "first");
        sleep(Duration::from_millis(50)).await;
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending_len("ward-3"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_refused_once_started() {
        let queue = QueueSerializer::new();
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let ticket = queue.enqueue("ward-4", job(Arc::clone(&log), "running", 100));
        tokio::task::yield_now().await;
        assert_eq!(*log.lock(), vec!["start running"]);

        let ticket = ticket.cancel().unwrap_err();
        assert_eq!(ticket.await, "running");
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_item_does_not_stall_queue() {
        let queue = QueueSerializer::new();

        let boom = queue.enqueue("ward-5", || async {
            if true {
                panic!("item exploded");
            }
            0u32
        });
        let next = queue.enqueue("ward-5", || async { 42u32 });

        let joined = tokio::spawn(boom).await;
        assert!(joined.unwrap_err().is_panic());
        assert_eq!(next.await, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_queue_is_retired() {
        let queue = QueueSerializer::new();
        queue.enqueue("ward-6", || async {}).await;
        tokio::task::yield_now().await;
        assert_eq!(queue.active_queues(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_operation_serializes_calls() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));
        let (active, seen) = (Arc::clone(&in_flight), Arc::clone(&overlap));

        let op = Queued::new(
            move |n: u32| -> OpFuture<u32, Error> {
                let active = Arc::clone(&active);
                let seen = Arc::clone(&seen);
                Box::pin(async move {
                    if active.fetch_add(1, Ordering::SeqCst) > 0 {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                    sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(n * 2)
                })
            },
            "writes",
            Arc::new(QueueSerializer::new()),
        );

        let results = futures::future::join_all((1..=5).map(|n| op.call(n))).await;

        assert_eq!(overlap.load(Ordering::SeqCst), 0);
        let values: Vec<u32> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![2, 4, 6, 8, 10]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_producers_on_many_threads_never_overlap() {
        let queue = Arc::new(QueueSerializer::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let producers: Vec<_> = (0..4)
            .map(|producer| {
                let queue = Arc::clone(&queue);
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let tickets: Vec<_> = (0..5)
                        .map(|n| {
                            let active = Arc::clone(&active);
                            let peak = Arc::clone(&peak);
                            let log = Arc::clone(&log);
                            queue.enqueue("beds", move || async move {
                                let running = active.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(running, Ordering::SeqCst);
                                sleep(Duration::from_millis(2)).await;
                                log.lock().push(format!("{}-{}", producer, n));
                                active.fetch_sub(1, Ordering::SeqCst);
                            })
                        })
                        .collect();
                    for ticket in tickets {
                        ticket.await;
                    }
                })
            })
            .collect();

        for producer in futures::future::join_all(producers).await {
            producer.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        let log = log.lock();
        assert_eq!(log.len(), 20);
        for producer in 0..4 {
            let prefix = format!("{}-", producer);
            let order: Vec<String> = log.iter().filter(|e| e.starts_with(&prefix)).cloned().collect();
            let expected: Vec<String> = (0..5).map(|n| format!("{}-{}", producer, n)).collect();
            assert_eq!(order, expected);
        }
    }
}
