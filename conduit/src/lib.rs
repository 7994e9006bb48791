//! Composable control wrappers for asynchronous operations: caching,
//! deduplication, retry with backoff, polling, queue serialization, batching
//! and memoization.

pub mod compose;
pub mod domain;
pub mod events;
pub mod keys;
pub mod persistence;
pub mod planes;
pub mod ports;
pub mod store;

pub use compose::OperationExt;
pub use domain::{
    BackoffStrategy, BatchConfig, CacheConfig, CacheEntry, CacheScope, MemoConfig, PollConfig,
    RetryConfig, StopReason,
};
pub use events::{CacheEvent, EventSink};
pub use keys::KeyGenerator;
pub use planes::control::{CacheManagement, Registry, RegistryBuilder};
pub use planes::data::{
    BatchAborted, BatchProcessor, BatchProgress, CacheBinding, Cached, Deduped, Deduplicator,
    Memoized, Memoizer, PollHandle, PollOutcome, PollPolicy, QueueSerializer, QueueTicket, Queued,
    RetryExhausted, RetryPolicy, Retrying,
};
pub use ports::{CacheStore, ErrorStatus, OpFuture, Operation, PersistenceBackend};
pub use store::TtlStore;
