// Control wrappers that sit in the call path of an operation

pub mod backoff;
pub mod batch;
pub mod cached;
pub mod dedup;
pub mod memo;
pub mod polling;
pub mod queue;
pub mod retry;

pub use backoff::Backoff;
pub use batch::{BatchAborted, BatchProcessor, BatchProgress};
pub use cached::{CacheBinding, Cached};
pub use dedup::{Deduped, Deduplicator, SharedResult};
pub use memo::{Memoized, Memoizer};
pub use polling::{PollHandle, PollOutcome, PollPolicy};
pub use queue::{QueueSerializer, QueueTicket, Queued};
pub use retry::{RetryExhausted, RetryPolicy, Retrying};
