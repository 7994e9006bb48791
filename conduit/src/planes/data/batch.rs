use crate::domain::BatchConfig;
use crate::ports::Operation;
use futures::StreamExt;
use futures::stream;
use shared::Result;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;
use tracing::{debug, warn};

type ProgressCallback = Arc<dyn Fn(&BatchProgress) + Send + Sync>;

/// Position of one chunk within a batch run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchProgress {
    /// 0-based chunk index
    pub batch: usize,
    pub batches: usize,
    /// Items in this chunk
    pub items: usize,
    /// Items of the whole run settled so far, this chunk included once complete
    pub processed: usize,
    /// Failures within this chunk; always 0 at chunk start
    pub failed: usize,
}

/// Fail-fast batch run stopped at the item at `index`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchAborted<E> {
    pub index: usize,
    pub error: E,
}

impl<E: Display> Display for BatchAborted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch aborted at item {}: {}", self.index, self.error)
    }
}

impl<E> std::error::Error for BatchAborted<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Drives a collection through an operation in bounded chunks.
///
/// Chunks run one after another; inside a chunk at most `concurrency` items
/// are in flight. Output order always matches input order.
#[derive(Clone)]
pub struct BatchProcessor {
    config: BatchConfig,
    on_batch_start: Option<ProgressCallback>,
    on_batch_complete: Option<ProgressCallback>,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            on_batch_start: None,
            on_batch_complete: None,
        })
    }

    pub fn on_batch_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&BatchProgress) + Send + Sync + 'static,
    {
        self.on_batch_start = Some(Arc::new(callback));
        self
    }

    pub fn on_batch_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&BatchProgress) + Send + Sync + 'static,
    {
        self.on_batch_complete = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Run every item, keeping each failure in its own slot
    pub async fn process<O, A, T, E>(&self, items: Vec<A>, op: &O) -> Vec<std::result::Result<T, E>>
    where
        O: Operation<A, T, E> + ?Sized,
    {
        let total = items.len();
        let batches = total.div_ceil(self.config.batch_size);
        let mut results = Vec::with_capacity(total);

        for (batch, chunk) in chunked(items, self.config.batch_size).into_iter().enumerate() {
            let mut progress = BatchProgress {
                batch,
                batches,
                items: chunk.len(),
                processed: results.len(),
                failed: 0,
            };
            self.started(&progress);

            let settled: Vec<_> = stream::iter(chunk.into_iter().map(|item| op.call(item)))
                .buffered(self.config.concurrency)
                .collect()
                .await;

            progress.failed = settled.iter().filter(|r| r.is_err()).count();
            results.extend(settled);
            progress.processed = results.len();
            self.completed(&progress);
        }

        results
    }

    /// Run items until the first failure in input order.
    ///
    /// Items of the failing chunk still in flight are dropped and later chunks
    /// never start.
    pub async fn process_fail_fast<O, A, T, E>(
        &self,
        items: Vec<A>,
        op: &O,
    ) -> std::result::Result<Vec<T>, BatchAborted<E>>
    where
        O: Operation<A, T, E> + ?Sized,
    {
        let total = items.len();
        let batches = total.div_ceil(self.config.batch_size);
        let mut values = Vec::with_capacity(total);

        for (batch, chunk) in chunked(items, self.config.batch_size).into_iter().enumerate() {
            let mut progress = BatchProgress {
                batch,
                batches,
                items: chunk.len(),
                processed: values.len(),
                failed: 0,
            };
            self.started(&progress);

            let mut settled =
                stream::iter(chunk.into_iter().map(|item| op.call(item))).buffered(self.config.concurrency);
            while let Some(result) = settled.next().await {
                match result {
                    Ok(value) => values.push(value),
                    Err(error) => {
                        let index = values.len();
                        warn!(index, batch, "Batch aborted on first failure");
                        progress.failed = 1;
                        progress.processed = index + 1;
                        self.completed(&progress);
                        return Err(BatchAborted { index, error });
                    }
                }
            }

            progress.processed = values.len();
            self.completed(&progress);
        }

        Ok(values)
    }

    fn started(&self, progress: &BatchProgress) {
        debug!(
            batch = progress.batch,
            batches = progress.batches,
            items = progress.items,
            "Batch started"
        );
        if let Some(ref callback) = self.on_batch_start {
            callback(progress);
        }
    }

    fn completed(&self, progress: &BatchProgress) {
        debug!(
            batch = progress.batch,
            failed = progress.failed,
            processed = progress.processed,
            "Batch complete"
        );
        if let Some(ref callback) = self.on_batch_complete {
            callback(progress);
        }
    }
}

impl Debug for BatchProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("config", &self.config)
            .finish()
    }
}

fn chunked<A>(items: Vec<A>, size: usize) -> Vec<Vec<A>> {
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        chunks.push(items.by_ref().take(size).collect());
    }
    chunks
}
