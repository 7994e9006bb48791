use conduit::domain::{BatchConfig, CacheConfig, CacheScope, PollConfig, RetryConfig};
use conduit::keys::KeyGenerator;
use conduit::ports::{OpFuture, Operation, PersistenceBackend};
use conduit::persistence::MemoryBackend;
use conduit::{BatchProcessor, OperationExt, PollPolicy, Registry, RetryPolicy};
use serde::Serialize;
use shared::config::Config;
use shared::{Error, TtlMs};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use storage_engine::SledBackend;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize)]
struct SlotQuery {
    doctor: u32,
    day: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting conduit demo");

    match dotenvy::dotenv() {
        Ok(_) => info!("Loaded environment variables from .env file"),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let config = Config::from_env();
    let registry = build_registry(config.clone());

    demo_cached_lookup(&registry).await?;
    demo_queue(&registry).await;
    demo_batch(&config).await?;
    demo_poll().await?;

    let cleared = registry.clear_all().await.invalidated;
    info!(cleared, "Demo finished");
    Ok(())
}

fn build_registry(config: Config) -> Registry {
    let path = Path::new(&config.data_dir).join("conduit.db");
    let persistence: Arc<dyn PersistenceBackend> = match SledBackend::open(&path) {
        Ok(backend) => {
            info!(path = %path.display(), "Persistence enabled");
            Arc::new(backend)
        }
        Err(e) => {
            warn!("Failed to open persistence: {}. Running in-memory mode.", e);
            Arc::new(MemoryBackend::new())
        }
    };

    Registry::builder()
        .config(config)
        .persistence(persistence)
        .events(256)
        .build()
}

/// Flaky slot lookup behind retry, deduplication and a persistent cache
async fn demo_cached_lookup(registry: &Registry) -> shared::Result<()> {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let lookup = move |query: SlotQuery| -> OpFuture<Vec<String>, Error> {
        let call = counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            sleep(Duration::from_millis(50)).await;
            if call == 0 {
                return Err(Error::status(503, "scheduler warming up"));
            }
            Ok(vec![
                format!("{} 09:00 doctor-{}", query.day, query.doctor),
                format!("{} 14:30 doctor-{}", query.day, query.doctor),
            ])
        })
    };

    let retry = RetryPolicy::new(RetryConfig::from_config(registry.config()))?
        .before_retry(|e: &Error, retry, delay| {
            warn!(retry, delay_ms = delay.as_millis() as u64, "Retrying slot lookup: {}", e)
        });

    let slots = lookup
        .retry(retry)
        .deduplicated(KeyGenerator::serialized("slots"), registry)?
        .cached(
            KeyGenerator::serialized("slots"),
            CacheConfig::new("slots", TtlMs(60_000))
                .scope(CacheScope::Persistent)
                .group("week-42")
                .stale_while_revalidate(true),
            registry,
        )?;

    let query = SlotQuery {
        doctor: 7,
        day: "2026-10-19".to_string(),
    };
    let concurrent = futures::future::join_all((0..5).map(|_| slots.call(query.clone()))).await;
    let served = concurrent.iter().filter(|r| r.is_ok()).count();
    info!(served, invocations = calls.load(Ordering::SeqCst), "Concurrent lookups settled");

    let again = slots.call(query).await?;
    info!(slots = ?again, invocations = calls.load(Ordering::SeqCst), "Served from cache");

    let invalidated = registry.invalidate_group("week-42").await.invalidated;
    info!(invalidated, "Invalidated group week-42");
    Ok(())
}

async fn demo_queue(registry: &Registry) {
    let queues = registry.queues();
    let tickets: Vec<_> = (1..=3)
        .map(|n| {
            queues.enqueue("bookings", move || async move {
                sleep(Duration::from_millis(20)).await;
                format!("booking-{}", n)
            })
        })
        .collect();

    for ticket in tickets {
        let booking = ticket.await;
        info!(booking = %booking, "Booking confirmed in order");
    }
}

async fn demo_batch(config: &Config) -> shared::Result<()> {
    let processor = BatchProcessor::new(BatchConfig::from_config(config))?.on_batch_complete(|progress| {
        info!(
            batch = progress.batch + 1,
            batches = progress.batches,
            processed = progress.processed,
            failed = progress.failed,
            "Reminder batch complete"
        )
    });

    let send_reminder = |patient: u32| -> OpFuture<u32, Error> {
        Box::pin(async move {
            sleep(Duration::from_millis(10)).await;
            if patient % 7 == 0 {
                Err(Error::status(422, format!("patient {} has no phone number", patient)))
            } else {
                Ok(patient)
            }
        })
    };

    let results = processor.process((1..=25).collect::<Vec<u32>>(), &send_reminder).await;
    let sent = results.iter().filter(|r| r.is_ok()).count();
    info!(sent, failed = results.len() - sent, "Reminders sent");
    Ok(())
}

async fn demo_poll() -> shared::Result<()> {
    let ticker = Arc::new(AtomicU32::new(0));
    let export_status = move |_job: u32| -> OpFuture<u32, Error> {
        let percent = (ticker.fetch_add(1, Ordering::SeqCst) + 1) * 25;
        Box::pin(async move { Ok(percent.min(100)) })
    };

    let policy = PollPolicy::new(
        PollConfig::new(Duration::from_millis(100))
            .max_attempts(10)
            .max_duration(Duration::from_secs(5)),
    )?
    .stop_when(|percent: &u32| *percent >= 100)
    .on_attempt(|attempt, _| info!(attempt, "Polled export status"));

    let outcome = policy.run(&export_status, 42, CancellationToken::new()).await;
    info!(
        reason = %outcome.reason,
        attempts = outcome.attempts,
        percent = ?outcome.last_value,
        "Export polling stopped"
    );
    Ok(())
}
