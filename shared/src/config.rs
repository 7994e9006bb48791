use std::str::FromStr;
use tracing::warn;

/// Process-wide defaults for the control wrappers, read from `CONDUIT_*` variables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub default_ttl_ms: u64,
    pub max_cache_size: Option<usize>,
    pub retry_max_retries: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_increment_ms: u64,
    pub retryable_status_codes: Vec<u16>,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub batch_concurrency: usize,
    pub data_dir: String,
}

impl Config {
    const DEFAULT_TTL_MS: u64 = 5 * 60 * 1000;
    const DEFAULT_RETRY_MAX_RETRIES: u32 = 3;
    const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 1000;
    const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
    const DEFAULT_RETRY_INCREMENT_MS: u64 = 1000;
    const DEFAULT_RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];
    const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;
    const DEFAULT_BATCH_SIZE: usize = 10;
    const DEFAULT_BATCH_CONCURRENCY: usize = 3;
    const DEFAULT_DATA_DIR: &str = "./data";

    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_cache_size: usize = parse_or(&lookup, "CONDUIT_MAX_CACHE_SIZE", 0);

        Self {
            default_ttl_ms: parse_or(&lookup, "CONDUIT_DEFAULT_TTL_MS", Self::DEFAULT_TTL_MS),
            max_cache_size: (max_cache_size > 0).then_some(max_cache_size),
            retry_max_retries: parse_or(
                &lookup,
                "CONDUIT_RETRY_MAX_RETRIES",
                Self::DEFAULT_RETRY_MAX_RETRIES,
            ),
            retry_initial_delay_ms: parse_or(
                &lookup,
                "CONDUIT_RETRY_INITIAL_DELAY_MS",
                Self::DEFAULT_RETRY_INITIAL_DELAY_MS,
            ),
            retry_max_delay_ms: parse_or(
                &lookup,
                "CONDUIT_RETRY_MAX_DELAY_MS",
                Self::DEFAULT_RETRY_MAX_DELAY_MS,
            ),
            retry_increment_ms: parse_or(
                &lookup,
                "CONDUIT_RETRY_INCREMENT_MS",
                Self::DEFAULT_RETRY_INCREMENT_MS,
            ),
            retryable_status_codes: lookup("CONDUIT_RETRYABLE_STATUS_CODES")
                .and_then(|raw| parse_status_codes(&raw))
                .unwrap_or_else(|| Self::DEFAULT_RETRYABLE_STATUS_CODES.to_vec()),
            poll_interval_ms: parse_or(
                &lookup,
                "CONDUIT_POLL_INTERVAL_MS",
                Self::DEFAULT_POLL_INTERVAL_MS,
            ),
            batch_size: parse_or(&lookup, "CONDUIT_BATCH_SIZE", Self::DEFAULT_BATCH_SIZE),
            batch_concurrency: parse_or(
                &lookup,
                "CONDUIT_BATCH_CONCURRENCY",
                Self::DEFAULT_BATCH_CONCURRENCY,
            ),
            data_dir: lookup("CONDUIT_DATA_DIR")
                .unwrap_or_else(|| Self::DEFAULT_DATA_DIR.to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {}", name, raw, default);
            default
        }),
        None => default,
    }
}

fn parse_status_codes(raw: &str) -> Option<Vec<u16>> {
    let codes: Result<Vec<u16>, _> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u16>())
        .collect();

    match codes {
        Ok(codes) => Some(codes),
        Err(_) => {
            warn!(
                "CONDUIT_RETRYABLE_STATUS_CODES has invalid value '{}', using defaults",
                raw
            );
            None
        }
    }
}
