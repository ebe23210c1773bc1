//! Engine configuration.
//!
//! Every struct has sensible defaults via `Default` and derives
//! `Deserialize` with `#[serde(default)]`, so a host can load a partial
//! configuration from whatever format it uses. Durations are written in
//! milliseconds (`*_ms` fields on the wire).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Session protocol tuning.
///
/// # Examples
///
/// ```
/// use flowfold::SessionConfig;
///
/// let config = SessionConfig {
///     reorder_window: 8,
///     ..SessionConfig::default()
/// };
/// assert_eq!(config.reorder_window, 8);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How far ahead of the next expected sequence number an inbound message
    /// may be and still be buffered. A message at `next + reorder_window` or
    /// beyond is a protocol violation that errors the session.
    ///
    /// Default: 32.
    pub reorder_window: u64,

    /// Unacknowledged outbound messages older than this are resent when the
    /// flow is woken up.
    ///
    /// Default: 30 seconds.
    #[serde(with = "millis", rename = "resend_after_ms")]
    pub resend_after: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reorder_window: 32,
            resend_after: Duration::from_secs(30),
        }
    }
}

/// Bounded exponential backoff for transient store and bus failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry; doubled after each failed attempt.
    ///
    /// Default: 100 milliseconds.
    #[serde(with = "millis", rename = "base_delay_ms")]
    pub base_delay: Duration,

    /// Upper bound on the delay between attempts.
    ///
    /// Default: 5 seconds.
    #[serde(with = "millis", rename = "max_delay_ms")]
    pub max_delay: Duration,

    /// Total attempts (including the first) before giving up.
    ///
    /// Default: 5.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

/// Fiber cache sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of resident fibers. The least recently used entry is
    /// evicted when a put would exceed it.
    ///
    /// Default: 1024.
    pub capacity: usize,

    /// Entries untouched for this long are dropped on the next sweep.
    ///
    /// Default: 5 minutes.
    #[serde(with = "millis", rename = "idle_expiry_ms")]
    pub idle_expiry: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            idle_expiry: Duration::from_secs(300),
        }
    }
}

/// External event request handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalEventConfig {
    /// Validity window applied when a request does not specify its own.
    ///
    /// Default: 30 seconds.
    #[serde(with = "millis", rename = "validity_window_ms")]
    pub validity_window: Duration,

    /// How many times a request answered with a transient error is
    /// resubmitted before the failure is handed to the flow.
    ///
    /// Default: 3.
    pub max_transient_retries: u32,
}

impl Default for ExternalEventConfig {
    fn default() -> Self {
        Self {
            validity_window: Duration::from_secs(30),
            max_transient_retries: 3,
        }
    }
}

/// Top-level engine configuration.
///
/// # Examples
///
/// ```
/// use flowfold::EngineConfig;
///
/// let config: EngineConfig =
///     serde_json::from_str(r#"{ "max_concurrency": 8, "session": { "reorder_window": 4 } }"#)
///         .unwrap();
/// assert_eq!(config.max_concurrency, 8);
/// assert_eq!(config.session.reorder_window, 4);
/// assert_eq!(config.retry.max_attempts, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a per-flow worker waits for its next event before exiting.
    ///
    /// Default: 5 minutes.
    #[serde(with = "millis", rename = "worker_idle_timeout_ms")]
    pub worker_idle_timeout: Duration,

    /// Maximum number of flows processed in parallel.
    ///
    /// Default: 64.
    pub max_concurrency: usize,

    /// Maximum number of immediate resumes (after `Send`/`CloseSession`)
    /// within one unit of work before a checkpoint is forced.
    ///
    /// Default: 64.
    pub max_inline_resumes: u32,

    /// Resolution of the timer scheduler.
    ///
    /// Default: 100 milliseconds.
    #[serde(with = "millis", rename = "timer_tick_ms")]
    pub timer_tick: Duration,

    /// How many times an event is reprocessed after an optimistic version
    /// conflict on save.
    ///
    /// Default: 3.
    pub max_conflict_retries: u32,

    /// Session protocol tuning.
    pub session: SessionConfig,
    /// Transient failure backoff.
    pub retry: RetryConfig,
    /// Fiber cache sizing.
    pub cache: CacheConfig,
    /// External event handling.
    pub external: ExternalEventConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_idle_timeout: Duration::from_secs(300),
            max_concurrency: 64,
            max_inline_resumes: 64,
            timer_tick: Duration::from_millis(100),
            max_conflict_retries: 3,
            session: SessionConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            external: ExternalEventConfig::default(),
        }
    }
}

/// Serialize a `Duration` as whole milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
