//! Timer service configuration structures.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::schedule::DEFAULT_MAX_LOOKAHEAD_YEARS;

/// What to do when a timeout callback fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Give up on the occurrence and move to the next natural one.
    #[default]
    NextInterval,
    /// Redeliver the same occurrence after a delay, up to a limit.
    Immediate {
        /// Redeliveries before falling back to the next occurrence.
        max_retries: u32,
        /// Pause before each redelivery, in milliseconds.
        delay_ms: u64,
    },
}

impl RetryPolicy {
    /// Delay before redelivering, zero for `NextInterval`.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        match self {
            Self::NextInterval => Duration::ZERO,
            Self::Immediate { delay_ms, .. } => Duration::from_millis(*delay_ms),
        }
    }
}

/// Store backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreBackendConfig {
    /// In-memory store for development/testing.
    #[default]
    InMemory,
    /// JSONL journal on local disk.
    File {
        /// Directory holding the journal.
        path: PathBuf,
        /// Journal file stem.
        #[serde(default = "default_stream")]
        stream: String,
    },
}

fn default_stream() -> String {
    "timers".into()
}

/// Root timer service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerServiceConfig {
    /// Dispatch worker threads.
    pub worker_count: usize,
    /// Due timers buffered between the wakeup thread and the workers.
    pub max_pending_dispatches: usize,
    /// Longest the wakeup thread parks before re-reading the clock.
    pub max_park_ms: u64,
    /// How far ahead calendar searches look.
    pub max_lookahead_years: u32,
    /// Failure policy for timeout callbacks.
    pub retry: RetryPolicy,
    /// Persistence backend.
    pub store: StoreBackendConfig,
}

impl Default for TimerServiceConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            max_pending_dispatches: 1024,
            max_park_ms: 1_000,
            max_lookahead_years: DEFAULT_MAX_LOOKAHEAD_YEARS,
            retry: RetryPolicy::default(),
            store: StoreBackendConfig::default(),
        }
    }
}

impl TimerServiceConfig {
    /// Configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker count.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Set the dispatch channel capacity.
    #[must_use]
    pub const fn with_max_pending_dispatches(mut self, max: usize) -> Self {
        self.max_pending_dispatches = max;
        self
    }

    /// Set the longest wakeup park.
    #[must_use]
    pub const fn with_max_park_ms(mut self, ms: u64) -> Self {
        self.max_park_ms = ms;
        self
    }

    /// Set the calendar lookahead.
    #[must_use]
    pub const fn with_max_lookahead_years(mut self, years: u32) -> Self {
        self.max_lookahead_years = years;
        self
    }

    /// Set the failure policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the store backend.
    #[must_use]
    pub fn with_store(mut self, store: StoreBackendConfig) -> Self {
        self.store = store;
        self
    }

    /// Longest wakeup park as a duration.
    #[must_use]
    pub const fn max_park(&self) -> Duration {
        Duration::from_millis(self.max_park_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.max_pending_dispatches == 0 {
            return Err("max_pending_dispatches must be greater than 0".into());
        }
        if self.max_park_ms == 0 {
            return Err("max_park_ms must be greater than 0".into());
        }
        if self.max_lookahead_years == 0 {
            return Err("max_lookahead_years must be greater than 0".into());
        }
        if let StoreBackendConfig::File { path, stream } = &self.store {
            if path.as_os_str().is_empty() {
                return Err("file store path must not be empty".into());
            }
            if stream.is_empty() {
                return Err("file store stream must not be empty".into());
            }
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read `TIMER_SERVICE_*` variables (loading `.env` if present) on top
    /// of the defaults, then validate.
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>, String>
        where
            T::Err: std::fmt::Display,
        {
            raw.map(|v| v.trim().parse::<T>().map_err(|e| format!("{key}: {e}")))
                .transpose()
        }

        let mut cfg = Self::default();
        if let Some(v) = parse("TIMER_SERVICE_WORKERS", lookup("TIMER_SERVICE_WORKERS"))? {
            cfg.worker_count = v;
        }
        if let Some(v) = parse("TIMER_SERVICE_MAX_PENDING", lookup("TIMER_SERVICE_MAX_PENDING"))? {
            cfg.max_pending_dispatches = v;
        }
        if let Some(v) = parse("TIMER_SERVICE_MAX_PARK_MS", lookup("TIMER_SERVICE_MAX_PARK_MS"))? {
            cfg.max_park_ms = v;
        }
        if let Some(v) = parse(
            "TIMER_SERVICE_LOOKAHEAD_YEARS",
            lookup("TIMER_SERVICE_LOOKAHEAD_YEARS"),
        )? {
            cfg.max_lookahead_years = v;
        }

        match lookup("TIMER_SERVICE_RETRY").as_deref().map(str::trim) {
            None | Some("next_interval") => {}
            Some("immediate") => {
                let max_retries =
                    parse("TIMER_SERVICE_MAX_RETRIES", lookup("TIMER_SERVICE_MAX_RETRIES"))?
                        .unwrap_or(1);
                let delay_ms = parse(
                    "TIMER_SERVICE_RETRY_DELAY_MS",
                    lookup("TIMER_SERVICE_RETRY_DELAY_MS"),
                )?
                .unwrap_or(5_000);
                cfg.retry = RetryPolicy::Immediate {
                    max_retries,
                    delay_ms,
                };
            }
            Some(other) => return Err(format!("TIMER_SERVICE_RETRY: unknown policy `{other}`")),
        }

        if let Some(path) = lookup("TIMER_SERVICE_STORE_PATH") {
            cfg.store = StoreBackendConfig::File {
                path: PathBuf::from(path),
                stream: lookup("TIMER_SERVICE_STORE_STREAM").unwrap_or_else(default_stream),
            };
        }

        cfg.validate()?;
        Ok(cfg)
    }
}
