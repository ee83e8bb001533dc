//! Configuration models for the dispatch pool, retries and storage.

pub mod service;

pub use service::{RetryPolicy, StoreBackendConfig, TimerServiceConfig};
