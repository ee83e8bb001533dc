//! # Prometheus Timer Service
//!
//! A durable timer service for managed components. An owner registers
//! calendar or interval timers; each due occurrence is delivered exactly once
//! to the owner's invoker, timers survive restarts, and creation and
//! cancellation take part in the caller's transaction.
//!
//! ## Key Features
//!
//! - **Calendar schedules**: seven-field expressions (second through year)
//!   with lists, ranges that wrap, increments, relative days such as `Last`,
//!   `-3` or `2nd Tue`, and inclusive start/end bounds
//! - **Transactional lifecycle**: a timer created in a rolled-back
//!   transaction never fires; cancellation is atomic with persisted state
//! - **Single in-flight dispatch**: a timer never runs twice concurrently
//! - **Recovery**: persisted timers are re-armed after restart; overdue ones
//!   fire once instead of replaying a backlog
//! - **Pluggable persistence**: in-memory store for tests and a JSONL
//!   journal for single-node durability
//!
//! ## Calendar evaluation
//!
//! ```rust,ignore
//! use prometheus_timer_service::core::ScheduleExpression;
//!
//! let payroll = ScheduleExpression::builder()
//!     .hour("9")
//!     .day_of_month("Last")
//!     .build()?;
//! let next = payroll.next_timeout(chrono::Utc::now());
//! ```
//!
//! ## Running the service
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_timer_service::builders::TimerServiceBuilder;
//! use prometheus_timer_service::config::TimerServiceConfig;
//! use prometheus_timer_service::core::{NewTimer, ScheduleSpec};
//!
//! let service = TimerServiceBuilder::new(TimerServiceConfig::from_env()?).build()?;
//! service.start()?;
//! service.restore_owner(Arc::new(MyInvoker))?;
//! service.create(NewTimer::calendar("reports", ScheduleSpec::new().hour("6")))?;
//! ```
//!
//! For complete examples, see:
//! - `tests/timer_engine_test.rs` - lifecycle and dispatch
//! - `tests/service_test.rs` - threads, restart and recovery

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core timer abstractions: schedules, records, transactions and the engine.
pub mod core;
/// Configuration models for dispatch, retries and storage.
pub mod config;
/// Builders to construct timer services from configuration.
pub mod builders;
/// Infrastructure adapters for timer persistence.
pub mod infra;
/// Dispatch threads and the service facade.
pub mod runtime;
/// Shared utilities.
pub mod util;
