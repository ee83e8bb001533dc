//! Core timer abstractions: schedules, records, transactions and the engine.

pub mod audit;
pub mod engine;
pub mod error;
pub mod invoker;
pub mod recovery;
pub(crate) mod registry;
pub mod schedule;
pub mod store;
pub mod timer;
pub mod transaction;
pub mod wakeup;

pub use audit::{
    build_audit_event, AuditAction, AuditEvent, AuditSink, InMemoryAuditSink, SharedAuditSink,
};
pub use engine::{DispatchOutcome, TimerEngine};
pub use error::{AppResult, TimerError};
pub use invoker::{InvokerDirectory, TimeoutInvoker};
pub use recovery::RecoveryCoordinator;
pub use schedule::{CalendarEvaluator, ScheduleExpression, ScheduleSpec};
pub use store::TimerStore;
pub use timer::{
    NewTimer, NewTimerSpec, TimeoutEvent, TimeoutMethod, TimerHandle, TimerKind, TimerRecord,
    TimerStatus,
};
pub use transaction::{
    LocalTransactionManager, Synchronization, Transaction, TransactionManager, TxOutcome,
};
pub use wakeup::{WakeupHandle, WakeupQueue};
