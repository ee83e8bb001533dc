//! Timer store backends.

pub mod entity;
pub mod file;
pub mod memory;

pub use entity::TimerEntity;
pub use file::FileTimerStore;
pub use memory::{InMemoryTimerStore, Journal, StoreOp};
