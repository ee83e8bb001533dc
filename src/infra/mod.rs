//! Infrastructure adapters for timer persistence.

pub mod store;

pub use store::{FileTimerStore, InMemoryTimerStore};
