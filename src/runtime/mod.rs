//! Dispatch threads and the service facade.

pub mod dispatch_pool;
pub mod service;

pub use dispatch_pool::DispatchPool;
pub use service::TimerService;
