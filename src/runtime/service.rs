//! Service facade tying the engine, recovery and dispatch threads together.
//!
//! ```rust,ignore
//! let service = TimerServiceBuilder::new(TimerServiceConfig::default()).build()?;
//! service.start()?;
//! service.restore_owner(Arc::new(MyInvoker))?;
//! let record = service.create(NewTimer::calendar("reports", ScheduleSpec::new().hour("6")))?;
//! // ...
//! service.shutdown();
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::TimerServiceConfig;
use crate::core::{
    NewTimer, RecoveryCoordinator, TimeoutInvoker, TimerEngine, TimerError, TimerRecord,
    TimerStore,
};
use crate::runtime::dispatch_pool::DispatchPool;
use crate::util::serde::TimerId;

/// Running timer service.
pub struct TimerService<S: TimerStore + 'static> {
    engine: Arc<TimerEngine<S>>,
    recovery: RecoveryCoordinator<S>,
    config: TimerServiceConfig,
    pool: Mutex<Option<DispatchPool>>,
}

impl<S: TimerStore + 'static> std::fmt::Debug for TimerService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("engine", &self.engine)
            .field("running", &self.is_running())
            .finish()
    }
}

impl<S: TimerStore + 'static> TimerService<S> {
    /// Service over `engine`. Nothing fires until [`start`](Self::start).
    pub fn new(engine: Arc<TimerEngine<S>>, config: TimerServiceConfig) -> Self {
        Self {
            recovery: RecoveryCoordinator::new(Arc::clone(&engine)),
            engine,
            config,
            pool: Mutex::new(None),
        }
    }

    /// Spawn the dispatch threads. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), TimerError> {
        let mut pool = self.pool.lock();
        if pool.is_some() {
            return Ok(());
        }
        *pool = Some(DispatchPool::start(Arc::clone(&self.engine), &self.config)?);
        Ok(())
    }

    /// Whether dispatch threads are running.
    pub fn is_running(&self) -> bool {
        self.pool
            .lock()
            .as_ref()
            .is_some_and(|pool| !pool.is_shut_down())
    }

    /// The engine, for transactional create and cancel.
    pub const fn engine(&self) -> &Arc<TimerEngine<S>> {
        &self.engine
    }

    /// Configuration the service was built with.
    pub const fn config(&self) -> &TimerServiceConfig {
        &self.config
    }

    /// Bind an owner's invoker so its timers can be created and fired.
    pub fn register_owner(&self, invoker: Arc<dyn TimeoutInvoker>) {
        info!(owner_id = invoker.owner_id(), "owner registered");
        self.engine.directory().register(invoker);
    }

    /// Bind the invoker if needed, then re-arm the owner's persisted timers.
    pub fn restore_owner(&self, invoker: Arc<dyn TimeoutInvoker>) -> Result<usize, TimerError> {
        let owner_id = invoker.owner_id().to_string();
        if !self.engine.directory().is_registered(&owner_id) {
            self.register_owner(invoker);
        }
        self.recovery.recover(&owner_id)
    }

    /// Re-arm persisted timers of an owner that is already bound.
    pub fn recover_owner(&self, owner_id: &str) -> Result<usize, TimerError> {
        self.recovery.recover(owner_id)
    }

    /// Suspend all of the owner's timers, then unbind it. The owner is
    /// unbound even when suspension fails.
    pub fn suspend_owner(&self, owner_id: &str) -> Result<usize, TimerError> {
        let suspended = self.engine.suspend_all(owner_id);
        if let Err(err) = &suspended {
            warn!(owner_id, error = %err, "suspending timers failed, unbinding owner anyway");
        }
        self.engine.directory().unregister(owner_id);
        suspended
    }

    /// Unbind an owner without touching its timers. Due timers of an unbound
    /// owner are suspended at dispatch time.
    pub fn deregister_owner(&self, owner_id: &str) -> bool {
        self.engine.directory().unregister(owner_id).is_some()
    }

    /// Create a timer in its own transaction.
    pub fn create(&self, request: NewTimer) -> Result<TimerRecord, TimerError> {
        let tx = self.engine.transactions().begin();
        let record = self.engine.create_timer(&tx, request)?;
        tx.commit()?;
        Ok(record)
    }

    /// Cancel a timer in its own transaction.
    pub fn cancel(&self, id: TimerId) -> Result<bool, TimerError> {
        let tx = self.engine.transactions().begin();
        let cancelled = self.engine.cancel_timer(&tx, id)?;
        tx.commit()?;
        Ok(cancelled)
    }

    /// Stop dispatching and join the threads.
    pub fn shutdown(&self) {
        if let Some(pool) = self.pool.lock().take() {
            pool.shutdown();
        }
    }
}

impl<S: TimerStore + 'static> Drop for TimerService<S> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.get_mut().take() {
            pool.shutdown();
        }
    }
}
