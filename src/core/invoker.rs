//! Timeout delivery port and the owner directory.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::core::{AppResult, TimeoutEvent, Transaction};
use crate::util::serde::OwnerId;

/// Delivers timeouts to the component that owns them.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use prometheus_timer_service::core::{AppResult, TimeoutEvent, TimeoutInvoker, Transaction};
///
/// struct Reminder;
///
/// #[async_trait]
/// impl TimeoutInvoker for Reminder {
///     fn owner_id(&self) -> &str {
///         "reminders"
///     }
///
///     async fn invoke_timeout(&self, _tx: &Transaction, event: &TimeoutEvent) -> AppResult<()> {
///         println!("timer {} fired for {}", event.timer_id, event.scheduled_at);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait TimeoutInvoker: Send + Sync + 'static {
    /// Owner this invoker serves.
    fn owner_id(&self) -> &str;

    /// Run the timeout callback inside `tx`.
    ///
    /// Returning an error, or marking `tx` rollback-only, fails the dispatch.
    async fn invoke_timeout(&self, tx: &Transaction, event: &TimeoutEvent) -> AppResult<()>;
}

/// Registered invokers keyed by owner.
#[derive(Default)]
pub struct InvokerDirectory {
    invokers: RwLock<HashMap<OwnerId, Arc<dyn TimeoutInvoker>>>,
}

impl std::fmt::Debug for InvokerDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokerDirectory")
            .field("owners", &self.owners())
            .finish()
    }
}

impl InvokerDirectory {
    /// Empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an invoker under its owner id, replacing any previous one.
    pub fn register(&self, invoker: Arc<dyn TimeoutInvoker>) {
        let owner = invoker.owner_id().to_string();
        debug!(owner_id = %owner, "invoker registered");
        self.invokers.write().insert(owner, invoker);
    }

    /// Remove the binding for `owner_id`.
    pub fn unregister(&self, owner_id: &str) -> Option<Arc<dyn TimeoutInvoker>> {
        let removed = self.invokers.write().remove(owner_id);
        if removed.is_some() {
            debug!(owner_id, "invoker unregistered");
        }
        removed
    }

    /// Invoker bound to `owner_id`.
    pub fn get(&self, owner_id: &str) -> Option<Arc<dyn TimeoutInvoker>> {
        self.invokers.read().get(owner_id).cloned()
    }

    /// Whether `owner_id` is bound.
    pub fn is_registered(&self, owner_id: &str) -> bool {
        self.invokers.read().contains_key(owner_id)
    }

    /// Bound owner ids, sorted.
    pub fn owners(&self) -> Vec<OwnerId> {
        let mut owners: Vec<_> = self.invokers.read().keys().cloned().collect();
        owners.sort();
        owners
    }
}
