//! Builder to construct a timer service from configuration.

use std::sync::Arc;

use anyhow::Context;

use crate::config::{StoreBackendConfig, TimerServiceConfig};
use crate::core::{
    AppResult, AuditSink, CalendarEvaluator, InvokerDirectory, TimerEngine, TimerError, TimerStore,
    TransactionManager,
};
use crate::infra::store::{FileTimerStore, InMemoryTimerStore};
use crate::runtime::TimerService;
use crate::util::clock::Clock;

/// Assembles an engine and service from [`TimerServiceConfig`] plus
/// optional collaborators.
pub struct TimerServiceBuilder {
    config: TimerServiceConfig,
    clock: Option<Arc<dyn Clock>>,
    transactions: Option<Arc<dyn TransactionManager>>,
    directory: Option<Arc<InvokerDirectory>>,
    audit: Option<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for TimerServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerServiceBuilder")
            .field("config", &self.config)
            .field("custom_clock", &self.clock.is_some())
            .field("custom_transactions", &self.transactions.is_some())
            .field("audit", &self.audit.is_some())
            .finish_non_exhaustive()
    }
}

impl TimerServiceBuilder {
    /// Start from `config`.
    #[must_use]
    pub const fn new(config: TimerServiceConfig) -> Self {
        Self {
            config,
            clock: None,
            transactions: None,
            directory: None,
            audit: None,
        }
    }

    /// Configuration being built.
    #[must_use]
    pub const fn config(&self) -> &TimerServiceConfig {
        &self.config
    }

    /// Use `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use `transactions` for engine-initiated work.
    #[must_use]
    pub fn with_transaction_manager(mut self, transactions: Arc<dyn TransactionManager>) -> Self {
        self.transactions = Some(transactions);
        self
    }

    /// Share an existing owner directory.
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<InvokerDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Record lifecycle events into `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Box<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Engine over `store`, ignoring the configured store backend.
    pub fn build_engine<S: TimerStore>(self, store: S) -> Result<TimerEngine<S>, TimerError> {
        self.config
            .validate()
            .map_err(|e| TimerError::Backend(format!("config invalid: {e}")))?;

        let mut engine = TimerEngine::new(store, self.directory.unwrap_or_default())
            .with_retry_policy(self.config.retry)
            .with_evaluator(CalendarEvaluator::new(self.config.max_lookahead_years));
        if let Some(clock) = self.clock {
            engine = engine.with_clock(clock);
        }
        if let Some(transactions) = self.transactions {
            engine = engine.with_transaction_manager(transactions);
        }
        if let Some(audit) = self.audit {
            engine = engine.with_audit(audit);
        }
        Ok(engine)
    }

    /// Service over `store`. Dispatch threads start on
    /// [`TimerService::start`].
    pub fn build_with_store<S: TimerStore + 'static>(
        self,
        store: S,
    ) -> Result<TimerService<S>, TimerError> {
        let config = self.config.clone();
        let engine = self.build_engine(store)?;
        Ok(TimerService::new(Arc::new(engine), config))
    }

    /// Service over the store backend named in the configuration.
    pub fn build(self) -> AppResult<TimerService<Box<dyn TimerStore>>> {
        self.config
            .validate()
            .map_err(|e| anyhow::anyhow!("config invalid: {e}"))?;

        let store: Box<dyn TimerStore> = match &self.config.store {
            StoreBackendConfig::InMemory => Box::new(InMemoryTimerStore::new()),
            StoreBackendConfig::File { path, stream } => Box::new(
                FileTimerStore::open(path, stream.clone())
                    .with_context(|| format!("opening timer journal in {}", path.display()))?,
            ),
        };
        Ok(self.build_with_store(store)?)
    }
}
