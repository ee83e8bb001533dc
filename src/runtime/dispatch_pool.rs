//! Threads that turn due wakeups into dispatches.
//!
//! One wakeup thread parks on the [`WakeupQueue`](crate::core::WakeupQueue)
//! and forwards due timer ids into a bounded channel. Worker OS threads, each
//! with its own single-threaded tokio runtime, receive ids and drive
//! [`TimerEngine::dispatch`]. A full channel blocks the wakeup thread rather
//! than dropping wakeups.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::TimerServiceConfig;
use crate::core::{DispatchOutcome, TimerEngine, TimerError, TimerStore, WakeupQueue};
use crate::util::clock::Clock;
use crate::util::serde::TimerId;

/// Grace period for each thread to exit on shutdown.
const JOIN_GRACE: Duration = Duration::from_secs(2);

/// Running wakeup and worker threads.
pub struct DispatchPool {
    wakeups: Arc<WakeupQueue>,
    shutdown: AtomicBool,
    threads: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl std::fmt::Debug for DispatchPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPool")
            .field("threads", &self.threads.lock().len())
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

impl DispatchPool {
    /// Spawn the wakeup thread and `config.worker_count` workers for `engine`.
    pub fn start<S>(engine: Arc<TimerEngine<S>>, config: &TimerServiceConfig) -> Result<Self, TimerError>
    where
        S: TimerStore + 'static,
    {
        config
            .validate()
            .map_err(|e| TimerError::Backend(format!("config invalid: {e}")))?;

        let (due_tx, due_rx) = bounded::<TimerId>(config.max_pending_dispatches);
        let wakeups = Arc::clone(engine.wakeups());
        // A previous pool on the same engine left the queue shut down.
        wakeups.reopen();
        let mut threads = Vec::with_capacity(config.worker_count + 1);

        for worker_id in 0..config.worker_count {
            let name = format!("timer-dispatch-{worker_id}");
            let handle = spawn_worker(name.clone(), due_rx.clone(), Arc::clone(&engine))?;
            threads.push((name, handle));
        }

        let name = "timer-wakeup".to_string();
        let handle = spawn_wakeup(
            name.clone(),
            Arc::clone(&wakeups),
            Arc::clone(engine.clock()),
            due_tx,
            config.max_park(),
        )?;
        threads.push((name, handle));

        info!(
            worker_count = config.worker_count,
            max_pending_dispatches = config.max_pending_dispatches,
            "dispatch pool started"
        );

        Ok(Self {
            wakeups,
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(threads),
        })
    }

    /// Stop the wakeup thread, let workers drain, and join everything with a
    /// grace period per thread. Threads that overrun are detached.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down dispatch pool");
        // The wakeup thread exits and drops the sender, which ends the workers.
        self.wakeups.shutdown();

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        let count = threads.len();
        for (name, handle) in threads {
            let (tx, rx) = std::sync::mpsc::channel();
            let joiner = thread::spawn(move || {
                let _ = tx.send(handle.join().is_ok());
            });
            match rx.recv_timeout(JOIN_GRACE) {
                Ok(true) => debug!(thread = %name, "thread joined"),
                Ok(false) => warn!(thread = %name, "thread panicked"),
                Err(_) => {
                    warn!(thread = %name, "thread did not exit within grace period, detaching");
                    continue;
                }
            }
            let _ = joiner.join();
        }
        info!(threads = count, "dispatch pool shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        // Signal only; joining here could hang a dropping test.
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.wakeups.shutdown();
            debug!("dispatch pool dropped without explicit shutdown, threads detached");
        }
    }
}

fn spawn_wakeup(
    name: String,
    wakeups: Arc<WakeupQueue>,
    clock: Arc<dyn Clock>,
    due_tx: Sender<TimerId>,
    max_park: Duration,
) -> Result<JoinHandle<()>, TimerError> {
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            while let Some(batch) = wakeups.wait_due(clock.as_ref(), max_park) {
                for handle in batch {
                    trace!(timer_id = %handle.timer_id, due = %handle.due, "wakeup due");
                    if due_tx.send(handle.timer_id).is_err() {
                        debug!("dispatch channel closed, wakeup thread exiting");
                        return;
                    }
                }
            }
            debug!("wakeup thread exiting");
        })
        .map_err(|e| TimerError::Backend(format!("failed to spawn wakeup thread: {e}")))
}

fn spawn_worker<S>(
    name: String,
    due_rx: Receiver<TimerId>,
    engine: Arc<TimerEngine<S>>,
) -> Result<JoinHandle<()>, TimerError>
where
    S: TimerStore + 'static,
{
    let thread_name = name.clone();
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(thread = %thread_name, error = %e, "failed to create worker runtime");
                    return;
                }
            };

            // recv fails once the wakeup thread has dropped the sender.
            while let Ok(timer_id) = due_rx.recv() {
                let outcome = rt.block_on(engine.dispatch(timer_id));
                match outcome {
                    DispatchOutcome::Failed | DispatchOutcome::OwnerUnbound => {
                        debug!(thread = %thread_name, timer_id = %timer_id, ?outcome, "dispatch did not complete");
                    }
                    _ => trace!(thread = %thread_name, timer_id = %timer_id, ?outcome, "dispatch finished"),
                }
            }
            debug!(thread = %thread_name, "worker exiting");
        })
        .map_err(|e| TimerError::Backend(format!("failed to spawn dispatch worker: {e}")))
}
