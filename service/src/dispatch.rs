//! Dispatch supervision.
//!
//! The platform's "enter dispatch loop" call blocks until the service has
//! stopped, so it runs on a dedicated worker thread. When it returns the worker
//! sends one [`DispatchOutcome`] back to the coordinator.

use crate::error::{Error, PlatformError, Result};
use crate::handles::{CallbackArena, NativeCallback, RunAttemptId};
use crate::platform::{ServiceControlApi, ServiceEntry, ServiceTable};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// How the blocking dispatch call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The dispatcher returned after the service stopped
    Returned,
    /// The dispatcher refused to start, e.g. the process was not launched by the manager
    Failed(PlatformError),
}

/// Runs the blocking dispatch call for one run attempt.
pub struct DispatchSupervisor {
    platform: Arc<dyn ServiceControlApi>,
    winding_down: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchSupervisor {
    pub fn new(platform: Arc<dyn ServiceControlApi>) -> Self {
        Self {
            platform,
            winding_down: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Build the service-entry descriptor for `service_name`.
    pub fn table(service_name: &str, entry: ServiceEntry) -> ServiceTable {
        ServiceTable {
            service_name: Arc::from(service_name),
            entry,
        }
    }

    /// Start the dispatch worker.
    ///
    /// The descriptor's name buffer and entry point are registered with the
    /// arena first, so they outlive the platform's use of them.
    pub fn start(
        &self,
        attempt: RunAttemptId,
        arena: &CallbackArena,
        table: ServiceTable,
    ) -> Result<oneshot::Receiver<DispatchOutcome>> {
        let kept = arena.keep_alive(attempt, Arc::new(table.service_name.clone()))
            && arena.track_callback(attempt, NativeCallback::ServiceEntry(table.entry.clone()));
        if !kept {
            return Err(Error::DispatchEntryFailure(format!(
                "run attempt {} already released",
                attempt
            )));
        }

        let (tx, rx) = oneshot::channel();
        let platform = self.platform.clone();
        let winding_down = self.winding_down.clone();

        let worker = std::thread::Builder::new()
            .name("svc-dispatch".to_string())
            .spawn(move || {
                info!(service = %table.service_name, "Entering service dispatch loop");
                let outcome = match platform.enter_dispatch_loop(&table) {
                    Ok(()) => DispatchOutcome::Returned,
                    Err(e) => DispatchOutcome::Failed(e),
                };

                match outcome {
                    DispatchOutcome::Failed(e) if !winding_down.load(Ordering::SeqCst) => {
                        error!(error = %e, "Failed to start service control dispatcher");
                    }
                    _ => debug!(outcome = ?outcome, "Dispatch loop returned"),
                }
                // The coordinator may have stopped listening
                let _ = tx.send(outcome);
            })
            .map_err(|e| Error::DispatchEntryFailure(format!("failed to spawn dispatch worker: {}", e)))?;

        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);
        Ok(rx)
    }

    /// Tell the worker the attempt is over.
    ///
    /// The blocking call cannot be interrupted; the worker is detached and
    /// exits when the platform returns.
    pub fn wind_down(&self) {
        if self.winding_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.is_finished() {
                let _ = worker.join();
            }
        }
    }

    pub fn is_winding_down(&self) -> bool {
        self.winding_down.load(Ordering::SeqCst)
    }
}
