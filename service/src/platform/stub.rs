//! In-process stand-in for the service manager.
//!
//! Records every status push, hands out handles, and runs the entry point on
//! a thread of its own the way the real dispatcher does. Control codes are
//! delivered with [`RecordingPlatform::send_control`].

use super::{ControlSink, ServiceControlApi, ServiceHandle, ServiceTable};
use crate::error::PlatformError;
use crate::status::{ServiceState, ServiceStatusRecord, StatusBlock};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Error code reported when dispatching is attempted outside a manager.
pub const ERROR_FAILED_SERVICE_CONTROLLER_CONNECT: u32 = 1063;

#[derive(Debug, Clone)]
struct Behavior {
    invoke_entry: bool,
    fail_registration: Option<u32>,
    fail_dispatch: Option<u32>,
    fail_status: Option<u32>,
    start_args: Vec<String>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            invoke_entry: true,
            fail_registration: None,
            fail_dispatch: None,
            fail_status: None,
            start_args: Vec::new(),
        }
    }
}

#[derive(Default)]
struct StubState {
    pushes: Vec<(ServiceHandle, ServiceStatusRecord)>,
    sink: Option<ControlSink>,
    handle: Option<ServiceHandle>,
    next_handle: u64,
    registrations: usize,
    dispatch_calls: usize,
    entry_calls: usize,
    entry_returned: bool,
    shutdown: bool,
}

impl StubState {
    fn last_state(&self) -> Option<ServiceState> {
        self.pushes.last().map(|(_, r)| r.current_state)
    }
}

/// Builder for [`RecordingPlatform`].
#[derive(Debug, Default)]
pub struct RecordingPlatformBuilder {
    behavior: Behavior,
}

impl RecordingPlatformBuilder {
    /// Never call the entry point; the dispatch loop blocks until [`RecordingPlatform::shutdown`].
    pub fn never_enter(mut self) -> Self {
        self.behavior.invoke_entry = false;
        self
    }

    pub fn fail_registration(mut self, code: u32) -> Self {
        self.behavior.fail_registration = Some(code);
        self
    }

    pub fn fail_dispatch(mut self, code: u32) -> Self {
        self.behavior.fail_dispatch = Some(code);
        self
    }

    pub fn fail_status(mut self, code: u32) -> Self {
        self.behavior.fail_status = Some(code);
        self
    }

    pub fn start_args(mut self, args: Vec<String>) -> Self {
        self.behavior.start_args = args;
        self
    }

    pub fn build(self) -> RecordingPlatform {
        RecordingPlatform {
            behavior: self.behavior,
            state: Mutex::new(StubState {
                next_handle: 1,
                ..StubState::default()
            }),
            changed: Condvar::new(),
        }
    }
}

pub struct RecordingPlatform {
    behavior: Behavior,
    state: Mutex<StubState>,
    changed: Condvar,
}

impl Default for RecordingPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> RecordingPlatformBuilder {
        RecordingPlatformBuilder::default()
    }

    /// Deliver a control code the way the manager does: on the caller's
    /// thread, one at a time. Returns `None` if no handler is registered.
    pub fn send_control(&self, code: u32) -> Option<bool> {
        let sink = self.lock().sink.clone()?;
        Some(sink(code))
    }

    /// Release a dispatch loop that is blocked waiting for the service.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.changed.notify_all();
    }

    /// Every successfully pushed record.
    pub fn records(&self) -> Vec<ServiceStatusRecord> {
        self.lock().pushes.iter().map(|(_, r)| *r).collect()
    }

    /// States of every successfully pushed record.
    pub fn states(&self) -> Vec<ServiceState> {
        self.lock()
            .pushes
            .iter()
            .map(|(_, r)| r.current_state)
            .collect()
    }

    /// Handles used for every successful push.
    pub fn pushed_handles(&self) -> Vec<ServiceHandle> {
        self.lock().pushes.iter().map(|(h, _)| *h).collect()
    }

    pub fn registrations(&self) -> usize {
        self.lock().registrations
    }

    pub fn dispatch_calls(&self) -> usize {
        self.lock().dispatch_calls
    }

    pub fn entry_calls(&self) -> usize {
        self.lock().entry_calls
    }

    /// Block until a record with `state` has been pushed, or `timeout` elapses.
    pub fn wait_for_state(&self, state: ServiceState, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |s| {
                !s.pushes.iter().any(|(_, r)| r.current_state == state)
            })
            .unwrap_or_else(PoisonError::into_inner);
        guard.pushes.iter().any(|(_, r)| r.current_state == state)
    }

    fn lock(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ServiceControlApi for RecordingPlatform {
    fn register_control_handler(
        &self,
        service_name: &str,
        sink: ControlSink,
    ) -> Result<ServiceHandle, PlatformError> {
        if let Some(code) = self.behavior.fail_registration {
            return Err(PlatformError::new(code));
        }

        let mut state = self.lock();
        let handle = ServiceHandle::from_raw(state.next_handle);
        state.next_handle += 1;
        state.registrations += 1;
        state.sink = Some(sink);
        state.handle = Some(handle);
        debug!(service = service_name, handle = handle.as_raw(), "Stub registered handler");
        Ok(handle)
    }

    fn set_status(&self, handle: ServiceHandle, status: &StatusBlock) -> Result<(), PlatformError> {
        if let Some(code) = self.behavior.fail_status {
            return Err(PlatformError::new(code));
        }
        // ERROR_INVALID_DATA
        let record = ServiceStatusRecord::from_bytes(status).ok_or(PlatformError::new(13))?;

        let mut state = self.lock();
        state.pushes.push((handle, record));
        if record.current_state == ServiceState::Stopped {
            state.sink = None;
        }
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn enter_dispatch_loop(&self, table: &ServiceTable) -> Result<(), PlatformError> {
        let first_push = {
            let mut state = self.lock();
            state.dispatch_calls += 1;
            state.entry_returned = false;
            state.handle = None;
            state.pushes.len()
        };

        if let Some(code) = self.behavior.fail_dispatch {
            return Err(PlatformError::new(code));
        }

        if self.behavior.invoke_entry {
            let entry = table.entry.clone();
            let args = self.behavior.start_args.clone();
            self.lock().entry_calls += 1;
            // The entry point runs on a platform-owned thread, not the dispatcher's caller
            let worker = std::thread::Builder::new()
                .name("stub-service-main".to_string())
                .spawn(move || entry(args))
                .map_err(|_| PlatformError::new(ERROR_FAILED_SERVICE_CONTROLLER_CONNECT))?;
            let _ = worker.join();

            let mut state = self.lock();
            state.entry_returned = true;
            drop(state);
            self.changed.notify_all();
        }

        let guard = self.lock();
        let _guard = self
            .changed
            .wait_while(guard, |s| {
                let stopped = s.pushes.len() > first_push
                    && s.last_state() == Some(ServiceState::Stopped);
                let abandoned = s.entry_returned && s.handle.is_none();
                !(stopped || abandoned || s.shutdown)
            })
            .unwrap_or_else(PoisonError::into_inner);
        Ok(())
    }
}
