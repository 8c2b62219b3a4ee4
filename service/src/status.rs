//! Service status record, its wire layout, and the reporter that pushes it.
//!
//! The record is the only thing the service manager ever sees of our state.
//! Every transition goes through [`StatusReporter`], which serializes the record
//! into the fixed 28-byte block and hands it to the platform.

use crate::callbacks::CallbackRegistry;
use crate::error::{Error, Result};
use crate::platform::{ServiceControlApi, ServiceHandle};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Service kind: the service owns its process.
pub const SERVICE_WIN32_OWN_PROCESS: u32 = 0x10;

/// Length of the serialized status block.
pub const STATUS_BLOCK_LEN: usize = 28;

/// Serialized status record, little-endian.
pub type StatusBlock = [u8; STATUS_BLOCK_LEN];

/// Current state of the service as reported to the manager.
///
/// Discriminants are the protocol values and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ServiceState {
    Stopped = 0x1,
    StartPending = 0x2,
    StopPending = 0x3,
    Running = 0x4,
    Paused = 0x7,
}

impl ServiceState {
    /// Decode a protocol state value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0x1 => Some(ServiceState::Stopped),
            0x2 => Some(ServiceState::StartPending),
            0x3 => Some(ServiceState::StopPending),
            0x4 => Some(ServiceState::Running),
            0x7 => Some(ServiceState::Paused),
            _ => None,
        }
    }

    /// Protocol value of this state.
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Whether this is one of the *-pending states.
    pub fn is_pending(self) -> bool {
        matches!(self, ServiceState::StartPending | ServiceState::StopPending)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::StartPending => write!(f, "start-pending"),
            ServiceState::StopPending => write!(f, "stop-pending"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Paused => write!(f, "paused"),
        }
    }
}

/// Bitset of control codes the service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlsAccepted(u32);

impl ControlsAccepted {
    pub const STOP: Self = Self(0x1);
    pub const PAUSE_CONTINUE: Self = Self(0x2);
    pub const SHUTDOWN: Self = Self(0x4);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ControlsAccepted {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The fixed-shape status record pushed to the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatusRecord {
    pub service_type: u32,
    pub current_state: ServiceState,
    pub controls_accepted: ControlsAccepted,
    pub win32_exit_code: u32,
    pub service_specific_exit_code: u32,
    pub checkpoint: u32,
    pub wait_hint: u32,
}

impl ServiceStatusRecord {
    /// Create a start-pending record for an own-process service.
    pub fn new(controls_accepted: ControlsAccepted, wait_hint: u32) -> Self {
        Self {
            service_type: SERVICE_WIN32_OWN_PROCESS,
            current_state: ServiceState::StartPending,
            controls_accepted,
            win32_exit_code: 0,
            service_specific_exit_code: 0,
            checkpoint: 0,
            wait_hint,
        }
    }

    /// Serialize into the platform's status block.
    ///
    /// Field order: type, state, controls, win32 exit, specific exit, checkpoint, wait hint.
    pub fn to_bytes(&self) -> StatusBlock {
        let fields = [
            self.service_type,
            self.current_state.as_raw(),
            self.controls_accepted.bits(),
            self.win32_exit_code,
            self.service_specific_exit_code,
            self.checkpoint,
            self.wait_hint,
        ];

        let mut block = [0u8; STATUS_BLOCK_LEN];
        for (chunk, field) in block.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        block
    }

    /// Decode a status block. Returns `None` if the state value is unknown.
    pub fn from_bytes(block: &StatusBlock) -> Option<Self> {
        let field = |index: usize| {
            let start = index * 4;
            u32::from_le_bytes([
                block[start],
                block[start + 1],
                block[start + 2],
                block[start + 3],
            ])
        };

        Some(Self {
            service_type: field(0),
            current_state: ServiceState::from_raw(field(1))?,
            controls_accepted: ControlsAccepted::from_bits(field(2)),
            win32_exit_code: field(3),
            service_specific_exit_code: field(4),
            checkpoint: field(5),
            wait_hint: field(6),
        })
    }
}

struct ReporterInner {
    record: ServiceStatusRecord,
    handle: Option<ServiceHandle>,
}

/// Owns the status record and pushes it on every transition.
///
/// Pushes happen under the reporter lock so they reach the platform in
/// program order. Without an attached [`ServiceHandle`] every transition is
/// inert. Push failures are logged and swallowed.
pub struct StatusReporter {
    platform: Arc<dyn ServiceControlApi>,
    registry: Arc<CallbackRegistry>,
    inner: Mutex<ReporterInner>,
}

impl StatusReporter {
    /// Create a reporter with no handle attached.
    pub fn new(
        platform: Arc<dyn ServiceControlApi>,
        registry: Arc<CallbackRegistry>,
        controls_accepted: ControlsAccepted,
        wait_hint: u32,
    ) -> Self {
        Self {
            platform,
            registry,
            inner: Mutex::new(ReporterInner {
                record: ServiceStatusRecord::new(controls_accepted, wait_hint),
                handle: None,
            }),
        }
    }

    /// Attach the handle obtained from handler registration.
    ///
    /// Resets the record to start-pending; nothing is pushed yet.
    pub fn attach(&self, handle: ServiceHandle) {
        let mut inner = self.lock();
        inner.handle = Some(handle);
        inner.record.current_state = ServiceState::StartPending;
        inner.record.checkpoint = 0;
        inner.record.win32_exit_code = 0;
        inner.record.service_specific_exit_code = 0;
    }

    /// Invalidate and return the current handle.
    pub fn detach(&self) -> Option<ServiceHandle> {
        self.lock().handle.take()
    }

    pub fn is_attached(&self) -> bool {
        self.lock().handle.is_some()
    }

    /// Last state recorded (pushed or not).
    pub fn state(&self) -> ServiceState {
        self.lock().record.current_state
    }

    /// Snapshot of the record.
    pub fn record(&self) -> ServiceStatusRecord {
        self.lock().record
    }

    pub fn start_pending(&self) -> bool {
        self.transition(ServiceState::StartPending, |from| {
            from == ServiceState::StartPending
        })
    }

    pub fn running(&self) -> bool {
        self.transition(ServiceState::Running, |from| {
            matches!(from, ServiceState::StartPending | ServiceState::Running)
        })
    }

    /// `Running -> Paused`. Ignored in any other state.
    pub fn paused(&self) -> bool {
        self.transition(ServiceState::Paused, |from| {
            matches!(from, ServiceState::Running | ServiceState::Paused)
        })
    }

    /// `Paused -> Running`. Ignored once stopping.
    pub fn resumed(&self) -> bool {
        self.transition(ServiceState::Running, |from| {
            matches!(from, ServiceState::Paused | ServiceState::Running)
        })
    }

    pub fn stop_pending(&self) -> bool {
        self.transition(ServiceState::StopPending, |from| from != ServiceState::Stopped)
    }

    pub fn stopped(&self) -> bool {
        self.transition(ServiceState::Stopped, |from| from != ServiceState::Stopped)
    }

    /// Re-push the current record without changing state.
    pub fn interrogate(&self) -> bool {
        let result = {
            let inner = self.lock();
            match inner.handle {
                Some(handle) => self.push(handle, &inner.record),
                None => return false,
            }
        };
        self.report(result);
        true
    }

    fn transition(&self, target: ServiceState, allowed: impl Fn(ServiceState) -> bool) -> bool {
        let result = {
            let mut inner = self.lock();
            let Some(handle) = inner.handle else {
                return false;
            };

            let from = inner.record.current_state;
            if !allowed(from) {
                debug!(from = %from, to = %target, "Ignoring status transition");
                return false;
            }

            inner.record.current_state = target;
            inner.record.checkpoint = 0;
            self.push(handle, &inner.record)
        };
        self.report(result);
        true
    }

    /// Push under the caller's lock so pushes reach the platform in order.
    fn push(&self, handle: ServiceHandle, record: &ServiceStatusRecord) -> Result<()> {
        let block = record.to_bytes();
        self.platform
            .set_status(handle, &block)
            .map_err(|e| Error::StatusPushFailure {
                state: record.current_state,
                code: e.code,
            })?;
        debug!(state = %record.current_state, "Pushed service status");
        Ok(())
    }

    /// Log a failed push. Runs after the lock is released since the debug
    /// callback may call back into the reporter.
    fn report(&self, result: Result<()>) {
        if let Err(err) = result {
            warn!(error = %err, "Status push failed");
            self.registry.debug(&err.to_string());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReporterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
