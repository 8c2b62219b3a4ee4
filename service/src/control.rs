//! Control codes and the handler the manager invokes with them.
//!
//! The handler runs on a thread owned by the platform. It applies the status
//! transition inline and hands user callbacks to the runtime's blocking pool,
//! so it never waits on application code.

use crate::callbacks::{CallbackRegistry, ControlCallback, EventKind};
use crate::config::StopPolicy;
use crate::status::StatusReporter;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Control codes sent by the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlCode {
    Stop = 0x1,
    Pause = 0x2,
    Continue = 0x3,
    Interrogate = 0x4,
}

impl ControlCode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0x1 => Some(ControlCode::Stop),
            0x2 => Some(ControlCode::Pause),
            0x3 => Some(ControlCode::Continue),
            0x4 => Some(ControlCode::Interrogate),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

/// The full stop sequence: terminal status, handle release, worker wind-down.
pub trait StopSequence: Send + Sync {
    fn stop(&self);
}

pub struct ControlHandler {
    reporter: Arc<StatusReporter>,
    registry: Arc<CallbackRegistry>,
    policy: StopPolicy,
    stopper: Weak<dyn StopSequence>,
    runtime: Handle,
}

impl ControlHandler {
    pub fn new(
        reporter: Arc<StatusReporter>,
        registry: Arc<CallbackRegistry>,
        policy: StopPolicy,
        stopper: Weak<dyn StopSequence>,
        runtime: Handle,
    ) -> Self {
        Self {
            reporter,
            registry,
            policy,
            stopper,
            runtime,
        }
    }

    /// Handle one control code. Returns `false` for codes that are not handled.
    pub fn handle(&self, raw: u32) -> bool {
        self.note(format!("control code received: {}", raw));

        let Some(code) = ControlCode::from_raw(raw) else {
            debug!(code = raw, "Ignoring unknown control code");
            return false;
        };

        match code {
            ControlCode::Stop => {
                info!("Stop requested by service manager");
                self.reporter.stop_pending();
                match (self.registry.control(EventKind::Stop), self.policy) {
                    (Some(callback), StopPolicy::Delegate) => self.fire(EventKind::Stop, callback),
                    (Some(callback), StopPolicy::AutoStop) => {
                        self.fire(EventKind::Stop, callback);
                        self.stop_now();
                    }
                    // Nobody else will finish the stop; the manager must not be left waiting
                    (None, _) => self.stop_now(),
                }
            }
            ControlCode::Pause => {
                self.reporter.paused();
                if let Some(callback) = self.registry.control(EventKind::Pause) {
                    self.fire(EventKind::Pause, callback);
                }
            }
            ControlCode::Continue => {
                self.reporter.resumed();
                if let Some(callback) = self.registry.control(EventKind::Continue) {
                    self.fire(EventKind::Continue, callback);
                }
            }
            ControlCode::Interrogate => {
                self.reporter.interrogate();
            }
        }
        true
    }

    fn fire(&self, event: EventKind, callback: ControlCallback) {
        debug!(event = %event, "Dispatching control callback");
        drop(self.runtime.spawn_blocking(move || callback()));
    }

    /// Send `message` to the debug callback without waiting for it.
    fn note(&self, message: String) {
        let registry = self.registry.clone();
        drop(self.runtime.spawn_blocking(move || registry.debug(&message)));
    }

    fn stop_now(&self) {
        match self.stopper.upgrade() {
            Some(stopper) => stopper.stop(),
            None => {
                // Coordinator is gone; still report the terminal state
                self.reporter.stopped();
                self.reporter.detach();
            }
        }
    }
}
