//! Arena of native callbacks and keep-alive buffers, keyed by run attempt.
//!
//! Anything handed to the platform (the service entry point, the control
//! sink, the buffers backing the dispatch table) may be used by the platform
//! from its own threads until the service has stopped. These resources are
//! owned here and released together, exactly once, when the attempt is cleaned up.

use crate::platform::{ControlSink, ServiceEntry};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;
use uuid::Uuid;

/// Identifier of one dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunAttemptId(Uuid);

impl RunAttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunAttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunAttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A callable handed to the platform.
#[derive(Clone)]
pub enum NativeCallback {
    ServiceEntry(ServiceEntry),
    ControlSink(ControlSink),
}

impl std::fmt::Debug for NativeCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NativeCallback::ServiceEntry(_) => f.write_str("NativeCallback::ServiceEntry"),
            NativeCallback::ControlSink(_) => f.write_str("NativeCallback::ControlSink"),
        }
    }
}

#[derive(Default)]
struct AttemptResources {
    callbacks: Vec<NativeCallback>,
    keep_alive: Vec<Arc<dyn Any + Send + Sync>>,
}

/// What a release dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub callbacks: usize,
    pub buffers: usize,
}

#[derive(Default)]
pub struct CallbackArena {
    attempts: Mutex<HashMap<RunAttemptId, AttemptResources>>,
}

impl CallbackArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the resource set for a new attempt.
    pub fn open(&self, attempt: RunAttemptId) {
        self.lock().entry(attempt).or_default();
    }

    /// Track a callback. Returns `false` if the attempt was already released.
    pub fn track_callback(&self, attempt: RunAttemptId, callback: NativeCallback) -> bool {
        match self.lock().get_mut(&attempt) {
            Some(resources) => {
                resources.callbacks.push(callback);
                true
            }
            None => false,
        }
    }

    /// Keep a buffer alive until the attempt is released.
    pub fn keep_alive(&self, attempt: RunAttemptId, buffer: Arc<dyn Any + Send + Sync>) -> bool {
        match self.lock().get_mut(&attempt) {
            Some(resources) => {
                resources.keep_alive.push(buffer);
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self, attempt: RunAttemptId) -> bool {
        self.lock().contains_key(&attempt)
    }

    pub fn live_callbacks(&self, attempt: RunAttemptId) -> usize {
        self.lock()
            .get(&attempt)
            .map(|r| r.callbacks.len())
            .unwrap_or(0)
    }

    /// Release everything held for `attempt`.
    ///
    /// Returns `None` when there was nothing to release, so a second call is a no-op.
    pub fn release(&self, attempt: RunAttemptId) -> Option<ReleaseSummary> {
        let resources = self.lock().remove(&attempt)?;
        let summary = ReleaseSummary {
            callbacks: resources.callbacks.len(),
            buffers: resources.keep_alive.len(),
        };
        // Dropped outside the arena lock; a callback may be running on another thread
        drop(resources);

        debug!(
            attempt = %attempt,
            callbacks = summary.callbacks,
            buffers = summary.buffers,
            "Released native callbacks"
        );
        Some(summary)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RunAttemptId, AttemptResources>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
