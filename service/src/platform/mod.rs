//! The platform service API consumed by the bridge.
//!
//! Three capabilities are needed: registering the control handler, pushing a
//! status block, and entering the blocking dispatch loop. The capability is
//! injected into [`crate::ServiceCoordinator`] so tests can run against
//! [`stub::RecordingPlatform`].

pub mod stub;

#[cfg(windows)]
pub mod windows;

use crate::error::{PlatformError, Result};
use crate::status::StatusBlock;
use std::sync::Arc;

/// Control-code sink invoked by the platform. Returns `false` for codes it does not handle.
pub type ControlSink = Arc<dyn Fn(u32) -> bool + Send + Sync>;

/// Service entry point invoked by the platform with the start arguments.
pub type ServiceEntry = Arc<dyn Fn(Vec<String>) + Send + Sync>;

/// Opaque token returned by control handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle(u64);

impl ServiceHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// Descriptor handed to the dispatch loop: the service name and its entry point.
#[derive(Clone)]
pub struct ServiceTable {
    pub service_name: Arc<str>,
    pub entry: ServiceEntry,
}

impl std::fmt::Debug for ServiceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceTable")
            .field("service_name", &self.service_name)
            .finish_non_exhaustive()
    }
}

/// Platform service API.
///
/// Implementations may invoke the entry point and the control sink on threads
/// of their own at any time until the service reports `Stopped`.
pub trait ServiceControlApi: Send + Sync {
    /// Register `sink` as the control handler for `service_name`.
    fn register_control_handler(
        &self,
        service_name: &str,
        sink: ControlSink,
    ) -> std::result::Result<ServiceHandle, PlatformError>;

    /// Push a serialized status record.
    fn set_status(
        &self,
        handle: ServiceHandle,
        status: &StatusBlock,
    ) -> std::result::Result<(), PlatformError>;

    /// Enter the control dispatch loop. Blocks until the service has stopped.
    fn enter_dispatch_loop(&self, table: &ServiceTable) -> std::result::Result<(), PlatformError>;
}

/// The service manager of the current target.
#[cfg(windows)]
pub fn native() -> Result<Arc<dyn ServiceControlApi>> {
    Ok(Arc::new(windows::WindowsServiceApi::new()))
}

/// The service manager of the current target.
#[cfg(not(windows))]
pub fn native() -> Result<Arc<dyn ServiceControlApi>> {
    Err(crate::error::Error::UnsupportedPlatform(
        std::env::consts::OS.to_string(),
    ))
}
