//! Service-control protocol bridge.
//!
//! This crate lets a long-running task run under an operating-system service
//! manager. It handles:
//!
//! - Reporting start-pending, running, paused, stop-pending and stopped status
//! - Receiving stop, pause and continue control codes on the manager's thread
//! - Running the manager's blocking dispatch call on a supervised worker
//! - Keeping every callback handed to the manager alive until the service stops
//!
//! # Architecture
//!
//! - **StatusReporter**: owns the status record and pushes it to the platform
//! - **ControlHandler**: maps control codes to transitions and user callbacks
//! - **DispatchSupervisor**: runs the blocking dispatch call on a worker thread
//! - **ServiceCoordinator**: the public lifecycle object
//!
//! The platform itself is injected as a [`ServiceControlApi`].
//!
//! # Example
//!
//! ```no_run
//! use svcbridge_service::{main_callback, BridgeConfig, ServiceCoordinator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = ServiceCoordinator::native(BridgeConfig::named("example"))?;
//!     let stopper = service.clone();
//!     service.on_stop(move || stopper.stop())?;
//!     service
//!         .run(Some(main_callback(|| async {
//!             // long-running work
//!         })))
//!         .await;
//!     Ok(())
//! }
//! ```

pub mod callbacks;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod handles;
pub mod platform;
pub mod status;

// Re-export main types
pub use callbacks::{main_callback, CallbackRegistry, EventCallback, EventKind, MainCallback};
pub use config::{BridgeConfig, StopPolicy};
pub use control::{ControlCode, ControlHandler};
pub use coordinator::{RunOutcome, ServiceCoordinator};
pub use dispatch::{DispatchOutcome, DispatchSupervisor};
pub use error::{Error, PlatformError, Result};
pub use handles::{CallbackArena, RunAttemptId};
pub use platform::{ServiceControlApi, ServiceHandle};
pub use status::{ControlsAccepted, ServiceState, ServiceStatusRecord, StatusReporter};
