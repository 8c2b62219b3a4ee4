//! Error types for the service-control bridge.

use crate::status::ServiceState;
use thiserror::Error;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while bridging a task to the service manager.
#[derive(Error, Debug)]
pub enum Error {
    /// The platform refused to register the control handler
    #[error("Failed to register service control handler (platform error {code})")]
    RegistrationFailure { code: u32 },

    /// The dispatch loop failed or never invoked the service entry point
    #[error("Service dispatch entry failed: {0}")]
    DispatchEntryFailure(String),

    /// A single status push was rejected by the platform
    #[error("Failed to push {state} status (platform error {code})")]
    StatusPushFailure { state: ServiceState, code: u32 },

    /// Callback registered under an unknown event name
    #[error("Unknown event kind: {0}")]
    UnknownEventKind(String),

    /// Callback shape does not match the event it was registered for
    #[error("Callback does not match event kind: {event}")]
    CallbackKindMismatch { event: String },

    /// No native service manager on this target
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// Failure reported by the platform service API.
///
/// Carries the platform's "last error" code captured right after the failing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformError {
    pub code: u32,
}

impl PlatformError {
    pub fn new(code: u32) -> Self {
        Self { code }
    }
}

impl std::fmt::Display for PlatformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "platform error {}", self.code)
    }
}

impl std::error::Error for PlatformError {}
