//! Event callbacks registered by the application.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Receives diagnostic messages.
pub type DebugCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Invoked for stop, pause and continue.
pub type ControlCallback = Arc<dyn Fn() + Send + Sync>;

/// Future returned by the main workload.
pub type MainFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// The service's main workload.
pub type MainCallback = Arc<dyn Fn() -> MainFuture + Send + Sync>;

/// Events a callback can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Debug,
    Stop,
    Pause,
    Continue,
    Main,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Debug => "debug",
            EventKind::Stop => "stop",
            EventKind::Pause => "pause",
            EventKind::Continue => "continue",
            EventKind::Main => "main",
        }
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "debug" => Ok(EventKind::Debug),
            "stop" => Ok(EventKind::Stop),
            "pause" => Ok(EventKind::Pause),
            "continue" => Ok(EventKind::Continue),
            "main" => Ok(EventKind::Main),
            other => Err(Error::UnknownEventKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A callback of one of the three supported shapes.
#[derive(Clone)]
pub enum EventCallback {
    Debug(DebugCallback),
    Control(ControlCallback),
    Main(MainCallback),
}

impl EventCallback {
    pub fn debug(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        EventCallback::Debug(Arc::new(f))
    }

    pub fn control(f: impl Fn() + Send + Sync + 'static) -> Self {
        EventCallback::Control(Arc::new(f))
    }

    pub fn main<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        EventCallback::Main(main_callback(f))
    }
}

impl std::fmt::Debug for EventCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCallback::Debug(_) => f.write_str("EventCallback::Debug"),
            EventCallback::Control(_) => f.write_str("EventCallback::Control"),
            EventCallback::Main(_) => f.write_str("EventCallback::Main"),
        }
    }
}

/// Box an async closure into a [`MainCallback`].
pub fn main_callback<F, Fut>(f: F) -> MainCallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as MainFuture)
}

/// Registered callbacks, one per event. Last registration wins.
///
/// Read from the platform's threads, written from the application's.
#[derive(Default)]
pub struct CallbackRegistry {
    debug: RwLock<Option<DebugCallback>>,
    controls: RwLock<HashMap<EventKind, ControlCallback>>,
    main: RwLock<Option<MainCallback>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `event`, replacing any previous one.
    pub fn register(&self, event: EventKind, callback: EventCallback) -> Result<()> {
        match (event, callback) {
            (EventKind::Debug, EventCallback::Debug(cb)) => {
                *self.debug.write().unwrap_or_else(PoisonError::into_inner) = Some(cb);
            }
            (EventKind::Stop | EventKind::Pause | EventKind::Continue, EventCallback::Control(cb)) => {
                self.controls
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(event, cb);
            }
            (EventKind::Main, EventCallback::Main(cb)) => {
                *self.main.write().unwrap_or_else(PoisonError::into_inner) = Some(cb);
            }
            (event, _) => {
                return Err(Error::CallbackKindMismatch {
                    event: event.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Control callback for stop, pause or continue.
    pub fn control(&self, event: EventKind) -> Option<ControlCallback> {
        self.controls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event)
            .cloned()
    }

    pub fn main(&self) -> Option<MainCallback> {
        self.main
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn has(&self, event: EventKind) -> bool {
        match event {
            EventKind::Debug => self
                .debug
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some(),
            EventKind::Main => self.main().is_some(),
            control => self.control(control).is_some(),
        }
    }

    /// Emit a diagnostic to tracing and to the `debug` callback, if any.
    pub fn debug(&self, message: &str) {
        debug!("{}", message);
        let callback = self
            .debug
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(cb) = callback {
            cb(message);
        }
    }
}
