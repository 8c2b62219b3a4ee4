//! The public lifecycle object tying the bridge together.
//!
//! `run()` starts the dispatch worker, waits (polling) for the manager to call
//! the entry point, then waits for the dispatcher to return. The entry point
//! registers the control handler, reports start-pending and running, and
//! spawns the main workload. Every path out of a run attempt, failure or not,
//! goes through the same stop sequence.

use crate::callbacks::{CallbackRegistry, EventCallback, EventKind, MainCallback};
use crate::config::BridgeConfig;
use crate::control::{ControlHandler, StopSequence};
use crate::dispatch::{DispatchOutcome, DispatchSupervisor};
use crate::error::{Error, Result};
use crate::handles::{CallbackArena, NativeCallback, RunAttemptId};
use crate::platform::{ControlSink, ServiceControlApi, ServiceEntry};
use crate::status::{ServiceState, StatusReporter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// How a call to [`ServiceCoordinator::run`] ended.
///
/// Every non-`Completed` outcome has already been through `stop()` and reported
/// to the `debug` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The service ran and the dispatcher returned (or was detached) after stopping
    Completed,
    /// The manager never invoked the entry point in time
    StartupTimedOut,
    /// The dispatcher could not be started
    DispatchFailed { code: Option<u32> },
    /// The manager refused the control handler registration
    RegistrationFailed { code: u32 },
}

/// State of one dispatch cycle.
struct RunAttempt {
    id: RunAttemptId,
    entry_confirmed: AtomicBool,
    stopped: AtomicBool,
    // Orders handle attachment against the stop decision
    lifecycle: Mutex<()>,
    registration_error: Mutex<Option<u32>>,
    start_args: Mutex<Vec<String>>,
    main: Option<MainCallback>,
    supervisor: DispatchSupervisor,
    runtime: Handle,
    stopped_notify: Notify,
}

struct Inner {
    config: BridgeConfig,
    platform: Arc<dyn ServiceControlApi>,
    registry: Arc<CallbackRegistry>,
    reporter: Arc<StatusReporter>,
    arena: CallbackArena,
    attempt: Mutex<Option<Arc<RunAttempt>>>,
}

/// Registers a long-running task with the service manager and drives its status.
#[derive(Clone)]
pub struct ServiceCoordinator {
    inner: Arc<Inner>,
}

impl ServiceCoordinator {
    /// Create a coordinator using `platform` as the service manager.
    pub fn new(config: BridgeConfig, platform: Arc<dyn ServiceControlApi>) -> Self {
        let registry = Arc::new(CallbackRegistry::new());
        let reporter = Arc::new(StatusReporter::new(
            platform.clone(),
            registry.clone(),
            config.controls_accepted(),
            config.wait_hint_ms,
        ));

        Self {
            inner: Arc::new(Inner {
                config,
                platform,
                registry,
                reporter,
                arena: CallbackArena::new(),
                attempt: Mutex::new(None),
            }),
        }
    }

    /// Create a coordinator for the native service manager of this target.
    pub fn native(config: BridgeConfig) -> Result<Self> {
        Ok(Self::new(config, crate::platform::native()?))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Register `callback` for the event named `event`.
    ///
    /// Names are `debug`, `stop`, `pause`, `continue` and `main`. Registering
    /// the same name again replaces the previous callback.
    pub fn on(&self, event: &str, callback: EventCallback) -> Result<()> {
        let kind = event.parse::<EventKind>().map_err(|e| {
            self.inner.registry.debug(&e.to_string());
            e
        })?;
        self.inner.registry.debug(&format!("on(): {}", kind));
        self.inner.registry.register(kind, callback)
    }

    pub fn on_debug(&self, f: impl Fn(&str) + Send + Sync + 'static) -> Result<()> {
        self.on("debug", EventCallback::debug(f))
    }

    pub fn on_stop(&self, f: impl Fn() + Send + Sync + 'static) -> Result<()> {
        self.on("stop", EventCallback::control(f))
    }

    pub fn on_pause(&self, f: impl Fn() + Send + Sync + 'static) -> Result<()> {
        self.on("pause", EventCallback::control(f))
    }

    pub fn on_continue(&self, f: impl Fn() + Send + Sync + 'static) -> Result<()> {
        self.on("continue", EventCallback::control(f))
    }

    /// Last state recorded by the status reporter.
    pub fn state(&self) -> ServiceState {
        self.inner.reporter.state()
    }

    /// Arguments the manager passed to the entry point of the current attempt.
    pub fn start_args(&self) -> Vec<String> {
        self.inner
            .current_attempt()
            .map(|a| a.start_args.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default()
    }

    /// Run the service.
    ///
    /// `main` takes precedence over a callback registered with `on("main", ..)`.
    /// Returns once the attempt is over: after the dispatcher returned, after a
    /// failed start, or after the startup timeout elapsed.
    pub async fn run(&self, main: Option<MainCallback>) -> RunOutcome {
        let inner = &self.inner;
        inner.registry.debug("run()");

        // A previous attempt still in flight is finished first
        if let Some(previous) = inner.current_attempt() {
            inner.stop_attempt(&previous);
        }

        let attempt = Arc::new(RunAttempt {
            id: RunAttemptId::new(),
            entry_confirmed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            registration_error: Mutex::new(None),
            start_args: Mutex::new(Vec::new()),
            main,
            supervisor: DispatchSupervisor::new(inner.platform.clone()),
            runtime: Handle::current(),
            stopped_notify: Notify::new(),
        });
        inner.arena.open(attempt.id);
        *inner.attempt.lock().unwrap_or_else(PoisonError::into_inner) = Some(attempt.clone());

        let entry: ServiceEntry = {
            let weak = Arc::downgrade(&self.inner);
            let attempt = attempt.clone();
            Arc::new(move |args: Vec<String>| {
                if let Some(inner) = weak.upgrade() {
                    inner.service_main(&weak, &attempt, args);
                }
            })
        };
        let table = DispatchSupervisor::table(&inner.config.service_name, entry);

        let mut completion = match attempt.supervisor.start(attempt.id, &inner.arena, table) {
            Ok(rx) => rx,
            Err(e) => {
                error!(error = %e, "Failed to start dispatch worker");
                inner.registry.debug(&e.to_string());
                inner.stop_attempt(&attempt);
                return RunOutcome::DispatchFailed { code: None };
            }
        };

        let early = match self.wait_for_entry(&attempt, &mut completion).await {
            Ok(early) => early,
            Err(outcome) => return outcome,
        };

        let result = match early {
            Some(result) => Some(result),
            None => self.wait_for_dispatch(&attempt, &mut completion).await,
        };

        let registration_error = *attempt
            .registration_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(code) = registration_error {
            inner.stop_attempt(&attempt);
            return RunOutcome::RegistrationFailed { code };
        }

        match result {
            Some(Ok(DispatchOutcome::Failed(e))) => {
                inner
                    .registry
                    .debug(&Error::DispatchEntryFailure(e.to_string()).to_string());
                inner.stop_attempt(&attempt);
                RunOutcome::DispatchFailed { code: Some(e.code) }
            }
            Some(_) => {
                inner.stop_attempt(&attempt);
                RunOutcome::Completed
            }
            None => {
                warn!("Dispatcher did not return after stop, detaching worker");
                inner.registry.debug("dispatcher did not return after stop");
                inner.stop_attempt(&attempt);
                RunOutcome::Completed
            }
        }
    }

    /// Poll for entry confirmation until the startup timeout.
    ///
    /// `Ok(Some(..))` carries a dispatch result that arrived after confirmation.
    async fn wait_for_entry(
        &self,
        attempt: &Arc<RunAttempt>,
        completion: &mut oneshot::Receiver<DispatchOutcome>,
    ) -> std::result::Result<
        Option<std::result::Result<DispatchOutcome, oneshot::error::RecvError>>,
        RunOutcome,
    > {
        let inner = &self.inner;
        let deadline = Instant::now() + inner.config.startup_timeout;
        let mut ticker = tokio::time::interval(inner.config.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if attempt.entry_confirmed.load(Ordering::SeqCst) {
                        return Ok(None);
                    }
                    if Instant::now() >= deadline {
                        let err = Error::DispatchEntryFailure(format!(
                            "service entry not invoked within {:?}",
                            inner.config.startup_timeout
                        ));
                        warn!(error = %err, "Startup timed out");
                        inner.registry.debug(&err.to_string());
                        inner.stop_attempt(attempt);
                        return Err(RunOutcome::StartupTimedOut);
                    }
                }
                result = &mut *completion => {
                    if attempt.entry_confirmed.load(Ordering::SeqCst) {
                        return Ok(Some(result));
                    }
                    let code = match result {
                        Ok(DispatchOutcome::Failed(e)) => Some(e.code),
                        _ => None,
                    };
                    let err = Error::DispatchEntryFailure(match code {
                        Some(code) => format!("dispatcher failed with platform error {}", code),
                        None => "dispatcher returned without invoking the entry point".to_string(),
                    });
                    error!(error = %err, "Service dispatch failed");
                    inner.registry.debug(&err.to_string());
                    inner.stop_attempt(attempt);
                    return Err(RunOutcome::DispatchFailed { code });
                }
            }
        }
    }

    /// Wait for the dispatcher to return; once stopped, wait at most the shutdown grace.
    async fn wait_for_dispatch(
        &self,
        attempt: &Arc<RunAttempt>,
        completion: &mut oneshot::Receiver<DispatchOutcome>,
    ) -> Option<std::result::Result<DispatchOutcome, oneshot::error::RecvError>> {
        tokio::select! {
            result = &mut *completion => return Some(result),
            // Stored permit: a stop before this point still wakes us
            _ = attempt.stopped_notify.notified() => {}
        }

        tokio::time::timeout(self.inner.config.shutdown_grace, &mut *completion)
            .await
            .ok()
    }

    /// Stop the service.
    ///
    /// Safe to call any number of times, from any thread, before or after `run()`.
    pub fn stop(&self) {
        self.inner.stop();
    }
}

impl Inner {
    fn current_attempt(&self) -> Option<Arc<RunAttempt>> {
        self.attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Service entry point, invoked by the platform on a thread it owns.
    fn service_main(&self, weak: &Weak<Inner>, attempt: &Arc<RunAttempt>, args: Vec<String>) {
        self.registry.debug("ServiceMain()");
        if attempt.stopped.load(Ordering::SeqCst) {
            self.registry.debug("entry point invoked after the run attempt ended");
            return;
        }
        attempt.entry_confirmed.store(true, Ordering::SeqCst);
        info!(service = %self.config.service_name, args = ?args, "Service entry point invoked");
        *attempt
            .start_args
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = args;

        let stopper: Weak<dyn StopSequence> = weak.clone();
        let handler = Arc::new(ControlHandler::new(
            self.reporter.clone(),
            self.registry.clone(),
            self.config.stop_policy,
            stopper,
            attempt.runtime.clone(),
        ));
        let sink: ControlSink = Arc::new(move |code| handler.handle(code));
        if !self
            .arena
            .track_callback(attempt.id, NativeCallback::ControlSink(sink.clone()))
        {
            self.registry.debug("run attempt released before handler registration");
            return;
        }

        match self
            .platform
            .register_control_handler(&self.config.service_name, sink)
        {
            Ok(handle) => {
                let stopped_meanwhile = {
                    let _lifecycle = attempt.lock_lifecycle();
                    self.reporter.attach(handle);
                    attempt.stopped.load(Ordering::SeqCst)
                };
                if stopped_meanwhile {
                    // stop() ran while registering and found nothing to report
                    self.registry.debug("stopped during handler registration");
                    self.reporter.stop_pending();
                    self.reporter.stopped();
                    self.reporter.detach();
                    return;
                }
            }
            Err(e) => {
                let err = Error::RegistrationFailure { code: e.code };
                error!(error = %err, "Control handler registration failed");
                self.registry.debug(&err.to_string());
                *attempt
                    .registration_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(e.code);
                self.stop_attempt(attempt);
                return;
            }
        }

        self.reporter.start_pending();
        self.reporter.running();
        if attempt.stopped.load(Ordering::SeqCst) {
            self.registry.debug("stopped before main started");
            return;
        }

        let main = attempt.main.clone().or_else(|| self.registry.main());
        match main {
            Some(main) => {
                let weak = weak.clone();
                let attempt = attempt.clone();
                let runtime = attempt.runtime.clone();
                runtime.spawn(async move {
                    main().await;
                    // Workload finished: stop the service and quit
                    if let Some(inner) = weak.upgrade() {
                        inner.stop_attempt(&attempt);
                    }
                });
            }
            None => {
                self.registry.debug("no main callback registered, stopping");
                self.stop_attempt(attempt);
            }
        }
    }

    fn stop_attempt(&self, attempt: &RunAttempt) {
        let attached = {
            let _lifecycle = attempt.lock_lifecycle();
            if attempt.stopped.swap(true, Ordering::SeqCst) {
                None
            } else {
                Some(self.reporter.is_attached())
            }
        };
        let Some(attached) = attached else {
            self.registry.debug("stop() ignored: already stopped");
            return;
        };
        self.registry.debug("stop()");

        if attached {
            // The control handler may already have announced the stop
            if self.reporter.state() != ServiceState::StopPending {
                self.reporter.stop_pending();
            }
            self.reporter.stopped();
            self.reporter.detach();
        }
        if let Some(summary) = self.arena.release(attempt.id) {
            info!(
                callbacks = summary.callbacks,
                buffers = summary.buffers,
                "Service stopped, native callbacks released"
            );
        }
        attempt.supervisor.wind_down();
        attempt.stopped_notify.notify_one();
    }
}

impl RunAttempt {
    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StopSequence for Inner {
    fn stop(&self) {
        match self.current_attempt() {
            Some(attempt) => self.stop_attempt(&attempt),
            None => self.registry.debug("stop() before run(): nothing to stop"),
        }
    }
}
