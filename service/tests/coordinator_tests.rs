//! End-to-end tests of the coordinator against the recording platform.
//!
//! The recording platform runs the entry point on a thread of its own and
//! delivers control codes from the test thread, so every cross-thread path
//! of the bridge is exercised.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use svcbridge_service::platform::stub::RecordingPlatform;
use svcbridge_service::*;

fn test_config() -> BridgeConfig {
    BridgeConfig {
        startup_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(10),
        shutdown_grace: Duration::from_secs(2),
        ..BridgeConfig::named("test-service")
    }
}

fn coordinator(platform: &Arc<RecordingPlatform>) -> ServiceCoordinator {
    ServiceCoordinator::new(test_config(), platform.clone())
}

/// Collect every message sent to the `debug` callback.
fn capture_debug(service: &ServiceCoordinator) -> Arc<Mutex<Vec<String>>> {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = messages.clone();
    service
        .on_debug(move |m| sink.lock().unwrap().push(m.to_string()))
        .unwrap();
    messages
}

fn count(messages: &Mutex<Vec<String>>, needle: &str) -> usize {
    messages.lock().unwrap().iter().filter(|m| *m == needle).count()
}

fn count_state(platform: &RecordingPlatform, state: ServiceState) -> usize {
    platform.states().into_iter().filter(|s| *s == state).count()
}

/// A main workload that never finishes on its own.
fn forever() -> MainCallback {
    main_callback(|| std::future::pending::<()>())
}

async fn wait_until(flag: &AtomicBool) {
    for _ in 0..200 {
        if flag.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_main_stops_immediately() {
        let platform = Arc::new(RecordingPlatform::new());
        let service = coordinator(&platform);

        let outcome = service.run(None).await;

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(
            platform.states(),
            vec![
                ServiceState::StartPending,
                ServiceState::Running,
                ServiceState::StopPending,
                ServiceState::Stopped,
            ]
        );
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_main_completion_stops_service() {
        let platform = Arc::new(RecordingPlatform::new());
        let service = coordinator(&platform);
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        let outcome = service
            .run(Some(main_callback(move || {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    flag.store(true, Ordering::SeqCst);
                }
            })))
            .await;

        assert_eq!(outcome, RunOutcome::Completed);
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(platform.states().last(), Some(&ServiceState::Stopped));
        assert_eq!(platform.registrations(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_registered_main_is_used() {
        let platform = Arc::new(RecordingPlatform::new());
        let service = coordinator(&platform);
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        service
            .on(
                "main",
                EventCallback::main(move || {
                    let flag = flag.clone();
                    async move { flag.store(true, Ordering::SeqCst) }
                }),
            )
            .unwrap();

        assert_eq!(service.run(None).await, RunOutcome::Completed);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_args_reach_the_service() {
        let platform = Arc::new(
            RecordingPlatform::builder()
                .start_args(vec!["test-service".to_string(), "--fast".to_string()])
                .build(),
        );
        let service = coordinator(&platform);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let probe = service.clone();
        let sink = seen.clone();
        let outcome = service
            .run(Some(main_callback(move || {
                let args = probe.start_args();
                let sink = sink.clone();
                async move { *sink.lock().unwrap() = args }
            })))
            .await;

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["test-service".to_string(), "--fast".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_is_idempotent() {
        let platform = Arc::new(RecordingPlatform::new());
        let service = coordinator(&platform);
        let messages = capture_debug(&service);

        let stopper = service.clone();
        let outcome = service
            .run(Some(main_callback(move || {
                let stopper = stopper.clone();
                async move {
                    stopper.stop();
                    stopper.stop();
                    stopper.stop();
                }
            })))
            .await;
        service.stop();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(count_state(&platform, ServiceState::StopPending), 1);
        assert_eq!(count_state(&platform, ServiceState::Stopped), 1);
        assert_eq!(count(&messages, "stop()"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_coordinator_can_run_again() {
        let platform = Arc::new(RecordingPlatform::new());
        let service = coordinator(&platform);

        assert_eq!(service.run(None).await, RunOutcome::Completed);
        assert_eq!(service.run(None).await, RunOutcome::Completed);

        assert_eq!(platform.registrations(), 2);
        assert_eq!(count_state(&platform, ServiceState::Stopped), 2);
        let handles = platform.pushed_handles();
        // Each attempt pushes with its own handle
        assert_ne!(handles.first(), handles.last());
    }
}

mod failure_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_registration_failure_skips_main() {
        let platform = Arc::new(RecordingPlatform::builder().fail_registration(5).build());
        let service = coordinator(&platform);
        let messages = capture_debug(&service);
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        let outcome = service
            .run(Some(main_callback(move || {
                let flag = flag.clone();
                async move { flag.store(true, Ordering::SeqCst) }
            })))
            .await;

        assert_eq!(outcome, RunOutcome::RegistrationFailed { code: 5 });
        assert!(platform.states().is_empty());
        assert!(!ran.load(Ordering::SeqCst));
        assert!(messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.contains("platform error 5")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_startup_timeout_stops_once() {
        let platform = Arc::new(RecordingPlatform::builder().never_enter().build());
        let service = ServiceCoordinator::new(
            BridgeConfig {
                startup_timeout: Duration::from_millis(200),
                poll_interval: Duration::from_millis(20),
                ..test_config()
            },
            platform.clone(),
        );
        let messages = capture_debug(&service);

        let outcome = tokio::time::timeout(Duration::from_secs(5), service.run(None))
            .await
            .expect("run() must not hang when the entry point is never invoked");

        assert_eq!(outcome, RunOutcome::StartupTimedOut);
        assert_eq!(count(&messages, "stop()"), 1);
        assert_eq!(platform.entry_calls(), 0);
        assert!(platform.states().is_empty());

        platform.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dispatch_failure_is_fatal() {
        let platform = Arc::new(RecordingPlatform::builder().fail_dispatch(1063).build());
        let service = coordinator(&platform);

        let outcome = service.run(Some(forever())).await;

        assert_eq!(outcome, RunOutcome::DispatchFailed { code: Some(1063) });
        assert!(platform.states().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_push_failures_do_not_abort() {
        let platform = Arc::new(RecordingPlatform::builder().fail_status(6).build());
        let service = coordinator(&platform);
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            service.run(Some(main_callback(move || {
                let flag = flag.clone();
                async move { flag.store(true, Ordering::SeqCst) }
            }))),
        )
        .await
        .unwrap();

        // The stub never sees Stopped, so run() returns after the shutdown grace
        assert_eq!(outcome, RunOutcome::Completed);
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(service.state(), ServiceState::Stopped);
        platform.shutdown();
    }

    #[test]
    fn test_unknown_event_rejected() {
        let platform = Arc::new(RecordingPlatform::new());
        let service = coordinator(&platform);

        let result = service.on("explode", EventCallback::control(|| {}));
        assert!(matches!(result, Err(Error::UnknownEventKind(ref name)) if name == "explode"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_debug_callback_may_query_state_on_push_failure() {
        let platform = Arc::new(RecordingPlatform::builder().fail_status(6).build());
        let service = coordinator(&platform);
        let observed = Arc::new(Mutex::new(Vec::new()));

        let inspector = service.clone();
        let sink = observed.clone();
        service
            .on_debug(move |m| {
                let state = inspector.state();
                sink.lock().unwrap().push((m.to_string(), state));
            })
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), service.run(None))
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(service.state(), ServiceState::Stopped);
        let observed = observed.lock().unwrap();
        assert!(observed
            .iter()
            .any(|(m, _)| m.contains("Failed to push stopped status")));
        platform.shutdown();
    }
}

mod registration_race_tests {
    use super::*;
    use std::sync::mpsc;
    use svcbridge_service::platform::{ControlSink, ServiceTable};
    use svcbridge_service::status::StatusBlock;

    /// Holds handler registration until the test releases it.
    struct GatedRegistration {
        inner: Arc<RecordingPlatform>,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl ServiceControlApi for GatedRegistration {
        fn register_control_handler(
            &self,
            service_name: &str,
            sink: ControlSink,
        ) -> std::result::Result<ServiceHandle, PlatformError> {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            self.inner.register_control_handler(service_name, sink)
        }

        fn set_status(
            &self,
            handle: ServiceHandle,
            status: &StatusBlock,
        ) -> std::result::Result<(), PlatformError> {
            self.inner.set_status(handle, status)
        }

        fn enter_dispatch_loop(
            &self,
            table: &ServiceTable,
        ) -> std::result::Result<(), PlatformError> {
            self.inner.enter_dispatch_loop(table)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_during_registration_reaches_stopped() {
        let platform = Arc::new(RecordingPlatform::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let gated = Arc::new(GatedRegistration {
            inner: platform.clone(),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let service = ServiceCoordinator::new(test_config(), gated);
        let ran = Arc::new(AtomicBool::new(false));

        let runner = service.clone();
        let flag = ran.clone();
        let run = tokio::spawn(async move {
            runner
                .run(Some(main_callback(move || {
                    let flag = flag.clone();
                    async move { flag.store(true, Ordering::SeqCst) }
                })))
                .await
        });

        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();
        service.stop();
        release_tx.send(()).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        service.stop();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(service.state(), ServiceState::Stopped);
        assert_eq!(
            platform.states(),
            vec![ServiceState::StopPending, ServiceState::Stopped]
        );
        assert!(!ran.load(Ordering::SeqCst));
    }
}

mod control_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_code_delegates_to_callback() {
        let platform = Arc::new(RecordingPlatform::new());
        let service = coordinator(&platform);

        let stopper = service.clone();
        service.on_stop(move || stopper.stop()).unwrap();

        let runner = service.clone();
        let run = tokio::spawn(async move { runner.run(Some(forever())).await });
        assert!(platform.wait_for_state(ServiceState::Running, Duration::from_secs(2)));

        assert_eq!(platform.send_control(ControlCode::Stop.as_raw()), Some(true));

        assert_eq!(run.await.unwrap(), RunOutcome::Completed);
        assert_eq!(platform.states().last(), Some(&ServiceState::Stopped));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_code_without_callback_self_stops() {
        let platform = Arc::new(RecordingPlatform::new());
        let service = coordinator(&platform);

        let runner = service.clone();
        let run = tokio::spawn(async move { runner.run(Some(forever())).await });
        assert!(platform.wait_for_state(ServiceState::Running, Duration::from_secs(2)));

        platform.send_control(ControlCode::Stop.as_raw());

        // The handler finished the stop sequence before returning
        assert_eq!(service.state(), ServiceState::Stopped);
        assert_eq!(count_state(&platform, ServiceState::StopPending), 1);
        assert_eq!(run.await.unwrap(), RunOutcome::Completed);
        // Native callbacks were released with the attempt
        assert_eq!(platform.send_control(ControlCode::Pause.as_raw()), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pause_and_continue_round_trip() {
        let platform = Arc::new(RecordingPlatform::new());
        let service = coordinator(&platform);
        let pauses = Arc::new(AtomicUsize::new(0));
        let continues = Arc::new(AtomicUsize::new(0));

        let counter = pauses.clone();
        service
            .on_pause(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let counter = continues.clone();
        service
            .on_continue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let runner = service.clone();
        let run = tokio::spawn(async move { runner.run(Some(forever())).await });
        assert!(platform.wait_for_state(ServiceState::Running, Duration::from_secs(2)));

        platform.send_control(ControlCode::Pause.as_raw());
        assert_eq!(service.state(), ServiceState::Paused);
        platform.send_control(ControlCode::Continue.as_raw());
        assert_eq!(service.state(), ServiceState::Running);
        assert_eq!(platform.send_control(0x80), Some(false));
        platform.send_control(ControlCode::Stop.as_raw());

        assert_eq!(run.await.unwrap(), RunOutcome::Completed);
        assert_eq!(
            &platform.states()[..4],
            &[
                ServiceState::StartPending,
                ServiceState::Running,
                ServiceState::Paused,
                ServiceState::Running,
            ]
        );
        assert_eq!(pauses.load(Ordering::SeqCst), 1);
        assert_eq!(continues.load(Ordering::SeqCst), 1);
    }

    /// Stop then continue while the stop callback is still running: the
    /// service stays stop-pending, the continue callback still fires, and the
    /// service reaches stopped once the stop callback completes.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_continue_during_pending_stop() {
        let platform = Arc::new(RecordingPlatform::new());
        let service = coordinator(&platform);
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let continued = Arc::new(AtomicBool::new(false));

        let stopper = service.clone();
        service
            .on_stop(move || {
                let _ = release_rx.lock().unwrap().recv();
                stopper.stop();
            })
            .unwrap();
        let flag = continued.clone();
        service
            .on_continue(move || flag.store(true, Ordering::SeqCst))
            .unwrap();

        let runner = service.clone();
        let run = tokio::spawn(async move { runner.run(Some(forever())).await });
        assert!(platform.wait_for_state(ServiceState::Running, Duration::from_secs(2)));

        platform.send_control(ControlCode::Stop.as_raw());
        platform.send_control(ControlCode::Continue.as_raw());
        wait_until(&continued).await;

        assert_eq!(service.state(), ServiceState::StopPending);
        assert_eq!(platform.states().last(), Some(&ServiceState::StopPending));

        release_tx.send(()).unwrap();
        assert_eq!(run.await.unwrap(), RunOutcome::Completed);

        let states = platform.states();
        assert_eq!(states.last(), Some(&ServiceState::Stopped));
        let first_stop = states
            .iter()
            .position(|s| *s == ServiceState::StopPending)
            .unwrap();
        assert!(!states[first_stop..].contains(&ServiceState::Running));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_auto_stop_policy() {
        let platform = Arc::new(RecordingPlatform::new());
        let service = ServiceCoordinator::new(
            BridgeConfig {
                stop_policy: StopPolicy::AutoStop,
                ..test_config()
            },
            platform.clone(),
        );
        let notified = Arc::new(AtomicBool::new(false));

        let flag = notified.clone();
        service
            .on_stop(move || flag.store(true, Ordering::SeqCst))
            .unwrap();

        let runner = service.clone();
        let run = tokio::spawn(async move { runner.run(Some(forever())).await });
        assert!(platform.wait_for_state(ServiceState::Running, Duration::from_secs(2)));

        platform.send_control(ControlCode::Stop.as_raw());

        assert_eq!(service.state(), ServiceState::Stopped);
        assert_eq!(run.await.unwrap(), RunOutcome::Completed);
        wait_until(&notified).await;
    }
}
