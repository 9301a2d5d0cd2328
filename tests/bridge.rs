//! Session registry tests against the mock inspector runtime
//!
//! Each test gets its own debug port and script directory, so they can run
//! in parallel. The runtime is the `mock_inspector` binary built alongside
//! the bridge. Tests run on a multi-threaded runtime like the daemon does,
//! so process output and inspector replies really do race.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use devdock_bridge::common::config::Config;
use devdock_bridge::daemon::script::ScriptStore;
use devdock_bridge::daemon::{SessionHandle, SessionRegistry, StepKind};
use devdock_bridge::ipc::protocol::PushMessage;
use devdock_bridge::{Error, SessionStatus};

const WAIT: Duration = Duration::from_secs(15);

struct Bridge {
    registry: SessionRegistry,
    _scripts: tempfile::TempDir,
}

impl Bridge {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::default();
        config.runtime.path = PathBuf::from(env!("CARGO_BIN_EXE_mock_inspector"));
        config.inspector.port = free_port();
        config.timeouts.request_secs = 5;
        config.timeouts.connect_attempts = 40;
        config.timeouts.connect_interval_ms = 50;
        config.timeouts.connect_initial_delay_ms = 20;
        tweak(&mut config);

        let scripts = tempfile::tempdir().expect("Failed to create script dir");
        let registry = SessionRegistry::new(config, ScriptStore::new(scripts.path()));
        Self {
            registry,
            _scripts: scripts,
        }
    }

    async fn start(&self, code: &str, break_on_start: bool) -> Arc<SessionHandle> {
        let started = self
            .registry
            .start(code, break_on_start, true)
            .await
            .expect("start failed");
        self.registry
            .get(Some(&started.session_id))
            .expect("started session not registered")
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
    listener.local_addr().expect("No local address").port()
}

async fn wait_for(session: &SessionHandle, want: SessionStatus) {
    let mut status = session.status_watch();
    let reached = tokio::time::timeout(WAIT, status.wait_for(|s| *s == want)).await;
    assert!(
        matches!(reached, Ok(Ok(_))),
        "session never reached {}; last status {}",
        want,
        session.status()
    );
}

fn drain(observer: &mut devdock_bridge::daemon::broadcast::Subscription) -> Vec<PushMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = observer.rx.try_recv() {
        messages.push(message);
    }
    messages
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_console_output_reaches_observers_and_session_stops() {
    let bridge = Bridge::new();
    let mut observer = bridge.registry.subscribe();

    let session = bridge.start("console.log(1+1);\n", false).await;
    wait_for(&session, SessionStatus::Stopped).await;

    let detail = session.detail(20).await;
    assert!(detail.console.iter().any(|m| m.text == "2"), "console: {:?}", detail.console);
    assert_eq!(detail.exit_code, Some(0));
    assert!(detail.error.is_none());
    assert!(!Path::new(&detail.script_path).exists(), "script file not removed");

    let pushed = drain(&mut observer);
    assert!(pushed.iter().any(|m| matches!(
        m,
        PushMessage::Console { message, .. } if message.text == "2"
    )));
    assert!(matches!(
        pushed.last(),
        Some(PushMessage::Status {
            status: SessionStatus::Stopped,
            ..
        })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_breakpoint_pause_inspect_and_continue() {
    let bridge = Bridge::new();
    let session = bridge
        .start("let a = 1;\nlet b = 2;\nlet c = a + b;\nconsole.log(c);\n", true)
        .await;

    // Held at the first statement
    wait_for(&session, SessionStatus::Paused).await;
    let detail = session.detail(0).await;
    assert_eq!(detail.pause_location.as_ref().map(|l| l.line), Some(1));

    let bp = session.set_breakpoint(None, 3).await.expect("set breakpoint");
    assert_eq!(bp.line, 3);
    assert_eq!(bp.locations.first().map(|l| l.line), Some(3));

    // Setting the same line again returns the existing record
    let again = session.set_breakpoint(None, 3).await.expect("set breakpoint twice");
    assert_eq!(again.id, bp.id);
    assert_eq!(session.summary().await.breakpoints.len(), 1);

    session.step(StepKind::Continue).await.expect("continue");
    wait_for(&session, SessionStatus::Paused).await;

    let detail = session.detail(0).await;
    let location = detail.pause_location.expect("pause location");
    assert_eq!(location.line, 3);
    assert_eq!(location.file, detail.script_path);

    let sum = session.evaluate("a + b").await.expect("evaluate");
    assert_eq!(sum.value, serde_json::json!(3));
    assert_eq!(sum.value_type, "number");

    let missing = session.evaluate("c").await.expect("evaluate undefined name");
    assert!(missing.exception.is_some());

    let locals = session.read_variables("local").await.expect("variables");
    let names: Vec<_> = locals.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, ["a", "b"]);

    assert!(matches!(
        session.read_variables("closure").await,
        Err(Error::ScopeNotFound(_))
    ));

    session.step(StepKind::Over).await.expect("step over");
    wait_for(&session, SessionStatus::Paused).await;
    let detail = session.detail(0).await;
    assert_eq!(detail.pause_location.map(|l| l.line), Some(4));

    session.step(StepKind::Continue).await.expect("continue");
    wait_for(&session, SessionStatus::Stopped).await;

    let detail = session.detail(20).await;
    assert!(detail.console.iter().any(|m| m.text == "3"));
    assert!(detail.breakpoints.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_continue_to_end_is_acknowledged() {
    // The runtime reports the script finished while the continue reply is
    // still on its way; the reply must still count.
    for _ in 0..5 {
        let bridge = Bridge::new();
        let session = bridge
            .start("let a = 1;\nlet b = 2;\nlet c = a + b;\nconsole.log(c);\n", true)
            .await;
        wait_for(&session, SessionStatus::Paused).await;

        session.set_breakpoint(None, 3).await.expect("set breakpoint");
        session.step(StepKind::Continue).await.expect("continue to breakpoint");
        wait_for(&session, SessionStatus::Paused).await;

        let status = session.step(StepKind::Continue).await.expect("continue to end");
        assert!(
            matches!(
                status,
                SessionStatus::Resumed | SessionStatus::Running | SessionStatus::Stopped
            ),
            "unexpected status after continue: {}",
            status
        );
        wait_for(&session, SessionStatus::Stopped).await;
        assert!(session.detail(0).await.error.is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lost_connection_crashes_live_session() {
    let bridge = Bridge::new();
    let mut observer = bridge.registry.subscribe();
    let session = bridge
        .start(
            "console.log(\"up\");\ninspector.close();\nAtomics.wait(new Int32Array(new SharedArrayBuffer(4)), 0, 0, 5000);\n",
            false,
        )
        .await;
    wait_for(&session, SessionStatus::Crashed).await;

    let detail = session.detail(20).await;
    let error = detail.error.expect("crash reason");
    assert!(error.contains("connection lost"), "error: {}", error);

    let crashed = drain(&mut observer).into_iter().find_map(|m| match m {
        PushMessage::Status {
            status: SessionStatus::Crashed,
            error,
            ..
        } => Some(error),
        _ => None,
    });
    assert!(matches!(crashed, Some(Some(_))), "crash not pushed with an error: {:?}", crashed);
    assert!(!bridge.registry.has_live_session());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remove_breakpoint() {
    let bridge = Bridge::new();
    let session = bridge.start("let a = 1;\nlet b = 2;\n", true).await;
    wait_for(&session, SessionStatus::Paused).await;

    let bp = session.set_breakpoint(None, 2).await.expect("set breakpoint");
    session.remove_breakpoint(&bp.id).await.expect("remove breakpoint");
    assert!(session.summary().await.breakpoints.is_empty());

    assert!(matches!(
        session.remove_breakpoint(&bp.id).await,
        Err(Error::BreakpointNotFound(_))
    ));
    assert!(matches!(
        session.set_breakpoint(None, 0).await,
        Err(Error::InvalidArgument(_))
    ));

    // Nothing left to stop at
    session.step(StepKind::Continue).await.expect("continue");
    wait_for(&session, SessionStatus::Stopped).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_execution_control_requires_pause() {
    let bridge = Bridge::new();
    let session = bridge
        .start("Atomics.wait(new Int32Array(new SharedArrayBuffer(4)), 0, 0, 5000);\n", false)
        .await;
    wait_for(&session, SessionStatus::Running).await;

    assert!(matches!(
        session.step(StepKind::Over).await,
        Err(Error::InvalidSessionState { .. })
    ));
    assert!(matches!(
        session.read_variables("local").await,
        Err(Error::InvalidSessionState { .. })
    ));

    // Not paused: evaluation runs in the global context
    let result = session.evaluate("1 + 1").await.expect("evaluate");
    assert_eq!(result.value, serde_json::json!(2));

    assert_eq!(session.stop().await, SessionStatus::Stopped);
    assert!(matches!(
        session.step(StepKind::Continue).await,
        Err(Error::InvalidSessionState { .. })
    ));
    // Stopping twice keeps the first outcome
    assert_eq!(session.stop().await, SessionStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_start_supersedes_first() {
    let bridge = Bridge::new();
    let mut observer = bridge.registry.subscribe();
    let first = bridge.start("let a = 1;\n", true).await;
    wait_for(&first, SessionStatus::Paused).await;
    let first_script = first.detail(0).await.script_path;

    let second = bridge.start("let b = 2;\n", true).await;
    assert_eq!(first.status(), SessionStatus::Stopped);
    assert!(!Path::new(&first_script).exists());

    // The old session is reported stopped before the new one is announced
    let pushed = drain(&mut observer);
    let position = |id: &str, want: SessionStatus| {
        pushed.iter().position(|m| {
            matches!(m, PushMessage::Status { session_id, status, .. } if session_id == id && *status == want)
        })
    };
    let stopped = position(first.id(), SessionStatus::Stopped).expect("first session stop pushed");
    let launching = position(second.id(), SessionStatus::Launching).expect("second session launch pushed");
    assert!(stopped < launching, "pushed out of order: {:?}", pushed);

    let status = bridge.registry.status();
    assert_eq!(status.active_session.as_deref(), Some(second.id()));
    assert_eq!(status.session_count, 2);
    assert!(bridge.registry.has_live_session());

    let active = bridge.registry.get(None).expect("active session");
    assert_eq!(active.id(), second.id());

    bridge.registry.shutdown().await;
    assert!(!bridge.registry.has_live_session());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_uncaught_exception_crashes_session() {
    let bridge = Bridge::new();
    let session = bridge
        .start("console.log(\"before\");\nthrow new Error(\"boom\");\n", false)
        .await;
    wait_for(&session, SessionStatus::Crashed).await;

    let detail = session.detail(20).await;
    assert_eq!(detail.exit_code, Some(1));
    assert!(detail.error.as_deref().unwrap_or("").contains("code 1"));
    assert!(detail.console.iter().any(|m| m.text == "before"));
    // Reported on stderr, and as an exception event when it wins the race
    assert!(detail.console.iter().any(|m| m.text.contains("boom")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_debugger_fails_start() {
    let bridge = Bridge::with_config(|config| {
        config.runtime.args = vec!["--no-listen".to_string()];
        config.timeouts.connect_attempts = 3;
    });

    match bridge.registry.start("let a = 1;\n", false, true).await {
        Err(Error::DebuggerUnreachable { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected DebuggerUnreachable, got {:?}", other.map(|r| r.status)),
    }

    let sessions = bridge.registry.list().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Crashed);
    assert!(!bridge.registry.has_live_session());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_runtime_creates_no_session() {
    let bridge = Bridge::with_config(|config| {
        config.runtime.path = PathBuf::from("/nonexistent/devdock-runtime");
    });

    assert!(matches!(
        bridge.registry.start("let a = 1;\n", false, false).await,
        Err(Error::LaunchFailure(_))
    ));
    assert!(bridge.registry.list().await.is_empty());
    assert!(matches!(bridge.registry.get(None), Err(Error::NoActiveSession)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshot_describes_active_session() {
    let bridge = Bridge::new();
    let session = bridge.start("let a = 1;\n", true).await;
    wait_for(&session, SessionStatus::Paused).await;

    match bridge.registry.snapshot().await {
        PushMessage::Snapshot { active, sessions } => {
            let active = active.expect("active session in snapshot");
            assert_eq!(active.id, session.id());
            assert_eq!(active.status, SessionStatus::Paused);
            assert_eq!(sessions.len(), 1);
        }
        other => panic!("expected snapshot, got {:?}", other),
    }

    bridge.registry.shutdown().await;
}
