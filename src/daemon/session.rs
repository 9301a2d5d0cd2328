//! Debug session state machine
//!
//! One session owns one runtime process, its script file and its inspector
//! connection. Process output, connection outcomes and protocol events are
//! queued on a per-session channel and applied serially by a pump task;
//! Control API operations take the same per-session lock, but never hold it
//! across an inspector round trip.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};

use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::inspector::{
    self, events, BreakpointResolvedParams, CallFrame, ConsoleApiCalledParams, ExceptionThrownParams,
    InspectorClient, InspectorEvent, Location, PausedParams, RetryPolicy, ScriptParsedParams,
};
use crate::ipc::protocol::{
    BreakpointInfo, ConsoleMessage, EvaluateResult, PauseLocation, PushMessage, ResolvedLocation,
    SessionDetail, SessionStatus, SessionSummary, VariableInfo,
};

use super::broadcast::Broadcaster;
use super::process::{self, ExitInfo, LaunchSpec, OutputStream, ProcessHandle};
use super::script::{self, ScriptFile};

/// How long a dropped connection waits for the matching process exit
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// How long a detach waits for replies to requests already sent
const DETACH_DRAIN: Duration = Duration::from_secs(1);

/// Printed by the runtime when the script is done but a debugger is attached
const WAITING_FOR_DISCONNECT: &str = "Waiting for the debugger to disconnect";

const SUBSCRIBED_EVENTS: &[&str] = &[
    events::PAUSED,
    events::RESUMED,
    events::SCRIPT_PARSED,
    events::CONSOLE_API_CALLED,
    events::EXCEPTION_THROWN,
    events::BREAKPOINT_RESOLVED,
];

/// Everything that happens to a session outside of Control API calls
pub enum SessionEvent {
    Output { stream: OutputStream, line: String },
    ProcessExited(ExitInfo),
    Connected(Arc<InspectorClient>),
    ConnectFailed(Error),
    Inspector(InspectorEvent),
    Disconnected(String),
}

/// Execution control requests that are only valid while paused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Over,
    Into,
    Out,
    Continue,
}

impl StepKind {
    fn action(self) -> &'static str {
        match self {
            Self::Over => "step over",
            Self::Into => "step into",
            Self::Out => "step out",
            Self::Continue => "continue",
        }
    }
}

/// Bounded console history, oldest evicted first
#[derive(Debug)]
pub struct ConsoleBuffer {
    messages: VecDeque<ConsoleMessage>,
    capacity: usize,
}

impl ConsoleBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, message: ConsoleMessage) {
        while self.messages.len() >= self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// The last `max` messages, oldest first
    pub fn tail(&self, max: usize) -> Vec<ConsoleMessage> {
        let skip = self.messages.len().saturating_sub(max);
        self.messages.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Debug, Clone)]
struct StoredBreakpoint {
    id: String,
    url: String,
    /// 1-based
    line: u32,
    locations: Vec<ResolvedLocation>,
}

impl StoredBreakpoint {
    fn info(&self) -> BreakpointInfo {
        BreakpointInfo {
            id: self.id.clone(),
            file: script::url_to_file(&self.url),
            line: self.line,
            locations: self.locations.clone(),
        }
    }
}

fn resolved(location: &Location) -> ResolvedLocation {
    ResolvedLocation {
        script_id: location.script_id.clone(),
        line: location.line_number + 1,
        column: location.column_number.map(|c| c + 1),
    }
}

#[derive(Debug, Clone)]
struct PauseState {
    call_frames: Vec<CallFrame>,
    location: Option<PauseLocation>,
}

/// Why a session ended up crashed
#[derive(Debug, Clone)]
enum Failure {
    Unreachable { port: u16, attempts: u32 },
    ConnectionLost(String),
    Exited(Option<i32>),
    Other(String),
}

impl From<&Error> for Failure {
    fn from(e: &Error) -> Self {
        match e {
            Error::DebuggerUnreachable { port, attempts } => Self::Unreachable {
                port: *port,
                attempts: *attempts,
            },
            Error::ConnectionLost(reason) => Self::ConnectionLost(reason.clone()),
            other => Self::Other(other.to_string()),
        }
    }
}

impl Failure {
    /// The error a caller waiting on the launch sees
    fn launch_error(&self) -> Error {
        match self {
            Self::Unreachable { port, attempts } => Error::DebuggerUnreachable {
                port: *port,
                attempts: *attempts,
            },
            Self::ConnectionLost(reason) => Error::ConnectionLost(reason.clone()),
            Self::Exited(_) => Error::LaunchFailure(format!("{} before the debugger attached", self.message())),
            Self::Other(message) => Error::LaunchFailure(message.clone()),
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Exited(Some(code)) => format!("runtime exited with code {}", code),
            Self::Exited(None) => "runtime was killed by a signal".to_string(),
            other => other.launch_error().to_string(),
        }
    }
}

/// Mutable state of one session, guarded by [`SessionHandle`]'s lock
pub struct DebugSession {
    id: String,
    status: SessionStatus,
    status_tx: watch::Sender<SessionStatus>,
    script: ScriptFile,
    script_path: PathBuf,
    script_url: String,
    process: Option<ProcessHandle>,
    client: Option<Arc<InspectorClient>>,
    connected: bool,
    breakpoints: Vec<StoredBreakpoint>,
    console: ConsoleBuffer,
    pause: Option<PauseState>,
    /// Bumped by every pause and resume event
    pause_generation: u64,
    /// scriptId to URL, from `Debugger.scriptParsed`
    scripts: HashMap<String, String>,
    break_on_start: bool,
    entry_pause_seen: bool,
    /// The bridge closed the connection on purpose and expects an exit
    detaching: bool,
    exit: Option<ExitInfo>,
    failure: Option<Failure>,
    created_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    broadcaster: Arc<Broadcaster>,
}

impl DebugSession {
    fn new(
        id: String,
        script: ScriptFile,
        process: Option<ProcessHandle>,
        break_on_start: bool,
        console_capacity: usize,
        broadcaster: Arc<Broadcaster>,
    ) -> (Self, watch::Receiver<SessionStatus>) {
        let (status_tx, status_rx) = watch::channel(SessionStatus::Launching);
        let script_path = script.path().to_path_buf();
        let script_url = script::file_url(&script_path);
        let session = Self {
            id,
            status: SessionStatus::Launching,
            status_tx,
            script,
            script_path,
            script_url,
            process,
            client: None,
            connected: false,
            breakpoints: Vec::new(),
            console: ConsoleBuffer::new(console_capacity),
            pause: None,
            pause_generation: 0,
            scripts: HashMap::new(),
            break_on_start,
            entry_pause_seen: false,
            detaching: false,
            exit: None,
            failure: None,
            created_at: Utc::now(),
            ended_at: None,
            broadcaster,
        };
        (session, status_rx)
    }

    fn publish(&self, message: PushMessage) {
        self.broadcaster.publish(message);
    }

    fn publish_status(&self) {
        let (exit_code, error) = if self.status.is_terminal() {
            (
                self.exit.and_then(|e| e.code),
                self.failure.as_ref().map(Failure::message),
            )
        } else {
            (None, None)
        };
        self.publish(PushMessage::Status {
            session_id: self.id.clone(),
            status: self.status,
            exit_code,
            error,
        });
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status == status {
            return;
        }
        tracing::debug!(session = %self.id, from = %self.status, to = %status, "Session status changed");
        self.status = status;
        self.status_tx.send_replace(status);
        self.publish_status();
    }

    fn ensure_live(&self, action: &str) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::invalid_state(action, self.status));
        }
        Ok(())
    }

    fn ensure_paused(&self, action: &str) -> Result<()> {
        match self.status {
            SessionStatus::Paused => Ok(()),
            other => Err(Error::invalid_state(action, other)),
        }
    }

    fn connection(&self) -> Result<Arc<InspectorClient>> {
        self.client
            .clone()
            .ok_or_else(|| Error::ConnectionLost("inspector not connected".to_string()))
    }

    fn top_frame(&self) -> Option<&CallFrame> {
        self.pause.as_ref().and_then(|p| p.call_frames.first())
    }

    fn find_breakpoint(&self, url: &str, line: u32) -> Option<&StoredBreakpoint> {
        self.breakpoints.iter().find(|bp| bp.url == url && bp.line == line)
    }

    fn push_console(&mut self, kind: &str, text: String) {
        let message = ConsoleMessage {
            kind: kind.to_string(),
            text,
            timestamp: Utc::now(),
        };
        self.console.push(message.clone());
        self.publish(PushMessage::Console {
            session_id: self.id.clone(),
            message,
        });
    }

    /// Drop the connection and the script; kill the process if it is ours
    fn release(&mut self) {
        if let Some(client) = self.client.take() {
            client.close();
        }
        if let Some(process) = self.process.as_mut() {
            if self.exit.is_none() {
                process.kill();
            }
        }
        self.script.remove();
    }

    /// Enter a terminal state and release everything the session owns
    fn finish(&mut self, status: SessionStatus, failure: Option<Failure>) {
        if self.status.is_terminal() {
            return;
        }
        self.failure = failure;
        self.ended_at = Some(Utc::now());
        self.pause = None;
        self.breakpoints.clear();
        self.release();

        match &self.failure {
            Some(failure) => {
                tracing::warn!(session = %self.id, status = %status, reason = %failure.message(), "Session ended")
            }
            None => tracing::info!(session = %self.id, status = %status, "Session ended"),
        }
        self.set_status(status);
    }

    /// Nothing more will arrive that changes this session
    fn is_finished(&self) -> bool {
        self.status.is_terminal() && (self.process.is_none() || self.exit.is_some())
    }

    fn apply(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Output { stream, line } => self.on_output(stream, line),
            SessionEvent::ProcessExited(info) => self.on_exit(info),
            SessionEvent::Connected(client) => {
                if self.status.is_terminal() {
                    client.close();
                    return;
                }
                tracing::info!(session = %self.id, "Inspector attached");
                self.client = Some(client);
                self.connected = true;
                self.set_status(SessionStatus::Running);
            }
            SessionEvent::ConnectFailed(e) => {
                if !self.status.is_terminal() {
                    self.finish(SessionStatus::Crashed, Some(Failure::from(&e)));
                }
            }
            SessionEvent::Inspector(event) => {
                if !self.status.is_terminal() {
                    self.on_inspector_event(event);
                }
            }
            // Needs the grace period; handled by the pump
            SessionEvent::Disconnected(_) => {}
        }
    }

    fn on_output(&mut self, stream: OutputStream, mut line: String) {
        if line.ends_with('\r') {
            line.pop();
        }
        let detach = stream == OutputStream::Stderr && line.starts_with(WAITING_FOR_DISCONNECT);
        self.push_console(stream.as_str(), line);

        if detach && !self.status.is_terminal() {
            if let Some(client) = self.client.take() {
                tracing::debug!(session = %self.id, "Script finished, detaching inspector");
                self.detaching = true;
                tokio::spawn(async move { client.close_when_idle(DETACH_DRAIN).await });
            }
        }
    }

    fn on_exit(&mut self, info: ExitInfo) {
        self.exit = Some(info);
        if self.status.is_terminal() {
            return;
        }
        if info.success {
            self.finish(SessionStatus::Stopped, None);
        } else {
            self.finish(SessionStatus::Crashed, Some(Failure::Exited(info.code)));
        }
    }

    fn on_inspector_event(&mut self, event: InspectorEvent) {
        match event.method.as_str() {
            events::SCRIPT_PARSED => {
                if let Ok(params) = serde_json::from_value::<ScriptParsedParams>(event.params) {
                    self.scripts.insert(params.script_id, params.url);
                }
            }
            events::PAUSED => match serde_json::from_value::<PausedParams>(event.params) {
                Ok(params) => self.on_paused(params),
                Err(e) => tracing::warn!(session = %self.id, error = %e, "Unparseable pause event"),
            },
            events::RESUMED => {
                self.pause_generation += 1;
                self.pause = None;
                if matches!(self.status, SessionStatus::Paused | SessionStatus::Resumed) {
                    self.set_status(SessionStatus::Running);
                    self.publish(PushMessage::Resumed {
                        session_id: self.id.clone(),
                    });
                }
            }
            events::CONSOLE_API_CALLED => {
                if let Ok(params) = serde_json::from_value::<ConsoleApiCalledParams>(event.params) {
                    let text = params.text();
                    self.push_console(&params.call_type, text);
                }
            }
            events::EXCEPTION_THROWN => {
                if let Ok(params) = serde_json::from_value::<ExceptionThrownParams>(event.params) {
                    self.push_console("exception", params.exception_details.message());
                }
            }
            events::BREAKPOINT_RESOLVED => {
                if let Ok(params) = serde_json::from_value::<BreakpointResolvedParams>(event.params) {
                    self.on_breakpoint_resolved(params);
                }
            }
            other => tracing::trace!(session = %self.id, method = other, "Ignoring inspector event"),
        }
    }

    fn on_paused(&mut self, params: PausedParams) {
        if !self.entry_pause_seen {
            self.entry_pause_seen = true;
            if !self.break_on_start {
                // The runtime was started held; let it go.
                if let Some(client) = self.client.clone() {
                    let id = self.id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = client.resume().await {
                            tracing::debug!(session = %id, error = %e, "Failed to release entry pause");
                        }
                    });
                }
                return;
            }
        }

        self.pause_generation += 1;
        let location = params.call_frames.first().map(|frame| self.pause_location(frame));
        tracing::debug!(session = %self.id, reason = %params.reason, ?location, "Paused");

        self.pause = Some(PauseState {
            call_frames: params.call_frames,
            location: location.clone(),
        });
        self.set_status(SessionStatus::Paused);
        self.publish(PushMessage::Paused {
            session_id: self.id.clone(),
            reason: params.reason,
            location,
            hit_breakpoints: params.hit_breakpoints,
        });
    }

    fn on_breakpoint_resolved(&mut self, params: BreakpointResolvedParams) {
        let location = resolved(&params.location);
        let Some(bp) = self.breakpoints.iter_mut().find(|bp| bp.id == params.breakpoint_id) else {
            return;
        };
        if bp.locations.contains(&location) {
            return;
        }
        bp.locations.push(location);
        let breakpoint = bp.info();
        self.publish(PushMessage::BreakpointSet {
            session_id: self.id.clone(),
            breakpoint,
        });
    }

    fn pause_location(&self, frame: &CallFrame) -> PauseLocation {
        let url = if frame.url.is_empty() {
            self.scripts.get(&frame.location.script_id).cloned().unwrap_or_default()
        } else {
            frame.url.clone()
        };
        PauseLocation {
            file: script::url_to_file(&url),
            line: frame.location.line_number + 1,
            column: frame.location.column_number.unwrap_or(0) + 1,
            function_name: frame.function_name.clone(),
        }
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            status: self.status,
            breakpoints: self.breakpoints.iter().map(StoredBreakpoint::info).collect(),
        }
    }

    fn detail(&self, console_tail: usize) -> SessionDetail {
        SessionDetail {
            id: self.id.clone(),
            status: self.status,
            script_path: self.script_path.display().to_string(),
            breakpoints: self.breakpoints.iter().map(StoredBreakpoint::info).collect(),
            console: self.console.tail(console_tail),
            pause_location: self.pause.as_ref().and_then(|p| p.location.clone()),
            created_at: self.created_at,
            ended_at: self.ended_at,
            exit_code: self.exit.and_then(|e| e.code),
            error: self.failure.as_ref().map(Failure::message),
        }
    }
}

/// Where and how to reach the runtime's inspector
struct ConnectTarget {
    host: String,
    port: u16,
    policy: RetryPolicy,
    request_timeout: Duration,
}

/// Shared handle to one session
pub struct SessionHandle {
    id: String,
    state: Mutex<DebugSession>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    /// Spawn the runtime for `script` and start attaching to it
    ///
    /// Returns as soon as the process is running; the session is
    /// `launching` until the inspector connects or the attempt fails.
    pub fn launch(
        config: &Config,
        runtime: &Path,
        script: ScriptFile,
        break_on_start: bool,
        broadcaster: Arc<Broadcaster>,
    ) -> Result<Arc<Self>> {
        let id = uuid::Uuid::new_v4().to_string();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let process = process::spawn(
            &LaunchSpec {
                runtime,
                runtime_args: &config.runtime.args,
                host: &config.inspector.host,
                port: config.inspector.port,
                script: script.path(),
            },
            events_tx.clone(),
        )?;
        let exited = process.exit_watch();

        let (session, status) = DebugSession::new(
            id.clone(),
            script,
            Some(process),
            break_on_start,
            config.console.capacity,
            broadcaster,
        );
        session.publish_status();
        tracing::info!(session = %id, script = %session.script_path.display(), break_on_start, "Session launching");

        let handle = Arc::new(Self {
            id,
            state: Mutex::new(session),
            status,
        });

        tokio::spawn(pump(Arc::clone(&handle), events_rx));
        tokio::spawn(attach(
            ConnectTarget {
                host: config.inspector.host.clone(),
                port: config.inspector.port,
                policy: config.timeouts.retry_policy(),
                request_timeout: config.timeouts.request(),
            },
            exited,
            events_tx,
        ));

        Ok(handle)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Receiver that tracks every status change
    pub fn status_watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    async fn lock(&self) -> MutexGuard<'_, DebugSession> {
        self.state.lock().await
    }

    /// Wait until the session has left `launching`
    pub async fn wait_settled(&self) -> SessionStatus {
        let mut status = self.status.clone();
        if let Ok(settled) = status.wait_for(|s| *s != SessionStatus::Launching).await {
            return *settled;
        }
        self.status()
    }

    /// Wait for the launch to resolve, surfacing why it failed if it did
    pub async fn launch_outcome(&self) -> Result<SessionStatus> {
        let status = self.wait_settled().await;
        let session = self.lock().await;
        if status.is_terminal() && !session.connected {
            return Err(match &session.failure {
                Some(failure) => failure.launch_error(),
                None => Error::LaunchFailure("runtime exited before the debugger attached".to_string()),
            });
        }
        Ok(session.status)
    }

    pub async fn summary(&self) -> SessionSummary {
        self.lock().await.summary()
    }

    pub async fn detail(&self, console_tail: usize) -> SessionDetail {
        self.lock().await.detail(console_tail)
    }

    pub async fn console(&self, max: usize) -> Vec<ConsoleMessage> {
        self.lock().await.console.tail(max)
    }

    /// Set a breakpoint at a 1-based line; `file: None` means this
    /// session's own script
    ///
    /// Setting the same file and line twice returns the existing record.
    pub async fn set_breakpoint(&self, file: Option<&str>, line: u32) -> Result<BreakpointInfo> {
        if line == 0 {
            return Err(Error::InvalidArgument("breakpoint lines start at 1".to_string()));
        }
        self.wait_settled().await;

        let (client, url) = {
            let session = self.lock().await;
            session.ensure_live("set breakpoint")?;
            let url = match file {
                Some(file) => script::script_url(file),
                None => session.script_url.clone(),
            };
            if let Some(existing) = session.find_breakpoint(&url, line) {
                return Ok(existing.info());
            }
            (session.connection()?, url)
        };

        let result = client.set_breakpoint_by_url(&url, line - 1).await;

        let mut session = self.lock().await;
        // A concurrent set for the same line may have landed first.
        if let Some(existing) = session.find_breakpoint(&url, line) {
            return Ok(existing.info());
        }
        let result = result?;
        session.ensure_live("set breakpoint")?;

        let stored = StoredBreakpoint {
            id: result.breakpoint_id,
            url,
            line,
            locations: result.locations.iter().map(resolved).collect(),
        };
        let info = stored.info();
        tracing::debug!(session = %self.id, id = %info.id, file = %info.file, line, "Breakpoint set");
        session.breakpoints.push(stored);
        session.publish(PushMessage::BreakpointSet {
            session_id: self.id.clone(),
            breakpoint: info.clone(),
        });
        Ok(info)
    }

    pub async fn remove_breakpoint(&self, id: &str) -> Result<()> {
        self.wait_settled().await;

        let client = {
            let session = self.lock().await;
            session.ensure_live("remove breakpoint")?;
            if !session.breakpoints.iter().any(|bp| bp.id == id) {
                return Err(Error::BreakpointNotFound(id.to_string()));
            }
            session.connection()?
        };

        client.remove_breakpoint(id).await?;

        let mut session = self.lock().await;
        if let Some(pos) = session.breakpoints.iter().position(|bp| bp.id == id) {
            session.breakpoints.remove(pos);
            session.publish(PushMessage::BreakpointRemoved {
                session_id: self.id.clone(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Issue one step/continue request from a pause
    ///
    /// The acknowledgment moves the session to `resumed` unless a pause or
    /// resume event already superseded the pause it was issued from.
    pub async fn step(&self, kind: StepKind) -> Result<SessionStatus> {
        self.wait_settled().await;

        let (client, generation) = {
            let session = self.lock().await;
            session.ensure_paused(kind.action())?;
            (session.connection()?, session.pause_generation)
        };

        let sent = match kind {
            StepKind::Over => client.step_over().await,
            StepKind::Into => client.step_into().await,
            StepKind::Out => client.step_out().await,
            StepKind::Continue => client.resume().await,
        };

        let mut session = self.lock().await;
        match sent {
            Ok(()) => {}
            // The script ran to its end and the bridge let go of the runtime.
            Err(Error::ConnectionLost(_)) if session.detaching => {}
            Err(e) => return Err(e),
        }
        if session.status == SessionStatus::Paused && session.pause_generation == generation {
            session.pause = None;
            session.set_status(SessionStatus::Resumed);
        }
        Ok(session.status)
    }

    /// Ask a running script to pause; the pause event does the transition
    pub async fn pause(&self) -> Result<()> {
        self.wait_settled().await;

        let client = {
            let session = self.lock().await;
            if !matches!(session.status, SessionStatus::Running | SessionStatus::Resumed) {
                return Err(Error::invalid_state("pause", session.status));
            }
            session.connection()?
        };
        client.pause().await
    }

    /// Evaluate in the paused top frame, or globally when not paused
    pub async fn evaluate(&self, expression: &str) -> Result<EvaluateResult> {
        self.wait_settled().await;

        let (client, frame) = {
            let session = self.lock().await;
            session.ensure_live("evaluate")?;
            (session.connection()?, session.top_frame().map(|f| f.call_frame_id.clone()))
        };

        let reply = match frame {
            Some(frame) => client.evaluate_on_call_frame(&frame, expression).await?,
            None => client.evaluate(expression).await?,
        };
        Ok(evaluate_result(reply))
    }

    /// Properties of the named scope (`local`, `global`, ...) in the top frame
    pub async fn read_variables(&self, scope: &str) -> Result<Vec<VariableInfo>> {
        self.wait_settled().await;

        let (client, object_id) = {
            let session = self.lock().await;
            session.ensure_paused("read variables")?;
            let object_id = session
                .top_frame()
                .and_then(|frame| frame.scope_chain.iter().find(|s| s.scope_type == scope))
                .and_then(|s| s.object.object_id.clone())
                .ok_or_else(|| Error::ScopeNotFound(scope.to_string()))?;
            (session.connection()?, object_id)
        };

        let properties = client.get_properties(&object_id).await?;
        Ok(properties
            .into_iter()
            .map(|prop| {
                let value = prop.value.unwrap_or_default();
                VariableInfo {
                    name: prop.name,
                    value: value.value.clone().unwrap_or_else(|| Value::String(value.display())),
                    type_name: value.object_type.clone(),
                    description: value.description,
                }
            })
            .collect())
    }

    /// Terminate the runtime and release everything the session owns
    ///
    /// Returns once the process is gone. Safe on any state; a terminal
    /// session keeps its status and only has leftovers released.
    pub async fn stop(&self) -> SessionStatus {
        let process = {
            let mut session = self.lock().await;
            let process = session.process.take();
            if session.status.is_terminal() {
                session.release();
            } else {
                tracing::info!(session = %self.id, "Stopping session");
                session.finish(SessionStatus::Stopped, None);
            }
            process
        };

        if let Some(mut process) = process {
            let exit = process.terminate().await;
            let mut session = self.lock().await;
            if session.exit.is_none() {
                session.exit = exit;
            }
        }
        self.status()
    }

    async fn on_disconnected(&self, reason: String) {
        let exit_watch = {
            let session = self.lock().await;
            if session.status.is_terminal() || session.detaching {
                return;
            }
            session.process.as_ref().map(ProcessHandle::exit_watch)
        };

        let exited = match exit_watch {
            Some(mut watch) => match tokio::time::timeout(DISCONNECT_GRACE, watch.wait_for(Option::is_some)).await {
                Ok(Ok(info)) => *info,
                _ => None,
            },
            None => None,
        };

        let mut session = self.lock().await;
        match exited {
            Some(info) => session.on_exit(info),
            None if !session.status.is_terminal() => {
                session.finish(SessionStatus::Crashed, Some(Failure::ConnectionLost(reason)))
            }
            None => {}
        }
    }
}

fn evaluate_result(reply: inspector::EvaluateResult) -> EvaluateResult {
    let object = reply.result;
    EvaluateResult {
        value: object
            .value
            .or_else(|| object.unserializable_value.map(Value::String))
            .unwrap_or(Value::Null),
        value_type: object.object_type,
        description: object.description,
        exception: reply.exception_details.map(|d| d.message()),
    }
}

/// Apply session events in arrival order until nothing more can change
async fn pump(session: Arc<SessionHandle>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Disconnected(reason) => {
                tracing::debug!(session = %session.id, %reason, "Inspector disconnected");
                session.on_disconnected(reason).await;
            }
            other => session.lock().await.apply(other),
        }
        if session.lock().await.is_finished() {
            break;
        }
    }
    tracing::debug!(session = %session.id, "Session event pump finished");
}

/// Connect to the inspector, enable it, then forward its events
async fn attach(
    target: ConnectTarget,
    mut exited: watch::Receiver<Option<ExitInfo>>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let host = target.host.as_str();
    let port = target.port;
    let timeout = target.request_timeout;

    let connected = tokio::select! {
        result = inspector::connect_with_retry(&target.policy, port, move |_| {
            InspectorClient::connect(host, port, timeout)
        }) => result,
        _ = exited.wait_for(Option::is_some) => {
            tracing::debug!(port, "Runtime exited before the inspector was reachable");
            return;
        }
    };

    let client = match connected {
        Ok(client) => client,
        Err(e) => {
            let _ = events.send(SessionEvent::ConnectFailed(e));
            return;
        }
    };

    // Subscribe before enabling so no early event is missed; the events
    // queue up until Connected has been delivered.
    let mut subscription = client.subscribe(SUBSCRIBED_EVENTS);
    if let Err(e) = client.enable_domains().await {
        client.close();
        let _ = events.send(SessionEvent::ConnectFailed(e));
        return;
    }

    let client = Arc::new(client);
    if events.send(SessionEvent::Connected(Arc::clone(&client))).is_err() {
        client.close();
        return;
    }

    while let Some(event) = subscription.recv().await {
        if events.send(SessionEvent::Inspector(event)).is_err() {
            return;
        }
    }
    let reason = client
        .close_reason()
        .unwrap_or_else(|| "connection closed".to_string());
    let _ = events.send(SessionEvent::Disconnected(reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::broadcast::Subscription;
    use crate::daemon::script::ScriptStore;
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        session: DebugSession,
        status: watch::Receiver<SessionStatus>,
        observer: Subscription,
    }

    fn fixture(break_on_start: bool, console_capacity: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let script = ScriptStore::new(dir.path()).create("let a = 1;\n").unwrap();
        let broadcaster = Arc::new(Broadcaster::new(64));
        let observer = broadcaster.subscribe();
        let (session, status) = DebugSession::new(
            "s1".to_string(),
            script,
            None,
            break_on_start,
            console_capacity,
            broadcaster,
        );
        Fixture {
            _dir: dir,
            session,
            status,
            observer,
        }
    }

    fn drain(observer: &mut Subscription) -> Vec<PushMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = observer.rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn paused_event(line: u32) -> SessionEvent {
        SessionEvent::Inspector(InspectorEvent {
            method: events::PAUSED.to_string(),
            params: json!({
                "reason": "other",
                "hitBreakpoints": ["bp-1"],
                "callFrames": [{
                    "callFrameId": "cf-0",
                    "functionName": "main",
                    "url": "",
                    "location": {"scriptId": "7", "lineNumber": line, "columnNumber": 4},
                    "scopeChain": [{"type": "local", "object": {"type": "object", "objectId": "scope-1"}}]
                }]
            }),
        })
    }

    fn resumed_event() -> SessionEvent {
        SessionEvent::Inspector(InspectorEvent {
            method: events::RESUMED.to_string(),
            params: json!({}),
        })
    }

    #[test]
    fn test_console_buffer_keeps_last_n() {
        let mut buffer = ConsoleBuffer::new(3);
        assert!(buffer.is_empty());
        for n in 0..5 {
            buffer.push(ConsoleMessage {
                kind: "stdout".to_string(),
                text: n.to_string(),
                timestamp: Utc::now(),
            });
        }

        assert_eq!(buffer.len(), 3);
        assert!(!buffer.is_empty());
        let texts: Vec<_> = buffer.tail(10).into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["2", "3", "4"]);
        let texts: Vec<_> = buffer.tail(2).into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["3", "4"]);
    }

    #[test]
    fn test_output_lines_are_buffered_and_pushed_in_order() {
        let mut fx = fixture(false, 100);
        for line in ["a", "b\r"] {
            fx.session.apply(SessionEvent::Output {
                stream: OutputStream::Stdout,
                line: line.to_string(),
            });
        }

        let texts: Vec<_> = fx.session.console.tail(10).into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["a", "b"]);

        let pushed: Vec<_> = drain(&mut fx.observer)
            .into_iter()
            .filter_map(|m| match m {
                PushMessage::Console { message, .. } => Some((message.kind, message.text)),
                _ => None,
            })
            .collect();
        assert_eq!(pushed, vec![("stdout".into(), "a".into()), ("stdout".into(), "b".into())]);
    }

    #[test]
    fn test_entry_pause_is_swallowed_without_break_on_start() {
        let mut fx = fixture(false, 100);
        fx.session.apply(paused_event(0));

        assert_eq!(fx.session.status, SessionStatus::Launching);
        assert!(fx.session.pause.is_none());
        assert!(drain(&mut fx.observer).is_empty());
    }

    #[test]
    fn test_pause_and_resume_transitions() {
        let mut fx = fixture(true, 100);
        fx.session.apply(SessionEvent::Inspector(InspectorEvent {
            method: events::SCRIPT_PARSED.to_string(),
            params: json!({"scriptId": "7", "url": "file:///tmp/app.js"}),
        }));
        fx.session.apply(paused_event(2));

        assert_eq!(*fx.status.borrow(), SessionStatus::Paused);
        let location = fx.session.detail(0).pause_location.unwrap();
        assert_eq!(location.file, "/tmp/app.js");
        assert_eq!(location.line, 3);
        assert_eq!(location.column, 5);
        assert_eq!(location.function_name, "main");

        fx.session.apply(resumed_event());
        assert_eq!(fx.session.status, SessionStatus::Running);
        assert!(fx.session.detail(0).pause_location.is_none());

        let kinds: Vec<_> = drain(&mut fx.observer)
            .into_iter()
            .map(|m| serde_json::to_value(m).unwrap()["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kinds, vec!["status", "paused", "status", "resumed"]);
    }

    #[test]
    fn test_nonzero_exit_crashes_and_releases_script() {
        let mut fx = fixture(false, 100);
        let script = fx.session.script_path.clone();
        assert!(script.exists());

        fx.session.apply(SessionEvent::ProcessExited(ExitInfo {
            code: Some(1),
            success: false,
        }));

        assert_eq!(fx.session.status, SessionStatus::Crashed);
        assert!(!script.exists());
        let detail = fx.session.detail(5);
        assert_eq!(detail.exit_code, Some(1));
        assert!(detail.ended_at.is_some());
        assert_eq!(detail.error.as_deref(), Some("runtime exited with code 1"));
    }

    #[test]
    fn test_events_after_terminal_state_are_ignored() {
        let mut fx = fixture(true, 100);
        fx.session.finish(SessionStatus::Stopped, None);
        drain(&mut fx.observer);

        fx.session.apply(paused_event(1));
        fx.session.apply(SessionEvent::ProcessExited(ExitInfo {
            code: Some(137),
            success: false,
        }));

        assert_eq!(fx.session.status, SessionStatus::Stopped);
        assert!(drain(&mut fx.observer).is_empty());
        assert!(fx.session.is_finished());
    }

    #[test]
    fn test_unreachable_failure_surfaces_as_launch_error() {
        let failure = Failure::from(&Error::DebuggerUnreachable { port: 9229, attempts: 5 });
        assert!(matches!(
            failure.launch_error(),
            Error::DebuggerUnreachable { port: 9229, attempts: 5 }
        ));
        assert!(matches!(Failure::Exited(Some(2)).launch_error(), Error::LaunchFailure(_)));
    }
}
