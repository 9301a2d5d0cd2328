//! Mock inspector runtime for integration testing
//!
//! Stands in for `node --inspect-brk=HOST:PORT script.js` so the bridge can
//! be exercised without a real runtime. It serves `/json/list` and the
//! inspector WebSocket on the debug port, holds execution until
//! `Runtime.runIfWaitingForDebugger`, and interprets a tiny line-oriented
//! subset of JavaScript:
//!
//! - `console.log(a, b)` (also `info`, `warn`, `error`, `debug`)
//! - `let x = expr`, `const`, `var` and plain `x = expr`
//! - `debugger`
//! - `Atomics.wait(..., ms)` sleeps for `ms`
//! - `throw new Error("msg")` exits with code 1
//! - `process.exit(n)`
//! - `inspector.close()` (or `require("inspector").close()`) drops the
//!   debugger connection and keeps running
//!
//! Expressions are literals, identifiers and `+`. Each line holds at most
//! one statement.
//!
//! Extra flags before the inspect flag:
//! - `--no-listen`: never open the debug port

use std::path::PathBuf;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const SCRIPT_ID: &str = "1";
const LOCAL_SCOPE: &str = "scope-local";
const GLOBAL_SCOPE: &str = "scope-global";

type Sink = SplitSink<WebSocketStream<TcpStream>, Message>;

struct Args {
    host: String,
    port: u16,
    script: PathBuf,
    no_listen: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut inspect = None;
    let mut script = None;
    let mut no_listen = false;

    for arg in std::env::args().skip(1) {
        if let Some(addr) = arg.strip_prefix("--inspect-brk=") {
            inspect = Some(addr.to_string());
        } else if arg == "--no-listen" {
            no_listen = true;
        } else if arg.starts_with("--") {
            // Unknown runtime flags are accepted and ignored
        } else if script.is_none() {
            script = Some(PathBuf::from(arg));
        }
    }

    let inspect = inspect.ok_or("missing --inspect-brk=HOST:PORT")?;
    let (host, port) = inspect
        .rsplit_once(':')
        .ok_or_else(|| format!("bad inspect address '{}'", inspect))?;
    let port = port
        .parse()
        .map_err(|_| format!("bad inspect port '{}'", port))?;

    Ok(Args {
        host: host.to_string(),
        port,
        script: script.ok_or("missing script path")?,
        no_listen,
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("mock_inspector: {}", e);
            std::process::exit(9);
        }
    };

    let source = match std::fs::read_to_string(&args.script) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Error: Cannot find module '{}': {}", args.script.display(), e);
            std::process::exit(1);
        }
    };

    if args.no_listen {
        tokio::time::sleep(Duration::from_secs(60)).await;
        return;
    }

    let listener = match TcpListener::bind((args.host.as_str(), args.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Starting inspector on {}:{} failed: {}", args.host, args.port, e);
            std::process::exit(12);
        }
    };

    let target_id = uuid::Uuid::new_v4().to_string();
    let ws_url = format!("ws://{}:{}/{}", args.host, args.port, target_id);
    let script_path = args
        .script
        .canonicalize()
        .unwrap_or_else(|_| args.script.clone());
    let script_url = format!("file://{}", script_path.display().to_string().replace(' ', "%20"));

    eprintln!("Debugger listening on {}", ws_url);
    eprintln!("For help, see: https://nodejs.org/en/docs/inspector");

    let (sockets_tx, mut sockets_rx) = mpsc::unbounded_channel();
    let target = json!([{
        "description": "node.js instance",
        "id": target_id,
        "title": script_path.display().to_string(),
        "type": "node",
        "url": script_url,
        "webSocketDebuggerUrl": ws_url,
    }]);
    tokio::spawn(accept_loop(listener, target, sockets_tx));

    let Some(socket) = sockets_rx.recv().await else {
        std::process::exit(1);
    };
    eprintln!("Debugger attached.");

    let (sink, mut stream) = socket.split();
    let (messages_tx, messages_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        if messages_tx.send(value).is_err() {
                            break;
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    let mut runtime = Runtime::new(&source, script_path, script_url, sink);
    let code = runtime.run(messages_rx).await;
    std::process::exit(code);
}

/// Serve discovery over HTTP and hand WebSocket upgrades to the runtime
async fn accept_loop(
    listener: TcpListener,
    target: Value,
    sockets: mpsc::UnboundedSender<WebSocketStream<TcpStream>>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        let mut head = [0u8; 16];
        let mut seen = 0;
        for _ in 0..50 {
            seen = stream.peek(&mut head).await.unwrap_or(0);
            if seen >= 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let head = String::from_utf8_lossy(&head[..seen]).to_string();

        if head.starts_with("GET /json") {
            let target = target.clone();
            tokio::spawn(serve_http(stream, target));
        } else if let Ok(socket) = tokio_tungstenite::accept_async(stream).await {
            // Only the first debugger is ever served
            let _ = sockets.send(socket);
        }
    }
}

async fn serve_http(mut stream: TcpStream, target: Value) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }

    let request = String::from_utf8_lossy(&request);
    let path = request.split_whitespace().nth(1).unwrap_or("/");
    let (status, body) = match path {
        "/json" | "/json/list" => ("200 OK", target.to_string()),
        "/json/version" => (
            "200 OK",
            json!({"Browser": "mock_inspector", "Protocol-Version": "1.1"}).to_string(),
        ),
        _ => ("404 Not Found", "unknown path".to_string()),
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json; charset=UTF-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

// === Script model ===

#[derive(Debug, Clone, PartialEq)]
enum JsValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

impl JsValue {
    fn display(&self) -> String {
        match self {
            JsValue::Undefined => "undefined".to_string(),
            JsValue::Null => "null".to_string(),
            JsValue::Bool(b) => b.to_string(),
            JsValue::Number(n) => format_number(*n),
            JsValue::Str(s) => s.clone(),
        }
    }

    fn as_number(&self) -> f64 {
        match self {
            JsValue::Number(n) => *n,
            JsValue::Bool(true) => 1.0,
            JsValue::Bool(false) | JsValue::Null => 0.0,
            JsValue::Undefined => f64::NAN,
            JsValue::Str(s) => s.trim().parse().unwrap_or(f64::NAN),
        }
    }

    fn remote(&self) -> Value {
        match self {
            JsValue::Undefined => json!({"type": "undefined"}),
            JsValue::Null => json!({"type": "object", "subtype": "null", "value": null}),
            JsValue::Bool(b) => json!({"type": "boolean", "value": b}),
            JsValue::Number(n) if n.is_finite() => {
                json!({"type": "number", "value": number_json(*n), "description": format_number(*n)})
            }
            JsValue::Number(n) => {
                json!({"type": "number", "unserializableValue": format_number(*n), "description": format_number(*n)})
            }
            JsValue::Str(s) => json!({"type": "string", "value": s}),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            JsValue::Undefined => "undefined",
            JsValue::Null => "object",
            JsValue::Bool(_) => "boolean",
            JsValue::Number(_) => "number",
            JsValue::Str(_) => "string",
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn number_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

#[derive(Debug, Clone)]
enum Statement {
    Console { method: String, args: Vec<String> },
    Assign { name: String, expr: String },
    Debugger,
    Sleep(u64),
    Throw(String),
    Exit(i32),
    CloseInspector,
    /// Something runnable the mock does not model
    Opaque,
}

#[derive(Debug, Clone)]
struct Line {
    indent: u32,
    statement: Option<Statement>,
}

fn parse_line(raw: &str) -> Line {
    let indent = (raw.len() - raw.trim_start().len()) as u32;
    let text = raw.trim().trim_end_matches(';').trim();

    let statement = if text.is_empty() || text.starts_with("//") || text == "}" || text == "{" {
        None
    } else if let Some(rest) = text.strip_prefix("console.") {
        match rest.split_once('(') {
            Some((method, args)) if args.ends_with(')') => Some(Statement::Console {
                method: method.to_string(),
                args: split_top_level(&args[..args.len() - 1], ',')
                    .into_iter()
                    .filter(|a| !a.trim().is_empty())
                    .collect(),
            }),
            _ => Some(Statement::Opaque),
        }
    } else if text == "debugger" {
        Some(Statement::Debugger)
    } else if let Some(rest) = text.strip_prefix("Atomics.wait(") {
        let ms = rest
            .trim_end_matches(')')
            .rsplit(',')
            .next()
            .and_then(|ms| ms.trim().parse().ok())
            .unwrap_or(0);
        Some(Statement::Sleep(ms))
    } else if let Some(rest) = text.strip_prefix("throw ") {
        Some(Statement::Throw(rest.to_string()))
    } else if is_inspector_close(text) {
        Some(Statement::CloseInspector)
    } else if let Some(rest) = text.strip_prefix("process.exit(") {
        Some(Statement::Exit(rest.trim_end_matches(')').trim().parse().unwrap_or(0)))
    } else {
        let decl = ["let ", "const ", "var "]
            .iter()
            .find_map(|kw| text.strip_prefix(kw))
            .unwrap_or(text);
        match decl.split_once('=') {
            Some((name, expr))
                if is_identifier(name.trim()) && !expr.starts_with('=') =>
            {
                Some(Statement::Assign {
                    name: name.trim().to_string(),
                    expr: expr.trim().to_string(),
                })
            }
            _ => Some(Statement::Opaque),
        }
    };

    Line { indent, statement }
}

fn is_inspector_close(text: &str) -> bool {
    matches!(
        text.strip_suffix(".close()"),
        Some("inspector" | "require(\"inspector\")" | "require('inspector')")
    )
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

/// Split on `sep` outside of quotes and parentheses
fn split_top_level(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote = None;
    let mut depth = 0i32;

    for c in s.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' | '`' => quote = Some(c),
                '(' => depth += 1,
                ')' => depth -= 1,
                c if c == sep && depth == 0 => {
                    parts.push(std::mem::take(&mut current));
                    continue;
                }
                _ => {}
            },
        }
        current.push(c);
    }
    parts.push(current);
    parts
}

fn unquote(s: &str) -> Option<&str> {
    let first = s.chars().next()?;
    if matches!(first, '"' | '\'' | '`') && s.len() >= 2 && s.ends_with(first) {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

// === Runtime ===

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    /// Held until runIfWaitingForDebugger
    Waiting,
    Paused,
    Running,
    Finished,
}

struct Breakpoint {
    id: String,
    url: String,
    requested: u32,
    resolved: Option<usize>,
}

/// What to send once a command's reply is out
enum After {
    Nothing,
    Events(Vec<Value>),
    Resume { step: bool },
    EntryPause,
}

struct Runtime {
    lines: Vec<Line>,
    script_path: PathBuf,
    script_url: String,
    sink: Option<Sink>,
    vars: Vec<(String, JsValue)>,
    pc: usize,
    mode: Mode,
    breakpoints: Vec<Breakpoint>,
    /// Line the last resume happened at; it runs once without pausing
    resumed_at: Option<usize>,
    step_pending: bool,
    pause_requested: bool,
    busy_until: Option<Instant>,
}

impl Runtime {
    fn new(source: &str, script_path: PathBuf, script_url: String, sink: Sink) -> Self {
        Self {
            lines: source.lines().map(parse_line).collect(),
            script_path,
            script_url,
            sink: Some(sink),
            vars: Vec::new(),
            pc: 0,
            mode: Mode::Waiting,
            breakpoints: Vec::new(),
            resumed_at: None,
            step_pending: false,
            pause_requested: false,
            busy_until: None,
        }
    }

    /// Run to completion; returns the exit code
    async fn run(&mut self, mut messages: mpsc::UnboundedReceiver<Value>) -> i32 {
        loop {
            match self.mode {
                Mode::Waiting | Mode::Paused | Mode::Finished => {
                    if self.mode == Mode::Finished && self.sink.is_none() {
                        return 0;
                    }
                    match messages.recv().await {
                        Some(message) => self.handle(message).await,
                        None => self.detach(),
                    }
                }
                Mode::Running => {
                    loop {
                        match messages.try_recv() {
                            Ok(message) => self.handle(message).await,
                            Err(mpsc::error::TryRecvError::Empty) => break,
                            Err(mpsc::error::TryRecvError::Disconnected) => {
                                if self.sink.is_some() {
                                    self.detach();
                                }
                                break;
                            }
                        }
                    }
                    if self.mode != Mode::Running {
                        continue;
                    }

                    if let Some(until) = self.busy_until {
                        if self.sink.is_some() {
                            tokio::select! {
                                message = messages.recv() => match message {
                                    Some(message) => self.handle(message).await,
                                    None => self.detach(),
                                },
                                _ = tokio::time::sleep_until(until) => self.busy_until = None,
                            }
                        } else {
                            tokio::time::sleep_until(until).await;
                            self.busy_until = None;
                        }
                        continue;
                    }

                    if let Some(code) = self.execute_next().await {
                        return code;
                    }
                }
            }
        }
    }

    /// The debugger went away; run on unobserved
    fn detach(&mut self) {
        self.sink = None;
        self.breakpoints.clear();
        self.step_pending = false;
        self.pause_requested = false;
        if matches!(self.mode, Mode::Waiting | Mode::Paused) {
            self.mode = Mode::Running;
        }
    }

    async fn send(&mut self, message: Value) {
        if let Some(sink) = self.sink.as_mut() {
            if sink.send(Message::Text(message.to_string())).await.is_err() {
                self.sink = None;
            }
        }
    }

    async fn event(&mut self, method: &str, params: Value) {
        self.send(json!({"method": method, "params": params})).await;
    }

    fn next_statement(&self, from: usize) -> Option<usize> {
        (from..self.lines.len()).find(|&i| self.lines[i].statement.is_some())
    }

    async fn handle(&mut self, message: Value) {
        let id = message["id"].as_i64().unwrap_or(0);
        let method = message["method"].as_str().unwrap_or("").to_string();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let (reply, after) = self.dispatch(&method, &params);
        match reply {
            Ok(result) => self.send(json!({"id": id, "result": result})).await,
            Err((code, text)) => {
                self.send(json!({"id": id, "error": {"code": code, "message": text}}))
                    .await
            }
        }

        match after {
            After::Nothing => {}
            After::Events(events) => {
                for event in events {
                    self.send(event).await;
                }
            }
            After::Resume { step } => {
                self.resumed_at = Some(self.pc);
                self.step_pending = step;
                self.mode = Mode::Running;
                self.event("Debugger.resumed", json!({})).await;
            }
            After::EntryPause => match self.next_statement(0) {
                Some(line) => {
                    self.pc = line;
                    self.pause("Break on start", Vec::new()).await;
                }
                None => self.mode = Mode::Running,
            },
        }
    }

    fn dispatch(&mut self, method: &str, params: &Value) -> (Result<Value, (i64, String)>, After) {
        let not_paused = || (-32000, "Can only perform operation while paused.".to_string());

        match method {
            "Runtime.enable" => (
                Ok(json!({})),
                After::Events(vec![json!({
                    "method": "Runtime.executionContextCreated",
                    "params": {"context": {"id": 1, "origin": "", "name": "mock_inspector[main]"}},
                })]),
            ),
            "Debugger.enable" => (
                Ok(json!({"debuggerId": "mock-debugger"})),
                After::Events(vec![json!({
                    "method": "Debugger.scriptParsed",
                    "params": {
                        "scriptId": SCRIPT_ID,
                        "url": self.script_url,
                        "startLine": 0,
                        "startColumn": 0,
                        "endLine": self.lines.len(),
                        "endColumn": 0,
                        "executionContextId": 1,
                        "hash": "",
                    },
                })]),
            ),
            "Runtime.runIfWaitingForDebugger" => {
                let after = if self.mode == Mode::Waiting {
                    After::EntryPause
                } else {
                    After::Nothing
                };
                (Ok(json!({})), after)
            }
            "Debugger.setBreakpointByUrl" => (self.set_breakpoint(params), After::Nothing),
            "Debugger.removeBreakpoint" => {
                let id = params["breakpointId"].as_str().unwrap_or("");
                self.breakpoints.retain(|bp| bp.id != id);
                (Ok(json!({})), After::Nothing)
            }
            "Debugger.resume" | "Debugger.stepOut" => {
                if self.mode != Mode::Paused {
                    return (Err(not_paused()), After::Nothing);
                }
                (Ok(json!({})), After::Resume { step: false })
            }
            "Debugger.stepOver" | "Debugger.stepInto" => {
                if self.mode != Mode::Paused {
                    return (Err(not_paused()), After::Nothing);
                }
                (Ok(json!({})), After::Resume { step: true })
            }
            "Debugger.pause" => {
                if self.mode == Mode::Running {
                    self.pause_requested = true;
                }
                (Ok(json!({})), After::Nothing)
            }
            "Runtime.evaluate" | "Debugger.evaluateOnCallFrame" => {
                let expression = params["expression"].as_str().unwrap_or("");
                let result = match self.evaluate(expression) {
                    Ok(value) => json!({"result": value.remote()}),
                    Err(message) => {
                        let error = json!({
                            "type": "object",
                            "subtype": "error",
                            "className": "ReferenceError",
                            "description": format!("ReferenceError: {}", message),
                        });
                        json!({
                            "result": error,
                            "exceptionDetails": {
                                "exceptionId": 1,
                                "text": "Uncaught",
                                "lineNumber": 0,
                                "columnNumber": 0,
                                "exception": error,
                            },
                        })
                    }
                };
                (Ok(result), After::Nothing)
            }
            "Runtime.getProperties" => {
                let result = match params["objectId"].as_str() {
                    Some(LOCAL_SCOPE) => Ok(json!({
                        "result": self
                            .vars
                            .iter()
                            .map(|(name, value)| json!({"name": name, "value": value.remote()}))
                            .collect::<Vec<_>>(),
                    })),
                    Some(GLOBAL_SCOPE) => Ok(json!({
                        "result": [{
                            "name": "globalThis",
                            "value": {"type": "object", "className": "Object", "description": "Object", "objectId": GLOBAL_SCOPE},
                        }],
                    })),
                    _ => Err((-32000, "Could not find object with given id".to_string())),
                };
                (result, After::Nothing)
            }
            other => (
                Err((-32601, format!("'{}' wasn't found", other))),
                After::Nothing,
            ),
        }
    }

    fn set_breakpoint(&mut self, params: &Value) -> Result<Value, (i64, String)> {
        let url = params["url"].as_str().unwrap_or("").to_string();
        let line = params["lineNumber"]
            .as_u64()
            .ok_or((-32602, "lineNumber: integer value expected".to_string()))? as u32;

        if self.breakpoints.iter().any(|bp| bp.requested == line && bp.url == url) {
            return Err((-32000, "Breakpoint at specified location already exists.".to_string()));
        }

        let resolved = if url == self.script_url {
            self.next_statement(line as usize)
        } else {
            None
        };
        let id = format!("1:{}:0:{}", line, url);
        self.breakpoints.push(Breakpoint {
            id: id.clone(),
            url,
            requested: line,
            resolved,
        });

        let locations: Vec<Value> = resolved
            .map(|line| vec![self.location(line)])
            .unwrap_or_default();
        Ok(json!({"breakpointId": id, "locations": locations}))
    }

    fn location(&self, line: usize) -> Value {
        json!({
            "scriptId": SCRIPT_ID,
            "lineNumber": line,
            "columnNumber": self.lines.get(line).map_or(0, |l| l.indent),
        })
    }

    async fn pause(&mut self, reason: &str, hit_breakpoints: Vec<String>) {
        self.mode = Mode::Paused;
        self.pause_requested = false;
        self.step_pending = false;
        let frame = json!({
            "callFrameId": "frame-0",
            "functionName": "",
            "location": self.location(self.pc),
            "url": self.script_url,
            "scopeChain": [
                {"type": "local", "object": {"type": "object", "className": "Object", "objectId": LOCAL_SCOPE}},
                {"type": "global", "object": {"type": "object", "className": "global", "objectId": GLOBAL_SCOPE}},
            ],
            "this": {"type": "undefined"},
        });
        self.event(
            "Debugger.paused",
            json!({"callFrames": [frame], "reason": reason, "hitBreakpoints": hit_breakpoints}),
        )
        .await;
    }

    /// Execute one statement, pausing first when something asks to;
    /// returns an exit code once the process should end
    async fn execute_next(&mut self) -> Option<i32> {
        let Some(pc) = self.next_statement(self.pc) else {
            self.mode = Mode::Finished;
            if self.sink.is_some() {
                eprintln!("Waiting for the debugger to disconnect...");
                return None;
            }
            return Some(0);
        };
        self.pc = pc;

        let statement = self.lines[pc].statement.clone()?;
        let fresh = self.resumed_at != Some(pc);
        if self.sink.is_some() && fresh {
            let hits: Vec<String> = self
                .breakpoints
                .iter()
                .filter(|bp| bp.resolved == Some(pc))
                .map(|bp| bp.id.clone())
                .collect();
            if self.pause_requested || self.step_pending || !hits.is_empty() {
                self.pause("other", hits).await;
                return None;
            }
            if matches!(statement, Statement::Debugger) {
                self.pause("other", Vec::new()).await;
                return None;
            }
        }
        self.resumed_at = None;
        self.pc = pc + 1;

        match statement {
            Statement::Console { method, args } => {
                let mut values = Vec::new();
                for arg in &args {
                    match self.evaluate(arg) {
                        Ok(value) => values.push(value),
                        Err(message) => return Some(self.uncaught(pc, &format!("ReferenceError: {}", message)).await),
                    }
                }
                let text = values.iter().map(JsValue::display).collect::<Vec<_>>().join(" ");
                if matches!(method.as_str(), "error" | "warn" | "trace") {
                    eprintln!("{}", text);
                } else {
                    println!("{}", text);
                }
                let args: Vec<Value> = values.iter().map(JsValue::remote).collect();
                self.event(
                    "Runtime.consoleAPICalled",
                    json!({
                        "type": method,
                        "args": args,
                        "executionContextId": 1,
                        "timestamp": chrono::Utc::now().timestamp_millis() as f64,
                    }),
                )
                .await;
            }
            Statement::Assign { name, expr } => match self.evaluate(&expr) {
                Ok(value) => match self.vars.iter_mut().find(|(n, _)| *n == name) {
                    Some((_, slot)) => *slot = value,
                    None => self.vars.push((name, value)),
                },
                Err(message) => return Some(self.uncaught(pc, &format!("ReferenceError: {}", message)).await),
            },
            Statement::Sleep(ms) => {
                self.busy_until = Some(Instant::now() + Duration::from_millis(ms));
            }
            Statement::Throw(expr) => {
                let message = match expr.strip_prefix("new ").and_then(|e| e.split_once('(')) {
                    Some((class, arg)) => {
                        let arg = self
                            .evaluate(arg.trim_end_matches(')'))
                            .map(|v| v.display())
                            .unwrap_or_default();
                        format!("{}: {}", class, arg)
                    }
                    None => format!(
                        "Uncaught {}",
                        self.evaluate(&expr).map(|v| v.display()).unwrap_or_default()
                    ),
                };
                return Some(self.uncaught(pc, &message).await);
            }
            Statement::Exit(code) => return Some(code),
            Statement::CloseInspector => {
                if let Some(mut sink) = self.sink.take() {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                }
                self.detach();
            }
            Statement::Debugger | Statement::Opaque => {}
        }
        None
    }

    /// Report an uncaught exception; the process then exits with 1
    async fn uncaught(&mut self, line: usize, message: &str) -> i32 {
        let exception = json!({
            "type": "object",
            "subtype": "error",
            "className": message.split(':').next().unwrap_or("Error"),
            "description": message,
        });
        self.event(
            "Runtime.exceptionThrown",
            json!({
                "timestamp": chrono::Utc::now().timestamp_millis() as f64,
                "exceptionDetails": {
                    "exceptionId": 1,
                    "text": "Uncaught",
                    "lineNumber": line,
                    "columnNumber": 0,
                    "scriptId": SCRIPT_ID,
                    "url": self.script_url,
                    "exception": exception,
                },
            }),
        )
        .await;
        eprintln!("{}:{}", self.script_path.display(), line + 1);
        eprintln!("\n{}", message);
        1
    }

    fn evaluate(&self, expression: &str) -> Result<JsValue, String> {
        let terms = split_top_level(expression.trim(), '+');
        let mut values = Vec::with_capacity(terms.len());
        for term in &terms {
            values.push(self.evaluate_term(term.trim())?);
        }

        let mut iter = values.into_iter();
        let first = iter.next().unwrap_or(JsValue::Undefined);
        Ok(iter.fold(first, |acc, value| match (&acc, &value) {
            (JsValue::Str(_), _) | (_, JsValue::Str(_)) => {
                JsValue::Str(format!("{}{}", acc.display(), value.display()))
            }
            _ => JsValue::Number(acc.as_number() + value.as_number()),
        }))
    }

    fn evaluate_term(&self, term: &str) -> Result<JsValue, String> {
        if let Some(inner) = term.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
            return self.evaluate(inner);
        }
        if let Some(s) = unquote(term) {
            return Ok(JsValue::Str(s.to_string()));
        }
        if let Some(rest) = term.strip_prefix("typeof ") {
            let value = self.evaluate_term(rest.trim()).unwrap_or(JsValue::Undefined);
            return Ok(JsValue::Str(value.type_name().to_string()));
        }
        match term {
            "" | "undefined" => return Ok(JsValue::Undefined),
            "null" => return Ok(JsValue::Null),
            "true" => return Ok(JsValue::Bool(true)),
            "false" => return Ok(JsValue::Bool(false)),
            "NaN" => return Ok(JsValue::Number(f64::NAN)),
            _ => {}
        }
        if let Ok(n) = term.parse::<f64>() {
            return Ok(JsValue::Number(n));
        }
        self.vars
            .iter()
            .find(|(name, _)| name == term)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| format!("{} is not defined", term))
    }
}
