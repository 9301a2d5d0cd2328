//! Inspector client for communicating with a runtime's debug port
//!
//! The connection is split into a writer task (draining an outgoing queue
//! into the WebSocket) and a reader task that routes replies to their
//! pending requests by id and fans unsolicited events out to subscribers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::common::{Error, Result};

use super::types::*;

/// Timeout for a single discovery HTTP call
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(1);

/// How connection attempts are spaced after the runtime is spawned
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_secs(1),
            interval: Duration::from_secs(1),
        }
    }
}

/// Run `attempt` until it succeeds or the policy is exhausted
///
/// Fails with [`Error::DebuggerUnreachable`] after exactly
/// `policy.attempts` failed attempts.
pub async fn connect_with_retry<T, F, Fut>(policy: &RetryPolicy, port: u16, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    tokio::time::sleep(policy.initial_delay).await;

    for n in 1..=policy.attempts {
        match attempt(n).await {
            Ok(value) => {
                tracing::debug!(attempt = n, port, "Inspector connected");
                return Ok(value);
            }
            Err(e) => {
                tracing::debug!(attempt = n, port, error = %e, "Inspector not reachable yet");
            }
        }
        if n < policy.attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(Error::DebuggerUnreachable {
        port,
        attempts: policy.attempts,
    })
}

/// Look up the WebSocket URL of the first debuggable target
pub async fn discover(host: &str, port: u16) -> Result<String> {
    let url = format!("http://{}:{}/json/list", host, port);
    let client = reqwest::Client::builder()
        .timeout(DISCOVERY_TIMEOUT)
        .build()
        .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

    let targets: Vec<TargetInfo> = client
        .get(&url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| Error::ConnectionLost(format!("discovery at {} failed: {}", url, e)))?
        .json()
        .await
        .map_err(|e| Error::MalformedMessage(format!("target list: {}", e)))?;

    targets
        .into_iter()
        .find_map(|t| t.web_socket_debugger_url)
        .ok_or_else(|| Error::ConnectionLost(format!("no debuggable target listed at {}", url)))
}

/// A request awaiting its reply
struct PendingRequest {
    method: String,
    reply: oneshot::Sender<Result<Value>>,
}

/// Requests in flight, keyed by request id
///
/// Once closed, every waiter has been rejected and new entries are refused,
/// so no request can be left waiting on a dead connection.
#[derive(Default)]
struct PendingTable {
    entries: HashMap<i64, PendingRequest>,
    closed: Option<String>,
}

impl PendingTable {
    fn insert(&mut self, id: i64, method: &str, reply: oneshot::Sender<Result<Value>>) -> Result<()> {
        if let Some(reason) = &self.closed {
            return Err(Error::ConnectionLost(reason.clone()));
        }
        self.entries.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                reply,
            },
        );
        Ok(())
    }

    fn resolve(&mut self, id: i64, outcome: std::result::Result<Value, ProtocolErrorBody>) {
        match self.entries.remove(&id) {
            Some(pending) => {
                let result = outcome.map_err(|e| Error::protocol(&pending.method, &e.message));
                let _ = pending.reply.send(result);
            }
            None => tracing::debug!(id, "Reply for unknown or expired request"),
        }
    }

    fn is_idle(&self) -> bool {
        self.entries.is_empty()
    }

    fn fail_all(&mut self, reason: &str) {
        if self.closed.is_none() {
            self.closed = Some(reason.to_string());
        }
        for (id, pending) in self.entries.drain() {
            tracing::debug!(id, method = %pending.method, "Rejecting pending request");
            let _ = pending.reply.send(Err(Error::ConnectionLost(reason.to_string())));
        }
    }
}

struct Subscription {
    methods: Vec<String>,
    tx: mpsc::UnboundedSender<InspectorEvent>,
}

/// State shared with the reader task
#[derive(Default)]
struct Shared {
    pending: Mutex<PendingTable>,
    subscriptions: Mutex<Vec<Subscription>>,
    /// Woken whenever the pending table drains
    idle: Notify,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, text: &str) {
        let msg: IncomingMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed inspector message");
                return;
            }
        };

        if let Some(id) = msg.id {
            let outcome = match msg.error {
                Some(err) => Err(err),
                None => Ok(msg.result.unwrap_or(Value::Null)),
            };
            let idle = {
                let mut pending = self.pending();
                pending.resolve(id, outcome);
                pending.is_idle()
            };
            if idle {
                self.idle.notify_waiters();
            }
            return;
        }

        if let Some(method) = msg.method {
            let event = InspectorEvent {
                method,
                params: msg.params.unwrap_or(Value::Null),
            };
            // Dropped receivers unsubscribe themselves here.
            self.subscriptions().retain(|sub| {
                if sub.methods.iter().any(|m| *m == event.method) {
                    sub.tx.send(event.clone()).is_ok()
                } else {
                    !sub.tx.is_closed()
                }
            });
        }
    }

    fn shutdown(&self, reason: &str) {
        self.pending().fail_all(reason);
        // Dropping the senders ends every subscriber stream.
        self.subscriptions().clear();
    }
}

/// Inspector client for one runtime connection
pub struct InspectorClient {
    outgoing: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    next_id: AtomicI64,
    request_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl InspectorClient {
    /// Discover the target on `host:port` and connect to it
    pub async fn connect(host: &str, port: u16, request_timeout: Duration) -> Result<Self> {
        let url = discover(host, port).await?;
        Self::connect_url(&url, request_timeout).await
    }

    /// Connect to a known WebSocket URL
    pub async fn connect_url(url: &str, request_timeout: Duration) -> Result<Self> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::ConnectionLost(format!("handshake with {} failed: {}", url, e)))?;
        tracing::debug!(url, "Inspector WebSocket open");
        Ok(Self::from_stream(ws, request_timeout))
    }

    /// Build a client over an established message stream
    pub fn from_stream<S>(stream: S, request_timeout: Duration) -> Self
    where
        S: Stream<Item = std::result::Result<Message, tungstenite::Error>>
            + Sink<Message, Error = tungstenite::Error>
            + Send
            + Unpin
            + 'static,
    {
        let (mut sink, mut source) = stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let shared = Arc::new(Shared::default());

        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!(error = %e, "Inspector write failed");
                    break;
                }
                if is_close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        tracing::trace!("Inspector <<< {}", text);
                        reader_shared.dispatch(&text);
                    }
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => reader_shared.dispatch(text),
                        Err(_) => tracing::warn!("Dropping non-UTF-8 inspector frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break format!("closed by runtime ({:?})", frame.map(|f| f.code));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("read error: {}", e),
                    None => break "connection closed".to_string(),
                }
            };
            tracing::debug!(%reason, "Inspector reader finished");
            reader_shared.shutdown(&reason);
        });

        Self {
            outgoing,
            shared,
            next_id: AtomicI64::new(1),
            request_timeout,
            reader,
            writer,
        }
    }

    /// Why the connection ended, if it has
    pub fn close_reason(&self) -> Option<String> {
        self.shared.pending().closed.clone()
    }

    /// Receive every event whose method is in `methods`, in wire order
    ///
    /// The stream ends when the connection does. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self, methods: &[&str]) -> mpsc::UnboundedReceiver<InspectorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Hold the pending lock so a concurrent shutdown cannot slip between
        // the closed check and the registration.
        let pending = self.shared.pending();
        if pending.closed.is_none() {
            self.shared.subscriptions().push(Subscription {
                methods: methods.iter().map(|m| m.to_string()).collect(),
                tx,
            });
        }
        rx
    }

    /// Send a request and wait for its reply
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, method, tx)?;

        let text = serde_json::to_string(&RequestMessage {
            id,
            method,
            params: params.as_ref(),
        })?;
        tracing::trace!("Inspector >>> {}", text);

        if self.outgoing.send(Message::Text(text)).is_err() {
            self.shared.pending().entries.remove(&id);
            return Err(Error::ConnectionLost("writer stopped".to_string()));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionLost(
                self.close_reason().unwrap_or_else(|| "reply channel dropped".to_string()),
            )),
            Err(_) => {
                self.shared.pending().entries.remove(&id);
                Err(Error::RequestTimeout {
                    method: method.to_string(),
                    secs: self.request_timeout.as_secs(),
                })
            }
        }
    }

    /// Send a request and decode its result
    pub async fn request_typed<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T> {
        let result = self.request(method, params).await?;
        serde_json::from_value(result)
            .map_err(|e| Error::MalformedMessage(format!("{} result: {}", method, e)))
    }

    /// Enable the domains the bridge relies on and let the runtime start
    pub async fn enable_domains(&self) -> Result<()> {
        self.request("Runtime.enable", None).await?;
        self.request("Debugger.enable", None).await?;
        // Console is deprecated in newer runtimes; Runtime covers it.
        if let Err(e) = self.request("Console.enable", None).await {
            tracing::debug!(error = %e, "Console domain unavailable");
        }
        self.request("Runtime.runIfWaitingForDebugger", None).await?;
        Ok(())
    }

    /// Set a breakpoint by script URL (0-based line)
    pub async fn set_breakpoint_by_url(&self, url: &str, line_number: u32) -> Result<SetBreakpointResult> {
        self.request_typed(
            "Debugger.setBreakpointByUrl",
            Some(json!({ "url": url, "lineNumber": line_number, "columnNumber": 0 })),
        )
        .await
    }

    pub async fn remove_breakpoint(&self, breakpoint_id: &str) -> Result<()> {
        self.request(
            "Debugger.removeBreakpoint",
            Some(json!({ "breakpointId": breakpoint_id })),
        )
        .await?;
        Ok(())
    }

    pub async fn step_over(&self) -> Result<()> {
        self.request("Debugger.stepOver", None).await.map(drop)
    }

    pub async fn step_into(&self) -> Result<()> {
        self.request("Debugger.stepInto", None).await.map(drop)
    }

    pub async fn step_out(&self) -> Result<()> {
        self.request("Debugger.stepOut", None).await.map(drop)
    }

    pub async fn resume(&self) -> Result<()> {
        self.request("Debugger.resume", None).await.map(drop)
    }

    pub async fn pause(&self) -> Result<()> {
        self.request("Debugger.pause", None).await.map(drop)
    }

    /// Evaluate in the global context
    pub async fn evaluate(&self, expression: &str) -> Result<EvaluateResult> {
        self.request_typed(
            "Runtime.evaluate",
            Some(json!({ "expression": expression, "generatePreview": false })),
        )
        .await
    }

    /// Evaluate in the scope of a paused call frame
    pub async fn evaluate_on_call_frame(&self, call_frame_id: &str, expression: &str) -> Result<EvaluateResult> {
        self.request_typed(
            "Debugger.evaluateOnCallFrame",
            Some(json!({ "callFrameId": call_frame_id, "expression": expression })),
        )
        .await
    }

    /// Own properties of a remote object (e.g. a scope object)
    pub async fn get_properties(&self, object_id: &str) -> Result<Vec<PropertyDescriptor>> {
        let result: GetPropertiesResult = self
            .request_typed(
                "Runtime.getProperties",
                Some(json!({ "objectId": object_id, "ownProperties": true })),
            )
            .await?;
        Ok(result.result)
    }

    /// Close once every in-flight request has its reply, or after `grace`
    ///
    /// A request the runtime already acknowledged is not turned into a
    /// `ConnectionLost` by a detach racing with its reply.
    pub async fn close_when_idle(&self, grace: Duration) {
        let drained = async {
            loop {
                let notified = self.shared.idle.notified();
                let idle = self.shared.pending().is_idle();
                if idle {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(grace, drained).await.is_err() {
            tracing::debug!("Closing inspector with requests still in flight");
        }
        self.close();
    }

    /// Close the connection, rejecting anything still pending
    pub fn close(&self) {
        self.shared.shutdown("connection closed by bridge");
        let _ = self.outgoing.send(Message::Close(None));
    }
}

impl Drop for InspectorClient {
    fn drop(&mut self) {
        self.shared.shutdown("client dropped");
        self.reader.abort();
        self.writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::net::TcpListener;
    use tokio_tungstenite::WebSocketStream;

    type ServerSocket = WebSocketStream<tokio::net::TcpStream>;

    /// Start a one-connection WebSocket server running `script`
    async fn serve<F, Fut>(script: F) -> String
    where
        F: FnOnce(ServerSocket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            script(ws).await;
        });
        format!("ws://{}", addr)
    }

    async fn next_request(ws: &mut ServerSocket) -> Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    async fn reply(ws: &mut ServerSocket, body: Value) {
        ws.send(Message::Text(body.to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_replies_match_by_id() {
        let url = serve(|mut ws| async move {
            let first = next_request(&mut ws).await;
            let second = next_request(&mut ws).await;
            // Answer the later request first.
            for req in [&second, &first] {
                let expr = req["params"]["expression"].clone();
                reply(
                    &mut ws,
                    json!({"id": req["id"], "result": {"result": {"type": "string", "value": expr}}}),
                )
                .await;
            }
            let _ = ws.next().await;
        })
        .await;

        let client = InspectorClient::connect_url(&url, Duration::from_secs(5)).await.unwrap();
        let (r1, r2) = tokio::join!(client.evaluate("one"), client.evaluate("two"));

        assert_eq!(r1.unwrap().result.display(), "one");
        assert_eq!(r2.unwrap().result.display(), "two");
    }

    #[tokio::test]
    async fn test_error_reply_is_protocol_error() {
        let url = serve(|mut ws| async move {
            let req = next_request(&mut ws).await;
            reply(
                &mut ws,
                json!({"id": req["id"], "error": {"code": -32000, "message": "Breakpoint at specified location already exists."}}),
            )
            .await;
            let _ = ws.next().await;
        })
        .await;

        let client = InspectorClient::connect_url(&url, Duration::from_secs(5)).await.unwrap();
        let err = client.set_breakpoint_by_url("file:///a.js", 2).await.unwrap_err();
        match err {
            Error::ProtocolError { method, message } => {
                assert_eq!(method, "Debugger.setBreakpointByUrl");
                assert!(message.contains("already exists"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_drop_rejects_pending_with_connection_lost() {
        let url = serve(|mut ws| async move {
            let _ = next_request(&mut ws).await;
            let _ = next_request(&mut ws).await;
            drop(ws);
        })
        .await;

        let client = InspectorClient::connect_url(&url, Duration::from_secs(5)).await.unwrap();
        let (a, b) = tokio::join!(client.resume(), client.step_over());

        assert!(matches!(a, Err(Error::ConnectionLost(_))));
        assert!(matches!(b, Err(Error::ConnectionLost(_))));
        assert!(client.close_reason().is_some());
        // Later requests fail fast instead of waiting for a timeout.
        assert!(matches!(client.pause().await, Err(Error::ConnectionLost(_))));
    }

    #[tokio::test]
    async fn test_timeout_keeps_connection_usable() {
        let url = serve(|mut ws| async move {
            let _ignored = next_request(&mut ws).await;
            let req = next_request(&mut ws).await;
            reply(&mut ws, json!({"id": req["id"], "result": {}})).await;
            let _ = ws.next().await;
        })
        .await;

        let client = InspectorClient::connect_url(&url, Duration::from_millis(200)).await.unwrap();
        let err = client.resume().await.unwrap_err();
        assert!(matches!(err, Error::RequestTimeout { .. }));

        client.pause().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_rejects_in_flight_request() {
        let url = serve(|mut ws| async move {
            let _ = next_request(&mut ws).await;
            let _ = ws.next().await;
        })
        .await;

        let client = Arc::new(InspectorClient::connect_url(&url, Duration::from_secs(10)).await.unwrap());
        let waiter = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.resume().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.close();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionLost(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_when_idle_lets_in_flight_reply_land() {
        let url = serve(|mut ws| async move {
            let req = next_request(&mut ws).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            reply(&mut ws, json!({"id": req["id"], "result": {}})).await;
            let _ = ws.next().await;
        })
        .await;

        let client = Arc::new(InspectorClient::connect_url(&url, Duration::from_secs(10)).await.unwrap());
        let waiter = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.resume().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close_when_idle(Duration::from_secs(5)).await;

        assert!(waiter.await.unwrap().is_ok());
        assert!(client.close_reason().is_some());
        assert!(matches!(client.pause().await, Err(Error::ConnectionLost(_))));
    }

    #[tokio::test]
    async fn test_close_when_idle_gives_up_after_grace() {
        let url = serve(|mut ws| async move {
            let _ = next_request(&mut ws).await;
            let _ = ws.next().await;
        })
        .await;

        let client = Arc::new(InspectorClient::connect_url(&url, Duration::from_secs(10)).await.unwrap());
        let waiter = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.resume().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close_when_idle(Duration::from_millis(100)).await;

        assert!(matches!(waiter.await.unwrap(), Err(Error::ConnectionLost(_))));
    }

    #[tokio::test]
    async fn test_subscribe_filters_and_ends_on_disconnect() {
        let url = serve(|mut ws| async move {
            let req = next_request(&mut ws).await;
            reply(&mut ws, json!({"id": req["id"], "result": {}})).await;
            for method in ["Debugger.scriptParsed", "Debugger.paused", "Runtime.consoleAPICalled", "Debugger.resumed"] {
                reply(&mut ws, json!({"method": method, "params": {"m": method}})).await;
            }
            drop(ws);
        })
        .await;

        let client = InspectorClient::connect_url(&url, Duration::from_secs(5)).await.unwrap();
        let mut rx = client.subscribe(&[events::PAUSED, events::RESUMED]);
        client.request("Runtime.enable", None).await.unwrap();

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            seen.push(event.method);
        }
        assert_eq!(seen, vec!["Debugger.paused", "Debugger.resumed"]);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_policy_attempts() {
        let policy = RetryPolicy {
            attempts: 5,
            initial_delay: Duration::ZERO,
            interval: Duration::from_millis(1),
        };
        let calls = AtomicU32::new(0);

        let result: Result<()> = connect_with_retry(&policy, 9229, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::ConnectionLost("refused".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(matches!(
            result,
            Err(Error::DebuggerUnreachable { port: 9229, attempts: 5 })
        ));
    }

    #[tokio::test]
    async fn test_retry_stops_at_first_success() {
        let policy = RetryPolicy {
            attempts: 5,
            initial_delay: Duration::ZERO,
            interval: Duration::ZERO,
        };

        let result = connect_with_retry(&policy, 9229, |n| async move {
            if n < 3 {
                Err(Error::ConnectionLost("refused".into()))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }
}
