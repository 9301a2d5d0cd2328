//! Inspector protocol message types
//!
//! The subset of the V8 inspector protocol (Runtime, Debugger and Console
//! domains) that the bridge needs. Line and column numbers on the wire are
//! 0-based.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// === Base Protocol Messages ===

/// Outgoing request
#[derive(Debug, Clone, Serialize)]
pub struct RequestMessage<'a> {
    pub id: i64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

/// Error object carried by a failed reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolErrorBody {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Any incoming message: a reply has an `id`, an event has only a `method`
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ProtocolErrorBody>,
}

/// Unsolicited protocol event
#[derive(Debug, Clone, PartialEq)]
pub struct InspectorEvent {
    pub method: String,
    pub params: Value,
}

/// Entry in `GET /json/list`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub url: String,
    pub web_socket_debugger_url: Option<String>,
}

// === Domain Types ===

/// A mirror of a runtime value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    #[serde(rename = "type", default)]
    pub object_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unserializable_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
}

impl RemoteObject {
    /// Human-readable rendering, the way a console would print it
    pub fn display(&self) -> String {
        match &self.value {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => self
                .unserializable_value
                .clone()
                .or_else(|| self.description.clone())
                .unwrap_or_else(|| self.object_type.clone()),
        }
    }
}

/// Location in a parsed script
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub script_id: String,
    pub line_number: u32,
    #[serde(default)]
    pub column_number: Option<u32>,
}

/// One entry of a call frame's scope chain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    #[serde(rename = "type")]
    pub scope_type: String,
    pub object: RemoteObject,
    #[serde(default)]
    pub name: Option<String>,
}

/// Stack frame at a pause point
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    pub call_frame_id: String,
    #[serde(default)]
    pub function_name: String,
    pub location: Location,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub scope_chain: Vec<Scope>,
}

/// `Debugger.paused` parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedParams {
    pub call_frames: Vec<CallFrame>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub hit_breakpoints: Vec<String>,
}

/// `Debugger.scriptParsed` parameters (fields we use)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptParsedParams {
    pub script_id: String,
    #[serde(default)]
    pub url: String,
}

/// `Runtime.consoleAPICalled` parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleApiCalledParams {
    #[serde(rename = "type")]
    pub call_type: String,
    #[serde(default)]
    pub args: Vec<RemoteObject>,
}

impl ConsoleApiCalledParams {
    /// Arguments joined with spaces, like `console.log` prints them
    pub fn text(&self) -> String {
        self.args
            .iter()
            .map(RemoteObject::display)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// `Runtime.exceptionThrown` parameters (fields we use)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionThrownParams {
    pub exception_details: ExceptionDetails,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub exception: Option<RemoteObject>,
}

impl ExceptionDetails {
    pub fn message(&self) -> String {
        match &self.exception {
            Some(obj) => obj.display(),
            None => self.text.clone(),
        }
    }
}

/// `Debugger.setBreakpointByUrl` result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointResult {
    pub breakpoint_id: String,
    #[serde(default)]
    pub locations: Vec<Location>,
}

/// `Debugger.breakpointResolved` parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointResolvedParams {
    pub breakpoint_id: String,
    pub location: Location,
}

/// `Runtime.evaluate` / `Debugger.evaluateOnCallFrame` result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
    pub result: RemoteObject,
    #[serde(default)]
    pub exception_details: Option<ExceptionDetails>,
}

/// `Runtime.getProperties` result
#[derive(Debug, Clone, Deserialize)]
pub struct GetPropertiesResult {
    #[serde(default)]
    pub result: Vec<PropertyDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(default)]
    pub value: Option<RemoteObject>,
}

// === Event names ===

pub mod events {
    pub const PAUSED: &str = "Debugger.paused";
    pub const RESUMED: &str = "Debugger.resumed";
    pub const SCRIPT_PARSED: &str = "Debugger.scriptParsed";
    pub const CONSOLE_API_CALLED: &str = "Runtime.consoleAPICalled";
    pub const EXCEPTION_THROWN: &str = "Runtime.exceptionThrown";
    pub const BREAKPOINT_RESOLVED: &str = "Debugger.breakpointResolved";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_paused() {
        let params = json!({
            "reason": "other",
            "hitBreakpoints": ["1:2:0:file:///tmp/a.js"],
            "callFrames": [{
                "callFrameId": "cf-0",
                "functionName": "",
                "url": "file:///tmp/a.js",
                "location": {"scriptId": "42", "lineNumber": 2, "columnNumber": 0},
                "scopeChain": [
                    {"type": "local", "object": {"type": "object", "objectId": "scope-1"}},
                    {"type": "global", "object": {"type": "object", "objectId": "scope-2"}}
                ],
                "this": {"type": "undefined"}
            }]
        });

        let paused: PausedParams = serde_json::from_value(params).unwrap();
        assert_eq!(paused.call_frames.len(), 1);
        let frame = &paused.call_frames[0];
        assert_eq!(frame.location.line_number, 2);
        assert_eq!(frame.scope_chain[1].scope_type, "global");
        assert_eq!(frame.scope_chain[0].object.object_id.as_deref(), Some("scope-1"));
    }

    #[test]
    fn test_console_text_joins_args() {
        let params: ConsoleApiCalledParams = serde_json::from_value(json!({
            "type": "log",
            "args": [
                {"type": "string", "value": "sum"},
                {"type": "number", "value": 2, "description": "2"},
                {"type": "number", "unserializableValue": "NaN", "description": "NaN"},
                {"type": "object", "className": "Object", "description": "Object", "objectId": "o1"}
            ],
            "executionContextId": 1,
            "timestamp": 1.0
        }))
        .unwrap();

        assert_eq!(params.text(), "sum 2 NaN Object");
    }

    #[test]
    fn test_incoming_reply_vs_event() {
        let reply: IncomingMessage =
            serde_json::from_str(r#"{"id":3,"result":{"breakpointId":"x","locations":[]}}"#).unwrap();
        assert_eq!(reply.id, Some(3));
        assert!(reply.method.is_none());

        let event: IncomingMessage =
            serde_json::from_str(r#"{"method":"Debugger.resumed","params":{}}"#).unwrap();
        assert!(event.id.is_none());
        assert_eq!(event.method.as_deref(), Some(events::RESUMED));
    }
}
