//! Shared types for the capsule host.
//!
//! JSON-RPC 2.0 message types for the capsule wire protocol, the lifecycle
//! state enum, and the tool-call result handed back to the dispatch layer.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::CapsuleError;

// ─── Protocol Constants ──────────────────────────────────────────────────────

/// JSON-RPC protocol version carried on every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Method name of the one-time startup notification a capsule must emit.
pub const HELLO_METHOD: &str = "orla.hello";

/// Method name used for every tool invocation.
pub const TOOLS_CALL_METHOD: &str = "tools/call";

// ─── Lifecycle State ─────────────────────────────────────────────────────────

/// Lifecycle state of a capsule manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapsuleState {
    Created,
    Starting,
    Ready,
    /// Reserved for in-place hot reload; no operation enters it today.
    Reloading,
    Crashed,
    Stopped,
}

impl CapsuleState {
    /// Whether `start()` is legal from this state.
    pub fn can_start(self) -> bool {
        matches!(
            self,
            CapsuleState::Created | CapsuleState::Crashed | CapsuleState::Stopped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CapsuleState::Created => "CREATED",
            CapsuleState::Starting => "STARTING",
            CapsuleState::Ready => "READY",
            CapsuleState::Reloading => "RELOADING",
            CapsuleState::Crashed => "CRASHED",
            CapsuleState::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for CapsuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message sent to a capsule's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: i64,
    pub method: String,
    pub params: serde_json::Value,
}

impl JsonRpcRequest {
    /// Build a `tools/call` request for `tool` with the caller's arguments.
    pub fn tools_call(id: i64, tool: &str, arguments: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: TOOLS_CALL_METHOD.to_string(),
            params: serde_json::json!({
                "name": tool,
                "arguments": arguments,
            }),
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Split the response into its result or its application-level error.
    ///
    /// A response carrying neither is reported as an internal error.
    pub fn into_result(self) -> Result<serde_json::Value, JsonRpcError> {
        if let Some(err) = self.error {
            return Err(err);
        }

        self.result.ok_or(JsonRpcError {
            code: error_codes::INTERNAL_ERROR,
            message: "response missing both result and error".into(),
            data: None,
        })
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// The `orla.hello` startup notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloNotification {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    pub params: HelloParams,
}

/// Payload of the `orla.hello` notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloParams {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

// ─── Inbound Classification ──────────────────────────────────────────────────

/// A decoded message from a capsule's stdout, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Hello(HelloNotification),
    Response(JsonRpcResponse),
    /// Anything else: logs, requests from the child, malformed payloads.
    Unrecognized(serde_json::Value),
}

impl InboundMessage {
    /// Classify a decoded JSON value.
    ///
    /// The handshake is matched by method name. A response must carry an
    /// integer `id` and no `method`.
    pub fn classify(value: serde_json::Value) -> Self {
        let method = value.get("method").and_then(|m| m.as_str());

        if method == Some(HELLO_METHOD) {
            return match serde_json::from_value::<HelloNotification>(value.clone()) {
                Ok(hello) => InboundMessage::Hello(hello),
                Err(_) => InboundMessage::Unrecognized(value),
            };
        }

        let has_id = value.get("id").is_some_and(|id| id.is_i64());
        if method.is_none() && has_id {
            if let Ok(response) = serde_json::from_value::<JsonRpcResponse>(value.clone()) {
                return InboundMessage::Response(response);
            }
        }

        InboundMessage::Unrecognized(value)
    }
}

// ─── Tool Call Result ────────────────────────────────────────────────────────

/// Outcome of a capsule tool call, shaped for the dispatch layer.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub tool_name: String,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl ToolCallResult {
    /// Build a result from a capsule's JSON-RPC response.
    ///
    /// An application-level JSON-RPC error becomes a failed result, not an `Err`.
    pub fn from_response(tool_name: &str, response: JsonRpcResponse, execution_time_ms: u64) -> Self {
        match response.into_result() {
            Ok(result) => Self {
                tool_name: tool_name.to_string(),
                success: true,
                result: Some(result),
                error: None,
                execution_time_ms,
            },
            Err(err) => Self {
                tool_name: tool_name.to_string(),
                success: false,
                result: None,
                error: Some(format!("[{}] {}", err.code, err.message)),
                execution_time_ms,
            },
        }
    }

    /// Build a failed result from a host-side error.
    pub fn from_error(tool_name: &str, error: &CapsuleError, execution_time_ms: u64) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            success: false,
            result: None,
            error: Some(error.to_string()),
            execution_time_ms,
        }
    }

    /// Render the payload as text: string results verbatim, anything else as JSON.
    pub fn text(&self) -> String {
        match (&self.result, &self.error) {
            (Some(serde_json::Value::String(s)), _) => s.clone(),
            (Some(value), _) => value.to_string(),
            (None, Some(err)) => err.clone(),
            (None, None) => String::new(),
        }
    }
}

// ─── Standard JSON-RPC Error Codes ───────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tools_call_request_serialization() {
        let req = JsonRpcRequest::tools_call(123, "test-tool", serde_json::json!({"arg1": "value1"}));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.starts_with(r#"{"jsonrpc":"2.0","id":123,"method":"tools/call""#));
        assert!(json.contains(r#""name":"test-tool""#));
        assert!(json.contains(r#""arguments":{"arg1":"value1"}"#));
    }

    #[test]
    fn test_response_deserialization() {
        let json = r#"{"jsonrpc":"2.0","id":123,"result":{"output":"test"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.jsonrpc, "2.0");
        assert_eq!(resp.id, 123);
        assert_eq!(resp.result.unwrap()["output"], "test");
        assert!(resp.error.is_none());
    }

    #[test]
    fn test_response_with_error() {
        let json = r#"{"jsonrpc":"2.0","id":7,"error":{"code":-32000,"message":"Test error"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "Test error");
        assert!(err.data.is_none());
    }

    #[test]
    fn test_into_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: None,
        };
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.code, error_codes::INTERNAL_ERROR);
    }

    #[test]
    fn test_hello_deserialization() {
        let json = r#"{"jsonrpc":"2.0","method":"orla.hello","params":{"name":"test-tool","version":"1.0.0","capabilities":["tools","resources"]}}"#;
        let hello: HelloNotification = serde_json::from_str(json).unwrap();
        assert_eq!(hello.method, HELLO_METHOD);
        assert_eq!(hello.params.name, "test-tool");
        assert_eq!(hello.params.version, "1.0.0");
        assert_eq!(hello.params.capabilities, vec!["tools", "resources"]);
    }

    #[test]
    fn test_classify_hello() {
        let value = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "orla.hello",
            "params": {"name": "t", "version": "0.1.0"}
        });
        match InboundMessage::classify(value) {
            InboundMessage::Hello(hello) => assert!(hello.params.capabilities.is_empty()),
            other => panic!("expected Hello, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_response() {
        let value = serde_json::json!({"jsonrpc": "2.0", "id": 4, "result": {"ok": true}});
        assert!(matches!(
            InboundMessage::classify(value),
            InboundMessage::Response(JsonRpcResponse { id: 4, .. })
        ));
    }

    #[test]
    fn test_classify_lenient_hello() {
        let no_version = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "orla.hello",
            "params": {"name": "x"}
        });
        match InboundMessage::classify(no_version) {
            InboundMessage::Hello(hello) => {
                assert_eq!(hello.params.name, "x");
                assert!(hello.params.version.is_empty());
            }
            other => panic!("expected Hello, got {other:?}"),
        }

        let no_jsonrpc = serde_json::json!({
            "method": "orla.hello",
            "params": {"name": "x", "version": "1"}
        });
        match InboundMessage::classify(no_jsonrpc) {
            InboundMessage::Hello(hello) => {
                assert!(hello.jsonrpc.is_empty());
                assert_eq!(hello.params.version, "1");
            }
            other => panic!("expected Hello, got {other:?}"),
        }

        let empty_params = serde_json::json!({"method": "orla.hello", "params": {}});
        assert!(matches!(
            InboundMessage::classify(empty_params),
            InboundMessage::Hello(_)
        ));
    }

    #[test]
    fn test_classify_response_without_jsonrpc() {
        let value = serde_json::json!({"id": 1, "result": {"ok": true}});
        match InboundMessage::classify(value) {
            InboundMessage::Response(response) => {
                assert_eq!(response.id, 1);
                assert_eq!(response.result.unwrap()["ok"], true);
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_drops_other_shapes() {
        // A request from the child has an id but also a method.
        let request = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "sampling/create"});
        assert!(matches!(InboundMessage::classify(request), InboundMessage::Unrecognized(_)));

        let string_id = serde_json::json!({"jsonrpc": "2.0", "id": "abc", "result": 1});
        assert!(matches!(InboundMessage::classify(string_id), InboundMessage::Unrecognized(_)));

        // The hello needs a params object to carry its payload.
        let hello_without_params = serde_json::json!({"jsonrpc": "2.0", "method": "orla.hello"});
        assert!(matches!(
            InboundMessage::classify(hello_without_params),
            InboundMessage::Unrecognized(_)
        ));

        assert!(matches!(
            InboundMessage::classify(serde_json::json!([1, 2, 3])),
            InboundMessage::Unrecognized(_)
        ));
    }

    #[test]
    fn test_state_can_start() {
        assert!(CapsuleState::Created.can_start());
        assert!(CapsuleState::Crashed.can_start());
        assert!(CapsuleState::Stopped.can_start());
        assert!(!CapsuleState::Starting.can_start());
        assert!(!CapsuleState::Ready.can_start());
        assert!(!CapsuleState::Reloading.can_start());
    }

    #[test]
    fn test_state_display_matches_serde() {
        let json = serde_json::to_string(&CapsuleState::Crashed).unwrap();
        assert_eq!(json, "\"CRASHED\"");
        assert_eq!(CapsuleState::Crashed.to_string(), "CRASHED");
    }

    #[test]
    fn test_tool_call_result_from_error_response() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 2,
            result: None,
            error: Some(JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        let result = ToolCallResult::from_response("calc", resp, 12);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("[-32601] Method not found"));
        assert_eq!(result.text(), "[-32601] Method not found");
    }

    #[test]
    fn test_tool_call_result_text() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 3,
            result: Some(serde_json::json!({"echoed": 3})),
            error: None,
        };
        let result = ToolCallResult::from_response("echo", resp, 1);
        assert!(result.success);
        assert_eq!(result.text(), r#"{"echoed":3}"#);

        let plain = ToolCallResult::from_response(
            "echo",
            JsonRpcResponse {
                jsonrpc: "2.0".into(),
                id: 4,
                result: Some(serde_json::json!("hello")),
                error: None,
            },
            1,
        );
        assert_eq!(plain.text(), "hello");
    }
}
