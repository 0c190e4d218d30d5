//! Protocol detection: raw bytes in, normalized envelope out.
//!
//! The registry holds an ordered list of adapters and hands a raw message to
//! the first one whose [`Adapter::can_handle`] returns `true`. Detection is a
//! cheap shape sniff (leading `{`, the `"jsonrpc": "2.0"` marker and the
//! `method` string) so claiming never costs a full decode; the claimed adapter
//! then decodes the body, which can still fail.
//!
//! Both supported families speak JSON-RPC 2.0, so responses (no `method`) are
//! claimable by either. Register the primary family (MCP) first.

use std::fmt;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::jsonrpc::{JsonRpcMessage, RequestId};

/// Method prefixes owned by MCP
const MCP_METHOD_PREFIXES: &[&str] = &[
    "tools/",
    "resources/",
    "prompts/",
    "notifications/",
    "completion/",
    "logging/",
    "sampling/",
    "roots/",
    "elicitation/",
];

/// Bare MCP methods without a family prefix
const MCP_METHODS: &[&str] = &["initialize", "ping"];

/// Method prefixes owned by Agent2Agent
const A2A_METHOD_PREFIXES: &[&str] = &["message/", "tasks/", "agent/"];

// ============================================================================
// Envelope types
// ============================================================================

/// Which way a message travels relative to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Caller to gateway
    Inbound,
    /// Gateway to caller
    Outbound,
}

/// A message exactly as received. Immutable once built.
#[derive(Debug, Clone)]
pub struct RawMessage {
    payload: Bytes,
    received_at_ms: u64,
    direction: Direction,
    size_bytes: usize,
}

impl RawMessage {
    /// Wrap a payload, stamping the receive time
    pub fn new(payload: impl Into<Bytes>, direction: Direction) -> Self {
        let payload = payload.into();
        let received_at_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        Self {
            size_bytes: payload.len(),
            payload,
            received_at_ms,
            direction,
        }
    }

    /// Inbound message shorthand
    pub fn inbound(payload: impl Into<Bytes>) -> Self {
        Self::new(payload, Direction::Inbound)
    }

    /// Outbound message shorthand
    pub fn outbound(payload: impl Into<Bytes>) -> Self {
        Self::new(payload, Direction::Outbound)
    }

    /// Raw bytes
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload as UTF-8, if it is valid UTF-8
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Milliseconds since the Unix epoch at receive time
    #[must_use]
    pub fn received_at_ms(&self) -> u64 {
        self.received_at_ms
    }

    /// Direction of travel
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Payload size
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}

/// Supported protocol families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolFamily {
    /// Model Context Protocol
    Mcp,
    /// Agent2Agent
    A2a,
}

impl ProtocolFamily {
    /// Lowercase wire name, also the permission prefix
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mcp => "mcp",
            Self::A2a => "a2a",
        }
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON-RPC message shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Has `id` and `method`
    Request,
    /// Has `method`, no `id`
    Notification,
    /// Has `result`
    Response,
    /// Has `error`
    Error,
}

/// Outcome state carried by the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Request awaiting an answer
    Pending,
    /// Successful response or fire-and-forget notification
    Ok,
    /// Error response
    Error,
}

/// Normalized envelope, produced once per raw message by one adapter
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    /// Family of the adapter that produced it
    pub protocol: ProtocolFamily,
    /// Request / notification / response / error
    pub kind: MessageKind,
    /// Copied from the raw message
    pub direction: Direction,
    /// Short human label, e.g. `tools/call yfinance__quote`
    pub label: String,
    /// JSON-RPC id, when present
    pub rpc_id: Option<RequestId>,
    /// Pending / ok / error
    pub status: MessageStatus,
    /// JSON-RPC error code for error responses
    pub error_code: Option<i32>,
    /// Hex SHA-256 of the raw payload
    pub payload_digest: Option<String>,
    /// Method for requests and notifications
    pub method: Option<String>,
    /// Object the method acts on (tool name, resource uri, task id)
    pub target: Option<String>,
    /// Fully decoded message
    pub decoded: Option<JsonRpcMessage>,
}

/// Registry outcome for one raw message
#[derive(Debug, Clone)]
pub enum Detection {
    /// An adapter claimed and decoded the message
    Parsed(ParsedMessage),
    /// An adapter claimed the message but could not decode it
    Malformed {
        /// Family that claimed it
        protocol: ProtocolFamily,
    },
    /// No adapter claimed the message
    Unclassified,
}

// ============================================================================
// Adapters
// ============================================================================

/// Model Context Protocol adapter (primary family)
#[derive(Debug, Clone, Copy, Default)]
pub struct McpAdapter;

/// Agent2Agent adapter (fallback family, classified but not routed)
#[derive(Debug, Clone, Copy, Default)]
pub struct A2aAdapter;

impl McpAdapter {
    fn claims_method(method: &str) -> bool {
        MCP_METHODS.contains(&method) || MCP_METHOD_PREFIXES.iter().any(|p| method.starts_with(p))
    }

    fn target(method: &str, params: Option<&Value>) -> Option<String> {
        let key = match method {
            "tools/call" | "prompts/get" => "name",
            "resources/read" | "resources/subscribe" | "resources/unsubscribe" => "uri",
            _ => return None,
        };
        params?.get(key)?.as_str().map(str::to_string)
    }
}

impl A2aAdapter {
    fn claims_method(method: &str) -> bool {
        A2A_METHOD_PREFIXES.iter().any(|p| method.starts_with(p))
    }

    fn target(method: &str, params: Option<&Value>) -> Option<String> {
        let params = params?;
        if method.starts_with("tasks/") {
            return params.get("id")?.as_str().map(str::to_string);
        }
        params
            .get("message")?
            .get("messageId")?
            .as_str()
            .map(str::to_string)
    }
}

/// Closed set of adapters, dispatched by `match`
#[derive(Debug, Clone, Copy)]
pub enum Adapter {
    /// MCP
    Mcp(McpAdapter),
    /// A2A
    A2a(A2aAdapter),
}

impl Adapter {
    /// Family this adapter produces
    #[must_use]
    pub fn protocol(&self) -> ProtocolFamily {
        match self {
            Self::Mcp(_) => ProtocolFamily::Mcp,
            Self::A2a(_) => ProtocolFamily::A2a,
        }
    }

    /// Shape-only check: no decoding, no side effects
    #[must_use]
    pub fn can_handle(&self, raw: &RawMessage) -> bool {
        let Some(shape) = raw.as_str().and_then(sniff) else {
            return false;
        };
        match (self, shape.method) {
            // Responses carry no method; whichever family is asked first takes them.
            (_, None) => true,
            (Self::Mcp(_), Some(method)) => McpAdapter::claims_method(method),
            (Self::A2a(_), Some(method)) => A2aAdapter::claims_method(method),
        }
    }

    /// Decode the body. `None` when the body is malformed.
    #[must_use]
    pub fn parse(&self, raw: &RawMessage) -> Option<ParsedMessage> {
        let protocol = self.protocol();
        let decoded: JsonRpcMessage = match serde_json::from_slice(raw.payload()) {
            Ok(message) => message,
            Err(e) => {
                debug!(protocol = %protocol, error = %e, "Body rejected after shape check");
                return None;
            }
        };

        let (kind, status, error_code) = match &decoded {
            JsonRpcMessage::Request(_) => (MessageKind::Request, MessageStatus::Pending, None),
            JsonRpcMessage::Notification(_) => {
                (MessageKind::Notification, MessageStatus::Ok, None)
            }
            JsonRpcMessage::Response(r) => match (&r.result, &r.error) {
                (_, Some(err)) => (MessageKind::Error, MessageStatus::Error, Some(err.code)),
                (Some(_), None) => (MessageKind::Response, MessageStatus::Ok, None),
                // Neither result nor error: not a JSON-RPC message at all
                (None, None) => return None,
            },
        };

        let method = decoded.method().map(str::to_string);
        let target = method.as_deref().and_then(|m| match self {
            Self::Mcp(_) => McpAdapter::target(m, decoded.params()),
            Self::A2a(_) => A2aAdapter::target(m, decoded.params()),
        });
        let label = match (&method, &target, error_code) {
            (Some(m), Some(t), _) => format!("{m} {t}"),
            (Some(m), None, _) => m.clone(),
            (None, _, Some(code)) => format!("error {code}"),
            (None, _, None) => "response".to_string(),
        };

        Some(ParsedMessage {
            protocol,
            kind,
            direction: raw.direction(),
            label,
            rpc_id: decoded.id().cloned(),
            status,
            error_code,
            payload_digest: Some(hex::encode(Sha256::digest(raw.payload()))),
            method,
            target,
            decoded: Some(decoded),
        })
    }

    /// One-line description for logs
    #[must_use]
    pub fn summarize(&self, parsed: &ParsedMessage, raw: &RawMessage) -> String {
        let arrow = match parsed.direction {
            Direction::Inbound => "->",
            Direction::Outbound => "<-",
        };
        let id = parsed
            .rpc_id
            .as_ref()
            .map(|id| format!(" #{id}"))
            .unwrap_or_default();
        format!(
            "{arrow} [{}] {}{id} ({} B)",
            self.protocol(),
            parsed.label,
            raw.size_bytes()
        )
    }
}

/// Cheap view of the message head
struct Shape<'a> {
    method: Option<&'a str>,
}

/// Accept only JSON objects carrying the `"jsonrpc": "2.0"` marker.
fn sniff(payload: &str) -> Option<Shape<'_>> {
    if !payload.trim_start().starts_with('{') {
        return None;
    }
    if top_level_string(payload, "jsonrpc")? != "2.0" {
        return None;
    }
    Some(Shape {
        method: top_level_string(payload, "method"),
    })
}

/// Value of the `"key": "<value>"` member of the outermost object, without
/// decoding. Keys inside nested objects and arrays are skipped.
fn top_level_string<'a>(payload: &'a str, key: &str) -> Option<&'a str> {
    let bytes = payload.as_bytes();
    let mut depth = 0usize;
    let mut expect_key = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let end = i + 1 + string_end(&bytes[i + 1..])?;
                let text = &payload[i + 1..end];
                i = end + 1;
                if depth == 1 && expect_key {
                    expect_key = false;
                    if text == key {
                        let rest = payload[i..].trim_start().strip_prefix(':')?.trim_start();
                        let value = rest.strip_prefix('"')?;
                        return Some(&value[..string_end(value.as_bytes())?]);
                    }
                }
                continue;
            }
            b'{' => {
                depth += 1;
                expect_key = depth == 1;
            }
            b'[' => depth += 1,
            b'}' | b']' => depth = depth.checked_sub(1)?,
            b',' if depth == 1 => expect_key = true,
            _ => {}
        }
        i += 1;
    }
    None
}

/// Offset of the closing quote of a string body, honoring backslash escapes
fn string_end(body: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < body.len() {
        match body[i] {
            b'\\' => i += 2,
            b'"' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

// ============================================================================
// Registry
// ============================================================================

/// Ordered adapter list; registration order is priority order
#[derive(Debug, Clone)]
pub struct AdapterRegistry {
    adapters: Vec<Adapter>,
}

impl AdapterRegistry {
    /// Empty registry (classifies nothing)
    #[must_use]
    pub fn empty() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    /// MCP first, then A2A
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Adapter::Mcp(McpAdapter));
        registry.register(Adapter::A2a(A2aAdapter));
        registry
    }

    /// Append an adapter at the lowest priority
    pub fn register(&mut self, adapter: Adapter) {
        self.adapters.push(adapter);
    }

    /// Registered adapters in priority order
    #[must_use]
    pub fn adapters(&self) -> &[Adapter] {
        &self.adapters
    }

    /// Hand `raw` to the first adapter that claims it
    #[must_use]
    pub fn detect(&self, raw: &RawMessage) -> Detection {
        let Some(adapter) = self.adapters.iter().find(|a| a.can_handle(raw)) else {
            return Detection::Unclassified;
        };
        match adapter.parse(raw) {
            Some(parsed) => Detection::Parsed(parsed),
            None => Detection::Malformed {
                protocol: adapter.protocol(),
            },
        }
    }

    /// Summarize with the adapter that produced `parsed`
    #[must_use]
    pub fn summarize(&self, parsed: &ParsedMessage, raw: &RawMessage) -> String {
        self.adapters
            .iter()
            .find(|a| a.protocol() == parsed.protocol)
            .map_or_else(
                || format!("[{}] {}", parsed.protocol, parsed.label),
                |a| a.summarize(parsed, raw),
            )
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(text: &str) -> RawMessage {
        RawMessage::inbound(text.to_string())
    }

    fn parsed(detection: Detection) -> ParsedMessage {
        match detection {
            Detection::Parsed(p) => p,
            other => panic!("expected parsed message, got {other:?}"),
        }
    }

    #[test]
    fn tools_call_is_claimed_by_mcp_with_target() {
        let registry = AdapterRegistry::default();
        let msg = raw(
            r#"{"jsonrpc":"2.0","id":7,"method":"tools/call","params":{"name":"yfinance__quote","arguments":{}}}"#,
        );

        let p = parsed(registry.detect(&msg));

        assert_eq!(p.protocol, ProtocolFamily::Mcp);
        assert_eq!(p.kind, MessageKind::Request);
        assert_eq!(p.status, MessageStatus::Pending);
        assert_eq!(p.method.as_deref(), Some("tools/call"));
        assert_eq!(p.target.as_deref(), Some("yfinance__quote"));
        assert_eq!(p.label, "tools/call yfinance__quote");
        assert_eq!(p.rpc_id, Some(RequestId::Number(7)));
        assert_eq!(p.payload_digest.as_ref().map(String::len), Some(64));
    }

    #[test]
    fn a2a_method_falls_through_to_a2a() {
        let registry = AdapterRegistry::default();
        let msg = raw(r#"{"jsonrpc":"2.0","id":"t1","method":"tasks/get","params":{"id":"task-9"}}"#);

        let p = parsed(registry.detect(&msg));

        assert_eq!(p.protocol, ProtocolFamily::A2a);
        assert_eq!(p.target.as_deref(), Some("task-9"));
    }

    #[test]
    fn non_jsonrpc_is_unclassified() {
        let registry = AdapterRegistry::default();
        assert!(matches!(registry.detect(&raw("hello")), Detection::Unclassified));
        assert!(matches!(
            registry.detect(&raw(r#"{"jsonrpc":"1.0","method":"ping"}"#)),
            Detection::Unclassified
        ));
        assert!(matches!(
            registry.detect(&raw(r#"{"jsonrpc":"2.0","id":1,"method":"custom/thing"}"#)),
            Detection::Unclassified
        ));
    }

    #[test]
    fn claimed_but_broken_body_is_malformed() {
        let registry = AdapterRegistry::default();
        // Passes the shape check, fails the decode (truncated).
        let msg = raw(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list""#);

        assert!(matches!(
            registry.detect(&msg),
            Detection::Malformed {
                protocol: ProtocolFamily::Mcp
            }
        ));
    }

    #[test]
    fn response_without_result_or_error_is_malformed() {
        let registry = AdapterRegistry::default();
        let msg = raw(r#"{"jsonrpc":"2.0","id":1}"#);
        assert!(matches!(registry.detect(&msg), Detection::Malformed { .. }));
    }

    #[test]
    fn first_registered_adapter_wins_for_ambiguous_responses() {
        // GIVEN: a bare response, claimable by both families
        let msg = raw(r#"{"jsonrpc":"2.0","id":3,"result":{}}"#);

        // WHEN: the fallback family is registered first
        let mut reversed = AdapterRegistry::empty();
        reversed.register(Adapter::A2a(A2aAdapter));
        reversed.register(Adapter::Mcp(McpAdapter));

        // THEN: registration order decides the claimant
        assert_eq!(parsed(reversed.detect(&msg)).protocol, ProtocolFamily::A2a);
        assert_eq!(
            parsed(AdapterRegistry::default().detect(&msg)).protocol,
            ProtocolFamily::Mcp
        );
    }

    #[test]
    fn error_response_records_code() {
        let registry = AdapterRegistry::default();
        let msg = raw(r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"nope"}}"#);

        let p = parsed(registry.detect(&msg));

        assert_eq!(p.kind, MessageKind::Error);
        assert_eq!(p.status, MessageStatus::Error);
        assert_eq!(p.error_code, Some(-32601));
        assert_eq!(p.label, "error -32601");
    }

    #[test]
    fn empty_registry_classifies_nothing() {
        let registry = AdapterRegistry::empty();
        let msg = raw(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
        assert!(matches!(registry.detect(&msg), Detection::Unclassified));
    }

    #[test]
    fn summarize_includes_direction_label_and_size() {
        let registry = AdapterRegistry::default();
        let msg = raw(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#);
        let p = parsed(registry.detect(&msg));

        let line = registry.summarize(&p, &msg);

        assert_eq!(line, format!("-> [mcp] tools/list #1 ({} B)", msg.size_bytes()));
    }

    #[test]
    fn sniff_tolerates_whitespace_around_colon() {
        assert_eq!(
            top_level_string(r#"{ "jsonrpc" : "2.0", "method" :  "ping" }"#, "method"),
            Some("ping")
        );
        assert_eq!(top_level_string(r#"{"jsonrpc":"2.0"}"#, "method"), None);
    }

    #[test]
    fn sniff_ignores_keys_nested_below_the_top_level() {
        let body = r#"{"params":{"name":"web__fetch","arguments":{"method":"GET","h":["a\"b",{"method":"x"}]}},"jsonrpc":"2.0","id":1,"method":"tools/call"}"#;
        assert_eq!(top_level_string(body, "method"), Some("tools/call"));
        assert_eq!(
            top_level_string(r#"{"jsonrpc":"2.0","params":{"method":"tasks/get"}}"#, "method"),
            None
        );
        assert_eq!(top_level_string(r#"{"note":"\"method\": \"x\"","jsonrpc":"2.0"}"#, "method"), None);
    }

    #[test]
    fn params_before_method_with_nested_method_key_stays_mcp() {
        let registry = AdapterRegistry::default();
        for nested in ["GET", "tasks/get"] {
            let msg = raw(&format!(
                r#"{{"params":{{"name":"web__fetch","arguments":{{"method":"{nested}"}}}},"jsonrpc":"2.0","id":1,"method":"tools/call"}}"#
            ));

            let p = parsed(registry.detect(&msg));

            assert_eq!(p.protocol, ProtocolFamily::Mcp);
            assert_eq!(p.kind, MessageKind::Request);
            assert_eq!(p.method.as_deref(), Some("tools/call"));
            assert_eq!(p.target.as_deref(), Some("web__fetch"));
        }
    }
}
