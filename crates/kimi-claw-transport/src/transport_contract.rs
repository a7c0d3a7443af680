use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Connection lifecycle published through the client's `watch` channel.
pub enum TransportState {
    Disconnected,
    Connecting,
    HandshakePending,
    Ready,
}

impl TransportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::HandshakePending => "handshake_pending",
            Self::Ready => "ready",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Events a transport reports to its consumer.
pub enum TransportEvent {
    Ready {
        connection_id: String,
    },
    Message(Value),
    Closed {
        connection_id: String,
        code: Option<u16>,
        reason: String,
    },
}

/// Outbound seam used by the bridge; implemented by transport handles and test fakes.
pub trait FrameSink: Send + Sync {
    fn is_ready(&self) -> bool;

    /// Returns true when the frame was written or buffered for delivery.
    fn send(&self, frame: Value) -> bool;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid websocket url '{url}': {message}")]
    InvalidUrl { url: String, message: String },
    #[error("invalid upgrade header '{name}': {message}")]
    InvalidHeader { name: String, message: String },
    #[error("websocket upgrade rejected with http status {status}")]
    UpgradeRejected { status: u16 },
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("transport requires an active Tokio runtime")]
    NoRuntime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObsSeverity {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
/// Structured observability record; sinks must never block or fail the caller.
pub struct ObsEvent {
    pub component: String,
    pub domain: String,
    pub name: String,
    pub severity: ObsSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hop: Option<String>,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Wire message as received, before mapping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ObsEvent {
    pub fn new(component: &str, domain: &str, name: &str, severity: ObsSeverity) -> Self {
        Self {
            component: component.to_string(),
            domain: domain.to_string(),
            name: name.to_string(),
            severity,
            hop: None,
            location: None,
            summary: None,
            request_id: None,
            session_id: None,
            before: None,
            after: None,
            payload: Value::Null,
            error: None,
        }
    }

    pub fn with_hop(mut self, hop: &str) -> Self {
        self.hop = Some(hop.to_string());
        self
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.location = Some(location.to_string());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_session_id(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn with_mapping(mut self, before: Value, after: Value) -> Self {
        self.before = Some(before);
        self.after = Some(after);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_error(mut self, error: Value) -> Self {
        self.error = Some(error);
        self
    }
}

pub trait ObsSink: Send + Sync {
    fn emit(&self, event: ObsEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What the runtime should do with the liveness watchdog after a frame.
pub enum WatchdogAction {
    Keep,
    Arm(Duration),
    Disarm,
}

#[derive(Debug, Clone, PartialEq)]
/// Side effects a protocol requests after inspecting one inbound frame.
pub struct FrameActions {
    pub send: Vec<Value>,
    pub deliver: Option<Value>,
    pub ready: bool,
    pub close: Option<(u16, String)>,
    pub watchdog: WatchdogAction,
}

impl Default for FrameActions {
    fn default() -> Self {
        Self {
            send: Vec::new(),
            deliver: None,
            ready: false,
            close: None,
            watchdog: WatchdogAction::Keep,
        }
    }
}

impl FrameActions {
    pub fn deliver(frame: Value) -> Self {
        Self {
            deliver: Some(frame),
            ..Self::default()
        }
    }

    pub fn ignore() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What the protocol wants after the socket opens.
pub enum OpenOutcome {
    Ready,
    AwaitHandshake { fallback_after: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Whether a closed connection should be retried.
pub enum ReconnectDecision {
    Retry,
    GiveUp,
}

/// Per-variant behaviour plugged into the shared reconnecting runtime.
pub trait ConnectionProtocol: Send + 'static {
    /// Name used in logs and observability `where` fields.
    fn client_kind(&self) -> &'static str;

    fn obs_hop(&self) -> &'static str;

    fn upgrade_headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn heartbeat_probe(&self) -> WsMessage;

    fn liveness_timeout(&self) -> Duration;

    /// Called by `start()`; clears any sticky failure state.
    fn on_start(&mut self) {}

    fn on_open(&mut self) -> OpenOutcome;

    /// Fired when the handshake fallback timer elapses without a challenge.
    fn on_handshake_deadline(&mut self) -> Option<Value> {
        None
    }

    fn on_frame(&mut self, frame: Value) -> FrameActions;

    fn on_closed(&mut self, _code: Option<u16>) -> ReconnectDecision {
        ReconnectDecision::Retry
    }

    fn on_connect_failed(&mut self, _error: &TransportError) -> ReconnectDecision {
        ReconnectDecision::Retry
    }
}

/// Recognises the bare text heartbeats both peers exchange outside JSON framing.
pub fn classify_text_heartbeat(raw: &str) -> Option<TextHeartbeat> {
    let normalized = raw.trim();
    if normalized.eq_ignore_ascii_case("ping") {
        Some(TextHeartbeat::Ping)
    } else if normalized.eq_ignore_ascii_case("pong") {
        Some(TextHeartbeat::Pong)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Plain-text keepalive frames that never reach the layer above.
pub enum TextHeartbeat {
    Ping,
    Pong,
}
