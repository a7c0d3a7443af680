//! Outbound ACP JSON-RPC: session updates, results and errors with `_meta` stamping.

use std::fmt;
use std::sync::Arc;

use kimi_claw_transport::{FrameSink, ObsEvent, ObsSeverity, ObsSink};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Number, Value};

use crate::bridge_errors::BridgeError;
use crate::observability::sanitize_obs_mapping_payload;
use crate::payload_fields::{as_object, trimmed_str};

pub const JSON_RPC_VERSION: &str = "2.0";
pub const META_DEBUG_INDEX_KEY: &str = "_debug_index";
pub const OBS_COMPONENT: &str = "connector";
pub const DEFAULT_GATEWAY_HOP: &str = "openclaw_gateway->plugin";
const DEFAULT_UPDATE_LOCATION: &str = "AcpGatewayBridge.sendSessionUpdate";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
/// JSON-RPC request id as sent by the peer: a number or a string.
pub enum RpcId {
    Number(Number),
    Text(String),
}

impl RpcId {
    /// Accepts only string and number ids; anything else means "notification".
    pub fn from_value(value: Option<&Value>) -> Option<Self> {
        match value? {
            Value::Number(number) => Some(Self::Number(number.clone())),
            Value::String(text) => Some(Self::Text(text.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(number) => Value::Number(number.clone()),
            Self::Text(text) => Value::String(text.clone()),
        }
    }
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(number) => write!(f, "{number}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

impl From<&str> for RpcId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for RpcId {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    #[default]
    Normal,
    Cron,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Cron => "cron",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// Per-update `_meta` inputs; the debug index is stamped at send time.
pub struct UpdateMeta {
    pub request_id: Option<RpcId>,
    pub message_type: MessageType,
    pub timestamp: Option<i64>,
}

impl UpdateMeta {
    pub fn request(request_id: &RpcId) -> Self {
        Self {
            request_id: Some(request_id.clone()),
            ..Self::default()
        }
    }

    pub fn optional_request(request_id: Option<&RpcId>) -> Self {
        Self {
            request_id: request_id.cloned(),
            ..Self::default()
        }
    }

    pub fn cron(request_id: &str, timestamp: Option<i64>) -> Self {
        Self {
            request_id: Some(RpcId::from(request_id)),
            message_type: MessageType::Cron,
            timestamp,
        }
    }

    pub fn with_timestamp(mut self, timestamp: Option<i64>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Gateway frame an update was mapped from, recorded as an observability mapping.
pub struct ObsContext {
    pub before: Value,
    pub hop: &'static str,
    pub location: &'static str,
}

impl ObsContext {
    pub fn gateway(before: Value, location: &'static str) -> Self {
        Self {
            before,
            hop: DEFAULT_GATEWAY_HOP,
            location,
        }
    }
}

fn detect_protocol_error(value: &Value) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };
    let has_error = |object: &Map<String, Value>| {
        object.get("error").is_some_and(|error| !error.is_null())
            || object.get("ok") == Some(&Value::Bool(false))
    };
    has_error(object) || as_object(object.get("payload")).is_some_and(has_error)
}

fn merge_meta(value: Option<Value>, meta: Map<String, Value>) -> Value {
    match value {
        Some(Value::Object(mut object)) => {
            let mut merged = match object.remove("_meta") {
                Some(Value::Object(existing)) => existing,
                _ => Map::new(),
            };
            merged.extend(meta);
            object.insert("_meta".to_string(), Value::Object(merged));
            Value::Object(object)
        }
        None | Some(Value::Null) => json!({"_meta": meta}),
        Some(other) => json!({"value": other, "_meta": meta}),
    }
}

/// Writes ACP frames to the remote endpoint and owns the monotonic `_debug_index`.
pub struct AcpOutbound {
    sink: Arc<dyn FrameSink>,
    obs: Option<Arc<dyn ObsSink>>,
    forward_thinking: bool,
    forward_tool_calls: bool,
    meta_index: u64,
}

impl AcpOutbound {
    pub fn new(
        sink: Arc<dyn FrameSink>,
        obs: Option<Arc<dyn ObsSink>>,
        forward_thinking: bool,
        forward_tool_calls: bool,
    ) -> Self {
        Self {
            sink,
            obs,
            forward_thinking,
            forward_tool_calls,
            meta_index: 0,
        }
    }

    pub fn forward_thinking(&self) -> bool {
        self.forward_thinking
    }

    pub fn forward_tool_calls(&self) -> bool {
        self.forward_tool_calls
    }

    pub fn obs_enabled(&self) -> bool {
        self.obs.is_some()
    }

    pub fn emit_obs(&self, event: ObsEvent) {
        if let Some(obs) = &self.obs {
            obs.emit(event);
        }
    }

    pub fn next_index(&mut self) -> u64 {
        self.meta_index += 1;
        self.meta_index
    }

    pub fn peek_next_index(&self) -> u64 {
        self.meta_index + 1
    }

    fn should_forward(&self, update: &Value) -> bool {
        match trimmed_str(update.get("sessionUpdate")) {
            Some("agent_thought_chunk") => self.forward_thinking,
            Some("tool_call" | "tool_call_update") => self.forward_tool_calls,
            _ => true,
        }
    }

    /// Sends a `session/update` notification unless filtered by the forward switches.
    pub fn send_session_update(
        &mut self,
        session_id: &str,
        update: Value,
        meta: &UpdateMeta,
        obs: Option<ObsContext>,
    ) {
        if !self.should_forward(&update) {
            return;
        }
        let index = self.next_index();
        let mut meta_object = Map::new();
        meta_object.insert(META_DEBUG_INDEX_KEY.to_string(), json!(index));
        meta_object.insert("messageType".to_string(), json!(meta.message_type.as_str()));
        if let Some(timestamp) = meta.timestamp {
            meta_object.insert("timestamp".to_string(), json!(timestamp));
        }
        if let (Some(request_id), MessageType::Normal) = (&meta.request_id, meta.message_type) {
            meta_object.insert("requestId".to_string(), request_id.to_value());
        }
        let session_update = trimmed_str(update.get("sessionUpdate"))
            .unwrap_or("unknown")
            .to_string();
        let payload = json!({
            "jsonrpc": JSON_RPC_VERSION,
            "method": "session/update",
            "params": {
                "sessionId": session_id,
                "update": update,
                "_meta": meta_object,
            },
        });
        if let (Some(context), Some(sink)) = (obs, self.obs.as_ref()) {
            let protocol_error = detect_protocol_error(&context.before);
            let severity = if protocol_error {
                ObsSeverity::Warn
            } else {
                ObsSeverity::Info
            };
            let mut event = ObsEvent::new(
                OBS_COMPONENT,
                "mapping",
                "mapping.gateway_stream_to_session_update",
                severity,
            )
            .with_session_id(session_id)
            .with_hop(context.hop)
            .with_location(if context.location.is_empty() {
                DEFAULT_UPDATE_LOCATION
            } else {
                context.location
            })
            .with_summary(format!(
                "gateway stream -> ACP session/update:{session_update} (meta.{META_DEBUG_INDEX_KEY}={index})"
            ))
            .with_mapping(
                sanitize_obs_mapping_payload(&context.before),
                sanitize_obs_mapping_payload(&payload),
            )
            .with_payload(json!({
                "sessionUpdate": session_update,
                "metaIndex": index,
                "protocolError": protocol_error,
            }));
            if let Some(request_id) = &meta.request_id {
                event = event.with_request_id(request_id.to_string());
            }
            sink.emit(event);
        }
        self.sink.send(payload);
    }

    fn response_meta(&mut self, id: &RpcId, session_id: Option<&str>) -> Map<String, Value> {
        let mut meta = Map::new();
        meta.insert("requestId".to_string(), id.to_value());
        meta.insert(META_DEBUG_INDEX_KEY.to_string(), json!(self.next_index()));
        if let Some(session_id) = session_id {
            meta.insert("sessionId".to_string(), json!(session_id));
        }
        meta
    }

    pub fn send_result(&mut self, id: &RpcId, result: Value, session_id: Option<&str>) {
        let meta = self.response_meta(id, session_id);
        self.sink.send(json!({
            "jsonrpc": JSON_RPC_VERSION,
            "id": id.to_value(),
            "result": merge_meta(Some(result), meta),
        }));
    }

    pub fn send_error(&mut self, id: &RpcId, error: &BridgeError, session_id: Option<&str>) {
        let meta = self.response_meta(id, session_id);
        self.sink.send(json!({
            "jsonrpc": JSON_RPC_VERSION,
            "id": id.to_value(),
            "error": {
                "code": error.code,
                "message": error.message,
                "data": merge_meta(error.data.clone(), meta),
            },
        }));
        tracing::warn!(code = error.code, message = %error.message, "acp request failed");
    }
}
