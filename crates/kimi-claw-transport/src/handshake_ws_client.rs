use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::{
    signed_at_now_ms, ConnectionProtocol, DeviceAuthParams, DeviceIdentity,
    FrameActions, OpenOutcome, TransportEvent, WsClient, WsClientConfig,
};

pub const CONNECT_REQUEST_ID: &str = "connect";
pub const CONNECT_CHALLENGE_EVENT: &str = "connect.challenge";
pub const CONNECT_CHALLENGE_WAIT: Duration = Duration::from_millis(750);
pub const HANDSHAKE_LIVENESS_TIMEOUT: Duration = Duration::from_secs(60);
pub const HANDSHAKE_REJECTED_CLOSE_CODE: u16 = 1008;
pub const GATEWAY_CLIENT_DISPLAY_NAME: &str = "kimi-bridge-connector";

const GATEWAY_ROLE: &str = "operator";
const GATEWAY_SCOPES: [&str; 1] = ["operator.admin"];

/// Gateway leg: ready only after the `connect` request is acknowledged.
pub type HandshakeWsClient = WsClient<HandshakeProtocol>;

/// Produces the `connect` request; receives the challenge nonce when one arrived.
pub trait ConnectFrameBuilder: Send {
    fn build_connect(&mut self, nonce: Option<&str>) -> Value;
}

impl<F> ConnectFrameBuilder for F
where
    F: FnMut(Option<&str>) -> Value + Send,
{
    fn build_connect(&mut self, nonce: Option<&str>) -> Value {
        self(nonce)
    }
}

#[derive(Debug, Clone)]
/// Public struct `GatewayConnectBuilder` used by the connector for the gateway handshake.
pub struct GatewayConnectBuilder {
    pub protocol: u32,
    pub client_id: String,
    pub client_mode: String,
    pub version: String,
    pub platform: String,
    pub token: Option<String>,
    pub identity: DeviceIdentity,
}

/// Node-style platform names the gateway expects (`darwin`, `win32`, `linux`, ...).
pub fn gateway_platform_name() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

impl GatewayConnectBuilder {
    pub fn connect_frame(&self, nonce: Option<&str>, signed_at_ms: u64) -> Value {
        let token = self.token.as_deref().filter(|token| !token.is_empty());
        let device = self.identity.build_auth_field(&DeviceAuthParams {
            client_id: &self.client_id,
            client_mode: &self.client_mode,
            role: GATEWAY_ROLE,
            scopes: &GATEWAY_SCOPES,
            token,
            nonce,
            signed_at_ms,
        });
        let mut params = Map::new();
        params.insert("minProtocol".to_string(), json!(self.protocol));
        params.insert("maxProtocol".to_string(), json!(self.protocol));
        params.insert(
            "client".to_string(),
            json!({
                "id": self.client_id,
                "version": self.version,
                "platform": self.platform,
                "mode": self.client_mode,
                "displayName": GATEWAY_CLIENT_DISPLAY_NAME,
            }),
        );
        params.insert("role".to_string(), json!(GATEWAY_ROLE));
        params.insert("scopes".to_string(), json!(GATEWAY_SCOPES));
        params.insert("caps".to_string(), json!(["tool-events"]));
        if let Some(token) = token {
            params.insert("auth".to_string(), json!({ "token": token }));
        }
        params.insert("device".to_string(), json!(device));
        json!({
            "type": "req",
            "id": CONNECT_REQUEST_ID,
            "method": "connect",
            "params": Value::Object(params),
        })
    }
}

impl ConnectFrameBuilder for GatewayConnectBuilder {
    fn build_connect(&mut self, nonce: Option<&str>) -> Value {
        self.connect_frame(nonce, signed_at_now_ms())
    }
}

/// Challenge/connect handshake state for one gateway socket.
pub struct HandshakeProtocol {
    builder: Box<dyn ConnectFrameBuilder>,
    connect_sent: bool,
    nonce: Option<String>,
    ready: bool,
}

impl HandshakeProtocol {
    pub fn new(builder: Box<dyn ConnectFrameBuilder>) -> Self {
        Self {
            builder,
            connect_sent: false,
            nonce: None,
            ready: false,
        }
    }

    fn take_connect(&mut self) -> Option<Value> {
        if self.connect_sent {
            return None;
        }
        self.connect_sent = true;
        Some(self.builder.build_connect(self.nonce.as_deref()))
    }

    fn on_handshake_response(&mut self, frame: &Value) -> FrameActions {
        if frame.get("ok").and_then(Value::as_bool) == Some(true) {
            self.ready = true;
            tracing::info!("handshake complete");
            return FrameActions {
                ready: true,
                ..FrameActions::default()
            };
        }
        let message = frame
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("handshake failed");
        tracing::error!(error = message, "handshake rejected");
        FrameActions {
            close: Some((
                HANDSHAKE_REJECTED_CLOSE_CODE,
                "handshake rejected".to_string(),
            )),
            ..FrameActions::default()
        }
    }
}

impl ConnectionProtocol for HandshakeProtocol {
    fn client_kind(&self) -> &'static str {
        "HandshakeWsClient"
    }

    fn obs_hop(&self) -> &'static str {
        "gateway_ws"
    }

    fn heartbeat_probe(&self) -> WsMessage {
        WsMessage::Ping(Vec::new().into())
    }

    fn liveness_timeout(&self) -> Duration {
        HANDSHAKE_LIVENESS_TIMEOUT
    }

    fn on_open(&mut self) -> OpenOutcome {
        self.connect_sent = false;
        self.nonce = None;
        self.ready = false;
        OpenOutcome::AwaitHandshake {
            fallback_after: CONNECT_CHALLENGE_WAIT,
        }
    }

    fn on_handshake_deadline(&mut self) -> Option<Value> {
        self.take_connect()
    }

    fn on_frame(&mut self, frame: Value) -> FrameActions {
        let kind = frame.get("type").and_then(Value::as_str);
        if kind == Some("event")
            && frame.get("event").and_then(Value::as_str) == Some(CONNECT_CHALLENGE_EVENT)
        {
            if let Some(nonce) = frame.pointer("/payload/nonce").and_then(Value::as_str) {
                self.nonce = Some(nonce.to_string());
            }
            return FrameActions {
                send: self.take_connect().into_iter().collect(),
                ..FrameActions::default()
            };
        }
        if kind == Some("res")
            && frame.get("id").and_then(Value::as_str) == Some(CONNECT_REQUEST_ID)
        {
            return self.on_handshake_response(&frame);
        }
        if !self.ready {
            return FrameActions::ignore();
        }
        FrameActions::deliver(frame)
    }
}

impl WsClient<HandshakeProtocol> {
    pub fn handshake(
        config: WsClientConfig,
        builder: Box<dyn ConnectFrameBuilder>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        WsClient::new(config, HandshakeProtocol::new(builder))
    }
}
