use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::{
    ConnectionProtocol, FrameActions, OpenOutcome, ReconnectDecision, TransportError,
    TransportEvent, WatchdogAction, WsClient, WsClientConfig,
};

pub const KIMI_BOT_TOKEN_HEADER: &str = "X-Kimi-Bot-Token";
/// Set by the connector through [`WsClientConfig::headers`].
pub const KIMI_CLAW_VERSION_HEADER: &str = "X-Kimi-Claw-Version";
pub const JSONRPC_LIVENESS_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const RECONNECT_NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(60);
pub const RECONNECT_NOTIFICATION_METHOD: &str = "_kimi.com/reconnect";
pub const AUTH_FAILED_CLOSE_CODE: u16 = 4001;

/// Remote ACP leg: ready on socket open, JSON `{"type":"ping"}` heartbeats.
pub type JsonRpcWsClient = WsClient<JsonRpcProtocol>;

#[derive(Debug, Clone, Default)]
/// Protocol hooks for the remote bridge JSON-RPC socket.
pub struct JsonRpcProtocol {
    token: Option<String>,
    auth_failed: bool,
}

impl JsonRpcProtocol {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|token| !token.trim().is_empty()),
            auth_failed: false,
        }
    }

    pub fn auth_failed(&self) -> bool {
        self.auth_failed
    }

    fn mark_auth_failed(&mut self, reason: &str) -> ReconnectDecision {
        if !self.auth_failed {
            self.auth_failed = true;
            tracing::error!(reason, "bridge auth failed, will not retry");
        }
        ReconnectDecision::GiveUp
    }
}

pub fn is_reconnect_notification(message: &Value) -> bool {
    message.get("jsonrpc").and_then(Value::as_str) == Some("2.0")
        && message.get("method").and_then(Value::as_str) == Some(RECONNECT_NOTIFICATION_METHOD)
}

impl ConnectionProtocol for JsonRpcProtocol {
    fn client_kind(&self) -> &'static str {
        "JsonRpcWsClient"
    }

    fn obs_hop(&self) -> &'static str {
        "bridge_ws"
    }

    fn upgrade_headers(&self) -> Vec<(String, String)> {
        self.token
            .as_ref()
            .map(|token| vec![(KIMI_BOT_TOKEN_HEADER.to_string(), token.clone())])
            .unwrap_or_default()
    }

    fn heartbeat_probe(&self) -> WsMessage {
        WsMessage::text(r#"{"type":"ping"}"#)
    }

    fn liveness_timeout(&self) -> Duration {
        JSONRPC_LIVENESS_TIMEOUT
    }

    fn on_start(&mut self) {
        self.auth_failed = false;
    }

    fn on_open(&mut self) -> OpenOutcome {
        OpenOutcome::Ready
    }

    fn on_frame(&mut self, frame: Value) -> FrameActions {
        let watchdog = if is_reconnect_notification(&frame) {
            tracing::info!("received reconnect notification, starting 1min timer");
            WatchdogAction::Arm(RECONNECT_NOTIFICATION_TIMEOUT)
        } else {
            WatchdogAction::Disarm
        };
        FrameActions {
            watchdog,
            ..FrameActions::deliver(frame)
        }
    }

    fn on_closed(&mut self, code: Option<u16>) -> ReconnectDecision {
        if code == Some(AUTH_FAILED_CLOSE_CODE) {
            return self.mark_auth_failed("4001");
        }
        ReconnectDecision::Retry
    }

    fn on_connect_failed(&mut self, error: &TransportError) -> ReconnectDecision {
        match error {
            TransportError::UpgradeRejected { status: 401 } => self.mark_auth_failed("http 401"),
            TransportError::Connect(message) if message.contains("401") => {
                self.mark_auth_failed("http 401")
            }
            _ => ReconnectDecision::Retry,
        }
    }
}

impl WsClient<JsonRpcProtocol> {
    /// Builds the remote bridge client; the bot token travels as an upgrade header.
    pub fn json_rpc(
        config: WsClientConfig,
        token: Option<String>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        WsClient::new(config, JsonRpcProtocol::new(token))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};

    use super::{is_reconnect_notification, JsonRpcProtocol, JsonRpcWsClient};
    use crate::{
        ConnectionProtocol, FrameSink, ReconnectDecision, RetryPolicy, TransportError,
        TransportEvent, WatchdogAction, WsClientConfig,
    };

    #[test]
    fn unit_reconnect_notification_arms_watchdog_and_other_frames_disarm() {
        let mut protocol = JsonRpcProtocol::new(None);
        let notice = json!({"jsonrpc": "2.0", "method": "_kimi.com/reconnect"});
        assert!(is_reconnect_notification(&notice));
        let armed = protocol.on_frame(notice.clone());
        assert_eq!(armed.watchdog, WatchdogAction::Arm(Duration::from_secs(60)));
        assert_eq!(armed.deliver, Some(notice));

        let disarmed = protocol.on_frame(json!({"jsonrpc": "2.0", "id": 1, "result": {}}));
        assert_eq!(disarmed.watchdog, WatchdogAction::Disarm);
    }

    #[test]
    fn unit_auth_failures_stop_retrying_until_restart() {
        let mut protocol = JsonRpcProtocol::new(Some("bot-token".to_string()));
        assert_eq!(protocol.on_closed(Some(1006)), ReconnectDecision::Retry);
        assert_eq!(protocol.on_closed(Some(4001)), ReconnectDecision::GiveUp);
        assert!(protocol.auth_failed());
        protocol.on_start();
        assert!(!protocol.auth_failed());
        assert_eq!(
            protocol.on_connect_failed(&TransportError::UpgradeRejected { status: 401 }),
            ReconnectDecision::GiveUp
        );
        protocol.on_start();
        assert_eq!(
            protocol.on_connect_failed(&TransportError::UpgradeRejected { status: 502 }),
            ReconnectDecision::Retry
        );
    }

    #[test]
    fn unit_upgrade_headers_carry_bot_token_only_when_present() {
        assert!(JsonRpcProtocol::new(None).upgrade_headers().is_empty());
        assert!(JsonRpcProtocol::new(Some("  ".to_string()))
            .upgrade_headers()
            .is_empty());
        assert_eq!(
            JsonRpcProtocol::new(Some("abc".to_string())).upgrade_headers(),
            vec![("X-Kimi-Bot-Token".to_string(), "abc".to_string())]
        );
    }

    #[tokio::test]
    async fn integration_queued_frames_flush_and_text_ping_is_answered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(tcp).await.expect("upgrade");
            let queued = ws.next().await.expect("queued frame").expect("frame ok");
            ws.send(WsMessage::text("ping")).await.expect("send ping");
            let pong = ws.next().await.expect("pong frame").expect("frame ok");
            ws.send(WsMessage::text(r#"{"jsonrpc":"2.0","id":7,"method":"session/list"}"#))
                .await
                .expect("send request");
            let _ = ws.next().await;
            (queued, pong)
        });

        let mut config = WsClientConfig::new("bridge-acp", &format!("ws://{addr}"));
        config.retry = RetryPolicy {
            base_ms: 10,
            max_ms: 50,
            max_attempts: 0,
        };
        let (mut client, mut events) = JsonRpcWsClient::json_rpc(config, None);
        let sink = client.sink();
        assert!(sink.send(json!({"jsonrpc": "2.0", "method": "hello"})));
        client.start().expect("start");

        let mut delivered = None;
        while let Some(event) = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event before timeout")
        {
            if let TransportEvent::Message(frame) = event {
                delivered = Some(frame);
                break;
            }
        }
        let delivered = delivered.expect("delivered frame");
        assert_eq!(delivered["method"], "session/list");
        assert!(sink.is_ready());

        client.stop().await;
        let (queued, pong) = server.await.expect("server");
        let queued: Value = serde_json::from_str(queued.to_text().expect("text")).expect("json");
        assert_eq!(queued["method"], "hello");
        assert_eq!(pong.to_text().expect("text"), "pong");
        assert!(!client.is_ready());
    }
}
