use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use kimi_claw_acp_bridge::{
    collect_secrets, spawn_bridge, BridgeCollaborators, BridgeHandle, BridgeOptions,
    FanoutObsSink, InstanceMeta, JsonlObsSink, LocalSessionHistory, NoopFileResolver,
    TracingObsSink,
};
use kimi_claw_transport::{
    default_device_identity_path, gateway_platform_name, load_or_create_device_identity,
    DeviceIdentity, GatewayConnectBuilder, HandshakeWsClient, JsonRpcWsClient, ObsSink,
    TransportEvent, WsClientConfig, KIMI_CLAW_VERSION_HEADER,
};

use crate::connector_config::ConnectorConfig;

const CONNECTOR_VERSION: &str = env!("CARGO_PKG_VERSION");
const BRIDGE_CLIENT_NAME: &str = "bridge";
const GATEWAY_CLIENT_NAME: &str = "gateway";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportLeg {
    Bridge,
    Gateway,
}

impl TransportLeg {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Bridge => BRIDGE_CLIENT_NAME,
            Self::Gateway => GATEWAY_CLIENT_NAME,
        }
    }
}

pub(crate) fn bridge_options(config: &ConnectorConfig) -> BridgeOptions {
    BridgeOptions {
        agent_id: config.gateway.agent_id.clone(),
        instance: InstanceMeta {
            instance_id: config.bridge.instance_id.clone(),
            device_id: config.bridge.device_id.clone(),
            plugin_version: CONNECTOR_VERSION.to_string(),
        },
        forward_thinking: config.bridge.forward_thinking,
        forward_tool_calls: config.bridge.forward_tool_calls,
        prompt_timeout_ms: config.bridge.prompt_timeout_ms,
        history_pending_timeout_ms: config.bridge.history_pending_timeout_ms,
        ..BridgeOptions::default()
    }
}

fn client_config(config: &ConnectorConfig, leg: TransportLeg, url: &str) -> WsClientConfig {
    let mut client = WsClientConfig::new(leg.as_str(), url);
    client.retry = config.retry;
    client.outbound_queue_capacity = config.outbound_queue_capacity;
    client
}

pub(crate) fn bridge_client_config(config: &ConnectorConfig) -> WsClientConfig {
    let mut client = client_config(config, TransportLeg::Bridge, &config.bridge.url);
    client.headers.push((
        KIMI_CLAW_VERSION_HEADER.to_string(),
        CONNECTOR_VERSION.to_string(),
    ));
    client
}

pub(crate) fn gateway_connect_builder(
    config: &ConnectorConfig,
    identity: DeviceIdentity,
) -> GatewayConnectBuilder {
    GatewayConnectBuilder {
        protocol: config.gateway.protocol,
        client_id: config.gateway.client_id.clone(),
        client_mode: config.gateway.client_mode.clone(),
        version: CONNECTOR_VERSION.to_string(),
        platform: gateway_platform_name().to_string(),
        token: config.gateway.token.clone(),
        identity,
    }
}

/// Tracing always; the JSONL trace file too when configured and writable.
pub(crate) fn build_obs_sink(config: &ConnectorConfig) -> Arc<dyn ObsSink> {
    let tracing_sink: Arc<dyn ObsSink> = Arc::new(TracingObsSink);
    let Some(path) = config.obs_log_file.clone() else {
        return tracing_sink;
    };
    match JsonlObsSink::open(path, collect_secrets(config.secrets())) {
        Ok(file_sink) => {
            tracing::info!(path = %file_sink.path().display(), "observability trace file enabled");
            Arc::new(FanoutObsSink::new(vec![tracing_sink, Arc::new(file_sink)]))
        }
        Err(error) => {
            tracing::warn!(error = %format!("{error:#}"), "observability trace file disabled");
            tracing_sink
        }
    }
}

/// Feeds one transport event into the bridge. Returns `false` once the bridge loop is gone.
pub(crate) fn forward_transport_event(
    bridge: &BridgeHandle,
    leg: TransportLeg,
    event: TransportEvent,
    stopping: bool,
) -> bool {
    match (leg, event) {
        (_, TransportEvent::Ready { connection_id }) => {
            tracing::info!(client = leg.as_str(), connection_id = %connection_id, "transport ready");
            true
        }
        (TransportLeg::Bridge, TransportEvent::Message(message)) => {
            bridge.send_bridge_message(message)
        }
        (TransportLeg::Gateway, TransportEvent::Message(frame)) => {
            bridge.send_gateway_frame(frame)
        }
        (TransportLeg::Bridge, TransportEvent::Closed { connection_id, code, reason }) => {
            tracing::info!(client = leg.as_str(), connection_id = %connection_id, ?code, reason = %reason, "transport closed");
            true
        }
        (TransportLeg::Gateway, TransportEvent::Closed { connection_id, code, reason }) => {
            tracing::warn!(client = leg.as_str(), connection_id = %connection_id, ?code, reason = %reason, "transport closed");
            if stopping {
                return true;
            }
            bridge.gateway_disconnected()
        }
    }
}

#[cfg(unix)]
struct ReconnectSignal(Option<tokio::signal::unix::Signal>);

#[cfg(unix)]
impl ReconnectSignal {
    fn install() -> Self {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::user_defined1()) {
            Ok(stream) => Self(Some(stream)),
            Err(error) => {
                tracing::warn!(error = %error, "SIGUSR1 reconnect trigger unavailable");
                Self(None)
            }
        }
    }

    async fn recv(&mut self) {
        if let Some(stream) = self.0.as_mut() {
            if stream.recv().await.is_some() {
                return;
            }
            self.0 = None;
        }
        std::future::pending::<()>().await
    }
}

#[cfg(not(unix))]
struct ReconnectSignal;

#[cfg(not(unix))]
impl ReconnectSignal {
    fn install() -> Self {
        Self
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await
    }
}

/// Runs both transports and the bridge until Ctrl-C or until the bridge loop stops.
pub async fn run_connector(config: ConnectorConfig) -> Result<()> {
    let identity_path = config
        .device_identity_path
        .clone()
        .or_else(default_device_identity_path)
        .ok_or_else(|| anyhow!("cannot resolve a device identity path without a home directory"))?;
    let identity = load_or_create_device_identity(&identity_path)
        .with_context(|| format!("failed to load device identity {}", identity_path.display()))?;
    tracing::info!(
        device_id = identity.device_id(),
        path = %identity_path.display(),
        "device identity loaded"
    );

    let obs = build_obs_sink(&config);
    let (bridge_client, mut bridge_events) =
        JsonRpcWsClient::json_rpc(bridge_client_config(&config), config.bridge.token.clone());
    let mut bridge_client = bridge_client.with_obs_sink(Arc::clone(&obs));
    let (gateway_client, mut gateway_events) = HandshakeWsClient::handshake(
        client_config(&config, TransportLeg::Gateway, &config.gateway.url),
        Box::new(gateway_connect_builder(&config, identity)),
    );
    let mut gateway_client = gateway_client.with_obs_sink(Arc::clone(&obs));

    let (bridge, bridge_task) = spawn_bridge(
        bridge_options(&config),
        BridgeCollaborators {
            acp_sink: Arc::new(bridge_client.sink()),
            gateway_sink: Arc::new(gateway_client.sink()),
            obs: Some(obs),
            file_resolver: Arc::new(NoopFileResolver),
            history: Arc::new(LocalSessionHistory::from_env(&config.gateway.agent_id)),
        },
    );

    bridge_client
        .start()
        .context("failed to start bridge transport")?;
    gateway_client
        .start()
        .context("failed to start gateway transport")?;
    tracing::info!(
        bridge_url = %config.bridge.url,
        gateway_url = %config.gateway.url,
        instance_id = %config.bridge.instance_id,
        "connector started"
    );

    let mut reconnect_signal = ReconnectSignal::install();
    loop {
        let alive = tokio::select! {
            event = bridge_events.recv() => match event {
                Some(event) => forward_transport_event(&bridge, TransportLeg::Bridge, event, false),
                None => false,
            },
            event = gateway_events.recv() => match event {
                Some(event) => forward_transport_event(&bridge, TransportLeg::Gateway, event, false),
                None => false,
            },
            _ = reconnect_signal.recv() => {
                tracing::info!("reconnect requested, dropping both transports");
                bridge_client.reconnect();
                gateway_client.reconnect();
                true
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                false
            }
        };
        if !alive {
            break;
        }
    }

    // Bridge loop first so its last frames still reach live transports.
    bridge.shutdown();
    if let Err(error) = bridge_task.await {
        tracing::error!(error = %error, "bridge task failed");
    }
    gateway_client.stop().await;
    bridge_client.stop().await;
    tracing::info!("connector stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use clap::Parser;
    use kimi_claw_acp_bridge::{
        spawn_bridge, BridgeCollaborators, BridgeOptions, HistorySource, LocalHistoryEntry,
        NoopFileResolver,
    };
    use kimi_claw_transport::{
        DeviceIdentity, FrameSink, ObsEvent, ObsSeverity, TransportEvent,
    };
    use serde_json::{json, Value};
    use tempfile::tempdir;

    use super::{
        bridge_client_config, bridge_options, build_obs_sink, forward_transport_event,
        gateway_connect_builder, TransportLeg,
    };
    use crate::connector_config::{Cli, ConnectorConfig};

    #[derive(Default)]
    struct CapturingSink {
        frames: Mutex<Vec<Value>>,
    }

    impl CapturingSink {
        fn frames(&self) -> Vec<Value> {
            self.frames.lock().expect("frames lock").clone()
        }
    }

    impl FrameSink for CapturingSink {
        fn is_ready(&self) -> bool {
            true
        }

        fn send(&self, frame: Value) -> bool {
            self.frames.lock().expect("frames lock").push(frame);
            true
        }
    }

    struct EmptyHistory;

    impl HistorySource for EmptyHistory {
        fn read_entries(&self, _session_id: &str, _session_key: &str) -> Vec<LocalHistoryEntry> {
            Vec::new()
        }
    }

    fn resolved_config(args: &[&str]) -> ConnectorConfig {
        let mut argv = vec!["kimi-claw-connector"];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv).expect("cli parses");
        ConnectorConfig::resolve(&cli, Default::default(), None).expect("config resolves")
    }

    #[test]
    fn unit_bridge_options_follow_resolved_config() {
        let config = resolved_config(&[
            "--bridge-instance-id",
            "inst-9",
            "--gateway-agent-id",
            "ops",
            "--forward-thinking",
            "--prompt-timeout-ms",
            "0",
        ]);
        let options = bridge_options(&config);
        assert_eq!(options.agent_id, "ops");
        assert_eq!(options.instance.instance_id, "inst-9");
        assert_eq!(options.instance.device_id, "unknown-device");
        assert!(options.forward_thinking);
        assert!(!options.forward_tool_calls);
        assert_eq!(options.prompt_timeout_ms, 0);
        assert_eq!(
            options.cron_flush_timeout_ms,
            BridgeOptions::default().cron_flush_timeout_ms
        );
    }

    #[test]
    fn unit_bridge_client_sends_version_header_and_shared_retry() {
        let config = resolved_config(&["--outbound-queue-capacity", "8"]);
        let client = bridge_client_config(&config);
        assert_eq!(client.name, "bridge");
        assert_eq!(client.outbound_queue_capacity, 8);
        assert_eq!(client.retry, config.retry);
        assert!(client
            .headers
            .iter()
            .any(|(name, value)| name == "X-Kimi-Claw-Version" && value == env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn unit_gateway_connect_frame_uses_config_identity_fields() {
        let config = resolved_config(&[]);
        let builder = gateway_connect_builder(&config, DeviceIdentity::generate());
        let frame = builder.connect_frame(Some("nonce-1"), 42);
        assert_eq!(frame["id"], "connect");
        assert_eq!(frame["params"]["minProtocol"], 3);
        assert_eq!(frame["params"]["client"]["id"], "gateway-client");
        assert_eq!(frame["params"]["client"]["mode"], "backend");
        assert!(frame["params"].get("auth").is_none());
        assert_eq!(frame["params"]["device"]["nonce"], "nonce-1");
    }

    #[test]
    fn functional_obs_sink_falls_back_to_tracing_when_file_is_unwritable() {
        let temp = tempdir().expect("tempdir");
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, "x").expect("write blocker");
        let unwritable = blocker.join("trace.log");
        let config = resolved_config(&["--obs-log-file", unwritable.to_str().expect("utf8 path")]);
        let sink = build_obs_sink(&config);
        sink.emit(ObsEvent::new("test", "connector", "unit.emit", ObsSeverity::Info));
        assert!(!unwritable.exists());

        let writable = temp.path().join("log").join("trace.log");
        let config = resolved_config(&["--obs-log-file", writable.to_str().expect("utf8 path")]);
        build_obs_sink(&config).emit(ObsEvent::new("test", "connector", "unit.emit", ObsSeverity::Info));
        let written = std::fs::read_to_string(&writable).expect("trace file");
        assert_eq!(written.lines().count(), 1);
    }

    #[tokio::test]
    async fn integration_gateway_close_fails_in_flight_prompt_unless_stopping() {
        let acp = Arc::new(CapturingSink::default());
        let gateway = Arc::new(CapturingSink::default());
        let (bridge, task) = spawn_bridge(
            BridgeOptions::default(),
            BridgeCollaborators {
                acp_sink: acp.clone(),
                gateway_sink: gateway.clone(),
                obs: None,
                file_resolver: Arc::new(NoopFileResolver),
                history: Arc::new(EmptyHistory),
            },
        );
        let closed = || TransportEvent::Closed {
            connection_id: "gateway-1".to_string(),
            code: Some(1006),
            reason: "abnormal".to_string(),
        };

        assert!(forward_transport_event(
            &bridge,
            TransportLeg::Bridge,
            TransportEvent::Message(json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "session/prompt",
                "params": {"sessionId": "s", "prompt": [{"type": "text", "text": "hi"}]},
            })),
            false,
        ));
        assert!(forward_transport_event(&bridge, TransportLeg::Gateway, closed(), true));
        assert!(forward_transport_event(&bridge, TransportLeg::Gateway, closed(), false));
        assert!(forward_transport_event(
            &bridge,
            TransportLeg::Gateway,
            TransportEvent::Ready {
                connection_id: "gateway-2".to_string(),
            },
            false,
        ));
        bridge.shutdown();
        task.await.expect("bridge task");

        let errors = acp
            .frames()
            .into_iter()
            .filter(|frame| frame.get("id") == Some(&json!(7)))
            .collect::<Vec<_>>();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["error"]["code"], -32001);
        assert_eq!(errors[0]["error"]["message"], "gateway disconnected");
        assert!(gateway
            .frames()
            .iter()
            .any(|frame| frame["method"] == "agent"));
        assert!(!forward_transport_event(
            &bridge,
            TransportLeg::Gateway,
            TransportEvent::Message(json!({})),
            false,
        ));
    }
}
