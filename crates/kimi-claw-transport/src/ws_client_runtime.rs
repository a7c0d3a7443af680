//! Shared reconnecting WebSocket runtime behind both transport variants.

use std::{
    future::pending,
    sync::Arc,
    time::{Duration, Instant},
};

use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval_at, sleep_until, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message as WsMessage,
    },
    MaybeTlsStream, WebSocketStream,
};

use crate::{
    classify_text_heartbeat, ConnectionProtocol, FrameActions, FrameSink, ObsEvent, ObsSeverity,
    ObsSink, OpenOutcome, OutboundQueue, ReconnectBackoff, ReconnectDecision, RetryPolicy,
    TextHeartbeat, TransportError, TransportEvent, TransportState, WatchdogAction,
    DEFAULT_OUTBOUND_QUEUE_CAPACITY,
};

pub const LIVENESS_PING_INTERVAL: Duration = Duration::from_secs(15);
pub const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

#[derive(Debug, Clone)]
/// Connection settings shared by both transport variants.
pub struct WsClientConfig {
    pub name: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub retry: RetryPolicy,
    pub outbound_queue_capacity: usize,
    pub liveness_ping_interval: Duration,
    pub liveness_check_interval: Duration,
}

impl WsClientConfig {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            headers: Vec::new(),
            retry: RetryPolicy::default(),
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            liveness_ping_interval: LIVENESS_PING_INTERVAL,
            liveness_check_interval: LIVENESS_CHECK_INTERVAL,
        }
    }
}

#[derive(Debug)]
enum ClientCommand {
    Send(String),
    Reconnect,
    Stop,
}

#[derive(Clone)]
/// Cloneable write handle; sends are buffered while the connection is not ready.
pub struct WsClientSink {
    name: Arc<str>,
    commands: mpsc::UnboundedSender<ClientCommand>,
    state: watch::Receiver<TransportState>,
}

impl WsClientSink {
    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn send_raw(&self, raw: String) -> bool {
        self.commands.send(ClientCommand::Send(raw)).is_ok()
    }
}

impl FrameSink for WsClientSink {
    fn is_ready(&self) -> bool {
        self.state() == TransportState::Ready
    }

    fn send(&self, frame: Value) -> bool {
        match serde_json::to_string(&frame) {
            Ok(raw) => self.send_raw(raw),
            Err(error) => {
                tracing::warn!(client = %self.name, error = %error, "send failed: frame is not serializable");
                false
            }
        }
    }
}

type ClientTaskOutput<P> = (P, mpsc::UnboundedReceiver<ClientCommand>);

/// Reconnecting client parameterised by its handshake/heartbeat protocol.
pub struct WsClient<P: ConnectionProtocol> {
    config: WsClientConfig,
    protocol: Option<P>,
    commands_tx: mpsc::UnboundedSender<ClientCommand>,
    commands_rx: Option<mpsc::UnboundedReceiver<ClientCommand>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    state_tx: Arc<watch::Sender<TransportState>>,
    obs: Option<Arc<dyn ObsSink>>,
    task: Option<JoinHandle<ClientTaskOutput<P>>>,
}

impl<P: ConnectionProtocol> WsClient<P> {
    /// Builds a stopped client and the receiver its events are reported on.
    pub fn new(
        config: WsClientConfig,
        protocol: P,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(TransportState::Disconnected);
        (
            Self {
                config,
                protocol: Some(protocol),
                commands_tx,
                commands_rx: Some(commands_rx),
                events_tx,
                state_tx: Arc::new(state_tx),
                obs: None,
                task: None,
            },
            events_rx,
        )
    }

    pub fn with_obs_sink(mut self, obs: Arc<dyn ObsSink>) -> Self {
        self.obs = Some(obs);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn sink(&self) -> WsClientSink {
        WsClientSink {
            name: Arc::from(self.config.name.as_str()),
            commands: self.commands_tx.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    pub fn state(&self) -> TransportState {
        *self.state_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == TransportState::Ready
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Spawns the connection loop; calling it while running is a no-op.
    pub fn start(&mut self) -> Result<(), TransportError> {
        if self.task.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let (Some(mut protocol), Some(commands)) = (self.protocol.take(), self.commands_rx.take())
        else {
            return Ok(());
        };
        protocol.on_start();
        let worker = ClientWorker {
            config: self.config.clone(),
            protocol,
            commands,
            events: self.events_tx.clone(),
            state: Arc::clone(&self.state_tx),
            obs: self.obs.clone(),
            backoff: ReconnectBackoff::new(self.config.retry),
            queue: OutboundQueue::new(self.config.outbound_queue_capacity),
            connection_seq: 0,
        };
        self.task = Some(runtime.spawn(worker.run()));
        Ok(())
    }

    /// Closes the socket, cancels any pending reconnect and waits for the loop to exit.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = self.commands_tx.send(ClientCommand::Stop);
        match task.await {
            Ok((protocol, commands)) => {
                self.protocol = Some(protocol);
                self.commands_rx = Some(commands);
            }
            Err(error) => {
                tracing::error!(client = %self.config.name, error = %error, "transport task failed");
            }
        }
        self.state_tx.send_replace(TransportState::Disconnected);
    }

    /// Drops the current socket and reconnects immediately, skipping backoff.
    pub fn reconnect(&self) {
        let _ = self.commands_tx.send(ClientCommand::Reconnect);
    }
}

#[derive(Debug)]
enum ConnectionEnd {
    Stopped,
    Closed {
        code: Option<u16>,
        reason: String,
        was_ready: bool,
    },
    ConnectFailed(TransportError),
    Reconnect,
}

enum WaitOutcome {
    Connect,
    Stop,
}

struct ClientWorker<P: ConnectionProtocol> {
    config: WsClientConfig,
    protocol: P,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Arc<watch::Sender<TransportState>>,
    obs: Option<Arc<dyn ObsSink>>,
    backoff: ReconnectBackoff,
    queue: OutboundQueue,
    connection_seq: u64,
}

impl<P: ConnectionProtocol> ClientWorker<P> {
    async fn run(mut self) -> ClientTaskOutput<P> {
        loop {
            self.connection_seq = self.connection_seq.saturating_add(1);
            let connection_id = format!("{}-{}", self.config.name, self.connection_seq);
            let end = self.run_connection(&connection_id).await;
            self.state.send_replace(TransportState::Disconnected);

            let decision = match end {
                ConnectionEnd::Stopped => break,
                ConnectionEnd::Reconnect => {
                    self.report_closed(&connection_id, None, "manual reconnect", false);
                    self.backoff.reset();
                    continue;
                }
                ConnectionEnd::Closed {
                    code,
                    reason,
                    was_ready,
                } => {
                    self.report_closed(&connection_id, code, &reason, was_ready);
                    self.protocol.on_closed(code)
                }
                ConnectionEnd::ConnectFailed(error) => {
                    tracing::warn!(client = %self.config.name, error = %error, "error");
                    self.emit(
                        &connection_id,
                        "connect_fail",
                        ObsSeverity::Warn,
                        json!({}),
                        Some(json!({"message": error.to_string()})),
                    );
                    self.protocol.on_connect_failed(&error)
                }
            };

            let outcome = match decision {
                ReconnectDecision::GiveUp => {
                    tracing::error!(client = %self.config.name, "auth failed, will not retry");
                    self.wait_for_command(None).await
                }
                ReconnectDecision::Retry => match self.backoff.next_delay() {
                    Some(schedule) => {
                        self.emit(
                            &connection_id,
                            "reconnect_scheduled",
                            ObsSeverity::Info,
                            json!({
                                "reconnectDelayMs": schedule.delay.as_millis() as u64,
                                "attempt": schedule.attempt,
                                "nextBackoffMs": schedule.next_backoff_ms,
                            }),
                            None,
                        );
                        self.wait_for_command(Some(Instant::now() + schedule.delay))
                            .await
                    }
                    None => {
                        tracing::error!(client = %self.config.name, "retry limit reached, giving up");
                        self.wait_for_command(None).await
                    }
                },
            };
            if matches!(outcome, WaitOutcome::Stop) {
                break;
            }
        }
        self.state.send_replace(TransportState::Disconnected);
        (self.protocol, self.commands)
    }

    /// Buffers sends while idle; returns on deadline, manual reconnect or stop.
    async fn wait_for_command(&mut self, deadline: Option<Instant>) -> WaitOutcome {
        loop {
            tokio::select! {
                _ = sleep_until_deadline(deadline) => return WaitOutcome::Connect,
                command = self.commands.recv() => match command {
                    Some(ClientCommand::Send(raw)) => self.enqueue(raw),
                    Some(ClientCommand::Reconnect) => {
                        self.backoff.reset();
                        self.protocol.on_start();
                        return WaitOutcome::Connect;
                    }
                    Some(ClientCommand::Stop) | None => return WaitOutcome::Stop,
                },
            }
        }
    }

    async fn run_connection(&mut self, connection_id: &str) -> ConnectionEnd {
        self.state.send_replace(TransportState::Connecting);
        tracing::info!(client = %self.config.name, url = %self.config.url, "connecting");
        self.emit(connection_id, "connect_start", ObsSeverity::Info, json!({}), None);
        let connect_started = Instant::now();

        let request = match self.build_request() {
            Ok(request) => request,
            Err(error) => return ConnectionEnd::ConnectFailed(error),
        };
        let connect = connect_async(request);
        tokio::pin!(connect);
        let connected = loop {
            tokio::select! {
                result = &mut connect => break result,
                command = self.commands.recv() => match command {
                    Some(ClientCommand::Send(raw)) => self.enqueue(raw),
                    Some(ClientCommand::Reconnect) => {}
                    Some(ClientCommand::Stop) | None => return ConnectionEnd::Stopped,
                },
            }
        };
        let stream = match connected {
            Ok((stream, _response)) => stream,
            Err(WsError::Http(response)) => {
                return ConnectionEnd::ConnectFailed(TransportError::UpgradeRejected {
                    status: response.status().as_u16(),
                })
            }
            Err(error) => {
                return ConnectionEnd::ConnectFailed(TransportError::Connect(error.to_string()))
            }
        };
        let (mut sink, mut source) = stream.split();

        let mut last_seen = Instant::now();
        let mut ready = false;
        let mut handshake_deadline = None;
        let mut watchdog_deadline: Option<Instant> = None;

        match self.protocol.on_open() {
            OpenOutcome::Ready => {
                ready = true;
                self.mark_ready(connection_id, connect_started, &mut sink)
                    .await;
            }
            OpenOutcome::AwaitHandshake { fallback_after } => {
                self.state.send_replace(TransportState::HandshakePending);
                handshake_deadline = Some(Instant::now() + fallback_after);
            }
        }

        let ping_period = self.config.liveness_ping_interval;
        let check_period = self.config.liveness_check_interval;
        let mut heartbeat = interval_at((Instant::now() + ping_period).into(), ping_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut liveness = interval_at((Instant::now() + check_period).into(), check_period);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let liveness_timeout = self.protocol.liveness_timeout();

        loop {
            tokio::select! {
                maybe_message = source.next() => {
                    let Some(message_result) = maybe_message else {
                        return ConnectionEnd::Closed { code: None, reason: "stream ended".to_string(), was_ready: ready };
                    };
                    let message = match message_result {
                        Ok(message) => message,
                        Err(error) => {
                            tracing::warn!(client = %self.config.name, error = %error, "error");
                            return ConnectionEnd::Closed { code: None, reason: error.to_string(), was_ready: ready };
                        }
                    };
                    last_seen = Instant::now();
                    let raw = match message {
                        WsMessage::Text(text) => text.as_str().to_string(),
                        WsMessage::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
                        WsMessage::Close(frame) => {
                            let (code, reason) = frame
                                .map(|frame| (Some(u16::from(frame.code)), frame.reason.as_str().to_string()))
                                .unwrap_or((None, String::new()));
                            return ConnectionEnd::Closed { code, reason, was_ready: ready };
                        }
                    };
                    match classify_text_heartbeat(&raw) {
                        Some(TextHeartbeat::Ping) => {
                            self.write_raw(&mut sink, WsMessage::text("pong")).await;
                            continue;
                        }
                        Some(TextHeartbeat::Pong) => continue,
                        None => {}
                    }
                    let frame = match serde_json::from_str::<Value>(&raw) {
                        Ok(frame) => frame,
                        Err(_) => {
                            tracing::warn!(client = %self.config.name, "invalid json payload");
                            continue;
                        }
                    };
                    let actions = self.protocol.on_frame(frame);
                    if let Some(end) = self
                        .apply_actions(actions, connection_id, connect_started, &mut sink, &mut ready, &mut watchdog_deadline)
                        .await
                    {
                        return end;
                    }
                    if ready {
                        handshake_deadline = None;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(ClientCommand::Send(raw)) => {
                        if ready {
                            if !self.write_raw(&mut sink, WsMessage::text(raw.clone())).await {
                                self.enqueue(raw);
                            }
                        } else {
                            self.enqueue(raw);
                        }
                    }
                    Some(ClientCommand::Reconnect) => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return ConnectionEnd::Reconnect;
                    }
                    Some(ClientCommand::Stop) | None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return ConnectionEnd::Stopped;
                    }
                },
                _ = heartbeat.tick() => {
                    let probe = self.protocol.heartbeat_probe();
                    if let Err(error) = sink.send(probe).await {
                        tracing::warn!(client = %self.config.name, error = %error, "ping failed");
                    }
                }
                _ = liveness.tick() => {
                    let stale = last_seen.elapsed();
                    if stale > liveness_timeout {
                        tracing::warn!(
                            client = %self.config.name,
                            stale_ms = stale.as_millis() as u64,
                            "liveness timeout, forcing reconnect"
                        );
                        return ConnectionEnd::Closed { code: None, reason: "liveness timeout".to_string(), was_ready: ready };
                    }
                }
                _ = sleep_until_deadline(handshake_deadline) => {
                    handshake_deadline = None;
                    if let Some(connect) = self.protocol.on_handshake_deadline() {
                        self.write_frame(&mut sink, &connect).await;
                    }
                }
                _ = sleep_until_deadline(watchdog_deadline) => {
                    tracing::warn!(
                        client = %self.config.name,
                        "reconnect notification timeout, forcing reconnect"
                    );
                    return ConnectionEnd::Closed { code: None, reason: "reconnect notification timeout".to_string(), was_ready: ready };
                }
            }
        }
    }

    async fn apply_actions(
        &mut self,
        actions: FrameActions,
        connection_id: &str,
        connect_started: Instant,
        sink: &mut WsSink,
        ready: &mut bool,
        watchdog_deadline: &mut Option<Instant>,
    ) -> Option<ConnectionEnd> {
        match actions.watchdog {
            WatchdogAction::Keep => {}
            WatchdogAction::Arm(after) => *watchdog_deadline = Some(Instant::now() + after),
            WatchdogAction::Disarm => *watchdog_deadline = None,
        }
        for frame in &actions.send {
            self.write_frame(sink, frame).await;
        }
        if let Some((code, reason)) = actions.close {
            let close = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.clone().into(),
            };
            let _ = sink.send(WsMessage::Close(Some(close))).await;
            return Some(ConnectionEnd::Closed {
                code: Some(code),
                reason,
                was_ready: *ready,
            });
        }
        if actions.ready && !*ready {
            *ready = true;
            self.mark_ready(connection_id, connect_started, sink).await;
        }
        if let Some(frame) = actions.deliver {
            let _ = self.events.send(TransportEvent::Message(frame));
        }
        None
    }

    async fn mark_ready(&mut self, connection_id: &str, connect_started: Instant, sink: &mut WsSink) {
        self.state.send_replace(TransportState::Ready);
        self.backoff.reset();
        tracing::info!(client = %self.config.name, connection_id, "connected");
        self.emit(
            connection_id,
            "connect_ok",
            ObsSeverity::Info,
            json!({"durationMs": connect_started.elapsed().as_millis() as u64}),
            None,
        );
        let _ = self.events.send(TransportEvent::Ready {
            connection_id: connection_id.to_string(),
        });
        while let Some(raw) = self.queue.pop_front() {
            if !self.write_raw(sink, WsMessage::text(raw.clone())).await {
                self.queue.requeue_front(raw);
                break;
            }
        }
    }

    fn enqueue(&mut self, raw: String) {
        if self.queue.push(raw).is_some() {
            tracing::warn!(
                client = %self.config.name,
                capacity = self.queue.capacity(),
                dropped_total = self.queue.dropped_total(),
                "outbound queue full, dropped oldest frame"
            );
        }
    }

    async fn write_frame(&mut self, sink: &mut WsSink, frame: &Value) -> bool {
        match serde_json::to_string(frame) {
            Ok(raw) => self.write_raw(sink, WsMessage::text(raw)).await,
            Err(error) => {
                tracing::warn!(client = %self.config.name, error = %error, "send failed");
                false
            }
        }
    }

    async fn write_raw(&mut self, sink: &mut WsSink, message: WsMessage) -> bool {
        match sink.send(message).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(client = %self.config.name, error = %error, "send failed");
                false
            }
        }
    }

    fn build_request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, TransportError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|error| TransportError::InvalidUrl {
                url: self.config.url.clone(),
                message: error.to_string(),
            })?;
        let headers = self
            .config
            .headers
            .iter()
            .cloned()
            .chain(self.protocol.upgrade_headers());
        for (name, value) in headers {
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|error| TransportError::InvalidHeader {
                    name: name.clone(),
                    message: error.to_string(),
                })?;
            let header_value =
                HeaderValue::from_str(&value).map_err(|error| TransportError::InvalidHeader {
                    name: name.clone(),
                    message: error.to_string(),
                })?;
            request.headers_mut().insert(header_name, header_value);
        }
        Ok(request)
    }

    fn report_closed(&mut self, connection_id: &str, code: Option<u16>, reason: &str, was_ready: bool) {
        tracing::warn!(
            client = %self.config.name,
            code = code.map(i64::from).unwrap_or(-1),
            reason,
            "closed"
        );
        self.emit(
            connection_id,
            "close",
            ObsSeverity::Warn,
            json!({"closeCode": code, "closeReason": reason, "wasReady": was_ready}),
            None,
        );
        let _ = self.events.send(TransportEvent::Closed {
            connection_id: connection_id.to_string(),
            code,
            reason: reason.to_string(),
        });
    }

    fn emit(
        &self,
        connection_id: &str,
        name: &str,
        severity: ObsSeverity,
        payload: Value,
        error: Option<Value>,
    ) {
        let Some(obs) = &self.obs else {
            return;
        };
        let mut merged = json!({
            "client": self.config.name,
            "url": self.config.url,
            "connectionId": connection_id,
        });
        if let (Some(target), Value::Object(extra)) = (merged.as_object_mut(), payload) {
            target.extend(extra);
        }
        let mut event = ObsEvent::new("connector", "transport", &format!("transport.{name}"), severity)
            .with_hop(self.protocol.obs_hop())
            .with_location(self.protocol.client_kind())
            .with_payload(merged);
        if let Some(error) = error {
            event = event.with_error(error);
        }
        obs.emit(event);
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline.into()).await,
        None => pending::<()>().await,
    }
}
