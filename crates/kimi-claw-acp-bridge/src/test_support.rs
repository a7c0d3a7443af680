use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kimi_claw_transport::{FrameSink, ObsEvent, ObsSink};
use serde_json::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::bridge_core::{BridgeCollaborators, BridgeCore, BridgeInput, BridgeOptions};
use crate::file_resolver::{FileResolver, NoopFileResolver};
use crate::local_session_history::{HistorySource, LocalHistoryEntry};

const PUMP_TIMEOUT: Duration = Duration::from_secs(5);

/// Frame sink that records everything it is asked to send.
pub(crate) struct RecordingSink {
    ready: AtomicBool,
    accept: AtomicBool,
    frames: Mutex<Vec<Value>>,
}

impl RecordingSink {
    pub(crate) fn ready() -> Self {
        Self {
            ready: AtomicBool::new(true),
            accept: AtomicBool::new(true),
            frames: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn not_ready() -> Self {
        let sink = Self::ready();
        sink.set_ready(false);
        sink
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub(crate) fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    pub(crate) fn frames(&self) -> Vec<Value> {
        self.frames.lock().expect("frames lock").clone()
    }

    pub(crate) fn take_frames(&self) -> Vec<Value> {
        std::mem::take(&mut *self.frames.lock().expect("frames lock"))
    }

    /// Frames whose `method` equals `method`.
    pub(crate) fn with_method(&self, method: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|frame| frame["method"] == method)
            .collect()
    }

    /// `session/update` payloads (the `update` object) in send order.
    pub(crate) fn updates(&self) -> Vec<Value> {
        self.with_method("session/update")
            .into_iter()
            .map(|frame| frame["params"]["update"].clone())
            .collect()
    }

    /// Texts of updates of the given kind.
    pub(crate) fn update_texts(&self, kind: &str) -> Vec<String> {
        self.updates()
            .into_iter()
            .filter(|update| update["sessionUpdate"] == kind)
            .filter_map(|update| update["content"]["text"].as_str().map(str::to_string))
            .collect()
    }

    /// Responses (frames carrying `result` or `error`).
    pub(crate) fn responses(&self) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|frame| frame.get("result").is_some() || frame.get("error").is_some())
            .collect()
    }
}

impl FrameSink for RecordingSink {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn send(&self, frame: Value) -> bool {
        if !self.accept.load(Ordering::SeqCst) {
            return false;
        }
        self.frames.lock().expect("frames lock").push(frame);
        true
    }
}

#[derive(Default)]
pub(crate) struct RecordingObsSink {
    events: Mutex<Vec<ObsEvent>>,
}

impl RecordingObsSink {
    pub(crate) fn events(&self) -> Vec<ObsEvent> {
        self.events.lock().expect("events lock").clone()
    }
}

impl ObsSink for RecordingObsSink {
    fn emit(&self, event: ObsEvent) {
        self.events.lock().expect("events lock").push(event);
    }
}

#[derive(Default)]
pub(crate) struct FixedHistory {
    pub(crate) entries: std::sync::Mutex<Vec<LocalHistoryEntry>>,
}

impl FixedHistory {
    pub(crate) fn set(&self, entries: Vec<LocalHistoryEntry>) {
        *self.entries.lock().expect("history lock") = entries;
    }
}

impl HistorySource for FixedHistory {
    fn read_entries(&self, _session_id: &str, _session_key: &str) -> Vec<LocalHistoryEntry> {
        self.entries.lock().expect("history lock").clone()
    }
}

pub(crate) struct Harness {
    pub(crate) core: BridgeCore,
    pub(crate) acp: Arc<RecordingSink>,
    pub(crate) gateway: Arc<RecordingSink>,
    pub(crate) obs: Arc<RecordingObsSink>,
    pub(crate) history: Arc<FixedHistory>,
    pub(crate) inputs: UnboundedReceiver<BridgeInput>,
    _sender: UnboundedSender<BridgeInput>,
}

impl Harness {
    pub(crate) fn new(options: BridgeOptions) -> Self {
        Self::with_resolver(options, Arc::new(NoopFileResolver))
    }

    pub(crate) fn with_resolver(options: BridgeOptions, resolver: Arc<dyn FileResolver>) -> Self {
        let (sender, inputs) = unbounded_channel();
        let acp = Arc::new(RecordingSink::ready());
        let gateway = Arc::new(RecordingSink::ready());
        let obs = Arc::new(RecordingObsSink::default());
        let history = Arc::new(FixedHistory::default());
        let core = BridgeCore::new(
            options,
            BridgeCollaborators {
                acp_sink: acp.clone(),
                gateway_sink: gateway.clone(),
                obs: Some(obs.clone()),
                file_resolver: resolver,
                history: history.clone(),
            },
            sender.downgrade(),
        );
        Self {
            core,
            acp,
            gateway,
            obs,
            history,
            inputs,
            _sender: sender,
        }
    }

    pub(crate) fn forwarding() -> Self {
        Self::new(BridgeOptions {
            forward_thinking: true,
            forward_tool_calls: true,
            ..BridgeOptions::default()
        })
    }

    pub(crate) fn bridge(&mut self, message: Value) {
        self.core.handle_input(BridgeInput::BridgeMessage(message));
    }

    pub(crate) fn gateway_frame(&mut self, frame: Value) {
        self.core.handle_input(BridgeInput::GatewayFrame(frame));
    }

    /// Feeds the next self-posted input (timer or side task) back into the core.
    /// Panics when nothing is posted within [`PUMP_TIMEOUT`].
    pub(crate) async fn pump_one(&mut self) {
        let input = tokio::time::timeout(PUMP_TIMEOUT, self.inputs.recv())
            .await
            .expect("bridge input posted before pump timeout")
            .expect("bridge input");
        self.core.handle_input(input);
    }

    /// Handles a self-posted input if one is already queued.
    pub(crate) fn try_pump_one(&mut self) -> bool {
        match self.inputs.try_recv() {
            Ok(input) => {
                self.core.handle_input(input);
                true
            }
            Err(_) => false,
        }
    }

    /// Sends `session/prompt` and returns the forwarded gateway request id.
    pub(crate) fn prompt(&mut self, rpc_id: i64, text: &str) -> String {
        self.bridge(serde_json::json!({
            "jsonrpc": "2.0",
            "id": rpc_id,
            "method": "session/prompt",
            "params": {"sessionId": "s", "prompt": [{"type": "text", "text": text}]},
        }));
        self.gateway
            .with_method("agent")
            .last()
            .and_then(|frame| frame["id"].as_str().map(str::to_string))
            .expect("agent request forwarded")
    }

    pub(crate) fn agent_event(&mut self, request_id: &str, stream: &str, data: Value) {
        self.gateway_frame(serde_json::json!({
            "type": "event",
            "event": "agent",
            "payload": {"requestId": request_id, "stream": stream, "data": data},
        }));
    }
}
