//! Single-owner bridge state and the input loop contract.
//!
//! Every state change happens inside [`BridgeCore::handle_input`]. Timers and
//! async side work never touch the core directly; they post a [`BridgeInput`]
//! back through a weak sender so a dropped bridge stops them cleanly.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kimi_claw_transport::{FrameSink, ObsSink};
use serde_json::Value;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::AbortHandle;

use crate::acp_outbound::{AcpOutbound, ObsContext, RpcId, UpdateMeta};
use crate::assistant_stream_queue::{AssistantStreamQueue, StreamItem};
use crate::bridge_errors::BridgeError;
use crate::content_blocks::{text_chunk_update, PromptBlock};
use crate::file_resolver::{FileResolution, FileResolver};
use crate::gateway_events::CronTracker;
use crate::local_session_history::HistorySource;
use crate::payload_fields::{as_object, field_str};
use crate::session_state::SessionState;

pub const MAIN_SESSION_KEY: &str = "agent:main:main";
pub const DEFAULT_PROMPT_TIMEOUT_MS: u64 = 30 * 60 * 1000;
pub const DEFAULT_HISTORY_PENDING_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_CRON_FLUSH_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_AGENT_ID: &str = "main";

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Identity reported to the remote endpoint in `initialize` and `session/new`.
pub struct InstanceMeta {
    pub instance_id: String,
    pub device_id: String,
    pub plugin_version: String,
}

impl Default for InstanceMeta {
    fn default() -> Self {
        Self {
            instance_id: "connector-instance".to_string(),
            device_id: "unknown-device".to_string(),
            plugin_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Per-instance bridge settings; timeouts are in milliseconds.
pub struct BridgeOptions {
    pub agent_id: String,
    pub instance: InstanceMeta,
    pub forward_thinking: bool,
    pub forward_tool_calls: bool,
    pub force_realtime_verbose: bool,
    pub force_reasoning_stream: bool,
    /// `0` disables the per-prompt timeout.
    pub prompt_timeout_ms: u64,
    /// `0` disables the history request timeout.
    pub history_pending_timeout_ms: u64,
    pub cron_flush_timeout_ms: u64,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            agent_id: DEFAULT_AGENT_ID.to_string(),
            instance: InstanceMeta::default(),
            forward_thinking: false,
            forward_tool_calls: false,
            force_realtime_verbose: true,
            force_reasoning_stream: true,
            prompt_timeout_ms: DEFAULT_PROMPT_TIMEOUT_MS,
            history_pending_timeout_ms: DEFAULT_HISTORY_PENDING_TIMEOUT_MS,
            cron_flush_timeout_ms: DEFAULT_CRON_FLUSH_TIMEOUT_MS,
        }
    }
}

/// Outward-facing collaborators injected into the bridge.
pub struct BridgeCollaborators {
    pub acp_sink: Arc<dyn FrameSink>,
    pub gateway_sink: Arc<dyn FrameSink>,
    pub obs: Option<Arc<dyn ObsSink>>,
    pub file_resolver: Arc<dyn FileResolver>,
    pub history: Arc<dyn HistorySource>,
}

#[derive(Debug)]
/// Everything the bridge loop reacts to, including its own timers and side tasks.
pub enum BridgeInput {
    BridgeMessage(Value),
    GatewayFrame(Value),
    GatewayDisconnected,
    PromptTimeout {
        gateway_request_id: String,
    },
    HistoryTimeout {
        history_request_id: String,
    },
    CronFlushTimeout {
        key: String,
        generation: u64,
    },
    PromptResolved {
        rpc_id: RpcId,
        session_id: String,
        blocks: Vec<PromptBlock>,
        resolutions: HashMap<String, FileResolution>,
        obs_before: Value,
    },
    ReplayStreamItems {
        rpc_id: RpcId,
        session_id: String,
        items: Vec<StreamItem>,
    },
    ReplayStreamDone {
        rpc_id: RpcId,
        session_id: String,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Terminal outcome reported in the `session/prompt` result.
pub enum StopReason {
    EndTurn,
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Emits updates for one prompt run, mirroring them into the live stream queue when present.
pub(crate) struct RunEmitter<'a> {
    pub(crate) outbound: &'a mut AcpOutbound,
    pub(crate) stream: Option<&'a AssistantStreamQueue>,
    pub(crate) session_id: &'a str,
    pub(crate) meta: UpdateMeta,
    pub(crate) obs: Option<ObsContext>,
}

impl RunEmitter<'_> {
    pub(crate) fn emit(&mut self, update: Value) {
        if let Some(stream) = self.stream {
            stream.push(StreamItem {
                update: update.clone(),
                ts: self.meta.timestamp,
            });
        }
        self.outbound
            .send_session_update(self.session_id, update, &self.meta, self.obs.clone());
    }

    /// Line break emitted ahead of tool activity so it does not glue onto prose.
    pub(crate) fn spacer(&mut self) {
        self.emit(text_chunk_update("agent_message_chunk", "\n"));
    }
}

/// Single owner of bridge state. Only the bridge loop touches it.
pub struct BridgeCore {
    pub(crate) options: BridgeOptions,
    pub(crate) state: SessionState,
    pub(crate) outbound: AcpOutbound,
    pub(crate) gateway: Arc<dyn FrameSink>,
    pub(crate) file_resolver: Arc<dyn FileResolver>,
    pub(crate) history: Arc<dyn HistorySource>,
    pub(crate) cron: CronTracker,
    pub(crate) current_stream: Option<AssistantStreamQueue>,
    inputs: WeakUnboundedSender<BridgeInput>,
}

impl BridgeCore {
    pub fn new(
        options: BridgeOptions,
        collaborators: BridgeCollaborators,
        inputs: WeakUnboundedSender<BridgeInput>,
    ) -> Self {
        let outbound = AcpOutbound::new(
            collaborators.acp_sink,
            collaborators.obs,
            options.forward_thinking,
            options.forward_tool_calls,
        );
        Self {
            options,
            state: SessionState::default(),
            outbound,
            gateway: collaborators.gateway_sink,
            file_resolver: collaborators.file_resolver,
            history: collaborators.history,
            cron: CronTracker::default(),
            current_stream: None,
            inputs,
        }
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn current_stream(&self) -> Option<&AssistantStreamQueue> {
        self.current_stream.as_ref()
    }

    pub fn handle_input(&mut self, input: BridgeInput) {
        match input {
            BridgeInput::BridgeMessage(message) => self.handle_bridge_message(&message),
            BridgeInput::GatewayFrame(frame) => self.handle_gateway_frame(&frame),
            BridgeInput::GatewayDisconnected => self.handle_gateway_disconnected(),
            BridgeInput::PromptTimeout { gateway_request_id } => {
                self.handle_prompt_timeout(&gateway_request_id)
            }
            BridgeInput::HistoryTimeout { history_request_id } => {
                self.handle_history_timeout(&history_request_id)
            }
            BridgeInput::CronFlushTimeout { key, generation } => {
                self.handle_cron_flush_timeout(&key, generation)
            }
            BridgeInput::PromptResolved {
                rpc_id,
                session_id,
                blocks,
                resolutions,
                obs_before,
            } => self.convert_and_forward_prompt(&rpc_id, &session_id, &blocks, &resolutions, obs_before),
            BridgeInput::ReplayStreamItems {
                rpc_id,
                session_id,
                items,
            } => {
                for item in items {
                    let meta = UpdateMeta::request(&rpc_id).with_timestamp(item.ts);
                    self.outbound
                        .send_session_update(&session_id, item.update, &meta, None);
                }
            }
            BridgeInput::ReplayStreamDone { rpc_id, session_id } => {
                tracing::info!(session_id = %session_id, "assistant stream resume closed");
                self.outbound.send_result(&rpc_id, Value::Null, Some(&session_id));
            }
            BridgeInput::Shutdown => self.shutdown(),
        }
    }

    /// Routes `res` frames to history first, then prompts; `event` frames by name.
    pub fn handle_gateway_frame(&mut self, frame: &Value) {
        let Some(frame) = frame.as_object() else {
            return;
        };
        match field_str(frame, "type") {
            Some("res") => {
                if self.handle_history_response(frame) {
                    return;
                }
                self.handle_gateway_response(frame);
            }
            Some("event") => {
                let Some(payload) = as_object(frame.get("payload")) else {
                    return;
                };
                match field_str(frame, "event") {
                    Some("agent") => self.handle_agent_event(payload),
                    Some("chat") => self.handle_chat_event(payload),
                    Some("cron") => self.handle_cron_event(payload),
                    _ => {}
                }
            }
            _ => {}
        }
    }

    /// Fails every in-flight prompt and drops every pending history request.
    pub fn handle_gateway_disconnected(&mut self) {
        let in_flight = self.state.in_flight_request_ids();
        let pending_history = self.state.drain_pending_history();
        for gateway_request_id in &in_flight {
            self.fail_prompt(
                gateway_request_id,
                BridgeError::gateway_unavailable("gateway disconnected"),
            );
        }
        for (_, pending) in &pending_history {
            if let (true, Some(request_id)) = (pending.reply_on_complete, &pending.bridge_request_id) {
                self.outbound.send_error(
                    request_id,
                    &BridgeError::gateway_unavailable("gateway disconnected"),
                    Some(&pending.session_id),
                );
            }
        }
        if let Some(stream) = self.current_stream.take() {
            stream.close();
        }
        if !in_flight.is_empty() || !pending_history.is_empty() {
            tracing::warn!(
                failed_prompts = in_flight.len(),
                pending_history = pending_history.len(),
                "gateway disconnected"
            );
        }
    }

    /// No-op when the run is unknown or already done.
    pub fn complete_prompt(&mut self, gateway_request_id: &str, stop_reason: StopReason) {
        let Some(run) = self.state.prompt_mut(gateway_request_id) else {
            return;
        };
        if run.done {
            return;
        }
        run.done = true;
        let (rpc_id, session_id) = (run.rpc_id.clone(), run.session_id.clone());
        self.outbound.send_result(
            &rpc_id,
            serde_json::json!({"stopReason": stop_reason.as_str()}),
            Some(&session_id),
        );
        self.state.cleanup_prompt_run(gateway_request_id, now_ms());
    }

    /// No-op when the run is unknown or already done.
    pub fn fail_prompt(&mut self, gateway_request_id: &str, error: BridgeError) {
        let Some(run) = self.state.prompt_mut(gateway_request_id) else {
            return;
        };
        if run.done {
            return;
        }
        run.done = true;
        let (rpc_id, session_id) = (run.rpc_id.clone(), run.session_id.clone());
        self.outbound.send_error(&rpc_id, &error, Some(&session_id));
        self.state.cleanup_prompt_run(gateway_request_id, now_ms());
    }

    /// Aborts every timer and closes the live stream; state is left in place.
    pub fn shutdown(&mut self) {
        for gateway_request_id in self.state.in_flight_request_ids() {
            if let Some(timeout) = self
                .state
                .prompt_mut(&gateway_request_id)
                .and_then(|run| run.timeout.take())
            {
                timeout.abort();
            }
        }
        let pending = self.state.drain_pending_history();
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "dropping pending history requests on shutdown");
        }
        self.cron.abort_timers();
        if let Some(stream) = self.current_stream.take() {
            stream.close();
        }
    }

    /// Posts `input` back to the bridge after `delay_ms`.
    pub(crate) fn schedule(&self, delay_ms: u64, input: BridgeInput) -> AbortHandle {
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            post_input(&inputs, input);
        })
        .abort_handle()
    }

    /// Runs `work` off the input loop and feeds its result back in.
    pub(crate) fn spawn_side_task<F>(&self, work: F)
    where
        F: Future<Output = BridgeInput> + Send + 'static,
    {
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let input = work.await;
            post_input(&inputs, input);
        });
    }

    pub(crate) fn inputs(&self) -> WeakUnboundedSender<BridgeInput> {
        self.inputs.clone()
    }
}

/// Returns `false` once the bridge loop is gone.
pub(crate) fn post_input(inputs: &WeakUnboundedSender<BridgeInput>, input: BridgeInput) -> bool {
    match inputs.upgrade() {
        Some(sender) => sender.send(input).is_ok(),
        None => false,
    }
}
