//! Gateway `res`/`event` frames translated into ACP session updates.
//!
//! Frames correlate to a prompt run by `runId`, then `requestId`. Frames that
//! correlate to nothing may belong to a background cron run on the main
//! session; their assistant text is buffered per stream key and flushed as a
//! single chunk on lifecycle end or after a quiet period.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::acp_outbound::{ObsContext, UpdateMeta};
use crate::bridge_core::{now_ms, BridgeCore, BridgeInput, RunEmitter, StopReason, MAIN_SESSION_KEY};
use crate::bridge_errors::{BridgeError, GATEWAY_LIFECYCLE_ERROR, GATEWAY_RESPONSE_ERROR};
use crate::content_blocks::{
    assistant_content_blocks, extract_message_text, message_chunk, text_chunk_update,
    to_session_content_block, tool_arguments, tool_call_update, tool_result_text,
    tool_result_update, tool_title,
};
use crate::payload_fields::{
    as_object, field_str, first_field_str, normalize_str, normalize_text, payload_timestamp,
    pretty_json, text_chunk, trimmed_str, JsonObject,
};
use crate::session_state::{PromptRun, ToolPhase};

pub const CRON_SIGNAL_WINDOW_MS: i64 = 60 * 1000;

const AGENT_LOCATION: &str = "AcpGatewayBridge.handleGatewayAgentEvent";
const AGENT_CRON_LOCATION: &str = "AcpGatewayBridge.handleGatewayAgentEvent.cron";
const CHAT_LOCATION: &str = "AcpGatewayBridge.handleGatewayChatEvent";
const CHAT_CRON_LOCATION: &str = "AcpGatewayBridge.handleGatewayChatEvent.cron";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    End,
    Timeout,
}

impl FlushReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::End => "end",
            Self::Timeout => "timeout",
        }
    }

    fn location(&self) -> &'static str {
        match self {
            Self::End => "AcpGatewayBridge.handleGatewayAgentEvent.cron.flush.end",
            Self::Timeout => "AcpGatewayBridge.handleGatewayAgentEvent.cron.flush.timeout",
        }
    }
}

#[derive(Debug, Default)]
/// Background (cron) run bookkeeping keyed by `run:<id>` or `request:<id>`.
pub struct CronTracker {
    run_ids: HashSet<String>,
    request_ids_by_key: HashMap<String, String>,
    ts_by_key: HashMap<String, i64>,
    text_by_key: HashMap<String, String>,
    payload_by_key: HashMap<String, Value>,
    flush_timers: HashMap<String, (u64, AbortHandle)>,
    next_generation: u64,
    last_signal_at_ms: i64,
}

impl CronTracker {
    pub fn is_cron_run(&self, run_id: &str) -> bool {
        self.run_ids.contains(run_id)
    }

    pub fn buffered_text(&self, key: &str) -> Option<&str> {
        self.text_by_key.get(key).map(String::as_str)
    }

    fn note_signal(&mut self, run_id: Option<&str>, now_ms: i64) {
        self.last_signal_at_ms = now_ms;
        if let Some(run_id) = run_id {
            self.run_ids.insert(run_id.to_string());
        }
    }

    /// Known cron runs always qualify; otherwise only within the signal window,
    /// which also adopts the run id.
    fn is_candidate(&mut self, payload: &JsonObject, now_ms: i64) -> bool {
        let run_id = first_field_str(payload, &["runId", "run_id"]);
        if run_id.is_some_and(|run_id| self.run_ids.contains(run_id)) {
            return true;
        }
        if now_ms - self.last_signal_at_ms > CRON_SIGNAL_WINDOW_MS {
            return false;
        }
        if let Some(run_id) = run_id {
            self.run_ids.insert(run_id.to_string());
        }
        true
    }

    fn meta_for_key(&mut self, key: Option<&str>) -> UpdateMeta {
        let Some(key) = key else {
            return UpdateMeta::cron(&Uuid::new_v4().to_string(), None);
        };
        let request_id = self
            .request_ids_by_key
            .entry(key.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        UpdateMeta::cron(&request_id, self.ts_by_key.get(key).copied())
    }

    fn resolve_meta(&mut self, payload: &JsonObject) -> UpdateMeta {
        let key = cron_stream_key(payload);
        let meta = self.meta_for_key(key.as_deref());
        let Some(timestamp) = payload_timestamp(payload) else {
            return meta;
        };
        if let Some(key) = key {
            self.ts_by_key.insert(key, timestamp);
        }
        if meta.timestamp.is_some() {
            return meta;
        }
        meta.with_timestamp(Some(timestamp))
    }

    fn take_timer(&mut self, key: &str) {
        if let Some((_, timer)) = self.flush_timers.remove(key) {
            timer.abort();
        }
    }

    fn clear_key(&mut self, key: &str) {
        self.request_ids_by_key.remove(key);
        self.ts_by_key.remove(key);
        self.text_by_key.remove(key);
        self.payload_by_key.remove(key);
        self.take_timer(key);
        if let Some(run_id) = key.strip_prefix("run:").filter(|run_id| !run_id.is_empty()) {
            self.run_ids.remove(run_id);
        }
    }

    fn clear_for_payload(&mut self, payload: &JsonObject) {
        if let Some(run_id) = first_field_str(payload, &["runId", "run_id"]) {
            self.clear_key(&format!("run:{run_id}"));
        }
        if let Some(request_id) = first_field_str(payload, &["requestId", "request_id"]) {
            self.clear_key(&format!("request:{request_id}"));
        }
    }

    pub(crate) fn abort_timers(&mut self) {
        for (_, (_, timer)) in self.flush_timers.drain() {
            timer.abort();
        }
    }
}

/// `sessionKey` from the payload, its nested `payload`, then its `data`.
pub fn resolve_session_key(payload: &JsonObject) -> Option<&str> {
    const KEYS: [&str; 2] = ["sessionKey", "session_key"];
    first_field_str(payload, &KEYS)
        .or_else(|| as_object(payload.get("payload")).and_then(|nested| first_field_str(nested, &KEYS)))
        .or_else(|| as_object(payload.get("data")).and_then(|data| first_field_str(data, &KEYS)))
}

pub fn cron_stream_key(payload: &JsonObject) -> Option<String> {
    if let Some(run_id) = first_field_str(payload, &["runId", "run_id"]) {
        return Some(format!("run:{run_id}"));
    }
    first_field_str(payload, &["requestId", "request_id"]).map(|request_id| format!("request:{request_id}"))
}

/// Structured blocks of an agent `assistant` event: `data.content`, or `data` itself when typed.
fn stream_content_blocks(data: &JsonObject) -> Vec<&JsonObject> {
    match data.get("content") {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_object).collect(),
        Some(Value::Object(block)) => vec![block],
        _ if data.get("type").is_some_and(Value::is_string) => vec![data],
        _ => Vec::new(),
    }
}

pub(crate) fn thinking_text(block: &JsonObject) -> Option<String> {
    normalize_text(block.get("thinking")).or_else(|| normalize_text(block.get("text")))
}

fn gateway_event_before(event: &str, payload: &JsonObject) -> Value {
    json!({"type": "event", "event": event, "payload": payload})
}

fn translate_assistant_stream(run: &mut PromptRun, data: &JsonObject, emitter: &mut RunEmitter<'_>) {
    run.has_assistant_stream = true;
    let text = text_chunk(data.get("delta")).or_else(|| text_chunk(data.get("text")));
    if let Some(text) = text {
        emitter.emit(text_chunk_update("agent_message_chunk", text));
    }
    for block in stream_content_blocks(data) {
        match field_str(block, "type") {
            Some("thinking") => {
                run.has_thinking_stream = true;
                if let Some(thought) = thinking_text(block) {
                    emitter.emit(text_chunk_update("agent_thought_chunk", &thought));
                }
            }
            Some("toolCall") => {
                emitter.spacer();
                run.has_tool_start_stream = true;
                let tool_call_id = run.resolve_tool_call_id(block, ToolPhase::Start);
                emitter.emit(tool_call_update(
                    &tool_call_id,
                    &tool_title(block),
                    &tool_arguments(block),
                ));
            }
            Some("toolResult") => {
                emitter.spacer();
                run.has_tool_result_stream = true;
                let tool_call_id = run.resolve_tool_call_id(block, ToolPhase::Result);
                if let Some(result_text) = tool_result_text(block, false) {
                    emitter.emit(tool_result_update(
                        &tool_call_id,
                        Some(&tool_title(block)),
                        &result_text,
                    ));
                }
            }
            _ => {
                let Some(normalized) = to_session_content_block(block) else {
                    continue;
                };
                if text.is_some() && trimmed_str(normalized.get("type")) == Some("text") {
                    continue;
                }
                emitter.emit(message_chunk("agent_message_chunk", normalized));
            }
        }
    }
}

fn translate_tool_stream(run: &mut PromptRun, data: &JsonObject, emitter: &mut RunEmitter<'_>) {
    let phase = ToolPhase::parse(field_str(data, "phase"));
    let tool_call_id = run.resolve_tool_call_id(data, phase);
    match phase {
        ToolPhase::Start => {
            emitter.spacer();
            run.has_tool_start_stream = true;
            emitter.emit(tool_call_update(
                &tool_call_id,
                &tool_title(data),
                &tool_arguments(data),
            ));
        }
        ToolPhase::Result => {
            emitter.spacer();
            run.has_tool_result_stream = true;
            let present = |key: &str| data.get(key).filter(|value| !value.is_null());
            let result_text = match present("result").or_else(|| present("output")) {
                Some(Value::String(text)) => text.clone(),
                Some(other) => pretty_json(other),
                None => pretty_json(&Value::Object(data.clone())),
            };
            emitter.emit(tool_result_update(&tool_call_id, None, &result_text));
        }
        ToolPhase::Other => {}
    }
}

/// Chat replay of assistant content: only what the agent stream has not already shown.
fn replay_chat_assistant(run: &mut PromptRun, message: &JsonObject, emitter: &mut RunEmitter<'_>) {
    for block in assistant_content_blocks(message.get("content")) {
        let Some(block) = block.as_object() else {
            continue;
        };
        let Some(block_type) = field_str(block, "type") else {
            continue;
        };
        match block_type {
            "thinking" => {
                if run.has_thinking_stream {
                    continue;
                }
                let Some(thought) = thinking_text(block) else {
                    continue;
                };
                if run.mark_replayed(format!("chat:thinking:{thought}")) {
                    emitter.emit(text_chunk_update("agent_thought_chunk", &thought));
                }
            }
            "toolCall" => {
                emitter.spacer();
                if run.has_tool_start_stream {
                    continue;
                }
                let tool_call_id = run.resolve_tool_call_id(block, ToolPhase::Start);
                let args = tool_arguments(block);
                if run.mark_replayed(format!("chat:tool_start:{tool_call_id}:{args}")) {
                    emitter.emit(tool_call_update(&tool_call_id, &tool_title(block), &args));
                }
            }
            "toolResult" => {
                emitter.spacer();
                if run.has_tool_result_stream {
                    continue;
                }
                let tool_call_id = run.resolve_tool_call_id(block, ToolPhase::Result);
                let Some(result_text) = tool_result_text(block, false) else {
                    continue;
                };
                if run.mark_replayed(format!("chat:tool_result:{tool_call_id}:{result_text}")) {
                    emitter.emit(tool_result_update(
                        &tool_call_id,
                        Some(&tool_title(block)),
                        &result_text,
                    ));
                }
            }
            _ => {
                let Some(normalized) = to_session_content_block(block) else {
                    continue;
                };
                if trimmed_str(normalized.get("type")) == Some("text") {
                    if run.has_assistant_stream {
                        continue;
                    }
                    let delta = trimmed_str(normalized.get("text")).and_then(|text| run.chat_delta_text(text));
                    if let Some(delta) = delta {
                        emitter.emit(text_chunk_update("agent_message_chunk", &delta));
                    }
                    continue;
                }
                if run.mark_replayed(format!("chat:assistant_chunk:{normalized}")) {
                    emitter.emit(message_chunk("agent_message_chunk", normalized));
                }
            }
        }
    }
}

fn replay_chat_tool_result(run: &mut PromptRun, message: &JsonObject, emitter: &mut RunEmitter<'_>) {
    if run.has_tool_result_stream {
        return;
    }
    let Some(tool_call_id) = first_field_str(message, &["toolCallId", "tool_call_id"]) else {
        return;
    };
    let title = first_field_str(message, &["toolName", "tool_name"]).unwrap_or("tool");
    let Some(result_text) = extract_message_text(message.get("content")) else {
        return;
    };
    if run.mark_replayed(format!("chat:tool_result:{tool_call_id}:{result_text}")) {
        emitter.emit(tool_result_update(tool_call_id, Some(title), &result_text));
    }
}

impl BridgeCore {
    /// Gateway request id of the open run `payload` belongs to, if any.
    fn correlate_open_run(&self, payload: &JsonObject) -> Option<String> {
        self.state
            .resolve_prompt_run(payload)
            .filter(|request_id| self.state.prompt(request_id).is_some_and(|run| !run.done))
    }

    fn obs_context(&self, event: &str, payload: &JsonObject, location: &'static str) -> Option<ObsContext> {
        self.outbound
            .obs_enabled()
            .then(|| ObsContext::gateway(gateway_event_before(event, payload), location))
    }

    /// Binds `runId` on success; a non-ok response fails the prompt.
    pub(crate) fn handle_gateway_response(&mut self, frame: &JsonObject) {
        let Some(request_id) = field_str(frame, "id") else {
            return;
        };
        if !self.state.prompt(request_id).is_some_and(|run| !run.done) {
            return;
        }
        if frame.get("ok").and_then(Value::as_bool) != Some(true) {
            let error = frame.get("error").cloned().unwrap_or(Value::Null);
            let message = as_object(Some(&error))
                .and_then(|error| field_str(error, "message"))
                .unwrap_or("gateway returned error")
                .to_string();
            self.fail_prompt(
                request_id,
                BridgeError::new(GATEWAY_RESPONSE_ERROR, message).with_data(error),
            );
            return;
        }
        if let Some(run_id) = as_object(frame.get("payload")).and_then(|payload| field_str(payload, "runId")) {
            self.state.bind_run_id(request_id, run_id);
        }
    }

    pub(crate) fn handle_cron_event(&mut self, payload: &JsonObject) {
        let cron_payload = as_object(payload.get("payload")).unwrap_or(payload);
        let session_key = resolve_session_key(cron_payload).or_else(|| resolve_session_key(payload));
        if session_key.is_some_and(|key| key != MAIN_SESSION_KEY) {
            return;
        }
        let run_id = first_field_str(cron_payload, &["runId", "run_id"])
            .or_else(|| first_field_str(payload, &["runId", "run_id"]));
        self.cron.note_signal(run_id, now_ms());
    }

    pub(crate) fn handle_agent_event(&mut self, payload: &JsonObject) {
        let Some(request_id) = self.correlate_open_run(payload) else {
            self.handle_uncorrelated_agent_event(payload);
            return;
        };
        let empty = JsonObject::new();
        let data = as_object(payload.get("data")).unwrap_or(&empty);
        let stream = field_str(payload, "stream");
        if stream == Some("lifecycle") {
            self.handle_lifecycle(&request_id, payload, data);
            return;
        }
        let obs = self.obs_context("agent", payload, AGENT_LOCATION);
        let timestamp = payload_timestamp(payload);
        let Some(run) = self.state.prompt_mut(&request_id) else {
            return;
        };
        let session_id = run.session_id.clone();
        let mut emitter = RunEmitter {
            outbound: &mut self.outbound,
            stream: self.current_stream.as_ref(),
            session_id: &session_id,
            meta: UpdateMeta::request(&run.rpc_id).with_timestamp(timestamp),
            obs,
        };
        match stream {
            Some("assistant") => translate_assistant_stream(run, data, &mut emitter),
            Some("thinking") => {
                run.has_thinking_stream = true;
                if let Some(text) = text_chunk(data.get("delta")).or_else(|| text_chunk(data.get("text"))) {
                    emitter.emit(text_chunk_update("agent_thought_chunk", text));
                }
            }
            Some("tool") => translate_tool_stream(run, data, &mut emitter),
            _ => {}
        }
    }

    fn handle_lifecycle(&mut self, request_id: &str, payload: &JsonObject, data: &JsonObject) {
        let phase = field_str(data, "phase");
        if phase == Some("start") {
            self.current_stream = Some(crate::AssistantStreamQueue::new());
        } else if let Some(stream) = self.current_stream.take() {
            stream.close();
        }
        match phase {
            Some("end") => {
                self.cron.clear_for_payload(payload);
                self.replay_missing_prompt_artifacts(request_id);
                self.complete_prompt(request_id, StopReason::EndTurn);
            }
            Some("cancel" | "cancelled") => {
                self.cron.clear_for_payload(payload);
                self.complete_prompt(request_id, StopReason::Cancelled);
            }
            Some("error") => {
                self.cron.clear_for_payload(payload);
                let message = field_str(data, "message")
                    .or_else(|| as_object(data.get("error")).and_then(|error| field_str(error, "message")))
                    .unwrap_or("gateway lifecycle error")
                    .to_string();
                self.fail_prompt(
                    request_id,
                    BridgeError::new(GATEWAY_LIFECYCLE_ERROR, message).with_data(Value::Object(data.clone())),
                );
            }
            _ => {}
        }
    }

    pub(crate) fn handle_chat_event(&mut self, payload: &JsonObject) {
        let Some(request_id) = self.correlate_open_run(payload) else {
            self.handle_uncorrelated_chat_event(payload);
            return;
        };
        let Some(message) = as_object(payload.get("message")) else {
            return;
        };
        let Some(role) = field_str(message, "role") else {
            return;
        };
        let obs = self.obs_context("chat", payload, CHAT_LOCATION);
        let timestamp = payload_timestamp(payload);
        let Some(run) = self.state.prompt_mut(&request_id) else {
            return;
        };
        let session_id = run.session_id.clone();
        let mut emitter = RunEmitter {
            outbound: &mut self.outbound,
            stream: None,
            session_id: &session_id,
            meta: UpdateMeta::request(&run.rpc_id).with_timestamp(timestamp),
            obs,
        };
        match role {
            "assistant" => replay_chat_assistant(run, message, &mut emitter),
            "toolResult" => replay_chat_tool_result(run, message, &mut emitter),
            _ => {}
        }
    }

    /// Cron user turns on the main session are echoed as user chunks.
    fn handle_uncorrelated_chat_event(&mut self, payload: &JsonObject) {
        if resolve_session_key(payload) != Some(MAIN_SESSION_KEY) {
            return;
        }
        if !self.cron.is_candidate(payload, now_ms()) {
            return;
        }
        let Some(message) = as_object(payload.get("message")) else {
            return;
        };
        if field_str(message, "role") != Some("user") {
            return;
        }
        let obs = self.obs_context("chat", payload, CHAT_CRON_LOCATION);
        let meta = self.cron.resolve_meta(payload);
        let content = message.get("content");
        let blocks: Vec<&JsonObject> = match content {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_object).collect(),
            Some(Value::Object(block)) => vec![block],
            _ => Vec::new(),
        };
        let mut forwarded = false;
        for block in blocks {
            let Some(normalized) = to_session_content_block(block) else {
                continue;
            };
            self.outbound.send_session_update(
                MAIN_SESSION_KEY,
                message_chunk("user_message_chunk", normalized),
                &meta,
                obs.clone(),
            );
            forwarded = true;
        }
        if forwarded {
            return;
        }
        if let Some(text) = extract_message_text(content) {
            self.outbound.send_session_update(
                MAIN_SESSION_KEY,
                text_chunk_update("user_message_chunk", &text),
                &meta,
                obs,
            );
        }
    }

    fn handle_uncorrelated_agent_event(&mut self, payload: &JsonObject) {
        let empty = JsonObject::new();
        let data = as_object(payload.get("data")).unwrap_or(&empty);
        match field_str(payload, "stream") {
            Some("lifecycle") => {
                match field_str(data, "phase") {
                    Some("end") => {
                        if let Some(key) = cron_stream_key(payload) {
                            self.flush_cron_key(&key, FlushReason::End, Some(payload));
                        }
                        self.cron.clear_for_payload(payload);
                    }
                    Some("cancel" | "cancelled" | "error") => self.cron.clear_for_payload(payload),
                    _ => {}
                }
                return;
            }
            Some("assistant") => {}
            _ => return,
        }
        if resolve_session_key(payload) != Some(MAIN_SESSION_KEY) {
            return;
        }
        if !self.cron.is_candidate(payload, now_ms()) {
            return;
        }
        let obs = self.obs_context("agent", payload, AGENT_CRON_LOCATION);
        let meta = self.cron.resolve_meta(payload);
        let text = text_chunk(data.get("delta")).or_else(|| text_chunk(data.get("text")));
        if let Some(text) = text {
            self.buffer_cron_text(payload, text, &meta, obs.clone());
        }
        for block in stream_content_blocks(data) {
            if matches!(field_str(block, "type"), Some("thinking" | "toolCall" | "toolResult")) {
                continue;
            }
            let Some(normalized) = to_session_content_block(block) else {
                continue;
            };
            if trimmed_str(normalized.get("type")) == Some("text") {
                if text.is_some() {
                    continue;
                }
                if let Some(block_text) = trimmed_str(normalized.get("text")) {
                    self.buffer_cron_text(payload, block_text, &meta, obs.clone());
                }
                continue;
            }
            self.outbound.send_session_update(
                MAIN_SESSION_KEY,
                message_chunk("agent_message_chunk", normalized),
                &meta,
                obs.clone(),
            );
        }
    }

    fn buffer_cron_text(&mut self, payload: &JsonObject, text: &str, meta: &UpdateMeta, obs: Option<ObsContext>) {
        let Some(normalized) = normalize_str(text) else {
            return;
        };
        let Some(key) = cron_stream_key(payload) else {
            self.outbound.send_session_update(
                MAIN_SESSION_KEY,
                text_chunk_update("agent_message_chunk", &normalized),
                meta,
                obs,
            );
            return;
        };
        self.cron
            .text_by_key
            .entry(key.clone())
            .or_default()
            .push_str(&normalized);
        self.cron
            .payload_by_key
            .insert(key.clone(), Value::Object(payload.clone()));
        self.schedule_cron_flush(key);
    }

    fn schedule_cron_flush(&mut self, key: String) {
        self.cron.next_generation += 1;
        let generation = self.cron.next_generation;
        let timer = self.schedule(
            self.options.cron_flush_timeout_ms,
            BridgeInput::CronFlushTimeout {
                key: key.clone(),
                generation,
            },
        );
        if let Some((_, previous)) = self.cron.flush_timers.insert(key, (generation, timer)) {
            previous.abort();
        }
    }

    /// Stale generations (rescheduled or cleared keys) are ignored.
    pub(crate) fn handle_cron_flush_timeout(&mut self, key: &str, generation: u64) {
        match self.cron.flush_timers.get(key) {
            Some((current, _)) if *current == generation => {
                self.cron.flush_timers.remove(key);
            }
            _ => return,
        }
        self.flush_cron_key(key, FlushReason::Timeout, None);
    }

    fn flush_cron_key(&mut self, key: &str, reason: FlushReason, payload: Option<&JsonObject>) {
        self.cron.take_timer(key);
        let aggregated = self.cron.text_by_key.remove(key);
        let stored_payload = self.cron.payload_by_key.remove(key);
        let Some(text) = aggregated.as_deref().and_then(normalize_str) else {
            if reason == FlushReason::Timeout {
                self.cron.clear_key(key);
            }
            return;
        };
        let meta = self.cron.meta_for_key(Some(key));
        let obs = self.outbound.obs_enabled().then(|| {
            let before = match payload.map(|payload| Value::Object(payload.clone())).or(stored_payload) {
                Some(payload) => json!({"type": "event", "event": "agent", "payload": payload}),
                None => json!({"type": "event", "event": "cron", "payload": {"key": key, "reason": reason.as_str()}}),
            };
            ObsContext::gateway(before, reason.location())
        });
        self.outbound.send_session_update(
            MAIN_SESSION_KEY,
            text_chunk_update("agent_message_chunk", &text),
            &meta,
            obs,
        );
        if reason == FlushReason::Timeout {
            self.cron.clear_key(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::bridge_core::{BridgeOptions, MAIN_SESSION_KEY};
    use crate::local_session_history::{HistoryRole, LocalHistoryEntry};
    use crate::test_support::Harness;

    #[tokio::test]
    async fn functional_agent_stream_deltas_then_end_turn() {
        let mut harness = Harness::new(BridgeOptions::default());
        let request_id = harness.prompt(1, "hi");
        harness.acp.take_frames();

        harness.agent_event(&request_id, "lifecycle", json!({"phase": "start"}));
        harness.agent_event(&request_id, "assistant", json!({"delta": "Hi"}));
        harness.agent_event(&request_id, "assistant", json!({"delta": " there"}));
        harness.agent_event(&request_id, "lifecycle", json!({"phase": "end"}));

        assert_eq!(
            harness.acp.update_texts("agent_message_chunk"),
            vec!["Hi".to_string(), " there".to_string()]
        );
        let responses = harness.acp.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], 1);
        assert_eq!(responses[0]["result"]["stopReason"], "end_turn");
        assert!(harness.core.current_stream().is_none());
    }

    #[tokio::test]
    async fn functional_chat_replay_emits_only_unsent_suffix() {
        let mut harness = Harness::new(BridgeOptions::default());
        let request_id = harness.prompt(1, "hi");
        harness.acp.take_frames();
        for text in ["Hello", "Hello world", "Hello world"] {
            harness.gateway_frame(json!({
                "type": "event",
                "event": "chat",
                "payload": {"requestId": request_id, "message": {"role": "assistant", "content": text}},
            }));
        }
        assert_eq!(
            harness.acp.update_texts("agent_message_chunk"),
            vec!["Hello".to_string(), " world".to_string()]
        );
    }

    #[tokio::test]
    async fn functional_chat_text_is_suppressed_once_agent_stream_seen() {
        let mut harness = Harness::new(BridgeOptions::default());
        let request_id = harness.prompt(1, "hi");
        harness.agent_event(&request_id, "assistant", json!({"delta": "Hi"}));
        harness.acp.take_frames();
        harness.gateway_frame(json!({
            "type": "event",
            "event": "chat",
            "payload": {"requestId": request_id, "message": {"role": "assistant", "content": "Hi"}},
        }));
        assert!(harness.acp.update_texts("agent_message_chunk").is_empty());
    }

    #[tokio::test]
    async fn functional_tool_stream_pairs_synthesized_ids_and_inserts_spacers() {
        let mut harness = Harness::forwarding();
        let request_id = harness.prompt(1, "run it");
        harness.acp.take_frames();
        harness.agent_event(
            &request_id,
            "tool",
            json!({"phase": "start", "name": "bash", "args": {"cmd": "ls"}}),
        );
        harness.agent_event(&request_id, "tool", json!({"phase": "result", "result": "ok"}));

        let updates = harness.acp.updates();
        let kinds = updates
            .iter()
            .map(|update| update["sessionUpdate"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec!["agent_message_chunk", "tool_call", "agent_message_chunk", "tool_call_update"]
        );
        let expected_id = format!("tc_{request_id}_1");
        assert_eq!(updates[1]["toolCallId"], expected_id.as_str());
        assert_eq!(updates[1]["title"], "bash");
        assert_eq!(updates[3]["toolCallId"], expected_id.as_str());
        assert_eq!(updates[3]["content"][0]["content"]["text"], "ok");
        assert!(updates[3].get("title").is_none());
    }

    #[tokio::test]
    async fn functional_lifecycle_error_and_response_error_fail_prompt() {
        let mut harness = Harness::new(BridgeOptions::default());
        let first = harness.prompt(1, "a");
        let second = harness.prompt(2, "b");
        harness.acp.take_frames();

        harness.agent_event(
            &first,
            "lifecycle",
            json!({"phase": "error", "error": {"message": "model exploded"}}),
        );
        harness.gateway_frame(json!({"type": "res", "id": second, "ok": false, "error": {"code": "busy"}}));

        let responses = harness.acp.responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["error"]["code"], -32021);
        assert_eq!(responses[0]["error"]["message"], "model exploded");
        assert_eq!(responses[1]["error"]["code"], -32020);
        assert_eq!(responses[1]["error"]["message"], "gateway returned error");
        assert_eq!(responses[1]["error"]["data"]["code"], "busy");
    }

    #[tokio::test]
    async fn functional_run_id_binding_correlates_later_events() {
        let mut harness = Harness::new(BridgeOptions::default());
        let request_id = harness.prompt(1, "a");
        harness.gateway_frame(json!({"type": "res", "id": request_id, "ok": true, "payload": {"runId": "run_1"}}));
        harness.acp.take_frames();
        harness.gateway_frame(json!({
            "type": "event",
            "event": "agent",
            "payload": {"runId": "run_1", "stream": "assistant", "data": {"text": "bound"}},
        }));
        assert_eq!(harness.acp.update_texts("agent_message_chunk"), vec!["bound".to_string()]);
    }

    #[tokio::test]
    async fn functional_cron_text_is_buffered_and_flushed_on_lifecycle_end() {
        let mut harness = Harness::new(BridgeOptions::default());
        harness.gateway_frame(json!({
            "type": "event",
            "event": "cron",
            "payload": {"payload": {"sessionKey": MAIN_SESSION_KEY, "runId": "cron_1"}},
        }));
        assert!(harness.core.cron.is_cron_run("cron_1"));
        for delta in ["Daily ", "report"] {
            harness.gateway_frame(json!({
                "type": "event",
                "event": "agent",
                "payload": {
                    "runId": "cron_1",
                    "sessionKey": MAIN_SESSION_KEY,
                    "stream": "assistant",
                    "ts": 1_700_000_000_000_i64,
                    "data": {"delta": delta},
                },
            }));
        }
        assert!(harness.acp.updates().is_empty());
        assert_eq!(harness.core.cron.buffered_text("run:cron_1"), Some("Daily report"));

        harness.gateway_frame(json!({
            "type": "event",
            "event": "agent",
            "payload": {"runId": "cron_1", "stream": "lifecycle", "data": {"phase": "end"}},
        }));
        let frames = harness.acp.with_method("session/update");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["params"]["update"]["content"]["text"], "Daily report");
        assert_eq!(frames[0]["params"]["_meta"]["messageType"], "cron");
        assert_eq!(frames[0]["params"]["_meta"]["timestamp"], 1_700_000_000_000_i64);
        assert!(frames[0]["params"]["_meta"].get("requestId").is_none());
        assert!(!harness.core.cron.is_cron_run("cron_1"));
    }

    #[tokio::test]
    async fn functional_cron_buffer_flushes_after_quiet_period() {
        let mut harness = Harness::new(BridgeOptions {
            cron_flush_timeout_ms: 10,
            ..BridgeOptions::default()
        });
        harness.gateway_frame(json!({"type": "event", "event": "cron", "payload": {}}));
        harness.gateway_frame(json!({
            "type": "event",
            "event": "agent",
            "payload": {"runId": "r", "sessionKey": MAIN_SESSION_KEY, "stream": "assistant", "data": {"delta": "tick"}},
        }));
        harness.pump_one().await;
        assert_eq!(harness.acp.update_texts("agent_message_chunk"), vec!["tick".to_string()]);
        assert!(harness.core.cron.buffered_text("run:r").is_none());
    }

    #[tokio::test]
    async fn regression_uncorrelated_events_outside_cron_window_are_dropped() {
        let mut harness = Harness::new(BridgeOptions::default());
        harness.gateway_frame(json!({
            "type": "event",
            "event": "agent",
            "payload": {"runId": "stray", "sessionKey": MAIN_SESSION_KEY, "stream": "assistant", "data": {"delta": "x"}},
        }));
        harness.gateway_frame(json!({
            "type": "event",
            "event": "chat",
            "payload": {"sessionKey": MAIN_SESSION_KEY, "message": {"role": "user", "content": "x"}},
        }));
        assert!(harness.acp.frames().is_empty());
        assert!(!harness.core.cron.is_cron_run("stray"));
    }

    #[tokio::test]
    async fn functional_cron_user_chat_is_echoed() {
        let mut harness = Harness::new(BridgeOptions::default());
        harness.gateway_frame(json!({"type": "event", "event": "cron", "payload": {"sessionKey": MAIN_SESSION_KEY}}));
        harness.gateway_frame(json!({
            "type": "event",
            "event": "chat",
            "payload": {"sessionKey": MAIN_SESSION_KEY, "message": {"role": "user", "content": "scheduled task"}},
        }));
        assert_eq!(
            harness.acp.update_texts("user_message_chunk"),
            vec!["scheduled task".to_string()]
        );
    }

    #[tokio::test]
    async fn functional_end_replays_local_tool_artifacts_missed_by_stream() {
        let mut harness = Harness::forwarding();
        let request_id = harness.prompt(1, "go");
        let now = chrono::Utc::now().timestamp_millis();
        harness.history.set(vec![
            LocalHistoryEntry {
                role: HistoryRole::Assistant,
                content: json!([{"type": "toolCall", "id": "call_1", "name": "read", "arguments": {"path": "a"}}]),
                tool_call_id: None,
                tool_name: None,
                timestamp: Some(now),
            },
            LocalHistoryEntry {
                role: HistoryRole::ToolResult,
                content: json!("file body"),
                tool_call_id: Some("call_1".to_string()),
                tool_name: Some("read".to_string()),
                timestamp: Some(now),
            },
            LocalHistoryEntry {
                role: HistoryRole::Assistant,
                content: json!("old answer"),
                tool_call_id: None,
                tool_name: None,
                timestamp: Some(now - 60_000),
            },
        ]);
        harness.acp.take_frames();
        harness.agent_event(&request_id, "lifecycle", json!({"phase": "end"}));

        let updates = harness.acp.updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0]["sessionUpdate"], "tool_call");
        assert_eq!(updates[0]["toolCallId"], "call_1");
        assert_eq!(updates[1]["sessionUpdate"], "tool_call_update");
        assert_eq!(updates[1]["content"][0]["content"]["text"], "file body");
        assert_eq!(harness.acp.responses()[0]["result"]["stopReason"], "end_turn");
    }
}
