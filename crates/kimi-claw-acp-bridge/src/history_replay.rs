//! Transcript replay: gateway `chat.history`, local session files on
//! `session/load`, and artifacts a finished run never streamed live.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::acp_outbound::{RpcId, UpdateMeta};
use crate::bridge_core::{BridgeCore, BridgeInput, RunEmitter};
use crate::content_blocks::{
    assistant_content_blocks, extract_message_text, message_chunk, text_chunk_update,
    to_session_content_block, tool_arguments, tool_call_update, tool_result_text,
    tool_result_update, tool_title, OCTET_STREAM,
};
use crate::gateway_events::thinking_text;
use crate::local_session_history::{HistoryRole, LocalHistoryEntry};
use crate::payload_fields::{
    as_object, field_str, first_field_str, normalize_text, timestamp_value, trimmed_str, JsonObject,
};
use crate::prompt_converter::KIMI_FILE_URI_PREFIX;
use crate::session_state::{PendingHistoryRequest, PromptRun, ToolPhase};

pub const HISTORY_FETCH_LIMIT: u64 = 100;
/// Local entries this far before a run started still count as part of it.
pub const LOCAL_REPLAY_SKEW_MS: i64 = 2_000;

static KIMI_REF_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<KIMI_REF\b[^>]*/>\s*$").expect("kimi ref line regex"));
static KIMI_REF_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\bid\s*=\s*"([^"]+)""#).expect("kimi ref id regex"));
static KIMI_REF_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\bname\s*=\s*"([^"]+)""#).expect("kimi ref name regex"));

/// Splits standalone `<KIMI_REF ... />` lines out of multi-line text, keeping order.
pub fn split_kimi_ref_text(text: &str) -> Vec<String> {
    if !text.contains("<KIMI_REF") || !text.contains('\n') {
        return vec![text.to_string()];
    }
    fn flush(buffer: &mut Vec<&str>, chunks: &mut Vec<String>) {
        if buffer.is_empty() {
            return;
        }
        let joined = buffer.join("\n");
        buffer.clear();
        if !joined.trim().is_empty() {
            chunks.push(joined);
        }
    }
    let mut chunks = Vec::new();
    let mut buffer = Vec::new();
    for line in text.split('\n') {
        let trimmed = line.trim();
        if KIMI_REF_LINE.is_match(trimmed) {
            flush(&mut buffer, &mut chunks);
            chunks.push(trimmed.to_string());
            continue;
        }
        buffer.push(line);
    }
    flush(&mut buffer, &mut chunks);
    if chunks.is_empty() {
        return vec![text.to_string()];
    }
    chunks
}

/// `kimi-file://` resource link for a `<KIMI_REF id="..." name="..." />` line.
pub fn kimi_ref_resource_link(line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if !trimmed.starts_with("<KIMI_REF") {
        return None;
    }
    let file_id = KIMI_REF_ID
        .captures(trimmed)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str().trim())
        .filter(|file_id| !file_id.is_empty())?;
    let name = KIMI_REF_NAME
        .captures(trimmed)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str().trim())
        .filter(|name| !name.is_empty());
    let mut link = json!({
        "type": "resource_link",
        "uri": format!("{KIMI_FILE_URI_PREFIX}{file_id}"),
        "mimeType": name.and_then(guess_mime_type).unwrap_or(OCTET_STREAM),
    });
    if let (Some(name), Some(object)) = (name, link.as_object_mut()) {
        object.insert("name".to_string(), json!(name));
    }
    Some(link)
}

pub fn guess_mime_type(file_name: &str) -> Option<&'static str> {
    let lower = file_name.trim().to_ascii_lowercase();
    if lower.is_empty() {
        return None;
    }
    const BY_SUFFIX: [(&str, &str); 13] = [
        (".png", "image/png"),
        (".jpg", "image/jpeg"),
        (".jpeg", "image/jpeg"),
        (".webp", "image/webp"),
        (".gif", "image/gif"),
        (".bmp", "image/bmp"),
        (".svg", "image/svg+xml"),
        (".pdf", "application/pdf"),
        (".txt", "text/plain"),
        (".md", "text/markdown"),
        (".markdown", "text/markdown"),
        (".json", "application/json"),
        (".csv", "text/csv"),
    ];
    BY_SUFFIX
        .iter()
        .find(|(suffix, _)| lower.ends_with(suffix))
        .map(|(_, mime)| *mime)
}

fn replay_local_assistant(run: &mut PromptRun, content: &Value, emitter: &mut RunEmitter<'_>) {
    for block in assistant_content_blocks(Some(content)) {
        let Some(block) = block.as_object() else {
            continue;
        };
        match field_str(block, "type") {
            Some("thinking") => {
                let Some(thought) = thinking_text(block) else {
                    continue;
                };
                if !run.mark_replayed(format!("local:thinking:{thought}")) {
                    continue;
                }
                run.has_thinking_stream = true;
                emitter.emit(text_chunk_update("agent_thought_chunk", &thought));
            }
            Some("toolCall") => {
                let tool_call_id = run.resolve_tool_call_id(block, ToolPhase::Start);
                let args = tool_arguments(block);
                if !run.mark_replayed(format!("local:tool_start:{tool_call_id}:{args}")) {
                    continue;
                }
                run.has_tool_start_stream = true;
                emitter.emit(tool_call_update(&tool_call_id, &tool_title(block), &args));
            }
            Some("toolResult") => {
                let tool_call_id = run.resolve_tool_call_id(block, ToolPhase::Result);
                let Some(result_text) = tool_result_text(block, true) else {
                    continue;
                };
                if !run.mark_replayed(format!("local:tool_result:{tool_call_id}:{result_text}")) {
                    continue;
                }
                run.has_tool_result_stream = true;
                emitter.emit(tool_result_update(
                    &tool_call_id,
                    Some(&tool_title(block)),
                    &result_text,
                ));
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
                if run.mark_replayed(format!("local:assistant_chunk:{normalized}")) {
                    emitter.emit(message_chunk("agent_message_chunk", normalized));
                }
            }
        }
    }
}

fn replay_local_tool_result(run: &mut PromptRun, entry: &LocalHistoryEntry, emitter: &mut RunEmitter<'_>) {
    let Some(tool_call_id) = entry.tool_call_id.as_deref() else {
        return;
    };
    let Some(result_text) = extract_message_text(Some(&entry.content)) else {
        return;
    };
    if !run.mark_replayed(format!("local:tool_result:{tool_call_id}:{result_text}")) {
        return;
    }
    run.has_tool_result_stream = true;
    let title = entry.tool_name.as_deref().unwrap_or("tool");
    emitter.emit(tool_result_update(tool_call_id, Some(title), &result_text));
}

fn contains_kimi_ref(blocks: &[Value]) -> bool {
    blocks.iter().filter_map(Value::as_object).any(|block| {
        field_str(block, "type") == Some("text")
            && normalize_text(block.get("text"))
                .is_some_and(|text| text.contains("<KIMI_REF"))
    })
}

/// Inline media already referenced by a KIMI_REF marker is dropped from replay.
fn is_inlined_media(normalized: &Value) -> bool {
    matches!(trimmed_str(normalized.get("type")), Some("image" | "file"))
        && trimmed_str(normalized.get("data")).is_some()
        && trimmed_str(normalized.get("uri")).is_none()
}

impl BridgeCore {
    /// Requests `chat.history`; `reply_on_complete` answers `bridge_request_id` once replay ends.
    pub(crate) fn fetch_history(
        &mut self,
        session_id: &str,
        reply_on_complete: bool,
        bridge_request_id: Option<RpcId>,
    ) {
        let pending = PendingHistoryRequest {
            session_id: session_id.to_string(),
            bridge_request_id,
            reply_on_complete,
            timeout: None,
        };
        if !self.gateway.is_ready() {
            tracing::warn!(session_id, "skipping history fetch, gateway not ready");
            self.complete_history(pending);
            return;
        }
        let history_request_id = format!("hist_{}", Uuid::new_v4().simple());
        let sent = self.gateway.send(json!({
            "type": "req",
            "id": history_request_id,
            "method": "chat.history",
            "params": {"sessionKey": session_id, "limit": HISTORY_FETCH_LIMIT},
        }));
        if !sent {
            tracing::warn!(session_id, "failed to send history request to gateway");
            self.complete_history(pending);
            return;
        }
        self.state.set_pending_history(&history_request_id, pending);
        let timeout_ms = self.options.history_pending_timeout_ms;
        if timeout_ms > 0 {
            let timer = self.schedule(
                timeout_ms,
                BridgeInput::HistoryTimeout {
                    history_request_id: history_request_id.clone(),
                },
            );
            self.state.attach_history_timeout(&history_request_id, timer);
        }
        tracing::info!(
            request_id = %history_request_id,
            session_id,
            session_key = session_id,
            "history request sent"
        );
    }

    pub(crate) fn handle_history_timeout(&mut self, history_request_id: &str) {
        let Some(pending) = self.state.take_pending_history(history_request_id) else {
            return;
        };
        tracing::warn!(
            request_id = history_request_id,
            session_id = %pending.session_id,
            timeout_ms = self.options.history_pending_timeout_ms,
            "history request timed out"
        );
        self.complete_history(pending);
    }

    fn complete_history(&mut self, pending: PendingHistoryRequest) {
        if !pending.reply_on_complete {
            return;
        }
        if let Some(request_id) = &pending.bridge_request_id {
            self.outbound
                .send_result(request_id, Value::Null, Some(&pending.session_id));
        }
    }

    /// Returns `false` when the frame answers no pending history request.
    pub(crate) fn handle_history_response(&mut self, frame: &JsonObject) -> bool {
        let Some(history_request_id) = field_str(frame, "id") else {
            return false;
        };
        if !self.state.has_pending_history(history_request_id) {
            return false;
        }
        let Some(pending) = self.state.take_pending_history(history_request_id) else {
            return true;
        };
        if frame.get("ok").and_then(Value::as_bool) != Some(true) {
            let message = as_object(frame.get("error"))
                .and_then(|error| field_str(error, "message"))
                .unwrap_or("unknown");
            tracing::warn!(request_id = history_request_id, error = message, "history fetch failed");
            self.complete_history(pending);
            return true;
        }
        let empty = JsonObject::new();
        let payload = as_object(frame.get("payload")).unwrap_or(&empty);
        let mut messages = payload
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if messages.is_empty() {
            let fallback_session_id = field_str(payload, "sessionId").unwrap_or(&pending.session_id);
            let fallback_session_key = field_str(payload, "sessionKey").unwrap_or(&pending.session_id);
            let local = self.history.read_entries(fallback_session_id, fallback_session_key);
            if !local.is_empty() {
                tracing::info!(
                    session_id = fallback_session_id,
                    session_key = fallback_session_key,
                    count = local.len(),
                    "history fallback from local session files"
                );
                messages = local
                    .iter()
                    .map(|entry| Value::Object(entry.to_message()))
                    .collect();
            }
        }
        tracing::info!(request_id = history_request_id, count = messages.len(), "history loaded");
        for message in messages.iter().filter_map(Value::as_object) {
            self.replay_history_message(&pending.session_id, message, pending.bridge_request_id.as_ref());
        }
        self.complete_history(pending);
        true
    }

    /// Replays local session files for `session/load`; returns the entry count.
    pub(crate) fn replay_session_load(&mut self, session_id: &str, request_id: &RpcId) -> usize {
        let entries = self.history.read_entries(session_id, session_id);
        for entry in &entries {
            self.replay_history_message(session_id, &entry.to_message(), Some(request_id));
        }
        entries.len()
    }

    /// Emits locally recorded tool calls, thinking and text that the live stream missed.
    pub(crate) fn replay_missing_prompt_artifacts(&mut self, gateway_request_id: &str) {
        let Some(run) = self.state.prompt(gateway_request_id) else {
            return;
        };
        let session_id = run.session_id.clone();
        let floor = run.started_at_ms - LOCAL_REPLAY_SKEW_MS;
        let scoped = self
            .history
            .read_entries(&session_id, &session_id)
            .into_iter()
            .filter(|entry| entry.timestamp.is_some_and(|timestamp| timestamp >= floor))
            .collect::<Vec<_>>();
        if scoped.is_empty() {
            return;
        }
        let Some(run) = self.state.prompt_mut(gateway_request_id) else {
            return;
        };
        let mut emitter = RunEmitter {
            outbound: &mut self.outbound,
            stream: None,
            session_id: &session_id,
            meta: UpdateMeta::request(&run.rpc_id),
            obs: None,
        };
        for entry in &scoped {
            emitter.meta = UpdateMeta::request(&run.rpc_id).with_timestamp(entry.timestamp);
            match entry.role {
                HistoryRole::Assistant => replay_local_assistant(run, &entry.content, &mut emitter),
                HistoryRole::ToolResult => replay_local_tool_result(run, entry, &mut emitter),
                HistoryRole::User => {}
            }
        }
    }

    fn replay_history_message(&mut self, session_id: &str, message: &JsonObject, request_id: Option<&RpcId>) {
        let Some(role) = field_str(message, "role") else {
            return;
        };
        let meta = UpdateMeta::optional_request(request_id)
            .with_timestamp(timestamp_value(message.get("timestamp")));
        let content = message.get("content");
        match role {
            "user" => self.replay_user_message(session_id, content, &meta),
            "assistant" => self.replay_assistant_message(session_id, content, &meta),
            "toolResult" => {
                let Some(tool_call_id) = first_field_str(message, &["toolCallId", "tool_call_id"]) else {
                    return;
                };
                let Some(result_text) = extract_message_text(content) else {
                    return;
                };
                let title = first_field_str(message, &["toolName", "tool_name"]).unwrap_or("tool");
                self.outbound.send_session_update(
                    session_id,
                    tool_result_update(tool_call_id, Some(title), &result_text),
                    &meta,
                    None,
                );
            }
            _ => {}
        }
    }

    fn replay_user_message(&mut self, session_id: &str, content: Option<&Value>, meta: &UpdateMeta) {
        if let Some(Value::Array(blocks)) = content {
            let has_kimi_ref = contains_kimi_ref(blocks);
            let mut replayed_any = false;
            for block in blocks.iter().filter_map(Value::as_object) {
                let Some(normalized) = to_session_content_block(block) else {
                    continue;
                };
                if has_kimi_ref && is_inlined_media(&normalized) {
                    continue;
                }
                if let Some(text) = trimmed_str(normalized.get("text")).filter(|_| normalized["type"] == "text") {
                    let chunks = split_kimi_ref_text(text);
                    if chunks.len() > 1 {
                        replayed_any = true;
                        for chunk in &chunks {
                            let replay_block = kimi_ref_resource_link(chunk)
                                .unwrap_or_else(|| json!({"type": "text", "text": chunk}));
                            self.outbound.send_session_update(
                                session_id,
                                message_chunk("user_message_chunk", replay_block),
                                meta,
                                None,
                            );
                        }
                        continue;
                    }
                }
                replayed_any = true;
                self.outbound.send_session_update(
                    session_id,
                    message_chunk("user_message_chunk", normalized),
                    meta,
                    None,
                );
            }
            if replayed_any {
                return;
            }
        }
        if let Some(text) = extract_message_text(content) {
            self.outbound.send_session_update(
                session_id,
                text_chunk_update("user_message_chunk", &text),
                meta,
                None,
            );
        }
    }

    fn replay_assistant_message(&mut self, session_id: &str, content: Option<&Value>, meta: &UpdateMeta) {
        match content {
            Some(Value::Array(blocks)) => {
                for block in blocks.iter().filter_map(Value::as_object) {
                    if let Some(update) = self.history_assistant_update(block) {
                        self.outbound.send_session_update(session_id, update, meta, None);
                    }
                }
                return;
            }
            Some(Value::Object(block)) => {
                if let Some(normalized) = to_session_content_block(block) {
                    self.outbound.send_session_update(
                        session_id,
                        message_chunk("agent_message_chunk", normalized),
                        meta,
                        None,
                    );
                    return;
                }
            }
            _ => {}
        }
        if let Some(text) = extract_message_text(content) {
            self.outbound.send_session_update(
                session_id,
                text_chunk_update("agent_message_chunk", &text),
                meta,
                None,
            );
        }
    }

    fn history_assistant_update(&self, block: &JsonObject) -> Option<Value> {
        const ID_KEYS: [&str; 3] = ["id", "toolCallId", "tool_call_id"];
        match field_str(block, "type") {
            Some("thinking") => {
                thinking_text(block).map(|thought| text_chunk_update("agent_thought_chunk", &thought))
            }
            Some("toolCall") => {
                let tool_call_id = first_field_str(block, &ID_KEYS)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("tc_hist_{}", self.outbound.peek_next_index()));
                Some(tool_call_update(
                    &tool_call_id,
                    &tool_title(block),
                    &tool_arguments(block),
                ))
            }
            Some("toolResult") => {
                let tool_call_id = first_field_str(block, &ID_KEYS)?;
                let result_text = tool_result_text(block, true)?;
                Some(tool_result_update(
                    tool_call_id,
                    Some(&tool_title(block)),
                    &result_text,
                ))
            }
            _ => to_session_content_block(block)
                .map(|normalized| message_chunk("agent_message_chunk", normalized)),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{guess_mime_type, kimi_ref_resource_link, split_kimi_ref_text};
    use crate::bridge_core::{BridgeOptions, MAIN_SESSION_KEY};
    use crate::local_session_history::{HistoryRole, LocalHistoryEntry};
    use crate::test_support::Harness;

    #[test]
    fn unit_split_kimi_ref_text_isolates_marker_lines() {
        let text = "look at this\n<KIMI_REF type=\"file\" path=\"/p\" name=\"a.png\" id=\"f1\" />\nthanks";
        assert_eq!(
            split_kimi_ref_text(text),
            vec![
                "look at this".to_string(),
                "<KIMI_REF type=\"file\" path=\"/p\" name=\"a.png\" id=\"f1\" />".to_string(),
                "thanks".to_string(),
            ]
        );
        assert_eq!(split_kimi_ref_text("single <KIMI_REF id=\"x\" />"), vec!["single <KIMI_REF id=\"x\" />"]);
    }

    #[test]
    fn unit_split_kimi_ref_text_keeps_order_with_two_markers_and_leading_marker() {
        let text = "a\n<KIMI_REF id=\"f1\" name=\"one.png\" />\nb\n<KIMI_REF id=\"f2\" name=\"two.pdf\" />\nc";
        assert_eq!(
            split_kimi_ref_text(text),
            vec![
                "a".to_string(),
                "<KIMI_REF id=\"f1\" name=\"one.png\" />".to_string(),
                "b".to_string(),
                "<KIMI_REF id=\"f2\" name=\"two.pdf\" />".to_string(),
                "c".to_string(),
            ]
        );

        let leading = "<KIMI_REF id=\"f1\" name=\"one.png\" />\ncaption";
        assert_eq!(
            split_kimi_ref_text(leading),
            vec!["<KIMI_REF id=\"f1\" name=\"one.png\" />".to_string(), "caption".to_string()]
        );
    }

    #[test]
    fn unit_kimi_ref_line_becomes_resource_link() {
        let link = kimi_ref_resource_link("<KIMI_REF type=\"file\" path=\"\" NAME=\"Report.PDF\" id=\" f9 \" />")
            .expect("link");
        assert_eq!(link["uri"], "kimi-file://f9");
        assert_eq!(link["name"], "Report.PDF");
        assert_eq!(link["mimeType"], "application/pdf");
        let unnamed = kimi_ref_resource_link("<KIMI_REF id=\"f2\" />").expect("link");
        assert_eq!(unnamed["mimeType"], "application/octet-stream");
        assert!(unnamed.get("name").is_none());
        assert!(kimi_ref_resource_link("plain text").is_none());
        assert_eq!(guess_mime_type("notes.markdown"), Some("text/markdown"));
        assert_eq!(guess_mime_type("archive.zip"), None);
    }

    #[tokio::test]
    async fn functional_history_response_replays_messages_with_bridge_request_id() {
        let mut harness = Harness::forwarding();
        harness.bridge(json!({"jsonrpc": "2.0", "id": 1, "method": "session/new", "params": {}}));
        let history_id = harness.gateway.with_method("chat.history")[0]["id"]
            .as_str()
            .map(str::to_string)
            .expect("history id");
        harness.acp.take_frames();

        harness.gateway_frame(json!({
            "type": "res",
            "id": history_id,
            "ok": true,
            "payload": {"messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "see\n<KIMI_REF type=\"file\" path=\"/tmp/a.png\" name=\"a.png\" id=\"f1\" />"},
                    {"type": "image", "data": "AAAA", "mimeType": "image/png"}
                ], "timestamp": 1_700_000_000_000_i64},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "toolCall", "name": "read", "arguments": {"path": "a"}},
                    {"type": "text", "text": "done"}
                ]},
                {"role": "toolResult", "toolCallId": "call_1", "content": "ok"}
            ]},
        }));

        let updates = harness.acp.updates();
        let kinds = updates
            .iter()
            .map(|update| update["sessionUpdate"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                "user_message_chunk",
                "user_message_chunk",
                "agent_thought_chunk",
                "tool_call",
                "agent_message_chunk",
                "tool_call_update",
            ]
        );
        assert_eq!(updates[0]["content"]["text"], "see");
        assert_eq!(updates[1]["content"]["uri"], "kimi-file://f1");
        assert_eq!(updates[1]["content"]["mimeType"], "image/png");
        assert_eq!(updates[3]["toolCallId"], "tc_hist_5");
        assert_eq!(updates[5]["title"], "tool");

        let frames = harness.acp.with_method("session/update");
        assert_eq!(frames[0]["params"]["_meta"]["requestId"], 1);
        assert_eq!(frames[0]["params"]["_meta"]["timestamp"], 1_700_000_000_000_i64);
        assert!(harness.acp.responses().is_empty());
        assert_eq!(harness.core.state().pending_history_count(), 0);
    }

    #[tokio::test]
    async fn functional_empty_gateway_history_falls_back_to_local_entries() {
        let mut harness = Harness::new(BridgeOptions::default());
        harness.history.set(vec![LocalHistoryEntry {
            role: HistoryRole::Assistant,
            content: json!("from disk"),
            tool_call_id: None,
            tool_name: None,
            timestamp: Some(5),
        }]);
        harness
            .core
            .fetch_history(MAIN_SESSION_KEY, true, Some(crate::RpcId::from(8)));
        let history_id = harness.gateway.with_method("chat.history")[0]["id"]
            .as_str()
            .map(str::to_string)
            .expect("history id");
        harness.gateway_frame(json!({"type": "res", "id": history_id, "ok": true, "payload": {"messages": []}}));

        assert_eq!(harness.acp.update_texts("agent_message_chunk"), vec!["from disk".to_string()]);
        let responses = harness.acp.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], 8);
        assert!(responses[0]["result"]["_meta"].is_object());
    }

    #[tokio::test]
    async fn regression_history_failure_and_timeout_complete_once() {
        let mut harness = Harness::new(BridgeOptions {
            history_pending_timeout_ms: 10,
            ..BridgeOptions::default()
        });
        harness
            .core
            .fetch_history(MAIN_SESSION_KEY, true, Some(crate::RpcId::from(1)));
        let first = harness.gateway.with_method("chat.history")[0]["id"]
            .as_str()
            .map(str::to_string)
            .expect("history id");
        harness.gateway_frame(json!({"type": "res", "id": first, "ok": false, "error": {"message": "nope"}}));
        harness.gateway_frame(json!({"type": "res", "id": first, "ok": true}));
        assert_eq!(harness.acp.responses().len(), 1);

        harness
            .core
            .fetch_history(MAIN_SESSION_KEY, true, Some(crate::RpcId::from(2)));
        harness.pump_one().await;
        let responses = harness.acp.responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[1]["id"], 2);
        assert_eq!(harness.core.state().pending_history_count(), 0);
    }

    #[tokio::test]
    async fn functional_session_load_replays_local_history_then_replies() {
        let mut harness = Harness::new(BridgeOptions::default());
        harness.history.set(vec![
            LocalHistoryEntry {
                role: HistoryRole::User,
                content: json!([{"type": "text", "text": "question"}]),
                tool_call_id: None,
                tool_name: None,
                timestamp: Some(10),
            },
            LocalHistoryEntry {
                role: HistoryRole::Assistant,
                content: json!([{"type": "text", "text": "answer"}]),
                tool_call_id: None,
                tool_name: None,
                timestamp: Some(11),
            },
        ]);
        harness.bridge(json!({"jsonrpc": "2.0", "id": "load-1", "method": "session/load", "params": {"sessionId": "x"}}));

        assert_eq!(harness.acp.update_texts("user_message_chunk"), vec!["question".to_string()]);
        assert_eq!(harness.acp.update_texts("agent_message_chunk"), vec!["answer".to_string()]);
        let responses = harness.acp.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], "load-1");
        assert_eq!(responses[0]["result"]["_meta"]["sessionId"], MAIN_SESSION_KEY);
        assert!(harness.gateway.frames().is_empty());
    }

    fn user_entry(text: &str, timestamp: i64) -> LocalHistoryEntry {
        LocalHistoryEntry {
            role: HistoryRole::User,
            content: json!([{"type": "text", "text": text}]),
            tool_call_id: None,
            tool_name: None,
            timestamp: Some(timestamp),
        }
    }

    /// `(text, uri)` of each `user_message_chunk` in send order.
    fn user_chunks(harness: &Harness) -> Vec<(String, String)> {
        harness
            .acp
            .updates()
            .into_iter()
            .filter(|update| update["sessionUpdate"] == "user_message_chunk")
            .map(|update| {
                let content = &update["content"];
                (
                    content["type"].as_str().unwrap_or_default().to_string(),
                    content["text"]
                        .as_str()
                        .or_else(|| content["uri"].as_str())
                        .unwrap_or_default()
                        .to_string(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn functional_session_load_splits_user_text_around_file_markers_in_order() {
        let mut harness = Harness::new(BridgeOptions::default());
        harness.history.set(vec![
            user_entry(
                "a\n<KIMI_REF type=\"file\" path=\"/tmp/one.png\" name=\"one.png\" id=\"f1\" />\nb\n<KIMI_REF type=\"file\" path=\"/tmp/two.pdf\" name=\"two.pdf\" id=\"f2\" />\nc",
                10,
            ),
            user_entry("<KIMI_REF type=\"file\" path=\"\" name=\"lead.md\" id=\"f3\" />\ncaption", 11),
        ]);
        harness.bridge(json!({"jsonrpc": "2.0", "id": 4, "method": "session/load", "params": {"sessionId": "x"}}));

        let expected = [
            ("text", "a"),
            ("resource_link", "kimi-file://f1"),
            ("text", "b"),
            ("resource_link", "kimi-file://f2"),
            ("text", "c"),
            ("resource_link", "kimi-file://f3"),
            ("text", "caption"),
        ]
        .iter()
        .map(|(kind, value)| (kind.to_string(), value.to_string()))
        .collect::<Vec<_>>();
        assert_eq!(user_chunks(&harness), expected);

        let links = harness
            .acp
            .updates()
            .into_iter()
            .filter(|update| update["content"]["type"] == "resource_link")
            .collect::<Vec<_>>();
        assert_eq!(links[0]["content"]["mimeType"], "image/png");
        assert_eq!(links[1]["content"]["name"], "two.pdf");
        assert_eq!(links[2]["content"]["mimeType"], "text/markdown");
        let responses = harness.acp.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], 4);
    }

    #[tokio::test]
    async fn functional_session_load_resumes_live_stream_until_closed() {
        let mut harness = Harness::new(BridgeOptions::default());
        let request_id = harness.prompt(1, "hi");
        harness.agent_event(&request_id, "lifecycle", json!({"phase": "start"}));
        harness.agent_event(&request_id, "assistant", json!({"delta": "partial"}));
        harness.acp.take_frames();

        harness.bridge(json!({"jsonrpc": "2.0", "id": 2, "method": "session/load", "params": {"sessionId": "x"}}));
        assert!(harness.acp.responses().is_empty());
        harness.pump_one().await;
        assert_eq!(harness.acp.update_texts("agent_message_chunk"), vec!["partial".to_string()]);

        harness.agent_event(&request_id, "lifecycle", json!({"phase": "end"}));
        harness.pump_one().await;
        let responses = harness.acp.responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["result"]["stopReason"], "end_turn");
        assert_eq!(responses[1]["id"], 2);
    }
}
