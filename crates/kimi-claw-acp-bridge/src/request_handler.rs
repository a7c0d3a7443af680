//! ACP JSON-RPC requests from the remote endpoint.
//!
//! Every session id the client sends is accepted but mapped onto the single
//! gateway main session, so all prompts, history and cancellation act on
//! [`MAIN_SESSION_KEY`].

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use kimi_claw_transport::{ObsEvent, ObsSeverity};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::acp_outbound::{RpcId, UpdateMeta, OBS_COMPONENT};
use crate::bridge_core::{now_ms, post_input, BridgeCore, BridgeInput, StopReason, MAIN_SESSION_KEY};
use crate::bridge_errors::{BridgeError, GATEWAY_LIFECYCLE_TIMEOUT};
use crate::content_blocks::{extract_prompt_blocks, message_chunk, text_chunk_update, PromptBlock};
use crate::file_resolver::{build_resolution_plan, resolve_for_prompt, FileResolution};
use crate::message_filter::sanitize_prompt_payload;
use crate::observability::sanitize_obs_mapping_payload;
use crate::payload_fields::{as_object, field_str, first_field_str, JsonObject};
use crate::prompt_converter::{parse_kimi_file_uri, to_gateway_prompt, GatewayPrompt};
use crate::session_state::{PromptRun, DEFAULT_SESSION_CWD};

pub const ACP_PROTOCOL_VERSION: u64 = 1;
pub const AGENT_NAME: &str = "kimi-claw";
pub const SESSION_TITLE: &str = "OpenClaw Session";
const PROMPT_HOP: &str = "bridge_ws->plugin";
const PROMPT_LOCATION: &str = "AcpGatewayBridge.forwardPromptToGateway";

/// Absent is fine; present values must be non-blank strings.
fn read_optional_non_empty_string<'a>(
    object: &'a JsonObject,
    field: &str,
) -> Result<Option<&'a str>, String> {
    let Some(raw) = object.get(field) else {
        return Ok(None);
    };
    let Some(raw) = raw.as_str() else {
        return Err(format!("{field} must be a string"));
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(format!("{field} must be a non-empty string"));
    }
    Ok(Some(trimmed))
}

fn generated_session_id() -> String {
    format!("sess_{}", Uuid::new_v4().simple())
}

/// `sessionId`, then `_meta.sessionId`/`sessionKey`, then `_meta.openclaw.*`; generated otherwise.
fn resolve_new_session_id(params: &JsonObject) -> Result<String, String> {
    const KEYS: [&str; 2] = ["sessionId", "sessionKey"];
    if let Some(direct) = read_optional_non_empty_string(params, "sessionId")? {
        return Ok(direct.to_string());
    }
    let Some(meta) = as_object(params.get("_meta")) else {
        return Ok(generated_session_id());
    };
    for key in KEYS {
        if let Some(value) = read_optional_non_empty_string(meta, key)? {
            return Ok(value.to_string());
        }
    }
    let Some(openclaw) = as_object(meta.get("openclaw")) else {
        return Ok(generated_session_id());
    };
    for key in KEYS {
        if let Some(value) = read_optional_non_empty_string(openclaw, key)? {
            return Ok(value.to_string());
        }
    }
    Ok(generated_session_id())
}

fn iso_timestamp(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl BridgeCore {
    /// Entry point for every frame received from the ACP endpoint.
    pub fn handle_bridge_message(&mut self, message: &Value) {
        let Some(message) = message.as_object() else {
            return;
        };
        let Some(method) = field_str(message, "method") else {
            return;
        };
        let params = message.get("params");
        let Some(id) = RpcId::from_value(message.get("id")) else {
            if method == "session/cancel" {
                self.handle_session_cancel(None, params);
            }
            return;
        };
        tracing::debug!(method, id = %id, "acp request");
        match method {
            "initialize" => {
                let result = self.initialize_result(params);
                self.outbound.send_result(&id, result, None);
            }
            "session/new" => self.handle_session_new(id, params),
            "session/load" => self.handle_session_load(id, params),
            "session/list" => self.handle_session_list(id),
            "session/prompt" => self.handle_session_prompt(id, params),
            "session/cancel" => self.handle_session_cancel(Some(id), params),
            "session/set_model" => self.outbound.send_result(&id, json!({}), None),
            _ => self
                .outbound
                .send_error(&id, &BridgeError::method_not_found(method), None),
        }
    }

    fn initialize_result(&self, params: Option<&Value>) -> Value {
        let requested = as_object(params).and_then(|params| params.get("protocolVersion"));
        if let Some(requested) = requested.filter(|value| value.is_number()) {
            if requested.as_u64() != Some(ACP_PROTOCOL_VERSION) {
                tracing::warn!(
                    requested = %requested,
                    using = ACP_PROTOCOL_VERSION,
                    "unsupported initialize protocolVersion"
                );
            }
        }
        let instance = &self.options.instance;
        let non_blank = |value: &str| Some(value.trim()).filter(|value| !value.is_empty()).map(str::to_string);
        let instance_id = non_blank(&instance.instance_id).unwrap_or_else(|| "connector-instance".to_string());
        let device_id = non_blank(&instance.device_id).unwrap_or_else(|| instance_id.clone());
        let version = non_blank(&instance.plugin_version)
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
        json!({
            "protocolVersion": ACP_PROTOCOL_VERSION,
            "agentCapabilities": {
                "loadSession": true,
                "promptCapabilities": {"embeddedContext": true, "image": true, "audio": false},
                "sessionCapabilities": {"list": {}},
            },
            "agentInfo": {"name": AGENT_NAME, "version": version},
            "_meta": {"instanceId": instance_id, "deviceId": device_id},
        })
    }

    fn handle_session_new(&mut self, id: RpcId, params: Option<&Value>) {
        let Some(params) = as_object(params) else {
            self.outbound
                .send_error(&id, &BridgeError::invalid_params_detail("params must be object"), None);
            return;
        };
        let parsed = read_optional_non_empty_string(params, "cwd").and_then(|cwd| {
            resolve_new_session_id(params).map(|requested| (cwd.unwrap_or(DEFAULT_SESSION_CWD), requested))
        });
        let (cwd, requested_session_id) = match parsed {
            Ok(parsed) => parsed,
            Err(reason) => {
                self.outbound
                    .send_error(&id, &BridgeError::invalid_params_detail(reason), None);
                return;
            }
        };
        tracing::debug!(
            requested_session_id = %requested_session_id,
            session_key = MAIN_SESSION_KEY,
            "session/new mapped to main session"
        );
        self.state.upsert_session(MAIN_SESSION_KEY, Some(cwd), now_ms());
        self.outbound.send_result(
            &id,
            json!({
                "sessionId": MAIN_SESSION_KEY,
                "modes": {
                    "availableModes": [{"id": "default", "name": "Default", "description": "Default agent mode"}],
                    "currentModeId": "default",
                },
                "_meta": {"sessionKey": MAIN_SESSION_KEY, "instanceId": self.options.instance.instance_id},
            }),
            Some(MAIN_SESSION_KEY),
        );
        self.fetch_history(MAIN_SESSION_KEY, false, Some(id));
    }

    /// Replays local history, then resumes the live assistant stream before replying.
    fn handle_session_load(&mut self, id: RpcId, params: Option<&Value>) {
        let Some(params) = as_object(params) else {
            self.outbound
                .send_error(&id, &BridgeError::invalid_params("invalid params"), None);
            return;
        };
        if field_str(params, "sessionId").is_none() {
            self.outbound
                .send_error(&id, &BridgeError::invalid_params("sessionId is required"), None);
            return;
        }
        self.state.upsert_session(MAIN_SESSION_KEY, None, now_ms());
        let count = self.replay_session_load(MAIN_SESSION_KEY, &id);
        tracing::info!(session_id = MAIN_SESSION_KEY, count, "session/load local replay");

        let Some(stream) = self.current_stream.clone() else {
            self.outbound.send_result(&id, Value::Null, Some(MAIN_SESSION_KEY));
            return;
        };
        let inputs = self.inputs();
        tokio::spawn(async move {
            let mut offset = 0;
            while let Some(items) = stream.read(offset).await {
                offset += items.len();
                let posted = post_input(
                    &inputs,
                    BridgeInput::ReplayStreamItems {
                        rpc_id: id.clone(),
                        session_id: MAIN_SESSION_KEY.to_string(),
                        items,
                    },
                );
                if !posted {
                    return;
                }
            }
            post_input(
                &inputs,
                BridgeInput::ReplayStreamDone {
                    rpc_id: id,
                    session_id: MAIN_SESSION_KEY.to_string(),
                },
            );
        });
    }

    fn handle_session_list(&mut self, id: RpcId) {
        let sessions = self
            .state
            .sessions_by_recency()
            .into_iter()
            .map(|session| {
                json!({
                    "sessionId": session.id,
                    "cwd": session.cwd,
                    "title": SESSION_TITLE,
                    "updatedAt": iso_timestamp(session.updated_at_ms),
                })
            })
            .collect::<Vec<_>>();
        self.outbound.send_result(
            &id,
            json!({"sessions": sessions, "nextCursor": null}),
            None,
        );
    }

    fn handle_session_prompt(&mut self, id: RpcId, params: Option<&Value>) {
        let Some(params) = as_object(params) else {
            self.outbound
                .send_error(&id, &BridgeError::invalid_params("invalid params"), None);
            return;
        };
        if field_str(params, "sessionId").is_none() {
            self.outbound
                .send_error(&id, &BridgeError::invalid_params("sessionId is required"), None);
            return;
        }
        if self.state.session(MAIN_SESSION_KEY).is_none() {
            self.state.upsert_session(MAIN_SESSION_KEY, None, now_ms());
        }
        if !self.gateway.is_ready() {
            self.outbound
                .send_error(&id, &BridgeError::gateway_unavailable("gateway unavailable"), None);
            return;
        }
        let obs_before = json!({"id": id.to_value(), "method": "session/prompt", "params": params});
        let prompt = params.get("prompt").cloned().unwrap_or(Value::Null);
        let blocks = extract_prompt_blocks(&sanitize_prompt_payload(&prompt));
        let plan = match build_resolution_plan(&blocks) {
            Ok(plan) => plan,
            Err(error) => {
                self.outbound.send_error(&id, &BridgeError::from(error), None);
                return;
            }
        };
        if plan.is_empty() {
            self.convert_and_forward_prompt(&id, MAIN_SESSION_KEY, &blocks, &HashMap::new(), obs_before);
            return;
        }
        let resolver = self.file_resolver.clone();
        tracing::debug!(
            request_id = %id,
            resolver = resolver.resolver_name(),
            files = plan.file_ids.len(),
            "resolving kimi-file references"
        );
        self.spawn_side_task(async move {
            let request_id = id.to_string();
            let resolutions =
                resolve_for_prompt(resolver.as_ref(), &plan, MAIN_SESSION_KEY, &request_id).await;
            BridgeInput::PromptResolved {
                rpc_id: id,
                session_id: MAIN_SESSION_KEY.to_string(),
                blocks,
                resolutions,
                obs_before,
            }
        });
    }

    pub(crate) fn convert_and_forward_prompt(
        &mut self,
        rpc_id: &RpcId,
        session_id: &str,
        blocks: &[PromptBlock],
        resolutions: &HashMap<String, FileResolution>,
        obs_before: Value,
    ) {
        match to_gateway_prompt(blocks, resolutions) {
            Ok(prompt) => self.forward_prompt(rpc_id, session_id, blocks, prompt, obs_before),
            Err(error) => self
                .outbound
                .send_error(rpc_id, &BridgeError::from(error), None),
        }
    }

    fn forward_prompt(
        &mut self,
        rpc_id: &RpcId,
        session_id: &str,
        blocks: &[PromptBlock],
        prompt: GatewayPrompt,
        obs_before: Value,
    ) {
        if !prompt.file_resolutions.is_empty() {
            tracing::info!(
                request_id = %rpc_id,
                session_id,
                items = %prompt.resolution_summary(),
                "kimi-file metadata summary"
            );
        }
        self.maybe_send_realtime_patch(session_id);

        let now = now_ms();
        let gateway_request_id = format!("req_{}", Uuid::new_v4().simple());
        let mut params = Map::new();
        params.insert("agentId".to_string(), json!(self.options.agent_id));
        params.insert("sessionKey".to_string(), json!(session_id));
        params.insert("message".to_string(), json!(prompt.message));
        if !prompt.attachments.is_empty() {
            params.insert("attachments".to_string(), json!(prompt.attachments));
        }
        params.insert("deliver".to_string(), json!(false));
        params.insert(
            "idempotencyKey".to_string(),
            json!(format!("acp_{session_id}_{now}")),
        );
        let frame = json!({
            "type": "req",
            "id": gateway_request_id,
            "method": "agent",
            "params": params,
        });

        if self.outbound.obs_enabled() {
            let forward_thinking = self.options.forward_thinking;
            let forward_tool_calls = self.options.forward_tool_calls;
            self.outbound.emit_obs(
                ObsEvent::new(OBS_COMPONENT, "mapping", "mapping.prompt_to_gateway_agent", ObsSeverity::Info)
                    .with_request_id(rpc_id.to_string())
                    .with_session_id(session_id)
                    .with_hop(PROMPT_HOP)
                    .with_location(PROMPT_LOCATION)
                    .with_summary(format!(
                        "ACP session/prompt -> gateway agent (forwardThinking={forward_thinking} forwardToolCalls={forward_tool_calls})"
                    ))
                    .with_mapping(
                        sanitize_obs_mapping_payload(&obs_before),
                        sanitize_obs_mapping_payload(&frame),
                    )
                    .with_payload(json!({
                        "gatewayRequestId": gateway_request_id,
                        "forwardThinking": forward_thinking,
                        "forwardToolCalls": forward_tool_calls,
                    })),
            );
        }

        if !self.gateway.send(frame) {
            self.outbound.send_error(
                rpc_id,
                &BridgeError::gateway_unavailable("failed to send prompt to gateway"),
                None,
            );
            return;
        }

        let names = prompt.file_names_by_id();
        let user_meta = UpdateMeta::request(rpc_id).with_timestamp(Some(now));
        for block in blocks {
            let resolved_name = match block {
                PromptBlock::ResourceLink { uri: Some(uri), .. } => parse_kimi_file_uri(uri)
                    .ok()
                    .flatten()
                    .and_then(|file_id| names.get(&file_id).cloned()),
                _ => None,
            };
            let Some(content) = block.to_user_content(resolved_name.as_deref()) else {
                continue;
            };
            self.outbound.send_session_update(
                session_id,
                message_chunk("user_message_chunk", content),
                &user_meta,
                None,
            );
        }
        self.outbound.send_session_update(
            session_id,
            text_chunk_update("agent_message_chunk", ""),
            &UpdateMeta::request(rpc_id),
            None,
        );

        if let Some(session) = self.state.session_mut(session_id) {
            if session.active_prompt_request_id.is_none() {
                session.active_prompt_request_id = Some(gateway_request_id.clone());
            }
            session.updated_at_ms = now;
        }
        let mut run = PromptRun::new(session_id, rpc_id.clone(), &gateway_request_id, now);
        if self.options.prompt_timeout_ms > 0 {
            run.timeout = Some(self.schedule(
                self.options.prompt_timeout_ms,
                BridgeInput::PromptTimeout {
                    gateway_request_id: gateway_request_id.clone(),
                },
            ));
        }
        self.state.add_prompt_run(run);
        tracing::debug!(
            request_id = %rpc_id,
            gateway_request_id = %gateway_request_id,
            "prompt forwarded to gateway"
        );
    }

    pub(crate) fn handle_prompt_timeout(&mut self, gateway_request_id: &str) {
        let Some(run) = self.state.prompt(gateway_request_id).filter(|run| !run.done) else {
            return;
        };
        let timeout_ms = self.options.prompt_timeout_ms;
        tracing::warn!(
            session_id = %run.session_id,
            request_id = %run.rpc_id,
            gateway_request_id,
            timeout_ms,
            "prompt timeout waiting lifecycle"
        );
        let mut data = json!({"timeoutMs": timeout_ms, "requestId": gateway_request_id});
        if let (Some(run_id), Some(object)) = (&run.run_id, data.as_object_mut()) {
            object.insert("runId".to_string(), json!(run_id));
        }
        self.fail_prompt(
            gateway_request_id,
            BridgeError::new(GATEWAY_LIFECYCLE_TIMEOUT, "gateway lifecycle timeout").with_data(data),
        );
    }

    fn maybe_send_realtime_patch(&mut self, session_id: &str) {
        let verbose = self.options.force_realtime_verbose;
        let reasoning = self.options.force_reasoning_stream;
        if !verbose && !reasoning {
            return;
        }
        if !self.gateway.is_ready() {
            return;
        }
        let mut params = Map::new();
        params.insert("key".to_string(), json!(session_id));
        if verbose {
            params.insert("verboseLevel".to_string(), json!("on"));
        }
        if reasoning {
            params.insert("reasoningLevel".to_string(), json!("stream"));
        }
        let frame = json!({
            "type": "req",
            "id": format!("sess_patch_{}", Uuid::new_v4().simple()),
            "method": "sessions.patch",
            "params": params,
        });
        if !self.gateway.send(frame) {
            tracing::warn!(session_id, "failed to send realtime session patch");
        }
    }

    /// Also accepted as a notification; errors are only reported when `id` is present.
    fn handle_session_cancel(&mut self, id: Option<RpcId>, params: Option<&Value>) {
        let Some(params) = as_object(params) else {
            if let Some(id) = &id {
                self.outbound
                    .send_error(id, &BridgeError::invalid_params("invalid params"), None);
            }
            return;
        };
        if field_str(params, "sessionId").is_none() {
            if let Some(id) = &id {
                self.outbound
                    .send_error(id, &BridgeError::invalid_params("sessionId is required"), None);
            }
            return;
        }
        let session_id = MAIN_SESSION_KEY;
        let explicit_request_id = first_field_str(params, &["requestId", "request_id"]);
        let explicit_run_id = first_field_str(params, &["runId", "run_id"]);

        let target = explicit_request_id
            .filter(|request_id| self.state.prompt(request_id).is_some())
            .map(str::to_string)
            .or_else(|| {
                explicit_run_id
                    .and_then(|run_id| self.state.gateway_request_id_for_run(run_id))
                    .map(str::to_string)
            })
            .or_else(|| {
                self.state
                    .session(session_id)
                    .and_then(|session| session.active_prompt_request_id.clone())
            })
            .or_else(|| {
                self.state
                    .first_open_prompt(session_id)
                    .map(|run| run.gateway_request_id.clone())
            })
            .filter(|request_id| self.state.prompt(request_id).is_some());

        if self.state.session(session_id).is_none() && target.is_none() {
            if let Some(id) = &id {
                self.outbound
                    .send_error(id, &BridgeError::invalid_params("unknown sessionId"), None);
            }
            return;
        }

        let target_run = target.as_deref().and_then(|request_id| self.state.prompt(request_id));
        let cancel_request_id = target_run
            .map(|run| run.gateway_request_id.clone())
            .or_else(|| explicit_request_id.map(str::to_string));
        let cancel_run_id = target_run
            .and_then(|run| run.run_id.clone())
            .or_else(|| explicit_run_id.map(str::to_string));
        if cancel_request_id.is_some() || cancel_run_id.is_some() {
            let mut cancel_params = Map::new();
            cancel_params.insert("sessionKey".to_string(), json!(session_id));
            if let Some(run_id) = &cancel_run_id {
                cancel_params.insert("runId".to_string(), json!(run_id));
            }
            if let Some(request_id) = &cancel_request_id {
                cancel_params.insert("requestId".to_string(), json!(request_id));
            }
            let suffix = cancel_request_id
                .as_deref()
                .or(cancel_run_id.as_deref())
                .unwrap_or(session_id);
            let sent = self.gateway.send(json!({
                "type": "req",
                "id": format!("cancel_{suffix}"),
                "method": "agent.cancel",
                "params": cancel_params,
            }));
            if !sent {
                tracing::warn!(session_id, "failed to send agent.cancel to gateway");
            }
        }
        if let Some(target) = &target {
            self.complete_prompt(target, StopReason::Cancelled);
        }
        if let Some(id) = &id {
            self.outbound.send_result(id, json!({}), Some(session_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::bridge_core::{BridgeOptions, InstanceMeta, MAIN_SESSION_KEY};
    use crate::test_support::Harness;

    const FILE_ID: &str = "0f8fad5b-d9cb-469f-a165-70867728950e";

    fn request(id: i64, method: &str, params: serde_json::Value) -> serde_json::Value {
        json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
    }

    #[tokio::test]
    async fn functional_initialize_pins_protocol_version_and_reports_instance() {
        let mut harness = Harness::new(BridgeOptions {
            instance: InstanceMeta {
                instance_id: "inst-1".to_string(),
                device_id: " ".to_string(),
                plugin_version: "9.9.9".to_string(),
            },
            ..BridgeOptions::default()
        });
        harness.bridge(request(1, "initialize", json!({"protocolVersion": 7})));
        let result = &harness.acp.responses()[0]["result"];
        assert_eq!(result["protocolVersion"], 1);
        assert_eq!(result["agentInfo"]["version"], "9.9.9");
        assert_eq!(result["_meta"]["instanceId"], "inst-1");
        assert_eq!(result["_meta"]["deviceId"], "inst-1");
        assert_eq!(result["agentCapabilities"]["loadSession"], true);
    }

    #[tokio::test]
    async fn functional_dispatch_drops_notifications_and_rejects_unknown_methods() {
        let mut harness = Harness::new(BridgeOptions::default());
        harness.bridge(json!({"jsonrpc": "2.0", "method": "initialize"}));
        harness.bridge(json!({"jsonrpc": "2.0", "id": {"bad": true}, "method": "session/list"}));
        assert!(harness.acp.frames().is_empty());

        harness.bridge(request(2, "session/fork", json!({})));
        harness.bridge(request(3, "session/set_model", json!({"modelId": "x"})));
        let responses = harness.acp.responses();
        assert_eq!(responses[0]["error"]["code"], -32601);
        assert_eq!(responses[0]["error"]["message"], "method not found: session/fork");
        assert_eq!(responses[1]["id"], 3);
        assert!(responses[1]["result"].is_object());
    }

    #[tokio::test]
    async fn functional_session_new_maps_to_main_session_and_requests_history() {
        let mut harness = Harness::new(BridgeOptions::default());
        harness.bridge(request(1, "session/new", json!({"cwd": "/work", "_meta": {"sessionKey": "client"}})));

        let result = &harness.acp.responses()[0]["result"];
        assert_eq!(result["sessionId"], MAIN_SESSION_KEY);
        assert_eq!(result["modes"]["currentModeId"], "default");
        assert_eq!(result["_meta"]["sessionKey"], MAIN_SESSION_KEY);
        assert_eq!(
            harness.core.state().session(MAIN_SESSION_KEY).map(|session| session.cwd.as_str()),
            Some("/work")
        );
        let history = harness.gateway.with_method("chat.history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["params"]["sessionKey"], MAIN_SESSION_KEY);
        assert_eq!(history[0]["params"]["limit"], 100);
    }

    #[tokio::test]
    async fn regression_session_new_rejects_malformed_fields() {
        let mut harness = Harness::new(BridgeOptions::default());
        harness.bridge(request(1, "session/new", json!("nope")));
        harness.bridge(request(2, "session/new", json!({"cwd": 5})));
        harness.bridge(request(3, "session/new", json!({"_meta": {"openclaw": {"sessionKey": "  "}}})));
        let responses = harness.acp.responses();
        let reasons = responses
            .iter()
            .map(|frame| frame["error"]["data"]["error"]["message"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            reasons,
            vec![
                "params must be object",
                "cwd must be a string",
                "sessionKey must be a non-empty string"
            ]
        );
        assert!(responses.iter().all(|frame| frame["error"]["code"] == -32602));
        assert!(harness.gateway.frames().is_empty());
    }

    #[tokio::test]
    async fn functional_session_list_is_sorted_by_recency() {
        let mut harness = Harness::new(BridgeOptions::default());
        harness.core.state.upsert_session("older", None, 1_000);
        harness.core.state.upsert_session("newer", Some("/tmp"), 2_000);
        harness.bridge(request(1, "session/list", json!({})));
        let result = &harness.acp.responses()[0]["result"];
        assert_eq!(result["sessions"][0]["sessionId"], "newer");
        assert_eq!(result["sessions"][0]["cwd"], "/tmp");
        assert_eq!(result["sessions"][0]["updatedAt"], "1970-01-01T00:00:02.000Z");
        assert_eq!(result["sessions"][1]["title"], "OpenClaw Session");
        assert!(result["nextCursor"].is_null());
    }

    #[tokio::test]
    async fn functional_prompt_forwards_agent_request_and_echoes_user_blocks() {
        let mut harness = Harness::new(BridgeOptions {
            agent_id: "writer".to_string(),
            ..BridgeOptions::default()
        });
        let request_id = harness.prompt(4, "hello gateway");

        let patches = harness.gateway.with_method("sessions.patch");
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0]["params"]["verboseLevel"], "on");
        assert_eq!(patches[0]["params"]["reasoningLevel"], "stream");
        let agent = &harness.gateway.with_method("agent")[0];
        assert!(request_id.starts_with("req_"));
        assert_eq!(agent["params"]["agentId"], "writer");
        assert_eq!(agent["params"]["sessionKey"], MAIN_SESSION_KEY);
        assert_eq!(agent["params"]["message"], "hello gateway");
        assert_eq!(agent["params"]["deliver"], false);
        assert!(agent["params"].get("attachments").is_none());

        let updates = harness.acp.updates();
        assert_eq!(updates[0]["sessionUpdate"], "user_message_chunk");
        assert_eq!(updates[0]["content"]["text"], "hello gateway");
        assert_eq!(updates[1]["sessionUpdate"], "agent_message_chunk");
        assert_eq!(updates[1]["content"]["text"], "");
        let events = harness.obs.events();
        assert!(events
            .iter()
            .any(|event| event.name == "mapping.prompt_to_gateway_agent"));
        assert_eq!(
            harness
                .core
                .state()
                .session(MAIN_SESSION_KEY)
                .and_then(|session| session.active_prompt_request_id.clone()),
            Some(request_id)
        );
    }

    #[tokio::test]
    async fn regression_prompt_rejections_never_reach_gateway() {
        let mut harness = Harness::new(BridgeOptions::default());
        harness.bridge(request(1, "session/prompt", json!({"prompt": []})));
        harness.bridge(request(
            2,
            "session/prompt",
            json!({"sessionId": "s", "prompt": [{"type": "resource_link", "uri": "kimi-file://"}]}),
        ));
        harness.gateway.set_ready(false);
        harness.bridge(request(3, "session/prompt", json!({"sessionId": "s", "prompt": "hi"})));

        let responses = harness.acp.responses();
        assert_eq!(responses[0]["error"]["message"], "sessionId is required");
        assert_eq!(responses[1]["error"]["code"], -32602);
        assert_eq!(
            responses[1]["error"]["data"]["error"]["message"],
            "resource_link kimi-file uri requires file_id"
        );
        assert_eq!(responses[2]["error"]["code"], -32001);
        assert_eq!(responses[2]["error"]["message"], "gateway unavailable");
        assert!(harness.gateway.with_method("agent").is_empty());
    }

    #[tokio::test]
    async fn functional_kimi_file_prompt_is_forwarded_after_resolution() {
        let mut harness = Harness::new(BridgeOptions::default());
        harness.bridge(request(
            1,
            "session/prompt",
            json!({"sessionId": "s", "prompt": [
                {"type": "text", "text": "see file"},
                {"type": "resource_link", "uri": format!("kimi-file://{FILE_ID}"), "name": "notes.md"}
            ]}),
        ));
        assert!(harness.gateway.with_method("agent").is_empty());
        harness.pump_one().await;

        let agent = harness.gateway.with_method("agent");
        assert_eq!(agent.len(), 1);
        let message = agent[0]["params"]["message"].as_str().unwrap_or_default();
        assert!(message.starts_with("see file\n<KIMI_REF"));
        assert!(message.contains(r#"status="download_failed""#));
        let links = harness
            .acp
            .updates()
            .into_iter()
            .filter(|update| update["content"]["type"] == "resource_link")
            .collect::<Vec<_>>();
        assert_eq!(links[0]["content"]["name"], "notes.md");
    }

    #[tokio::test]
    async fn regression_non_uuid_kimi_file_id_is_rejected_without_resolution() {
        let mut harness = Harness::new(BridgeOptions::default());
        harness.bridge(request(
            1,
            "session/prompt",
            json!({"sessionId": "s", "prompt": [
                {"type": "resource_link", "uri": "kimi-file://abc123", "name": "notes.md"}
            ]}),
        ));

        let responses = harness.acp.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["error"]["code"], -32602);
        tokio::task::yield_now().await;
        assert!(!harness.try_pump_one());
        assert!(harness.gateway.with_method("agent").is_empty());
    }

    #[tokio::test]
    async fn functional_prompt_timeout_fails_exactly_once() {
        let mut harness = Harness::new(BridgeOptions {
            prompt_timeout_ms: 10,
            ..BridgeOptions::default()
        });
        let request_id = harness.prompt(9, "slow");
        harness.acp.take_frames();
        harness.pump_one().await;
        harness.agent_event(&request_id, "lifecycle", json!({"phase": "end"}));

        let responses = harness.acp.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["error"]["code"], -32022);
        assert_eq!(responses[0]["error"]["message"], "gateway lifecycle timeout");
        assert_eq!(responses[0]["error"]["data"]["timeoutMs"], 10);
        assert_eq!(responses[0]["error"]["data"]["requestId"], request_id.as_str());
    }

    #[tokio::test]
    async fn functional_cancel_sends_agent_cancel_and_completes_prompt() {
        let mut harness = Harness::new(BridgeOptions::default());
        let request_id = harness.prompt(1, "long task");
        harness.gateway_frame(json!({"type": "res", "id": request_id, "ok": true, "payload": {"runId": "run_9"}}));
        harness.acp.take_frames();

        harness.bridge(request(2, "session/cancel", json!({"sessionId": "anything"})));

        let cancel = harness.gateway.with_method("agent.cancel");
        assert_eq!(cancel.len(), 1);
        assert_eq!(cancel[0]["id"], format!("cancel_{request_id}"));
        assert_eq!(cancel[0]["params"]["runId"], "run_9");
        assert_eq!(cancel[0]["params"]["sessionKey"], MAIN_SESSION_KEY);
        let responses = harness.acp.responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], 1);
        assert_eq!(responses[0]["result"]["stopReason"], "cancelled");
        assert_eq!(responses[1]["id"], 2);
        assert!(harness.core.state().prompt(&request_id).is_none());
    }

    #[tokio::test]
    async fn regression_cancel_without_session_reports_unknown_session() {
        let mut harness = Harness::new(BridgeOptions::default());
        harness.bridge(json!({"jsonrpc": "2.0", "method": "session/cancel", "params": {"sessionId": "s"}}));
        assert!(harness.acp.frames().is_empty());
        harness.bridge(request(5, "session/cancel", json!({"sessionId": "s"})));
        let responses = harness.acp.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["error"]["message"], "unknown sessionId");
        assert!(harness.gateway.frames().is_empty());
    }
}
