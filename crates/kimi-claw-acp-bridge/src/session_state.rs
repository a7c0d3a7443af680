//! In-memory registry of sessions, in-flight prompt runs and pending history requests.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::task::AbortHandle;

use crate::acp_outbound::RpcId;
use crate::payload_fields::{first_field_str, normalize_str, JsonObject};

pub const DEFAULT_SESSION_CWD: &str = ".";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Registry entry for a known session.
pub struct Session {
    pub id: String,
    pub cwd: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub active_prompt_request_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which half of a tool call an event belongs to.
pub enum ToolPhase {
    Start,
    Result,
    Other,
}

impl ToolPhase {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("start") => Self::Start,
            Some("result") => Self::Result,
            _ => Self::Other,
        }
    }
}

#[derive(Debug)]
/// One forwarded prompt and its gateway lifecycle.
pub struct PromptRun {
    pub session_id: String,
    pub rpc_id: RpcId,
    pub gateway_request_id: String,
    pub run_id: Option<String>,
    pub started_at_ms: i64,
    pub done: bool,
    pub seq: u64,
    pub has_assistant_stream: bool,
    pub has_thinking_stream: bool,
    pub has_tool_start_stream: bool,
    pub has_tool_result_stream: bool,
    pub replay_dedup_keys: HashSet<String>,
    pub next_generated_tool_call_id: u64,
    pub pending_generated_tool_call_ids: VecDeque<String>,
    pub tool_call_ids_by_incoming_id: HashMap<String, String>,
    pub assistant_text_so_far: String,
    pub timeout: Option<AbortHandle>,
}

impl PromptRun {
    pub fn new(
        session_id: &str,
        rpc_id: RpcId,
        gateway_request_id: &str,
        started_at_ms: i64,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            rpc_id,
            gateway_request_id: gateway_request_id.to_string(),
            run_id: None,
            started_at_ms,
            done: false,
            seq: 0,
            has_assistant_stream: false,
            has_thinking_stream: false,
            has_tool_start_stream: false,
            has_tool_result_stream: false,
            replay_dedup_keys: HashSet::new(),
            next_generated_tool_call_id: 0,
            pending_generated_tool_call_ids: VecDeque::new(),
            tool_call_ids_by_incoming_id: HashMap::new(),
            assistant_text_so_far: String::new(),
            timeout: None,
        }
    }

    /// Returns `true` the first time `key` is seen for this run.
    pub fn mark_replayed(&mut self, key: String) -> bool {
        self.replay_dedup_keys.insert(key)
    }

    /// Gateway-supplied ids win; otherwise ids are synthesized on start and
    /// paired FIFO with the next result that carries no id.
    pub fn resolve_tool_call_id(&mut self, data: &JsonObject, phase: ToolPhase) -> String {
        if let Some(incoming) = first_field_str(data, &["toolCallId", "tool_call_id", "callId", "id"]) {
            return self
                .tool_call_ids_by_incoming_id
                .entry(incoming.to_string())
                .or_insert_with(|| incoming.to_string())
                .clone();
        }
        if phase == ToolPhase::Result {
            if let Some(pending) = self.pending_generated_tool_call_ids.pop_front() {
                return pending;
            }
        }
        self.next_generated_tool_call_id += 1;
        let generated = format!(
            "tc_{}_{}",
            self.gateway_request_id, self.next_generated_tool_call_id
        );
        if phase == ToolPhase::Start {
            self.pending_generated_tool_call_ids.push_back(generated.clone());
        }
        generated
    }

    /// Suffix of `text` not yet sent for this run; never resends or truncates.
    pub fn chat_delta_text(&mut self, text: &str) -> Option<String> {
        let normalized = normalize_str(text)?;
        if self.assistant_text_so_far.is_empty() {
            self.assistant_text_so_far = normalized.clone();
            return Some(normalized);
        }
        if normalized == self.assistant_text_so_far {
            return None;
        }
        if let Some(delta) = normalized.strip_prefix(self.assistant_text_so_far.as_str()) {
            let delta = delta.to_string();
            self.assistant_text_so_far = normalized;
            return (!delta.is_empty()).then_some(delta);
        }
        if self.assistant_text_so_far.starts_with(normalized.as_str()) {
            return None;
        }
        self.assistant_text_so_far = normalized.clone();
        Some(normalized)
    }

    fn cancel_timeout(&mut self) {
        if let Some(timeout) = self.timeout.take() {
            timeout.abort();
        }
    }
}

#[derive(Debug)]
/// An in-flight `chat.history` request and the ACP request waiting on it.
pub struct PendingHistoryRequest {
    pub session_id: String,
    pub bridge_request_id: Option<RpcId>,
    /// Reply `null` to `bridge_request_id` once replay finishes or times out.
    pub reply_on_complete: bool,
    pub timeout: Option<AbortHandle>,
}

impl PendingHistoryRequest {
    fn cancel_timeout(&mut self) {
        if let Some(timeout) = self.timeout.take() {
            timeout.abort();
        }
    }
}

#[derive(Debug, Default)]
/// Owned registry of sessions, prompt runs and pending history requests.
pub struct SessionState {
    sessions: HashMap<String, Session>,
    prompts_by_gateway_request_id: HashMap<String, PromptRun>,
    gateway_request_ids_by_run_id: HashMap<String, String>,
    pending_history_requests: HashMap<String, PendingHistoryRequest>,
    next_prompt_seq: u64,
}

impl SessionState {
    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn session_mut(&mut self, session_id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(session_id)
    }

    /// Sessions ordered by `updated_at_ms`, newest first.
    pub fn sessions_by_recency(&self) -> Vec<&Session> {
        let mut sessions = self.sessions.values().collect::<Vec<_>>();
        sessions.sort_by(|left, right| right.updated_at_ms.cmp(&left.updated_at_ms));
        sessions
    }

    /// Creates or touches a session, keeping its cwd, creation time and active prompt.
    pub fn upsert_session(&mut self, session_id: &str, cwd: Option<&str>, now_ms: i64) -> &Session {
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session {
                id: session_id.to_string(),
                cwd: DEFAULT_SESSION_CWD.to_string(),
                created_at_ms: now_ms,
                updated_at_ms: now_ms,
                active_prompt_request_id: None,
            });
        if let Some(cwd) = cwd {
            session.cwd = cwd.to_string();
        }
        session.updated_at_ms = now_ms;
        session
    }

    pub fn add_prompt_run(&mut self, mut run: PromptRun) {
        self.next_prompt_seq += 1;
        run.seq = self.next_prompt_seq;
        self.prompts_by_gateway_request_id
            .insert(run.gateway_request_id.clone(), run);
    }

    pub fn bind_run_id(&mut self, gateway_request_id: &str, run_id: &str) {
        let Some(run) = self.prompts_by_gateway_request_id.get_mut(gateway_request_id) else {
            return;
        };
        if let Some(previous) = run.run_id.replace(run_id.to_string()) {
            if previous != run_id {
                self.gateway_request_ids_by_run_id.remove(&previous);
            }
        }
        self.gateway_request_ids_by_run_id
            .insert(run_id.to_string(), gateway_request_id.to_string());
    }

    pub fn prompt(&self, gateway_request_id: &str) -> Option<&PromptRun> {
        self.prompts_by_gateway_request_id.get(gateway_request_id)
    }

    pub fn prompt_mut(&mut self, gateway_request_id: &str) -> Option<&mut PromptRun> {
        self.prompts_by_gateway_request_id.get_mut(gateway_request_id)
    }

    pub fn gateway_request_id_for_run(&self, run_id: &str) -> Option<&str> {
        self.gateway_request_ids_by_run_id.get(run_id).map(String::as_str)
    }

    /// Correlates a gateway payload by `runId`, then `requestId`/`request_id`.
    pub fn resolve_prompt_run(&self, payload: &JsonObject) -> Option<String> {
        if let Some(gateway_request_id) = first_field_str(payload, &["runId"])
            .and_then(|run_id| self.gateway_request_ids_by_run_id.get(run_id))
        {
            return Some(gateway_request_id.clone());
        }
        first_field_str(payload, &["requestId", "request_id"])
            .filter(|request_id| self.prompts_by_gateway_request_id.contains_key(*request_id))
            .map(str::to_string)
    }

    /// First not-done run of `session_id` in forwarding order.
    pub fn first_open_prompt(&self, session_id: &str) -> Option<&PromptRun> {
        self.prompts_by_gateway_request_id
            .values()
            .filter(|run| run.session_id == session_id && !run.done)
            .min_by_key(|run| run.seq)
    }

    /// Gateway request ids of every not-done run, in forwarding order.
    pub fn in_flight_request_ids(&self) -> Vec<String> {
        let mut runs = self
            .prompts_by_gateway_request_id
            .values()
            .filter(|run| !run.done)
            .collect::<Vec<_>>();
        runs.sort_by_key(|run| run.seq);
        runs.into_iter()
            .map(|run| run.gateway_request_id.clone())
            .collect()
    }

    /// Removes the run from both indexes and clears its timer, promoting the
    /// next open run of the session when the removed one was active.
    pub fn cleanup_prompt_run(&mut self, gateway_request_id: &str, now_ms: i64) -> Option<PromptRun> {
        let mut run = self.prompts_by_gateway_request_id.remove(gateway_request_id)?;
        run.cancel_timeout();
        if let Some(run_id) = &run.run_id {
            self.gateway_request_ids_by_run_id.remove(run_id);
        }
        let next_active = self
            .first_open_prompt(&run.session_id)
            .map(|next| next.gateway_request_id.clone());
        if let Some(session) = self.sessions.get_mut(&run.session_id) {
            if session.active_prompt_request_id.as_deref() == Some(gateway_request_id) {
                session.active_prompt_request_id = None;
            }
            if session.active_prompt_request_id.is_none() {
                session.active_prompt_request_id = next_active;
            }
            session.updated_at_ms = now_ms;
        }
        Some(run)
    }

    pub fn has_pending_history(&self, history_request_id: &str) -> bool {
        self.pending_history_requests.contains_key(history_request_id)
    }

    pub fn pending_history_count(&self) -> usize {
        self.pending_history_requests.len()
    }

    pub fn set_pending_history(&mut self, history_request_id: &str, request: PendingHistoryRequest) {
        if let Some(mut existing) = self
            .pending_history_requests
            .insert(history_request_id.to_string(), request)
        {
            existing.cancel_timeout();
        }
    }

    pub fn attach_history_timeout(&mut self, history_request_id: &str, timeout: AbortHandle) {
        match self.pending_history_requests.get_mut(history_request_id) {
            Some(pending) => pending.timeout = Some(timeout),
            None => timeout.abort(),
        }
    }

    /// Consumes a pending history request exactly once, clearing its timer.
    pub fn take_pending_history(&mut self, history_request_id: &str) -> Option<PendingHistoryRequest> {
        let mut pending = self.pending_history_requests.remove(history_request_id)?;
        pending.cancel_timeout();
        Some(pending)
    }

    pub fn drain_pending_history(&mut self) -> Vec<(String, PendingHistoryRequest)> {
        self.pending_history_requests
            .drain()
            .map(|(id, mut pending)| {
                pending.cancel_timeout();
                (id, pending)
            })
            .collect()
    }
}
