use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use kimi_claw_acp_bridge::{
    DEFAULT_AGENT_ID, DEFAULT_HISTORY_PENDING_TIMEOUT_MS, DEFAULT_PROMPT_TIMEOUT_MS,
};
use kimi_claw_transport::{RetryPolicy, DEFAULT_OUTBOUND_QUEUE_CAPACITY};
use serde::Deserialize;
use url::Url;

pub(crate) const DEFAULT_BRIDGE_URL: &str = "wss://www.kimi.com/api-claw/bots/agent-ws";
pub(crate) const DEFAULT_GATEWAY_URL: &str = "ws://127.0.0.1:18789";
pub(crate) const DEFAULT_GATEWAY_PROTOCOL: u32 = 3;
pub(crate) const DEFAULT_GATEWAY_CLIENT_ID: &str = "gateway-client";
pub(crate) const DEFAULT_GATEWAY_CLIENT_MODE: &str = "backend";
pub(crate) const DEFAULT_DEVICE_ID: &str = "unknown-device";
const DEFAULT_INSTANCE_ID_PREFIX: &str = "connector";
const OBS_LOG_FILE_NAME: &str = "openclaw_all_trace.log";

fn parse_bool_flag(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!(
            "expected one of 1/true/yes/on or 0/false/no/off, got '{other}'"
        )),
    }
}

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "kimi-claw-connector",
    about = "Bridges a remote ACP endpoint to a local OpenClaw gateway",
    version
)]
/// Command line flags; each one can also come from its environment variable.
pub struct Cli {
    #[arg(
        long = "config",
        help = "Local JSON config file. Defaults to ~/.kimi/kimi-claw/kimi-claw-config.json"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        short = 'v',
        help = "Raise the default log level to debug (RUST_LOG still wins)"
    )]
    pub verbose: bool,

    #[arg(
        long = "bridge-url",
        env = "OPENCLAW_BRIDGE_URL",
        help = "Remote ACP WebSocket endpoint"
    )]
    pub bridge_url: Option<String>,

    #[arg(
        long = "bridge-token",
        env = "OPENCLAW_BRIDGE_TOKEN",
        hide_env_values = true,
        help = "Bot token sent as the X-Kimi-Bot-Token upgrade header"
    )]
    pub bridge_token: Option<String>,

    #[arg(
        long = "bridge-instance-id",
        env = "OPENCLAW_BRIDGE_INSTANCE_ID",
        help = "Instance id reported in initialize and session/new metadata"
    )]
    pub bridge_instance_id: Option<String>,

    #[arg(
        long = "bridge-device-id",
        env = "OPENCLAW_BRIDGE_DEVICE_ID",
        help = "Device id reported in initialize metadata"
    )]
    pub bridge_device_id: Option<String>,

    #[arg(
        long = "forward-thinking",
        env = "OPENCLAW_BRIDGE_FORWARD_THINKING",
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        value_parser = parse_bool_flag,
        help = "Forward agent_thought_chunk updates to the remote endpoint"
    )]
    pub forward_thinking: Option<bool>,

    #[arg(
        long = "forward-tool-calls",
        env = "OPENCLAW_BRIDGE_FORWARD_TOOL_CALLS",
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        value_parser = parse_bool_flag,
        help = "Forward tool_call and tool_call_update updates to the remote endpoint"
    )]
    pub forward_tool_calls: Option<bool>,

    #[arg(
        long = "prompt-timeout-ms",
        env = "OPENCLAW_BRIDGE_PROMPT_TIMEOUT_MS",
        help = "Per-prompt timeout in milliseconds; 0 disables it"
    )]
    pub prompt_timeout_ms: Option<u64>,

    #[arg(
        long = "history-pending-timeout-ms",
        env = "OPENCLAW_BRIDGE_HISTORY_PENDING_TIMEOUT_MS",
        help = "Timeout for gateway chat.history requests in milliseconds; 0 disables it"
    )]
    pub history_pending_timeout_ms: Option<u64>,

    #[arg(
        long = "gateway-url",
        env = "OPENCLAW_GATEWAY_URL",
        help = "Local OpenClaw gateway WebSocket endpoint"
    )]
    pub gateway_url: Option<String>,

    #[arg(
        long = "gateway-agent-id",
        env = "OPENCLAW_GATEWAY_AGENT_ID",
        help = "Gateway agent that receives forwarded prompts"
    )]
    pub gateway_agent_id: Option<String>,

    #[arg(
        long = "obs-log-file",
        env = "OPENCLAW_ALL_LOG_FILE",
        help = "JSONL trace file for bridge observability events"
    )]
    pub obs_log_file: Option<PathBuf>,

    #[arg(
        long = "device-identity-path",
        help = "Device identity file. Defaults to ~/.openclaw/plugins/kimi-claw/device.json"
    )]
    pub device_identity_path: Option<PathBuf>,

    #[arg(
        long = "outbound-queue-capacity",
        default_value_t = DEFAULT_OUTBOUND_QUEUE_CAPACITY,
        value_parser = parse_positive_usize,
        help = "Frames buffered per transport while it is not ready"
    )]
    pub outbound_queue_capacity: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct FileBridgeSection {
    pub url: Option<String>,
    pub token: Option<String>,
    pub instance_id: Option<String>,
    pub device_id: Option<String>,
    pub forward_thinking: Option<bool>,
    pub forward_tool_calls: Option<bool>,
    pub prompt_timeout_ms: Option<u64>,
    pub history_pending_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct FileGatewaySection {
    pub url: Option<String>,
    pub token: Option<String>,
    pub protocol: Option<u32>,
    pub client_id: Option<String>,
    pub client_mode: Option<String>,
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct FileRetrySection {
    pub base_ms: Option<u64>,
    pub max_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct FileLogSection {
    pub enabled: Option<bool>,
    pub obs_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
/// Shape of `kimi-claw-config.json`; every key is optional.
pub(crate) struct FileConfig {
    pub bridge: FileBridgeSection,
    pub gateway: FileGatewaySection,
    pub retry: FileRetrySection,
    pub log: FileLogSection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Resolved settings for the remote ACP connection.
pub struct BridgeSettings {
    pub url: String,
    pub token: Option<String>,
    pub instance_id: String,
    pub device_id: String,
    pub forward_thinking: bool,
    pub forward_tool_calls: bool,
    pub prompt_timeout_ms: u64,
    pub history_pending_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Resolved settings for the local gateway connection.
pub struct GatewaySettings {
    pub url: String,
    pub token: Option<String>,
    pub protocol: u32,
    pub client_id: String,
    pub client_mode: String,
    pub agent_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Fully resolved connector settings.
pub struct ConnectorConfig {
    pub config_path: Option<PathBuf>,
    pub verbose: bool,
    pub bridge: BridgeSettings,
    pub gateway: GatewaySettings,
    pub retry: RetryPolicy,
    pub obs_log_file: Option<PathBuf>,
    pub device_identity_path: Option<PathBuf>,
    pub outbound_queue_capacity: usize,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn first_non_empty(candidates: [Option<&str>; 2]) -> Option<String> {
    candidates.into_iter().find_map(non_empty)
}

fn validate_ws_url(field: &str, raw: &str) -> Result<()> {
    let parsed = Url::parse(raw).with_context(|| format!("{field} '{raw}' is not a valid url"))?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        bail!("{field} '{raw}' must use the ws or wss scheme");
    }
    Ok(())
}

pub(crate) fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| {
        home.join(".kimi")
            .join("kimi-claw")
            .join("kimi-claw-config.json")
    })
}

pub(crate) fn default_obs_log_file() -> Option<PathBuf> {
    dirs::home_dir().map(|home| {
        home.join(".kimi")
            .join("kimi-claw")
            .join("log")
            .join(OBS_LOG_FILE_NAME)
    })
}

/// Returns `Ok(None)` when the file does not exist.
pub(crate) fn load_file_config(path: &Path) -> Result<Option<FileConfig>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to read connector config {}", path.display()))
        }
    };
    let parsed = serde_json::from_str::<FileConfig>(&raw)
        .with_context(|| format!("failed to parse connector config {}", path.display()))?;
    Ok(Some(parsed))
}

impl ConnectorConfig {
    /// Reads the config file named by `--config` (or the default path) and resolves `cli` against it.
    pub fn load(cli: &Cli) -> Result<Self> {
        let (path, file) = match cli.config.as_ref() {
            Some(path) => {
                let file = load_file_config(path)?.with_context(|| {
                    format!("connector config {} does not exist", path.display())
                })?;
                (Some(path.clone()), file)
            }
            None => match default_config_path() {
                Some(path) => match load_file_config(&path) {
                    Ok(file) => (Some(path), file.unwrap_or_default()),
                    Err(error) => {
                        tracing::warn!(error = %format!("{error:#}"), "ignoring unreadable connector config");
                        (Some(path), FileConfig::default())
                    }
                },
                None => (None, FileConfig::default()),
            },
        };
        Self::resolve(cli, file, path)
    }

    pub(crate) fn resolve(cli: &Cli, file: FileConfig, config_path: Option<PathBuf>) -> Result<Self> {
        let bridge_url = first_non_empty([cli.bridge_url.as_deref(), file.bridge.url.as_deref()])
            .unwrap_or_else(|| DEFAULT_BRIDGE_URL.to_string());
        validate_ws_url("bridge.url", &bridge_url)?;
        let gateway_url =
            first_non_empty([cli.gateway_url.as_deref(), file.gateway.url.as_deref()])
                .unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string());
        validate_ws_url("gateway.url", &gateway_url)?;

        let bridge = BridgeSettings {
            url: bridge_url,
            token: first_non_empty([cli.bridge_token.as_deref(), file.bridge.token.as_deref()]),
            instance_id: first_non_empty([
                cli.bridge_instance_id.as_deref(),
                file.bridge.instance_id.as_deref(),
            ])
            .unwrap_or_else(|| format!("{DEFAULT_INSTANCE_ID_PREFIX}-{}", std::process::id())),
            device_id: first_non_empty([
                cli.bridge_device_id.as_deref(),
                file.bridge.device_id.as_deref(),
            ])
            .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string()),
            forward_thinking: cli
                .forward_thinking
                .or(file.bridge.forward_thinking)
                .unwrap_or(false),
            forward_tool_calls: cli
                .forward_tool_calls
                .or(file.bridge.forward_tool_calls)
                .unwrap_or(false),
            prompt_timeout_ms: cli
                .prompt_timeout_ms
                .or(file.bridge.prompt_timeout_ms)
                .unwrap_or(DEFAULT_PROMPT_TIMEOUT_MS),
            history_pending_timeout_ms: cli
                .history_pending_timeout_ms
                .or(file.bridge.history_pending_timeout_ms)
                .unwrap_or(DEFAULT_HISTORY_PENDING_TIMEOUT_MS),
        };

        let gateway = GatewaySettings {
            url: gateway_url,
            token: non_empty(file.gateway.token.as_deref()),
            protocol: file.gateway.protocol.unwrap_or(DEFAULT_GATEWAY_PROTOCOL),
            client_id: non_empty(file.gateway.client_id.as_deref())
                .unwrap_or_else(|| DEFAULT_GATEWAY_CLIENT_ID.to_string()),
            client_mode: non_empty(file.gateway.client_mode.as_deref())
                .unwrap_or_else(|| DEFAULT_GATEWAY_CLIENT_MODE.to_string()),
            agent_id: first_non_empty([
                cli.gateway_agent_id.as_deref(),
                file.gateway.agent_id.as_deref(),
            ])
            .unwrap_or_else(|| DEFAULT_AGENT_ID.to_string()),
        };

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            base_ms: file.retry.base_ms.unwrap_or(defaults.base_ms),
            max_ms: file.retry.max_ms.unwrap_or(defaults.max_ms),
            max_attempts: file.retry.max_attempts.unwrap_or(defaults.max_attempts),
        };
        if retry.base_ms == 0 || retry.max_ms < retry.base_ms {
            bail!(
                "retry.baseMs ({}) must be positive and not exceed retry.maxMs ({})",
                retry.base_ms,
                retry.max_ms
            );
        }

        let obs_log_file = if file.log.enabled.unwrap_or(true) {
            cli.obs_log_file
                .clone()
                .or(file.log.obs_file)
                .filter(|path| !path.as_os_str().is_empty())
                .or_else(default_obs_log_file)
        } else {
            None
        };

        Ok(Self {
            config_path,
            verbose: cli.verbose,
            bridge,
            gateway,
            retry,
            obs_log_file,
            device_identity_path: cli.device_identity_path.clone(),
            outbound_queue_capacity: cli.outbound_queue_capacity,
        })
    }

    /// Problems worth reporting at startup that do not prevent it.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.bridge.token.is_none() {
            let location = self
                .config_path
                .as_ref()
                .map(|path| format!(" or bridge.token in {}", path.display()))
                .unwrap_or_default();
            warnings.push(format!(
                "bridge.token missing; remote ACP WebSocket auth may fail (set OPENCLAW_BRIDGE_TOKEN{location})"
            ));
        }
        warnings
    }

    /// Secrets masked in the JSONL trace file.
    pub fn secrets(&self) -> [Option<&str>; 2] {
        [self.bridge.token.as_deref(), self.gateway.token.as_deref()]
    }
}
