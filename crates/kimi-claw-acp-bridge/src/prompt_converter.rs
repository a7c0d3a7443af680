//! Turns ACP prompt blocks into one gateway `agent` message plus attachments.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use regex::Regex;
use serde::Serialize;

use crate::bridge_errors::{FileReferenceError, PromptConversionError};
use crate::content_blocks::{resolve_uri_file_name, BlockSource, PromptBlock, OCTET_STREAM};
use crate::file_resolver::FileResolution;
use crate::message_filter::strip_transport_metadata;

pub const KIMI_FILE_URI_PREFIX: &str = "kimi-file://";
pub const EMPTY_PROMPT_MESSAGE: &str = "(empty prompt)";

static KIMI_FILE_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("kimi file id regex")
});

/// `Ok(None)` for non-`kimi-file://` uris, the validated file id otherwise.
pub fn parse_kimi_file_uri(uri: &str) -> Result<Option<String>, FileReferenceError> {
    let Some(rest) = uri.strip_prefix(KIMI_FILE_URI_PREFIX) else {
        return Ok(None);
    };
    let file_id = rest.trim();
    if file_id.is_empty() {
        return Err(FileReferenceError::MissingFileId);
    }
    if !KIMI_FILE_ID_PATTERN.is_match(file_id) {
        return Err(FileReferenceError::InvalidFileId);
    }
    Ok(Some(file_id.to_string()))
}

pub fn escape_xml_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn truncate_chars(value: &str, limit: usize) -> String {
    match value.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &value[..cut]),
        None => value.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
/// Binary payload forwarded beside the gateway message.
pub struct GatewayAttachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of a successful conversion.
pub struct GatewayPrompt {
    pub message: String,
    pub attachments: Vec<GatewayAttachment>,
    /// One entry per distinct file outcome, in prompt order.
    pub file_resolutions: Vec<FileResolution>,
}

impl GatewayPrompt {
    /// Display names by file id, used when echoing resource links back to the client.
    pub fn file_names_by_id(&self) -> HashMap<String, String> {
        self.file_resolutions
            .iter()
            .filter_map(|resolution| match resolution {
                FileResolution::Resolved(file) => Some((file.file_id.clone(), file.name.clone())),
                FileResolution::ResolveFailed(file) => file
                    .name
                    .clone()
                    .map(|name| (file.file_id.clone(), name)),
            })
            .collect()
    }

    /// `fileId:status:detail` items for the per-prompt resolution log line.
    pub fn resolution_summary(&self) -> String {
        self.file_resolutions
            .iter()
            .map(|resolution| match resolution {
                FileResolution::Resolved(file) => {
                    format!("{}:resolved:{}", file.file_id, file.download_url_source)
                }
                FileResolution::ResolveFailed(file) => {
                    format!("{}:resolve_failed:{}", file.file_id, file.code)
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Default)]
struct ConversionBuffer {
    parts: Vec<String>,
    attachments: Vec<GatewayAttachment>,
    file_resolutions: Vec<FileResolution>,
    seen_resolutions: HashSet<String>,
}

impl ConversionBuffer {
    fn attach(&mut self, kind: &str, content: &str, mime_type: Option<&str>, file_name: Option<&str>) {
        if content.is_empty() {
            return;
        }
        self.attachments.push(GatewayAttachment {
            kind: kind.to_string(),
            content: content.to_string(),
            mime_type: mime_type.map(str::to_string),
            file_name: file_name.map(str::to_string),
        });
    }

    fn record_resolution(&mut self, resolution: &FileResolution) {
        if self.seen_resolutions.insert(resolution.dedup_key()) {
            self.file_resolutions.push(resolution.clone());
        }
    }
}

/// Converts sanitized prompt blocks; `resolutions` maps resource-link uris to file outcomes.
pub fn to_gateway_prompt(
    blocks: &[PromptBlock],
    resolutions: &HashMap<String, FileResolution>,
) -> Result<GatewayPrompt, PromptConversionError> {
    let mut buffer = ConversionBuffer::default();
    for block in blocks {
        match block {
            PromptBlock::Text { text } => {
                let text = strip_transport_metadata(text);
                if !text.is_empty() {
                    buffer.parts.push(text.into_owned());
                }
            }
            PromptBlock::Image(source) => convert_image(&mut buffer, source)?,
            PromptBlock::ResourceLink {
                uri, title, name, ..
            } => {
                let uri = uri
                    .as_deref()
                    .ok_or(PromptConversionError::ResourceLinkMissingUri)?;
                convert_resource_link(
                    &mut buffer,
                    uri,
                    title.as_deref(),
                    name.as_deref(),
                    resolutions,
                )?;
            }
            PromptBlock::File(source) => convert_file(&mut buffer, source)?,
            PromptBlock::Resource(source) => convert_resource(&mut buffer, source)?,
        }
    }
    if buffer.parts.is_empty() {
        return Ok(GatewayPrompt {
            message: EMPTY_PROMPT_MESSAGE.to_string(),
            attachments: Vec::new(),
            file_resolutions: Vec::new(),
        });
    }
    Ok(GatewayPrompt {
        message: buffer.parts.join("\n"),
        attachments: buffer.attachments,
        file_resolutions: buffer.file_resolutions,
    })
}

fn convert_image(buffer: &mut ConversionBuffer, source: &BlockSource) -> Result<(), PromptConversionError> {
    if source.data.is_none() && source.uri.is_none() {
        return Err(PromptConversionError::ImageMissingSource);
    }
    let mime = source.mime_type.as_deref().unwrap_or(OCTET_STREAM);
    let file_name = source
        .file_name
        .clone()
        .or_else(|| source.uri.as_deref().and_then(resolve_uri_file_name));
    let mut descriptor = vec![format!("mime={mime}")];
    if let Some(data) = source.data.as_deref() {
        descriptor.push(format!("size={}", data.len()));
        buffer.attach("image", data, Some(mime), file_name.as_deref());
    }
    if let Some(uri) = source.uri.as_deref() {
        descriptor.push(format!("uri={uri}"));
    }
    buffer.parts.push(format!("[image {}]", descriptor.join(" ")));
    Ok(())
}

fn convert_resource_link(
    buffer: &mut ConversionBuffer,
    uri: &str,
    title: Option<&str>,
    name: Option<&str>,
    resolutions: &HashMap<String, FileResolution>,
) -> Result<(), PromptConversionError> {
    let file_id = parse_kimi_file_uri(uri)?;
    let resolution = resolutions.get(uri);
    if let Some(resolution) = resolution {
        buffer.record_resolution(resolution);
    }
    match (file_id.as_deref(), resolution) {
        (Some(file_id), Some(FileResolution::Resolved(file))) => {
            buffer.parts.push(format!(
                r#"<KIMI_REF type="file" path="{}" name="{}" id="{}" />"#,
                escape_xml_attribute(&file.local_path),
                escape_xml_attribute(&file.name),
                escape_xml_attribute(file_id),
            ));
            tracing::info!(
                file_id,
                local_path = %file.local_path,
                "kimi-file converted to KIMI_REF"
            );
        }
        (Some(file_id), Some(FileResolution::ResolveFailed(file))) => {
            let reason = resolution
                .and_then(FileResolution::failure_reason)
                .unwrap_or_default();
            let fallback_name = file
                .name
                .as_deref()
                .or(name)
                .or(title)
                .unwrap_or(file_id);
            buffer.parts.push(format!(
                r#"<KIMI_REF type="file" path="" name="{}" id="{}" status="download_failed" reason="{}" />"#,
                escape_xml_attribute(fallback_name),
                escape_xml_attribute(file_id),
                escape_xml_attribute(&reason),
            ));
            tracing::warn!(file_id, reason = %reason, "kimi-file converted to degraded KIMI_REF");
        }
        _ => {
            let label = title.or(name).unwrap_or("resource");
            buffer
                .parts
                .push(format!("[resource_link title={label} uri={uri}]"));
        }
    }
    Ok(())
}

fn convert_file(buffer: &mut ConversionBuffer, source: &BlockSource) -> Result<(), PromptConversionError> {
    let mime = source.mime_type.as_deref().unwrap_or(OCTET_STREAM);
    let file_name = source
        .file_name
        .clone()
        .or_else(|| source.uri.as_deref().and_then(resolve_uri_file_name));
    let text = source
        .text
        .as_deref()
        .map(strip_transport_metadata)
        .filter(|text| !text.is_empty());
    if source.data.is_none() && text.is_none() && source.uri.is_none() {
        return Err(PromptConversionError::FileMissingSource);
    }
    let mut descriptor = vec![format!("mime={mime}")];
    if let Some(name) = file_name.as_deref() {
        descriptor.push(format!("name={name}"));
    }
    if let Some(data) = source.data.as_deref() {
        descriptor.push(format!("size={}", data.len()));
        buffer.attach("file", data, Some(mime), file_name.as_deref());
    } else if let Some(text) = text.as_deref() {
        descriptor.push(format!("text={}", truncate_chars(text, 80)));
        let encoded = BASE64_STANDARD.encode(text.as_bytes());
        buffer.attach("file", &encoded, Some(mime), file_name.as_deref());
    }
    if let Some(uri) = source.uri.as_deref() {
        descriptor.push(format!("uri={uri}"));
    }
    buffer.parts.push(format!("[file {}]", descriptor.join(" ")));
    Ok(())
}

fn convert_resource(buffer: &mut ConversionBuffer, source: &BlockSource) -> Result<(), PromptConversionError> {
    let uri = source
        .uri
        .as_deref()
        .ok_or(PromptConversionError::ResourceMissingUri)?;
    let mime = source.mime_type.as_deref();
    let text = source
        .text
        .as_deref()
        .map(strip_transport_metadata)
        .filter(|text| !text.is_empty());
    let file_name = source
        .file_name
        .clone()
        .or_else(|| resolve_uri_file_name(uri));
    if let Some(data) = source.data.as_deref() {
        buffer.attach("file", data, mime, file_name.as_deref());
    } else if let Some(text) = text.as_deref() {
        let encoded = BASE64_STANDARD.encode(text.as_bytes());
        buffer.attach(
            "file",
            &encoded,
            Some(mime.unwrap_or("text/plain")),
            file_name.as_deref(),
        );
    }
    let mime_part = mime.map(|mime| format!(" mime={mime}")).unwrap_or_default();
    let tail = match (text.as_deref(), source.data.as_deref()) {
        (Some(text), _) => format!(" text={}", truncate_chars(text, 120)),
        (None, Some(data)) => format!(" size={}", data.len()),
        (None, None) => String::new(),
    };
    buffer
        .parts
        .push(format!("[resource uri={uri}{mime_part}{tail}]"));
    Ok(())
}
