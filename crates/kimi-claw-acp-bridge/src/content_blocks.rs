//! ACP content block shapes shared by prompt intake, live translation and replay.

use serde_json::{json, Map, Value};

use crate::payload_fields::{
    as_object, field_str, first_field_str, normalize_str, normalize_text, pretty_json, trimmed_str,
    JsonObject,
};

const FILE_NAME_KEYS: [&str; 4] = ["fileName", "file_name", "filename", "name"];
const MIME_TYPE_KEYS: [&str; 2] = ["mimeType", "mime_type"];
const TOOL_NAME_KEYS: [&str; 3] = ["name", "toolName", "tool_name"];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// Binary or textual payload carried by image, file and resource blocks.
pub struct BlockSource {
    pub data: Option<String>,
    pub text: Option<String>,
    pub uri: Option<String>,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One inbound ACP prompt block with field aliases already folded.
pub enum PromptBlock {
    Text {
        text: String,
    },
    Image(BlockSource),
    File(BlockSource),
    ResourceLink {
        uri: Option<String>,
        title: Option<String>,
        name: Option<String>,
        mime_type: Option<String>,
    },
    Resource(BlockSource),
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(str::to_string)
}

impl PromptBlock {
    /// Parses one block; unknown or untyped values yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let block_type = object.get("type")?.as_str()?;
        let block = match block_type {
            "text" => Self::Text {
                text: field_str(object, "text").unwrap_or_default().to_string(),
            },
            "image" => Self::Image(BlockSource {
                data: owned(field_str(object, "data")),
                text: None,
                uri: owned(field_str(object, "uri")),
                mime_type: owned(first_field_str(object, &MIME_TYPE_KEYS)),
                file_name: owned(first_field_str(object, &["fileName", "file_name", "name"])),
            }),
            "file" => Self::File(BlockSource {
                data: owned(field_str(object, "data")),
                text: owned(field_str(object, "text")),
                uri: owned(field_str(object, "uri")),
                mime_type: owned(first_field_str(object, &MIME_TYPE_KEYS)),
                file_name: owned(first_field_str(object, &FILE_NAME_KEYS)),
            }),
            "resource_link" => Self::ResourceLink {
                uri: owned(field_str(object, "uri")),
                title: owned(field_str(object, "title")),
                name: owned(field_str(object, "name")),
                mime_type: owned(first_field_str(object, &MIME_TYPE_KEYS)),
            },
            "resource" => {
                let empty = Map::new();
                let nested = as_object(object.get("resource")).unwrap_or(&empty);
                let pick = |keys: &[&str]| {
                    owned(first_field_str(nested, keys).or_else(|| first_field_str(object, keys)))
                };
                Self::Resource(BlockSource {
                    data: pick(&["data"]),
                    text: pick(&["text"]),
                    uri: pick(&["uri"]),
                    mime_type: pick(&MIME_TYPE_KEYS),
                    file_name: pick(&FILE_NAME_KEYS),
                })
            }
            _ => return None,
        };
        Some(block)
    }

    /// Echo of the block as the client sent it, for `user_message_chunk` updates.
    pub fn to_user_content(&self, resolved_name: Option<&str>) -> Option<Value> {
        match self {
            Self::Text { text } => (!text.is_empty()).then(|| json!({"type": "text", "text": text})),
            Self::Image(source) => {
                if source.data.is_none() && source.uri.is_none() {
                    return None;
                }
                let mut content = typed("image");
                insert_opt(&mut content, "data", source.data.as_deref());
                insert_opt(&mut content, "uri", source.uri.as_deref());
                insert_opt(
                    &mut content,
                    "mimeType",
                    Some(source.mime_type.as_deref().unwrap_or(OCTET_STREAM)),
                );
                insert_opt(&mut content, "fileName", source.file_name.as_deref());
                Some(Value::Object(content))
            }
            Self::ResourceLink {
                uri,
                title,
                name,
                mime_type,
            } => {
                let uri = uri.as_deref()?;
                let mut content = typed("resource_link");
                content.insert("uri".to_string(), json!(uri));
                insert_opt(&mut content, "title", title.as_deref());
                insert_opt(&mut content, "name", name.as_deref().or(resolved_name));
                insert_opt(&mut content, "mimeType", mime_type.as_deref());
                Some(Value::Object(content))
            }
            Self::File(source) => {
                if source.data.is_none() && source.text.is_none() && source.uri.is_none() {
                    return None;
                }
                let mut content = typed("file");
                insert_opt(&mut content, "data", source.data.as_deref());
                insert_opt(&mut content, "text", source.text.as_deref());
                insert_opt(&mut content, "uri", source.uri.as_deref());
                insert_opt(
                    &mut content,
                    "mimeType",
                    Some(source.mime_type.as_deref().unwrap_or(OCTET_STREAM)),
                );
                insert_opt(&mut content, "fileName", source.file_name.as_deref());
                Some(Value::Object(content))
            }
            Self::Resource(source) => {
                if source.uri.is_none() && source.text.is_none() && source.data.is_none() {
                    return None;
                }
                Some(json!({"type": "resource", "resource": resource_body(source)}))
            }
        }
    }
}

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Accepts an array of blocks, a bare string, `{content: [...]}` or a single block.
pub fn extract_prompt_blocks(input: &Value) -> Vec<PromptBlock> {
    let single;
    let values: &[Value] = match input {
        Value::Array(items) => items,
        Value::String(text) => {
            single = [json!({"type": "text", "text": text})];
            &single
        }
        Value::Object(object) => match object.get("content") {
            Some(Value::Array(items)) => items,
            _ if object.get("type").is_some_and(Value::is_string) => std::slice::from_ref(input),
            _ => &[],
        },
        _ => &[],
    };
    values.iter().filter_map(PromptBlock::from_value).collect()
}

fn typed(block_type: &str) -> JsonObject {
    let mut object = Map::new();
    object.insert("type".to_string(), json!(block_type));
    object
}

fn insert_opt(object: &mut JsonObject, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        object.insert(key.to_string(), json!(value));
    }
}

fn resource_body(source: &BlockSource) -> Value {
    let mut resource = Map::new();
    insert_opt(&mut resource, "uri", source.uri.as_deref());
    insert_opt(&mut resource, "mimeType", source.mime_type.as_deref());
    insert_opt(&mut resource, "text", source.text.as_deref());
    insert_opt(&mut resource, "data", source.data.as_deref());
    insert_opt(&mut resource, "fileName", source.file_name.as_deref());
    Value::Object(resource)
}

/// Last path segment of a URL (percent-decoded) or plain path.
pub fn resolve_uri_file_name(uri: &str) -> Option<String> {
    let usable = |name: &str| !name.is_empty() && name != "." && name != "/" && name != "\\";
    if let Ok(parsed) = url::Url::parse(uri) {
        let segment = parsed.path().rsplit('/').next().unwrap_or_default();
        if usable(segment) {
            let decoded = urlencoding::decode(segment)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| segment.to_string());
            return Some(decoded);
        }
    }
    let trimmed = uri.trim_end_matches(['/', '\\']);
    let base = trimmed.rsplit(['/', '\\']).next().unwrap_or_default();
    usable(base).then(|| base.to_string())
}

/// Normalizes a gateway or history content block into the ACP shape; `None` when empty.
pub fn to_session_content_block(block: &JsonObject) -> Option<Value> {
    let block_type = field_str(block, "type")?;
    match block_type {
        "text" => {
            let text = normalize_text(block.get("text"))?;
            Some(json!({"type": "text", "text": text}))
        }
        "image" => {
            let data = field_str(block, "data");
            let uri = field_str(block, "uri");
            if data.is_none() && uri.is_none() {
                return None;
            }
            let mut content = typed("image");
            insert_opt(&mut content, "data", data);
            insert_opt(&mut content, "uri", uri);
            insert_opt(&mut content, "mimeType", first_field_str(block, &MIME_TYPE_KEYS));
            let file_name = owned(first_field_str(block, &FILE_NAME_KEYS))
                .or_else(|| uri.and_then(resolve_uri_file_name));
            insert_opt(&mut content, "fileName", file_name.as_deref());
            Some(Value::Object(content))
        }
        "resource_link" => {
            let uri = field_str(block, "uri")?;
            let mut content = typed("resource_link");
            content.insert("uri".to_string(), json!(uri));
            insert_opt(&mut content, "title", field_str(block, "title"));
            insert_opt(&mut content, "name", field_str(block, "name"));
            insert_opt(&mut content, "mimeType", first_field_str(block, &MIME_TYPE_KEYS));
            Some(Value::Object(content))
        }
        "resource" => {
            let empty = Map::new();
            let nested = as_object(block.get("resource")).unwrap_or(&empty);
            let pick = |keys: &[&str]| {
                first_field_str(nested, keys).or_else(|| first_field_str(block, keys))
            };
            let uri = pick(&["uri"]);
            let text = normalize_text(nested.get("text")).or_else(|| normalize_text(block.get("text")));
            let data = pick(&["data"]);
            if uri.is_none() && text.is_none() && data.is_none() {
                return None;
            }
            let file_name =
                owned(pick(&FILE_NAME_KEYS)).or_else(|| uri.and_then(resolve_uri_file_name));
            let source = BlockSource {
                data: owned(data),
                text,
                uri: owned(uri),
                mime_type: owned(pick(&MIME_TYPE_KEYS)),
                file_name,
            };
            Some(json!({"type": "resource", "resource": resource_body(&source)}))
        }
        "file" => {
            let data = field_str(block, "data");
            let text = normalize_text(block.get("text"));
            let uri = field_str(block, "uri");
            if data.is_none() && text.is_none() && uri.is_none() {
                return None;
            }
            let mut content = typed("file");
            insert_opt(&mut content, "data", data);
            insert_opt(&mut content, "text", text.as_deref());
            insert_opt(&mut content, "uri", uri);
            insert_opt(&mut content, "mimeType", first_field_str(block, &MIME_TYPE_KEYS));
            let file_name = owned(first_field_str(block, &FILE_NAME_KEYS))
                .or_else(|| uri.and_then(resolve_uri_file_name));
            insert_opt(&mut content, "fileName", file_name.as_deref());
            Some(Value::Object(content))
        }
        _ => None,
    }
}

/// Flattens `content` (string or blocks with `text`) into one cleaned string.
pub fn extract_message_text(content: Option<&Value>) -> Option<String> {
    match content? {
        Value::String(text) => normalize_str(text),
        Value::Array(blocks) => {
            let parts = blocks
                .iter()
                .filter_map(Value::as_object)
                .filter_map(|block| normalize_text(block.get("text")))
                .collect::<Vec<_>>();
            if parts.is_empty() {
                return None;
            }
            normalize_str(&parts.join("\n"))
        }
        _ => None,
    }
}

/// Gateway assistant content as a list: arrays pass through, objects and strings are wrapped.
pub fn assistant_content_blocks(content: Option<&Value>) -> Vec<Value> {
    match content {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::String(text)) => vec![json!({"type": "text", "text": text})],
        Some(object @ Value::Object(_)) => vec![object.clone()],
        _ => Vec::new(),
    }
}

pub fn tool_title(block: &JsonObject) -> String {
    first_field_str(block, &TOOL_NAME_KEYS)
        .unwrap_or("tool")
        .to_string()
}

pub fn tool_arguments(block: &JsonObject) -> Value {
    ["arguments", "args"]
        .iter()
        .find_map(|key| block.get(*key).filter(|value| value.is_object()))
        .cloned()
        .unwrap_or_else(|| json!({}))
}

/// `text`, then string `result`, then pretty-printed structured `result`.
pub fn tool_result_text(block: &JsonObject, include_content: bool) -> Option<String> {
    normalize_text(block.get("text"))
        .or_else(|| normalize_text(block.get("result")))
        .or_else(|| {
            include_content
                .then(|| extract_message_text(block.get("content")))
                .flatten()
        })
        .or_else(|| {
            block
                .get("result")
                .filter(|result| result.is_object() || result.is_array())
                .map(pretty_json)
        })
}

pub fn tool_call_update(tool_call_id: &str, title: &str, args: &Value) -> Value {
    json!({
        "sessionUpdate": "tool_call",
        "toolCallId": tool_call_id,
        "title": title,
        "status": "in_progress",
        "content": [{"type": "content", "content": {"type": "text", "text": pretty_json(args)}}],
    })
}

pub fn tool_result_update(tool_call_id: &str, title: Option<&str>, text: &str) -> Value {
    let mut update = json!({
        "sessionUpdate": "tool_call_update",
        "toolCallId": tool_call_id,
        "status": "completed",
        "content": [{"type": "content", "content": {"type": "text", "text": text}}],
    });
    if let (Some(title), Some(object)) = (title, update.as_object_mut()) {
        object.insert("title".to_string(), json!(title));
    }
    update
}

pub fn message_chunk(session_update: &str, content: Value) -> Value {
    json!({"sessionUpdate": session_update, "content": content})
}

pub fn text_chunk_update(session_update: &str, text: &str) -> Value {
    message_chunk(session_update, json!({"type": "text", "text": text}))
}

/// Trimmed string from an optional JSON value; convenience for callers holding `Value`s.
pub fn value_str(value: &Value, key: &str) -> Option<String> {
    owned(trimmed_str(value.get(key)))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        extract_message_text, extract_prompt_blocks, resolve_uri_file_name,
        to_session_content_block, tool_result_text, PromptBlock,
    };

    #[test]
    fn unit_extract_prompt_blocks_accepts_all_input_shapes() {
        assert_eq!(
            extract_prompt_blocks(&json!("hi")),
            vec![PromptBlock::Text {
                text: "hi".to_string()
            }]
        );
        assert_eq!(
            extract_prompt_blocks(&json!({"content": [{"type": "text", "text": " a "}, {"type": "video"}]}))
                .len(),
            1
        );
        assert_eq!(extract_prompt_blocks(&json!({"type": "text", "text": "x"})).len(), 1);
        assert!(extract_prompt_blocks(&json!(5)).is_empty());
    }

    #[test]
    fn unit_resource_fields_prefer_nested_resource_values() {
        let blocks = extract_prompt_blocks(&json!([{
            "type": "resource",
            "uri": "file:///outer.txt",
            "name": "outer.txt",
            "resource": {"uri": "file:///inner.txt", "text": "body"}
        }]));
        let PromptBlock::Resource(source) = &blocks[0] else {
            panic!("expected resource block");
        };
        assert_eq!(source.uri.as_deref(), Some("file:///inner.txt"));
        assert_eq!(source.file_name.as_deref(), Some("outer.txt"));
        assert_eq!(source.text.as_deref(), Some("body"));
    }

    #[test]
    fn unit_resolve_uri_file_name_handles_urls_and_paths() {
        assert_eq!(
            resolve_uri_file_name("https://x.test/a/My%20File.pdf?sig=1").as_deref(),
            Some("My File.pdf")
        );
        assert_eq!(resolve_uri_file_name("/tmp/report.csv").as_deref(), Some("report.csv"));
        assert_eq!(resolve_uri_file_name("https://x.test/").as_deref(), Some("x.test"));
        assert_eq!(resolve_uri_file_name("/"), None);
        assert_eq!(resolve_uri_file_name(""), None);
    }

    #[test]
    fn unit_session_content_block_normalizes_and_drops_empty_blocks() {
        let image = json!({"type": "image", "uri": "https://x.test/pic.png", "mime_type": "image/png"});
        let normalized = to_session_content_block(image.as_object().expect("object")).expect("block");
        assert_eq!(normalized["fileName"], "pic.png");
        assert_eq!(normalized["mimeType"], "image/png");
        let empty = json!({"type": "text", "text": "HEARTBEAT_OK"});
        assert!(to_session_content_block(empty.as_object().expect("object")).is_none());
    }

    #[test]
    fn unit_message_text_and_tool_results_flatten_content() {
        assert_eq!(
            extract_message_text(Some(&json!([{"text": "a"}, {"image": 1}, {"text": "b"}]))).as_deref(),
            Some("a\nb")
        );
        let structured = json!({"result": {"ok": true}});
        assert_eq!(
            tool_result_text(structured.as_object().expect("object"), false).as_deref(),
            Some("{\n  \"ok\": true\n}")
        );
    }
}
