use serde_json::{json, Value};
use thiserror::Error;

pub const JSONRPC_INVALID_REQUEST: i64 = -32600;
pub const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;
pub const JSONRPC_INVALID_PARAMS: i64 = -32602;
pub const GATEWAY_UNAVAILABLE: i64 = -32001;
pub const GATEWAY_RESPONSE_ERROR: i64 = -32020;
pub const GATEWAY_LIFECYCLE_ERROR: i64 = -32021;
pub const GATEWAY_LIFECYCLE_TIMEOUT: i64 = -32022;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} (code {code})")]
/// JSON-RPC error reply sent back to the ACP endpoint.
pub struct BridgeError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl BridgeError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// `-32602` with no detail beyond the message.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(JSONRPC_INVALID_PARAMS, message)
    }

    /// `-32602 "invalid params"` carrying the nested `-32600` reason in `data.error`.
    pub fn invalid_params_detail(reason: impl Into<String>) -> Self {
        Self::new(JSONRPC_INVALID_PARAMS, "invalid params").with_data(json!({
            "error": {
                "code": JSONRPC_INVALID_REQUEST,
                "message": reason.into(),
            }
        }))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(JSONRPC_METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn gateway_unavailable(message: impl Into<String>) -> Self {
        Self::new(GATEWAY_UNAVAILABLE, message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Prompt blocks that cannot be rendered into gateway text.
pub enum PromptConversionError {
    #[error("image block requires data or uri")]
    ImageMissingSource,
    #[error("resource_link block requires uri")]
    ResourceLinkMissingUri,
    #[error("file block requires data, text, or uri")]
    FileMissingSource,
    #[error("resource block requires uri")]
    ResourceMissingUri,
    #[error(transparent)]
    FileReference(#[from] FileReferenceError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FileReferenceError {
    #[error("resource_link kimi-file uri requires file_id")]
    MissingFileId,
    #[error("resource_link kimi-file uri has invalid file_id")]
    InvalidFileId,
}

impl From<PromptConversionError> for BridgeError {
    fn from(error: PromptConversionError) -> Self {
        Self::invalid_params_detail(error.to_string())
    }
}

impl From<FileReferenceError> for BridgeError {
    fn from(error: FileReferenceError) -> Self {
        Self::invalid_params_detail(error.to_string())
    }
}
