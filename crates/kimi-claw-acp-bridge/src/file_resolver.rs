use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;

use crate::bridge_errors::FileReferenceError;
use crate::content_blocks::PromptBlock;
use crate::prompt_converter::parse_kimi_file_uri;

pub const RESOLVER_UNAVAILABLE_CODE: &str = "resolver_unavailable";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
/// A `kimi-file` reference the resolver downloaded.
pub struct ResolvedFile {
    pub file_id: String,
    pub id: String,
    pub name: String,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub download_url_source: String,
    pub local_path: String,
    pub local_file_name: String,
    pub local_size_bytes: u64,
    pub local_cache_hit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
/// A `kimi-file` reference that could not be downloaded, with the reason.
pub struct FailedFile {
    pub file_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub code: String,
    pub message: String,
    pub retriable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
/// Outcome of resolving one `kimi-file://` reference to a local download.
pub enum FileResolution {
    Resolved(ResolvedFile),
    ResolveFailed(FailedFile),
}

impl FileResolution {
    pub fn file_id(&self) -> &str {
        match self {
            Self::Resolved(file) => &file.file_id,
            Self::ResolveFailed(file) => &file.file_id,
        }
    }

    /// Key used to log each distinct outcome once per prompt.
    pub fn dedup_key(&self) -> String {
        match self {
            Self::Resolved(file) => format!("{}:resolved", file.file_id),
            Self::ResolveFailed(file) => format!("{}:{}", file.file_id, file.code),
        }
    }

    /// `http_<status>` for HTTP failures with a known status, else the failure code.
    pub fn failure_reason(&self) -> Option<String> {
        let Self::ResolveFailed(file) = self else {
            return None;
        };
        match (file.code.as_str(), file.http_status) {
            ("http_4xx" | "http_5xx", Some(status)) => Some(format!("http_{status}")),
            _ => Some(file.code.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// File ids referenced by one prompt, deduplicated, plus the uri each came from.
pub struct ResolutionPlan {
    pub file_ids: Vec<String>,
    pub file_id_by_uri: HashMap<String, String>,
}

impl ResolutionPlan {
    pub fn is_empty(&self) -> bool {
        self.file_ids.is_empty()
    }
}

/// Collects `kimi-file://` resource links; the first malformed one aborts the plan.
pub fn build_resolution_plan(blocks: &[PromptBlock]) -> Result<ResolutionPlan, FileReferenceError> {
    let mut plan = ResolutionPlan::default();
    for block in blocks {
        let PromptBlock::ResourceLink { uri: Some(uri), .. } = block else {
            continue;
        };
        let Some(file_id) = parse_kimi_file_uri(uri)? else {
            continue;
        };
        if !plan.file_ids.contains(&file_id) {
            plan.file_ids.push(file_id.clone());
        }
        plan.file_id_by_uri.insert(uri.clone(), file_id);
    }
    Ok(plan)
}

#[async_trait]
/// Downloads `kimi-file` references before a prompt is forwarded.
pub trait FileResolver: Send + Sync {
    fn resolver_name(&self) -> &'static str;

    async fn resolve_file(&self, file_id: &str, session_id: &str, request_id: &str)
        -> FileResolution;
}

/// Resolves every planned file id concurrently and keys the outcomes by uri.
pub async fn resolve_for_prompt(
    resolver: &dyn FileResolver,
    plan: &ResolutionPlan,
    session_id: &str,
    request_id: &str,
) -> HashMap<String, FileResolution> {
    if plan.is_empty() {
        return HashMap::new();
    }
    let outcomes = join_all(
        plan.file_ids
            .iter()
            .map(|file_id| resolver.resolve_file(file_id, session_id, request_id)),
    )
    .await;
    let by_file_id = plan
        .file_ids
        .iter()
        .cloned()
        .zip(outcomes)
        .collect::<HashMap<_, _>>();
    plan.file_id_by_uri
        .iter()
        .filter_map(|(uri, file_id)| {
            by_file_id
                .get(file_id)
                .map(|resolution| (uri.clone(), resolution.clone()))
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
/// Resolver used when no download backend is wired in; every reference degrades.
pub struct NoopFileResolver;

#[async_trait]
impl FileResolver for NoopFileResolver {
    fn resolver_name(&self) -> &'static str {
        "noop"
    }

    async fn resolve_file(
        &self,
        file_id: &str,
        _session_id: &str,
        _request_id: &str,
    ) -> FileResolution {
        FileResolution::ResolveFailed(FailedFile {
            file_id: file_id.to_string(),
            name: None,
            code: RESOLVER_UNAVAILABLE_CODE.to_string(),
            message: "file resolver is not configured".to_string(),
            retriable: false,
            http_status: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        build_resolution_plan, resolve_for_prompt, FailedFile, FileResolution, NoopFileResolver,
    };
    use crate::bridge_errors::FileReferenceError;
    use crate::content_blocks::extract_prompt_blocks;

    const FILE_ID: &str = "0f8fad5b-d9cb-469f-a165-70867728950e";

    #[test]
    fn unit_plan_dedups_file_ids_and_skips_plain_links() {
        let blocks = extract_prompt_blocks(&json!([
            {"type": "resource_link", "uri": format!("kimi-file://{FILE_ID}")},
            {"type": "resource_link", "uri": format!("kimi-file:// {FILE_ID}")},
            {"type": "resource_link", "uri": "https://x.test/a.pdf"}
        ]));
        let plan = build_resolution_plan(&blocks).expect("plan");
        assert_eq!(plan.file_ids, vec![FILE_ID.to_string()]);
        assert_eq!(plan.file_id_by_uri.len(), 2);
    }

    #[test]
    fn unit_plan_rejects_malformed_file_ids() {
        let blocks = extract_prompt_blocks(&json!([
            {"type": "resource_link", "uri": "kimi-file://not-a-uuid"}
        ]));
        assert_eq!(
            build_resolution_plan(&blocks),
            Err(FileReferenceError::InvalidFileId)
        );
    }

    #[test]
    fn unit_failure_reason_expands_http_status() {
        let failure = FileResolution::ResolveFailed(FailedFile {
            file_id: FILE_ID.to_string(),
            name: None,
            code: "http_4xx".to_string(),
            message: "not found".to_string(),
            retriable: false,
            http_status: Some(404),
        });
        assert_eq!(failure.failure_reason().as_deref(), Some("http_404"));
        let encoded = serde_json::to_value(&failure).expect("encode");
        assert_eq!(encoded["status"], "resolve_failed");
        assert_eq!(encoded["httpStatus"], 404);
    }

    #[tokio::test]
    async fn functional_noop_resolver_degrades_every_reference() {
        let uri = format!("kimi-file://{FILE_ID}");
        let blocks = extract_prompt_blocks(&json!([{"type": "resource_link", "uri": uri}]));
        let plan = build_resolution_plan(&blocks).expect("plan");
        let resolved = resolve_for_prompt(&NoopFileResolver, &plan, "s1", "1").await;
        let resolution = resolved.get(&uri).expect("resolution");
        assert_eq!(resolution.failure_reason().as_deref(), Some("resolver_unavailable"));
    }
}
