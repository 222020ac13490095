use std::{path::PathBuf, sync::Arc};

use rmcp::{
    ServerHandler,
    ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult,
        Content,
        Implementation,
        ServerCapabilities,
        ServerInfo,
    },
    tool,
    tool_handler,
    tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    config::Config,
    data_dir::DataDir,
    embedding::Embedder,
    error,
    indexer::Indexer,
    knowledge::KnowledgeTree,
    records::SourceKind,
    router::{FileFilters, FileMatch, FileRouter},
    store::Store,
    system_facts::{SYSTEM_DOMAIN, SystemSnapshot, record_system_facts},
    text_util::{DEFAULT_PREVIEW_CHARS, preview},
};

const DEFAULT_FILE_LIMIT: usize = 10;
const DEFAULT_CHUNK_LIMIT: usize = 5;
const DEFAULT_RECALL_LIMIT: usize = 5;

struct DeskindexState {
    store: Arc<Store>,
    embedder: Arc<dyn Embedder>,
    config: Config,
    router: FileRouter,
}

impl DeskindexState {
    fn new(store: Arc<Store>, embedder: Arc<dyn Embedder>, config: Config) -> Self {
        let router = FileRouter::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            config.router.clone(),
            config.chunking,
        );
        Self {
            store,
            embedder,
            config,
            router,
        }
    }

    fn knowledge(&self) -> KnowledgeTree<'_> {
        KnowledgeTree::new(&self.store, self.embedder.as_ref(), self.config.knowledge)
    }
}

#[derive(Clone)]
pub struct DeskindexMcpServer {
    state: Arc<DeskindexState>,
    tool_router: ToolRouter<Self>,
}

impl DeskindexMcpServer {
    fn new(state: DeskindexState) -> Self {
        Self {
            state: Arc::new(state),
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router(router = tool_router)]
impl DeskindexMcpServer {
    /// Index or re-index a directory tree.
    #[tool(
        name = "index_directory",
        description = "Index a directory tree so its files can be found. Re-running on the same directory only processes what changed."
    )]
    pub async fn index_directory(
        &self,
        params: Parameters<IndexParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let state = Arc::clone(&self.state);
        let root = PathBuf::from(&params.path);
        let full = params.full.unwrap_or(false);

        let report = tokio::task::spawn_blocking(move || -> error::Result<_> {
            let indexer =
                Indexer::new(&state.store, state.embedder.as_ref(), &state.config.indexer)?;
            if full {
                indexer.full_index(&root.canonicalize()?)
            } else {
                indexer.index_from_root(&root)
            }
        })
        .await
        .map_err(|e| mcp_error("indexing task failed", e))?
        .map_err(|e| mcp_error("indexing failed", e))?;

        let summary = format!(
            "{} index of {}: {} files embedded, {} removed, {} folders updated",
            report.mode,
            params.path,
            report.files_indexed,
            report.files_removed,
            report.folders_indexed
        );
        let structured = serde_json::to_value(&report)
            .map_err(|e| mcp_error("failed to serialize index report", e))?;

        let mut call_result = CallToolResult::success(vec![Content::text(summary)]);
        call_result.structured_content = Some(structured);
        Ok(call_result)
    }

    /// Find files by what they are called, what kind they are and what they
    /// start with.
    #[tool(
        name = "find_files",
        description = "Find indexed files relevant to a query. Supports extension, location and modification-date filters."
    )]
    pub async fn find_files(
        &self,
        params: Parameters<FindParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let filters = FileFilters {
            extensions: params
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            location: params.location.clone(),
            modified_after: params.modified_after,
            modified_before: params.modified_before,
        };
        let state = Arc::clone(&self.state);
        let query = params.query.clone();
        let limit = params.limit.unwrap_or(DEFAULT_FILE_LIMIT);
        let matches = tokio::task::spawn_blocking(move || {
            state.router.find_with_filters(&query, &filters, limit)
        })
        .await
        .map_err(|e| mcp_error("file search task failed", e))?
        .map_err(|e| mcp_error("file search failed", e))?;

        let items: Vec<FileResultItem> = matches.iter().map(FileResultItem::from).collect();
        let summary = format_file_summary(&items, &params.query);
        let structured = serde_json::to_value(FindResponse {
            query: params.query,
            result_count: items.len(),
            results: items,
        })
        .map_err(|e| mcp_error("failed to serialize file results", e))?;

        let mut call_result = CallToolResult::success(vec![Content::text(summary)]);
        call_result.structured_content = Some(structured);
        Ok(call_result)
    }

    /// Files plus the passages inside them that best answer the query.
    #[tool(
        name = "search_content",
        description = "Search inside files: returns relevant files and the passages in them that best match the query. Slower than find_files on first use."
    )]
    pub async fn search_content(
        &self,
        params: Parameters<ContentParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let results = self
            .state
            .router
            .search_with_content(
                &params.query,
                params.limit.unwrap_or(DEFAULT_FILE_LIMIT),
                params.top_k.unwrap_or(DEFAULT_CHUNK_LIMIT),
            )
            .await
            .map_err(|e| mcp_error("content search failed", e))?;

        let files: Vec<FileResultItem> =
            results.files.iter().map(FileResultItem::from).collect();
        let passages: Vec<PassageItem> = results
            .chunks
            .into_iter()
            .map(|c| PassageItem {
                path: c.file_path,
                chunk_index: c.chunk_index,
                offset: c.offset,
                score: c.score,
                text: c.text,
            })
            .collect();

        let mut lines = vec![format_file_summary(&files, &params.query)];
        for p in &passages {
            lines.push(format!(
                "--- {} #{} {:.3}\n{}",
                p.path,
                p.chunk_index,
                p.score,
                preview(&p.text, DEFAULT_PREVIEW_CHARS)
            ));
        }

        let structured = serde_json::to_value(ContentResponse {
            query: params.query,
            files,
            passages,
        })
        .map_err(|e| mcp_error("failed to serialize content results", e))?;

        let mut call_result = CallToolResult::success(vec![Content::text(lines.join("\n"))]);
        call_result.structured_content = Some(structured);
        Ok(call_result)
    }

    /// Look up facts in a knowledge domain.
    #[tool(
        name = "recall",
        description = "Recall stored facts from a knowledge domain (for example system, personal or photos) that relate to a query."
    )]
    pub async fn recall(
        &self,
        params: Parameters<RecallParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let state = Arc::clone(&self.state);
        let (query, domain) = (params.query.clone(), params.domain.clone());
        let top_k = params.top_k.unwrap_or(DEFAULT_RECALL_LIMIT);
        let matches = tokio::task::spawn_blocking(move || {
            state.knowledge().query(&query, &domain, top_k)
        })
        .await
        .map_err(|e| mcp_error("recall task failed", e))?
        .map_err(|e| mcp_error("recall failed", e))?;

        let items: Vec<FactItem> = matches
            .into_iter()
            .map(|m| FactItem {
                id: m.item.id,
                content: m.item.content,
                source: m.item.source,
                source_path: m.item.source_path,
                confidence: m.item.confidence,
                score: Some(m.score),
            })
            .collect();

        let summary = if items.is_empty() {
            format!("Nothing stored in \"{}\" matches \"{}\"", params.domain, params.query)
        } else {
            items
                .iter()
                .map(|i| format!("{:.3} {}", i.score.unwrap_or_default(), i.content))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let structured = serde_json::to_value(RecallResponse {
            domain: params.domain,
            result_count: items.len(),
            results: items,
        })
        .map_err(|e| mcp_error("failed to serialize recall results", e))?;

        let mut call_result = CallToolResult::success(vec![Content::text(summary)]);
        call_result.structured_content = Some(structured);
        Ok(call_result)
    }

    /// Store a fact in a knowledge domain.
    #[tool(
        name = "learn",
        description = "Store a fact in a knowledge domain. Repeating a known fact raises its confidence instead of duplicating it."
    )]
    pub async fn learn(
        &self,
        params: Parameters<LearnParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let state = Arc::clone(&self.state);
        let item = tokio::task::spawn_blocking(move || {
            let tree = state.knowledge();
            match params.source {
                Some(source) => tree.add_item(
                    &params.fact,
                    &params.domain,
                    source,
                    params.source_path.as_deref(),
                ),
                None => tree.learn(&params.fact, &params.domain),
            }
        })
        .await
        .map_err(|e| mcp_error("learn task failed", e))?
        .map_err(|e| mcp_error("learn failed", e))?;

        let summary = format!(
            "Stored fact #{} in \"{}\" (confidence {:.1})",
            item.id, item.domain, item.confidence
        );
        let structured = serde_json::to_value(FactItem {
            id: item.id,
            content: item.content,
            source: item.source,
            source_path: item.source_path,
            confidence: item.confidence,
            score: None,
        })
        .map_err(|e| mcp_error("failed to serialize fact", e))?;

        let mut call_result = CallToolResult::success(vec![Content::text(summary)]);
        call_result.structured_content = Some(structured);
        Ok(call_result)
    }

    /// Re-read hardware and load figures into the system domain.
    #[tool(
        name = "refresh_system_facts",
        description = "Read this computer's CPU, memory, disk, uptime and heaviest processes and store them as facts in the \"system\" domain, replacing the previous readings."
    )]
    pub async fn refresh_system_facts(&self) -> Result<CallToolResult, rmcp::ErrorData> {
        let state = Arc::clone(&self.state);
        let facts = tokio::task::spawn_blocking(move || -> error::Result<_> {
            let snapshot = SystemSnapshot::capture();
            record_system_facts(&state.knowledge(), &snapshot)?;
            Ok(snapshot.facts())
        })
        .await
        .map_err(|e| mcp_error("system facts task failed", e))?
        .map_err(|e| mcp_error("recording system facts failed", e))?;

        let summary = format!(
            "Recorded {} facts in \"{SYSTEM_DOMAIN}\":\n{}",
            facts.len(),
            facts.join("\n")
        );
        let mut call_result = CallToolResult::success(vec![Content::text(summary)]);
        call_result.structured_content = Some(json!({
                "domain": SYSTEM_DOMAIN,
                "factCount": facts.len(),
                "facts": facts,
            }));
        Ok(call_result)
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for DeskindexMcpServer {
    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::new(ServerCapabilities::builder().enable_tools().build());
        info.server_info = Implementation::new("deskindex", env!("CARGO_PKG_VERSION"))
            .with_title("deskindex MCP");
        info.instructions = Some(
            "Use find_files to locate files, search_content when the answer is inside a file, recall/learn for facts about the user and their system, and refresh_system_facts before answering questions about this computer."
                .to_string(),
        );
        info
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IndexParams {
    /// Directory to index.
    pub path: String,
    /// Discard the existing index first (default: false).
    pub full: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FindParams {
    /// Search query string.
    pub query: String,
    /// Maximum number of results (default: 10).
    pub limit: Option<usize>,
    /// Only files with these extensions, e.g. ["pdf", "xlsx"].
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Only files whose path contains this text.
    pub location: Option<String>,
    /// Only files modified at or after this Unix time (seconds).
    pub modified_after: Option<u64>,
    /// Only files modified at or before this Unix time (seconds).
    pub modified_before: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContentParams {
    /// Search query string.
    pub query: String,
    /// Maximum number of files (default: 10).
    pub limit: Option<usize>,
    /// Maximum number of passages (default: 5).
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecallParams {
    /// What to look up.
    pub query: String,
    /// Knowledge domain, e.g. "system" or "personal".
    pub domain: String,
    /// Maximum number of facts (default: 5).
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LearnParams {
    /// The fact to store.
    pub fact: String,
    /// Knowledge domain to store it in.
    pub domain: String,
    /// Where the fact came from; omitted means it was inferred.
    pub source: Option<SourceKind>,
    /// File the fact was taken from.
    pub source_path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FindResponse {
    query: String,
    result_count: usize,
    results: Vec<FileResultItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContentResponse {
    query: String,
    files: Vec<FileResultItem>,
    passages: Vec<PassageItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecallResponse {
    domain: String,
    result_count: usize,
    results: Vec<FactItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileResultItem {
    path: String,
    name: String,
    extension: String,
    modified: u64,
    size: u64,
    score: f32,
    signature: Option<String>,
}

impl From<&FileMatch> for FileResultItem {
    fn from(m: &FileMatch) -> Self {
        Self {
            path: m.file.path.clone(),
            name: m.file.name.clone(),
            extension: m.file.extension.clone(),
            modified: m.file.modified,
            size: m.file.size,
            score: m.score,
            signature: m
                .file
                .signature
                .as_deref()
                .map(|s| preview(s, DEFAULT_PREVIEW_CHARS)),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PassageItem {
    path: String,
    chunk_index: u32,
    offset: usize,
    score: f32,
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FactItem {
    id: u64,
    content: String,
    source: SourceKind,
    source_path: Option<String>,
    confidence: f32,
    score: Option<f32>,
}

fn format_file_summary(results: &[FileResultItem], query: &str) -> String {
    if results.is_empty() {
        return format!("No files found for \"{query}\"");
    }

    let mut lines = Vec::with_capacity(results.len() + 1);
    let suffix = if results.len() == 1 { "" } else { "s" };
    lines.push(format!(
        "Found {} file{} for \"{query}\":",
        results.len(),
        suffix
    ));

    for item in results {
        lines.push(format!("{:.3} {}", item.score, item.path));
    }

    lines.join("\n")
}

fn mcp_error(message: &str, error: impl std::fmt::Display) -> rmcp::ErrorData {
    rmcp::ErrorData::internal_error(
        message.to_string(),
        Some(json!({ "error": error.to_string() })),
    )
}

pub fn run_mcp(
    data_dir: DataDir,
    config: Config,
    embedder: Arc<dyn Embedder>,
) -> error::Result<()> {
    let store = Arc::new(Store::open(&data_dir.index_db())?);
    let server = DeskindexMcpServer::new(DeskindexState::new(store, embedder, config));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            error::Error::Config(format!("failed to start tokio runtime: {e}"))
        })?;

    runtime.block_on(async move {
        let transport = rmcp::transport::stdio();
        let running = server.serve(transport).await.map_err(|e| {
            error::Error::Config(format!(
                "MCP server initialization failed: {e}"
            ))
        })?;
        running.waiting().await.map_err(|e| {
            error::Error::Config(format!("MCP server error: {e}"))
        })?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;

    fn server(db: &std::path::Path) -> DeskindexMcpServer {
        let store = Arc::new(Store::open(&db.join("index.redb")).unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());
        DeskindexMcpServer::new(DeskindexState::new(store, embedder, Config::default()))
    }

    fn summary_text(result: &CallToolResult) -> String {
        result
            .content
            .first()
            .and_then(|c| c.as_text())
            .map(|t| t.text.clone())
            .unwrap_or_default()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn index_then_find_files() {
        let tree = tempfile::tempdir().unwrap();
        std::fs::write(
            tree.path().join("garden-plan.txt"),
            "Garden plan: tomatoes along the fence, basil near the door.\n",
        )
        .unwrap();
        std::fs::write(tree.path().join("receipt.txt"), "coffee 3.50\n").unwrap();
        let db = tempfile::tempdir().unwrap();
        let server = server(db.path());

        let indexed = server
            .index_directory(Parameters(IndexParams {
                path: tree.path().to_string_lossy().into_owned(),
                full: None,
            }))
            .await
            .unwrap();
        let report = indexed.structured_content.expect("structured");
        assert_eq!(report.get("mode").and_then(|v| v.as_str()), Some("full"));
        assert_eq!(report.get("files_indexed").and_then(|v| v.as_u64()), Some(2));

        let result = server
            .find_files(Parameters(FindParams {
                query: "garden plan".to_string(),
                limit: Some(5),
                extensions: Vec::new(),
                location: None,
                modified_after: None,
                modified_before: None,
            }))
            .await
            .unwrap();

        let structured = result.structured_content.clone().expect("structured");
        let results = structured
            .get("results")
            .and_then(|v| v.as_array())
            .expect("results array");
        assert!(!results.is_empty());
        let first_path = results[0].get("path").and_then(|v| v.as_str()).unwrap();
        assert!(first_path.ends_with("garden-plan.txt"));
        assert!(summary_text(&result).contains("for \"garden plan\""));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn search_content_returns_passages() {
        let tree = tempfile::tempdir().unwrap();
        std::fs::write(
            tree.path().join("sourdough.txt"),
            "Sourdough starter feeding: feed the sourdough starter with flour and water every day.",
        )
        .unwrap();
        let db = tempfile::tempdir().unwrap();
        let server = server(db.path());
        server
            .index_directory(Parameters(IndexParams {
                path: tree.path().to_string_lossy().into_owned(),
                full: Some(true),
            }))
            .await
            .unwrap();

        let result = server
            .search_content(Parameters(ContentParams {
                query: "sourdough starter feeding".to_string(),
                limit: None,
                top_k: Some(3),
            }))
            .await
            .unwrap();
        let structured = result.structured_content.expect("structured");
        let passages = structured
            .get("passages")
            .and_then(|v| v.as_array())
            .expect("passages array");
        assert_eq!(passages.len(), 1);
        assert!(
            passages[0]
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap()
                .contains("flour and water")
        );
    }

    #[tokio::test]
    async fn learn_then_recall() {
        let db = tempfile::tempdir().unwrap();
        let server = server(db.path());

        let learned = server
            .learn(Parameters(LearnParams {
                fact: "The laptop has 32 GB of memory".to_string(),
                domain: "system".to_string(),
                source: Some(SourceKind::System),
                source_path: None,
            }))
            .await
            .unwrap();
        assert!(summary_text(&learned).contains("\"system\""));

        let result = server
            .recall(Parameters(RecallParams {
                query: "laptop memory".to_string(),
                domain: "system".to_string(),
                top_k: None,
            }))
            .await
            .unwrap();
        let structured = result.structured_content.expect("structured");
        assert_eq!(structured.get("resultCount").and_then(|v| v.as_u64()), Some(1));
        let first = &structured.get("results").and_then(|v| v.as_array()).unwrap()[0];
        assert_eq!(first.get("source").and_then(|v| v.as_str()), Some("system"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn system_facts_feed_the_system_domain() {
        let db = tempfile::tempdir().unwrap();
        let server = server(db.path());

        let refreshed = server.refresh_system_facts().await.unwrap();
        let structured = refreshed.structured_content.expect("structured");
        let count = structured.get("factCount").and_then(|v| v.as_u64()).unwrap();
        assert!(count > 0);

        let result = server
            .recall(Parameters(RecallParams {
                query: "how much memory does this computer have".to_string(),
                domain: "system".to_string(),
                top_k: Some(3),
            }))
            .await
            .unwrap();
        let structured = result.structured_content.expect("structured");
        let results = structured.get("results").and_then(|v| v.as_array()).unwrap();
        assert!(!results.is_empty());
        assert!(
            results
                .iter()
                .all(|r| r.get("source").and_then(|v| v.as_str()) == Some("system"))
        );
    }

    #[tokio::test]
    async fn recall_unknown_domain_is_empty() {
        let db = tempfile::tempdir().unwrap();
        let server = server(db.path());
        let result = server
            .recall(Parameters(RecallParams {
                query: "anything".to_string(),
                domain: "photos".to_string(),
                top_k: Some(3),
            }))
            .await
            .unwrap();
        assert!(summary_text(&result).starts_with("Nothing stored"));
    }
}
