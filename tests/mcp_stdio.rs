use std::path::{Path, PathBuf};

use rmcp::{
    ServiceExt,
    model::CallToolRequestParams,
    transport::{ConfigureCommandExt, TokioChildProcess},
};
use serde_json::json;

fn setup_fixture(tree: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let trips = tree.join("Travel");
    std::fs::create_dir_all(&trips)?;
    std::fs::write(
        trips.join("kyoto-itinerary.md"),
        "Kyoto itinerary\nDay 1: Fushimi Inari at sunrise\nDay 2: Arashiyama bamboo grove\n",
    )?;
    std::fs::write(tree.join("shopping.txt"), "eggs, rice, miso\n")?;
    Ok(())
}

fn tool_call(name: &str, args: serde_json::Value) -> CallToolRequestParams {
    let mut params = CallToolRequestParams::new(name.to_string());
    params.arguments = args.as_object().cloned();
    params
}

#[tokio::test]
async fn mcp_stdio_index_find_and_recall() -> Result<(), Box<dyn std::error::Error>>
{
    let data_dir = tempfile::tempdir()?;
    let tree = tempfile::tempdir()?;
    setup_fixture(tree.path())?;

    let bin = deskindex_bin()?;
    let transport = TokioChildProcess::new(
        tokio::process::Command::new(bin).configure(|cmd| {
            cmd.arg("mcp")
                .env("DESKINDEX_DATA_DIR", data_dir.path())
                .env("DESKINDEX_MODEL", "hash")
                .env("DESKINDEX_LOG", "warn");
        }),
    )?;

    let client = ().serve(transport).await?;

    let indexed = client
        .peer()
        .call_tool(tool_call(
            "index_directory",
            json!({ "path": tree.path().to_string_lossy() }),
        ))
        .await?;
    let report = indexed.structured_content.expect("index report");
    assert_eq!(report.get("files_indexed").and_then(|v| v.as_u64()), Some(2));

    let found = client
        .peer()
        .call_tool(tool_call(
            "find_files",
            json!({ "query": "kyoto itinerary", "limit": 5 }),
        ))
        .await?;
    let structured = found.structured_content.expect("structured content");
    let results = structured
        .get("results")
        .and_then(|v| v.as_array())
        .expect("results array");
    assert!(!results.is_empty());
    assert_eq!(
        results[0].get("name").and_then(|v| v.as_str()),
        Some("kyoto-itinerary.md")
    );

    let content = client
        .peer()
        .call_tool(tool_call(
            "search_content",
            json!({ "query": "bamboo grove kyoto", "topK": 2 }),
        ))
        .await?;
    let passages = content
        .structured_content
        .as_ref()
        .and_then(|v| v.get("passages"))
        .and_then(|v| v.as_array())
        .cloned()
        .expect("passages array");
    assert!(!passages.is_empty());
    assert!(
        passages[0]
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .contains("bamboo")
    );

    client
        .peer()
        .call_tool(tool_call(
            "learn",
            json!({ "fact": "Prefers window seats on trains", "domain": "personal" }),
        ))
        .await?;
    let recalled = client
        .peer()
        .call_tool(tool_call(
            "recall",
            json!({ "query": "train seat preference", "domain": "personal" }),
        ))
        .await?;
    let recalled = recalled.structured_content.expect("recall results");
    let facts = recalled
        .get("results")
        .and_then(|v| v.as_array())
        .expect("results array");
    assert_eq!(facts.len(), 1);
    assert_eq!(
        facts[0].get("source").and_then(|v| v.as_str()),
        Some("inferred")
    );

    client.cancel().await?;
    Ok(())
}

fn deskindex_bin() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Ok(bin) = std::env::var("CARGO_BIN_EXE_deskindex") {
        return Ok(PathBuf::from(bin));
    }

    let mut path = std::env::current_exe()?;
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("deskindex");

    if cfg!(windows) {
        path.set_extension("exe");
    }

    Ok(path)
}
