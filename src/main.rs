use std::sync::Arc;

use clap::Parser;
use deskindex::{
    Config,
    DataDir,
    Embedder,
    FileRouter,
    Indexer,
    KnowledgeTree,
    Store,
    embedding::embedder_for_model,
    error::{self, Error},
    model_manager::resolve_model_id,
    indexer::IndexReport,
    records::now_secs,
    router::{FileFilters, FileMatch},
    system_facts::{SYSTEM_DOMAIN, SystemSnapshot, record_system_facts},
    text_util::{DEFAULT_PREVIEW_CHARS, preview},
    walker::PathFilter,
    watcher::{TreeWatcher, watch_and_index},
};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command};

const LOG_ENV_VAR: &str = "DESKINDEX_LOG";
const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var(LOG_ENV_VAR) {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config = Config::load(&data_dir.config_file())?;
    let model_id = resolve_model_id(cli.model.as_deref(), config.model.as_deref());
    let embedder: Arc<dyn Embedder> = Arc::from(embedder_for_model(&model_id));

    if let Command::Mcp = cli.command {
        return deskindex::mcp::run_mcp(data_dir, config, embedder);
    }

    let store = Arc::new(Store::open(&data_dir.index_db())?);

    match cli.command {
        Command::Index(args) => cmd_index(&store, embedder.as_ref(), &config, &args)?,
        Command::Watch(args) => {
            cmd_watch(&store, embedder.as_ref(), &config, &data_dir, &args)?
        }
        Command::Find(args) => {
            let router = router(&store, &embedder, &config);
            cmd_find(&router, &args)?;
        }
        Command::Read(args) => {
            let router = router(&store, &embedder, &config);
            cmd_read(&router, &args)?;
        }
        Command::Recall(args) => {
            let tree = KnowledgeTree::new(&store, embedder.as_ref(), config.knowledge);
            cmd_recall(&tree, &args)?;
        }
        Command::Learn(args) => {
            let tree = KnowledgeTree::new(&store, embedder.as_ref(), config.knowledge);
            cmd_learn(&tree, &args)?;
        }
        Command::RebuildDomain(args) => {
            let tree = KnowledgeTree::new(&store, embedder.as_ref(), config.knowledge);
            cmd_rebuild_domain(&tree, &args)?;
        }
        Command::SystemFacts(args) => {
            let tree = KnowledgeTree::new(&store, embedder.as_ref(), config.knowledge);
            cmd_system_facts(&tree, &args)?;
        }
        Command::Status(args) => {
            cmd_status(&store, &data_dir, &model_id, args.json)?;
        }
        Command::Mcp | Command::Completions(_) => {}
    }

    Ok(())
}

fn router(store: &Arc<Store>, embedder: &Arc<dyn Embedder>, config: &Config) -> FileRouter {
    FileRouter::new(
        Arc::clone(store),
        Arc::clone(embedder),
        config.router.clone(),
        config.chunking,
    )
}

fn print_json(value: &impl serde::Serialize) -> error::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn require_dir(root: &std::path::Path) -> error::Result<()> {
    if root.is_dir() {
        Ok(())
    } else {
        Err(Error::Config(format!("not a directory: {}", root.display())))
    }
}

fn print_report(report: &IndexReport, root: &std::path::Path) {
    println!(
        "{} index of {}: {} folders, {} files embedded ({} with content), {} touched, {} removed in {} ms",
        report.mode,
        root.display(),
        report.folders_indexed,
        report.files_indexed,
        report.files_with_content,
        report.files_touched,
        report.files_removed,
        report.elapsed_ms
    );
}

fn cmd_index(
    store: &Store,
    embedder: &dyn Embedder,
    config: &Config,
    args: &cli::IndexArgs,
) -> error::Result<()> {
    require_dir(&args.root)?;

    let indexer = Indexer::new(store, embedder, &config.indexer)?;
    let report = if args.full {
        indexer.full_index(&args.root.canonicalize()?)?
    } else {
        indexer.index_from_root(&args.root)?
    };

    if args.json {
        return print_json(&report);
    }
    print_report(&report, &args.root);
    Ok(())
}

fn cmd_watch(
    store: &Store,
    embedder: &dyn Embedder,
    config: &Config,
    data_dir: &DataDir,
    args: &cli::WatchArgs,
) -> error::Result<()> {
    require_dir(&args.root)?;

    let debounce = args
        .debounce_ms
        .map(std::time::Duration::from_millis)
        .unwrap_or_else(|| config.indexer.debounce());
    let ignored = vec![data_dir.root().canonicalize()?];
    let filter = PathFilter::from_config(&config.indexer)?;
    let watcher = TreeWatcher::start(&args.root, debounce, filter, ignored)?;
    let indexer = Indexer::new(store, embedder, &config.indexer)?;

    watch_and_index(&indexer, &watcher, |report, batch| {
        if args.json {
            match serde_json::to_string(report) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "could not encode report"),
            }
        } else {
            if !batch.is_empty() {
                println!("{} changed paths", batch.len());
            }
            print_report(report, watcher.root());
        }
    })
}

fn cmd_system_facts(
    tree: &KnowledgeTree<'_>,
    args: &cli::SystemFactsArgs,
) -> error::Result<()> {
    let snapshot = SystemSnapshot::capture();
    let summary = if args.dry_run {
        None
    } else {
        Some(record_system_facts(tree, &snapshot)?)
    };

    if args.json {
        return print_json(&snapshot);
    }
    let facts = snapshot.facts();
    for fact in &facts {
        println!("{fact}");
    }
    if let Some(summary) = summary {
        println!(
            "Recorded {} facts in '{SYSTEM_DOMAIN}' ({} items in {} nodes)",
            facts.len(),
            summary.items,
            summary.nodes
        );
    }
    Ok(())
}

fn find_filters(args: &cli::FindArgs) -> FileFilters {
    let now = now_secs();
    FileFilters {
        extensions: args
            .extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect(),
        location: args.under.clone(),
        modified_after: args
            .newer_than_days
            .map(|d| now.saturating_sub(d * SECONDS_PER_DAY)),
        modified_before: args
            .older_than_days
            .map(|d| now.saturating_sub(d * SECONDS_PER_DAY)),
    }
}

fn format_matches(matches: &[FileMatch]) {
    if matches.is_empty() {
        println!("No matching files.");
        return;
    }
    for (i, m) in matches.iter().enumerate() {
        println!("{:>2}. {:.3}  {}", i + 1, m.score, m.file.path);
    }
}

fn cmd_find(router: &FileRouter, args: &cli::FindArgs) -> error::Result<()> {
    let filters = find_filters(args);
    let matches = router.find_with_filters(&args.query, &filters, args.count)?;

    if args.json {
        print_json(&matches)
    } else if args.files {
        for m in &matches {
            println!("{}", m.file.path);
        }
        Ok(())
    } else {
        format_matches(&matches);
        Ok(())
    }
}

fn cmd_read(router: &FileRouter, args: &cli::ReadArgs) -> error::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Config(format!("failed to start tokio runtime: {e}")))?;
    let results = runtime.block_on(router.search_with_content(
        &args.query,
        args.count,
        args.chunks,
    ))?;

    if args.json {
        return print_json(&results);
    }
    format_matches(&results.files);
    if !results.chunks.is_empty() {
        println!();
    }
    for chunk in &results.chunks {
        println!(
            "--- {} #{} ({:.3}) ---",
            chunk.file_path, chunk.chunk_index, chunk.score
        );
        println!("{}", preview(&chunk.text, DEFAULT_PREVIEW_CHARS * 2));
    }
    Ok(())
}

fn cmd_recall(tree: &KnowledgeTree<'_>, args: &cli::RecallArgs) -> error::Result<()> {
    let matches = tree.query(&args.text, &args.domain, args.count)?;
    if args.json {
        return print_json(&matches);
    }
    if matches.is_empty() {
        println!("Nothing known in '{}' about that.", args.domain);
    }
    for m in &matches {
        println!("{:.3}  {}", m.score, m.item.content);
    }
    Ok(())
}

fn cmd_learn(tree: &KnowledgeTree<'_>, args: &cli::LearnArgs) -> error::Result<()> {
    let item = match args.source {
        Some(source) => tree.add_item(
            &args.fact,
            &args.domain,
            source,
            args.source_path.as_deref(),
        )?,
        None => tree.learn(&args.fact, &args.domain)?,
    };
    if args.json {
        return print_json(&item);
    }
    println!(
        "Stored item {} in '{}' (confidence {:.1})",
        item.id, item.domain, item.confidence
    );
    Ok(())
}

fn cmd_rebuild_domain(
    tree: &KnowledgeTree<'_>,
    args: &cli::RebuildDomainArgs,
) -> error::Result<()> {
    let summary = if args.if_needed {
        tree.rebalance(&args.domain)?
    } else {
        Some(tree.rebuild_domain(&args.domain)?)
    };

    match summary {
        Some(summary) if args.json => print_json(&summary)?,
        Some(summary) => println!(
            "Rebuilt '{}': {} items in {} nodes ({} leaves, depth {})",
            summary.domain, summary.items, summary.nodes, summary.leaves, summary.depth
        ),
        None if args.json => println!("null"),
        None => println!("'{}' is balanced; nothing to do.", args.domain),
    }
    Ok(())
}

fn cmd_status(
    store: &Store,
    data_dir: &DataDir,
    model_id: &str,
    json: bool,
) -> error::Result<()> {
    let status = store.status()?;

    if json {
        return print_json(&serde_json::json!({
            "data_dir": data_dir.root(),
            "model": model_id,
            "index": status,
        }));
    }
    println!("Data directory: {}", data_dir.root().display());
    println!("Model: {model_id}");
    println!("Roots: {}", status.roots.len());
    for root in &status.roots {
        println!("  {root}");
    }
    println!("Folders: {}", status.folders);
    println!("Files: {} ({} chunked)", status.files, status.chunked_files);
    println!("Chunks: {}", status.chunks);
    if status.knowledge.is_empty() {
        println!("Knowledge: none");
    } else {
        println!("Knowledge:");
        for (domain, items) in &status.knowledge {
            println!("  {domain}: {items} items");
        }
    }
    Ok(())
}
