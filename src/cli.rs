use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use deskindex::records::SourceKind;

#[derive(Debug, Parser)]
#[command(
    name = "deskindex",
    about = "Semantic file routing, lazy content search and a knowledge tree for your desktop"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Embedding model ID, local model path, or `hash` for the offline embedder
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Index a directory tree (incremental after the first run)
    Index(IndexArgs),
    /// Index a directory tree, then keep re-indexing it as files change
    Watch(WatchArgs),
    /// Find files by name, type and content signature
    Find(FindArgs),
    /// Find files and the passages inside them that answer a query
    Read(ReadArgs),
    /// Query a knowledge domain
    Recall(RecallArgs),
    /// Add a fact to a knowledge domain
    Learn(LearnArgs),
    /// Re-cluster a knowledge domain from its stored items
    RebuildDomain(RebuildDomainArgs),
    /// Record hardware and load readings into the `system` knowledge domain
    SystemFacts(SystemFactsArgs),
    /// Show index statistics
    Status(StatusArgs),
    /// Start MCP server for AI agent integration
    Mcp,
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Index --

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// Root directory to index
    pub root: PathBuf,

    /// Discard the existing index and rebuild it from scratch
    #[arg(long)]
    pub full: bool,

    /// Output the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct WatchArgs {
    /// Root directory to watch
    pub root: PathBuf,

    /// Milliseconds without file events before re-indexing
    /// [default: indexer.debounce_ms from config.json]
    #[arg(long)]
    pub debounce_ms: Option<u64>,

    /// Print one JSON report per pass
    #[arg(long)]
    pub json: bool,
}

// -- Find --

#[derive(Debug, Parser)]
pub struct FindArgs {
    /// The search query
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// Only files with these extensions (repeatable or comma-separated)
    #[arg(long = "ext", value_delimiter = ',')]
    pub extensions: Vec<String>,

    /// Only files whose path contains this text
    #[arg(long)]
    pub under: Option<String>,

    /// Only files modified within the last N days
    #[arg(long)]
    pub newer_than_days: Option<u64>,

    /// Only files last modified more than N days ago
    #[arg(long)]
    pub older_than_days: Option<u64>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,

    /// Output only file paths (one per line)
    #[arg(long)]
    pub files: bool,
}

// -- Read --

#[derive(Debug, Parser)]
pub struct ReadArgs {
    /// The search query
    pub query: String,

    /// Number of files to return
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// Number of passages to return
    #[arg(short = 'k', long, default_value = "5")]
    pub chunks: usize,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Knowledge --

#[derive(Debug, Parser)]
pub struct RecallArgs {
    /// What to look up
    pub text: String,

    /// Knowledge domain to search
    #[arg(short, long)]
    pub domain: String,

    /// Number of items to return
    #[arg(short = 'n', long, default_value = "5")]
    pub count: usize,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct LearnArgs {
    /// The fact to store
    pub fact: String,

    /// Knowledge domain to store it in
    #[arg(short, long)]
    pub domain: String,

    /// Record the fact as coming from this source instead of inferring it
    /// (file, system, inferred, user)
    #[arg(long)]
    pub source: Option<SourceKind>,

    /// File the fact was taken from
    #[arg(long, requires = "source")]
    pub source_path: Option<String>,

    /// Output the stored item as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct RebuildDomainArgs {
    /// Knowledge domain to re-cluster
    pub domain: String,

    /// Only rebuild if some leaf has grown past the maximum leaf size
    #[arg(long)]
    pub if_needed: bool,

    /// Output the new tree shape as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct SystemFactsArgs {
    /// Print the readings without recording them
    #[arg(long)]
    pub dry_run: bool,

    /// Output the snapshot as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "deskindex",
            &mut std::io::stdout(),
        );
    }
}
