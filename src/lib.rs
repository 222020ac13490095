//! deskindex - local, incremental semantic indexing and retrieval.
//!
//! deskindex keeps a semantic index of a directory tree and answers three
//! kinds of questions about it:
//!
//! - **Which files?** The [`Indexer`] embeds every file's path and a short
//!   content signature, and gives every folder the mean of its children's
//!   embeddings. The [`FileRouter`] beam-searches that folder tree with a
//!   hybrid of embedding similarity and keyword overlap.
//! - **What do they say?** Content search chunks and embeds the shortlisted
//!   files the first time a query needs their text, then reuses the chunks
//!   until the file changes.
//! - **What do we know?** A [`KnowledgeTree`] clusters free-standing facts per
//!   domain so a query only walks one root-to-leaf path.
//!
//! Everything lives in a single [redb](https://github.com/cberner/redb) file.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use deskindex::{Config, DataDir, Embedder, FileRouter, HashEmbedder, Indexer, Store};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let config = Config::load(&data_dir.config_file()).unwrap();
//! let store = Arc::new(Store::open(&data_dir.index_db()).unwrap());
//! let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());
//!
//! Indexer::new(&store, embedder.as_ref(), &config.indexer)
//!     .unwrap()
//!     .index_from_root(std::path::Path::new("/home/me/Documents"))
//!     .unwrap();
//!
//! let router = FileRouter::new(store, embedder, config.router, config.chunking);
//! for m in router.find_relevant_files("budget spreadsheet", 5).unwrap() {
//!     println!("{:.3} {}", m.score, m.file.path);
//! }
//! ```

pub mod chunking;
pub mod clustering;
pub mod config;
pub mod content_search;
pub mod data_dir;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod incremental;
pub mod indexer;
pub mod knowledge;
pub mod mcp;
pub mod model_manager;
pub mod records;
pub mod router;
pub mod store;
pub mod system_facts;
pub mod text_util;
pub mod vector;
pub mod walker;
pub mod watcher;

pub use config::Config;
pub use data_dir::DataDir;
pub use embedding::{Embedder, HashEmbedder};
pub use error::{Error, Result};
pub use indexer::Indexer;
pub use knowledge::KnowledgeTree;
pub use router::FileRouter;
pub use store::Store;
