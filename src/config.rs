//! Tunables for indexing, routing, chunking and the knowledge tree.
//!
//! Every field has a default; `<data dir>/config.json` may override any
//! subset of them:
//!
//! ```json
//! { "router": { "beam_width": 4 }, "chunking": { "chunk_size": 768 } }
//! ```

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Embedding model id; `hash` selects the built-in hashing embedder.
    pub model: Option<String>,
    pub indexer: IndexerConfig,
    pub router: RouterConfig,
    pub chunking: ChunkingConfig,
    pub knowledge: KnowledgeConfig,
}

impl Config {
    /// Load `path` if it exists, otherwise return the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&contents).map_err(|e| {
            Error::Config(format!("invalid {}: {e}", path.display()))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Glob patterns matched against directory names; matches are not walked.
    pub skip_dirs: Vec<String>,
    /// Lowercase extensions (without the dot) that are never indexed.
    pub skip_extensions: Vec<String>,
    /// Walk dotfiles and dot-directories too.
    pub include_hidden: bool,
    /// Maximum length of a content signature, in characters.
    pub signature_chars: usize,
    /// Number of texts per embedding call.
    pub embed_batch_size: usize,
    /// An incremental pass touching more than this fraction of the stored
    /// files falls back to a full reindex.
    pub full_reindex_ratio: f32,
    /// Quiet period, in milliseconds, that watch mode waits for after the
    /// last file system event before re-indexing.
    pub debounce_ms: u64,
}

impl IndexerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        let skip_dirs = [
            ".git",
            ".svn",
            ".hg",
            "node_modules",
            "__pycache__",
            ".venv",
            "venv",
            "env",
            "build",
            "dist",
            "target",
            "out",
            ".next",
            ".idea",
            ".vscode",
            "Pods",
            "DerivedData",
            ".Trash",
            ".cache",
            ".npm",
            ".yarn",
            "*.app",
        ];
        let skip_extensions = [
            "zip", "tar", "gz", "rar", "7z", "dmg", "iso", "pkg", "exe", "dll",
            "so", "dylib", "mp4", "mov", "avi", "mkv", "mp3", "wav", "flac",
            "lock", "lockb",
        ];
        Self {
            skip_dirs: skip_dirs.iter().map(|s| s.to_string()).collect(),
            skip_extensions: skip_extensions
                .iter()
                .map(|s| s.to_string())
                .collect(),
            include_hidden: false,
            signature_chars: 500,
            embed_batch_size: 64,
            full_reindex_ratio: 0.5,
            debounce_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Number of top-ranked child folders kept per expansion.
    pub beam_width: usize,
    /// Children within this distance of the best child also survive.
    pub tolerance: f32,
    /// Minimum folder score for a child to be considered activated.
    pub folder_activation: f32,
    /// Files scoring below this are dropped from results.
    pub min_result_score: f32,
    /// Best-scoring files kept from each expanded folder.
    pub files_per_folder: usize,
    /// Runaway guard for the folder descent.
    pub max_depth: usize,
    /// Size of the file shortlist used for chunk-level search.
    pub chunk_candidates: usize,
    pub min_chunk_score: f32,
    /// Files chunked concurrently during lazy materialisation.
    pub chunk_concurrency: usize,
    pub chunk_timeout_ms: u64,
    /// Budget for the whole chunk phase of a content search.
    pub content_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            beam_width: 3,
            tolerance: 0.15,
            folder_activation: 0.2,
            min_result_score: 0.2,
            files_per_folder: 3,
            max_depth: 20,
            chunk_candidates: 25,
            min_chunk_score: 0.25,
            chunk_concurrency: 3,
            chunk_timeout_ms: 15_000,
            content_timeout_ms: 30_000,
        }
    }
}

impl RouterConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn content_timeout(&self) -> Duration {
        Duration::from_millis(self.content_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Target chunk size in characters.
    pub chunk_size: usize,
    /// Characters shared between neighbouring chunks.
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::chunking::DEFAULT_CHUNK_SIZE,
            overlap: crate::chunking::DEFAULT_CHUNK_OVERLAP,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// Cluster count at the root; deeper levels use proportionally fewer.
    pub root_branching: usize,
    pub min_leaf_size: usize,
    /// Leaves above this size are flagged for the next rebalance.
    pub max_leaf_size: usize,
    pub max_depth: usize,
    pub max_iterations: usize,
    pub seed: u64,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            root_branching: 8,
            min_leaf_size: 10,
            max_leaf_size: 25,
            max_depth: 4,
            max_iterations: 20,
            seed: 42,
        }
    }
}

impl KnowledgeConfig {
    /// Target cluster count at `depth`: wide near the root, never below 2.
    ///
    /// # Examples
    ///
    /// ```
    /// use deskindex::config::KnowledgeConfig;
    ///
    /// let config = KnowledgeConfig::default();
    /// assert_eq!(config.branching_at(0), 8);
    /// assert_eq!(config.branching_at(1), 4);
    /// assert_eq!(config.branching_at(10), 2);
    /// ```
    pub fn branching_at(&self, depth: usize) -> usize {
        self.root_branching.div_ceil(depth + 1).max(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load(&tmp.path().join("config.json")).unwrap();
        assert_eq!(config.router.beam_width, 3);
        assert_eq!(config.chunking.chunk_size, 512);
        assert_eq!(config.indexer.debounce(), Duration::from_secs(2));
        assert!(config.model.is_none());
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"model":"hash","router":{"beam_width":5},"knowledge":{"min_leaf_size":4}}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.model.as_deref(), Some("hash"));
        assert_eq!(config.router.beam_width, 5);
        assert!((config.router.tolerance - 0.15).abs() < 1e-6);
        assert_eq!(config.knowledge.min_leaf_size, 4);
        assert_eq!(config.knowledge.max_leaf_size, 25);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn branching_shrinks_with_depth() {
        let config = KnowledgeConfig::default();
        let widths: Vec<_> = (0..5).map(|d| config.branching_at(d)).collect();
        assert_eq!(widths, vec![8, 4, 3, 2, 2]);
    }
}
