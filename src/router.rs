//! Query-time file routing.
//!
//! Folders are searched with a beam: every expanded folder scores its
//! subfolders and keeps the top [`RouterConfig::beam_width`] of them plus any
//! that land within [`RouterConfig::tolerance`] of the best one, so
//! near-ties are explored side by side. Each expanded folder contributes its
//! best few files to one global candidate list.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use serde::Serialize;

use crate::{
    config::RouterConfig,
    embedding::Embedder,
    error::{Error, Result},
    records::{EmbeddingSpace, FileEntry, FolderNode},
    store::{FILE_INDEX_SPACE, Store},
    text_util::{extract_keywords, keyword_score},
    vector::cosine,
};

/// A query embedded once and reused for every comparison.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub text: String,
    pub embedding: Vec<f32>,
    pub keywords: Vec<String>,
}

/// A ranked file.
#[derive(Debug, Clone, Serialize)]
pub struct FileMatch {
    #[serde(flatten)]
    pub file: FileEntry,
    pub score: f32,
}

/// Optional restrictions for [`FileRouter::find_with_filters`].
#[derive(Debug, Clone, Default)]
pub struct FileFilters {
    /// Lowercase extensions without the dot; empty means any.
    pub extensions: Vec<String>,
    /// Case-insensitive substring the file's path must contain.
    pub location: Option<String>,
    /// Inclusive bounds on the modification time, in Unix seconds.
    pub modified_after: Option<u64>,
    pub modified_before: Option<u64>,
}

impl FileFilters {
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
            && self.location.is_none()
            && !self.has_dates()
    }

    fn has_dates(&self) -> bool {
        self.modified_after.is_some() || self.modified_before.is_some()
    }

    fn matches(&self, file: &FileEntry, check_dates: bool) -> bool {
        if !self.extensions.is_empty()
            && !self
                .extensions
                .iter()
                .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&file.extension))
        {
            return false;
        }
        if let Some(location) = &self.location
            && !file.path.to_lowercase().contains(&location.to_lowercase())
        {
            return false;
        }
        if check_dates {
            if self.modified_after.is_some_and(|t| file.modified < t) {
                return false;
            }
            if self.modified_before.is_some_and(|t| file.modified > t) {
                return false;
            }
        }
        true
    }
}

/// Hybrid file score.
///
/// With a content embedding: `0.35·filename + 0.35·content + 0.30·keyword`.
/// Without one: `0.60·filename + 0.40·keyword`. The keyword part is matched
/// against the file's full path.
pub fn score_file(query: &PreparedQuery, file: &FileEntry) -> f32 {
    let filename = cosine(&query.embedding, &file.name_embedding);
    let keyword = keyword_score(&query.keywords, &file.path);
    match &file.content_embedding {
        Some(content) if !content.is_empty() => {
            0.35 * filename + 0.35 * cosine(&query.embedding, content) + 0.30 * keyword
        }
        _ => 0.60 * filename + 0.40 * keyword,
    }
}

/// Folder score: `(0.35 + 0.35)·cosine + 0.30·keyword(path)`.
pub fn score_folder(query: &PreparedQuery, folder: &FolderNode) -> f32 {
    (0.35 + 0.35) * cosine(&query.embedding, &folder.embedding)
        + 0.30 * keyword_score(&query.keywords, &folder.path)
}

/// Choose which scored children to expand next.
///
/// Keeps the top `width` children and every child within `tolerance` of the
/// best, among those scoring at least `activation`. When none clears
/// `activation`, the single best child is kept anyway. Ties keep input order.
///
/// # Examples
///
/// ```
/// use deskindex::router::select_beam;
///
/// // 0.72 is fourth by rank but within 0.15 of the best.
/// let scores = [0.8, 0.79, 0.78, 0.72, 0.3];
/// assert_eq!(select_beam(&scores, 3, 0.15, 0.2), vec![0, 1, 2, 3]);
///
/// // Nothing is activated: the best child still survives.
/// assert_eq!(select_beam(&[0.05, 0.1], 3, 0.15, 0.2), vec![1]);
/// ```
pub fn select_beam(
    scores: &[f32],
    width: usize,
    tolerance: f32,
    activation: f32,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let Some(&best) = order.first() else {
        return Vec::new();
    };
    let best_score = scores[best];
    if best_score < activation {
        return vec![best];
    }

    order
        .iter()
        .enumerate()
        .filter(|&(rank, &i)| {
            scores[i] >= activation
                && (rank < width || scores[i] >= best_score - tolerance)
        })
        .map(|(_, &i)| i)
        .collect()
}

fn rank(matches: &mut [FileMatch]) {
    matches.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.file.path.cmp(&b.file.path))
    });
}

#[derive(Clone)]
pub struct FileRouter {
    pub(crate) store: Arc<Store>,
    pub(crate) embedder: Arc<dyn Embedder>,
    pub(crate) config: RouterConfig,
    pub(crate) chunking: crate::config::ChunkingConfig,
}

impl FileRouter {
    pub fn new(
        store: Arc<Store>,
        embedder: Arc<dyn Embedder>,
        config: RouterConfig,
        chunking: crate::config::ChunkingConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
            chunking,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Embed `query` and extract its keywords.
    ///
    /// Fails with [`Error::ModelMismatch`] when the index was built with a
    /// different embedder, since its vectors would all score 0.
    pub fn prepare(&self, query: &str) -> Result<PreparedQuery> {
        let embedding = self.embedder.embed(query)?;
        if let Some(indexed) = self.store.embedding_space(FILE_INDEX_SPACE)?
            && !indexed.matches(self.embedder.model_id(), embedding.len())
        {
            return Err(Error::ModelMismatch {
                indexed: indexed.to_string(),
                current: EmbeddingSpace {
                    model: self.embedder.model_id().to_string(),
                    dimension: embedding.len(),
                }
                .to_string(),
                remedy: "re-run `deskindex index` to rebuild the index",
            });
        }
        Ok(PreparedQuery {
            text: query.to_string(),
            embedding,
            keywords: extract_keywords(query),
        })
    }

    /// Ranked files scoring at least the minimum result score.
    pub fn find_relevant_files(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<FileMatch>> {
        let prepared = self.prepare(query)?;
        let mut matches = self.beam_search(&prepared, self.config.min_result_score)?;
        matches.truncate(limit);
        Ok(matches)
    }

    /// Like [`find_relevant_files`](Self::find_relevant_files), restricted by
    /// `filters`.
    ///
    /// Files are pre-filtered in the store and scored in one pass. When the
    /// filters leave nothing, the date bounds are dropped first; if that still
    /// leaves nothing, the unfiltered beam search answers instead.
    pub fn find_with_filters(
        &self,
        query: &str,
        filters: &FileFilters,
        limit: usize,
    ) -> Result<Vec<FileMatch>> {
        if filters.is_empty() {
            return self.find_relevant_files(query, limit);
        }

        let all = self.store.list_files()?;
        let mut candidates: Vec<FileEntry> =
            all.iter().filter(|f| filters.matches(f, true)).cloned().collect();
        if candidates.is_empty() && filters.has_dates() {
            tracing::debug!("no files in date range, relaxing date filter");
            candidates =
                all.iter().filter(|f| filters.matches(f, false)).cloned().collect();
        }
        if candidates.is_empty() {
            tracing::debug!("filters matched nothing, using unfiltered search");
            return self.find_relevant_files(query, limit);
        }

        let prepared = self.prepare(query)?;
        self.store.load_file_vectors(&mut candidates)?;
        let mut matches: Vec<FileMatch> = candidates
            .into_iter()
            .map(|file| FileMatch {
                score: score_file(&prepared, &file),
                file,
            })
            .filter(|m| m.score >= self.config.min_result_score)
            .collect();
        rank(&mut matches);
        matches.truncate(limit);
        Ok(matches)
    }

    /// Every candidate the beam reaches with a score of at least `min_score`,
    /// best first.
    pub fn beam_search(
        &self,
        query: &PreparedQuery,
        min_score: f32,
    ) -> Result<Vec<FileMatch>> {
        let mut frontier = self.store.root_folders()?;
        let mut visited: HashSet<u64> = HashSet::new();
        let mut candidates: HashMap<String, FileMatch> = HashMap::new();
        let mut depth = 0;

        while !frontier.is_empty() && depth <= self.config.max_depth {
            let mut next = Vec::new();

            for folder in frontier {
                if !visited.insert(folder.id) {
                    continue;
                }

                let mut files: Vec<FileMatch> = self
                    .store
                    .files_in_folder(folder.id)?
                    .into_iter()
                    .map(|file| FileMatch {
                        score: score_file(query, &file),
                        file,
                    })
                    .collect();
                rank(&mut files);
                for m in files.into_iter().take(self.config.files_per_folder) {
                    match candidates.get(&m.file.path) {
                        Some(existing) if existing.score >= m.score => {}
                        _ => {
                            candidates.insert(m.file.path.clone(), m);
                        }
                    }
                }

                let children = self.store.child_folders(folder.id)?;
                let scores: Vec<f32> =
                    children.iter().map(|c| score_folder(query, c)).collect();
                let selected = select_beam(
                    &scores,
                    self.config.beam_width,
                    self.config.tolerance,
                    self.config.folder_activation,
                );
                tracing::trace!(
                    folder = %folder.path,
                    children = children.len(),
                    selected = selected.len(),
                    "expanded folder"
                );
                let mut children: Vec<Option<FolderNode>> =
                    children.into_iter().map(Some).collect();
                next.extend(selected.into_iter().filter_map(|i| children[i].take()));
            }

            frontier = next;
            depth += 1;
        }

        let mut matches: Vec<FileMatch> = candidates
            .into_values()
            .filter(|m| m.score >= min_score)
            .collect();
        rank(&mut matches);
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ChunkingConfig, IndexerConfig},
        embedding::HashEmbedder,
        indexer::Indexer,
    };

    fn query(embedding: Vec<f32>, keywords: &[&str]) -> PreparedQuery {
        PreparedQuery {
            text: String::new(),
            embedding,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn file_score_uses_content_weights_when_available() {
        let q = query(vec![1.0, 0.0], &["tax"]);
        let mut file = FileEntry {
            path: "/docs/tax.pdf".to_string(),
            name_embedding: vec![1.0, 0.0],
            content_embedding: Some(vec![0.0, 1.0]),
            ..Default::default()
        };
        assert!((score_file(&q, &file) - (0.35 + 0.30)).abs() < 1e-6);

        file.content_embedding = None;
        assert!((score_file(&q, &file) - (0.60 + 0.40)).abs() < 1e-6);
    }

    #[test]
    fn folder_score_double_weights_similarity() {
        let q = query(vec![0.0, 1.0], &["finance", "budget"]);
        let folder = FolderNode {
            path: "/home/Finance".to_string(),
            embedding: vec![0.0, 1.0],
            ..Default::default()
        };
        assert!((score_folder(&q, &folder) - (0.70 + 0.15)).abs() < 1e-6);
    }

    #[test]
    fn tolerance_keeps_near_ties_beyond_width() {
        let selected = select_beam(&[0.50, 0.40, 0.90, 0.80], 1, 0.15, 0.2);
        assert_eq!(selected, vec![2, 3]);
    }

    #[test]
    fn activation_drops_weak_children_but_never_all() {
        assert_eq!(select_beam(&[0.9, 0.1, 0.15], 3, 0.15, 0.2), vec![0]);
        assert_eq!(select_beam(&[0.1, 0.15], 3, 0.15, 0.2), vec![1]);
        assert!(select_beam(&[], 3, 0.15, 0.2).is_empty());
    }

    #[test]
    fn filters_match_extension_location_and_dates() {
        let file = FileEntry {
            path: "/home/u/Documents/Report.PDF".to_string(),
            extension: "pdf".to_string(),
            modified: 1_000,
            ..Default::default()
        };
        let filters = FileFilters {
            extensions: vec![".PDF".to_string()],
            location: Some("documents".to_string()),
            modified_after: Some(2_000),
            modified_before: None,
        };
        assert!(!filters.matches(&file, true));
        assert!(filters.matches(&file, false));
    }

    fn indexed_router(tree: &std::path::Path) -> (tempfile::TempDir, FileRouter) {
        let db = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&db.path().join("index.redb")).unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());
        let config = IndexerConfig::default();
        Indexer::new(&store, embedder.as_ref(), &config)
            .unwrap()
            .index_from_root(tree)
            .unwrap();
        let router = FileRouter::new(
            store,
            embedder,
            RouterConfig::default(),
            ChunkingConfig::default(),
        );
        (db, router)
    }

    #[test]
    fn beam_search_descends_to_matching_file() {
        let tree = tempfile::tempdir().unwrap();
        let deep = tree.path().join("Work").join("Taxes");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(deep.join("tax-return-2023.txt"), "federal tax return").unwrap();
        let other = tree.path().join("Music");
        std::fs::create_dir_all(&other).unwrap();
        std::fs::write(other.join("playlist.txt"), "songs for running").unwrap();

        let (_db, router) = indexed_router(tree.path());
        let results = router.find_relevant_files("tax return", 5).unwrap();
        assert!(!results.is_empty());
        assert!(results[0].file.path.ends_with("tax-return-2023.txt"));
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn filtered_search_falls_back_when_nothing_matches() {
        let tree = tempfile::tempdir().unwrap();
        std::fs::write(tree.path().join("invoice.txt"), "invoice for march").unwrap();

        let (_db, router) = indexed_router(tree.path());
        let filters = FileFilters {
            extensions: vec!["docx".to_string()],
            ..Default::default()
        };
        let results = router.find_with_filters("invoice", &filters, 5).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].file.path.ends_with("invoice.txt"));
    }

    #[test]
    fn filtered_search_relaxes_dates_first() {
        let tree = tempfile::tempdir().unwrap();
        std::fs::write(tree.path().join("invoice.txt"), "invoice for march").unwrap();
        std::fs::write(tree.path().join("invoice.md"), "invoice notes").unwrap();

        let (_db, router) = indexed_router(tree.path());
        let filters = FileFilters {
            extensions: vec!["md".to_string()],
            modified_after: Some(u64::MAX),
            ..Default::default()
        };
        let results = router.find_with_filters("invoice", &filters, 5).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].file.path.ends_with("invoice.md"));
    }

    #[test]
    fn querying_with_another_model_is_an_error() {
        let tree = tempfile::tempdir().unwrap();
        std::fs::write(tree.path().join("invoice.txt"), "invoice for march").unwrap();

        let (_db, router) = indexed_router(tree.path());
        let narrow = FileRouter::new(
            Arc::clone(&router.store),
            Arc::new(HashEmbedder::new(128)),
            RouterConfig::default(),
            ChunkingConfig::default(),
        );
        let err = narrow.find_relevant_files("invoice", 5).unwrap_err();
        assert!(matches!(err, Error::ModelMismatch { .. }), "{err}");
        assert!(err.to_string().contains("hash (256 dimensions)"));
        assert_eq!(router.find_relevant_files("invoice", 5).unwrap().len(), 1);
    }
}
