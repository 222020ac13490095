//! Bottom-up file and folder indexing.
//!
//! A full pass walks the tree post-order so every folder is persisted after
//! its subfolders, letting the folder's embedding pool over theirs. An
//! incremental pass only stats the tree, diffs it against the store and
//! re-embeds what changed, then recomputes the affected folders and all of
//! their ancestors deepest-first.
//!
//! Every embedded file records a BLAKE3 digest of its bytes. A file whose
//! timestamp moved but whose digest did not only gets its stamps refreshed,
//! and an added file with the same bytes as one removed in the same pass (a
//! move or rename) takes over its signature and content embedding instead of
//! being extracted again.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    time::Instant,
};

use rayon::prelude::*;
use serde::Serialize;

use crate::{
    config::IndexerConfig,
    embedding::{Embedder, embed_in_batches, embedding_space},
    error::Result,
    extract::{content_hash, content_signature, path_text, type_description},
    incremental::{ChangeSet, diff_tree},
    records::{FileEntry, FolderNode, now_secs},
    store::{FILE_INDEX_SPACE, Store},
    vector::mean_pool,
    walker::{PathFilter, ScannedFile, is_within, list_dir, scan_tree},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    Full,
    Incremental,
    /// Nothing on disk changed since the last pass.
    Unchanged,
}

impl std::fmt::Display for IndexMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::Unchanged => "unchanged",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub mode: IndexMode,
    pub folders_indexed: usize,
    pub folders_removed: usize,
    /// Files embedded during this pass.
    pub files_indexed: usize,
    pub files_removed: usize,
    /// Of `files_indexed`, how many got a content embedding.
    pub files_with_content: usize,
    /// Files whose timestamp changed but whose bytes did not; only their
    /// stamps were rewritten.
    pub files_touched: usize,
    pub elapsed_ms: u64,
}

impl IndexReport {
    fn new(mode: IndexMode) -> Self {
        Self {
            mode,
            folders_indexed: 0,
            folders_removed: 0,
            files_indexed: 0,
            files_removed: 0,
            files_with_content: 0,
            files_touched: 0,
            elapsed_ms: 0,
        }
    }
}

pub struct Indexer<'a> {
    store: &'a Store,
    embedder: &'a dyn Embedder,
    config: &'a IndexerConfig,
    filter: PathFilter,
}

impl<'a> Indexer<'a> {
    pub fn new(
        store: &'a Store,
        embedder: &'a dyn Embedder,
        config: &'a IndexerConfig,
    ) -> Result<Self> {
        Ok(Self {
            store,
            embedder,
            config,
            filter: PathFilter::from_config(config)?,
        })
    }

    /// Bring the index up to date with the tree under `root`.
    ///
    /// Runs a full pass when the store is empty, was built from another root
    /// or was embedded with another model, and an incremental pass otherwise.
    pub fn index_from_root(&self, root: &Path) -> Result<IndexReport> {
        let root = root.canonicalize()?;
        let root_str = root.to_string_lossy();

        let same_root = self
            .store
            .root_folders()?
            .iter()
            .any(|f| f.path == root_str);
        if self.store.folder_count()? == 0 || !same_root {
            return self.full_index(&root);
        }

        let current = embedding_space(self.embedder)?;
        let indexed = self.store.embedding_space(FILE_INDEX_SPACE)?;
        if indexed.as_ref() != Some(&current) {
            tracing::info!(
                indexed = %indexed.map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string()),
                current = %current,
                "embedding model changed, rebuilding index"
            );
            return self.full_index(&root);
        }
        self.incremental_index(&root)
    }

    /// Clear every folder, file and chunk and rebuild from scratch.
    pub fn full_index(&self, root: &Path) -> Result<IndexReport> {
        let started = Instant::now();
        tracing::info!(root = %root.display(), "starting full index");

        self.store.clear_file_index()?;
        self.store
            .set_embedding_space(FILE_INDEX_SPACE, &embedding_space(self.embedder)?)?;
        let mut report = IndexReport::new(IndexMode::Full);
        self.index_folder(root, root, 0, &mut report)?;

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            folders = report.folders_indexed,
            files = report.files_indexed,
            with_content = report.files_with_content,
            elapsed_ms = report.elapsed_ms,
            "full index complete"
        );
        Ok(report)
    }

    /// Index `dir` after all of its subfolders; returns the persisted folder,
    /// or `None` when an unreadable subdirectory was skipped.
    fn index_folder(
        &self,
        root: &Path,
        dir: &Path,
        depth: u32,
        report: &mut IndexReport,
    ) -> Result<Option<FolderNode>> {
        let listing = match list_dir(dir, &self.filter) {
            Ok(listing) => listing,
            Err(e) if dir != root => {
                tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable directory");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut children = Vec::with_capacity(listing.dirs.len());
        for sub in &listing.dirs {
            if let Some(child) = self.index_folder(root, sub, depth + 1, report)? {
                children.push(child);
            }
        }

        let mut files = self.embed_files(root, &listing.files, &KnownContent::new())?;
        let mut folder = FolderNode {
            path: dir.to_string_lossy().into_owned(),
            name: folder_name(dir),
            depth,
            ..Default::default()
        };
        aggregate(&mut folder, &files, &children);
        self.store.put_folder(&mut folder)?;

        for file in &mut files {
            file.folder_id = folder.id;
        }
        self.store.put_files(&mut files)?;

        let child_ids: Vec<u64> = children.iter().map(|c| c.id).collect();
        self.store.link_folders(folder.id, &child_ids)?;

        tracing::debug!(folder = %folder.path, files = files.len(), "indexed folder");
        report.folders_indexed += 1;
        report.files_indexed += files.len();
        report.files_with_content += files.iter().filter(|f| f.has_content()).count();
        Ok(Some(folder))
    }

    /// Hash and extract signatures in parallel, then embed paths and
    /// signatures in batches. Files whose digest is in `known` reuse that
    /// entry's signature and content embedding. Returned entries have no
    /// folder assigned yet.
    fn embed_files(
        &self,
        root: &Path,
        scanned: &[ScannedFile],
        known: &KnownContent,
    ) -> Result<Vec<FileEntry>> {
        if scanned.is_empty() {
            return Ok(Vec::new());
        }

        let extracted: Vec<(Option<String>, Option<String>, Option<&FileEntry>)> = scanned
            .par_iter()
            .map(|f| {
                let hash = content_hash(&f.path);
                // The extension decides how content is read.
                let previous = hash
                    .as_ref()
                    .and_then(|h| known.get(h))
                    .filter(|p| Path::new(&p.path).extension() == f.path.extension());
                match previous {
                    Some(previous) => (hash, previous.signature.clone(), Some(previous)),
                    None => {
                        let signature = content_signature(&f.path, self.config.signature_chars);
                        (hash, signature, None)
                    }
                }
            })
            .collect();
        let reused = extracted.iter().filter(|(_, _, r)| r.is_some()).count();
        if reused > 0 {
            tracing::debug!(reused, "reusing content of moved files");
        }

        let path_texts: Vec<String> =
            scanned.iter().map(|f| path_text(root, &f.path)).collect();
        let name_vectors = embed_in_batches(
            self.embedder,
            &path_texts,
            self.config.embed_batch_size,
        )?;

        let signature_texts: Vec<String> = extracted
            .iter()
            .filter(|(_, _, previous)| previous.is_none())
            .filter_map(|(_, signature, _)| signature.clone())
            .collect();
        let mut content_vectors = embed_in_batches(
            self.embedder,
            &signature_texts,
            self.config.embed_batch_size,
        )?
        .into_iter();

        let mut entries = Vec::with_capacity(scanned.len());
        for ((file, (hash, signature, previous)), name_embedding) in
            scanned.iter().zip(extracted).zip(name_vectors)
        {
            let content_embedding = match (previous, &signature) {
                (Some(previous), _) => previous.content_embedding.clone(),
                (None, Some(_)) => content_vectors.next(),
                (None, None) => None,
            };
            entries.push(FileEntry {
                path: file.path.to_string_lossy().into_owned(),
                name: file
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                extension: file
                    .path
                    .extension()
                    .map(|e| e.to_string_lossy().to_lowercase())
                    .unwrap_or_default(),
                signature,
                modified: file.mtime,
                size: file.size,
                content_hash: hash,
                name_embedding,
                content_embedding,
                ..Default::default()
            });
        }
        Ok(entries)
    }

    fn incremental_index(&self, root: &Path) -> Result<IndexReport> {
        let started = Instant::now();

        let scan = scan_tree(root, &self.filter)?;
        let rows: HashMap<String, FileEntry> = self
            .store
            .list_files()?
            .into_iter()
            .map(|f| (f.path.clone(), f))
            .collect();
        let stored: HashMap<String, u64> = rows
            .iter()
            .map(|(path, f)| (path.clone(), f.modified))
            .collect();
        let mut changes = diff_tree(&stored, &scan.files);
        changes.ignore_removals_under(&scan.unreadable);
        let touched = take_touched(&mut changes, &rows);
        self.store.update_file_rows(&touched)?;

        let mut folders: HashMap<String, FolderNode> = self
            .store
            .list_folders()?
            .into_iter()
            .map(|f| (f.path.clone(), f))
            .collect();
        let scanned_dirs: HashSet<String> = scan
            .dirs
            .iter()
            .map(|d| d.to_string_lossy().into_owned())
            .collect();
        let mut vanished: Vec<FolderNode> = folders
            .values()
            .filter(|f| {
                !scanned_dirs.contains(&f.path)
                    && !is_within(Path::new(&f.path), &scan.unreadable)
            })
            .cloned()
            .collect();
        vanished.sort_by(|a, b| a.path.cmp(&b.path));
        let new_dirs: Vec<&PathBuf> = scan
            .dirs
            .iter()
            .filter(|d| !folders.contains_key(d.to_string_lossy().as_ref()))
            .collect();

        if changes.is_empty() && vanished.is_empty() && new_dirs.is_empty() {
            tracing::info!(
                root = %root.display(),
                touched = touched.len(),
                "index is up to date"
            );
            let mut report = IndexReport::new(IndexMode::Unchanged);
            report.files_touched = touched.len();
            report.elapsed_ms = started.elapsed().as_millis() as u64;
            return Ok(report);
        }

        if changes.exceeds(stored.len(), self.config.full_reindex_ratio) {
            tracing::info!(
                changes = changes.len(),
                stored = stored.len(),
                "too many changes, falling back to full index"
            );
            return self.full_index(root);
        }

        tracing::info!(
            added = changes.added.len(),
            updated = changes.updated.len(),
            removed = changes.removed.len(),
            new_dirs = new_dirs.len(),
            vanished_dirs = vanished.len(),
            "starting incremental index"
        );
        let mut report = IndexReport::new(IndexMode::Incremental);
        report.files_touched = touched.len();
        let mut affected: HashSet<u64> = HashSet::new();

        // Load what moved files could take over before their rows go.
        let known = if changes.added.is_empty() {
            KnownContent::new()
        } else {
            let mut removed: Vec<FileEntry> = changes
                .removed
                .iter()
                .filter_map(|path| rows.get(path))
                .filter(|f| f.content_hash.is_some())
                .cloned()
                .collect();
            self.store.load_file_vectors(&mut removed)?;
            removed
                .into_iter()
                .filter_map(|f| Some((f.content_hash.clone()?, f)))
                .collect()
        };

        // Drop removed and updated files, chunks included.
        let stale_paths: HashSet<&str> = changes
            .removed
            .iter()
            .map(String::as_str)
            .chain(changes.updated.iter().filter_map(|f| f.path.to_str()))
            .collect();
        let stale_ids: Vec<u64> = rows
            .values()
            .filter(|f| stale_paths.contains(f.path.as_str()))
            .map(|f| f.id)
            .collect();
        for file in self.store.delete_files(&stale_ids)? {
            affected.insert(file.folder_id);
        }
        report.files_removed = changes.removed.len();

        // Remove subtrees whose directories disappeared.
        for folder in &vanished {
            report.folders_removed += self.store.delete_folder_subtree(folder.id)?;
            if let Some(parent_id) = folder.parent_id {
                affected.insert(parent_id);
            }
            folders.remove(&folder.path);
        }

        // Create folder rows for new directories; sorted order puts parents
        // before their children.
        for dir in new_dirs {
            let Some(parent) = dir
                .parent()
                .and_then(|p| folders.get(p.to_string_lossy().as_ref()))
            else {
                continue;
            };
            let mut folder = FolderNode {
                path: dir.to_string_lossy().into_owned(),
                name: folder_name(dir),
                parent_id: Some(parent.id),
                depth: parent.depth + 1,
                indexed_at: now_secs(),
                ..Default::default()
            };
            self.store.put_folder(&mut folder)?;
            affected.insert(folder.id);
            report.folders_indexed += 1;
            folders.insert(folder.path.clone(), folder);
        }

        // Embed added and updated files, grouped by folder.
        let mut by_folder: BTreeMap<u64, Vec<ScannedFile>> = BTreeMap::new();
        for file in changes.added.iter().chain(&changes.updated) {
            let Some(folder) = file
                .path
                .parent()
                .and_then(|p| folders.get(p.to_string_lossy().as_ref()))
            else {
                continue;
            };
            by_folder.entry(folder.id).or_default().push(file.clone());
        }
        for (folder_id, scanned) in by_folder {
            let mut files = self.embed_files(root, &scanned, &known)?;
            for file in &mut files {
                file.folder_id = folder_id;
            }
            self.store.put_files(&mut files)?;
            affected.insert(folder_id);
            report.files_indexed += files.len();
            report.files_with_content +=
                files.iter().filter(|f| f.has_content()).count();
        }

        let recomputed = self.recompute_folders(affected)?;
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            files = report.files_indexed,
            removed = report.files_removed,
            touched = report.files_touched,
            folders_recomputed = recomputed,
            elapsed_ms = report.elapsed_ms,
            "incremental index complete"
        );
        Ok(report)
    }

    /// Recompute the aggregate of every folder in `ids` and of all their
    /// ancestors, deepest first. Returns how many folders were rewritten.
    fn recompute_folders(&self, ids: HashSet<u64>) -> Result<usize> {
        let mut pending: HashMap<u64, FolderNode> = HashMap::new();
        for id in ids {
            let mut next = Some(id);
            while let Some(id) = next {
                if pending.contains_key(&id) {
                    break;
                }
                let Some(folder) = self.store.get_folder(id)? else {
                    break;
                };
                next = folder.parent_id;
                pending.insert(id, folder);
            }
        }

        let mut ordered: Vec<FolderNode> = pending.into_values().collect();
        ordered.sort_by(|a, b| b.depth.cmp(&a.depth).then_with(|| a.path.cmp(&b.path)));

        let count = ordered.len();
        for mut folder in ordered {
            let files = self.store.files_in_folder(folder.id)?;
            let children = self.store.child_folders(folder.id)?;
            aggregate(&mut folder, &files, &children);
            self.store.put_folder(&mut folder)?;
        }
        Ok(count)
    }
}

/// Stored files keyed by content digest.
type KnownContent = HashMap<String, FileEntry>;

/// Move updated files whose bytes still hash to the stored digest out of
/// `changes`, returning their rows with refreshed stamps.
fn take_touched(changes: &mut ChangeSet, rows: &HashMap<String, FileEntry>) -> Vec<FileEntry> {
    if changes.updated.is_empty() {
        return Vec::new();
    }
    let hashes: Vec<Option<String>> = changes
        .updated
        .par_iter()
        .map(|f| content_hash(&f.path))
        .collect();

    let mut touched = Vec::new();
    let mut updated = Vec::with_capacity(changes.updated.len());
    for (file, hash) in std::mem::take(&mut changes.updated).into_iter().zip(hashes) {
        let row = rows.get(file.path.to_string_lossy().as_ref());
        match row {
            Some(row) if hash.is_some() && row.content_hash == hash => {
                let mut row = row.clone();
                // Chunks cut from these same bytes stay valid.
                if row.chunk_count > 0 && row.chunked_mtime == row.modified {
                    row.chunked_mtime = file.mtime;
                }
                row.modified = file.mtime;
                row.size = file.size;
                touched.push(row);
            }
            _ => updated.push(file),
        }
    }
    changes.updated = updated;
    touched
}

fn folder_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.to_string_lossy().into_owned())
}

/// Fill a folder's embedding, summary and counters from its direct files
/// and subfolders.
fn aggregate(folder: &mut FolderNode, files: &[FileEntry], children: &[FolderNode]) {
    folder.embedding = mean_pool(
        files
            .iter()
            .map(|f| f.representative_embedding())
            .chain(children.iter().map(|c| c.embedding.as_slice())),
    )
    .unwrap_or_default();
    folder.summary = folder_summary(files, children);
    folder.file_count = files.len() as u32;
    folder.indexed_at = now_secs();
}

/// Names listed in a folder summary before the rest are only counted.
const SUMMARY_NAMES: usize = 5;

/// One-line description such as `3 files (2 PDF document, 1 text document):
/// budget.pdf, lease.pdf, notes.txt; 1 subfolder: Drafts`.
pub fn folder_summary(files: &[FileEntry], subfolders: &[FolderNode]) -> String {
    let mut kinds: HashMap<String, usize> = HashMap::new();
    for file in files {
        *kinds.entry(type_description(&file.extension)).or_default() += 1;
    }
    let mut kinds: Vec<(String, usize)> = kinds.into_iter().collect();
    kinds.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut summary = plural(files.len(), "file");
    if !kinds.is_empty() {
        let top: Vec<String> = kinds
            .iter()
            .take(3)
            .map(|(kind, n)| format!("{n} {kind}"))
            .collect();
        summary.push_str(&format!(" ({})", top.join(", ")));
        summary.push_str(": ");
        summary.push_str(&leading_names(files.iter().map(|f| f.name.as_str())));
    }
    if !subfolders.is_empty() {
        summary.push_str(&format!(
            "; {}: {}",
            plural(subfolders.len(), "subfolder"),
            leading_names(subfolders.iter().map(|f| f.name.as_str()))
        ));
    }
    summary
}

fn plural(n: usize, noun: &str) -> String {
    format!("{n} {noun}{}", if n == 1 { "" } else { "s" })
}

/// The first few names in sorted order, then a count of the rest.
fn leading_names<'n>(names: impl Iterator<Item = &'n str>) -> String {
    let mut names: Vec<&str> = names.collect();
    names.sort_unstable();
    let rest = names.len().saturating_sub(SUMMARY_NAMES);
    let mut listed = names[..names.len().min(SUMMARY_NAMES)].join(", ");
    if rest > 0 {
        listed.push_str(&format!(" and {rest} more"));
    }
    listed
}
