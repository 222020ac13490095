//! The relational store behind every component.
//!
//! Rows are JSON-encoded [`records`](crate::records) keyed by a numeric id
//! drawn from a per-kind counter. Vectors live in two binary tables keyed by
//! `(kind, id)`; each value is a flat array of little-endian `f32`s. Lookups
//! by parent/owner go through multimap tables, where key `0` stands for "no
//! parent".

use std::{
    collections::BTreeMap,
    path::Path,
};

use redb::{
    Database,
    MultimapTableDefinition,
    ReadTransaction,
    ReadableDatabase,
    ReadableMultimapTable,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
    WriteTransaction,
};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    error::Result,
    records::{
        ChunkRecord,
        EmbeddingSpace,
        FileEntry,
        FolderNode,
        KnowledgeItem,
        KnowledgeNode,
    },
};

const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

const FOLDERS: TableDefinition<u64, &[u8]> = TableDefinition::new("folders");
const FOLDER_PATHS: TableDefinition<&str, u64> =
    TableDefinition::new("folder_paths");
const FOLDER_CHILDREN: MultimapTableDefinition<u64, u64> =
    MultimapTableDefinition::new("folder_children");
const FILES: TableDefinition<u64, &[u8]> = TableDefinition::new("files");
const FILE_PATHS: TableDefinition<&str, u64> =
    TableDefinition::new("file_paths");
const FOLDER_FILES: MultimapTableDefinition<u64, u64> =
    MultimapTableDefinition::new("folder_files");
const CHUNKS: TableDefinition<u64, &[u8]> = TableDefinition::new("chunks");
const FILE_CHUNKS: MultimapTableDefinition<u64, u64> =
    MultimapTableDefinition::new("file_chunks");
const FILE_VECTORS: TableDefinition<(u8, u64), &[u8]> =
    TableDefinition::new("file_vectors");

const KNOWLEDGE_NODES: TableDefinition<u64, &[u8]> =
    TableDefinition::new("knowledge_nodes");
const NODE_CHILDREN: MultimapTableDefinition<u64, u64> =
    MultimapTableDefinition::new("node_children");
const NODE_ITEMS: MultimapTableDefinition<u64, u64> =
    MultimapTableDefinition::new("node_items");
const KNOWLEDGE_ITEMS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("knowledge_items");
const DOMAIN_ROOTS: TableDefinition<&str, u64> =
    TableDefinition::new("domain_roots");
const DOMAIN_NODES: MultimapTableDefinition<&str, u64> =
    MultimapTableDefinition::new("domain_nodes");
const DOMAIN_ITEMS: MultimapTableDefinition<&str, u64> =
    MultimapTableDefinition::new("domain_items");
const KNOWLEDGE_VECTORS: TableDefinition<(u8, u64), &[u8]> =
    TableDefinition::new("knowledge_vectors");

// Vector kinds within FILE_VECTORS.
const FOLDER_VEC: u8 = 0;
const NAME_VEC: u8 = 1;
const CONTENT_VEC: u8 = 2;
const CHUNK_VEC: u8 = 3;

// Vector kinds within KNOWLEDGE_VECTORS.
const CENTROID_VEC: u8 = 0;
const ITEM_VEC: u8 = 1;
const MEMBER_SUM_VEC: u8 = 2;

/// Parent key used for rows without a parent.
const NO_PARENT: u64 = 0;

/// Setting holding the [`EmbeddingSpace`] of the folder and file vectors.
pub const FILE_INDEX_SPACE: &str = "file_index_embedding";

/// Setting holding the [`EmbeddingSpace`] of a knowledge domain's vectors.
pub fn domain_space_key(domain: &str) -> String {
    format!("domain_embedding:{domain}")
}

/// Row counts across the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStatus {
    /// Paths of the indexed roots.
    pub roots: Vec<String>,
    pub folders: u64,
    pub files: u64,
    /// Files whose chunks have been materialised.
    pub chunked_files: u64,
    pub chunks: u64,
    /// Knowledge item count per domain.
    pub knowledge: BTreeMap<String, usize>,
    /// Embedder the file index was built with.
    pub embedding: Option<EmbeddingSpace>,
}

type Rows = &'static [u8];

pub struct Store {
    db: Database,
}

impl Store {
    /// Open or create the store at the given path.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use deskindex::Store;
    ///
    /// let store = Store::open(&tmp.path().join("index.redb")).unwrap();
    /// assert_eq!(store.folder_count().unwrap(), 0);
    /// ```
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        create_file_tables(&txn)?;
        txn.open_table(COUNTERS)?;
        txn.open_table(SETTINGS)?;
        txn.open_table(KNOWLEDGE_NODES)?;
        txn.open_multimap_table(NODE_CHILDREN)?;
        txn.open_multimap_table(NODE_ITEMS)?;
        txn.open_table(KNOWLEDGE_ITEMS)?;
        txn.open_table(DOMAIN_ROOTS)?;
        txn.open_multimap_table(DOMAIN_NODES)?;
        txn.open_multimap_table(DOMAIN_ITEMS)?;
        txn.open_table(KNOWLEDGE_VECTORS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    fn write<R>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> Result<R>,
    ) -> Result<R> {
        let txn = self.db.begin_write()?;
        let out = f(&txn)?;
        txn.commit()?;
        Ok(out)
    }

    fn read<R>(
        &self,
        f: impl FnOnce(&ReadTransaction) -> Result<R>,
    ) -> Result<R> {
        let txn = self.db.begin_read()?;
        f(&txn)
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.write(|txn| {
            txn.open_table(SETTINGS)?.insert(key, value)?;
            Ok(())
        })
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.read(|txn| {
            let table = txn.open_table(SETTINGS)?;
            Ok(table.get(key)?.map(|v| v.value().to_string()))
        })
    }

    pub fn embedding_space(&self, key: &str) -> Result<Option<EmbeddingSpace>> {
        self.get_setting(key)?
            .map(|json| Ok(serde_json::from_str(&json)?))
            .transpose()
    }

    pub fn set_embedding_space(&self, key: &str, space: &EmbeddingSpace) -> Result<()> {
        self.set_setting(key, &serde_json::to_string(space)?)
    }

    // -- Folders --

    pub fn folder_count(&self) -> Result<u64> {
        self.read(|txn| Ok(txn.open_table(FOLDERS)?.len()?))
    }

    pub fn get_folder(&self, id: u64) -> Result<Option<FolderNode>> {
        self.read(|txn| {
            let rows = txn.open_table(FOLDERS)?;
            let vectors = txn.open_table(FILE_VECTORS)?;
            load_folder(&rows, &vectors, id)
        })
    }

    pub fn folder_by_path(&self, path: &str) -> Result<Option<FolderNode>> {
        self.read(|txn| {
            let Some(id) = txn.open_table(FOLDER_PATHS)?.get(path)?.map(|v| v.value())
            else {
                return Ok(None);
            };
            let rows = txn.open_table(FOLDERS)?;
            let vectors = txn.open_table(FILE_VECTORS)?;
            load_folder(&rows, &vectors, id)
        })
    }

    /// Folders without a parent, i.e. the indexed roots.
    pub fn root_folders(&self) -> Result<Vec<FolderNode>> {
        self.child_folders_of(NO_PARENT)
    }

    pub fn child_folders(&self, parent_id: u64) -> Result<Vec<FolderNode>> {
        self.child_folders_of(parent_id)
    }

    fn child_folders_of(&self, key: u64) -> Result<Vec<FolderNode>> {
        self.read(|txn| {
            let ids = multimap_ids(&txn.open_multimap_table(FOLDER_CHILDREN)?, key)?;
            let rows = txn.open_table(FOLDERS)?;
            let vectors = txn.open_table(FILE_VECTORS)?;
            let mut folders = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(folder) = load_folder(&rows, &vectors, id)? {
                    folders.push(folder);
                }
            }
            Ok(folders)
        })
    }

    pub fn list_folders(&self) -> Result<Vec<FolderNode>> {
        self.read(|txn| {
            let rows = txn.open_table(FOLDERS)?;
            let vectors = txn.open_table(FILE_VECTORS)?;
            let mut folders = Vec::new();
            for entry in rows.iter()? {
                let (_, v) = entry?;
                let mut folder: FolderNode = decode(v.value())?;
                folder.embedding = read_vector(&vectors, FOLDER_VEC, folder.id)?;
                folders.push(folder);
            }
            Ok(folders)
        })
    }

    /// Insert or update a folder. Assigns `folder.id` on first insert.
    pub fn put_folder(&self, folder: &mut FolderNode) -> Result<()> {
        self.write(|txn| put_folder(txn, folder))
    }

    /// Point every child in `child_ids` at `parent_id`.
    pub fn link_folders(&self, parent_id: u64, child_ids: &[u64]) -> Result<()> {
        if child_ids.is_empty() {
            return Ok(());
        }
        self.write(|txn| {
            for &child_id in child_ids {
                let row = {
                    let rows = txn.open_table(FOLDERS)?;
                    let vectors = txn.open_table(FILE_VECTORS)?;
                    load_folder(&rows, &vectors, child_id)?
                };
                if let Some(mut child) = row {
                    child.parent_id = Some(parent_id);
                    put_folder(txn, &mut child)?;
                }
            }
            Ok(())
        })
    }

    /// Remove a folder together with every folder, file and chunk below it.
    /// Returns the number of folders removed.
    pub fn delete_folder_subtree(&self, id: u64) -> Result<usize> {
        self.write(|txn| {
            let mut pending = vec![id];
            let mut removed = 0;
            while let Some(folder_id) = pending.pop() {
                let children = {
                    let mut table = txn.open_multimap_table(FOLDER_CHILDREN)?;
                    let mut ids = Vec::new();
                    for v in table.remove_all(folder_id)? {
                        ids.push(v?.value());
                    }
                    ids
                };
                pending.extend(children);

                let file_ids = {
                    let mut table = txn.open_multimap_table(FOLDER_FILES)?;
                    let mut ids = Vec::new();
                    for v in table.remove_all(folder_id)? {
                        ids.push(v?.value());
                    }
                    ids
                };
                for file_id in file_ids {
                    remove_file(txn, file_id)?;
                }

                let row: Option<FolderNode> = {
                    let mut rows = txn.open_table(FOLDERS)?;
                    let removed_row = rows.remove(folder_id)?;
                    match removed_row {
                        Some(guard) => Some(decode(guard.value())?),
                        None => None,
                    }
                };
                if let Some(folder) = row {
                    txn.open_table(FOLDER_PATHS)?.remove(folder.path.as_str())?;
                    txn.open_multimap_table(FOLDER_CHILDREN)?
                        .remove(folder.parent_id.unwrap_or(NO_PARENT), folder.id)?;
                    txn.open_table(FILE_VECTORS)?.remove((FOLDER_VEC, folder.id))?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    // -- Files --

    pub fn file_count(&self) -> Result<u64> {
        self.read(|txn| Ok(txn.open_table(FILES)?.len()?))
    }

    pub fn get_file(&self, id: u64) -> Result<Option<FileEntry>> {
        self.read(|txn| {
            let rows = txn.open_table(FILES)?;
            let vectors = txn.open_table(FILE_VECTORS)?;
            load_file(&rows, &vectors, id)
        })
    }

    pub fn file_by_path(&self, path: &str) -> Result<Option<FileEntry>> {
        self.read(|txn| {
            let Some(id) = txn.open_table(FILE_PATHS)?.get(path)?.map(|v| v.value())
            else {
                return Ok(None);
            };
            let rows = txn.open_table(FILES)?;
            let vectors = txn.open_table(FILE_VECTORS)?;
            load_file(&rows, &vectors, id)
        })
    }

    pub fn files_in_folder(&self, folder_id: u64) -> Result<Vec<FileEntry>> {
        self.read(|txn| {
            let ids = multimap_ids(&txn.open_multimap_table(FOLDER_FILES)?, folder_id)?;
            let rows = txn.open_table(FILES)?;
            let vectors = txn.open_table(FILE_VECTORS)?;
            let mut files = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(file) = load_file(&rows, &vectors, id)? {
                    files.push(file);
                }
            }
            Ok(files)
        })
    }

    /// Every file row, without vectors. Use [`Store::load_file_vectors`] on
    /// the subset that needs scoring.
    pub fn list_files(&self) -> Result<Vec<FileEntry>> {
        self.read(|txn| {
            let rows = txn.open_table(FILES)?;
            let mut files = Vec::new();
            for entry in rows.iter()? {
                let (_, v) = entry?;
                files.push(decode(v.value())?);
            }
            Ok(files)
        })
    }

    pub fn load_file_vectors(&self, files: &mut [FileEntry]) -> Result<()> {
        self.read(|txn| {
            let vectors = txn.open_table(FILE_VECTORS)?;
            for file in files.iter_mut() {
                fill_file_vectors(&vectors, file)?;
            }
            Ok(())
        })
    }

    /// Insert or replace files in a single transaction. A row already stored
    /// under the same path is removed first, chunks included.
    pub fn put_files(&self, files: &mut [FileEntry]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        self.write(|txn| {
            for file in files.iter_mut() {
                put_file(txn, file)?;
            }
            Ok(())
        })
    }

    /// Remove files and their chunks. Returns the removed rows.
    pub fn delete_files(&self, ids: &[u64]) -> Result<Vec<FileEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.write(|txn| {
            let mut removed = Vec::with_capacity(ids.len());
            for &id in ids {
                if let Some(file) = remove_file(txn, id)? {
                    removed.push(file);
                }
            }
            Ok(removed)
        })
    }

    /// Rewrite the scalar fields of files that are already stored. Vectors,
    /// chunks and folder links stay as they are; unknown ids are skipped.
    pub fn update_file_rows(&self, files: &[FileEntry]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        self.write(|txn| {
            let mut rows = txn.open_table(FILES)?;
            for file in files {
                let exists = rows.get(file.id)?.is_some();
                if exists {
                    rows.insert(file.id, encode(file)?.as_slice())?;
                }
            }
            Ok(())
        })
    }

    // -- Chunks --

    pub fn chunk_count(&self) -> Result<u64> {
        self.read(|txn| Ok(txn.open_table(CHUNKS)?.len()?))
    }

    /// Chunks of a file ordered by index, with embeddings.
    pub fn chunks_for_file(&self, file_id: u64) -> Result<Vec<ChunkRecord>> {
        self.read(|txn| {
            let ids = multimap_ids(&txn.open_multimap_table(FILE_CHUNKS)?, file_id)?;
            let rows = txn.open_table(CHUNKS)?;
            let vectors = txn.open_table(FILE_VECTORS)?;
            let mut chunks = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(guard) = rows.get(id)? {
                    let mut chunk: ChunkRecord = decode(guard.value())?;
                    chunk.embedding = read_vector(&vectors, CHUNK_VEC, id)?;
                    chunks.push(chunk);
                }
            }
            chunks.sort_by_key(|c| c.index);
            Ok(chunks)
        })
    }

    /// Replace a file's chunks and record their count and the source
    /// modification time they were generated from, atomically.
    pub fn replace_chunks(
        &self,
        file_id: u64,
        chunks: &mut [ChunkRecord],
        source_mtime: u64,
    ) -> Result<()> {
        self.write(|txn| {
            remove_chunks(txn, file_id)?;
            for chunk in chunks.iter_mut() {
                chunk.file_id = file_id;
                if chunk.id == 0 {
                    chunk.id = next_id(txn, "chunk")?;
                }
                txn.open_table(CHUNKS)?
                    .insert(chunk.id, encode(chunk)?.as_slice())?;
                txn.open_multimap_table(FILE_CHUNKS)?.insert(file_id, chunk.id)?;
                put_vector(txn, FILE_VECTORS, (CHUNK_VEC, chunk.id), &chunk.embedding)?;
            }
            set_chunk_count(txn, file_id, chunks.len() as u32, source_mtime)
        })
    }

    /// Drop a file's cached chunks so they are regenerated on next request.
    pub fn clear_chunks(&self, file_id: u64) -> Result<()> {
        self.write(|txn| {
            remove_chunks(txn, file_id)?;
            set_chunk_count(txn, file_id, 0, 0)
        })
    }

    /// Drop every folder, file and chunk. Knowledge tables are untouched.
    pub fn clear_file_index(&self) -> Result<()> {
        self.write(|txn| {
            txn.delete_table(FOLDERS)?;
            txn.delete_table(FOLDER_PATHS)?;
            txn.delete_multimap_table(FOLDER_CHILDREN)?;
            txn.delete_table(FILES)?;
            txn.delete_table(FILE_PATHS)?;
            txn.delete_multimap_table(FOLDER_FILES)?;
            txn.delete_table(CHUNKS)?;
            txn.delete_multimap_table(FILE_CHUNKS)?;
            txn.delete_table(FILE_VECTORS)?;
            create_file_tables(txn)
        })
    }

    // -- Knowledge --

    pub fn list_domains(&self) -> Result<Vec<String>> {
        self.read(|txn| {
            let table = txn.open_table(DOMAIN_ROOTS)?;
            let mut domains = Vec::new();
            for entry in table.iter()? {
                let (k, _) = entry?;
                domains.push(k.value().to_string());
            }
            Ok(domains)
        })
    }

    pub fn domain_root(&self, domain: &str) -> Result<Option<KnowledgeNode>> {
        self.read(|txn| {
            let Some(id) = txn.open_table(DOMAIN_ROOTS)?.get(domain)?.map(|v| v.value())
            else {
                return Ok(None);
            };
            let rows = txn.open_table(KNOWLEDGE_NODES)?;
            let vectors = txn.open_table(KNOWLEDGE_VECTORS)?;
            load_node(&rows, &vectors, id)
        })
    }

    pub fn get_node(&self, id: u64) -> Result<Option<KnowledgeNode>> {
        self.read(|txn| {
            let rows = txn.open_table(KNOWLEDGE_NODES)?;
            let vectors = txn.open_table(KNOWLEDGE_VECTORS)?;
            load_node(&rows, &vectors, id)
        })
    }

    /// Children of a knowledge node, ordered by id.
    pub fn node_children(&self, id: u64) -> Result<Vec<KnowledgeNode>> {
        self.read(|txn| {
            let ids = multimap_ids(&txn.open_multimap_table(NODE_CHILDREN)?, id)?;
            let rows = txn.open_table(KNOWLEDGE_NODES)?;
            let vectors = txn.open_table(KNOWLEDGE_VECTORS)?;
            let mut nodes = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(node) = load_node(&rows, &vectors, id)? {
                    nodes.push(node);
                }
            }
            Ok(nodes)
        })
    }

    /// Items attached directly to a node, ordered by id.
    pub fn node_items(&self, id: u64) -> Result<Vec<KnowledgeItem>> {
        self.read(|txn| {
            let ids = multimap_ids(&txn.open_multimap_table(NODE_ITEMS)?, id)?;
            let rows = txn.open_table(KNOWLEDGE_ITEMS)?;
            let vectors = txn.open_table(KNOWLEDGE_VECTORS)?;
            let mut items = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(item) = load_item(&rows, &vectors, id)? {
                    items.push(item);
                }
            }
            Ok(items)
        })
    }

    pub fn domain_nodes(&self, domain: &str) -> Result<Vec<KnowledgeNode>> {
        self.read(|txn| {
            let ids = {
                let table = txn.open_multimap_table(DOMAIN_NODES)?;
                let mut ids = Vec::new();
                for v in table.get(domain)? {
                    ids.push(v?.value());
                }
                ids
            };
            let rows = txn.open_table(KNOWLEDGE_NODES)?;
            let vectors = txn.open_table(KNOWLEDGE_VECTORS)?;
            let mut nodes = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(node) = load_node(&rows, &vectors, id)? {
                    nodes.push(node);
                }
            }
            Ok(nodes)
        })
    }

    pub fn domain_items(&self, domain: &str) -> Result<Vec<KnowledgeItem>> {
        self.read(|txn| {
            let ids = {
                let table = txn.open_multimap_table(DOMAIN_ITEMS)?;
                let mut ids = Vec::new();
                for v in table.get(domain)? {
                    ids.push(v?.value());
                }
                ids
            };
            let rows = txn.open_table(KNOWLEDGE_ITEMS)?;
            let vectors = txn.open_table(KNOWLEDGE_VECTORS)?;
            let mut items = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(item) = load_item(&rows, &vectors, id)? {
                    items.push(item);
                }
            }
            Ok(items)
        })
    }

    /// Write nodes and items in one transaction. New rows get ids assigned.
    /// Nodes must already carry their final `parent_id`.
    pub fn put_knowledge(
        &self,
        nodes: &mut [KnowledgeNode],
        items: &mut [KnowledgeItem],
    ) -> Result<()> {
        self.write(|txn| {
            for node in nodes.iter_mut() {
                put_node(txn, node)?;
            }
            for item in items.iter_mut() {
                put_item(txn, item)?;
            }
            Ok(())
        })
    }

    /// Replace a domain's whole tree.
    ///
    /// `nodes` is an arena ordered parents-first: `parents[i]` is the arena
    /// index of node `i`'s parent (`None` for the root) and `placement[j]` is
    /// the arena index of the node that owns `items[j]`. Items with a nonzero
    /// id keep it; the rest are assigned fresh ids.
    pub fn replace_domain_tree(
        &self,
        domain: &str,
        nodes: &mut [KnowledgeNode],
        parents: &[Option<usize>],
        items: &mut [KnowledgeItem],
        placement: &[usize],
    ) -> Result<()> {
        self.write(|txn| {
            clear_domain(txn, domain)?;
            for i in 0..nodes.len() {
                let parent_id = parents[i].map(|p| nodes[p].id);
                let node = &mut nodes[i];
                node.id = 0;
                node.domain = domain.to_string();
                node.parent_id = parent_id;
                put_node(txn, node)?;
            }
            for (item, &owner) in items.iter_mut().zip(placement) {
                item.domain = domain.to_string();
                item.node_id = nodes[owner].id;
                put_item(txn, item)?;
            }
            Ok(())
        })
    }

    /// Remove a domain's nodes and items.
    pub fn clear_domain(&self, domain: &str) -> Result<()> {
        self.write(|txn| clear_domain(txn, domain))
    }

    pub fn status(&self) -> Result<IndexStatus> {
        let roots = self.root_folders()?.into_iter().map(|f| f.path).collect();
        let chunked_files = self
            .list_files()?
            .iter()
            .filter(|f| f.chunk_count > 0)
            .count() as u64;
        let knowledge = self.read(|txn| {
            let roots = txn.open_table(DOMAIN_ROOTS)?;
            let items = txn.open_multimap_table(DOMAIN_ITEMS)?;
            let mut counts = BTreeMap::new();
            for entry in roots.iter()? {
                let (domain, _) = entry?;
                let domain = domain.value().to_string();
                let mut count = 0;
                for v in items.get(domain.as_str())? {
                    v?;
                    count += 1;
                }
                counts.insert(domain, count);
            }
            Ok(counts)
        })?;

        Ok(IndexStatus {
            roots,
            folders: self.folder_count()?,
            files: self.file_count()?,
            chunked_files,
            chunks: self.chunk_count()?,
            knowledge,
            embedding: self.embedding_space(FILE_INDEX_SPACE)?,
        })
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

fn create_file_tables(txn: &WriteTransaction) -> Result<()> {
    txn.open_table(FOLDERS)?;
    txn.open_table(FOLDER_PATHS)?;
    txn.open_multimap_table(FOLDER_CHILDREN)?;
    txn.open_table(FILES)?;
    txn.open_table(FILE_PATHS)?;
    txn.open_multimap_table(FOLDER_FILES)?;
    txn.open_table(CHUNKS)?;
    txn.open_multimap_table(FILE_CHUNKS)?;
    txn.open_table(FILE_VECTORS)?;
    Ok(())
}

fn encode<T: Serialize>(row: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(row)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn next_id(txn: &WriteTransaction, counter: &str) -> Result<u64> {
    let mut table = txn.open_table(COUNTERS)?;
    let next = table.get(counter)?.map(|v| v.value()).unwrap_or(0) + 1;
    table.insert(counter, next)?;
    Ok(next)
}

fn multimap_ids(
    table: &impl ReadableMultimapTable<u64, u64>,
    key: u64,
) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for v in table.get(key)? {
        ids.push(v?.value());
    }
    Ok(ids)
}

fn read_vector(
    table: &impl ReadableTable<(u8, u64), Rows>,
    kind: u8,
    id: u64,
) -> Result<Vec<f32>> {
    Ok(table
        .get((kind, id))?
        .map(|guard| bytemuck::pod_collect_to_vec::<u8, f32>(guard.value()))
        .unwrap_or_default())
}

/// Store `data` under `key`; an empty vector removes the entry.
fn put_vector(
    txn: &WriteTransaction,
    definition: TableDefinition<(u8, u64), Rows>,
    key: (u8, u64),
    data: &[f32],
) -> Result<()> {
    let mut table = txn.open_table(definition)?;
    if data.is_empty() {
        table.remove(key)?;
    } else {
        table.insert(key, bytemuck::cast_slice::<f32, u8>(data))?;
    }
    Ok(())
}

fn load_folder(
    rows: &impl ReadableTable<u64, Rows>,
    vectors: &impl ReadableTable<(u8, u64), Rows>,
    id: u64,
) -> Result<Option<FolderNode>> {
    let Some(guard) = rows.get(id)? else {
        return Ok(None);
    };
    let mut folder: FolderNode = decode(guard.value())?;
    folder.embedding = read_vector(vectors, FOLDER_VEC, id)?;
    Ok(Some(folder))
}

fn fill_file_vectors(
    vectors: &impl ReadableTable<(u8, u64), Rows>,
    file: &mut FileEntry,
) -> Result<()> {
    file.name_embedding = read_vector(vectors, NAME_VEC, file.id)?;
    let content = read_vector(vectors, CONTENT_VEC, file.id)?;
    file.content_embedding = (!content.is_empty()).then_some(content);
    Ok(())
}

fn load_file(
    rows: &impl ReadableTable<u64, Rows>,
    vectors: &impl ReadableTable<(u8, u64), Rows>,
    id: u64,
) -> Result<Option<FileEntry>> {
    let Some(guard) = rows.get(id)? else {
        return Ok(None);
    };
    let mut file: FileEntry = decode(guard.value())?;
    fill_file_vectors(vectors, &mut file)?;
    Ok(Some(file))
}

fn load_node(
    rows: &impl ReadableTable<u64, Rows>,
    vectors: &impl ReadableTable<(u8, u64), Rows>,
    id: u64,
) -> Result<Option<KnowledgeNode>> {
    let Some(guard) = rows.get(id)? else {
        return Ok(None);
    };
    let mut node: KnowledgeNode = decode(guard.value())?;
    node.centroid = read_vector(vectors, CENTROID_VEC, id)?;
    node.member_sum = read_vector(vectors, MEMBER_SUM_VEC, id)?;
    Ok(Some(node))
}

fn load_item(
    rows: &impl ReadableTable<u64, Rows>,
    vectors: &impl ReadableTable<(u8, u64), Rows>,
    id: u64,
) -> Result<Option<KnowledgeItem>> {
    let Some(guard) = rows.get(id)? else {
        return Ok(None);
    };
    let mut item: KnowledgeItem = decode(guard.value())?;
    item.embedding = read_vector(vectors, ITEM_VEC, id)?;
    Ok(Some(item))
}

fn put_folder(txn: &WriteTransaction, folder: &mut FolderNode) -> Result<()> {
    if folder.id == 0 {
        folder.id = next_id(txn, "folder")?;
    }

    let previous: Option<FolderNode> = {
        let rows = txn.open_table(FOLDERS)?;
        let guard = rows.get(folder.id)?;
        match guard {
            Some(g) => Some(decode(g.value())?),
            None => None,
        }
    };

    if let Some(prev) = &previous {
        if prev.parent_id != folder.parent_id {
            txn.open_multimap_table(FOLDER_CHILDREN)?
                .remove(prev.parent_id.unwrap_or(NO_PARENT), folder.id)?;
        }
        if prev.path != folder.path {
            txn.open_table(FOLDER_PATHS)?.remove(prev.path.as_str())?;
        }
    }

    txn.open_multimap_table(FOLDER_CHILDREN)?
        .insert(folder.parent_id.unwrap_or(NO_PARENT), folder.id)?;
    txn.open_table(FOLDER_PATHS)?.insert(folder.path.as_str(), folder.id)?;
    txn.open_table(FOLDERS)?
        .insert(folder.id, encode(folder)?.as_slice())?;
    put_vector(txn, FILE_VECTORS, (FOLDER_VEC, folder.id), &folder.embedding)
}

fn put_file(txn: &WriteTransaction, file: &mut FileEntry) -> Result<()> {
    let existing = txn
        .open_table(FILE_PATHS)?
        .get(file.path.as_str())?
        .map(|v| v.value());
    if let Some(existing_id) = existing
        && existing_id != file.id
    {
        remove_file(txn, existing_id)?;
    }

    if file.id == 0 {
        file.id = next_id(txn, "file")?;
    }

    txn.open_table(FILE_PATHS)?.insert(file.path.as_str(), file.id)?;
    txn.open_multimap_table(FOLDER_FILES)?.insert(file.folder_id, file.id)?;
    txn.open_table(FILES)?.insert(file.id, encode(file)?.as_slice())?;
    put_vector(txn, FILE_VECTORS, (NAME_VEC, file.id), &file.name_embedding)?;
    put_vector(
        txn,
        FILE_VECTORS,
        (CONTENT_VEC, file.id),
        file.content_embedding.as_deref().unwrap_or_default(),
    )
}

fn remove_file(txn: &WriteTransaction, id: u64) -> Result<Option<FileEntry>> {
    let row: Option<FileEntry> = {
        let mut rows = txn.open_table(FILES)?;
        let removed = rows.remove(id)?;
        match removed {
            Some(guard) => Some(decode(guard.value())?),
            None => None,
        }
    };
    let Some(file) = row else {
        return Ok(None);
    };

    {
        let mut paths = txn.open_table(FILE_PATHS)?;
        let owned = paths.get(file.path.as_str())?.map(|v| v.value());
        if owned == Some(id) {
            paths.remove(file.path.as_str())?;
        }
    }
    txn.open_multimap_table(FOLDER_FILES)?.remove(file.folder_id, id)?;
    {
        let mut vectors = txn.open_table(FILE_VECTORS)?;
        vectors.remove((NAME_VEC, id))?;
        vectors.remove((CONTENT_VEC, id))?;
    }
    remove_chunks(txn, id)?;
    Ok(Some(file))
}

fn remove_chunks(txn: &WriteTransaction, file_id: u64) -> Result<()> {
    let ids = {
        let mut table = txn.open_multimap_table(FILE_CHUNKS)?;
        let mut ids = Vec::new();
        for v in table.remove_all(file_id)? {
            ids.push(v?.value());
        }
        ids
    };
    let mut rows = txn.open_table(CHUNKS)?;
    let mut vectors = txn.open_table(FILE_VECTORS)?;
    for id in ids {
        rows.remove(id)?;
        vectors.remove((CHUNK_VEC, id))?;
    }
    Ok(())
}

fn set_chunk_count(
    txn: &WriteTransaction,
    file_id: u64,
    count: u32,
    source_mtime: u64,
) -> Result<()> {
    let mut rows = txn.open_table(FILES)?;
    let row: Option<FileEntry> = match rows.get(file_id)? {
        Some(guard) => Some(decode(guard.value())?),
        None => None,
    };
    if let Some(mut file) = row {
        file.chunk_count = count;
        file.chunked_mtime = source_mtime;
        rows.insert(file_id, encode(&file)?.as_slice())?;
    }
    Ok(())
}

fn put_node(txn: &WriteTransaction, node: &mut KnowledgeNode) -> Result<()> {
    let is_new = node.id == 0;
    if is_new {
        node.id = next_id(txn, "knowledge_node")?;
        txn.open_multimap_table(NODE_CHILDREN)?
            .insert(node.parent_id.unwrap_or(NO_PARENT), node.id)?;
        txn.open_multimap_table(DOMAIN_NODES)?
            .insert(node.domain.as_str(), node.id)?;
        if node.parent_id.is_none() {
            txn.open_table(DOMAIN_ROOTS)?.insert(node.domain.as_str(), node.id)?;
        }
    }
    txn.open_table(KNOWLEDGE_NODES)?
        .insert(node.id, encode(node)?.as_slice())?;
    put_vector(txn, KNOWLEDGE_VECTORS, (CENTROID_VEC, node.id), &node.centroid)?;
    put_vector(txn, KNOWLEDGE_VECTORS, (MEMBER_SUM_VEC, node.id), &node.member_sum)
}

fn put_item(txn: &WriteTransaction, item: &mut KnowledgeItem) -> Result<()> {
    if item.id == 0 {
        item.id = next_id(txn, "knowledge_item")?;
    }

    let previous_node = {
        let rows = txn.open_table(KNOWLEDGE_ITEMS)?;
        let guard = rows.get(item.id)?;
        match guard {
            Some(g) => Some(decode::<KnowledgeItem>(g.value())?.node_id),
            None => None,
        }
    };
    if let Some(prev) = previous_node
        && prev != item.node_id
    {
        txn.open_multimap_table(NODE_ITEMS)?.remove(prev, item.id)?;
    }

    txn.open_multimap_table(NODE_ITEMS)?.insert(item.node_id, item.id)?;
    txn.open_multimap_table(DOMAIN_ITEMS)?
        .insert(item.domain.as_str(), item.id)?;
    txn.open_table(KNOWLEDGE_ITEMS)?
        .insert(item.id, encode(item)?.as_slice())?;
    put_vector(txn, KNOWLEDGE_VECTORS, (ITEM_VEC, item.id), &item.embedding)
}

fn clear_domain(txn: &WriteTransaction, domain: &str) -> Result<()> {
    let node_ids = {
        let mut table = txn.open_multimap_table(DOMAIN_NODES)?;
        let mut ids = Vec::new();
        for v in table.remove_all(domain)? {
            ids.push(v?.value());
        }
        ids
    };
    let item_ids = {
        let mut table = txn.open_multimap_table(DOMAIN_ITEMS)?;
        let mut ids = Vec::new();
        for v in table.remove_all(domain)? {
            ids.push(v?.value());
        }
        ids
    };

    txn.open_table(SETTINGS)?.remove(domain_space_key(domain).as_str())?;
    let root = txn.open_table(DOMAIN_ROOTS)?.remove(domain)?.map(|v| v.value());
    if let Some(root_id) = root {
        txn.open_multimap_table(NODE_CHILDREN)?.remove(NO_PARENT, root_id)?;
    }

    {
        let mut rows = txn.open_table(KNOWLEDGE_NODES)?;
        let mut children = txn.open_multimap_table(NODE_CHILDREN)?;
        let mut owned = txn.open_multimap_table(NODE_ITEMS)?;
        let mut vectors = txn.open_table(KNOWLEDGE_VECTORS)?;
        for &id in &node_ids {
            rows.remove(id)?;
            children.remove_all(id)?;
            owned.remove_all(id)?;
            vectors.remove((CENTROID_VEC, id))?;
            vectors.remove((MEMBER_SUM_VEC, id))?;
        }
    }
    {
        let mut rows = txn.open_table(KNOWLEDGE_ITEMS)?;
        let mut vectors = txn.open_table(KNOWLEDGE_VECTORS)?;
        for &id in &item_ids {
            rows.remove(id)?;
            vectors.remove((ITEM_VEC, id))?;
        }
    }
    Ok(())
}
