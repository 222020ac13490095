//! Chunk-level search with lazy chunk materialisation.
//!
//! Chunks are a cache: a file's chunks are produced the first time a content
//! query shortlists it, and regenerated when the file's modification time no
//! longer matches the one the chunks were generated from. Materialisation runs a few files at a time,
//! each under its own timeout; a file that fails or times out is left out of
//! the current answer rather than failing it.

use std::{path::Path, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{sync::Semaphore, task::JoinSet};

use crate::{
    chunking::chunk_text,
    config::ChunkingConfig,
    embedding::{Embedder, embed_in_batches},
    error::Result,
    extract::extract_text,
    records::{ChunkRecord, FileEntry},
    router::{FileMatch, FileRouter, PreparedQuery},
    store::Store,
    text_util::keyword_score,
    vector::cosine,
    walker::mtime_secs,
};

const CHUNK_EMBED_BATCH: usize = 32;

#[derive(Debug, Clone, Serialize)]
pub struct ChunkMatch {
    pub file_path: String,
    pub file_name: String,
    pub chunk_index: u32,
    /// Character offset into the file's extracted text.
    pub offset: usize,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContentResults {
    pub files: Vec<FileMatch>,
    pub chunks: Vec<ChunkMatch>,
}

/// `0.8·cosine + 0.2·keyword(text)`.
pub fn score_chunk(query: &PreparedQuery, chunk: &ChunkRecord) -> f32 {
    0.8 * cosine(&query.embedding, &chunk.embedding)
        + 0.2 * keyword_score(&query.keywords, &chunk.text)
}

/// Whether the cached chunks of `file` still describe the file on disk.
fn chunks_are_fresh(file: &FileEntry) -> bool {
    if file.chunk_count == 0 {
        return false;
    }
    std::fs::metadata(&file.path)
        .map(|m| mtime_secs(&m) == file.chunked_mtime)
        .unwrap_or(false)
}

/// Extract, chunk, embed and persist one file's chunks, replacing any
/// existing ones. Returns the number of chunks written.
pub fn materialize_chunks(
    store: &Store,
    embedder: &dyn Embedder,
    chunking: ChunkingConfig,
    file: &FileEntry,
) -> Result<usize> {
    let path = Path::new(&file.path);
    // Stat before reading so a write racing the extraction leaves the
    // chunks marked stale.
    let source_mtime = mtime_secs(&std::fs::metadata(path)?);
    let Some(text) = extract_text(path)? else {
        store.clear_chunks(file.id)?;
        return Ok(0);
    };

    let pieces = chunk_text(&text, chunking.chunk_size, chunking.overlap);
    let texts: Vec<String> = pieces.iter().map(|c| c.text.clone()).collect();
    let vectors = embed_in_batches(embedder, &texts, CHUNK_EMBED_BATCH)?;

    let mut records: Vec<ChunkRecord> = pieces
        .into_iter()
        .zip(vectors)
        .map(|(chunk, embedding)| ChunkRecord {
            file_id: file.id,
            index: chunk.index as u32,
            text: chunk.text,
            offset: chunk.offset,
            embedding,
            ..Default::default()
        })
        .collect();
    store.replace_chunks(file.id, &mut records, source_mtime)?;

    tracing::debug!(path = %file.path, chunks = records.len(), "materialized chunks");
    Ok(records.len())
}

impl FileRouter {
    /// Ranked chunks for `query`, generating chunks for shortlisted files
    /// that have none yet.
    pub async fn search_chunks(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ChunkMatch>> {
        let router = self.clone();
        let query = query.to_string();
        let prepared =
            tokio::task::spawn_blocking(move || router.prepare(&query)).await??;
        self.search_chunks_prepared(prepared, top_k).await
    }

    async fn search_chunks_prepared(
        &self,
        prepared: PreparedQuery,
        top_k: usize,
    ) -> Result<Vec<ChunkMatch>> {
        let router = self.clone();
        let query = prepared.clone();
        let shortlist = tokio::task::spawn_blocking(move || {
            router.content_shortlist(&query)
        })
        .await??;

        let ready = self.ensure_chunks(shortlist).await;

        let router = self.clone();
        tokio::task::spawn_blocking(move || {
            router.rank_chunks(&prepared, &ready, top_k)
        })
        .await?
    }

    /// Files and chunks for `query`. The chunk phase runs under the content
    /// timeout; if it fails or runs out of time the file results are
    /// returned with no chunks.
    pub async fn search_with_content(
        &self,
        query: &str,
        limit: usize,
        top_k: usize,
    ) -> Result<ContentResults> {
        let router = self.clone();
        let query = query.to_string();
        let (prepared, files) = tokio::task::spawn_blocking(move || {
            let prepared = router.prepare(&query)?;
            let mut files =
                router.beam_search(&prepared, router.config.min_result_score)?;
            files.truncate(limit);
            Ok::<_, crate::error::Error>((prepared, files))
        })
        .await??;

        let chunks = match tokio::time::timeout(
            self.config.content_timeout(),
            self.search_chunks_prepared(prepared, top_k),
        )
        .await
        {
            Ok(Ok(chunks)) => chunks,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "chunk search failed, returning files only");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!("chunk search timed out, returning files only");
                Vec::new()
            }
        };

        Ok(ContentResults { files, chunks })
    }

    /// The wider candidate list used for chunk search: no score floor, and
    /// only files that have content.
    fn content_shortlist(&self, query: &PreparedQuery) -> Result<Vec<FileEntry>> {
        Ok(self
            .beam_search(query, 0.0)?
            .into_iter()
            .take(self.config.chunk_candidates)
            .map(|m| m.file)
            .filter(FileEntry::has_content)
            .collect())
    }

    /// Make sure every candidate has fresh chunks. Returns the ids of the
    /// files whose chunks are ready, in candidate order.
    async fn ensure_chunks(&self, candidates: Vec<FileEntry>) -> Vec<u64> {
        let order: Vec<u64> = candidates.iter().map(|f| f.id).collect();
        let mut ready = Vec::with_capacity(candidates.len());
        let semaphore = Arc::new(Semaphore::new(self.config.chunk_concurrency.max(1)));
        let per_file = self.config.chunk_timeout();
        let mut tasks = JoinSet::new();

        for file in candidates {
            if chunks_are_fresh(&file) {
                ready.push(file.id);
                continue;
            }
            let store = self.store.clone();
            let embedder = self.embedder.clone();
            let chunking = self.chunking;
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                materialize_with_timeout(store, embedder, chunking, file, per_file).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Ok(Some(id)) = joined {
                ready.push(id);
            }
        }

        ready.sort_by_key(|id| order.iter().position(|o| o == id));
        ready
    }

    fn rank_chunks(
        &self,
        query: &PreparedQuery,
        file_ids: &[u64],
        top_k: usize,
    ) -> Result<Vec<ChunkMatch>> {
        let mut matches = Vec::new();
        for &id in file_ids {
            let Some(file) = self.store.get_file(id)? else {
                continue;
            };
            for chunk in self.store.chunks_for_file(id)? {
                let score = score_chunk(query, &chunk);
                if score < self.config.min_chunk_score {
                    continue;
                }
                matches.push(ChunkMatch {
                    file_path: file.path.clone(),
                    file_name: file.name.clone(),
                    chunk_index: chunk.index,
                    offset: chunk.offset,
                    text: chunk.text,
                    score,
                });
            }
        }

        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.file_path.cmp(&b.file_path))
                .then_with(|| a.chunk_index.cmp(&b.chunk_index))
        });
        matches.truncate(top_k);
        Ok(matches)
    }
}

/// Materialise one file's chunks on the blocking pool. Returns the file id
/// when chunks are ready.
async fn materialize_with_timeout(
    store: Arc<Store>,
    embedder: Arc<dyn Embedder>,
    chunking: ChunkingConfig,
    file: FileEntry,
    limit: Duration,
) -> Option<u64> {
    let id = file.id;
    let path = file.path.clone();
    let work = tokio::task::spawn_blocking(move || {
        if file.chunk_count > 0 {
            tracing::debug!(path = %file.path, "file changed since chunking, regenerating chunks");
        }
        materialize_chunks(&store, embedder.as_ref(), chunking, &file)
    });

    match tokio::time::timeout(limit, work).await {
        Ok(Ok(Ok(count))) if count > 0 => Some(id),
        Ok(Ok(Ok(_))) => None,
        Ok(Ok(Err(e))) => {
            tracing::warn!(path = %path, error = %e, "chunk generation failed");
            None
        }
        Ok(Err(e)) => {
            tracing::warn!(path = %path, error = %e, "chunk task panicked");
            None
        }
        Err(_) => {
            tracing::warn!(path = %path, timeout_ms = limit.as_millis() as u64, "chunk generation timed out");
            None
        }
    }
}
