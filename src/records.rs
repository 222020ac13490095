//! Rows held by the [`Store`](crate::store::Store).
//!
//! Scalar fields are persisted as JSON; vectors are skipped by serde and kept
//! in a separate binary table, then filled back in when a row is loaded.

use serde::{Deserialize, Serialize};

/// One indexed directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FolderNode {
    /// Store-assigned id; 0 until the row is first inserted.
    pub id: u64,
    pub path: String,
    /// `None` only for the indexing root.
    pub parent_id: Option<u64>,
    pub name: String,
    pub depth: u32,
    pub summary: String,
    pub file_count: u32,
    /// Seconds since the Unix epoch.
    pub indexed_at: u64,
    /// Normalised mean of the children's embeddings; empty when the folder
    /// has nothing embeddable below it.
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

/// One indexed file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: u64,
    pub path: String,
    pub folder_id: u64,
    pub name: String,
    /// Lowercase, without the dot.
    pub extension: String,
    pub signature: Option<String>,
    /// Modification time, whole seconds since the Unix epoch.
    pub modified: u64,
    pub size: u64,
    /// Hex BLAKE3 digest of the file's bytes when it was embedded.
    #[serde(default)]
    pub content_hash: Option<String>,
    /// 0 until chunks are lazily materialised.
    pub chunk_count: u32,
    /// Modification time of the file when its chunks were generated.
    #[serde(default)]
    pub chunked_mtime: u64,
    #[serde(skip)]
    pub name_embedding: Vec<f32>,
    #[serde(skip)]
    pub content_embedding: Option<Vec<f32>>,
}

impl FileEntry {
    /// The vector that represents this file in its folder's aggregate:
    /// content when available, the path embedding otherwise.
    pub fn representative_embedding(&self) -> &[f32] {
        match &self.content_embedding {
            Some(v) if !v.is_empty() => v,
            _ => &self.name_embedding,
        }
    }

    pub fn has_content(&self) -> bool {
        self.content_embedding.as_ref().is_some_and(|v| !v.is_empty())
    }
}

/// A content fragment of a file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: u64,
    pub file_id: u64,
    pub index: u32,
    pub text: String,
    /// Character offset into the extracted text.
    pub offset: usize,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

/// One cluster in a knowledge domain's tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeNode {
    pub id: u64,
    pub domain: String,
    pub parent_id: Option<u64>,
    pub depth: u32,
    /// Items in this node's subtree.
    pub item_count: u32,
    /// Set when a leaf outgrew the maximum leaf size after an insert.
    pub needs_split: bool,
    /// Normalised mean of the subtree's item embeddings.
    #[serde(skip)]
    pub centroid: Vec<f32>,
    /// Unnormalised sum of the subtree's item embeddings, kept so inserts
    /// can update `centroid` exactly.
    #[serde(skip)]
    pub member_sum: Vec<f32>,
}

/// Where a knowledge item came from.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    File,
    System,
    Inferred,
    #[default]
    User,
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "system" => Ok(Self::System),
            "inferred" => Ok(Self::Inferred),
            "user" => Ok(Self::User),
            other => Err(format!("unknown source kind: {other}")),
        }
    }
}

/// A leaf fact in a knowledge tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: u64,
    pub node_id: u64,
    pub domain: String,
    pub content: String,
    pub source: SourceKind,
    pub source_path: Option<String>,
    pub confidence: f32,
    pub access_count: u32,
    pub created_at: u64,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

/// The embedder a set of stored vectors was produced with. Vectors from
/// different spaces cannot be compared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingSpace {
    pub model: String,
    pub dimension: usize,
}

impl EmbeddingSpace {
    pub fn matches(&self, model: &str, dimension: usize) -> bool {
        self.model == model && self.dimension == dimension
    }
}

impl std::fmt::Display for EmbeddingSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} dimensions)", self.model, self.dimension)
    }
}

/// Current time as whole seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_are_not_serialized() {
        let file = FileEntry {
            path: "/a/b.txt".to_string(),
            name_embedding: vec![1.0, 0.0],
            content_embedding: Some(vec![0.0, 1.0]),
            ..Default::default()
        };
        let json = serde_json::to_string(&file).unwrap();
        assert!(!json.contains("embedding"));

        let restored: FileEntry = serde_json::from_str(&json).unwrap();
        assert!(restored.name_embedding.is_empty());
        assert!(restored.content_embedding.is_none());
    }

    #[test]
    fn representative_embedding_prefers_content() {
        let mut file = FileEntry {
            name_embedding: vec![1.0, 0.0],
            content_embedding: Some(vec![0.0, 1.0]),
            ..Default::default()
        };
        assert_eq!(file.representative_embedding(), &[0.0, 1.0]);
        file.content_embedding = None;
        assert_eq!(file.representative_embedding(), &[1.0, 0.0]);
    }

    #[test]
    fn source_kind_parses_snake_case() {
        assert_eq!("inferred".parse::<SourceKind>().unwrap(), SourceKind::Inferred);
        assert!("photo".parse::<SourceKind>().is_err());
    }
}
