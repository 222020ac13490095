//! Text-to-vector encoders.
//!
//! Everything above this module sees an [`Embedder`]: a thread-safe encoder
//! returning unit-normalised dense vectors of a fixed dimension. Two
//! implementations ship with the crate:
//!
//! - [`ColbertEmbedder`](crate::model_manager::ColbertEmbedder), the default,
//!   mean-pools ColBERT token embeddings into one vector per text.
//! - [`HashEmbedder`] hashes words and character trigrams into a fixed number
//!   of buckets. It needs no model download and is fully deterministic, which
//!   makes it the embedder of choice for tests and offline use.

use crate::{
    error::Result,
    model_manager::{ColbertEmbedder, HASH_MODEL_ID},
    records::EmbeddingSpace,
    vector::normalize,
};

pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Output dimension, when known before the first call.
    fn dimension(&self) -> Option<usize>;

    fn model_id(&self) -> &str;
}

/// Encode `texts` in batches of `batch_size`, preserving order.
pub fn embed_in_batches(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let vectors = embedder.embed_batch(batch)?;
        if vectors.len() != batch.len() {
            return Err(crate::error::Error::Embedding(format!(
                "expected {} embeddings, got {}",
                batch.len(),
                vectors.len()
            )));
        }
        out.extend(vectors);
    }
    Ok(out)
}

/// The model id and output dimension of `embedder`. Encodes a short text
/// when the dimension is only known after loading the model.
pub fn embedding_space(embedder: &dyn Embedder) -> Result<EmbeddingSpace> {
    let dimension = match embedder.dimension() {
        Some(dimension) => dimension,
        None => embedder.embed("dimension")?.len(),
    };
    Ok(EmbeddingSpace {
        model: embedder.model_id().to_string(),
        dimension,
    })
}

/// Build the embedder named by `model_id`.
///
/// `hash` selects [`HashEmbedder`]; anything else is treated as a ColBERT
/// model id and loaded lazily on first use.
pub fn embedder_for_model(model_id: &str) -> Box<dyn Embedder> {
    if model_id == HASH_MODEL_ID {
        Box::new(HashEmbedder::default())
    } else {
        Box::new(ColbertEmbedder::new(model_id.to_string()))
    }
}

pub const HASH_DIMENSION: usize = 256;

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

/// Feature-hashing embedder over lowercase words and character trigrams.
///
/// # Examples
///
/// ```
/// use deskindex::embedding::{Embedder, HashEmbedder};
/// use deskindex::vector::cosine;
///
/// let e = HashEmbedder::default();
/// let budget = e.embed("2024 budget spreadsheet").unwrap();
/// let close = e.embed("budget for 2024").unwrap();
/// let far = e.embed("holiday photos from the beach").unwrap();
/// assert!(cosine(&budget, &close) > cosine(&budget, &far));
/// ```
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(HASH_DIMENSION)
    }
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let hash = blake3::hash(feature.as_bytes());
        let bytes = hash.as_bytes();
        let index = u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5],
            bytes[6], bytes[7],
        ]);
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        ((index % self.dimension as u64) as usize, sign)
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; self.dimension];
        let lower = text.to_lowercase();

        for word in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let (i, sign) = self.bucket(word);
            v[i] += sign * WORD_WEIGHT;

            let padded: Vec<char> =
                std::iter::once('^').chain(word.chars()).chain(['$']).collect();
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                let (i, sign) = self.bucket(&gram);
                v[i] += sign * TRIGRAM_WEIGHT;
            }
        }

        normalize(&mut v);
        Ok(v)
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    fn model_id(&self) -> &str {
        HASH_MODEL_ID
    }
}
