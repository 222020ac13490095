use std::sync::Mutex;

use candle_core::Device;
use pylate_rs::ColBERT;

use crate::{
    embedding::Embedder,
    error::{Error, Result},
    vector::normalize,
};

pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";
pub const MODEL_ENV_VAR: &str = "DESKINDEX_MODEL";
/// Model id that selects the built-in hashing embedder.
pub const HASH_MODEL_ID: &str = "hash";

/// Pick the embedding model id from, in order of priority:
/// 1. An explicit id (from --model)
/// 2. The DESKINDEX_MODEL environment variable
/// 3. The `model` key of the config file
/// 4. [`DEFAULT_MODEL_ID`]
pub fn resolve_model_id(
    explicit: Option<&str>,
    configured: Option<&str>,
) -> String {
    if let Some(id) = explicit {
        return id.to_string();
    }
    if let Ok(id) = std::env::var(MODEL_ENV_VAR)
        && !id.is_empty()
    {
        return id;
    }
    configured.unwrap_or(DEFAULT_MODEL_ID).to_string()
}

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

/// ColBERT encoder reduced to one vector per text.
///
/// Token embeddings are mean-pooled and re-normalised. The model is loaded on
/// the first call to [`Embedder::embed_batch`], downloading it from
/// HuggingFace Hub if needed.
pub struct ColbertEmbedder {
    model: Mutex<Option<ColBERT>>,
    model_id: String,
}

impl ColbertEmbedder {
    pub fn new(model_id: String) -> Self {
        Self {
            model: Mutex::new(None),
            model_id,
        }
    }

    /// Returns `true` if the model has already been loaded into memory.
    pub fn is_loaded(&self) -> bool {
        self.model.lock().map(|m| m.is_some()).unwrap_or(false)
    }

    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut guard = self
            .model
            .lock()
            .map_err(|_| Error::Embedding("model lock poisoned".into()))?;

        if guard.is_none() {
            tracing::info!(model = %self.model_id, "loading embedding model");
            let colbert: ColBERT = ColBERT::from(&self.model_id)
                .with_device(default_device())
                .try_into()
                .map_err(|e| {
                    Error::Embedding(format!(
                        "failed to load {}: {e}",
                        self.model_id
                    ))
                })?;
            *guard = Some(colbert);
        }
        let Some(model) = guard.as_mut() else {
            return Err(Error::Embedding("model not loaded".into()));
        };

        // [batch, tokens, dimension]
        let embeddings = model
            .encode(texts, false)
            .map_err(|e| Error::Embedding(e.to_string()))?;

        let mut out = Vec::with_capacity(texts.len());
        for i in 0..texts.len() {
            let mut pooled = embeddings
                .get(i)
                .and_then(|tokens| tokens.mean(0))
                .and_then(|mean| mean.to_vec1::<f32>())
                .map_err(|e| {
                    Error::Embedding(format!("failed to pool text {i}: {e}"))
                })?;
            normalize(&mut pooled);
            out.push(pooled);
        }
        Ok(out)
    }
}

impl Embedder for ColbertEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.encode(&[text.to_string()])?
            .pop()
            .ok_or_else(|| Error::Embedding("empty model output".into()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.encode(texts)
    }

    fn dimension(&self) -> Option<usize> {
        None
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_model_id() {
        let embedder = ColbertEmbedder::new("custom/model".to_string());
        assert_eq!(embedder.model_id(), "custom/model");
        assert!(!embedder.is_loaded());
    }

    #[test]
    fn explicit_model_wins() {
        let id = resolve_model_id(Some("hash"), Some("other/model"));
        assert_eq!(id, "hash");
    }

    #[test]
    fn empty_batch_does_not_load_model() {
        let embedder = ColbertEmbedder::new(DEFAULT_MODEL_ID.to_string());
        assert!(embedder.embed_batch(&[]).unwrap().is_empty());
        assert!(!embedder.is_loaded());
    }
}
