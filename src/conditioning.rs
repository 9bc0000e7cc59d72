//! Text conditioning for classifier-free guidance

use std::collections::HashMap;

use candle_core::Tensor;
use tracing::debug;

use crate::error::{Result, SdVideoError};
use crate::model::TextEmbedder;

/// Positive and negative embeddings for one generation
#[derive(Debug, Clone)]
pub struct PromptEmbeddings {
    pub positive: Tensor,
    pub negative: Tensor,
}

impl PromptEmbeddings {
    /// Batch-of-2 context ordered `[negative, positive]`
    pub fn guidance_context(&self) -> Result<Tensor> {
        Ok(Tensor::cat(&[&self.negative, &self.positive], 0)?)
    }
}

/// Wraps a [`TextEmbedder`] and memoizes embeddings by prompt text.
pub struct ConditioningEncoder<T: TextEmbedder> {
    embedder: T,
    cache: HashMap<String, Tensor>,
}

impl<T: TextEmbedder> ConditioningEncoder<T> {
    pub fn new(embedder: T) -> Self {
        Self {
            embedder,
            cache: HashMap::new(),
        }
    }

    /// Encode one prompt, consulting the cache first
    pub fn encode_one(&mut self, text: &str) -> Result<Tensor> {
        if let Some(hit) = self.cache.get(text) {
            debug!(prompt = text, "Embedding cache hit");
            return Ok(hit.clone());
        }
        let embedding = self.embedder.encode(text)?;
        self.cache.insert(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    /// Encode both prompts. An empty negative prompt is still encoded.
    pub fn encode(&mut self, prompt: &str, negative_prompt: &str) -> Result<PromptEmbeddings> {
        let positive = self.encode_one(prompt)?;
        let negative = self.encode_one(negative_prompt)?;
        if positive.dims() != negative.dims() {
            return Err(SdVideoError::ShapeMismatch {
                context: "prompt embeddings",
                expected: positive.dims().to_vec(),
                actual: negative.dims().to_vec(),
            });
        }
        debug!(shape = ?positive.dims(), "Encoded prompt pair");
        Ok(PromptEmbeddings { positive, negative })
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn cached_prompts(&self) -> usize {
        self.cache.len()
    }

    pub fn embedder(&self) -> &T {
        &self.embedder
    }
}
