//! CLIP text encoder backed by `candle-transformers`
//!
//! Prompts are tokenized with a HuggingFace `tokenizer.json`, padded to the
//! model's context length, and run through the CLIP text transformer. The
//! conditioning embedding `(1, 77, D)` is the penultimate layer's hidden
//! states passed through the final layer norm, as the OpenCLIP-conditioned
//! video UNet was trained on.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{LayerNorm, Module, VarBuilder};
use candle_transformers::models::stable_diffusion::clip;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::model::TextEmbedder;

#[derive(Debug, thiserror::Error)]
pub enum TextEncoderError {
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Padding token {0:?} is not in the vocabulary")]
    MissingPadToken(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Layer norm epsilon of the OpenCLIP text tower
const LAYER_NORM_EPS: f64 = 1e-5;

/// Hidden states taken this many layers from the end
const PENULTIMATE: isize = -2;

/// The text tower's `final_layer_norm`, applied to the penultimate hidden states
pub fn final_layer_norm(vb: &VarBuilder, width: usize) -> candle_core::Result<LayerNorm> {
    candle_nn::layer_norm(width, LAYER_NORM_EPS, vb.pp("text_model.final_layer_norm"))
}

pub struct ClipTextEmbedder {
    model: clip::ClipTextTransformer,
    final_norm: LayerNorm,
    tokenizer: Tokenizer,
    pad_id: u32,
    max_len: usize,
    device: Device,
}

impl ClipTextEmbedder {
    /// Load weights and tokenizer for the given CLIP configuration.
    ///
    /// `width` is the hidden size of the text tower.
    pub fn load(
        weights: impl AsRef<Path>,
        tokenizer_path: impl AsRef<Path>,
        config: &clip::Config,
        width: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, TextEncoderError> {
        let tokenizer = Tokenizer::from_file(tokenizer_path.as_ref())
            .map_err(|e| TextEncoderError::Tokenizer(e.to_string()))?;

        let pad_token = config.pad_with.clone().unwrap_or_else(|| "<|endoftext|>".to_string());
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(&pad_token)
            .ok_or(TextEncoderError::MissingPadToken(pad_token))?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights.as_ref()], dtype, device)? };
        let final_norm = final_layer_norm(&vb, width)?;
        let model = clip::ClipTextTransformer::new(vb, config)?;

        Ok(Self {
            model,
            final_norm,
            tokenizer,
            pad_id,
            max_len: config.max_position_embeddings,
            device: device.clone(),
        })
    }

    /// Token ids padded (or truncated) to the context length
    pub fn tokenize(&self, prompt: &str) -> Result<Vec<u32>, TextEncoderError> {
        let mut ids = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| TextEncoderError::Tokenizer(e.to_string()))?
            .get_ids()
            .to_vec();
        ids.truncate(self.max_len);
        ids.resize(self.max_len, self.pad_id);
        Ok(ids)
    }

    pub fn embed(&self, prompt: &str) -> Result<Tensor, TextEncoderError> {
        let ids = self.tokenize(prompt)?;
        let input_ids = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let (_, penultimate) = self
            .model
            .forward_until_encoder_layer(&input_ids, usize::MAX, PENULTIMATE)?;
        let embeddings = self.final_norm.forward(&penultimate)?;
        debug!(prompt, shape = ?embeddings.dims(), "Encoded prompt");
        Ok(embeddings)
    }
}

impl TextEmbedder for ClipTextEmbedder {
    fn encode(&mut self, text: &str) -> candle_core::Result<Tensor> {
        self.embed(text)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_final_layer_norm_weights() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "text_model.final_layer_norm.weight".to_string(),
            Tensor::new(&[2f32, 2., 2., 2.], &device)?,
        );
        tensors.insert(
            "text_model.final_layer_norm.bias".to_string(),
            Tensor::new(&[1f32, 1., 1., 1.], &device)?,
        );
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let norm = final_layer_norm(&vb, 4)?;

        let hidden = Tensor::new(&[[[1f32, 2., 3., 4.]]], &device)?;
        let out = norm.forward(&hidden)?.flatten_all()?.to_vec1::<f32>()?;
        // standardized [-1.342, -0.447, 0.447, 1.342], then * 2 + 1
        let expected = [-1.6833f32, 0.1056, 1.8944, 3.6833];
        for (o, e) in out.iter().zip(expected) {
            assert!((o - e).abs() < 1e-3, "{o} vs {e}");
        }
        Ok(())
    }

    #[test]
    fn test_final_layer_norm_missing_weights() {
        let vb = VarBuilder::from_tensors(HashMap::new(), DType::F32, &Device::Cpu);
        assert!(final_layer_norm(&vb, 4).is_err());
    }
}
