//! # Embedder
//!
//! Turns text into fixed-dimension vectors.
//!
//! Every backend implements [`Embedder`]. The contract is small. Output has the same
//! length and order as the input, every vector has [`Embedder::dimension`]
//! entries, and the same model given the same input always produces the same vectors.
//!
//! ## Backends
//! - [`SentenceEmbeddingsModel`]: a BERT sentence-transformer (default
//!   `sentence-transformers/all-MiniLM-L6-v2`, 384-d) run with Candle, pure Rust.
//!   Model files are fetched through the Hugging Face hub cache. Texts are
//!   embedded in padded batches, mean-pooled over the attention mask and
//!   L2-normalized.
//! - [`HashingEmbedder`]: a feature-hashing bag of words. No model files, fully
//!   deterministic, good enough for lexical overlap. Used offline and in tests.
//!
//! Model lifecycle (downloading, retrying, serving) is not handled here: a model
//! that cannot be loaded or run surfaces as [`RagError::ModelUnavailable`].

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use hf_hub::{Repo, RepoType, api::sync::Api};
use indicatif::{ProgressBar, ProgressStyle};
use once_cell::sync::Lazy;
use regex::Regex;
use std::error::Error;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tracing::{debug, info};

use crate::config::{EmbeddingBackend, RagConfig};
use crate::error::{RagError, Result};
use crate::vector_index::l2_normalize;

/// Maps a batch of texts to vectors of a fixed dimension.
pub trait Embedder: Send + Sync {
    /// Identifier recorded in snapshots built with this embedder.
    fn model_name(&self) -> &str;

    /// Length of every vector this embedder returns.
    fn dimension(&self) -> usize;

    /// Embed `texts`, returning one vector per input in the same order.
    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;
}

impl<E: Embedder + ?Sized> Embedder for Box<E> {
    fn model_name(&self) -> &str {
        (**self).model_name()
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        (**self).embed(texts)
    }
}

/// Load the backend selected by `config.embedding_backend`.
pub fn load_embedder(config: &RagConfig) -> Result<Box<dyn Embedder>> {
    match config.embedding_backend {
        EmbeddingBackend::Candle => {
            let model = SentenceEmbeddingsModel::load(&config.model_name)?
                .with_batch_size(config.embedding_batch_size)
                .with_progress(config.show_progress);
            Ok(Box::new(model))
        }
        EmbeddingBackend::Hashing => Ok(Box::new(HashingEmbedder::new(
            HashingEmbedder::DEFAULT_DIMENSION,
        )?)),
    }
}

/// Sentence embeddings model using Candle (pure Rust).
pub struct SentenceEmbeddingsModel {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    model_name: String,
    dimension: usize,
    batch_size: usize,
    show_progress: bool,
}

impl SentenceEmbeddingsModel {
    /// Load `model_id` from the Hugging Face hub (or its local cache).
    ///
    /// # Errors
    /// [`RagError::ModelUnavailable`] if any model file cannot be fetched or parsed.
    pub fn load(model_id: &str) -> Result<Self> {
        Self::try_load(model_id)
            .map_err(|e| RagError::ModelUnavailable(format!("{model_id}: {e}")))
    }

    fn try_load(model_id: &str) -> std::result::Result<Self, Box<dyn Error>> {
        let device = Device::Cpu;
        let revision = "main";

        let repo = Repo::with_revision(model_id.to_string(), RepoType::Model, revision.to_string());
        let api = Api::new()?;
        let api_repo = api.repo(repo);

        let config_filename = api_repo.get("config.json")?;
        let tokenizer_filename = api_repo.get("tokenizer.json")?;
        let weights_filename = api_repo.get("model.safetensors")?;

        let config_text = std::fs::read_to_string(config_filename)?;
        let config: Config = serde_json::from_str(&config_text)?;
        let raw: serde_json::Value = serde_json::from_str(&config_text)?;
        let dimension = raw["hidden_size"]
            .as_u64()
            .ok_or("config.json has no hidden_size")? as usize;

        let mut tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| format!("Failed to load tokenizer: {}", e))?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: 512,
                ..Default::default()
            }))
            .map_err(|e| format!("Failed to configure truncation: {}", e))?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_filename], DTYPE, &device)? };
        let model = BertModel::load(vb, &config)?;

        info!("Loaded embedding model: {} ({}-d)", model_id, dimension);

        Ok(Self {
            model,
            tokenizer,
            device,
            model_name: model_id.to_string(),
            dimension,
            batch_size: 32,
            show_progress: false,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Run one padded batch through the model.
    fn encode_batch(&self, texts: &[&str]) -> std::result::Result<Vec<Vec<f32>>, Box<dyn Error>> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| format!("Tokenization error: {}", e))?;

        let mut ids = Vec::with_capacity(encodings.len());
        let mut type_ids = Vec::with_capacity(encodings.len());
        let mut masks = Vec::with_capacity(encodings.len());
        for encoding in &encodings {
            ids.push(Tensor::new(encoding.get_ids(), &self.device)?);
            type_ids.push(Tensor::new(encoding.get_type_ids(), &self.device)?);
            masks.push(Tensor::new(encoding.get_attention_mask(), &self.device)?);
        }
        let token_ids = Tensor::stack(&ids, 0)?; // [batch, seq]
        let token_type_ids = Tensor::stack(&type_ids, 0)?;
        let attention_mask = Tensor::stack(&masks, 0)?;

        let output = self
            .model
            .forward(&token_ids, &token_type_ids, Some(&attention_mask))?; // [batch, seq, hidden]

        // Mean pooling over real tokens only.
        let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(2)?; // [batch, seq, 1]
        let sum = output.broadcast_mul(&mask)?.sum(1)?; // [batch, hidden]
        let count = mask.sum(1)?.clamp(1f32, f32::INFINITY)?; // [batch, 1]
        let mean = sum.broadcast_div(&count)?;

        let norm = mean
            .sqr()?
            .sum_keepdim(1)?
            .sqrt()?
            .clamp(1e-12f32, f32::INFINITY)?;
        let normalized = mean.broadcast_div(&norm)?;

        Ok(normalized.to_vec2::<f32>()?)
    }
}

impl Embedder for SentenceEmbeddingsModel {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        info!("Generating embeddings for {} texts...", texts.len());

        let progress = if self.show_progress {
            let bar = ProgressBar::new(texts.len() as u64);
            if let Ok(style) = ProgressStyle::with_template("{bar:40} {pos}/{len} embedded") {
                bar.set_style(style);
            }
            bar
        } else {
            ProgressBar::hidden()
        };

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            debug!("Embedding batch of {}", batch.len());
            let embedded = self
                .encode_batch(batch)
                .map_err(|e| RagError::ModelUnavailable(format!("{}: {}", self.model_name, e)))?;
            vectors.extend(embedded);
            progress.inc(batch.len() as u64);
        }
        progress.finish_and_clear();

        info!("Embeddings shape: ({}, {})", vectors.len(), self.dimension);
        Ok(vectors)
    }
}

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("word regex is valid"));

/// Deterministic feature-hashing embedder.
///
/// Each lower-cased word is hashed with BLAKE3 into one of `dimension` buckets
/// with a +1/-1 sign; the bucket counts are then L2-normalized. Texts sharing
/// words score higher under cosine similarity.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    model_name: String,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMENSION: usize = 384;

    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(RagError::Configuration(
                "hashing embedder dimension must be greater than 0".into(),
            ));
        }
        Ok(Self {
            dimension,
            model_name: format!("hashing-{dimension}"),
        })
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];
        let lowered = text.to_lowercase();
        for word in WORD.find_iter(&lowered) {
            let digest = blake3::hash(word.as_str().as_bytes());
            let bytes = digest.as_bytes();
            let mut head = [0u8; 8];
            head.copy_from_slice(&bytes[..8]);
            let bucket = (u64::from_le_bytes(head) % self.dimension as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        l2_normalize(&mut vector);
        vector
    }
}

impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        debug!("Hashing {} texts into {}-d vectors", texts.len(), self.dimension);
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_hashing_preserves_order_and_dimension() {
        let embedder = HashingEmbedder::new(64).unwrap();
        let texts = ["alpha", "beta gamma", "delta epsilon zeta"];

        let batch = embedder.embed(&texts).unwrap();
        assert_eq!(batch.len(), 3);
        for (i, text) in texts.iter().enumerate() {
            assert_eq!(batch[i].len(), 64);
            let single = embedder.embed(&[*text]).unwrap();
            assert_eq!(batch[i], single[0]);
        }
    }

    #[test]
    fn test_hashing_is_deterministic_and_normalized() {
        let a = HashingEmbedder::new(128).unwrap();
        let b = HashingEmbedder::new(128).unwrap();
        let va = a.embed(&["Refunds must be processed within 30 days."]).unwrap();
        let vb = b.embed(&["Refunds must be processed within 30 days."]).unwrap();
        assert_eq!(va, vb);

        let norm = dot(&va[0], &va[0]).sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashing_ignores_case_and_punctuation() {
        let embedder = HashingEmbedder::new(128).unwrap();
        let v = embedder.embed(&["Marketing, SPEND!", "marketing spend"]).unwrap();
        assert_eq!(v[0], v[1]);
    }

    #[test]
    fn test_hashing_blank_text_is_zero_vector() {
        let embedder = HashingEmbedder::new(16).unwrap();
        let v = embedder.embed(&["  ...  "]).unwrap();
        assert!(v[0].iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_hashing_rejects_zero_dimension() {
        assert!(matches!(
            HashingEmbedder::new(0),
            Err(RagError::Configuration(_))
        ));
    }

    #[test]
    fn test_boxed_embedder_delegates() {
        let boxed: Box<dyn Embedder> = Box::new(HashingEmbedder::new(32).unwrap());
        assert_eq!(boxed.dimension(), 32);
        assert_eq!(boxed.model_name(), "hashing-32");
        assert_eq!(boxed.embed(&["x"]).unwrap().len(), 1);
    }

    #[test]
    #[ignore = "downloads sentence-transformers/all-MiniLM-L6-v2"]
    fn test_sentence_model_batches_match_singles() {
        let model = SentenceEmbeddingsModel::load("sentence-transformers/all-MiniLM-L6-v2")
            .unwrap()
            .with_batch_size(2);
        assert_eq!(model.dimension(), 384);

        let texts = ["Rust is cool.", "I love programming.", "Programming is fun."];
        let vectors = model.embed(&texts).unwrap();
        assert_eq!(vectors.len(), 3);
        assert!(vectors.iter().all(|v| v.len() == 384));

        let related = dot(&vectors[1], &vectors[2]);
        let unrelated = dot(&vectors[0], &vectors[2]);
        assert!(related > unrelated);
    }
}
