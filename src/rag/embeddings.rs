use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use fastembed::{InitOptionsUserDefined, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel};

use crate::error::ProviderError;

/// Turns text into vectors. Implemented by the remote provider client and by
/// the local ONNX model.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_documents(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ProviderError>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.embed_documents(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Decode("provider returned no embedding".to_string()))
    }
}

/// Local embedding model loaded from an exported ONNX directory. Never rate limited.
pub struct LocalEmbedder {
    model: Arc<TextEmbedding>,
}

impl LocalEmbedder {
    pub fn new(model_dir: &Path) -> Result<Self> {
        tracing::info!("Initializing embedding model from {}", model_dir.display());

        if !model_dir.exists() {
            anyhow::bail!("Model directory not found: {}", model_dir.display());
        }

        let read = |name: &str| {
            std::fs::read(model_dir.join(name))
                .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", name, e))
        };

        let user_model = UserDefinedEmbeddingModel {
            onnx_file: read("model.onnx")?,
            tokenizer_files: TokenizerFiles {
                tokenizer_file: read("tokenizer.json")?,
                config_file: read("config.json")?,
                special_tokens_map_file: read("special_tokens_map.json")?,
                tokenizer_config_file: read("tokenizer_config.json")?,
            },
        };

        let model = TextEmbedding::try_new_from_user_defined(user_model, InitOptionsUserDefined::default())
            .map_err(|e| anyhow::anyhow!("Failed to initialize embedding model: {}", e))?;

        tracing::info!("Embedding model initialized successfully");
        Ok(Self { model: Arc::new(model) })
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed_documents(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ProviderError> {
        // inference is CPU bound; keep it off the async workers
        let model = self.model.clone();
        tokio::task::spawn_blocking(move || model.embed(texts, None))
            .await
            .map_err(|e| ProviderError::Transport(format!("local embedding task failed: {}", e)))?
            .map_err(|e| ProviderError::Transport(format!("local embedding failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LocalEmbedder::new(&dir.path().join("absent")).is_err());
    }

    /// Needs an exported model: `LOCAL_MODEL_DIR=... cargo test -- --ignored`.
    #[tokio::test(flavor = "current_thread")]
    #[ignore]
    async fn local_model_embeds_on_a_single_threaded_runtime() {
        let dir = std::env::var("LOCAL_MODEL_DIR").unwrap();
        let embedder = LocalEmbedder::new(Path::new(&dir)).unwrap();

        let vectors = embedder
            .embed_documents(vec!["first text".into(), "second text".into()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), vectors[1].len());
    }
}
