//! In-process provider doubles for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;

use super::embeddings::Embedder;
use super::generation::{ChatModel, TokenStream};
use crate::error::ProviderError;

const LETTERS: usize = 26;

/// Embeds text as its letter histogram. Identical texts embed identically and
/// texts sharing letters land close together.
#[derive(Default)]
pub struct HashEmbedder {
    document_calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn document_calls(&self) -> usize {
        self.document_calls.load(Ordering::SeqCst)
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0; LETTERS];
        for c in text.chars().filter(|c| c.is_ascii_alphabetic()) {
            v[(c.to_ascii_lowercase() as u8 - b'a') as usize] += 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed_documents(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.document_calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// One scripted reply of [`ScriptedChat`].
pub enum Turn {
    Tokens(Vec<String>),
    TokensThenRateLimit(Vec<String>),
    RateLimited,
    Failed(u16),
}

impl Turn {
    pub fn tokens(tokens: &[&str]) -> Self {
        Self::Tokens(tokens.iter().map(|t| t.to_string()).collect())
    }

    pub fn tokens_then_rate_limit(tokens: &[&str]) -> Self {
        Self::TokensThenRateLimit(tokens.iter().map(|t| t.to_string()).collect())
    }

    pub fn rate_limited() -> Self {
        Self::RateLimited
    }

    pub fn failed(status: u16) -> Self {
        Self::Failed(status)
    }
}

/// Replays scripted turns in order, one per `stream_completion` call.
pub struct ScriptedChat {
    turns: Mutex<VecDeque<Turn>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedChat {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    async fn stream_completion(&self, prompt: String) -> Result<TokenStream, ProviderError> {
        self.prompts.lock().unwrap().push(prompt);
        let turn = self.turns.lock().unwrap().pop_front();
        match turn {
            Some(Turn::Tokens(tokens)) => Ok(Box::pin(stream::iter(tokens.into_iter().map(Ok)))),
            Some(Turn::TokensThenRateLimit(tokens)) => {
                let items = tokens
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(ProviderError::RateLimited("429".into()))));
                Ok(Box::pin(stream::iter(items)))
            }
            Some(Turn::RateLimited) => Err(ProviderError::RateLimited("429 Too Many Requests".into())),
            Some(Turn::Failed(status)) => Err(ProviderError::Http {
                status,
                body: "internal error".into(),
            }),
            None => Err(ProviderError::Http {
                status: 500,
                body: "script exhausted".into(),
            }),
        }
    }
}
