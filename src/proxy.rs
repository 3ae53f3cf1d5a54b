use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response};

use crate::config::Settings;
use crate::error::ProviderError;
use crate::models::{ChatCompletionRequest, EmbeddingRequest, EmbeddingResponse, Message, StreamChunk};
use crate::rag::embeddings::Embedder;
use crate::rag::generation::{ChatModel, TokenStream};

/// OpenAI-compatible provider (LiteLLM, Gemini's OpenAI endpoint, ...).
/// Serves both embeddings and streamed chat completions.
pub struct ProviderClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    embedding_model: String,
    chat_model: String,
    temperature: f32,
}

impl ProviderClient {
    pub fn new(settings: &Settings) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(settings.provider_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: settings.provider_base_url.trim_end_matches('/').to_string(),
            api_key: settings.provider_api_key.clone(),
            embedding_model: settings.embedding_model.clone(),
            chat_model: settings.llm_model.clone(),
            temperature: settings.llm_temperature,
        })
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.post(&url);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    async fn check(response: Response) -> Result<Response, ProviderError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let error_text = response.text().await.unwrap_or_default();
        Err(ProviderError::from_status(status, error_text))
    }

    pub async fn health_check(&self) -> Result<bool, ProviderError> {
        let url = format!("{}/health/liveliness", self.base_url);
        let response = self.client.get(&url).send().await?;
        Ok(response.status().is_success())
    }
}

#[async_trait]
impl Embedder for ProviderClient {
    async fn embed_documents(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbeddingRequest {
            model: &self.embedding_model,
            input: &texts,
        };
        let response = Self::check(self.post("/embeddings").json(&request).send().await?).await?;
        let mut body: EmbeddingResponse = response.json().await?;

        if body.data.len() != texts.len() {
            return Err(ProviderError::Decode(format!(
                "requested {} embeddings, received {}",
                texts.len(),
                body.data.len()
            )));
        }
        body.data.sort_by_key(|d| d.index);
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl ChatModel for ProviderClient {
    async fn stream_completion(&self, prompt: String) -> Result<TokenStream, ProviderError> {
        let request = ChatCompletionRequest {
            model: self.chat_model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt,
            }],
            temperature: Some(self.temperature),
            max_tokens: None,
            stream: Some(true),
        };
        let response = Self::check(self.post("/chat/completions").json(&request).send().await?).await?;
        let mut bytes = response.bytes_stream();

        let tokens = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => buffer.extend_from_slice(&chunk),
                    Err(e) => {
                        yield Err(ProviderError::from(e));
                        return;
                    }
                }
                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match parse_sse_line(String::from_utf8_lossy(&line).trim()) {
                        SseLine::Token(token) => yield Ok(token),
                        SseLine::Error(message) => {
                            yield Err(ProviderError::from_stream_message(message));
                            return;
                        }
                        SseLine::Done => return,
                        SseLine::Skip => {}
                    }
                }
            }
        };

        Ok(Box::pin(tokens))
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Token(String),
    Error(String),
    Done,
    Skip,
}

/// Interpret one line of an OpenAI-style server-sent event stream.
fn parse_sse_line(line: &str) -> SseLine {
    let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
        return SseLine::Skip;
    };
    if payload == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => {
            if let Some(error) = chunk.error {
                return SseLine::Error(error.to_string());
            }
            chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content)
                .filter(|content| !content.is_empty())
                .map(SseLine::Token)
                .unwrap_or(SseLine::Skip)
        }
        Err(e) => SseLine::Error(format!("malformed stream chunk: {}", e)),
    }
}
