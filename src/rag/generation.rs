//! Retrieval-augmented answer streaming.
//!
//! A stream always starts by retrieving. On success it emits exactly one
//! `sources` event, then the model's tokens in order, and simply ends. Any
//! failure ends the stream with a single `error` event.

use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

use super::retrieval::{assemble_context, RetrievalEngine};
use super::retry::RetryPolicy;
use crate::error::{ProviderError, RagError};
use crate::models::StreamEvent;

pub type TokenStream = BoxStream<'static, Result<String, ProviderError>>;

/// A model that streams completion tokens for a prompt.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn stream_completion(&self, prompt: String) -> Result<TokenStream, ProviderError>;
}

pub const NO_DOCUMENT_MESSAGE: &str = "Please upload a document first.";
pub const RATE_LIMITED_MESSAGE: &str = "System busy (Rate Limit). Please try again.";

const PROMPT_TEMPLATE: &str = "You are an expert AI assistant designed to provide detailed, accurate, and helpful answers based on the provided context.

Instructions:
1. Answer the question based ONLY on the following context.
2. If the answer is not in the context, explicitly state \"I cannot answer this based on the provided documents.\"
3. Be detailed and explain your reasoning.
4. Format your response using Markdown (bold key terms, use lists/bullet points where appropriate).

Context:
{context}

Question: {question}

Answer:";

pub fn build_prompt(context: &str, question: &str) -> String {
    PROMPT_TEMPLATE
        .replace("{context}", context)
        .replace("{question}", question)
}

pub struct GenerationStreamer {
    retrieval: Arc<RetrievalEngine>,
    chat: Arc<dyn ChatModel>,
    retry: RetryPolicy,
    top_k: usize,
}

impl GenerationStreamer {
    pub fn new(retrieval: Arc<RetrievalEngine>, chat: Arc<dyn ChatModel>, retry: RetryPolicy, top_k: usize) -> Self {
        Self {
            retrieval,
            chat,
            retry,
            top_k,
        }
    }

    /// Answer `question` as a stream of events. Dropping the stream abandons
    /// any in-flight provider call.
    pub fn generate(&self, question: String) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let retrieval = self.retrieval.clone();
        let chat = self.chat.clone();
        let retry = self.retry;
        let top_k = self.top_k;

        stream! {
            let results = match retrieval.search(&question, top_k).await {
                Ok(results) => results,
                Err(RagError::IndexNotFound) => {
                    yield StreamEvent::Error(NO_DOCUMENT_MESSAGE.to_string());
                    return;
                }
                Err(e) if e.is_rate_limited() => {
                    tracing::warn!(error = %e, "retrieval rate limited");
                    yield StreamEvent::Error(RATE_LIMITED_MESSAGE.to_string());
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "retrieval failed");
                    yield StreamEvent::Error(format!("Error: {}", e));
                    return;
                }
            };

            let prompt = build_prompt(&assemble_context(&results), &question);
            yield StreamEvent::Sources(results.iter().map(|r| r.source_info()).collect());

            let mut attempt = 0;
            loop {
                let mut emitted = 0usize;
                let failure = match chat.stream_completion(prompt.clone()).await {
                    Ok(mut tokens) => {
                        let mut failure = None;
                        while let Some(token) = tokens.next().await {
                            match token {
                                Ok(token) => {
                                    emitted += 1;
                                    yield StreamEvent::Token(token);
                                }
                                Err(e) => {
                                    failure = Some(e);
                                    break;
                                }
                            }
                        }
                        match failure {
                            Some(e) => e,
                            None => return,
                        }
                    }
                    Err(e) => e,
                };

                // Retrying after tokens went out would repeat text the consumer already has.
                if failure.is_rate_limited() && emitted == 0 && retry.has_attempt_after(attempt) {
                    let delay = retry.delay_for(attempt);
                    tracing::warn!(attempt = attempt + 1, delay_secs = delay.as_secs_f64(), "chat_rate_limit");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }

                if failure.is_rate_limited() {
                    yield StreamEvent::Error(RATE_LIMITED_MESSAGE.to_string());
                } else {
                    tracing::error!(error = %failure, "chat generation failed");
                    yield StreamEvent::Error(format!("Error: {}", failure));
                }
                return;
            }
        }
    }
}
