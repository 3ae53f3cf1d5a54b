#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request};
use axum::Router;
use futures::stream;
use tokio::sync::Notify;

use rag_chatbot::config::Settings;
use rag_chatbot::error::ProviderError;
use rag_chatbot::indexer::extractor::{PageExtractor, PageText};
use rag_chatbot::logger::ChatLogger;
use rag_chatbot::rag::embeddings::Embedder;
use rag_chatbot::rag::generation::{ChatModel, TokenStream};
use rag_chatbot::server::{build_router, AppState};

/// Letter-histogram embeddings that count `embed_documents` calls.
#[derive(Default)]
pub struct CountingEmbedder {
    calls: AtomicUsize,
}

impl CountingEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn letters(text: &str) -> Vec<f32> {
    let mut v = vec![0.0; 26];
    for c in text.chars().filter(|c| c.is_ascii_alphabetic()) {
        v[(c.to_ascii_lowercase() as u8 - b'a') as usize] += 1.0;
    }
    v
}

#[async_trait]
impl Embedder for CountingEmbedder {
    async fn embed_documents(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| letters(t)).collect())
    }
}

/// Parks every embedding call until `open` is called.
#[derive(Default)]
pub struct GatedEmbedder {
    entered: Notify,
    release: Notify,
    opened: AtomicBool,
}

impl GatedEmbedder {
    /// Resolves once an embedding call is parked at the gate.
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn open(&self) {
        self.opened.store(true, Ordering::SeqCst);
        self.release.notify_one();
    }
}

#[async_trait]
impl Embedder for GatedEmbedder {
    async fn embed_documents(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ProviderError> {
        if !self.opened.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(texts.iter().map(|t| letters(t)).collect())
    }
}

/// Always streams the same tokens.
pub struct CannedChat(pub Vec<&'static str>);

#[async_trait]
impl ChatModel for CannedChat {
    async fn stream_completion(&self, _prompt: String) -> Result<TokenStream, ProviderError> {
        let tokens: Vec<Result<String, ProviderError>> = self.0.iter().map(|t| Ok(t.to_string())).collect();
        Ok(Box::pin(stream::iter(tokens)))
    }
}

/// Returns the same pages whatever file it is given.
pub struct FixedPages(pub Vec<PageText>);

impl PageExtractor for FixedPages {
    fn extract_pages(&self, _path: &Path) -> anyhow::Result<Vec<PageText>> {
        Ok(self.0.clone())
    }
}

/// Four 450-character pages and one 550-character page with no break points.
/// At chunk size 100 and overlap 50 that is 4 * 8 + 10 = 42 chunks.
pub fn five_page_document() -> Vec<PageText> {
    let page = |chars: usize| "abcdefghij".repeat(chars / 10);
    [450, 450, 450, 450, 550]
        .into_iter()
        .enumerate()
        .map(|(i, chars)| PageText {
            page: i,
            text: page(chars),
        })
        .collect()
}

pub fn test_settings(root: &Path) -> Settings {
    Settings {
        chunk_size: 100,
        chunk_overlap: 50,
        ingestion_batch_size: 10,
        temp_dir: root.join("tmp"),
        vector_store_path: root.join("index"),
        cache_dir: root.join("cache"),
        ..Settings::default()
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub embedder: Arc<CountingEmbedder>,
}

pub async fn test_app(settings: Settings, pages: Vec<PageText>) -> TestApp {
    let embedder = Arc::new(CountingEmbedder::default());
    let (router, state) = app_with_embedder(settings, pages, embedder.clone()).await;
    TestApp {
        router,
        state,
        embedder,
    }
}

pub async fn app_with_embedder(
    settings: Settings,
    pages: Vec<PageText>,
    embedder: Arc<dyn Embedder>,
) -> (Router, AppState) {
    let chat_log = ChatLogger::in_memory().await.unwrap();
    chat_log.init_schema().await.unwrap();

    let state = AppState::new(
        settings,
        embedder,
        Arc::new(CannedChat(vec!["The ", "answer", "."])),
        Arc::new(FixedPages(pages)),
        chat_log,
    );
    (build_router(state.clone()), state)
}

pub fn upload_request(filename: &str, content: &[u8]) -> Request<Body> {
    let boundary = "----rag-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/pdf\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/upload")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
        .body(Body::from(body))
        .unwrap()
}

pub fn chat_request(question: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::json!({ "question": question }).to_string()))
        .unwrap()
}

pub fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_lines(response: axum::response::Response) -> Vec<serde_json::Value> {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec())
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}
