use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use rag_chatbot::config::{EmbeddingBackend, Settings};
use rag_chatbot::indexer::extractor::PdfExtractor;
use rag_chatbot::logger::ChatLogger;
use rag_chatbot::proxy::ProviderClient;
use rag_chatbot::rag::embeddings::{Embedder, LocalEmbedder};
use rag_chatbot::server::{build_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    init_tracing(&settings);

    tracing::info!(
        provider = %settings.provider_base_url,
        chat_model = %settings.llm_model,
        embedding_backend = ?settings.embedding_backend,
        "Connecting to provider"
    );
    let provider = Arc::new(ProviderClient::new(&settings)?);
    match provider.health_check().await {
        Ok(true) => tracing::info!("Provider is reachable"),
        Ok(false) => tracing::warn!("Provider health check failed (continuing)"),
        Err(e) => tracing::warn!(error = %e, "Provider unreachable (continuing)"),
    }

    let embedder: Arc<dyn Embedder> = match settings.embedding_backend {
        EmbeddingBackend::Remote => provider.clone(),
        EmbeddingBackend::Local => {
            let model_dir = settings.local_model_dir.clone();
            Arc::new(tokio::task::spawn_blocking(move || LocalEmbedder::new(&model_dir)).await??)
        }
    };

    tracing::info!(database = %settings.database_url, "Opening chat transcript");
    let chat_log = ChatLogger::new(&settings.database_url).await?;
    chat_log.init_schema().await?;

    let port = settings.http_port;
    let state = AppState::new(settings, embedder, provider, Arc::new(PdfExtractor), chat_log);

    // Every process start is a fresh session.
    tracing::info!("startup_cleanup_started");
    state.reset_session().await?;
    state.pipeline.store().remove_staging_dirs()?;
    state.pipeline.cache().remove_staging_dirs()?;
    tracing::info!("startup_complete");

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("Backend server listening on {}", listener.local_addr()?);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutdown");
    Ok(())
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if settings.is_development() {
        builder.pretty().init();
    } else {
        builder.json().init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
