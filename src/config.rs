use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    Remote,
    Local,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    #[serde(default = "default_provider_base_url")]
    pub provider_base_url: String,
    #[serde(default)]
    pub provider_api_key: Option<String>,
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: EmbeddingBackend,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_local_model_dir")]
    pub local_model_dir: PathBuf,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_temperature: f32,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_retriever_k")]
    pub retriever_k: usize,

    #[serde(default = "default_ingestion_batch_size")]
    pub ingestion_batch_size: usize,
    #[serde(default = "default_ingestion_max_retries")]
    pub ingestion_max_retries: u32,
    #[serde(default = "default_ingestion_base_delay_secs")]
    pub ingestion_base_delay_secs: u64,
    #[serde(default = "default_chat_max_retries")]
    pub chat_max_retries: u32,
    #[serde(default = "default_chat_base_delay_secs")]
    pub chat_base_delay_secs: u64,

    #[serde(default = "default_approximate_threshold")]
    pub approximate_threshold: usize,
    #[serde(default = "default_true")]
    pub approximate_enabled: bool,
    #[serde(default = "default_ivf_nprobe")]
    pub ivf_nprobe: usize,

    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: usize,
    #[serde(default = "default_rate_limit_uploads")]
    pub rate_limit_uploads: usize,
    #[serde(default = "default_rate_limit_chat")]
    pub rate_limit_chat: usize,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: String,
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    #[serde(default = "default_vector_store_path")]
    pub vector_store_path: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_provider_base_url() -> String {
    "http://localhost:4000".to_string()
}
fn default_provider_timeout_secs() -> u64 {
    120
}
fn default_embedding_backend() -> EmbeddingBackend {
    EmbeddingBackend::Remote
}
fn default_embedding_model() -> String {
    "text-embedding-004".to_string()
}
fn default_local_model_dir() -> PathBuf {
    PathBuf::from("./models/bge-small-en-v1.5")
}
fn default_llm_model() -> String {
    "gemini-flash-latest".to_string()
}
fn default_chunk_size() -> usize {
    800
}
fn default_chunk_overlap() -> usize {
    400
}
fn default_retriever_k() -> usize {
    7
}
fn default_ingestion_batch_size() -> usize {
    10
}
fn default_ingestion_max_retries() -> u32 {
    5
}
fn default_ingestion_base_delay_secs() -> u64 {
    2
}
fn default_chat_max_retries() -> u32 {
    3
}
fn default_chat_base_delay_secs() -> u64 {
    5
}
fn default_approximate_threshold() -> usize {
    1000
}
fn default_true() -> bool {
    true
}
fn default_ivf_nprobe() -> usize {
    8
}
fn default_max_file_size_mb() -> usize {
    50
}
fn default_rate_limit_uploads() -> usize {
    10
}
fn default_rate_limit_chat() -> usize {
    30
}
fn default_allowed_origins() -> String {
    "http://localhost:5173,http://localhost:5174".to_string()
}
fn default_temp_dir() -> PathBuf {
    PathBuf::from("./data/temp")
}
fn default_vector_store_path() -> PathBuf {
    PathBuf::from("./data/faiss_index")
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache/embeddings")
}
fn default_database_url() -> String {
    "sqlite://data/chat_history.db".to_string()
}
fn default_http_port() -> u16 {
    8000
}
fn default_environment() -> String {
    "development".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider_base_url: default_provider_base_url(),
            provider_api_key: None,
            provider_timeout_secs: default_provider_timeout_secs(),
            embedding_backend: default_embedding_backend(),
            embedding_model: default_embedding_model(),
            local_model_dir: default_local_model_dir(),
            llm_model: default_llm_model(),
            llm_temperature: 0.0,
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            retriever_k: default_retriever_k(),
            ingestion_batch_size: default_ingestion_batch_size(),
            ingestion_max_retries: default_ingestion_max_retries(),
            ingestion_base_delay_secs: default_ingestion_base_delay_secs(),
            chat_max_retries: default_chat_max_retries(),
            chat_base_delay_secs: default_chat_base_delay_secs(),
            approximate_threshold: default_approximate_threshold(),
            approximate_enabled: true,
            ivf_nprobe: default_ivf_nprobe(),
            max_file_size_mb: default_max_file_size_mb(),
            rate_limit_uploads: default_rate_limit_uploads(),
            rate_limit_chat: default_rate_limit_chat(),
            allowed_origins: default_allowed_origins(),
            api_key: None,
            temp_dir: default_temp_dir(),
            vector_store_path: default_vector_store_path(),
            cache_dir: default_cache_dir(),
            database_url: default_database_url(),
            http_port: default_http_port(),
            environment: default_environment(),
        }
    }
}

impl Settings {
    /// Defaults, then an optional `config.*` file, then environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let settings: Settings = Config::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_overlap >= self.chunk_size {
            return Err(ConfigError::Message(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.ingestion_batch_size == 0 {
            return Err(ConfigError::Message("ingestion_batch_size must be positive".into()));
        }
        if self.ingestion_max_retries == 0 || self.chat_max_retries == 0 {
            return Err(ConfigError::Message("retry attempt counts must be positive".into()));
        }
        if self.retriever_k == 0 {
            return Err(ConfigError::Message("retriever_k must be positive".into()));
        }
        Ok(())
    }

    pub fn allowed_origins(&self) -> Vec<String> {
        self.allowed_origins
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect()
    }

    pub fn max_file_size_bytes(&self) -> usize {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }
}
