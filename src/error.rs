use thiserror::Error;

/// Substrings providers put in rate-limit error bodies. Only consulted when
/// the response itself carried no typed signal (status code or error code).
const RATE_LIMIT_MARKERS: [&str; 3] = ["429", "RESOURCE_EXHAUSTED", "Too Many Requests"];

/// Failures reported by the embedding / generation provider.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Provider rate limited: {0}")]
    RateLimited(String),
    #[error("Provider request failed: {status} - {body}")]
    Http { status: u16, body: String },
    #[error("Provider transport error: {0}")]
    Transport(String),
    #[error("Provider response could not be decoded: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Classify an HTTP failure. 429 is authoritative; the body text is only
    /// a fallback for gateways that wrap quota errors in other statuses.
    pub fn from_status(status: u16, body: String) -> Self {
        if status == 429 || looks_rate_limited(&body) {
            Self::RateLimited(body)
        } else {
            Self::Http { status, body }
        }
    }

    /// Classify an error message that arrived inside a streamed response.
    pub fn from_stream_message(message: String) -> Self {
        if looks_rate_limited(&message) {
            Self::RateLimited(message)
        } else {
            Self::Transport(message)
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::from_status(status.as_u16(), e.to_string()),
            None if e.is_decode() => Self::Decode(e.to_string()),
            None => Self::Transport(e.to_string()),
        }
    }
}

pub fn looks_rate_limited(text: &str) -> bool {
    RATE_LIMIT_MARKERS.iter().any(|marker| text.contains(marker))
}

/// IVF training failures. These, and only these, downgrade an index to flat search.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrainingError {
    #[error("need at least {needed} vectors to train {needed} lists, got {got}")]
    TooFewVectors { needed: usize, got: usize },
    #[error("vector {0} contains a non-finite component")]
    NonFiniteVector(usize),
    #[error("vectors have zero dimensions")]
    ZeroDimension,
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache entry {0} is incomplete")]
    Incomplete(String),
    #[error("cache entry {fingerprint} is corrupt: {reason}")]
    Corrupt { fingerprint: String, reason: String },
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors surfaced by the indexing / retrieval engine.
#[derive(Error, Debug)]
pub enum RagError {
    #[error("{0}")]
    Content(String),
    #[error("No documents indexed. Please upload a PDF first.")]
    IndexNotFound,
    #[error("Indexing already in progress")]
    IngestionInProgress,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("embedding dimension mismatch: index has {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("persisted index is unreadable: {0}")]
    CorruptIndex(String),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl RagError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Provider(e) if e.is_rate_limited())
    }
}
