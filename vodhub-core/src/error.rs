use thiserror::Error;

/// Engine error taxonomy
///
/// Every fallible operation in the crate returns one of these kinds. The
/// string carried by each variant is safe to show to a client; transport
/// details stay in the structured logs.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Too many redirects: {0}")]
    TooManyRedirects(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Script call timed out: {0}")]
    ScriptTimeout(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Extractor error: {0}")]
    Extractor(String),

    #[error("Site not found: {0}")]
    SiteNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable kind tag used in the `{"error": "<kind>: <message>"}` wire shape.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "NetworkError",
            Self::Timeout(_) => "TimeoutError",
            Self::TooManyRedirects(_) => "TooManyRedirectsError",
            Self::Parse(_) => "ParseError",
            Self::Script(_) => "ScriptError",
            Self::ScriptTimeout(_) => "ScriptTimeout",
            Self::Config(_) => "ConfigError",
            Self::Cancelled => "CancelledError",
            Self::Extractor(_) => "ExtractorError",
            Self::SiteNotFound(_) => "SiteNotFound",
            Self::Io(_) => "IoError",
            Self::Json(_) => "ParseError",
        }
    }

    /// Whether a failed idempotent GET may be retried once.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Clone the kind and message of a shared error (for fan-out paths
    /// where the original is behind an `Arc`).
    pub fn duplicate(&self) -> Self {
        match self {
            Self::Network(m) => Self::Network(m.clone()),
            Self::Timeout(m) => Self::Timeout(m.clone()),
            Self::TooManyRedirects(m) => Self::TooManyRedirects(m.clone()),
            Self::Parse(m) => Self::Parse(m.clone()),
            Self::Script(m) => Self::Script(m.clone()),
            Self::ScriptTimeout(m) => Self::ScriptTimeout(m.clone()),
            Self::Config(m) => Self::Config(m.clone()),
            Self::Cancelled => Self::Cancelled,
            Self::Extractor(m) => Self::Extractor(m.clone()),
            Self::SiteNotFound(m) => Self::SiteNotFound(m.clone()),
            Self::Io(e) => Self::Network(e.to_string()),
            Self::Json(e) => Self::Parse(e.to_string()),
        }
    }

    /// Wire shape for clients: `{"error": "<kind>: <message>"}`.
    pub fn to_client_json(&self) -> serde_json::Value {
        serde_json::json!({ "error": format!("{}: {}", self.kind(), self) })
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_redirect() {
            Self::TooManyRedirects(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
