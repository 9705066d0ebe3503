use thiserror::Error;

/// Core error type for chatstream.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum ChatStreamError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// Network-level failure other than an attempt timeout.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The server answered, but not with a 2xx status. Never retried.
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// A non-`[DONE]` SSE data field that is not valid JSON.
    #[error("malformed sse payload {payload:?}: {source}")]
    MalformedPayload {
        payload: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("gave up after {attempts} attempts ({elapsed_ms} ms)")]
    RetriesExhausted { attempts: u32, elapsed_ms: u64 },

    #[error("request cancelled by caller")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChatStreamError {
    /// Short stable label used in telemetry records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Transport { .. } => "transport",
            Self::HttpStatus { .. } => "http_status",
            Self::MalformedPayload { .. } => "malformed_payload",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }

    /// Status code carried by an `HttpStatus` error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ChatStreamError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport {
            message: e.to_string(),
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, ChatStreamError>;
