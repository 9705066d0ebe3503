use serde::Serialize;

/// How a single HTTP attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Response headers arrived (any status).
    Responded { status: u16 },
    /// No headers within the attempt timeout; the attempt was dropped.
    TimedOut,
    /// Network failure other than a timeout.
    Failed { message: String },
}

/// One record per HTTP attempt made by the retrying fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptTrace {
    /// 1-based attempt number within one fetch.
    pub attempt: u32,
    pub url: String,
    pub elapsed_ms: u64,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

impl AttemptTrace {
    pub fn new(attempt: u32, url: impl Into<String>, outcome: AttemptOutcome) -> Self {
        Self {
            attempt,
            url: url.into(),
            elapsed_ms: 0,
            outcome,
        }
    }

    pub fn elapsed_ms(mut self, ms: u64) -> Self {
        self.elapsed_ms = ms;
        self
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::TimedOut)
    }
}

/// Structured completion event, one per `ask`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompletionLog {
    pub model: Option<String>,
    pub latency_ms: Option<u64>,
    pub fragments: Option<u32>,
    pub chars: Option<u64>,
    pub saw_done: bool,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl CompletionLog {
    pub fn new() -> Self { Self::default() }
    pub fn model(mut self, v: &str) -> Self { self.model = Some(v.to_string()); self }
    pub fn latency_ms(mut self, v: u64) -> Self { self.latency_ms = Some(v); self }
    pub fn fragments(mut self, v: u32) -> Self { self.fragments = Some(v); self }
    pub fn chars(mut self, v: u64) -> Self { self.chars = Some(v); self }
    pub fn saw_done(mut self, v: bool) -> Self { self.saw_done = v; self }
    pub fn error(mut self, e: &crate::error::ChatStreamError) -> Self {
        self.error_kind = Some(e.kind().to_string());
        self.error_message = Some(e.to_string());
        self
    }
}
