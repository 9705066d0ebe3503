//! Observability hook for the streaming client.
//!
//! A `TelemetrySink` is injected into `ChatClient`; nothing here is global
//! state. The default sink forwards records to `tracing`.

pub mod types;
#[cfg(test)]
pub mod test_span;

pub use types::*;

use std::sync::Arc;

use once_cell::sync::Lazy;

/// Implement this to receive telemetry events.
///
/// Implementations must be thread-safe; records may arrive from concurrent
/// `ask` calls. Keep overhead minimal, `record_attempt` sits on the request path.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record_attempt(&self, _trace: AttemptTrace) {}

    fn record_completion(&self, _log: CompletionLog) {}
}

/// Drops every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {}

/// Forwards records to `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record_attempt(&self, trace: AttemptTrace) {
        match &trace.outcome {
            AttemptOutcome::TimedOut => tracing::warn!(
                attempt = trace.attempt,
                url = %trace.url,
                elapsed_ms = trace.elapsed_ms,
                "no response headers before timeout, retrying"
            ),
            AttemptOutcome::Responded { status } => tracing::debug!(
                attempt = trace.attempt,
                url = %trace.url,
                elapsed_ms = trace.elapsed_ms,
                status,
                "response headers received"
            ),
            AttemptOutcome::Failed { message } => tracing::warn!(
                attempt = trace.attempt,
                url = %trace.url,
                elapsed_ms = trace.elapsed_ms,
                error = %message,
                "request failed"
            ),
        }
    }

    fn record_completion(&self, log: CompletionLog) {
        match &log.error_kind {
            None => tracing::debug!(
                model = log.model.as_deref().unwrap_or(""),
                latency_ms = log.latency_ms.unwrap_or(0),
                fragments = log.fragments.unwrap_or(0),
                chars = log.chars.unwrap_or(0),
                saw_done = log.saw_done,
                "completion finished"
            ),
            Some(kind) => tracing::warn!(
                model = log.model.as_deref().unwrap_or(""),
                latency_ms = log.latency_ms.unwrap_or(0),
                error.kind = %kind,
                error.message = log.error_message.as_deref().unwrap_or(""),
                "completion failed"
            ),
        }
    }
}

static DEFAULT_SINK: Lazy<Arc<dyn TelemetrySink>> = Lazy::new(|| Arc::new(TracingSink));

/// Shared `TracingSink` handed to clients that were not given a sink.
pub fn default_sink() -> Arc<dyn TelemetrySink> {
    DEFAULT_SINK.clone()
}

/// Test sink that keeps every record in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub attempts: std::sync::Mutex<Vec<AttemptTrace>>,
    pub completions: std::sync::Mutex<Vec<CompletionLog>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn attempts(&self) -> Vec<AttemptTrace> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn completions(&self) -> Vec<CompletionLog> {
        self.completions.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl TelemetrySink for RecordingSink {
    fn record_attempt(&self, trace: AttemptTrace) {
        self.attempts.lock().unwrap().push(trace);
    }

    fn record_completion(&self, log: CompletionLog) {
        self.completions.lock().unwrap().push(log);
    }
}
