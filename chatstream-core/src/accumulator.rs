//! Per-request delta accumulation.
//!
//! Payloads are applied in arrival order to a small state machine:
//! blank leading fragments are dropped, everything from the first
//! non-blank fragment on is appended verbatim and forwarded to the
//! caller's callback, and `[DONE]` ends processing for the session.

use crate::error::CoreResult;
use crate::payload::{classify, Payload};

/// Callback receiving each accepted fragment.
pub type DeltaCallback<'a> = &'a mut (dyn FnMut(&str) + Send);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingFirstContent,
    Streaming,
    Done,
}

pub struct DeltaAccumulator<'a> {
    state: SessionState,
    text: String,
    fragments: u32,
    on_delta: Option<DeltaCallback<'a>>,
}

impl<'a> DeltaAccumulator<'a> {
    pub fn new(on_delta: Option<DeltaCallback<'a>>) -> Self {
        Self {
            state: SessionState::AwaitingFirstContent,
            text: String::new(),
            fragments: 0,
            on_delta,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Number of fragments forwarded so far.
    pub fn fragments(&self) -> u32 {
        self.fragments
    }

    /// Apply one SSE data field. Fails only on data that is not JSON.
    pub fn push(&mut self, data: &str) -> CoreResult<()> {
        if self.state == SessionState::Done {
            return Ok(());
        }
        match classify(data)? {
            Payload::Done => self.state = SessionState::Done,
            Payload::ContentDelta(content) => self.accept(&content),
            Payload::Other => {}
        }
        Ok(())
    }

    fn accept(&mut self, content: &str) {
        if self.state == SessionState::AwaitingFirstContent {
            if is_blank(content) {
                return;
            }
            self.state = SessionState::Streaming;
        }
        self.text.push_str(content);
        self.fragments += 1;
        if let Some(cb) = self.on_delta.as_mut() {
            cb(content);
        }
    }

    pub fn finish(self) -> String {
        self.text
    }
}

impl std::fmt::Debug for DeltaAccumulator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaAccumulator")
            .field("state", &self.state)
            .field("text", &self.text)
            .field("fragments", &self.fragments)
            .field("has_callback", &self.on_delta.is_some())
            .finish()
    }
}

/// Only newlines and spaces count as blank; tabs and other whitespace do not.
fn is_blank(s: &str) -> bool {
    s.chars().all(|c| c == '\n' || c == ' ')
}
