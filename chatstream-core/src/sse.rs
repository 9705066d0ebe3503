//! Byte-stream adapter, incremental UTF-8 decoding, and the SSE frame parser.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};

use crate::error::{ChatStreamError, CoreResult};

/// Event type reported for frames that carry no `event:` field.
pub const DEFAULT_EVENT_TYPE: &str = "event";

type ByteStream = Pin<Box<dyn Stream<Item = CoreResult<Bytes>> + Send>>;

/// Pull-based view over a response body. Yields chunks until the body is
/// exhausted or fails, then only `None`. The body is released as soon as
/// it ends, or when the adapter is dropped early.
pub struct ByteChunks {
    inner: Option<ByteStream>,
}

impl ByteChunks {
    pub fn new(resp: reqwest::Response) -> Self {
        Self::from_stream(resp.bytes_stream())
    }

    pub fn from_stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<ChatStreamError>,
    {
        Self {
            inner: Some(Box::pin(stream.map(|r| r.map_err(Into::into)))),
        }
    }
}

impl Stream for ByteChunks {
    type Item = CoreResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(inner) = self.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => {
                self.inner = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.inner = None;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Decodes a byte stream chunk by chunk. A multi-byte character split across
/// chunks is held back until its remaining bytes arrive; invalid bytes
/// become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);

        let mut out = String::with_capacity(buf.len());
        let mut input = &buf[..];
        loop {
            match std::str::from_utf8(input) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    if let Ok(s) = std::str::from_utf8(&input[..valid]) {
                        out.push_str(s);
                    }
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            input = &input[valid + bad..];
                        }
                        None => {
                            self.pending = input[valid..].to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is still held back at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event_type: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser.
///
/// Text is buffered until whole lines are available, and a frame is only
/// emitted once its terminating blank line has been seen, so a frame split
/// across any number of `feed` calls comes out exactly once.
#[derive(Debug, Default)]
pub struct SseParser {
    line_buf: String,
    data_lines: Vec<String>,
    event_type: Option<String>,
    seen_first_chunk: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append decoded text and return every frame it completed.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        let chunk = if self.seen_first_chunk {
            chunk
        } else {
            // The decoder may hold back a split BOM and hand over "" first.
            if chunk.is_empty() {
                return Vec::new();
            }
            self.seen_first_chunk = true;
            chunk.strip_prefix('\u{FEFF}').unwrap_or(chunk)
        };
        self.line_buf.push_str(chunk);

        let buf = std::mem::take(&mut self.line_buf);
        let bytes = buf.as_bytes();
        let mut events = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'\n' => {
                    self.process_line(&buf[start..i], &mut events);
                    i += 1;
                    start = i;
                }
                b'\r' => {
                    // A trailing CR may be the first half of CRLF.
                    if i + 1 == bytes.len() {
                        break;
                    }
                    self.process_line(&buf[start..i], &mut events);
                    i += if bytes[i + 1] == b'\n' { 2 } else { 1 };
                    start = i;
                }
                _ => i += 1,
            }
        }
        self.line_buf = buf[start..].to_string();
        events
    }

    /// Called once the body has ended. A CR held back at the very end of
    /// the input can no longer become CRLF, so it terminates its line here.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if self.line_buf.ends_with('\r') {
            let mut line = std::mem::take(&mut self.line_buf);
            line.pop();
            self.process_line(&line, &mut events);
        }
        events
    }

    /// Drop any partially received line or frame.
    pub fn reset(&mut self) {
        if self.has_partial() {
            tracing::debug!(
                buffered = self.line_buf.len(),
                data_lines = self.data_lines.len(),
                "discarding incomplete sse frame"
            );
        }
        self.line_buf.clear();
        self.data_lines.clear();
        self.event_type = None;
        self.seen_first_chunk = false;
    }

    pub fn has_partial(&self) -> bool {
        !self.line_buf.is_empty() || !self.data_lines.is_empty() || self.event_type.is_some()
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            let event_type = self.event_type.take();
            if !self.data_lines.is_empty() {
                events.push(SseEvent {
                    event_type: event_type.unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
                    data: self.data_lines.join("\n"),
                });
                self.data_lines.clear();
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => self.data_lines.push(value.to_string()),
            "event" => self.event_type = Some(value.to_string()),
            // id / retry / unknown fields carry nothing we use
            _ => {}
        }
    }
}
