//! Classification of raw SSE data fields from the chat-completions stream.

use serde_json::Value;

use crate::error::{ChatStreamError, CoreResult};

/// Data field the server sends after the last delta.
pub const DONE_MARKER: &str = "[DONE]";

/// What a single SSE data field means to the accumulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// The `[DONE]` marker.
    Done,
    /// `choices[0].delta.content`, verbatim.
    ContentDelta(String),
    /// Valid JSON that carries no content: `null`, no or empty `choices`,
    /// missing or null `delta`, no `content`, or an unexpected shape.
    Other,
}

/// Classify one data field. Only text that is not JSON at all is an error.
///
/// Only `choices[0].delta.content` is inspected; the shape of any other
/// part of the chunk does not matter.
pub fn classify(data: &str) -> CoreResult<Payload> {
    if data == DONE_MARKER {
        return Ok(Payload::Done);
    }
    let value: Value =
        serde_json::from_str(data).map_err(|source| ChatStreamError::MalformedPayload {
            payload: data.to_string(),
            source,
        })?;
    let content = value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str);
    Ok(content.map_or(Payload::Other, |c| Payload::ContentDelta(c.to_string())))
}
