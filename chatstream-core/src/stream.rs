//! Streaming request orchestration: fetch, check status, then pump the body
//! through the byte adapter, UTF-8 decoder and SSE parser.
//!
//! Contract:
//! - A non-2xx status fails with `HttpStatus` before any data is delivered.
//! - `on_data` sees every frame's data field in arrival order.
//! - The first error from the body or from `on_data` ends the stream.
//! - A CR that ends the body terminates its line.
//! - A frame still incomplete when the body ends is discarded.

use futures_util::StreamExt;
use reqwest::Request;

use crate::error::{ChatStreamError, CoreResult};
use crate::retry::RetryingFetcher;
use crate::sse::{ByteChunks, SseParser, Utf8ChunkDecoder};

const ERROR_BODY_LIMIT: usize = 300;

pub async fn fetch_sse<F>(fetcher: &RetryingFetcher, request: Request, mut on_data: F) -> CoreResult<()>
where
    F: FnMut(&str) -> CoreResult<()>,
{
    let resp = fetcher.fetch(request).await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ChatStreamError::HttpStatus {
            status: status.as_u16(),
            body: truncate(&body, ERROR_BODY_LIMIT),
        });
    }

    let mut chunks = ByteChunks::new(resp);
    let mut decoder = Utf8ChunkDecoder::new();
    let mut parser = SseParser::new();
    let mut frames: u64 = 0;

    while let Some(chunk) = chunks.next().await {
        let text = decoder.decode(&chunk?);
        for event in parser.feed(&text) {
            frames += 1;
            on_data(&event.data)?;
        }
    }
    let tail = decoder.finish();
    let mut last = parser.feed(&tail);
    last.extend(parser.finish());
    for event in last {
        frames += 1;
        on_data(&event.data)?;
    }
    parser.reset();
    tracing::debug!(frames, "sse stream ended");
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => {
            let mut t = s[..idx].to_string();
            t.push_str("...");
            t
        }
        None => s.to_string(),
    }
}
