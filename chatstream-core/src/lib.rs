//! Streaming client for an OpenAI-style chat-completions endpoint.
//!
//! Request flow: `ChatClient` → `stream::fetch_sse` → `retry::RetryingFetcher`
//! → `sse::ByteChunks` → `sse::SseParser` → `accumulator::DeltaAccumulator`
//! → caller callback.

pub mod accumulator;
pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod payload;
pub mod retry;
pub mod sse;
pub mod stream;
pub mod telemetry;

pub use client::{ChatClient, ChatClientBuilder};
pub use error::{ChatStreamError, CoreResult};
