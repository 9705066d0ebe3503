use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Request};
use serde::Serialize;
use tokio::time::Instant;
use tracing::field::Empty;
use tracing_futures::Instrument;

use crate::accumulator::{DeltaAccumulator, DeltaCallback, SessionState};
use crate::config::{Config, HttpCfg, RequestConfig, DEFAULT_BASE_URL};
use crate::error::{ChatStreamError, CoreResult};
use crate::model::{ChatMessage, Conversation};
use crate::retry::{RetryPolicy, RetryingFetcher};
use crate::stream::fetch_sse;
use crate::telemetry::{default_sink, CompletionLog, TelemetrySink};

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Streaming chat-completions client.
///
/// Cheap to clone; clones share the HTTP pool and the immutable
/// `RequestConfig`. Every call runs its own accumulation state, so calls
/// may be issued concurrently.
#[derive(Clone)]
pub struct ChatClient {
    fetcher: RetryingFetcher,
    config: Arc<RequestConfig>,
    endpoint: String,
    user_agent: String,
    sink: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("endpoint", &self.endpoint)
            .field("config", &self.config)
            .field("fetcher", &self.fetcher)
            .finish_non_exhaustive()
    }
}

// ---- Wire struct ----
#[derive(Serialize)]
struct CompletionReq<'a> {
    stream: bool,
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
    messages: &'a [ChatMessage],
}

struct Completion {
    text: String,
    fragments: u32,
    saw_done: bool,
}

pub struct ChatClientBuilder {
    config: RequestConfig,
    base_url: String,
    http: HttpCfg,
    retry: RetryPolicy,
    sink: Option<Arc<dyn TelemetrySink>>,
    client: Option<Client>,
}

impl ChatClientBuilder {
    /// Scheme and host of the API, e.g. `https://api.openai.com`.
    pub fn base_url(mut self, base: impl Into<String>) -> Self {
        self.base_url = base.into();
        self
    }

    pub fn http_cfg(mut self, http: HttpCfg) -> Self {
        self.http = http;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use a preconfigured reqwest client; `http_cfg` is then ignored.
    pub fn http_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> CoreResult<ChatClient> {
        if self.retry.attempt_timeout.is_zero() {
            return Err(ChatStreamError::Validation(
                "attempt timeout must be greater than zero".into(),
            ));
        }
        let multiplier = self.retry.backoff.multiplier;
        if !(multiplier.is_finite() && multiplier >= 1.0) {
            return Err(ChatStreamError::Validation(format!(
                "backoff multiplier must be >= 1.0, got {multiplier}"
            )));
        }
        let http = match self.client {
            Some(c) => c,
            None => {
                let mut b = Client::builder()
                    .connect_timeout(Duration::from_millis(self.http.connect_timeout_ms));
                if let Some(n) = self.http.pool_max_idle_per_host {
                    b = b.pool_max_idle_per_host(n);
                }
                b.build().map_err(|e| {
                    ChatStreamError::Other(anyhow::anyhow!("http client build failed: {e}"))
                })?
            }
        };
        let sink = self.sink.unwrap_or_else(default_sink);
        Ok(ChatClient {
            fetcher: RetryingFetcher::new(http, self.retry, sink.clone()),
            config: Arc::new(self.config),
            endpoint: format!("{}{}", self.base_url.trim_end_matches('/'), CHAT_COMPLETIONS_PATH),
            user_agent: format!("chatstream/{}", env!("CARGO_PKG_VERSION")),
            sink,
        })
    }
}

impl ChatClient {
    /// Client with default model, sampling parameters and retry policy.
    pub fn new(api_key: impl Into<String>) -> CoreResult<Self> {
        Self::builder(RequestConfig::new(api_key)).build()
    }

    pub fn builder(config: RequestConfig) -> ChatClientBuilder {
        ChatClientBuilder {
            config,
            base_url: DEFAULT_BASE_URL.to_string(),
            http: HttpCfg::default(),
            retry: RetryPolicy::default(),
            sink: None,
            client: None,
        }
    }

    /// Build from a loaded config file; the API key comes from `cfg.api_key_env`.
    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        Self::builder(cfg.request_config()?)
            .base_url(cfg.base_url.clone())
            .http_cfg(cfg.http.clone())
            .retry_policy(cfg.retry_policy()?)
            .build()
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests(server_base: &str, sink: Arc<dyn TelemetrySink>) -> Self {
        Self::builder(RequestConfig::new("test-key"))
            .base_url(server_base)
            .telemetry_sink(sink)
            .build()
            .unwrap()
    }

    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Ask a single question with no prior turns. Each accepted fragment
    /// goes to `on_delta`; the full answer is returned once the stream ends.
    pub async fn ask(&self, question: &str, on_delta: Option<DeltaCallback<'_>>) -> CoreResult<String> {
        self.fetch(&[ChatMessage::user(question)], on_delta).await
    }

    /// Ask within a caller-managed conversation. The history is sent ahead of
    /// the question; on success both the question and the answer are
    /// appended, on failure the conversation is left untouched.
    pub async fn ask_in(
        &self,
        conversation: &mut Conversation,
        question: &str,
        on_delta: Option<DeltaCallback<'_>>,
    ) -> CoreResult<String> {
        let messages = conversation.with_question(question);
        let answer = self.fetch(&messages, on_delta).await?;
        conversation.record_turn(question, answer.clone());
        Ok(answer)
    }

    /// Like `ask`, but gives up with `Cancelled` as soon as `cancel` completes.
    /// The in-flight request and body stream are dropped.
    pub async fn ask_until<C>(
        &self,
        question: &str,
        on_delta: Option<DeltaCallback<'_>>,
        cancel: C,
    ) -> CoreResult<String>
    where
        C: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = cancel => {
                tracing::debug!("ask cancelled by caller");
                Err(ChatStreamError::Cancelled)
            }
            res = self.ask(question, on_delta) => res,
        }
    }

    async fn fetch(&self, messages: &[ChatMessage], on_delta: Option<DeltaCallback<'_>>) -> CoreResult<String> {
        let span = tracing::info_span!(
            "chat.ask",
            llm.model = %self.config.model,
            messages = messages.len(),
            fragments = Empty,
            chars = Empty,
        );
        let started = Instant::now();
        let result = self
            .stream_completion(messages, on_delta)
            .instrument(span.clone())
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let log = CompletionLog::new().model(&self.config.model).latency_ms(latency_ms);

        match result {
            Ok(c) => {
                let chars = c.text.chars().count() as u64;
                span.record("fragments", c.fragments);
                span.record("chars", chars);
                self.sink.record_completion(
                    log.fragments(c.fragments).chars(chars).saw_done(c.saw_done),
                );
                Ok(c.text)
            }
            Err(e) => {
                self.sink.record_completion(log.error(&e));
                Err(e)
            }
        }
    }

    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
        on_delta: Option<DeltaCallback<'_>>,
    ) -> CoreResult<Completion> {
        let request = self.build_request(messages)?;
        let mut acc = DeltaAccumulator::new(on_delta);
        fetch_sse(&self.fetcher, request, |data| acc.push(data)).await?;
        let saw_done = acc.state() == SessionState::Done;
        let fragments = acc.fragments();
        Ok(Completion {
            text: acc.finish(),
            fragments,
            saw_done,
        })
    }

    fn build_request(&self, messages: &[ChatMessage]) -> CoreResult<Request> {
        let cfg = &self.config;
        let body = CompletionReq {
            stream: true,
            model: &cfg.model,
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            frequency_penalty: cfg.frequency_penalty,
            presence_penalty: cfg.presence_penalty,
            messages,
        };
        self.fetcher
            .http()
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, cfg.bearer())
            .header(ACCEPT, "text/event-stream")
            .header(USER_AGENT, &self.user_agent)
            .json(&body)
            .build()
            .map_err(|e| ChatStreamError::Validation(format!("invalid request: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use crate::telemetry::test_span::install_capture;
    use crate::telemetry::{AttemptOutcome, NoopSink, RecordingSink};
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    const PATH: &str = "/v1/chat/completions";

    fn sse_body(fragments: &[&str]) -> String {
        let mut body = String::new();
        for f in fragments {
            let data = json!({"choices": [{"delta": {"content": f}}]});
            body.push_str(&format!("data: {data}\n\n"));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn noop() -> Arc<dyn TelemetrySink> {
        Arc::new(NoopSink)
    }

    #[test]
    fn default_client_targets_openai() {
        let client = ChatClient::new("sk-x").unwrap();
        assert_eq!(client.endpoint(), "https://api.openai.com/v1/chat/completions");
        assert_eq!(client.config().model, "gpt-3.5-turbo");
    }

    #[test]
    fn zero_attempt_timeout_is_rejected() {
        let err = ChatClient::builder(RequestConfig::new("k"))
            .retry_policy(RetryPolicy::forever(Duration::ZERO))
            .build()
            .unwrap_err();
        assert!(matches!(err, ChatStreamError::Validation(_)));
    }

    #[test]
    fn shrinking_backoff_multiplier_is_rejected() {
        for multiplier in [-2.0, 0.5, f64::NAN, f64::INFINITY] {
            let backoff = Backoff {
                initial: Duration::from_millis(10),
                multiplier,
                max: Duration::from_secs(1),
            };
            let err = ChatClient::builder(RequestConfig::new("k"))
                .retry_policy(RetryPolicy::default().with_backoff(backoff))
                .build()
                .unwrap_err();
            assert!(matches!(err, ChatStreamError::Validation(_)), "multiplier {multiplier}");
        }
    }

    #[tokio::test]
    async fn ask_sends_full_body_and_streams_deltas() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path(PATH)
                .header("authorization", "Bearer test-key")
                .header("content-type", "application/json")
                .json_body(json!({
                    "stream": true,
                    "model": "gpt-3.5-turbo",
                    "max_tokens": 2048,
                    "temperature": 0.0,
                    "top_p": 1.0,
                    "frequency_penalty": 0.2,
                    "presence_penalty": 0.1,
                    "messages": [{"role": "user", "content": "Hi"}]
                }));
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body(&["\n", " ", "Hello", " world"]));
        });

        let client = ChatClient::new_for_tests(&server.base_url(), noop());
        let mut seen = Vec::new();
        let mut cb = |d: &str| seen.push(d.to_string());
        let text = client.ask("Hi", Some(&mut cb)).await.expect("ask ok");
        assert_eq!(text, "Hello world");
        assert_eq!(seen, vec!["Hello", " world"]);
        m.assert();
    }

    #[tokio::test]
    async fn ask_without_callback_returns_text() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path(PATH);
            then.status(200).body(sse_body(&["a", "b"]));
        });
        let client = ChatClient::new_for_tests(&server.base_url(), noop());
        assert_eq!(client.ask("q", None).await.unwrap(), "ab");
    }

    #[tokio::test]
    async fn noise_payloads_are_skipped() {
        let server = MockServer::start();
        let body = concat!(
            "data: {\"choices\":[]}\n\n",
            "data: {\"choices\":[{\"delta\":null}]}\n\n",
            "data: null\n\n",
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let _m = server.mock(|when, then| {
            when.method(POST).path(PATH);
            then.status(200).body(body);
        });
        let client = ChatClient::new_for_tests(&server.base_url(), noop());
        assert_eq!(client.ask("q", None).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn text_is_returned_even_without_done_marker() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path(PATH);
            then.status(200)
                .body("data: {\"choices\":[{\"delta\":{\"content\":\"cut\"}}]}\n\n");
        });
        let sink = Arc::new(RecordingSink::default());
        let client = ChatClient::new_for_tests(&server.base_url(), sink.clone());
        assert_eq!(client.ask("q", None).await.unwrap(), "cut");
        let logs = sink.completions();
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].saw_done);
    }

    #[tokio::test]
    async fn status_401_rejects_without_deltas() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST).path(PATH);
            then.status(401).body("{\"error\":{\"message\":\"Incorrect API key\"}}");
        });
        let sink = Arc::new(RecordingSink::default());
        let client = ChatClient::new_for_tests(&server.base_url(), sink.clone());
        let mut calls = 0;
        let mut cb = |_: &str| calls += 1;
        let err = client.ask("Hi", Some(&mut cb)).await.unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert!(matches!(err, ChatStreamError::HttpStatus { .. }));
        assert_eq!(calls, 0);
        m.assert_hits(1);
        let logs = sink.completions();
        assert_eq!(logs[0].error_kind.as_deref(), Some("http_status"));
    }

    #[tokio::test]
    async fn malformed_payload_rejects() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path(PATH);
            then.status(200).body("data: {\"choices\":\n\n");
        });
        let client = ChatClient::new_for_tests(&server.base_url(), noop());
        let err = client.ask("q", None).await.unwrap_err();
        assert!(matches!(err, ChatStreamError::MalformedPayload { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn network_failure_rejects_instead_of_hanging() {
        let client = ChatClient::new_for_tests("http://127.0.0.1:9", noop());
        let err = client.ask("q", None).await.unwrap_err();
        assert!(matches!(err, ChatStreamError::Transport { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn ask_in_sends_history_and_records_turn() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path(PATH)
                .json_body_partial(
                    r#"{"messages":[{"role":"system","content":"Answer in Korean"},{"role":"user","content":"Hi"}]}"#,
                );
            then.status(200).body(sse_body(&["안녕"]));
        });
        let client = ChatClient::new_for_tests(&server.base_url(), noop());
        let mut conv = Conversation::with_system("Answer in Korean");
        let answer = client.ask_in(&mut conv, "Hi", None).await.unwrap();
        assert_eq!(answer, "안녕");
        m.assert();
        assert_eq!(conv.len(), 3);
        assert_eq!(conv.messages()[2], ChatMessage::assistant("안녕"));
    }

    #[tokio::test]
    async fn ask_in_failure_leaves_conversation_untouched() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path(PATH);
            then.status(500).body("down");
        });
        let client = ChatClient::new_for_tests(&server.base_url(), noop());
        let mut conv = Conversation::new();
        assert!(client.ask_in(&mut conv, "Hi", None).await.is_err());
        assert!(conv.is_empty());
    }

    #[tokio::test]
    async fn ask_until_cancels_slow_request() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path(PATH);
            then.status(200).delay(Duration::from_secs(3)).body(sse_body(&["late"]));
        });
        let client = ChatClient::builder(RequestConfig::new("k"))
            .base_url(server.base_url())
            .retry_policy(RetryPolicy::forever(Duration::from_secs(10)))
            .telemetry_sink(noop())
            .build()
            .unwrap();
        let err = client
            .ask_until("q", None, tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatStreamError::Cancelled));
    }

    #[tokio::test]
    async fn concurrent_asks_do_not_share_state() {
        let server = MockServer::start();
        let _a = server.mock(|when, then| {
            when.method(POST).path(PATH).body_contains("first");
            then.status(200).body(sse_body(&["one", "1"]));
        });
        let _b = server.mock(|when, then| {
            when.method(POST).path(PATH).body_contains("second");
            then.status(200).body(sse_body(&["two", "2"]));
        });
        let client = ChatClient::new_for_tests(&server.base_url(), noop());
        let other = client.clone();
        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        let mut cb_a = |d: &str| seen_a.push(d.to_string());
        let mut cb_b = |d: &str| seen_b.push(d.to_string());
        let (a, b) = tokio::join!(
            client.ask("first", Some(&mut cb_a)),
            other.ask("second", Some(&mut cb_b)),
        );
        assert_eq!(a.unwrap(), "one1");
        assert_eq!(b.unwrap(), "two2");
        assert_eq!(seen_a, vec!["one", "1"]);
        assert_eq!(seen_b, vec!["two", "2"]);
    }

    #[tokio::test]
    async fn ask_span_records_model_and_counts() {
        let (store, _guard) = install_capture();
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path(PATH);
            then.status(200).body(sse_body(&["ab", "c"]));
        });
        let sink = Arc::new(RecordingSink::default());
        let client = ChatClient::new_for_tests(&server.base_url(), sink.clone());
        client.ask("q", None).await.unwrap();

        let fields = store.fields_of("chat.ask").expect("chat.ask span");
        assert_eq!(fields.get("llm.model").map(String::as_str), Some("gpt-3.5-turbo"));
        assert_eq!(fields.get("fragments").map(String::as_str), Some("2"));
        assert_eq!(fields.get("chars").map(String::as_str), Some("3"));

        let logs = sink.completions();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].fragments, Some(2));
        assert!(logs[0].saw_done);
        let attempts = sink.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Responded { status: 200 });
    }

    mod scripted {
        //! Raw TCP server that stalls the first connection and answers the second.
        use super::*;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};

        struct Captured {
            request_line: String,
            body: String,
        }

        async fn read_request(sock: &mut TcpStream) -> Captured {
            let mut buf = Vec::new();
            let mut tmp = [0u8; 4096];
            loop {
                let n = sock.read(&mut tmp).await.unwrap();
                assert!(n > 0, "client closed before sending a full request");
                buf.extend_from_slice(&tmp[..n]);
                let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                    continue;
                };
                let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
                let len = head
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                let body_start = head_end + 4;
                if buf.len() >= body_start + len {
                    return Captured {
                        request_line: head.lines().next().unwrap_or_default().to_string(),
                        body: String::from_utf8_lossy(&buf[body_start..body_start + len]).into_owned(),
                    };
                }
            }
        }

        #[tokio::test]
        async fn timeout_triggers_one_identical_retry() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let server = tokio::spawn(async move {
                let (mut stalled, _) = listener.accept().await.unwrap();
                let first = read_request(&mut stalled).await;
                let (mut conn, _) = listener.accept().await.unwrap();
                let second = read_request(&mut conn).await;
                let body = sse_body(&["Hi", " there"]);
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                conn.write_all(resp.as_bytes()).await.unwrap();
                conn.shutdown().await.ok();
                drop(stalled);
                (first, second)
            });

            let sink = Arc::new(RecordingSink::default());
            let client = ChatClient::builder(RequestConfig::new("k"))
                .base_url(format!("http://{addr}"))
                .retry_policy(RetryPolicy::forever(Duration::from_millis(200)))
                .telemetry_sink(sink.clone())
                .build()
                .unwrap();
            let text = client.ask("retry me", None).await.expect("ask ok");
            assert_eq!(text, "Hi there");

            let (first, second) = server.await.unwrap();
            assert_eq!(first.request_line, "POST /v1/chat/completions HTTP/1.1");
            assert_eq!(first.request_line, second.request_line);
            assert_eq!(first.body, second.body);
            assert!(first.body.contains("retry me"));

            let attempts = sink.attempts();
            assert_eq!(attempts.len(), 2);
            assert!(attempts[0].is_timeout());
            assert_eq!(attempts[1].outcome, AttemptOutcome::Responded { status: 200 });
            assert_eq!(attempts[0].url, attempts[1].url);
        }
    }
}
