use std::ops::ControlFlow;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::http_client::build_http_client_with_timeout;

const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

/// Per-call knobs. `model: None` uses the provider's default model.
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// One signal from a streaming completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Fragment(String),
    Done,
    Error(String),
}

/// Text generation service used for both replies and summaries.
///
/// `stream` hands back a receiver fed by a background task. Dropping the
/// receiver stops that task at its next send, which is how cancellation reaches
/// the upstream connection.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, messages: Vec<Message>, options: &CompletionOptions) -> Result<String>;

    async fn stream(
        &self,
        messages: Vec<Message>,
        options: &CompletionOptions,
    ) -> Result<mpsc::Receiver<StreamChunk>>;
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: String, model: String) -> Result<Self> {
        Self::with_timeout(api_url, api_key, model, None)
    }

    /// `timeout` bounds the whole request, so leave it unset for streaming use.
    pub fn with_timeout(
        api_url: String,
        api_key: String,
        model: String,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            client: build_http_client_with_timeout(timeout)?,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.api_url);
        let request = ChatCompletionRequest {
            model: options.model.as_deref().unwrap_or(&self.model),
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream,
        };

        let mut req = self.client.post(&url).json(&request);

        // Local models usually run without a key.
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }
        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for LlmClient {
    async fn complete(&self, messages: Vec<Message>, options: &CompletionOptions) -> Result<String> {
        let response = self.send(&messages, options, false).await?;
        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))
    }

    async fn stream(
        &self,
        messages: Vec<Message>,
        options: &CompletionOptions,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        let mut response = self.send(&messages, options, true).await?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut lines = SseLineBuffer::default();
            loop {
                let chunk = match response.chunk().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => {
                        // A final line may arrive without its newline.
                        if let Some(line) = lines.finish() {
                            if forward_line(&tx, &line).await.is_break() {
                                return;
                            }
                        }
                        // Reaching EOF here means no [DONE] or finish_reason was
                        // seen, so the text so far may be cut short.
                        let _ = tx
                            .send(StreamChunk::Error(
                                "upstream closed before completion".to_string(),
                            ))
                            .await;
                        return;
                    }
                    Err(error) => {
                        let _ = tx
                            .send(StreamChunk::Error(format!("stream read failed: {}", error)))
                            .await;
                        return;
                    }
                };

                for line in lines.push(&chunk) {
                    if forward_line(&tx, &line).await.is_break() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Send the signals of one SSE line. Breaks once a terminal signal went out
/// or the receiver is gone.
async fn forward_line(tx: &mpsc::Sender<StreamChunk>, line: &str) -> ControlFlow<()> {
    for signal in parse_sse_line(line) {
        let terminal = !matches!(signal, StreamChunk::Fragment(_));
        if tx.send(signal).await.is_err() {
            tracing::debug!("Stream receiver dropped; closing upstream connection");
            return ControlFlow::Break(());
        }
        if terminal {
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

/// Splits a byte stream into complete lines without breaking UTF-8 sequences
/// that straddle network chunks.
#[derive(Debug, Default)]
struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(newline_idx) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline_idx).collect();
            lines.push(String::from_utf8_lossy(&line).trim().to_string());
        }
        lines
    }

    /// Whatever is left once the stream hits EOF.
    fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!rest.is_empty()).then_some(rest)
    }
}

/// Interprets one SSE line of an OpenAI-style completion stream. A single
/// chunk may carry both the last delta and its `finish_reason`.
fn parse_sse_line(line: &str) -> Vec<StreamChunk> {
    if line.is_empty() || line.starts_with(':') {
        return Vec::new();
    }
    let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
        return Vec::new();
    };
    if payload == "[DONE]" {
        return vec![StreamChunk::Done];
    }

    let chunk_json: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(error) => {
            return vec![StreamChunk::Error(format!(
                "Failed to parse stream payload: {} ({})",
                payload, error
            ))]
        }
    };

    if let Some(error) = chunk_json.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return vec![StreamChunk::Error(message)];
    }

    let Some(choice) = chunk_json["choices"].as_array().and_then(|arr| arr.first()) else {
        return Vec::new();
    };
    let mut signals = Vec::new();
    let delta = choice["delta"]["content"].as_str().unwrap_or_default();
    if !delta.is_empty() {
        signals.push(StreamChunk::Fragment(delta.to_string()));
    }
    if choice["finish_reason"].is_string() {
        signals.push(StreamChunk::Done);
    }
    signals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_joins_split_multibyte_characters() {
        let mut buffer = SseLineBuffer::default();
        let bytes = "data: {\"x\":\"é\"}\n".as_bytes();
        let split = bytes.iter().position(|b| *b == 0xc3).expect("multibyte lead") + 1;

        assert!(buffer.push(&bytes[..split]).is_empty());
        let lines = buffer.push(&bytes[split..]);
        assert_eq!(lines, vec!["data: {\"x\":\"é\"}".to_string()]);
    }

    #[test]
    fn sse_lines_map_to_stream_signals() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#),
            vec![StreamChunk::Fragment("Hel".to_string())]
        );
        assert_eq!(parse_sse_line("data: [DONE]"), vec![StreamChunk::Done]);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#),
            vec![StreamChunk::Done]
        );
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"lo."},"finish_reason":"stop"}]}"#),
            vec![StreamChunk::Fragment("lo.".to_string()), StreamChunk::Done]
        );
        assert!(parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).is_empty());
        assert!(parse_sse_line(": keep-alive").is_empty());
        assert!(parse_sse_line("event: ping").is_empty());
        assert!(matches!(
            parse_sse_line(r#"data: {"error":{"message":"rate limited"}}"#).as_slice(),
            [StreamChunk::Error(msg)] if msg == "rate limited"
        ));
        assert!(matches!(
            parse_sse_line("data: {not json").as_slice(),
            [StreamChunk::Error(_)]
        ));
    }

    /// Serve one canned SSE reply on a local socket, then close it.
    async fn serve_once(body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            // Read the whole request before answering so closing does not reset it.
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.expect("read");
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + length {
                        break;
                    }
                }
            }
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";
            socket.write_all(head.as_bytes()).await.expect("write head");
            socket.write_all(body.as_bytes()).await.expect("write body");
            socket.shutdown().await.expect("shutdown");
        });
        format!("http://{}", addr)
    }

    async fn collect(rx: &mut mpsc::Receiver<StreamChunk>) -> Vec<StreamChunk> {
        let mut signals = Vec::new();
        while let Some(signal) = rx.recv().await {
            signals.push(signal);
        }
        signals
    }

    #[tokio::test]
    async fn stream_cut_before_completion_is_an_error() {
        let url = serve_once("data: {\"choices\":[{\"delta\":{\"content\":\"The answer is\"}}]}\n\n").await;
        let client = LlmClient::new(url, String::new(), "m".to_string()).expect("client");
        let mut rx = client
            .stream(vec![Message::user("q")], &CompletionOptions::default())
            .await
            .expect("stream");

        let signals = collect(&mut rx).await;
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0], StreamChunk::Fragment("The answer is".to_string()));
        assert!(matches!(&signals[1], StreamChunk::Error(msg) if msg.contains("before completion")));
    }

    #[tokio::test]
    async fn stream_with_done_marker_completes() {
        let url = serve_once(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]",
        )
        .await;
        let client = LlmClient::new(url, String::new(), "m".to_string()).expect("client");
        let mut rx = client
            .stream(vec![Message::user("q")], &CompletionOptions::default())
            .await
            .expect("stream");

        assert_eq!(
            collect(&mut rx).await,
            vec![StreamChunk::Fragment("Hi".to_string()), StreamChunk::Done]
        );
    }

    #[test]
    fn request_omits_stream_flag_when_not_streaming() {
        let messages = vec![Message::user("hi")];
        let body = serde_json::to_value(ChatCompletionRequest {
            model: "m",
            messages: &messages,
            temperature: Some(0.2),
            max_tokens: None,
            stream: false,
        })
        .expect("serialize");
        assert!(body.get("stream").is_none());
        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["messages"][0]["role"], "user");
    }
}
