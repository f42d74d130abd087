use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{multipart, Client, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

use crate::config::LlmConfig;
use crate::models::chat::{ChatCompletion, ChatMessage, ChatRequest, TokenUsage};
use crate::services::chat_client::{ChatClient, TextStream};
use crate::utils::error::CoreError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    model: String,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageBody>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UsageBody {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<UsageBody> for TokenUsage {
    fn from(usage: UsageBody) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChoiceChunk>,
}

#[derive(Debug, Deserialize)]
struct ChoiceChunk {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionBody {
    text: String,
}

/// One meaningful line of an SSE completion stream
#[derive(Debug, PartialEq)]
enum SseEvent {
    Delta(String),
    Done,
}

/// Parse a single SSE line. Comments, blank lines, events without text and
/// malformed payloads yield `None`.
fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let data = line.strip_prefix("data:")?.trim_start();

    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }

    let chunk: ChatCompletionChunk = serde_json::from_str(data).ok()?;
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|content| !content.is_empty())
        .map(SseEvent::Delta)
}

/// Client for an OpenAI-compatible chat completion and transcription API (Groq)
#[derive(Clone)]
pub struct LlmService {
    client: Client,
    config: LlmConfig,
    api_key: String,
    timeout: Duration,
}

impl LlmService {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let api_key = config.api_key()?.to_string();
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            timeout: Duration::from_secs(config.timeout_seconds),
            config,
            api_key,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post_completion(&self, request: &ChatRequest, stream: bool) -> Result<Response, CoreError> {
        let body = ChatCompletionBody {
            model: &self.config.model,
            messages: &request.messages,
            max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
            temperature: request.temperature.unwrap_or(self.config.temperature),
            stream,
        };

        let mut builder = self
            .client
            .post(self.endpoint("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body);
        // Streams may legitimately outlive the request timeout
        if !stream {
            builder = builder.timeout(self.timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| CoreError::Upstream(format!("Failed to call LLM API: {}", e)))?;

        ensure_success(response).await
    }
}

async fn ensure_success(response: Response) -> Result<Response, CoreError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    error!(%status, "LLM API returned error");
    Err(CoreError::Upstream(format!("LLM API error: {} - {}", status, body)))
}

#[async_trait]
impl ChatClient for LlmService {
    async fn chat(&self, request: ChatRequest) -> Result<ChatCompletion, CoreError> {
        debug!("Starting chat generation with {} messages", request.messages.len());

        let response = self.post_completion(&request, false).await?;
        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Upstream(format!("Failed to parse LLM response: {}", e)))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or_else(|| CoreError::Upstream("No choices returned from LLM".to_string()))?;

        Ok(ChatCompletion {
            content,
            model: completion.model,
            usage: completion.usage.unwrap_or_default().into(),
        })
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<TextStream, CoreError> {
        debug!("Starting chat stream with {} messages", request.messages.len());

        let response = self.post_completion(&request, true).await?;
        let mut bytes = response.bytes_stream();

        let stream = async_stream::stream! {
            // SSE lines can be split across network chunks
            let mut buffer: Vec<u8> = Vec::new();
            let mut done = false;

            'read: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(CoreError::Upstream(format!("Stream error: {}", e)));
                        done = true;
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match parse_sse_line(String::from_utf8_lossy(&line).trim_end()) {
                        Some(SseEvent::Delta(text)) => yield Ok(text),
                        Some(SseEvent::Done) => {
                            done = true;
                            break 'read;
                        }
                        None => {}
                    }
                }
            }

            if !done {
                if let Some(SseEvent::Delta(text)) =
                    parse_sse_line(String::from_utf8_lossy(&buffer).trim_end())
                {
                    yield Ok(text);
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn transcribe(&self, audio: Bytes, file_name: String) -> Result<String, CoreError> {
        debug!(bytes = audio.len(), file_name = %file_name, "Starting transcription");

        let part = multipart::Part::bytes(audio.to_vec()).file_name(file_name);
        let mut form = multipart::Form::new()
            .part("file", part)
            .text("model", self.config.transcription_model.clone())
            .text("response_format", "json");
        if let Some(language) = &self.config.transcription_language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post(self.endpoint("audio/transcriptions"))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| CoreError::Upstream(format!("Failed to call transcription API: {}", e)))?;

        let body: TranscriptionBody = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|e| CoreError::Upstream(format!("Failed to parse transcription: {}", e)))?;

        Ok(body.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service_for(server: &MockServer) -> LlmService {
        LlmService::new(LlmConfig {
            base_url: server.uri(),
            api_key: Some("test-key".to_string()),
            ..LlmConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_new_requires_api_key() {
        assert!(LlmService::new(LlmConfig::default()).is_err());
    }

    #[test]
    fn test_parse_sse_line() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#),
            Some(SseEvent::Delta("Hi".to_string()))
        );
        assert_eq!(parse_sse_line("data: [DONE]"), Some(SseEvent::Done));
        assert_eq!(parse_sse_line(r#"data: {"choices":[{"delta":{}}]}"#), None);
        assert_eq!(parse_sse_line(": keep-alive"), None);
        assert_eq!(parse_sse_line(""), None);
        assert_eq!(parse_sse_line("data: not json"), None);
    }

    #[tokio::test]
    async fn test_chat_returns_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({
                "model": "llama-3.3-70b-versatile",
                "stream": false,
                "max_tokens": 5,
                "messages": [{"role": "user", "content": "ping"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "llama-3.3-70b-versatile",
                "choices": [{"message": {"role": "assistant", "content": "pong"}}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let completion = service_for(&server).chat(ChatRequest::probe()).await.unwrap();

        assert_eq!(completion.content, "pong");
        assert_eq!(completion.model, "llama-3.3-70b-versatile");
        assert_eq!(completion.usage.total_tokens, 4);
    }

    #[tokio::test]
    async fn test_chat_error_status_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = service_for(&server).chat(ChatRequest::probe()).await.unwrap_err();

        match err {
            CoreError::Upstream(msg) => assert!(msg.contains("overloaded")),
            other => panic!("expected upstream error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chat_without_choices_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"model": "m", "choices": []})),
            )
            .mount(&server)
            .await;

        let result = service_for(&server).chat(ChatRequest::probe()).await;
        assert!(matches!(result, Err(CoreError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_chat_stream_yields_deltas() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Good \"}}]}\n\n",
            ": keep-alive\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"evening, sir.\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&server)
            .await;

        let stream = service_for(&server)
            .chat_stream(ChatRequest::new(vec![ChatMessage::user("hello")]))
            .await
            .unwrap();
        let chunks: Vec<String> = stream.try_collect().await.unwrap();

        assert_eq!(chunks, vec!["Good ", "evening, sir."]);
    }

    #[tokio::test]
    async fn test_transcribe_posts_multipart() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/audio/transcriptions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"text": " Hello JARVIS "})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let text = service_for(&server)
            .transcribe(Bytes::from_static(b"RIFFfake"), "audio.webm".to_string())
            .await
            .unwrap();

        assert_eq!(text, " Hello JARVIS ");

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("whisper-large-v3"));
        assert!(body.contains("filename=\"audio.webm\""));
    }
}
