//! OpenAI-compatible streaming provider
//!
//! Works against any endpoint exposing `POST {base_url}/chat/completions`
//! with server-sent events, which covers OpenAI itself and the hosted
//! open-model gateways (NVIDIA, Together, OpenRouter, local vLLM).

use aidev_core::domain::provider::ProviderId;
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProviderError;
use crate::provider::{ChatMessage, Chunk, ChunkStream, CompletionProvider, CompletionRequest};

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: WireDelta,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    total_tokens: u64,
}

/// Streaming client for one model on an OpenAI-compatible endpoint
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    id: ProviderId,
    base_url: String,
    api_key: String,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(id: ProviderId, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::with_client(id, base_url, api_key, Client::new())
    }

    pub fn with_client(
        id: ProviderId,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        client: Client,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            id,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Parses one SSE `data:` payload; `None` for the `[DONE]` sentinel
fn parse_event(data: &str) -> Result<Option<Vec<Chunk>>, ProviderError> {
    if data == "[DONE]" {
        return Ok(None);
    }
    let chunk: WireChunk = serde_json::from_str(data)
        .map_err(|e| ProviderError::Malformed(format!("bad stream event: {}", e)))?;

    let mut out = Vec::new();
    for choice in chunk.choices {
        if let Some(text) = choice.delta.content {
            if !text.is_empty() {
                out.push(Chunk::Text(text));
            }
        }
    }
    if let Some(usage) = chunk.usage {
        out.push(Chunk::Usage {
            total_tokens: usage.total_tokens,
        });
    }
    Ok(Some(out))
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = WireRequest {
            model: &self.id.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        };

        debug!("POST {} model={}", url, self.id.model);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::from_status(status.as_u16(), text));
        }

        let mut bytes = response.bytes_stream();
        let stream = try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            let mut done = false;

            'read: while let Some(piece) = bytes.next().await {
                let piece = piece.map_err(|e| ProviderError::StreamInterrupted(e.to_string()))?;
                buffer.extend_from_slice(&piece);

                while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = buffer.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&raw);
                    let line = line.trim();
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    match parse_event(data.trim())? {
                        Some(chunks) => {
                            for chunk in chunks {
                                yield chunk;
                            }
                        }
                        None => {
                            done = true;
                            break 'read;
                        }
                    }
                }
            }

            if !done {
                Err(ProviderError::StreamInterrupted(
                    "stream ended before [DONE]".to_string(),
                ))?;
            }
        };

        Ok(Box::pin(stream))
    }
}
