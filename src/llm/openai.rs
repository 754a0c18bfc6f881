//! OpenAI 兼容 API 传输层
//!
//! 通过 reqwest 直接调用任意 OpenAI 兼容端点（可配置 base_url）：流式请求按字节块到达，
//! LineDecoder 负责把跨块的行拼回完整行（按字节切分，避免截断 UTF-8 字符）。

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;

use crate::core::ChatError;
use crate::llm::{ChatRequest, CompletionTransport, LineStream};
use crate::memory::Message;

/// 字节块 -> 行；保留未以换行结束的尾部直到下一块或流结束
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let mut line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// 流结束时取出残留的最后一行（无换行结尾）
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
        Some(line)
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// OpenAI 兼容客户端：持有 reqwest Client、base_url 与 API Key
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    /// timeout 为 None 时不设置整体超时（流式回复可能很长）
    pub fn new(base_url: &str, api_key: Option<&str>, timeout: Option<Duration>) -> Result<Self, ChatError> {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "dummy-key".to_string());

        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn post(&self, request: &ChatRequest) -> Result<reqwest::Response, ChatError> {
        let response = self
            .client
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;
        check_status(response).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ChatError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ChatError::Http {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl CompletionTransport for OpenAiClient {
    async fn stream_lines(&self, request: &ChatRequest) -> Result<LineStream, ChatError> {
        let response = self.post(request).await?;
        tracing::debug!(model = %request.model, messages = request.messages.len(), "stream opened");

        let bytes = Box::pin(response.bytes_stream());
        let lines = stream::unfold(
            (bytes, LineDecoder::new(), VecDeque::new(), false),
            |(mut bytes, mut decoder, mut pending, mut eof)| async move {
                loop {
                    if let Some(line) = pending.pop_front() {
                        return Some((Ok(line), (bytes, decoder, pending, eof)));
                    }
                    if eof {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
                        Some(Err(e)) => {
                            eof = true;
                            let err = ChatError::Transport(e.to_string());
                            return Some((Err(err), (bytes, decoder, pending, eof)));
                        }
                        None => {
                            eof = true;
                            pending.extend(decoder.finish());
                        }
                    }
                }
            },
        );
        Ok(Box::pin(lines))
    }

    async fn complete(&self, model: &str, messages: &[Message]) -> Result<String, ChatError> {
        let request = ChatRequest::plain(model, messages.to_vec());
        let response = self.post(&request).await?;
        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| ChatError::Protocol(format!("Failed to parse response: {}", e)))?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ChatError::Protocol("response has no choices".to_string()))?;
        Ok(choice.message.content.unwrap_or_default())
    }

    async fn list_models(&self) -> Result<Vec<String>, ChatError> {
        let response = self
            .client
            .get(self.url("models"))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let response = check_status(response).await?;
        let list: ModelList = response
            .json()
            .await
            .map_err(|e| ChatError::Protocol(format!("Failed to parse model list: {}", e)))?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}
