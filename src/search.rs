use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::types::{QuotientError, Quote, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::System,
            content: content.into(),
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::Assistant,
            content: content.into(),
        }
    }
}

/// The language-model collaborator: one non-streamed completion, or a token
/// stream delivered over a channel. Receiving `Err` or channel closure ends
/// the stream.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, messages: &[PromptMessage], max_tokens: u32) -> Result<String>;
    async fn stream(&self, messages: &[PromptMessage]) -> Result<mpsc::Receiver<Result<String>>>;
}

/// The vector-search collaborator: query text in, ranked passages out.
#[async_trait]
pub trait PassageSearch: Send + Sync {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        include_secondary: bool,
    ) -> Result<Vec<Quote>>;
}

/// --- HTTP IMPLEMENTATIONS ---

#[derive(Serialize)]
struct CompletionRequestBody<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct CompletionResponseBody {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamLine {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat-completions client.
pub struct HttpCompletionProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpCompletionProvider {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    async fn post(
        &self,
        messages: &[PromptMessage],
        stream: bool,
        max_tokens: Option<u32>,
    ) -> Result<reqwest::Response> {
        let body = CompletionRequestBody {
            model: &self.model,
            messages,
            stream,
            max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(QuotientError::Network)?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let error_body = match response.text().await {
                Ok(text) => text,
                Err(_) => "Unknown error".to_string(),
            };
            Err(QuotientError::Upstream(status, error_body).into())
        }
    }
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    async fn complete(&self, messages: &[PromptMessage], max_tokens: u32) -> Result<String> {
        let response = self.post(messages, false, Some(max_tokens)).await?;
        let body: CompletionResponseBody =
            response.json().await.map_err(QuotientError::Network)?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        if content.is_empty() {
            return Err(QuotientError::Upstream(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "Model returned an empty completion".to_string(),
            )
            .into());
        }
        Ok(content)
    }

    async fn stream(&self, messages: &[PromptMessage]) -> Result<mpsc::Receiver<Result<String>>> {
        let response = self.post(messages, true, None).await?;

        let bytes_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let mut lines = FramedRead::new(
            tokio_util::io::StreamReader::new(bytes_stream),
            LinesCodec::new_with_max_length(1024 * 1024),
        );

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(line_result) = lines.next().await {
                let line = match line_result {
                    Ok(line) => line,
                    Err(e) => {
                        let _ = tx
                            .send(Err(QuotientError::Io(std::io::Error::other(e)).into()))
                            .await;
                        return;
                    }
                };
                let data = match line.strip_prefix("data: ") {
                    Some(data) => data,
                    None => continue,
                };
                if data == "[DONE]" {
                    return;
                }
                match serde_json::from_str::<StreamLine>(data) {
                    Ok(parsed) => {
                        let delta = parsed
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.delta.content)
                            .unwrap_or_default();
                        if !delta.is_empty() && tx.send(Ok(delta)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Skipping unparseable stream line: {}", e);
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[derive(Serialize)]
struct SearchRequestBody<'a> {
    query: &'a str,
    limit: usize,
    include_secondary: bool,
}

#[derive(Deserialize)]
struct SearchResponseBody {
    #[serde(default)]
    passages: Vec<Quote>,
}

/// HTTP passage-search client; the service ranks passages against the query
/// embedding and returns `{passages: [{text, reference, url}]}`.
pub struct HttpPassageSearch {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPassageSearch {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl PassageSearch for HttpPassageSearch {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        include_secondary: bool,
    ) -> Result<Vec<Quote>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&SearchRequestBody {
                query,
                limit,
                include_secondary,
            })
            .send()
            .await
            .map_err(QuotientError::Network)?;

        let status = response.status();
        if !status.is_success() {
            let error_body = match response.text().await {
                Ok(text) => text,
                Err(_) => "Unknown error".to_string(),
            };
            return Err(QuotientError::Upstream(status, error_body).into());
        }

        let body: SearchResponseBody = response.json().await.map_err(QuotientError::Network)?;
        Ok(body.passages)
    }
}
