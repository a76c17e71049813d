use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{AppConfig, ModelBackend};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Request envelope for the chat-completion endpoint. The same envelope is
/// used for every back-end attempt; only `model` and `node_id` vary.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub project: String,
    pub node_id: String,
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    data: CompletionData,
}

#[derive(Debug, Deserialize)]
struct CompletionData {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

/// Transport seam for the non-streaming completion call, so back-end
/// ordering is testable without a network.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn post_completion(&self, request: &ChatCompletionRequest) -> Result<serde_json::Value>;
}

pub struct HttpChatTransport {
    api_url: String,
    client: reqwest::Client,
}

impl HttpChatTransport {
    pub fn new(api_url: String) -> Self {
        Self {
            api_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn post_completion(&self, request: &ChatCompletionRequest) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(&self.api_url)
            .json(request)
            .send()
            .await
            .context("Failed to send chat completion request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Chat API returned error {}: {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse chat completion body")
    }
}

/// Tries a prioritized list of model back-ends until one returns usable
/// content. Remote nodes rate-limit and drop out routinely, so the retry
/// strategy is the ordered list itself: each back-end gets exactly one
/// attempt per invocation, no backoff.
pub struct LlmClient {
    transport: Arc<dyn ChatTransport>,
    project: String,
    backends: Vec<ModelBackend>,
}

impl LlmClient {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_transport(
            Arc::new(HttpChatTransport::new(config.chat_api_url.clone())),
            config.project.clone(),
            config.model_backends.clone(),
        )
    }

    pub fn with_transport(
        transport: Arc<dyn ChatTransport>,
        project: String,
        backends: Vec<ModelBackend>,
    ) -> Self {
        Self {
            transport,
            project,
            backends,
        }
    }

    /// Run the prompt through the back-end list in declared order and
    /// return the first usable completion. Exhausting the list yields
    /// `None`, never an error.
    pub async fn complete(&self, system_prompt: &str, user_content: &str) -> Option<String> {
        let messages = vec![Message::system(system_prompt), Message::user(user_content)];

        for backend in &self.backends {
            match self.try_backend(backend, &messages).await {
                Ok(content) => {
                    tracing::info!(
                        "Model {} on node {} returned {} chars",
                        backend.model,
                        backend.node_id,
                        content.len()
                    );
                    return Some(content);
                }
                Err(e) => {
                    tracing::warn!(
                        "Model {} on node {} failed, trying next back-end: {}",
                        backend.model,
                        backend.node_id,
                        e
                    );
                }
            }
        }

        tracing::error!(
            "All {} model back-ends exhausted without usable content",
            self.backends.len()
        );
        None
    }

    async fn try_backend(&self, backend: &ModelBackend, messages: &[Message]) -> Result<String> {
        let request = ChatCompletionRequest {
            model: backend.model.clone(),
            messages: messages.to_vec(),
            project: self.project.clone(),
            node_id: backend.node_id.clone(),
            stream: false,
        };

        let body = self.transport.post_completion(&request).await?;
        let completion: ChatCompletionResponse = serde_json::from_value(body)
            .context("Chat completion body did not match expected shape")?;

        completion
            .data
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("Completion contained no content"))
    }
}

/// Streaming variant used by the HTTP route: returns the first back-end
/// that accepts the request, leaving the caller to consume the body.
pub struct StreamingChatClient {
    api_url: String,
    project: String,
    backends: Vec<ModelBackend>,
    client: reqwest::Client,
}

impl StreamingChatClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            api_url: config.chat_api_url.clone(),
            project: config.project.clone(),
            backends: config.model_backends.clone(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn open(&self, system_prompt: &str, user_content: &str) -> Option<reqwest::Response> {
        let messages = vec![Message::system(system_prompt), Message::user(user_content)];

        for backend in &self.backends {
            let request = ChatCompletionRequest {
                model: backend.model.clone(),
                messages: messages.clone(),
                project: self.project.clone(),
                node_id: backend.node_id.clone(),
                stream: true,
            };

            match self.client.post(&self.api_url).json(&request).send().await {
                Ok(response) if response.status().is_success() => return Some(response),
                Ok(response) => {
                    tracing::warn!(
                        "Streaming request to model {} returned {}",
                        backend.model,
                        response.status()
                    );
                }
                Err(e) => {
                    tracing::warn!("Streaming request to model {} failed: {}", backend.model, e);
                }
            }
        }

        None
    }
}
