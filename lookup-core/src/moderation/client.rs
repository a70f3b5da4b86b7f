use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::debug;

use super::ModerationError;
use crate::config::ModerationSection;

/// Text-in, text-out access to a hosted chat model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, ModerationError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat-completions client (Groq by default).
pub struct HttpChatModel {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    deadline: Duration,
}

impl HttpChatModel {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        deadline: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: api_key.into(),
            deadline,
        }
    }

    /// Build from config, reading the key from the configured environment variable.
    pub fn from_config(section: &ModerationSection) -> Result<Self, ModerationError> {
        let api_key = std::env::var(&section.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ModerationError::MissingApiKey(section.api_key_env.clone()))?;
        Ok(Self::new(
            section.endpoint.clone(),
            section.model.clone(),
            api_key,
            section.request_timeout(),
        ))
    }

    async fn send(&self, system: &str, user: &str) -> Result<String, ModerationError> {
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModerationError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed = response.json::<ChatResponse>().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(ModerationError::EmptyCompletion)?;
        debug!(model = %self.model, chars = content.len(), "completion received");
        Ok(content)
    }
}

#[async_trait]
impl LanguageModel for HttpChatModel {
    async fn complete(&self, system: &str, user: &str) -> Result<String, ModerationError> {
        match timeout(self.deadline, self.send(system, user)).await {
            Ok(result) => result,
            Err(_) => Err(ModerationError::Timeout(self.deadline)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_chat_completions_shape() {
        let request = ChatRequest {
            model: "llama-3.1-8b-instant",
            messages: [
                ChatMessage { role: "system", content: "rubric" },
                ChatMessage { role: "user", content: "[]" },
            ],
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "[]");
    }

    #[test]
    fn missing_key_is_reported_by_variable_name() {
        let section = ModerationSection {
            api_key_env: "LOOKUP_TEST_KEY_THAT_IS_NOT_SET".into(),
            ..ModerationSection::default()
        };
        match HttpChatModel::from_config(&section) {
            Err(ModerationError::MissingApiKey(name)) => {
                assert_eq!(name, "LOOKUP_TEST_KEY_THAT_IS_NOT_SET")
            }
            _ => panic!("expected a missing key error"),
        }
    }
}
