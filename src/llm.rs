//! Ollama chat model.
//!
//! Renders the conversation history and the new question into a single
//! prompt and sends it to Ollama's /api/generate endpoint. Unlike a
//! best-effort text cleanup, a failed call here is an error for the caller.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::config::OllamaConfig;

const PROMPT_TEMPLATE: &str = r#"
Answer the question below.

Here is the conversation history: {context}

Question: {question}

Answer:
"#;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid model name {0:?}")]
    InvalidModel(String),

    #[error("Ollama request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Ollama returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Ollama response has no \"response\" field")]
    MissingResponse,
}

/// Something that answers a question given the conversation so far.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn reply(&self, context: &str, question: &str) -> Result<String, LlmError>;
}

pub struct OllamaChat {
    model: String,
    config: OllamaConfig,
    client: Client,
}

impl OllamaChat {
    /// Bind a client to `model`. No request timeout: local models can take
    /// as long as they need.
    pub fn new(model: &str, config: &OllamaConfig) -> Result<Self, LlmError> {
        if model.trim().is_empty() {
            return Err(LlmError::InvalidModel(model.to_string()));
        }

        Ok(Self {
            model: model.to_string(),
            config: config.clone(),
            client: Client::builder().build()?,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Fill the template in a single pass so placeholder-looking text inside the
/// history or the question is inserted verbatim.
fn render_prompt(context: &str, question: &str) -> String {
    let mut prompt = String::with_capacity(PROMPT_TEMPLATE.len() + context.len() + question.len());
    let mut rest = PROMPT_TEMPLATE;

    while let Some(open) = rest.find('{') {
        prompt.push_str(&rest[..open]);
        let tail = &rest[open..];
        if let Some(after) = tail.strip_prefix("{context}") {
            prompt.push_str(context);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{question}") {
            prompt.push_str(question);
            rest = after;
        } else {
            prompt.push('{');
            rest = &tail[1..];
        }
    }
    prompt.push_str(rest);
    prompt
}

#[async_trait]
impl ChatModel for OllamaChat {
    async fn reply(&self, context: &str, question: &str) -> Result<String, LlmError> {
        let mut body = json!({
            "model": self.model,
            "prompt": render_prompt(context, question),
            "stream": false,
        });
        if let Some(temperature) = self.config.temperature {
            body["options"] = json!({ "temperature": temperature });
        }

        let url = format!("{}/api/generate", self.config.host.trim_end_matches('/'));
        debug!("Sending question to Ollama model '{}': {question}", self.model);

        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let data: serde_json::Value = resp.json().await?;
        let reply = data["response"]
            .as_str()
            .ok_or(LlmError::MissingResponse)?
            .trim()
            .to_string();
        debug!("Ollama output: '{reply}'");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> OllamaConfig {
        OllamaConfig {
            host: server.uri(),
            temperature: None,
        }
    }

    #[test]
    fn empty_model_name_is_rejected() {
        let config = OllamaConfig::default();
        assert!(matches!(
            OllamaChat::new("", &config),
            Err(LlmError::InvalidModel(_))
        ));
        assert_eq!(OllamaChat::new("llama3", &config).unwrap().model(), "llama3");
    }

    #[test]
    fn prompt_carries_history_and_question() {
        let prompt = render_prompt("User: a\nAI: b\n", "what next?");
        assert!(prompt.contains("Here is the conversation history: User: a\nAI: b\n"));
        assert!(prompt.contains("Question: what next?"));
        assert!(prompt.trim_end().ends_with("Answer:"));
    }

    #[test]
    fn placeholders_in_history_are_left_alone() {
        let history = "User: what does {question} mean?\nAI: a {context} slot\n";
        let prompt = render_prompt(history, "thanks");
        assert!(prompt.contains("User: what does {question} mean?"));
        assert!(prompt.contains("AI: a {context} slot"));
        assert!(prompt.contains("Question: thanks"));
        assert_eq!(prompt.matches("thanks").count(), 1);

        let prompt = render_prompt("", "is {context} a keyword?");
        assert!(prompt.contains("Question: is {context} a keyword?"));
        assert!(prompt.contains("Here is the conversation history: \n"));
    }

    #[tokio::test]
    async fn reply_posts_to_generate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({ "model": "llama3", "stream": false })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "response": "  hi there\n", "done": true })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let chat = OllamaChat::new("llama3", &config_for(&server)).unwrap();
        assert_eq!(chat.reply("", "hello").await.unwrap(), "hi there");
    }

    #[tokio::test]
    async fn temperature_is_sent_as_option() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "options": { "temperature": 0.5 } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": "ok" })))
            .expect(1)
            .mount(&server)
            .await;

        let config = OllamaConfig {
            temperature: Some(0.5),
            ..config_for(&server)
        };
        let chat = OllamaChat::new("llama3", &config).unwrap();
        assert_eq!(chat.reply("", "hello").await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn error_status_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("model 'nope' not found"))
            .mount(&server)
            .await;

        let chat = OllamaChat::new("nope", &config_for(&server)).unwrap();
        match chat.reply("", "hello").await {
            Err(LlmError::Status { status, body }) => {
                assert_eq!(status, 404);
                assert!(body.contains("not found"));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_response_field_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "done": true })))
            .mount(&server)
            .await;

        let chat = OllamaChat::new("llama3", &config_for(&server)).unwrap();
        assert!(matches!(
            chat.reply("", "hello").await,
            Err(LlmError::MissingResponse)
        ));
    }
}
