use std::{env, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::providers::{ChatProvider, ChatRequest, ChatResponse};
use crate::trace::{MessageRole, TokenUsage};
use crate::EvalError;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    pub request_timeout: Duration,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Anthropic {
    client: Client,
    config: AnthropicConfig,
}

impl Anthropic {
    pub fn new(api_key: impl Into<String>) -> Result<Self, EvalError> {
        Self::from_config(AnthropicConfig::new(api_key))
    }

    pub fn from_env() -> Result<Self, EvalError> {
        let api_key = env::var("ANTHROPIC_API_KEY")
            .map_err(|_| EvalError::MissingApiKey("ANTHROPIC_API_KEY"))?;
        Self::from_config(AnthropicConfig::new(api_key))
    }

    pub fn from_config(config: AnthropicConfig) -> Result<Self, EvalError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct MessagesReply {
    content: Vec<ContentBlock>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[async_trait]
impl ChatProvider for Anthropic {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, EvalError> {
        // The messages API takes the system prompt as a top-level field.
        let system = request
            .messages
            .iter()
            .find(|message| message.role == MessageRole::System)
            .map(|message| message.content.as_str());

        let messages: Vec<WireMessage> = request
            .messages
            .iter()
            .filter(|message| message.role != MessageRole::System)
            .map(|message| WireMessage {
                role: match message.role {
                    MessageRole::Assistant => "assistant",
                    _ => "user",
                },
                content: &message.content,
            })
            .collect();

        let body = MessagesBody {
            model: &request.model,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(self.endpoint("v1/messages"))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(EvalError::Provider(format!(
                "anthropic returned {status}: {detail}"
            )));
        }

        let reply: MessagesReply = response.json().await?;
        let content = reply
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        if content.is_empty() {
            return Err(EvalError::InvalidResponse("no text content in reply"));
        }

        Ok(ChatResponse {
            content,
            usage: reply.usage.map(|usage| {
                TokenUsage::new(
                    usage.input_tokens,
                    usage.output_tokens,
                    usage.input_tokens + usage.output_tokens,
                )
            }),
        })
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}
