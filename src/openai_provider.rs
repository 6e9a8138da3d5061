use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::provider::{
    estimate_tokens_by_chars, ChatRequest, ChatResponse, KeyStatus, KeyStatuses, LlmConfiguration, LlmProvider,
    ModelInfo, ProviderInterface,
};
use crate::types::{CostPoints, Error, Result};

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ApiChatRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ApiChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiChatResponse {
    choices: Vec<ApiChoice>,
    usage: ApiUsage,
}

/// `ProviderInterface` over the OpenAI-compatible chat completions API.
/// Token estimation is the chars/4 heuristic: exact tokenizer behavior is
/// vendor-specific and deliberately out of scope.
pub struct OpenAiProvider {
    client: Client,
    entry_point: String,
    models: Vec<ModelInfo>,
    statuses: KeyStatuses,
}

impl OpenAiProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let models = config
            .models
            .iter()
            .map(|model| ModelInfo {
                provider: LlmProvider::OpenAi,
                name: model.name.clone(),
                max_context_size: model.max_context_size,
                max_return_tokens: model.max_return_tokens,
                max_tokens_per_entry: model.max_tokens_per_entry,
                input_1m_tokens_cost: CostPoints::from_usd(model.input_1m_tokens_cost_usd),
                output_1m_tokens_cost: CostPoints::from_usd(model.output_1m_tokens_cost_usd),
            })
            .collect();

        Ok(Self {
            client: Client::builder().timeout(StdDuration::from_secs(120)).build()?,
            entry_point: config.openai_entry_point.trim_end_matches('/').to_string(),
            models,
            statuses: KeyStatuses::new(
                Duration::seconds(config.key_broken_timeout_secs),
                Duration::seconds(config.key_quota_timeout_secs),
            ),
        })
    }

    async fn send_chat(&self, config: &LlmConfiguration, api_key: &str, text: &str) -> Result<ChatResponse> {
        let body = ApiChatRequest {
            model: &config.model,
            messages: vec![
                ApiMessage {
                    role: "system",
                    content: &config.system,
                },
                ApiMessage {
                    role: "user",
                    content: text,
                },
            ],
            max_tokens: config.max_return_tokens,
            temperature: config.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.entry_point))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            self.statuses.set(api_key, KeyStatus::Broken);
            return Err(Error::ProviderRejected(format!("authentication failed: {}", status)));
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            self.statuses.set(api_key, KeyStatus::Quota);
            return Err(Error::ProviderRejected("quota exhausted".to_string()));
        }

        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            warn!(%status, "openai_request_failed");
            return Err(Error::ProviderRejected(format!("{}: {}", status, details)));
        }

        let parsed: ApiChatResponse = response.json().await?;

        self.statuses.set(api_key, KeyStatus::Works);

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        debug!(
            input_tokens = parsed.usage.prompt_tokens,
            output_tokens = parsed.usage.completion_tokens,
            "openai_chat_completed"
        );

        Ok(ChatResponse {
            content,
            input_tokens: parsed.usage.prompt_tokens,
            output_tokens: parsed.usage.completion_tokens,
        })
    }
}

#[async_trait]
impl ProviderInterface for OpenAiProvider {
    fn provider(&self) -> LlmProvider {
        LlmProvider::OpenAi
    }

    fn model_info(&self, model: &str) -> Result<ModelInfo> {
        self.models
            .iter()
            .find(|info| info.name == model)
            .cloned()
            .ok_or_else(|| Error::ModelNotKnown {
                model: model.to_string(),
            })
    }

    fn estimate_tokens(&self, config: &LlmConfiguration, text: &str) -> u32 {
        estimate_tokens_by_chars(&config.system) + estimate_tokens_by_chars(text)
    }

    async fn chat(&self, config: &LlmConfiguration, api_key: &str, request: &ChatRequest) -> Result<ChatResponse> {
        self.send_chat(config, api_key, &request.text).await
    }

    /// A cheap probe: one-token request against the configured model.
    async fn check_api_key(&self, config: &LlmConfiguration, api_key: &str) -> KeyStatus {
        let probe = LlmConfiguration {
            max_return_tokens: 1,
            ..config.clone()
        };

        match self.send_chat(&probe, api_key, "test").await {
            Ok(_) => KeyStatus::Works,
            Err(_) => self.statuses.get(api_key),
        }
    }

    fn key_statuses(&self) -> &KeyStatuses {
        &self.statuses
    }
}
