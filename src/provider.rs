use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CostPoints, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    Test,
    OpenAi,
}

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub provider: LlmProvider,
    pub name: String,
    pub max_context_size: u32,
    pub max_return_tokens: u32,
    /// Hard ceiling on the worst-case token cost of one entry, across all
    /// of its split parts. Protects from unbounded fan-out on
    /// pathologically large entries.
    pub max_tokens_per_entry: u32,
    pub input_1m_tokens_cost: CostPoints,
    pub output_1m_tokens_cost: CostPoints,
}

impl ModelInfo {
    pub fn tokens_cost(&self, input_tokens: u32, output_tokens: u32) -> CostPoints {
        let input = self.input_1m_tokens_cost.0 * input_tokens as i64 / 1_000_000;
        let output = self.output_1m_tokens_cost.0 * output_tokens as i64 / 1_000_000;
        CostPoints(input + output)
    }
}

/// Unified request configuration across providers; providers ignore the
/// knobs they do not support.
#[derive(Debug, Clone)]
pub struct LlmConfiguration {
    pub model: String,
    pub system: String,
    pub max_return_tokens: u32,
    pub text_parts_intersection: usize,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Works,
    Broken,
    Quota,
    Unknown,
}

struct StatusInfo {
    status: KeyStatus,
    updated_at: DateTime<Utc>,
}

/// Per-provider cache of API key health. Broken and quota verdicts expire
/// back to unknown after their timeouts, so a key recovers without operator
/// action; the cache is advisory, never a source of correctness.
pub struct KeyStatuses {
    statuses: Mutex<HashMap<String, StatusInfo>>,
    broken_timeout: Duration,
    quota_timeout: Duration,
}

impl KeyStatuses {
    pub fn new(broken_timeout: Duration, quota_timeout: Duration) -> Self {
        Self {
            statuses: Mutex::new(HashMap::new()),
            broken_timeout,
            quota_timeout,
        }
    }

    pub fn set(&self, key: &str, status: KeyStatus) {
        let mut statuses = self.statuses.lock().expect("key statuses lock poisoned");
        statuses.insert(
            key.to_string(),
            StatusInfo {
                status,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, key: &str) -> KeyStatus {
        let statuses = self.statuses.lock().expect("key statuses lock poisoned");

        let Some(info) = statuses.get(key) else {
            return KeyStatus::Unknown;
        };

        let now = Utc::now();

        match info.status {
            KeyStatus::Works => KeyStatus::Works,
            KeyStatus::Broken if info.updated_at + self.broken_timeout > now => KeyStatus::Broken,
            KeyStatus::Quota if info.updated_at + self.quota_timeout > now => KeyStatus::Quota,
            _ => KeyStatus::Unknown,
        }
    }
}

/// Pluggable LLM provider capability: token estimation, chat calls and key
/// validation. Precise tokenizer behavior is explicitly out of scope;
/// estimates only need to be safe upper-bound-ish heuristics.
#[async_trait]
pub trait ProviderInterface: Send + Sync {
    fn provider(&self) -> LlmProvider;

    fn model_info(&self, model: &str) -> Result<ModelInfo>;

    fn estimate_tokens(&self, config: &LlmConfiguration, text: &str) -> u32;

    async fn chat(&self, config: &LlmConfiguration, api_key: &str, request: &ChatRequest) -> Result<ChatResponse>;

    async fn check_api_key(&self, config: &LlmConfiguration, api_key: &str) -> KeyStatus;

    fn key_statuses(&self) -> &KeyStatuses;
}

/// A reasonable cross-vendor heuristic: about four characters per token.
pub fn estimate_tokens_by_chars(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    chars.div_ceil(4)
}

/// Splits text into `parts` ranges of roughly equal size, each extended by
/// the configured intersection so context survives the cut. Operates on
/// chars, never on raw bytes. Concatenating the parts minus the
/// intersection reconstructs the original text.
pub fn split_text(text: &str, parts: usize, intersection: usize) -> Result<Vec<String>> {
    if parts < 1 {
        return Err(Error::General("text must be split into at least one part".to_string()));
    }

    if parts == 1 {
        return Ok(vec![text.to_string()]);
    }

    let chars: Vec<char> = text.chars().collect();

    let part_size = chars.len() / parts + intersection / 2;

    if part_size <= intersection {
        return Err(Error::General(
            "text parts intersection is larger than the part size".to_string(),
        ));
    }

    let step = part_size - intersection;

    let mut result = Vec::new();
    let mut index = 0;

    while index < chars.len() {
        let end = (index + part_size).min(chars.len());
        result.push(chars[index..end].iter().collect());
        index += step;
    }

    Ok(result)
}

/// Prepares the chat requests for one entry text. Starting from a single
/// part, re-splits into more parts until every part's estimated tokens plus
/// the configured return budget fits the model's context window. Fails
/// permanently once the worst-case total across all parts exceeds the
/// model's per-entry ceiling.
pub fn prepare_requests(
    provider: &dyn ProviderInterface,
    config: &LlmConfiguration,
    text: &str,
) -> Result<Vec<ChatRequest>> {
    let model = provider.model_info(&config.model)?;

    let mut parts = 1;

    loop {
        let texts = split_text(text, parts, config.text_parts_intersection)?;

        let estimates: Vec<u32> = texts
            .iter()
            .map(|part| provider.estimate_tokens(config, part))
            .collect();

        let worst_case: u64 = estimates
            .iter()
            .map(|estimate| *estimate as u64 + config.max_return_tokens as u64)
            .sum();

        if worst_case > model.max_tokens_per_entry as u64 {
            return Err(Error::EntryTooLargeForModel {
                model: model.name.clone(),
            });
        }

        let fits = estimates
            .iter()
            .all(|estimate| estimate + config.max_return_tokens <= model.max_context_size);

        if fits {
            return Ok(texts.into_iter().map(|text| ChatRequest { text }).collect());
        }

        parts += 1;
    }
}

/// In-process provider used by tests and the `test` provider slot: echoes
/// deterministic content and token counts without any network traffic.
pub struct MockProvider {
    statuses: KeyStatuses,
    models: Vec<ModelInfo>,
    pub response_content: String,
}

impl MockProvider {
    pub fn new(models: Vec<ModelInfo>) -> Self {
        Self {
            statuses: KeyStatuses::new(Duration::hours(1), Duration::hours(1)),
            models,
            response_content: "mock-tag".to_string(),
        }
    }

    pub fn with_response(mut self, content: impl Into<String>) -> Self {
        self.response_content = content.into();
        self
    }
}

#[async_trait]
impl ProviderInterface for MockProvider {
    fn provider(&self) -> LlmProvider {
        LlmProvider::Test
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

    fn estimate_tokens(&self, _config: &LlmConfiguration, text: &str) -> u32 {
        estimate_tokens_by_chars(text)
    }

    async fn chat(&self, config: &LlmConfiguration, _api_key: &str, request: &ChatRequest) -> Result<ChatResponse> {
        Ok(ChatResponse {
            content: self.response_content.clone(),
            input_tokens: self.estimate_tokens(config, &request.text),
            output_tokens: estimate_tokens_by_chars(&self.response_content),
        })
    }

    async fn check_api_key(&self, _config: &LlmConfiguration, api_key: &str) -> KeyStatus {
        let status = KeyStatus::Works;
        self.statuses.set(api_key, status);
        status
    }

    fn key_statuses(&self) -> &KeyStatuses {
        &self.statuses
    }
}
