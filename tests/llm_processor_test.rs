use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use tagmill::config::LlmProcessorConfig;
use tagmill::processors::{LlmGeneralProcessor, Processor};
use tagmill::provider::{LlmProvider, MockProvider, ModelInfo};
use tagmill::rotator::{RotationStore, UserKeyInfo};
use tagmill::types::{CostPoints, Entry, Error, Result};

struct StoreFixture {
    users: Vec<UserKeyInfo>,
    conversions: Mutex<Vec<(Uuid, CostPoints, CostPoints)>>,
}

impl StoreFixture {
    fn new(users: Vec<UserKeyInfo>) -> Self {
        Self {
            users,
            conversions: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RotationStore for StoreFixture {
    async fn feed_ids_for_source(&self, _source_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(vec![Uuid::new_v4()])
    }

    async fn any_feed_in_collection(&self, _feed_ids: &[Uuid]) -> Result<bool> {
        Ok(false)
    }

    async fn linked_user_ids(&self, _feed_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        Ok(self.users.iter().map(|u| u.user_id).collect())
    }

    async fn load_user_key_infos(
        &self,
        _provider: LlmProvider,
        _user_ids: &[Uuid],
        _interval_started_at: DateTime<Utc>,
    ) -> Result<Vec<UserKeyInfo>> {
        Ok(self.users.clone())
    }

    async fn try_to_reserve(
        &self,
        _user_id: Uuid,
        _interval_started_at: DateTime<Utc>,
        _amount: CostPoints,
        _limit: CostPoints,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn convert_reserved_to_used(
        &self,
        user_id: Uuid,
        _interval_started_at: DateTime<Utc>,
        used: CostPoints,
        reserved: CostPoints,
    ) -> Result<()> {
        self.conversions.lock().unwrap().push((user_id, used, reserved));
        Ok(())
    }
}

fn model() -> ModelInfo {
    ModelInfo {
        provider: LlmProvider::Test,
        name: "test-model".to_string(),
        max_context_size: 10_000,
        max_return_tokens: 100,
        max_tokens_per_entry: 100_000,
        input_1m_tokens_cost: CostPoints::from_usd(1.0),
        output_1m_tokens_cost: CostPoints::from_usd(2.0),
    }
}

fn llm_config(general_api_key: Option<&str>) -> LlmProcessorConfig {
    LlmProcessorConfig {
        model: "test-model".to_string(),
        system: "tag the text".to_string(),
        entry_template: "{title}\n\n{body}".to_string(),
        max_return_tokens: 100,
        text_parts_intersection: 10,
        temperature: 0.0,
        collections_api_key: None,
        general_api_key: general_api_key.map(str::to_string),
    }
}

fn entry() -> Entry {
    Entry {
        id: Uuid::new_v4(),
        source_id: Uuid::new_v4(),
        title: "A post about Rust".to_string(),
        body: "<p>Async programming with tokio.</p>".to_string(),
        external_id: "post-1".to_string(),
        external_url: None,
        external_tags: Vec::new(),
        published_at: None,
        cataloged_at: Utc::now(),
    }
}

#[tokio::test]
async fn tags_extracted_from_the_model_response() {
    let provider = Arc::new(MockProvider::new(vec![model()]).with_response("rust, async, tokio"));
    let store = Arc::new(StoreFixture::new(Vec::new()));

    let processor = LlmGeneralProcessor::new(provider, store.clone(), &llm_config(Some("gen-key")));

    let tags = processor.process(&entry()).await.unwrap();

    assert_eq!(tags, vec!["rust".to_string(), "async".to_string(), "tokio".to_string()]);

    // The shared key never touches the subscriber ledger.
    assert!(store.conversions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn no_available_key_postpones_the_entry() {
    let provider = Arc::new(MockProvider::new(vec![model()]));
    let store = Arc::new(StoreFixture::new(Vec::new()));

    let processor = LlmGeneralProcessor::new(provider, store, &llm_config(None));

    let error = processor.process(&entry()).await.unwrap_err();

    assert!(matches!(error, Error::SkipAndContinueLater));
}

#[tokio::test]
async fn subscriber_key_settles_its_reservation() {
    let user = UserKeyInfo {
        user_id: Uuid::new_v4(),
        api_key: Some("user-key".to_string()),
        max_cost_in_month: CostPoints::from_usd(10.0),
        process_entries_not_older_than: Duration::days(7),
        cost_used: CostPoints(0),
    };
    let user_id = user.user_id;

    let provider = Arc::new(MockProvider::new(vec![model()]).with_response("rust"));
    let store = Arc::new(StoreFixture::new(vec![user]));

    let processor = LlmGeneralProcessor::new(provider, store.clone(), &llm_config(None));

    let tags = processor.process(&entry()).await.unwrap();

    assert_eq!(tags, vec!["rust".to_string()]);

    let conversions = store.conversions.lock().unwrap();
    assert_eq!(conversions.len(), 1);
    assert_eq!(conversions[0].0, user_id);
    // Actual spend never exceeds the worst-case reservation.
    assert!(conversions[0].1 <= conversions[0].2);
}
