use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::config::{LlmProcessorConfig, ProcessorConfig, ProcessorKind};
use crate::provider::{prepare_requests, LlmConfiguration, ProviderInterface};
use crate::resources::month_interval_start;
use crate::rotator::{choose_api_key, use_api_key, RotationStore, SelectKeyContext, SpendReport};
use crate::types::{Entry, Error, Result};

/// A tag processor: looks at one entry, returns raw tags. Raw means
/// pre-normalization; persistence and normalization happen in the worker.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, entry: &Entry) -> Result<Vec<String>>;
}

/// Tags an entry with the hostname of its url and every parent domain, so
/// `news.example.com` also yields `example.com`.
pub struct DomainProcessor;

#[async_trait]
impl Processor for DomainProcessor {
    async fn process(&self, entry: &Entry) -> Result<Vec<String>> {
        let Some(external_url) = &entry.external_url else {
            return Ok(Vec::new());
        };

        let url = url::Url::parse(external_url)?;

        let Some(host) = url.host_str() else {
            return Ok(Vec::new());
        };

        // IP addresses carry no taggable hierarchy.
        if host.parse::<std::net::IpAddr>().is_ok() {
            return Ok(Vec::new());
        }

        let labels: Vec<&str> = host.split('.').collect();

        let mut tags = Vec::new();

        // Every suffix with at least two labels is a meaningful domain tag.
        for start in 0..labels.len().saturating_sub(1) {
            tags.push(labels[start..].join("."));
        }

        Ok(tags)
    }
}

/// Passes through the tags the feed itself declared for the entry.
pub struct NativeTagsProcessor;

#[async_trait]
impl Processor for NativeTagsProcessor {
    async fn process(&self, entry: &Entry) -> Result<Vec<String>> {
        Ok(entry.external_tags.clone())
    }
}

/// Flags entries whose title is mostly shouted. A weak quality signal, but a
/// cheap one.
pub struct UpperCaseTitleProcessor;

#[async_trait]
impl Processor for UpperCaseTitleProcessor {
    async fn process(&self, entry: &Entry) -> Result<Vec<String>> {
        let letters: Vec<char> = entry.title.chars().filter(|c| c.is_alphabetic()).collect();

        if letters.len() < 2 {
            return Ok(Vec::new());
        }

        let upper = letters.iter().filter(|c| c.is_uppercase()).count();

        if upper * 2 > letters.len() {
            Ok(vec!["upper-case-title".to_string()])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Strips markup from entry bodies before they go into a prompt. Markup
/// inflates token counts without adding meaning.
pub fn clean_text(text: &str) -> String {
    let mut cleaned = String::with_capacity(text.len());
    let mut in_tag = false;

    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                cleaned.push(' ');
            }
            _ if !in_tag => cleaned.push(c),
            _ => {}
        }
    }

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Pulls tags out of a model response. Accepts the formats models actually
/// produce: comma- or newline-separated lists, with optional `#`/`@` sigils
/// and list bullets.
pub fn extract_tags(text: &str) -> Vec<String> {
    let mut tags = Vec::new();

    for piece in text.split(|c| c == ',' || c == '\n') {
        let tag = piece
            .trim()
            .trim_start_matches(['-', '*'])
            .trim()
            .trim_start_matches(['#', '@'])
            .trim();

        if tag.is_empty() || tag.len() > 100 {
            continue;
        }

        tags.push(tag.to_string());
    }

    tags
}

fn render_entry_template(template: &str, entry: &Entry) -> String {
    template
        .replace("{title}", &clean_text(&entry.title))
        .replace("{body}", &clean_text(&entry.body))
}

/// The LLM-backed tagger. Splits oversized entries into overlapping parts,
/// reserves the worst-case cost up front, selects a key through the rotation
/// chain and settles the reservation with the actual token spend.
pub struct LlmGeneralProcessor {
    provider: Arc<dyn ProviderInterface>,
    store: Arc<dyn RotationStore>,
    configuration: LlmConfiguration,
    entry_template: String,
    collections_api_key: Option<String>,
    general_api_key: Option<String>,
}

impl LlmGeneralProcessor {
    pub fn new(
        provider: Arc<dyn ProviderInterface>,
        store: Arc<dyn RotationStore>,
        config: &LlmProcessorConfig,
    ) -> Self {
        Self {
            provider,
            store,
            configuration: LlmConfiguration {
                model: config.model.clone(),
                system: config.system.clone(),
                max_return_tokens: config.max_return_tokens,
                text_parts_intersection: config.text_parts_intersection,
                temperature: config.temperature,
            },
            entry_template: config.entry_template.clone(),
            collections_api_key: config.collections_api_key.clone(),
            general_api_key: config.general_api_key.clone(),
        }
    }
}

#[async_trait]
impl Processor for LlmGeneralProcessor {
    async fn process(&self, entry: &Entry) -> Result<Vec<String>> {
        let text = render_entry_template(&self.entry_template, entry);

        let model = self.provider.model_info(&self.configuration.model)?;

        let requests = prepare_requests(self.provider.as_ref(), &self.configuration, &text)?;

        let mut reserved_cost = crate::types::CostPoints(0);

        for request in &requests {
            let input = self.provider.estimate_tokens(&self.configuration, &request.text);
            let cost = model.tokens_cost(input, self.configuration.max_return_tokens);
            reserved_cost = reserved_cost.saturating_add(cost);
        }

        let now = Utc::now();

        let feed_ids = self.store.feed_ids_for_source(entry.source_id).await?;

        let context = SelectKeyContext {
            feed_ids,
            entry_age: entry.age(now),
            reserved_cost,
            interval_started_at: month_interval_start(now),
            collections_api_key: self.collections_api_key.clone(),
            general_api_key: self.general_api_key.clone(),
        };

        let selected = choose_api_key(
            self.store.as_ref(),
            self.provider.as_ref(),
            &self.configuration,
            &context,
        )
        .await?;

        let Some(mut usage) = selected else {
            // No key can pay right now. The entry stays queued and gets
            // another chance on a later run.
            return Err(Error::SkipAndContinueLater);
        };

        let provider = self.provider.clone();
        let configuration = self.configuration.clone();
        let api_key = usage.api_key.clone();

        let work = async move {
            let mut responses = Vec::new();
            let mut input_tokens = 0u32;
            let mut output_tokens = 0u32;

            for request in &requests {
                let response = provider.chat(&configuration, &api_key, request).await?;

                input_tokens += response.input_tokens;
                output_tokens += response.output_tokens;
                responses.push(response.content);
            }

            let report = SpendReport {
                input_tokens,
                output_tokens,
                used_cost: model.tokens_cost(input_tokens, output_tokens),
            };

            Ok((responses, report))
        };

        let responses = use_api_key(self.store.as_ref(), &mut usage, work).await?;

        let mut tags = Vec::new();

        for response in &responses {
            tags.extend(extract_tags(response));
        }

        debug!(entry_id = %entry.id, tags = tags.len(), "llm_processor_finished");

        Ok(tags)
    }
}

/// Builds the processor behind a configuration entry. Dispatch is closed:
/// the set of processor kinds is part of the binary, only their wiring is
/// configurable.
pub fn build_processor(
    config: &ProcessorConfig,
    provider: Arc<dyn ProviderInterface>,
    store: Arc<dyn RotationStore>,
) -> Result<Arc<dyn Processor>> {
    match config.kind {
        ProcessorKind::Domain => Ok(Arc::new(DomainProcessor)),
        ProcessorKind::NativeTags => Ok(Arc::new(NativeTagsProcessor)),
        ProcessorKind::UpperCaseTitle => Ok(Arc::new(UpperCaseTitleProcessor)),
        ProcessorKind::LlmGeneral => {
            let llm = config.llm.as_ref().ok_or_else(|| {
                Error::General(format!("processor {} requires an llm configuration", config.name))
            })?;

            Ok(Arc::new(LlmGeneralProcessor::new(provider, store, llm)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn entry(title: &str, url: Option<&str>, tags: &[&str]) -> Entry {
        Entry {
            id: Uuid::new_v4(),
            source_id: Uuid::new_v4(),
            title: title.to_string(),
            body: "body".to_string(),
            external_id: "ext-1".to_string(),
            external_url: url.map(str::to_string),
            external_tags: tags.iter().map(|t| t.to_string()).collect(),
            published_at: None,
            cataloged_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn domain_processor_emits_parent_domains() {
        let entry = entry("t", Some("https://news.example.com/post/1"), &[]);

        let tags = DomainProcessor.process(&entry).await.unwrap();

        assert_eq!(tags, vec!["news.example.com".to_string(), "example.com".to_string()]);
    }

    #[tokio::test]
    async fn domain_processor_skips_ip_hosts() {
        let entry = entry("t", Some("https://192.168.0.1/post"), &[]);

        let tags = DomainProcessor.process(&entry).await.unwrap();

        assert!(tags.is_empty());
    }

    #[tokio::test]
    async fn native_tags_processor_passes_feed_tags_through() {
        let entry = entry("t", None, &["Rust", "async"]);

        let tags = NativeTagsProcessor.process(&entry).await.unwrap();

        assert_eq!(tags, vec!["Rust".to_string(), "async".to_string()]);
    }

    #[tokio::test]
    async fn upper_case_title_detected() {
        let entry = entry("BREAKING NEWS about stuff", None, &[]);

        let tags = UpperCaseTitleProcessor.process(&entry).await.unwrap();

        assert_eq!(tags, vec!["upper-case-title".to_string()]);
    }

    #[tokio::test]
    async fn regular_title_not_flagged() {
        let entry = entry("A perfectly calm title", None, &[]);

        let tags = UpperCaseTitleProcessor.process(&entry).await.unwrap();

        assert!(tags.is_empty());
    }

    #[test]
    fn clean_text_strips_markup() {
        let cleaned = clean_text("<p>Hello <b>world</b></p>   and\n\nmore");

        assert_eq!(cleaned, "Hello world and more");
    }

    #[test]
    fn extract_tags_handles_sigils_and_bullets() {
        let tags = extract_tags("#rust, @async\n- tokio\n* networking\n\n");

        assert_eq!(
            tags,
            vec![
                "rust".to_string(),
                "async".to_string(),
                "tokio".to_string(),
                "networking".to_string()
            ]
        );
    }
}
