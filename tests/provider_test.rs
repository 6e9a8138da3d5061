use chrono::Duration;
use proptest::prelude::*;

use tagmill::provider::{
    estimate_tokens_by_chars, prepare_requests, split_text, KeyStatus, KeyStatuses, LlmConfiguration, LlmProvider,
    MockProvider, ModelInfo,
};
use tagmill::types::{CostPoints, Error};

fn model(max_context_size: u32, max_tokens_per_entry: u32) -> ModelInfo {
    ModelInfo {
        provider: LlmProvider::Test,
        name: "test-model".to_string(),
        max_context_size,
        max_return_tokens: 100,
        max_tokens_per_entry,
        input_1m_tokens_cost: CostPoints::from_usd(1.0),
        output_1m_tokens_cost: CostPoints::from_usd(2.0),
    }
}

fn configuration(max_return_tokens: u32, intersection: usize) -> LlmConfiguration {
    LlmConfiguration {
        model: "test-model".to_string(),
        system: String::new(),
        max_return_tokens,
        text_parts_intersection: intersection,
        temperature: 0.0,
    }
}

#[test]
fn single_part_is_the_whole_text() {
    let parts = split_text("hello world", 1, 100).unwrap();

    assert_eq!(parts, vec!["hello world".to_string()]);
}

#[test]
fn intersection_larger_than_part_size_is_rejected() {
    assert!(split_text("short", 3, 50).is_err());
}

#[test]
fn parts_overlap_by_the_intersection() {
    let text: String = ('a'..='z').collect();

    let parts = split_text(&text, 2, 4).unwrap();

    assert!(parts.len() >= 2);

    for window in parts.windows(2) {
        let prev: Vec<char> = window[0].chars().collect();
        let next: Vec<char> = window[1].chars().collect();

        assert_eq!(&prev[prev.len() - 4..], &next[..4]);
    }
}

proptest! {
    #[test]
    fn concatenating_parts_minus_intersection_reconstructs_the_text(
        text in "[a-zA-Z0-9 ]{0,400}",
        parts in 1usize..6,
        intersection in 0usize..20,
    ) {
        let result = split_text(&text, parts, intersection);

        let Ok(chunks) = result else {
            // Rejected combinations are fine; splitting must never panic.
            return Ok(());
        };

        let mut reconstructed: Vec<char> = Vec::new();

        for (index, chunk) in chunks.iter().enumerate() {
            let chars: Vec<char> = chunk.chars().collect();

            if index == 0 {
                reconstructed.extend(chars);
            } else {
                reconstructed.extend(&chars[intersection.min(chars.len())..]);
            }
        }

        let original: Vec<char> = text.chars().collect();
        prop_assert_eq!(reconstructed, original);
    }

    #[test]
    fn split_is_char_safe_for_multibyte_text(
        text in "[\\p{Cyrillic}\u{4e00}-\u{4eff}a-z]{0,200}",
        parts in 1usize..4,
    ) {
        // Must never panic on non-ascii boundaries.
        let _ = split_text(&text, parts, 5);
    }
}

#[test]
fn small_text_goes_out_as_one_request() {
    let provider = MockProvider::new(vec![model(1000, 10_000)]);

    let requests = prepare_requests(&provider, &configuration(100, 10), "a short entry").unwrap();

    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].text, "a short entry");
}

#[test]
fn oversized_text_is_split_until_it_fits() {
    let provider = MockProvider::new(vec![model(200, 100_000)]);

    let text = "a".repeat(2000);

    let requests = prepare_requests(&provider, &configuration(100, 10), &text).unwrap();

    assert!(requests.len() > 1);

    for request in &requests {
        let estimate = estimate_tokens_by_chars(&request.text);
        assert!(estimate + 100 <= 200);
    }
}

#[test]
fn entry_over_the_per_entry_ceiling_fails_permanently() {
    let provider = MockProvider::new(vec![model(200, 300)]);

    let text = "a".repeat(5000);

    let error = prepare_requests(&provider, &configuration(100, 10), &text).unwrap_err();

    assert!(matches!(error, Error::EntryTooLargeForModel { .. }));
}

#[test]
fn unknown_model_is_an_error() {
    let provider = MockProvider::new(vec![]);

    let error = prepare_requests(&provider, &configuration(100, 10), "text").unwrap_err();

    assert!(matches!(error, Error::ModelNotKnown { .. }));
}

#[test]
fn key_statuses_default_to_unknown() {
    let statuses = KeyStatuses::new(Duration::hours(1), Duration::hours(1));

    assert_eq!(statuses.get("never-seen"), KeyStatus::Unknown);
}

#[test]
fn works_verdict_does_not_expire() {
    let statuses = KeyStatuses::new(Duration::zero(), Duration::zero());

    statuses.set("key", KeyStatus::Works);

    assert_eq!(statuses.get("key"), KeyStatus::Works);
}

#[test]
fn broken_verdict_expires_to_unknown() {
    let statuses = KeyStatuses::new(Duration::zero(), Duration::hours(1));

    statuses.set("key", KeyStatus::Broken);

    assert_eq!(statuses.get("key"), KeyStatus::Unknown);
}

#[test]
fn quota_verdict_holds_within_its_timeout() {
    let statuses = KeyStatuses::new(Duration::hours(1), Duration::hours(1));

    statuses.set("key", KeyStatus::Quota);

    assert_eq!(statuses.get("key"), KeyStatus::Quota);
}

#[test]
fn token_estimate_rounds_up() {
    assert_eq!(estimate_tokens_by_chars(""), 0);
    assert_eq!(estimate_tokens_by_chars("abc"), 1);
    assert_eq!(estimate_tokens_by_chars("abcd"), 1);
    assert_eq!(estimate_tokens_by_chars("abcde"), 2);
}
