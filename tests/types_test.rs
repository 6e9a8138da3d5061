use chrono::{TimeZone, Utc};
use uuid::Uuid;

use tagmill::resources::month_interval_start;
use tagmill::types::{CostPoints, Entry, FeedError, FeedState, ProcessorPointer, COST_POINTS_PER_USD};

const ALL_FEED_ERRORS: &[FeedError] = &[
    FeedError::NetworkUnknown,
    FeedError::NetworkNon200StatusCode,
    FeedError::NetworkConnectionTimeout,
    FeedError::NetworkReadTimeout,
    FeedError::NetworkConnectError,
    FeedError::NetworkNameResolutionFailed,
    FeedError::NetworkSslConnectionError,
    FeedError::NetworkCertificateVerifyFailed,
    FeedError::NetworkTooManyRedirects,
    FeedError::NetworkDisconnectionWithoutResponse,
    FeedError::NetworkReceivedIncompleteBody,
    FeedError::NetworkIllegalRequestLine,
    FeedError::NetworkDecodingError,
    FeedError::NetworkUnsupportedProtocol,
    FeedError::ProxyCouldNotResolveHost,
    FeedError::ProxyConnectionRefused,
    FeedError::ProxyNoRouteToHost,
    FeedError::ProxyAllSuspended,
    FeedError::ParsingBaseError,
    FeedError::ParsingUnicodeDecodeError,
    FeedError::ParsingFormatError,
    FeedError::ParsingFeedContentNotFound,
    FeedError::ProtocolNoEntriesInFeed,
];

#[test]
fn feed_error_codes_are_stable() {
    for error in ALL_FEED_ERRORS {
        assert_eq!(FeedError::parse(error.as_str()).unwrap(), *error);
    }
}

#[test]
fn unknown_feed_error_code_is_rejected() {
    assert!(FeedError::parse("network_exploded").is_err());
}

#[test]
fn feed_states_round_trip() {
    for state in [
        FeedState::NotLoaded,
        FeedState::Loaded,
        FeedState::Damaged,
        FeedState::Orphaned,
    ] {
        assert_eq!(FeedState::parse(state.as_str()).unwrap(), state);
    }
}

#[test]
fn cost_points_are_integral() {
    assert_eq!(CostPoints::from_usd(1.0), CostPoints(COST_POINTS_PER_USD));
    assert_eq!(CostPoints::from_usd(0.15).0, 150_000_000);
    assert_eq!(CostPoints(COST_POINTS_PER_USD / 2).to_usd(), 0.5);
}

#[test]
fn cost_points_saturate_instead_of_overflowing() {
    let total = CostPoints(i64::MAX).saturating_add(CostPoints(1));

    assert_eq!(total, CostPoints(i64::MAX));
}

#[test]
fn pointer_only_advances_forward() {
    let at = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
    let later = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 1).unwrap();

    let entry_a = Uuid::from_u128(1);
    let entry_b = Uuid::from_u128(2);

    let pointer = ProcessorPointer {
        processor_id: 1,
        pointer_created_at: at,
        pointer_entry_id: entry_a,
    };

    assert!(pointer.can_advance_to(later, entry_a));
    assert!(pointer.can_advance_to(at, entry_b));
    assert!(!pointer.can_advance_to(at, entry_a));
    assert!(!pointer.can_advance_to(pointer.pointer_created_at, Uuid::from_u128(0)));
}

#[test]
fn zero_pointer_is_before_every_entry() {
    let pointer = ProcessorPointer::zero(1);

    let cataloged_at = Utc.with_ymd_and_hms(1971, 1, 1, 0, 0, 0).unwrap();

    assert!(pointer.can_advance_to(cataloged_at, Uuid::nil()));
}

#[test]
fn entry_age_is_measured_from_cataloging() {
    let cataloged_at = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
    let now = Utc.with_ymd_and_hms(2026, 8, 3, 0, 0, 0).unwrap();

    let entry = Entry {
        id: Uuid::new_v4(),
        source_id: Uuid::new_v4(),
        title: "t".to_string(),
        body: "b".to_string(),
        external_id: "e".to_string(),
        external_url: None,
        external_tags: Vec::new(),
        published_at: None,
        cataloged_at,
    };

    assert_eq!(entry.age(now), chrono::Duration::days(2));
}

#[test]
fn billing_intervals_are_calendar_months() {
    let inside = Utc.with_ymd_and_hms(2026, 8, 23, 15, 42, 7).unwrap();
    let start = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();

    assert_eq!(month_interval_start(inside), start);
    assert_eq!(month_interval_start(start), start);
}
