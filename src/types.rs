use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    NotLoaded,
    Loaded,
    Damaged,
    Orphaned,
}

impl FeedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedState::NotLoaded => "not_loaded",
            FeedState::Loaded => "loaded",
            FeedState::Damaged => "damaged",
            FeedState::Orphaned => "orphaned",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "not_loaded" => Ok(FeedState::NotLoaded),
            "loaded" => Ok(FeedState::Loaded),
            "damaged" => Ok(FeedState::Damaged),
            "orphaned" => Ok(FeedState::Orphaned),
            other => Err(Error::General(format!("unknown feed state: {}", other))),
        }
    }
}

/// Closed taxonomy of everything that can go wrong while fetching and
/// parsing a feed. Codes are stable: they are stored in the database and
/// surfaced to operators, so variants are renamed never, only added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedError {
    NetworkUnknown,
    NetworkNon200StatusCode,
    NetworkConnectionTimeout,
    NetworkReadTimeout,
    NetworkConnectError,
    NetworkNameResolutionFailed,
    NetworkSslConnectionError,
    NetworkCertificateVerifyFailed,
    NetworkTooManyRedirects,
    NetworkDisconnectionWithoutResponse,
    NetworkReceivedIncompleteBody,
    NetworkIllegalRequestLine,
    NetworkDecodingError,
    NetworkUnsupportedProtocol,
    ProxyCouldNotResolveHost,
    ProxyConnectionRefused,
    ProxyNoRouteToHost,
    ProxyAllSuspended,
    ParsingBaseError,
    ParsingUnicodeDecodeError,
    ParsingFormatError,
    ParsingFeedContentNotFound,
    ProtocolNoEntriesInFeed,
}

impl FeedError {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedError::NetworkUnknown => "network_unknown",
            FeedError::NetworkNon200StatusCode => "network_non_200_status_code",
            FeedError::NetworkConnectionTimeout => "network_connection_timeout",
            FeedError::NetworkReadTimeout => "network_read_timeout",
            FeedError::NetworkConnectError => "network_connect_error",
            FeedError::NetworkNameResolutionFailed => "network_name_resolution_failed",
            FeedError::NetworkSslConnectionError => "network_ssl_connection_error",
            FeedError::NetworkCertificateVerifyFailed => "network_certificate_verify_failed",
            FeedError::NetworkTooManyRedirects => "network_too_many_redirects",
            FeedError::NetworkDisconnectionWithoutResponse => "network_disconnection_without_response",
            FeedError::NetworkReceivedIncompleteBody => "network_received_incomplete_body",
            FeedError::NetworkIllegalRequestLine => "network_illegal_request_line",
            FeedError::NetworkDecodingError => "network_decoding_error",
            FeedError::NetworkUnsupportedProtocol => "network_unsupported_protocol",
            FeedError::ProxyCouldNotResolveHost => "proxy_could_not_resolve_host",
            FeedError::ProxyConnectionRefused => "proxy_connection_refused",
            FeedError::ProxyNoRouteToHost => "proxy_no_route_to_host",
            FeedError::ProxyAllSuspended => "proxy_all_suspended",
            FeedError::ParsingBaseError => "parsing_base_error",
            FeedError::ParsingUnicodeDecodeError => "parsing_unicode_decode_error",
            FeedError::ParsingFormatError => "parsing_format_error",
            FeedError::ParsingFeedContentNotFound => "parsing_feed_content_not_found",
            FeedError::ProtocolNoEntriesInFeed => "protocol_no_entries_in_feed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let error = match value {
            "network_unknown" => FeedError::NetworkUnknown,
            "network_non_200_status_code" => FeedError::NetworkNon200StatusCode,
            "network_connection_timeout" => FeedError::NetworkConnectionTimeout,
            "network_read_timeout" => FeedError::NetworkReadTimeout,
            "network_connect_error" => FeedError::NetworkConnectError,
            "network_name_resolution_failed" => FeedError::NetworkNameResolutionFailed,
            "network_ssl_connection_error" => FeedError::NetworkSslConnectionError,
            "network_certificate_verify_failed" => FeedError::NetworkCertificateVerifyFailed,
            "network_too_many_redirects" => FeedError::NetworkTooManyRedirects,
            "network_disconnection_without_response" => FeedError::NetworkDisconnectionWithoutResponse,
            "network_received_incomplete_body" => FeedError::NetworkReceivedIncompleteBody,
            "network_illegal_request_line" => FeedError::NetworkIllegalRequestLine,
            "network_decoding_error" => FeedError::NetworkDecodingError,
            "network_unsupported_protocol" => FeedError::NetworkUnsupportedProtocol,
            "proxy_could_not_resolve_host" => FeedError::ProxyCouldNotResolveHost,
            "proxy_connection_refused" => FeedError::ProxyConnectionRefused,
            "proxy_no_route_to_host" => FeedError::ProxyNoRouteToHost,
            "proxy_all_suspended" => FeedError::ProxyAllSuspended,
            "parsing_base_error" => FeedError::ParsingBaseError,
            "parsing_unicode_decode_error" => FeedError::ParsingUnicodeDecodeError,
            "parsing_format_error" => FeedError::ParsingFormatError,
            "parsing_feed_content_not_found" => FeedError::ParsingFeedContentNotFound,
            "protocol_no_entries_in_feed" => FeedError::ProtocolNoEntriesInFeed,
            other => return Err(Error::General(format!("unknown feed error code: {}", other))),
        };

        Ok(error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feed {
    pub id: Uuid,
    pub source_id: Uuid,
    pub url: String,
    pub state: FeedState,
    pub last_error: Option<FeedError>,
    pub load_attempted_at: Option<DateTime<Utc>>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Immutable content record. Uniqueness is `(source_id, external_id)`, not
/// `(feed_id, external_id)`: the same physical article can arrive through
/// several feed urls of one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: Uuid,
    pub source_id: Uuid,
    pub title: String,
    pub body: String,
    pub external_id: String,
    pub external_url: Option<String>,
    pub external_tags: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub cataloged_at: DateTime<Utc>,
}

impl Entry {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.cataloged_at
    }
}

#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub entries: Vec<ParsedEntry>,
}

#[derive(Debug, Clone)]
pub struct ParsedEntry {
    pub external_id: String,
    pub external_url: Option<String>,
    pub title: String,
    pub body: String,
    pub external_tags: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Per-processor cursor over the total order `(cataloged_at, entry_id)` of
/// cataloged entries. Advanced only by queue planning, inside the same
/// transaction as the queue insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorPointer {
    pub processor_id: i32,
    pub pointer_created_at: DateTime<Utc>,
    pub pointer_entry_id: Uuid,
}

impl ProcessorPointer {
    pub fn zero(processor_id: i32) -> Self {
        Self {
            processor_id,
            pointer_created_at: DateTime::<Utc>::UNIX_EPOCH,
            pointer_entry_id: Uuid::nil(),
        }
    }

    pub fn watermark(&self) -> (DateTime<Utc>, Uuid) {
        (self.pointer_created_at, self.pointer_entry_id)
    }

    /// Watermarks only ever move forward.
    pub fn can_advance_to(&self, cataloged_at: DateTime<Utc>, entry_id: Uuid) -> bool {
        (cataloged_at, entry_id) > self.watermark()
    }
}

/// Integer cost representation for the resource ledger: 1 USD = 10^9 points.
/// Floats appear only at config boundaries; everything reserved or spent is
/// integral so the SQL budget predicate stays exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct CostPoints(pub i64);

pub const COST_POINTS_PER_USD: i64 = 1_000_000_000;

impl CostPoints {
    pub fn from_usd(usd: f64) -> Self {
        CostPoints((usd * COST_POINTS_PER_USD as f64).round() as i64)
    }

    pub fn to_usd(&self) -> f64 {
        self.0 as f64 / COST_POINTS_PER_USD as f64
    }

    pub fn saturating_add(&self, other: CostPoints) -> CostPoints {
        CostPoints(self.0.saturating_add(other.0))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("feed load failed: {}", .code.as_str())]
    Load { code: FeedError },

    #[error("all proxies are suspended")]
    AllProxiesSuspended,

    #[error("no funded API key available, skip and continue later")]
    SkipAndContinueLater,

    #[error("feeds from collections must not be processed with subscriber API keys")]
    UserKeyForCollectionFeed,

    #[error("cannot convert reserved cost to used: no matching reservation")]
    CannotConvertReserved,

    #[error("model is not known to the provider: {model}")]
    ModelNotKnown { model: String },

    #[error("entry text exceeds the per-entry token ceiling of model {model}")]
    EntryTooLargeForModel { model: String },

    #[error("LLM provider rejected the request: {0}")]
    ProviderRejected(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    General(String),
}

impl Error {
    pub fn load(code: FeedError) -> Self {
        Error::Load { code }
    }

    /// The feed-level error code for this failure, if it maps to one.
    pub fn feed_error_code(&self) -> Option<FeedError> {
        match self {
            Error::Load { code } => Some(*code),
            Error::AllProxiesSuspended => Some(FeedError::ProxyAllSuspended),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
