use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use feed_rs::parser::{ParseErrorKind, ParseFeedError};
use futures::future::join_all;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::background::SingleRun;
use crate::config::LoaderConfig;
use crate::feeds;
use crate::fetcher::Fetcher;
use crate::library;
use crate::proxies::ProxyPool;
use crate::types::{Entry, Error, Feed, FeedError, ParsedEntry, ParsedFeed, Result};

/// Parses a fetched body into the internal feed shape. Entries without any
/// usable external id are dropped rather than failing the whole feed.
pub fn parse_feed(body: &str) -> Result<ParsedFeed> {
    let parsed = feed_rs::parser::parse(body.as_bytes()).map_err(|error| {
        let code = match error {
            ParseFeedError::ParseError(ParseErrorKind::NoFeedRoot) => FeedError::ParsingFeedContentNotFound,
            _ => FeedError::ParsingFormatError,
        };
        Error::load(code)
    })?;

    let mut entries = Vec::new();

    for entry in parsed.entries {
        let external_url = entry.links.first().map(|link| link.href.clone());

        let external_id = if entry.id.is_empty() {
            match &external_url {
                Some(url) => url.clone(),
                None => continue,
            }
        } else {
            entry.id
        };

        let body = entry
            .content
            .and_then(|content| content.body)
            .or_else(|| entry.summary.as_ref().map(|text| text.content.clone()))
            .unwrap_or_default();

        let external_tags = entry
            .categories
            .iter()
            .map(|category| category.label.clone().unwrap_or_else(|| category.term.clone()))
            .collect();

        entries.push(ParsedEntry {
            external_id,
            external_url,
            title: entry.title.map(|text| text.content).unwrap_or_default(),
            body,
            external_tags,
            published_at: entry.published.or(entry.updated),
        });
    }

    if entries.is_empty() {
        return Err(Error::load(FeedError::ProtocolNoEntriesInFeed));
    }

    Ok(ParsedFeed {
        title: parsed.title.map(|text| text.content),
        description: parsed.description.map(|text| text.content),
        entries,
    })
}

/// The feed loading daemon. Each run claims a batch of due feeds, fetches
/// them concurrently through the proxy rotation and settles every feed as
/// loaded, damaged or orphaned.
pub struct FeedsLoader {
    pool: PgPool,
    config: LoaderConfig,
    proxies: Arc<ProxyPool>,
    fetcher: Fetcher,
}

impl FeedsLoader {
    pub fn new(pool: PgPool, config: LoaderConfig) -> Result<Self> {
        let proxies = Arc::new(ProxyPool::new(&config)?);
        let fetcher = Fetcher::new(proxies.clone(), config.max_concurrent_http_requests);

        Ok(Self {
            pool,
            config,
            proxies,
            fetcher,
        })
    }

    pub fn proxies(&self) -> Arc<ProxyPool> {
        self.proxies.clone()
    }

    async fn load_and_store(&self, feed: &Feed) -> Result<()> {
        let body = self.fetcher.fetch_feed(&feed.url).await?;

        let parsed = parse_feed(&body)?;

        if parsed.title != feed.title || parsed.description != feed.description {
            feeds::sync_metadata(&self.pool, feed.id, parsed.title.as_deref(), parsed.description.as_deref()).await?;
        }

        let external_ids: Vec<String> = parsed
            .entries
            .iter()
            .map(|entry| entry.external_id.clone())
            .collect();

        let existing = library::find_existing_external_ids(&self.pool, feed.source_id, &external_ids).await?;

        let now = Utc::now();

        let new_entries: Vec<Entry> = parsed
            .entries
            .into_iter()
            .filter(|entry| !existing.contains(&entry.external_id))
            .map(|entry| Entry {
                id: Uuid::new_v4(),
                source_id: feed.source_id,
                title: entry.title,
                body: entry.body,
                external_id: entry.external_id,
                external_url: entry.external_url,
                external_tags: entry.external_tags,
                published_at: entry.published_at,
                cataloged_at: now,
            })
            .collect();

        library::catalog_entries(&self.pool, &new_entries).await?;

        library::trim_source_entries(&self.pool, feed.source_id, self.config.max_entries_per_source).await?;

        Ok(())
    }

    /// Settles one claimed feed. Feed-level failures are recorded on the
    /// feed row; anything else is an infrastructure failure and propagates.
    async fn process_feed(&self, feed: &Feed) -> Result<()> {
        if feeds::is_orphan(&self.pool, feed.id).await? {
            info!(feed_id = %feed.id, url = %feed.url, "feed_orphaned");
            return feeds::mark_orphaned(&self.pool, feed.id).await;
        }

        match self.load_and_store(feed).await {
            Ok(()) => feeds::mark_loaded(&self.pool, feed.id).await,
            Err(error) => match error.feed_error_code() {
                Some(code) => {
                    warn!(feed_id = %feed.id, url = %feed.url, code = code.as_str(), "feed_damaged");
                    feeds::mark_damaged(&self.pool, feed.id, code).await
                }
                None => Err(error),
            },
        }
    }
}

#[async_trait]
impl SingleRun for FeedsLoader {
    async fn single_run(&self) -> Result<()> {
        self.proxies.refresh_if_due(&self.pool).await?;

        let attempted_before = Utc::now() - Duration::seconds(self.config.minimum_period_secs);

        let feeds = feeds::claim_next_feeds(&self.pool, self.config.batch_size, attempted_before).await?;

        if feeds.is_empty() {
            return Ok(());
        }

        let results = join_all(feeds.iter().map(|feed| self.process_feed(feed))).await;

        for result in results {
            result?;
        }

        info!(loaded = feeds.len(), "loader_run_finished");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
    <rss version="2.0">
      <channel>
        <title>Example</title>
        <description>Example feed</description>
        <item>
          <guid>post-1</guid>
          <title>First post</title>
          <link>https://example.com/post-1</link>
          <description>Hello</description>
          <category>rust</category>
        </item>
        <item>
          <title>No guid, link as id</title>
          <link>https://example.com/post-2</link>
        </item>
      </channel>
    </rss>"#;

    #[test]
    fn parses_rss_with_guid_and_link_fallback() {
        let parsed = parse_feed(RSS).unwrap();

        assert_eq!(parsed.title.as_deref(), Some("Example"));
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[0].external_id, "post-1");
        assert_eq!(parsed.entries[0].external_tags, vec!["rust".to_string()]);
        // The parser synthesizes an id when the item has no guid.
        assert!(!parsed.entries[1].external_id.is_empty());
        assert_eq!(
            parsed.entries[1].external_url.as_deref(),
            Some("https://example.com/post-2")
        );
    }

    #[test]
    fn html_body_is_not_a_feed() {
        let error = parse_feed("<html><body>hi</body></html>").unwrap_err();

        assert_eq!(error.feed_error_code(), Some(FeedError::ParsingFeedContentNotFound));
    }

    #[test]
    fn feed_without_entries_is_a_protocol_error() {
        let empty = r#"<?xml version="1.0"?>
        <rss version="2.0"><channel><title>Empty</title></channel></rss>"#;

        let error = parse_feed(empty).unwrap_err();

        assert_eq!(error.feed_error_code(), Some(FeedError::ProtocolNoEntriesInFeed));
    }
}
