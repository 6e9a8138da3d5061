use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::types::{Feed, FeedError, FeedState, Result};

fn row_to_feed(row: &PgRow) -> Result<Feed> {
    let state: String = row.try_get("state")?;
    let last_error: Option<String> = row.try_get("last_error")?;

    Ok(Feed {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        url: row.try_get("url")?,
        state: FeedState::parse(&state)?,
        last_error: last_error.as_deref().map(FeedError::parse).transpose()?,
        load_attempted_at: row.try_get("load_attempted_at")?,
        loaded_at: row.try_get("loaded_at")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
    })
}

pub async fn save_feed(pool: &PgPool, feed: &Feed) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO feeds (id, source_id, url, state, title, description)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (url) DO NOTHING
        "#,
    )
    .bind(feed.id)
    .bind(feed.source_id)
    .bind(&feed.url)
    .bind(feed.state.as_str())
    .bind(&feed.title)
    .bind(&feed.description)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_feed(pool: &PgPool, feed_id: Uuid) -> Result<Option<Feed>> {
    let row = sqlx::query("SELECT * FROM feeds WHERE id = $1")
        .bind(feed_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_feed).transpose()
}

pub async fn get_feed_by_url(pool: &PgPool, url: &str) -> Result<Option<Feed>> {
    let row = sqlx::query("SELECT * FROM feeds WHERE url = $1")
        .bind(url)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_feed).transpose()
}

/// Claims a batch of due feeds for this loader instance. The skip-locked
/// select plus the `load_attempted_at` stamp run in one transaction, so
/// concurrent replicas never claim the same feed twice.
pub async fn claim_next_feeds(pool: &PgPool, batch: i64, attempted_before: DateTime<Utc>) -> Result<Vec<Feed>> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        r#"
        SELECT *
        FROM feeds
        WHERE state != 'orphaned'
          AND (load_attempted_at IS NULL OR load_attempted_at <= $1)
        ORDER BY load_attempted_at ASC NULLS FIRST
        LIMIT $2
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(attempted_before)
    .bind(batch)
    .fetch_all(&mut *tx)
    .await?;

    let feeds: Vec<Feed> = rows.iter().map(row_to_feed).collect::<Result<_>>()?;

    let ids: Vec<Uuid> = feeds.iter().map(|feed| feed.id).collect();

    sqlx::query("UPDATE feeds SET load_attempted_at = NOW(), updated_at = NOW() WHERE id = ANY($1)")
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(feeds)
}

/// `last_error` is non-null only while the feed is damaged; a successful
/// load always clears it.
pub async fn mark_loaded(pool: &PgPool, feed_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE feeds
        SET state = 'loaded', last_error = NULL, loaded_at = NOW(), updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(feed_id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn mark_damaged(pool: &PgPool, feed_id: Uuid, code: FeedError) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE feeds
        SET state = 'damaged', last_error = $2, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(feed_id)
    .bind(code.as_str())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn mark_orphaned(pool: &PgPool, feed_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE feeds
        SET state = 'orphaned', last_error = NULL, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(feed_id)
    .execute(pool)
    .await?;

    info!(feed_id = %feed_id, "feed_marked_orphaned");

    Ok(())
}

pub async fn sync_metadata(pool: &PgPool, feed_id: Uuid, title: Option<&str>, description: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE feeds SET title = $2, description = $3, updated_at = NOW() WHERE id = $1")
        .bind(feed_id)
        .bind(title)
        .bind(description)
        .execute(pool)
        .await?;

    Ok(())
}

/// A feed is an orphan when neither a curated collection nor any subscriber
/// references it.
pub async fn is_orphan(pool: &PgPool, feed_id: Uuid) -> Result<bool> {
    let row = sqlx::query(
        r#"
        SELECT
            EXISTS (SELECT 1 FROM feed_collections WHERE feed_id = $1) AS in_collection,
            EXISTS (SELECT 1 FROM feed_links WHERE feed_id = $1) AS has_links
        "#,
    )
    .bind(feed_id)
    .fetch_one(pool)
    .await?;

    let in_collection: bool = row.try_get("in_collection")?;
    let has_links: bool = row.try_get("has_links")?;

    Ok(!in_collection && !has_links)
}

pub async fn any_feed_in_collection(pool: &PgPool, feed_ids: &[Uuid]) -> Result<bool> {
    let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM feed_collections WHERE feed_id = ANY($1)) AS found")
        .bind(feed_ids)
        .fetch_one(pool)
        .await?;

    Ok(row.try_get("found")?)
}

/// Every subscriber linked to any of the given feeds, deduplicated.
pub async fn linked_user_ids(pool: &PgPool, feed_ids: &[Uuid]) -> Result<Vec<Uuid>> {
    let rows = sqlx::query("SELECT DISTINCT user_id FROM feed_links WHERE feed_id = ANY($1)")
        .bind(feed_ids)
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| row.try_get("user_id").map_err(Into::into))
        .collect()
}

/// All feed ids of one source. Entries are stored per source, so this is
/// how an entry maps back to the feeds (and through them to subscribers and
/// collections) it arrived from.
pub async fn feed_ids_for_source(pool: &PgPool, source_id: Uuid) -> Result<Vec<Uuid>> {
    let rows = sqlx::query("SELECT id FROM feeds WHERE source_id = $1")
        .bind(source_id)
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| row.try_get("id").map_err(Into::into))
        .collect()
}

pub async fn add_feed_to_collection(pool: &PgPool, feed_id: Uuid, collection_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO feed_collections (feed_id, collection_id)
        VALUES ($1, $2)
        ON CONFLICT (feed_id, collection_id) DO NOTHING
        "#,
    )
    .bind(feed_id)
    .bind(collection_id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn link_feed_to_user(pool: &PgPool, feed_id: Uuid, user_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO feed_links (feed_id, user_id)
        VALUES ($1, $2)
        ON CONFLICT (feed_id, user_id) DO NOTHING
        "#,
    )
    .bind(feed_id)
    .bind(user_id)
    .execute(pool)
    .await?;

    Ok(())
}
