use std::collections::HashSet;

use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::types::{Entry, Result};

pub fn row_to_entry(row: &PgRow) -> Result<Entry> {
    let tags_json: serde_json::Value = row.try_get("external_tags")?;
    let external_tags: Vec<String> = serde_json::from_value(tags_json)?;

    Ok(Entry {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        external_id: row.try_get("external_id")?,
        external_url: row.try_get("external_url")?,
        external_tags,
        published_at: row.try_get("published_at")?,
        cataloged_at: row.try_get("cataloged_at")?,
    })
}

/// Stores entries, silently skipping ones already cataloged for the source.
/// Returns how many were actually new.
pub async fn catalog_entries(pool: &PgPool, entries: &[Entry]) -> Result<usize> {
    let mut stored = 0;

    for entry in entries {
        let result = sqlx::query(
            r#"
            INSERT INTO entries
                (id, source_id, title, body, external_id, external_url, external_tags, published_at, cataloged_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (source_id, external_id) DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(entry.source_id)
        .bind(&entry.title)
        .bind(&entry.body)
        .bind(&entry.external_id)
        .bind(&entry.external_url)
        .bind(serde_json::to_value(&entry.external_tags)?)
        .bind(entry.published_at)
        .bind(entry.cataloged_at)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            stored += 1;
        }
    }

    if stored > 0 {
        info!(stored, total = entries.len(), "entries_cataloged");
    }

    Ok(stored)
}

pub async fn find_existing_external_ids(
    pool: &PgPool,
    source_id: Uuid,
    external_ids: &[String],
) -> Result<HashSet<String>> {
    let rows = sqlx::query("SELECT external_id FROM entries WHERE source_id = $1 AND external_id = ANY($2)")
        .bind(source_id)
        .bind(external_ids)
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| row.try_get("external_id").map_err(Into::into))
        .collect()
}

pub async fn get_entries_by_ids(pool: &PgPool, entry_ids: &[Uuid]) -> Result<Vec<Entry>> {
    let rows = sqlx::query("SELECT * FROM entries WHERE id = ANY($1)")
        .bind(entry_ids)
        .fetch_all(pool)
        .await?;

    rows.iter().map(row_to_entry).collect()
}

/// Entries strictly after the `(cataloged_at, id)` watermark, oldest first.
/// Runs against any executor so queue planning can call it inside its
/// transaction.
pub async fn entries_after_pointer<'e>(
    executor: impl PgExecutor<'e>,
    pointer_created_at: chrono::DateTime<chrono::Utc>,
    pointer_entry_id: Uuid,
    chunk: i64,
) -> Result<Vec<(Uuid, chrono::DateTime<chrono::Utc>)>> {
    let rows = sqlx::query(
        r#"
        SELECT id, cataloged_at
        FROM entries
        WHERE (cataloged_at, id) > ($1, $2)
        ORDER BY cataloged_at ASC, id ASC
        LIMIT $3
        "#,
    )
    .bind(pointer_created_at)
    .bind(pointer_entry_id)
    .bind(chunk)
    .fetch_all(executor)
    .await?;

    rows.iter()
        .map(|row| Ok((row.try_get("id")?, row.try_get("cataloged_at")?)))
        .collect()
}

/// Keeps at most `max_entries` newest entries per source, deleting the
/// oldest tail.
pub async fn trim_source_entries(pool: &PgPool, source_id: Uuid, max_entries: i64) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM entries
        WHERE source_id = $1
          AND id IN (
              SELECT id FROM entries
              WHERE source_id = $1
              ORDER BY cataloged_at DESC, id DESC
              OFFSET $2
          )
        "#,
    )
    .bind(source_id)
    .bind(max_entries)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
