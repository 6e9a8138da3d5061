use std::collections::HashSet;

use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::types::Result;

/// Opaque tag normalization hook. Processors emit raw tags; everything the
/// rest of the system sees has passed through a normalizer first.
pub trait TagNormalizer: Send + Sync {
    fn normalize(&self, tags: Vec<String>) -> Vec<String>;
}

/// Lowercases, trims, collapses inner whitespace to dashes and drops
/// duplicates and empty tags. Enough for feed and LLM output alike.
pub struct BasicNormalizer;

impl TagNormalizer for BasicNormalizer {
    fn normalize(&self, tags: Vec<String>) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut normalized = Vec::new();

        for tag in tags {
            let tag = tag
                .trim()
                .to_lowercase()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join("-");

            if tag.is_empty() {
                continue;
            }

            if seen.insert(tag.clone()) {
                normalized.push(tag);
            }
        }

        normalized
    }
}

async fn get_or_create_tag_id(pool: &PgPool, name: &str) -> Result<i64> {
    sqlx::query(
        r#"
        INSERT INTO tags (name)
        VALUES ($1)
        ON CONFLICT (name) DO NOTHING
        "#,
    )
    .bind(name)
    .execute(pool)
    .await?;

    let row = sqlx::query("SELECT id FROM tags WHERE name = $1")
        .bind(name)
        .fetch_one(pool)
        .await?;

    Ok(row.try_get("id")?)
}

/// Persists a processor's verdict about one entry. Idempotent: reprocessing
/// an entry with the same tags is a no-op.
pub async fn apply_tags_to_entry(
    pool: &PgPool,
    normalizer: &dyn TagNormalizer,
    entry_id: Uuid,
    processor_id: i32,
    tags: Vec<String>,
) -> Result<()> {
    let tags = normalizer.normalize(tags);

    for tag in &tags {
        let tag_id = get_or_create_tag_id(pool, tag).await?;

        sqlx::query(
            r#"
            INSERT INTO entry_tags (entry_id, tag_id, processor_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (entry_id, tag_id, processor_id) DO NOTHING
            "#,
        )
        .bind(entry_id)
        .bind(tag_id)
        .bind(processor_id)
        .execute(pool)
        .await?;
    }

    debug!(%entry_id, processor_id, tags = tags.len(), "tags_applied");

    Ok(())
}

pub async fn entry_tags(pool: &PgPool, entry_id: Uuid) -> Result<Vec<String>> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT t.name
        FROM entry_tags et
        JOIN tags t ON t.id = et.tag_id
        WHERE et.entry_id = $1
        ORDER BY t.name
        "#,
    )
    .bind(entry_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| row.try_get("name").map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizer_lowercases_and_dashes() {
        let tags = BasicNormalizer.normalize(vec![
            "  Machine Learning ".to_string(),
            "RUST".to_string(),
            "rust".to_string(),
            "   ".to_string(),
        ]);

        assert_eq!(tags, vec!["machine-learning".to_string(), "rust".to_string()]);
    }

    #[test]
    fn normalizer_keeps_first_occurrence_order() {
        let tags = BasicNormalizer.normalize(vec!["b".to_string(), "a".to_string(), "B".to_string()]);

        assert_eq!(tags, vec!["b".to_string(), "a".to_string()]);
    }
}
