use chrono::Duration;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::provider::LlmProvider;
use crate::types::{CostPoints, Result};

/// A subscriber's offer to pay for processing: their key, their monthly
/// budget and how stale an entry may be before they stop caring about it.
#[derive(Debug, Clone)]
pub struct UserKeySettings {
    pub user_id: Uuid,
    pub api_key: Option<String>,
    pub max_cost_in_month: CostPoints,
    pub process_entries_not_older_than: Duration,
}

fn row_to_settings(row: &PgRow) -> Result<UserKeySettings> {
    let not_older_than_days: i32 = row.try_get("process_entries_not_older_than_days")?;

    Ok(UserKeySettings {
        user_id: row.try_get("user_id")?,
        api_key: row.try_get("api_key")?,
        max_cost_in_month: CostPoints(row.try_get("max_cost_in_month")?),
        process_entries_not_older_than: Duration::days(not_older_than_days as i64),
    })
}

fn provider_as_str(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::Test => "test",
        LlmProvider::OpenAi => "openai",
    }
}

pub async fn load_for_users(
    pool: &PgPool,
    provider: LlmProvider,
    user_ids: &[Uuid],
) -> Result<Vec<UserKeySettings>> {
    if user_ids.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        r#"
        SELECT user_id, api_key, max_cost_in_month, process_entries_not_older_than_days
        FROM user_settings
        WHERE provider = $1 AND user_id = ANY($2)
        "#,
    )
    .bind(provider_as_str(provider))
    .bind(user_ids)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_settings).collect()
}

pub async fn save(pool: &PgPool, provider: LlmProvider, settings: &UserKeySettings) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO user_settings (user_id, provider, api_key, max_cost_in_month, process_entries_not_older_than_days)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (user_id, provider)
        DO UPDATE SET api_key = EXCLUDED.api_key,
                      max_cost_in_month = EXCLUDED.max_cost_in_month,
                      process_entries_not_older_than_days = EXCLUDED.process_entries_not_older_than_days,
                      updated_at = NOW()
        "#,
    )
    .bind(settings.user_id)
    .bind(provider_as_str(provider))
    .bind(&settings.api_key)
    .bind(settings.max_cost_in_month.0)
    .bind(settings.process_entries_not_older_than.num_days() as i32)
    .execute(pool)
    .await?;

    Ok(())
}
