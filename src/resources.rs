use std::collections::HashMap;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::types::{CostPoints, Error, Result};

/// What the ledger tracks. Only LLM spend today, but the ledger schema is
/// keyed by kind so other metered resources can share it.
pub const KIND_TOKENS_COST: i32 = 1;

/// One ledger row per subscriber, resource kind and billing interval.
/// `total = used + reserved`; both move only through the operations below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub user_id: Uuid,
    pub kind: i32,
    pub interval_started_at: DateTime<Utc>,
    pub used: CostPoints,
    pub reserved: CostPoints,
}

impl Resource {
    pub fn total(&self) -> CostPoints {
        self.used.saturating_add(self.reserved)
    }
}

fn row_to_resource(row: &PgRow) -> Result<Resource> {
    Ok(Resource {
        user_id: row.try_get("user_id")?,
        kind: row.try_get("kind")?,
        interval_started_at: row.try_get("interval_started_at")?,
        used: CostPoints(row.try_get("used")?),
        reserved: CostPoints(row.try_get("reserved")?),
    })
}

/// Billing intervals are calendar months.
pub fn month_interval_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .expect("first day of a month is always a valid timestamp")
}

pub async fn initialize_resource(
    pool: &PgPool,
    user_id: Uuid,
    kind: i32,
    interval_started_at: DateTime<Utc>,
) -> Result<Resource> {
    sqlx::query(
        r#"
        INSERT INTO resources (user_id, kind, interval_started_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (user_id, kind, interval_started_at) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(kind)
    .bind(interval_started_at)
    .execute(pool)
    .await?;

    let row = sqlx::query(
        r#"
        SELECT * FROM resources
        WHERE user_id = $1 AND kind = $2 AND interval_started_at = $3
        "#,
    )
    .bind(user_id)
    .bind(kind)
    .bind(interval_started_at)
    .fetch_one(pool)
    .await?;

    row_to_resource(&row)
}

pub async fn load_resources(
    pool: &PgPool,
    user_ids: &[Uuid],
    kind: i32,
    interval_started_at: DateTime<Utc>,
) -> Result<HashMap<Uuid, Resource>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM resources
        WHERE user_id = ANY($1) AND kind = $2 AND interval_started_at = $3
        "#,
    )
    .bind(user_ids)
    .bind(kind)
    .bind(interval_started_at)
    .fetch_all(pool)
    .await?;

    let mut resources = HashMap::new();

    for row in &rows {
        let resource = row_to_resource(row)?;
        resources.insert(resource.user_id, resource);
    }

    for user_id in user_ids {
        if !resources.contains_key(user_id) {
            let resource = initialize_resource(pool, *user_id, kind, interval_started_at).await?;
            resources.insert(*user_id, resource);
        }
    }

    Ok(resources)
}

/// Atomically reserves `amount` against the subscriber's limit. The row
/// lock plus the `used + reserved + amount <= limit` predicate make the
/// reservation race-free across replicas without application-level locking.
pub async fn try_to_reserve(
    pool: &PgPool,
    user_id: Uuid,
    kind: i32,
    interval_started_at: DateTime<Utc>,
    amount: CostPoints,
    limit: CostPoints,
) -> Result<bool> {
    initialize_resource(pool, user_id, kind, interval_started_at).await?;

    let result = sqlx::query(
        r#"
        UPDATE resources
        SET reserved = reserved + $4,
            updated_at = NOW()
        WHERE user_id = $1
          AND kind = $2
          AND interval_started_at = $3
          AND used + reserved + $4 <= $5
        "#,
    )
    .bind(user_id)
    .bind(kind)
    .bind(interval_started_at)
    .bind(amount.0)
    .bind(limit.0)
    .execute(pool)
    .await?;

    let reserved = result.rows_affected() > 0;

    debug!(user_id = %user_id, amount = amount.0, reserved, "resource_reservation");

    Ok(reserved)
}

/// Replaces a reservation with the actual spend. Must run exactly once per
/// reservation, on success and on failure alike, or quota headroom leaks.
pub async fn convert_reserved_to_used(
    pool: &PgPool,
    user_id: Uuid,
    kind: i32,
    interval_started_at: DateTime<Utc>,
    used: CostPoints,
    reserved: CostPoints,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE resources
        SET used = used + $4,
            reserved = reserved - $5,
            updated_at = NOW()
        WHERE user_id = $1
          AND kind = $2
          AND interval_started_at = $3
          AND reserved >= $5
        "#,
    )
    .bind(user_id)
    .bind(kind)
    .bind(interval_started_at)
    .bind(used.0)
    .bind(reserved.0)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::CannotConvertReserved);
    }

    Ok(())
}

pub async fn load_resource_history(pool: &PgPool, user_id: Uuid, kind: i32) -> Result<Vec<Resource>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM resources
        WHERE user_id = $1 AND kind = $2
        ORDER BY interval_started_at DESC
        "#,
    )
    .bind(user_id)
    .bind(kind)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_resource).collect()
}
