use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::library;
use crate::types::{Error, ProcessorPointer, Result};

/// Loads the pointer row for a processor, creating it lazily at the zero
/// watermark. The row is locked for the rest of the transaction so two
/// planners never advance the same pointer concurrently.
async fn get_or_create_pointer(tx: &mut Transaction<'_, Postgres>, processor_id: i32) -> Result<ProcessorPointer> {
    let zero = ProcessorPointer::zero(processor_id);

    sqlx::query(
        r#"
        INSERT INTO processor_pointers (processor_id, pointer_created_at, pointer_entry_id)
        VALUES ($1, $2, $3)
        ON CONFLICT (processor_id) DO NOTHING
        "#,
    )
    .bind(processor_id)
    .bind(zero.pointer_created_at)
    .bind(zero.pointer_entry_id)
    .execute(&mut **tx)
    .await?;

    let row = sqlx::query(
        r#"
        SELECT processor_id, pointer_created_at, pointer_entry_id
        FROM processor_pointers
        WHERE processor_id = $1
        FOR UPDATE
        "#,
    )
    .bind(processor_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(ProcessorPointer {
        processor_id: row.try_get("processor_id")?,
        pointer_created_at: row.try_get("pointer_created_at")?,
        pointer_entry_id: row.try_get("pointer_entry_id")?,
    })
}

async fn save_pointer(tx: &mut Transaction<'_, Postgres>, pointer: &ProcessorPointer) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE processor_pointers
        SET pointer_created_at = $2, pointer_entry_id = $3, updated_at = NOW()
        WHERE processor_id = $1
        "#,
    )
    .bind(pointer.processor_id)
    .bind(pointer.pointer_created_at)
    .bind(pointer.pointer_entry_id)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::General(format!(
            "cannot save pointer for unknown processor {}",
            pointer.processor_id
        )));
    }

    Ok(())
}

/// Tops up the processor's queue from the entry stream. No-op while the
/// queue holds at least `fill_when_below` entries. Otherwise, in a single
/// transaction: fetch up to `chunk` entries past the watermark, insert them
/// idempotently, advance the pointer to the last fetched entry. A crash
/// between fetch and commit therefore never loses or duplicates watermark
/// progress. Returns how many entries were fetched.
pub async fn plan_processor_queue(
    pool: &PgPool,
    processor_id: i32,
    fill_when_below: i64,
    chunk: i64,
) -> Result<usize> {
    let depth = count_queue_entries(pool, processor_id).await?;

    if depth >= fill_when_below {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;

    let mut pointer = get_or_create_pointer(&mut tx, processor_id).await?;

    let entries = library::entries_after_pointer(
        &mut *tx,
        pointer.pointer_created_at,
        pointer.pointer_entry_id,
        chunk,
    )
    .await?;

    let Some(&(last_id, last_cataloged_at)) = entries.last() else {
        tx.commit().await?;
        return Ok(0);
    };

    for (entry_id, _) in &entries {
        sqlx::query(
            r#"
            INSERT INTO processor_queue (processor_id, entry_id)
            VALUES ($1, $2)
            ON CONFLICT (processor_id, entry_id) DO NOTHING
            "#,
        )
        .bind(processor_id)
        .bind(entry_id)
        .execute(&mut *tx)
        .await?;
    }

    debug_assert!(pointer.can_advance_to(last_cataloged_at, last_id));

    pointer.pointer_created_at = last_cataloged_at;
    pointer.pointer_entry_id = last_id;

    save_pointer(&mut tx, &pointer).await?;

    tx.commit().await?;

    debug!(processor_id, planned = entries.len(), "processor_queue_planned");

    Ok(entries.len())
}

pub async fn count_queue_entries(pool: &PgPool, processor_id: i32) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS depth FROM processor_queue WHERE processor_id = $1")
        .bind(processor_id)
        .fetch_one(pool)
        .await?;

    Ok(row.try_get("depth")?)
}

/// Oldest queued entries first. Nothing is removed here: an entry leaves
/// the queue only once its processing outcome is known.
pub async fn pull_queue_entries(pool: &PgPool, processor_id: i32, limit: i64) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        r#"
        SELECT entry_id
        FROM processor_queue
        WHERE processor_id = $1
        ORDER BY created_at ASC, id ASC
        LIMIT $2
        "#,
    )
    .bind(processor_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| row.try_get("entry_id").map_err(Into::into))
        .collect()
}

pub async fn remove_entries_from_queue(pool: &PgPool, processor_id: i32, entry_ids: &[Uuid]) -> Result<()> {
    if entry_ids.is_empty() {
        return Ok(());
    }

    sqlx::query("DELETE FROM processor_queue WHERE processor_id = $1 AND entry_id = ANY($2)")
        .bind(processor_id)
        .bind(entry_ids)
        .execute(pool)
        .await?;

    Ok(())
}

/// Moves an entry to the back of the queue: the retry path for entries the
/// processor asked to revisit later. Delete plus fresh insert in one
/// transaction, so the entry is queued exactly once at all times and never
/// blocks the head of the queue.
pub async fn requeue_entry(pool: &PgPool, processor_id: i32, entry_id: Uuid) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM processor_queue WHERE processor_id = $1 AND entry_id = $2")
        .bind(processor_id)
        .bind(entry_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO processor_queue (processor_id, entry_id)
        VALUES ($1, $2)
        ON CONFLICT (processor_id, entry_id) DO NOTHING
        "#,
    )
    .bind(processor_id)
    .bind(entry_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(())
}

/// Failed entries live apart from the active queue so failures never block
/// pointer progress and can be replayed in bulk.
pub async fn add_entries_to_failed_storage(pool: &PgPool, processor_id: i32, entry_ids: &[Uuid]) -> Result<()> {
    for entry_id in entry_ids {
        sqlx::query(
            r#"
            INSERT INTO failed_entries (processor_id, entry_id)
            VALUES ($1, $2)
            ON CONFLICT (processor_id, entry_id) DO NOTHING
            "#,
        )
        .bind(processor_id)
        .bind(entry_id)
        .execute(pool)
        .await?;
    }

    Ok(())
}

pub async fn count_failed_entries(pool: &PgPool, processor_id: i32) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS failed FROM failed_entries WHERE processor_id = $1")
        .bind(processor_id)
        .fetch_one(pool)
        .await?;

    Ok(row.try_get("failed")?)
}

/// Manual replay: copies up to `limit` failed entries back into the active
/// queue and clears them from failed storage. At-least-once: an entry
/// replayed here may fail and land in failed storage again.
pub async fn move_failed_entries_to_processor_queue(pool: &PgPool, processor_id: i32, limit: i64) -> Result<usize> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        r#"
        SELECT entry_id
        FROM failed_entries
        WHERE processor_id = $1
        ORDER BY created_at ASC
        LIMIT $2
        "#,
    )
    .bind(processor_id)
    .bind(limit)
    .fetch_all(&mut *tx)
    .await?;

    let entry_ids: Vec<Uuid> = rows
        .iter()
        .map(|row| row.try_get("entry_id"))
        .collect::<std::result::Result<_, _>>()?;

    for entry_id in &entry_ids {
        sqlx::query(
            r#"
            INSERT INTO processor_queue (processor_id, entry_id)
            VALUES ($1, $2)
            ON CONFLICT (processor_id, entry_id) DO NOTHING
            "#,
        )
        .bind(processor_id)
        .bind(entry_id)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("DELETE FROM failed_entries WHERE processor_id = $1 AND entry_id = ANY($2)")
        .bind(processor_id)
        .bind(&entry_ids)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    info!(processor_id, moved = entry_ids.len(), "failed_entries_moved_to_queue");

    Ok(entry_ids.len())
}
