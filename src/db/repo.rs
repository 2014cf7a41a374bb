use super::model::{NewAuditEntry, NewSourceRow, OutcomeUpdate};
use crate::columns::BoardSchema;
use crate::model::{
    AuditEntry, Batch, BatchCounts, BatchStatus, EntityKind, ExternalEntityRef, NewStagedRecord,
    OperationType, Payload, RecordOutcome, SourceRow, StagedRecord, ValidationStatus,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Transaction};
use sqlx::{Sqlite, SqlitePool};
use std::collections::BTreeMap;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePoolOptions::new()
        .connect(&format!("{normalized}{}", create_flag(&normalized)))
        .await
        .with_context(|| format!("failed to open database {normalized}"))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Single-connection in-memory database with migrations applied. Every
/// pooled connection to `sqlite::memory:` is its own database, so the pool
/// must never grow or recycle its connection.
pub async fn init_memory_pool() -> Result<Pool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

fn create_flag(url: &str) -> &'static str {
    if url.starts_with("sqlite://") && !url.contains("mode=") {
        if url.contains('?') {
            "&mode=rwc"
        } else {
            "?mode=rwc"
        }
    } else {
        ""
    }
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("failed to serialise column")
}

fn from_json<T: serde::de::DeserializeOwned + Default>(raw: Option<String>) -> Result<T> {
    match raw {
        Some(raw) if !raw.trim().is_empty() => {
            serde_json::from_str(&raw).context("failed to parse JSON column")
        }
        _ => Ok(T::default()),
    }
}

fn parse_entity(raw: &str) -> Result<EntityKind> {
    EntityKind::parse(raw).ok_or_else(|| anyhow!("unknown entity kind {raw}"))
}

// ---------------------------------------------------------------------------
// Source rows
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn upsert_source_row(pool: &Pool, row: &NewSourceRow) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO source_rows (source, business_key, entity, group_title, parent_key, fields, deleted) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (source, business_key) DO UPDATE SET \
            entity = excluded.entity, group_title = excluded.group_title, \
            parent_key = excluded.parent_key, fields = excluded.fields, deleted = excluded.deleted \
         RETURNING id",
    )
    .bind(&row.source)
    .bind(&row.business_key)
    .bind(row.entity.as_str())
    .bind(&row.group_title)
    .bind(&row.parent_key)
    .bind(to_json(&row.fields)?)
    .bind(row.deleted)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

fn map_source_row(row: &SqliteRow) -> Result<SourceRow> {
    let entity: String = row.get("entity");
    Ok(SourceRow {
        id: row.get("id"),
        source: row.get("source"),
        business_key: row.get("business_key"),
        entity: parse_entity(&entity)?,
        group_title: row
            .try_get::<Option<String>, _>("group_title")?
            .filter(|s| !s.trim().is_empty()),
        parent_key: row
            .try_get::<Option<String>, _>("parent_key")?
            .filter(|s| !s.trim().is_empty()),
        fields: from_json(row.try_get("fields")?)?,
        deleted: row.get::<bool, _>("deleted"),
        external_id: row.try_get("external_id")?,
        last_synced_hash: row.try_get("last_synced_hash")?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

#[instrument(skip_all)]
pub async fn list_source_rows(pool: &Pool, source: &str) -> Result<Vec<SourceRow>> {
    let rows = sqlx::query("SELECT * FROM source_rows WHERE source = ? ORDER BY id")
        .bind(source)
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to read source {source}"))?;
    rows.iter().map(map_source_row).collect()
}

pub async fn fetch_source_row(
    pool: &Pool,
    source: &str,
    business_key: &str,
) -> Result<Option<SourceRow>> {
    let row = sqlx::query("SELECT * FROM source_rows WHERE source = ? AND business_key = ?")
        .bind(source)
        .bind(business_key)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_source_row).transpose()
}

/// Close the change-detection loop for one row.
pub async fn mark_source_row_synced_tx(
    tx: &mut Transaction<'_, Sqlite>,
    source: &str,
    business_key: &str,
    external_id: &str,
    content_hash: Option<&str>,
    synced_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE source_rows SET external_id = ?, last_synced_hash = COALESCE(?, last_synced_hash), \
         last_synced_at = ? WHERE source = ? AND business_key = ?",
    )
    .bind(external_id)
    .bind(content_hash)
    .bind(synced_at)
    .bind(source)
    .bind(business_key)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Forget the remote side of a row whose external entity was deleted.
pub async fn clear_source_row_sync_tx(
    tx: &mut Transaction<'_, Sqlite>,
    source: &str,
    business_key: &str,
    synced_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE source_rows SET external_id = NULL, last_synced_hash = NULL, last_synced_at = ? \
         WHERE source = ? AND business_key = ?",
    )
    .bind(synced_at)
    .bind(source)
    .bind(business_key)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Force the rows last synced to `external_id` to classify as changes again.
pub async fn reset_source_row_hash_tx(
    tx: &mut Transaction<'_, Sqlite>,
    external_id: &str,
) -> Result<u64> {
    let res = sqlx::query("UPDATE source_rows SET last_synced_hash = NULL WHERE external_id = ?")
        .bind(external_id)
        .execute(&mut **tx)
        .await?;
    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// Source leases
// ---------------------------------------------------------------------------

/// Take the sync lease on a source/board pair. `false` means another holder's
/// lease has not expired yet.
#[instrument(skip_all)]
pub async fn acquire_source_lease(
    pool: &Pool,
    source: &str,
    board_id: &str,
    holder: &str,
    now: DateTime<Utc>,
    ttl: chrono::Duration,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO source_leases (source, board_id, holder, acquired_at, expires_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT (source, board_id) DO UPDATE SET holder = excluded.holder, \
            acquired_at = excluded.acquired_at, expires_at = excluded.expires_at \
         WHERE datetime(source_leases.expires_at) <= datetime(excluded.acquired_at)",
    )
    .bind(source)
    .bind(board_id)
    .bind(holder)
    .bind(now)
    .bind(now + ttl)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn release_source_lease(
    pool: &Pool,
    source: &str,
    board_id: &str,
    holder: &str,
) -> Result<bool> {
    let res = sqlx::query("DELETE FROM source_leases WHERE source = ? AND board_id = ? AND holder = ?")
        .bind(source)
        .bind(board_id)
        .bind(holder)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

pub async fn insert_batch_tx(
    tx: &mut Transaction<'_, Sqlite>,
    batch_id: &str,
    source: &str,
    board_id: &str,
    total: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_batches (id, status, source, board_id, total_count, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(batch_id)
    .bind(BatchStatus::Pending.as_str())
    .bind(source)
    .bind(board_id)
    .bind(total)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn map_batch(row: &SqliteRow) -> Result<Batch> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let status = BatchStatus::parse(&status)
        .ok_or_else(|| anyhow!("batch {} has unknown status {}", id, status))?;
    Ok(Batch {
        status,
        source: row.get("source"),
        board_id: row.get("board_id"),
        claimed_by: row.try_get("claimed_by")?,
        counts: BatchCounts {
            total: row.get("total_count"),
            valid: row.get("valid_count"),
            invalid: row.get("invalid_count"),
            succeeded: row.get("succeeded_count"),
            failed: row.get("failed_count"),
            skipped: row.get("skipped_count"),
        },
        created_at: row.get("created_at"),
        completed_at: row.try_get("completed_at")?,
        id,
    })
}

#[instrument(skip_all)]
pub async fn fetch_batch(pool: &Pool, batch_id: &str) -> Result<Batch> {
    let row = sqlx::query("SELECT * FROM sync_batches WHERE id = ?")
        .bind(batch_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Err(anyhow!("batch {} not found", batch_id));
    };
    map_batch(&row)
}

/// Compare-and-set on the batch status. Returns the new status, or an error
/// if the transition is illegal or the batch is no longer in `from`.
#[instrument(skip_all)]
pub async fn set_batch_status(
    pool: &Pool,
    batch_id: &str,
    from: BatchStatus,
    to: BatchStatus,
) -> Result<BatchStatus> {
    let next = from.advance(to)?;
    let completed_at = next.is_terminal().then(Utc::now);
    let res = sqlx::query(
        "UPDATE sync_batches SET status = ?, completed_at = COALESCE(completed_at, ?), \
         cleaned_at = CASE WHEN ? = 'CLEANED' THEN ? ELSE cleaned_at END \
         WHERE id = ? AND status = ?",
    )
    .bind(next.as_str())
    .bind(completed_at)
    .bind(next.as_str())
    .bind(Utc::now())
    .bind(batch_id)
    .bind(from.as_str())
    .execute(pool)
    .await?;
    if res.rows_affected() != 1 {
        return Err(anyhow!(
            "batch {} is not in status {} (wanted {})",
            batch_id,
            from,
            next
        ));
    }
    Ok(next)
}

#[instrument(skip_all)]
pub async fn save_batch_counts(pool: &Pool, batch_id: &str, counts: &BatchCounts) -> Result<()> {
    sqlx::query(
        "UPDATE sync_batches SET total_count = ?, valid_count = ?, invalid_count = ?, \
         succeeded_count = ?, failed_count = ?, skipped_count = ? WHERE id = ?",
    )
    .bind(counts.total)
    .bind(counts.valid)
    .bind(counts.invalid)
    .bind(counts.succeeded)
    .bind(counts.failed)
    .bind(counts.skipped)
    .bind(batch_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Atomically take ownership of a batch and its records. `false` means some
/// other worker already owns it.
#[instrument(skip_all)]
pub async fn claim_batch(pool: &Pool, batch_id: &str, worker: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE sync_batches SET claimed_by = ?, claimed_at = ? \
         WHERE id = ? AND claimed_by IS NULL AND status IN ('PENDING', 'VALIDATING', 'VALID')",
    )
    .bind(worker)
    .bind(Utc::now())
    .bind(batch_id)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() != 1 {
        tx.rollback().await?;
        return Ok(false);
    }
    sqlx::query("UPDATE staged_records SET claimed_by = ?, updated_at = ? WHERE batch_id = ?")
        .bind(worker)
        .bind(Utc::now())
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(true)
}

#[instrument(skip_all)]
pub async fn release_batch_claim(pool: &Pool, batch_id: &str, worker: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE sync_batches SET claimed_by = NULL, claimed_at = NULL WHERE id = ? AND claimed_by = ?",
    )
    .bind(batch_id)
    .bind(worker)
    .execute(&mut *tx)
    .await?;
    sqlx::query("UPDATE staged_records SET claimed_by = NULL WHERE batch_id = ? AND claimed_by = ?")
        .bind(batch_id)
        .bind(worker)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Staged records
// ---------------------------------------------------------------------------

pub async fn insert_staged_record_tx(
    tx: &mut Transaction<'_, Sqlite>,
    batch_id: &str,
    record: &NewStagedRecord,
) -> Result<i64> {
    let now = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO staged_records (batch_id, entity, operation, business_key, parent_key, payload, \
         content_hash, validation_status, source_reference, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(batch_id)
    .bind(record.entity.as_str())
    .bind(record.operation.as_str())
    .bind(&record.business_key)
    .bind(&record.parent_key)
    .bind(to_json(&record.payload)?)
    .bind(&record.content_hash)
    .bind(ValidationStatus::Pending.as_str())
    .bind(&record.source_reference)
    .bind(now)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

fn map_staged_record(row: &SqliteRow) -> Result<StagedRecord> {
    let id: i64 = row.get("id");
    let entity: String = row.get("entity");
    let operation: String = row.get("operation");
    let validation: String = row.get("validation_status");
    let outcome: String = row.get("outcome");
    Ok(StagedRecord {
        id,
        batch_id: row.get("batch_id"),
        entity: parse_entity(&entity)?,
        operation: OperationType::parse(&operation)
            .ok_or_else(|| anyhow!("record {} has unknown operation {}", id, operation))?,
        business_key: row.get("business_key"),
        parent_key: row.try_get("parent_key")?,
        payload: from_json::<Payload>(row.try_get("payload")?)?,
        content_hash: row.try_get("content_hash")?,
        validation_status: ValidationStatus::parse(&validation)
            .ok_or_else(|| anyhow!("record {} has unknown validation {}", id, validation))?,
        validation_errors: from_json(row.try_get("validation_errors")?)?,
        source_reference: row.get("source_reference"),
        outcome: RecordOutcome::parse(&outcome)
            .ok_or_else(|| anyhow!("record {} has unknown outcome {}", id, outcome))?,
        external_id: row.try_get("external_id")?,
        error_text: row.try_get("error_text")?,
        attempt_count: row.get("attempt_count"),
        claimed_by: row.try_get("claimed_by")?,
    })
}

/// Records of a batch in staging sequence order.
#[instrument(skip_all)]
pub async fn fetch_staged_records(pool: &Pool, batch_id: &str) -> Result<Vec<StagedRecord>> {
    let rows = sqlx::query("SELECT * FROM staged_records WHERE batch_id = ? ORDER BY id")
        .bind(batch_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(map_staged_record).collect()
}

pub async fn set_validation_tx(
    tx: &mut Transaction<'_, Sqlite>,
    record_id: i64,
    status: ValidationStatus,
    errors: &[String],
) -> Result<()> {
    sqlx::query(
        "UPDATE staged_records SET validation_status = ?, validation_errors = ?, updated_at = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(to_json(&errors)?)
    .bind(Utc::now())
    .bind(record_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn update_record_outcome_tx(
    tx: &mut Transaction<'_, Sqlite>,
    record_id: i64,
    update: &OutcomeUpdate,
) -> Result<()> {
    sqlx::query(
        "UPDATE staged_records SET outcome = ?, external_id = COALESCE(?, external_id), error_text = ?, \
         attempt_count = attempt_count + ?, updated_at = ? WHERE id = ?",
    )
    .bind(update.outcome.as_str())
    .bind(&update.external_id)
    .bind(&update.error_text)
    .bind(update.attempts)
    .bind(Utc::now())
    .bind(record_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn update_record_outcome(
    pool: &Pool,
    record_id: i64,
    update: &OutcomeUpdate,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    update_record_outcome_tx(&mut tx, record_id, update).await?;
    tx.commit().await?;
    Ok(())
}

/// Delete staged records of CLEANED batches cleaned before `cutoff`.
#[instrument(skip_all)]
pub async fn sweep_staged_records(pool: &Pool, cutoff: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query(
        "DELETE FROM staged_records WHERE batch_id IN ( \
            SELECT id FROM sync_batches WHERE status = 'CLEANED' \
            AND datetime(cleaned_at) <= datetime(?))",
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// External entity refs
// ---------------------------------------------------------------------------

fn map_entity_ref(row: &SqliteRow) -> Result<ExternalEntityRef> {
    let entity: String = row.get("entity");
    Ok(ExternalEntityRef {
        board_id: row.get("board_id"),
        business_key: row.get("business_key"),
        entity: parse_entity(&entity)?,
        external_id: row.get("external_id"),
        parent_external_id: row.try_get("parent_external_id")?,
        item_board_id: row.try_get("item_board_id")?,
        synced_values: from_json(row.try_get("synced_values")?)?,
    })
}

pub async fn fetch_entity_ref(
    pool: &Pool,
    board_id: &str,
    business_key: &str,
) -> Result<Option<ExternalEntityRef>> {
    let row = sqlx::query("SELECT * FROM external_entity_refs WHERE board_id = ? AND business_key = ?")
        .bind(board_id)
        .bind(business_key)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_entity_ref).transpose()
}

#[instrument(skip_all)]
pub async fn upsert_entity_ref(pool: &Pool, entity_ref: &ExternalEntityRef) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO external_entity_refs (board_id, business_key, entity, external_id, parent_external_id, \
         item_board_id, synced_values, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (board_id, business_key) DO UPDATE SET external_id = excluded.external_id, \
            parent_external_id = COALESCE(excluded.parent_external_id, parent_external_id), \
            item_board_id = COALESCE(excluded.item_board_id, item_board_id), \
            synced_values = excluded.synced_values, updated_at = excluded.updated_at",
    )
    .bind(&entity_ref.board_id)
    .bind(&entity_ref.business_key)
    .bind(entity_ref.entity.as_str())
    .bind(&entity_ref.external_id)
    .bind(&entity_ref.parent_external_id)
    .bind(&entity_ref.item_board_id)
    .bind(to_json(&entity_ref.synced_values)?)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to persist external entity ref")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_entity_ref(pool: &Pool, board_id: &str, business_key: &str) -> Result<()> {
    sqlx::query("DELETE FROM external_entity_refs WHERE board_id = ? AND business_key = ?")
        .bind(board_id)
        .bind(business_key)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn count_entity_refs(pool: &Pool, board_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM external_entity_refs WHERE board_id = ?")
        .bind(board_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Overwrite one remembered field value of an entity (used after rollback).
pub async fn set_synced_value_tx(
    tx: &mut Transaction<'_, Sqlite>,
    external_id: &str,
    field: &str,
    value: Option<&str>,
) -> Result<()> {
    let raw: Option<String> =
        sqlx::query_scalar("SELECT synced_values FROM external_entity_refs WHERE external_id = ? LIMIT 1")
            .bind(external_id)
            .fetch_optional(&mut **tx)
            .await?;
    let Some(raw) = raw else {
        return Ok(());
    };
    let mut synced_values: Payload = from_json(Some(raw))?;
    match value {
        Some(v) => {
            synced_values.insert(field.to_string(), v.to_string());
        }
        None => {
            synced_values.remove(field);
        }
    }
    sqlx::query("UPDATE external_entity_refs SET synced_values = ?, updated_at = ? WHERE external_id = ?")
        .bind(to_json(&synced_values)?)
        .bind(Utc::now())
        .bind(external_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Point an entity ref at another parent (an item moved back between groups).
pub async fn set_parent_external_id_tx(
    tx: &mut Transaction<'_, Sqlite>,
    external_id: &str,
    parent_external_id: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE external_entity_refs SET parent_external_id = ?, updated_at = ? WHERE external_id = ?",
    )
    .bind(parent_external_id)
    .bind(Utc::now())
    .bind(external_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Board schemas
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn save_board_schema(pool: &Pool, schema: &BoardSchema) -> Result<()> {
    sqlx::query(
        "INSERT INTO board_schemas (board_id, schema, fetched_at) VALUES (?, ?, ?) \
         ON CONFLICT (board_id) DO UPDATE SET schema = excluded.schema, fetched_at = excluded.fetched_at",
    )
    .bind(&schema.board_id)
    .bind(to_json(schema)?)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to cache board schema")?;
    Ok(())
}

pub async fn fetch_board_schema(pool: &Pool, board_id: &str) -> Result<Option<BoardSchema>> {
    let raw: Option<String> = sqlx::query_scalar("SELECT schema FROM board_schemas WHERE board_id = ?")
        .bind(board_id)
        .fetch_optional(pool)
        .await?;
    raw.map(|raw| serde_json::from_str(&raw).context("failed to parse cached board schema"))
        .transpose()
}

// ---------------------------------------------------------------------------
// Audit ledger
// ---------------------------------------------------------------------------

pub async fn insert_audit_entry_tx(
    tx: &mut Transaction<'_, Sqlite>,
    entry: &NewAuditEntry,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO audit_entries (batch_id, entity, board_id, external_id, field, old_value, new_value, attempted_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&entry.batch_id)
    .bind(entry.entity.as_str())
    .bind(&entry.board_id)
    .bind(&entry.external_id)
    .bind(&entry.field)
    .bind(&entry.old_value)
    .bind(&entry.new_value)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

fn map_audit_entry(row: &SqliteRow) -> Result<AuditEntry> {
    let entity: String = row.get("entity");
    Ok(AuditEntry {
        id: row.get("id"),
        batch_id: row.get("batch_id"),
        entity: parse_entity(&entity)?,
        board_id: row.try_get("board_id")?,
        external_id: row.get("external_id"),
        field: row.get("field"),
        old_value: row.try_get("old_value")?,
        new_value: row.try_get("new_value")?,
        attempted_at: row.get("attempted_at"),
        rolled_back_at: row.try_get("rolled_back_at")?,
        rollback_reason: row.try_get("rollback_reason")?,
    })
}

/// Entries of a batch, newest first.
#[instrument(skip_all)]
pub async fn fetch_audit_entries(pool: &Pool, batch_id: &str) -> Result<Vec<AuditEntry>> {
    let rows = sqlx::query(
        "SELECT * FROM audit_entries WHERE batch_id = ? ORDER BY datetime(attempted_at) DESC, id DESC",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(map_audit_entry).collect()
}

pub async fn mark_audit_rolled_back_tx(
    tx: &mut Transaction<'_, Sqlite>,
    entry_id: i64,
    at: DateTime<Utc>,
    reason: &str,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE audit_entries SET rolled_back_at = ?, rollback_reason = ? \
         WHERE id = ? AND rolled_back_at IS NULL",
    )
    .bind(at)
    .bind(reason)
    .bind(entry_id)
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Staged counts of a batch grouped by outcome.
pub async fn count_outcomes(pool: &Pool, batch_id: &str) -> Result<BTreeMap<String, i64>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT outcome, COUNT(*) FROM staged_records WHERE batch_id = ? GROUP BY outcome",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().collect())
}
