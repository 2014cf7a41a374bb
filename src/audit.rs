//! Append-only ledger of field mutations and the rollback path that replays it.
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};
use tracing::{info, instrument, warn};

use crate::db::{self, NewAuditEntry, Pool};
use crate::gateway::{ApiGateway, FieldChange};
use crate::model::{AuditEntry, EntityKind, GROUP_FIELD};

#[derive(Clone)]
pub struct AuditLedger {
    pool: Pool,
}

impl AuditLedger {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Append one entry per changed field inside the caller's transaction,
    /// so the entries commit together with the reconciled outcome.
    pub async fn record_in(
        tx: &mut Transaction<'_, Sqlite>,
        batch_id: &str,
        entity: EntityKind,
        board_id: Option<&str>,
        external_id: &str,
        changes: &[FieldChange],
    ) -> Result<usize> {
        for change in changes {
            db::insert_audit_entry_tx(
                tx,
                &NewAuditEntry {
                    batch_id: batch_id.to_string(),
                    entity,
                    board_id: board_id.map(str::to_string),
                    external_id: external_id.to_string(),
                    field: change.field.clone(),
                    old_value: change.old_value.clone(),
                    new_value: change.new_value.clone(),
                },
            )
            .await?;
        }
        Ok(changes.len())
    }

    /// Append a single entry in its own transaction.
    pub async fn record(&self, entry: &NewAuditEntry) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let id = db::insert_audit_entry_tx(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn entries(&self, batch_id: &str) -> Result<Vec<AuditEntry>> {
        db::fetch_audit_entries(&self.pool, batch_id).await
    }

    /// Replay the batch's entries newest first, writing each old value back
    /// through the gateway. Entries already rolled back are skipped, so a
    /// second rollback returns nothing. An entry whose compensation fails
    /// stays unstamped and can be retried.
    #[instrument(skip(self, gateway))]
    pub async fn rollback(
        &self,
        gateway: &ApiGateway,
        batch_id: &str,
        reason: &str,
    ) -> Result<Vec<AuditEntry>> {
        let pending: Vec<AuditEntry> = self
            .entries(batch_id)
            .await?
            .into_iter()
            .filter(|e| e.rolled_back_at.is_none())
            .collect();
        if pending.is_empty() {
            info!("nothing to roll back");
            return Ok(Vec::new());
        }

        let mut replayed = Vec::with_capacity(pending.len());
        for mut entry in pending {
            if let Err(err) = gateway.compensate(&entry).await {
                warn!(
                    entry_id = entry.id,
                    external_id = %entry.external_id,
                    field = %entry.field,
                    error = %err,
                    "compensating mutation failed"
                );
                continue;
            }
            let at = Utc::now();
            if !self.stamp_rolled_back(&entry, at, reason).await? {
                continue;
            }
            entry.rolled_back_at = Some(at);
            entry.rollback_reason = Some(reason.to_string());
            replayed.push(entry);
        }
        info!(replayed = replayed.len(), "rollback finished");
        Ok(replayed)
    }

    /// Stamp one compensated entry and bring the local bookkeeping back in
    /// line with the board: the ref forgets the rolled-back value and the
    /// source row loses its hash, so the next run sees the row as changed.
    async fn stamp_rolled_back(
        &self,
        entry: &AuditEntry,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !db::mark_audit_rolled_back_tx(&mut tx, entry.id, at, reason).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        if entry.entity != EntityKind::Group {
            if entry.field == GROUP_FIELD {
                db::set_parent_external_id_tx(&mut tx, &entry.external_id, entry.old_value.as_deref())
                    .await?;
            } else {
                db::set_synced_value_tx(
                    &mut tx,
                    &entry.external_id,
                    &entry.field,
                    entry.old_value.as_deref(),
                )
                .await?;
            }
            db::reset_source_row_hash_tx(&mut tx, &entry.external_id).await?;
        }
        tx.commit().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_appends_entries() {
        let pool = db::init_memory_pool().await.unwrap();
        let ledger = AuditLedger::new(pool.clone());
        let mut tx = pool.begin().await.unwrap();
        let written = AuditLedger::record_in(
            &mut tx,
            "b1",
            EntityKind::Item,
            Some("100"),
            "42",
            &[
                FieldChange {
                    field: "qty".into(),
                    old_value: Some("1".into()),
                    new_value: Some("2".into()),
                },
                FieldChange {
                    field: "status".into(),
                    old_value: None,
                    new_value: Some("Open".into()),
                },
            ],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(written, 2);

        ledger
            .record(&NewAuditEntry {
                batch_id: "b1".into(),
                entity: EntityKind::Item,
                board_id: Some("100".into()),
                external_id: "42".into(),
                field: "name".into(),
                old_value: Some("old".into()),
                new_value: Some("new".into()),
            })
            .await
            .unwrap();

        let entries = ledger.entries("b1").await.unwrap();
        assert_eq!(entries.len(), 3);
        // Newest first.
        assert_eq!(entries[0].field, "name");
        assert!(entries.iter().all(|e| e.rolled_back_at.is_none()));
    }
}
