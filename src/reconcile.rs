//! Writes dispatch results back to staging, the audit ledger and the source rows.
use anyhow::Result;
use chrono::Utc;
use tracing::{debug, instrument};

use crate::audit::AuditLedger;
use crate::db::{self, OutcomeUpdate, Pool};
use crate::gateway::{RecordResult, RecordStatus};
use crate::model::{EntityKind, OperationType};

#[derive(Clone)]
pub struct ReconciliationWriter {
    pool: Pool,
}

impl ReconciliationWriter {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    #[instrument(skip_all, fields(results = results.len()))]
    pub async fn apply(&self, results: &[RecordResult]) -> Result<()> {
        for result in results {
            self.apply_one(result).await?;
        }
        Ok(())
    }

    /// One transaction per record: staged outcome, audit entries and the
    /// source row's sync columns commit or fail together.
    pub async fn apply_one(&self, result: &RecordResult) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        db::update_record_outcome_tx(
            &mut tx,
            result.record_id,
            &OutcomeUpdate {
                outcome: result.outcome(),
                external_id: result.external_id().map(str::to_string),
                error_text: result.error_text(),
                attempts: i64::from(result.attempts),
            },
        )
        .await?;

        // Dry runs touch staging only.
        if let (
            false,
            RecordStatus::Succeeded {
                external_id,
                board_id,
                changes,
                ..
            },
        ) = (result.dry_run, &result.status)
        {
            if let Some(external_id) = external_id {
                AuditLedger::record_in(
                    &mut tx,
                    &result.batch_id,
                    result.entity,
                    board_id.as_deref(),
                    external_id,
                    changes,
                )
                .await?;
            }
            if result.entity != EntityKind::Group {
                match (result.operation, external_id) {
                    (OperationType::Delete, _) => {
                        db::clear_source_row_sync_tx(
                            &mut tx,
                            &result.source_reference,
                            &result.business_key,
                            now,
                        )
                        .await?;
                    }
                    (_, Some(external_id)) => {
                        db::mark_source_row_synced_tx(
                            &mut tx,
                            &result.source_reference,
                            &result.business_key,
                            external_id,
                            result.content_hash.as_deref(),
                            now,
                        )
                        .await?;
                    }
                    (_, None) => {}
                }
            }
        }

        tx.commit().await?;
        debug!(
            record_id = result.record_id,
            outcome = result.outcome().as_str(),
            "record reconciled"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewSourceRow;
    use crate::gateway::{FailureKind, FieldChange};
    use crate::model::{NewStagedRecord, RecordOutcome};

    async fn setup() -> (Pool, i64) {
        let pool = db::init_memory_pool().await.unwrap();
        db::upsert_source_row(
            &pool,
            &NewSourceRow {
                source: "orders".into(),
                business_key: "SO-1".into(),
                entity: EntityKind::Item,
                group_title: None,
                parent_key: None,
                fields: [("qty".to_string(), "2".to_string())].into_iter().collect(),
                deleted: false,
            },
        )
        .await
        .unwrap();
        let mut tx = pool.begin().await.unwrap();
        db::insert_batch_tx(&mut tx, "b1", "orders", "100", 1)
            .await
            .unwrap();
        let id = db::insert_staged_record_tx(
            &mut tx,
            "b1",
            &NewStagedRecord {
                entity: EntityKind::Item,
                operation: OperationType::Create,
                business_key: "SO-1".into(),
                parent_key: None,
                payload: [("qty".to_string(), "2".to_string())].into_iter().collect(),
                content_hash: Some("h1".into()),
                source_reference: "orders".into(),
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        (pool, id)
    }

    fn result(record_id: i64, status: RecordStatus, dry_run: bool) -> RecordResult {
        RecordResult {
            record_id,
            batch_id: "b1".into(),
            entity: EntityKind::Item,
            business_key: "SO-1".into(),
            operation: OperationType::Create,
            source_reference: "orders".into(),
            content_hash: Some("h1".into()),
            status,
            attempts: 2,
            dry_run,
        }
    }

    fn success() -> RecordStatus {
        RecordStatus::Succeeded {
            external_id: Some("42".into()),
            board_id: Some("100".into()),
            changes: vec![FieldChange {
                field: "qty".into(),
                old_value: None,
                new_value: Some("2".into()),
            }],
            mismatches: Vec::new(),
        }
    }

    #[tokio::test]
    async fn success_updates_every_side() {
        let (pool, id) = setup().await;
        let writer = ReconciliationWriter::new(pool.clone());
        writer.apply(&[result(id, success(), false)]).await.unwrap();

        let staged = &db::fetch_staged_records(&pool, "b1").await.unwrap()[0];
        assert_eq!(staged.outcome, RecordOutcome::Succeeded);
        assert_eq!(staged.external_id.as_deref(), Some("42"));
        assert_eq!(staged.attempt_count, 2);

        let row = db::fetch_source_row(&pool, "orders", "SO-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.external_id.as_deref(), Some("42"));
        assert_eq!(row.last_synced_hash.as_deref(), Some("h1"));

        let audit = db::fetch_audit_entries(&pool, "b1").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].new_value.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn failure_leaves_source_row_unsynced() {
        let (pool, id) = setup().await;
        let writer = ReconciliationWriter::new(pool.clone());
        let failed = RecordStatus::Failed {
            kind: FailureKind::Permanent,
            error: "rejected (ColumnValueException): bad".into(),
        };
        writer.apply(&[result(id, failed, false)]).await.unwrap();

        let staged = &db::fetch_staged_records(&pool, "b1").await.unwrap()[0];
        assert_eq!(staged.outcome, RecordOutcome::Failed);
        assert!(staged.error_text.as_deref().unwrap().contains("bad"));
        let row = db::fetch_source_row(&pool, "orders", "SO-1")
            .await
            .unwrap()
            .unwrap();
        assert!(row.last_synced_hash.is_none());
        assert!(db::fetch_audit_entries(&pool, "b1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dry_run_touches_staging_only() {
        let (pool, id) = setup().await;
        let writer = ReconciliationWriter::new(pool.clone());
        writer.apply(&[result(id, success(), true)]).await.unwrap();

        let staged = &db::fetch_staged_records(&pool, "b1").await.unwrap()[0];
        assert_eq!(staged.outcome, RecordOutcome::Succeeded);
        let row = db::fetch_source_row(&pool, "orders", "SO-1")
            .await
            .unwrap()
            .unwrap();
        assert!(row.external_id.is_none());
        assert!(db::fetch_audit_entries(&pool, "b1").await.unwrap().is_empty());
    }
}
