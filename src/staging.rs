//! Durable holding area for records awaiting dispatch.
use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::db::{self, OutcomeUpdate, Pool};
use crate::model::{Batch, BatchCounts, BatchStatus, NewStagedRecord, StagedRecord};

#[derive(Clone)]
pub struct StagingStore {
    pool: Pool,
    worker_id: String,
}

impl StagingStore {
    pub fn new(pool: Pool, worker_id: impl Into<String>) -> Self {
        Self {
            pool,
            worker_id: worker_id.into(),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Persist `records` under a new PENDING batch. All or nothing.
    #[instrument(skip(self, records), fields(count = records.len()))]
    pub async fn stage(
        &self,
        source: &str,
        board_id: &str,
        records: &[NewStagedRecord],
    ) -> Result<String> {
        let batch_id = Uuid::new_v4().to_string();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("staging store unreachable")?;
        db::insert_batch_tx(&mut tx, &batch_id, source, board_id, records.len() as i64).await?;
        for record in records {
            db::insert_staged_record_tx(&mut tx, &batch_id, record).await?;
        }
        tx.commit().await.context("failed to commit staged batch")?;
        info!(batch_id, "staged batch");
        Ok(batch_id)
    }

    /// Take the source/board lease for one run. `false` means another run
    /// holds it and has not let it lapse.
    #[instrument(skip(self))]
    pub async fn lease(&self, source: &str, board_id: &str, ttl: chrono::Duration) -> Result<bool> {
        let taken = db::acquire_source_lease(
            &self.pool,
            source,
            board_id,
            &self.worker_id,
            Utc::now(),
            ttl,
        )
        .await?;
        if !taken {
            debug!(worker = %self.worker_id, "source lease held elsewhere");
        }
        Ok(taken)
    }

    pub async fn release_lease(&self, source: &str, board_id: &str) -> Result<bool> {
        db::release_source_lease(&self.pool, source, board_id, &self.worker_id).await
    }

    /// Take ownership of the batch. `None` means another worker holds it.
    #[instrument(skip(self))]
    pub async fn claim(&self, batch_id: &str) -> Result<Option<Vec<StagedRecord>>> {
        if !db::claim_batch(&self.pool, batch_id, &self.worker_id).await? {
            debug!(worker = %self.worker_id, "claim lost");
            return Ok(None);
        }
        Ok(Some(db::fetch_staged_records(&self.pool, batch_id).await?))
    }

    pub async fn release(&self, batch_id: &str) -> Result<bool> {
        db::release_batch_claim(&self.pool, batch_id, &self.worker_id).await
    }

    pub async fn mark_outcome(&self, record_id: i64, update: &OutcomeUpdate) -> Result<()> {
        db::update_record_outcome(&self.pool, record_id, update).await
    }

    pub async fn records(&self, batch_id: &str) -> Result<Vec<StagedRecord>> {
        db::fetch_staged_records(&self.pool, batch_id).await
    }

    pub async fn batch(&self, batch_id: &str) -> Result<Batch> {
        db::fetch_batch(&self.pool, batch_id).await
    }

    pub async fn advance(
        &self,
        batch_id: &str,
        from: BatchStatus,
        to: BatchStatus,
    ) -> Result<BatchStatus> {
        db::set_batch_status(&self.pool, batch_id, from, to).await
    }

    pub async fn save_counts(&self, batch_id: &str, counts: &BatchCounts) -> Result<()> {
        db::save_batch_counts(&self.pool, batch_id, counts).await
    }

    /// Retire a finished batch so its records become sweepable. Cleaning an
    /// already CLEANED batch is a no-op.
    pub async fn mark_cleaned(&self, batch_id: &str) -> Result<BatchStatus> {
        let batch = self.batch(batch_id).await?;
        if batch.status == BatchStatus::Cleaned {
            return Ok(BatchStatus::Cleaned);
        }
        self.advance(batch_id, batch.status, BatchStatus::Cleaned)
            .await
    }

    /// Delete staged records of batches cleaned more than `older_than` ago.
    #[instrument(skip(self))]
    pub async fn sweep(&self, older_than: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - older_than;
        let removed = db::sweep_staged_records(&self.pool, cutoff).await?;
        info!(removed, "swept staged records");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKind, OperationType, RecordOutcome};

    fn record(key: &str) -> NewStagedRecord {
        NewStagedRecord {
            entity: EntityKind::Item,
            operation: OperationType::Create,
            business_key: key.into(),
            parent_key: None,
            payload: [("name".to_string(), key.to_string())].into_iter().collect(),
            content_hash: Some(format!("hash-{key}")),
            source_reference: "orders".into(),
        }
    }

    #[tokio::test]
    async fn stage_creates_pending_batch() {
        let pool = db::init_memory_pool().await.unwrap();
        let store = StagingStore::new(pool, "w1");
        let batch_id = store
            .stage("orders", "100", &[record("SO-1"), record("SO-2")])
            .await
            .unwrap();
        let batch = store.batch(&batch_id).await.unwrap();
        assert_eq!(batch.status, BatchStatus::Pending);
        assert_eq!(batch.counts.total, 2);
        let records = store.records(&batch_id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].id < records[1].id);
        assert_eq!(records[0].outcome, RecordOutcome::Pending);
    }

    #[tokio::test]
    async fn duplicate_keys_roll_back_the_whole_batch() {
        let pool = db::init_memory_pool().await.unwrap();
        let store = StagingStore::new(pool.clone(), "w1");
        let err = store
            .stage("orders", "100", &[record("SO-1"), record("SO-1")])
            .await;
        assert!(err.is_err());
        let batches: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_batches")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(batches, 0);
    }

    #[tokio::test]
    async fn second_worker_loses_the_claim() {
        let pool = db::init_memory_pool().await.unwrap();
        let first = StagingStore::new(pool.clone(), "w1");
        let second = StagingStore::new(pool, "w2");
        let batch_id = first.stage("orders", "100", &[record("SO-1")]).await.unwrap();

        let claimed = first.claim(&batch_id).await.unwrap().unwrap();
        assert_eq!(claimed[0].claimed_by.as_deref(), Some("w1"));
        assert!(second.claim(&batch_id).await.unwrap().is_none());

        assert!(first.release(&batch_id).await.unwrap());
        assert!(second.claim(&batch_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_removes_only_cleaned_batches() {
        let pool = db::init_memory_pool().await.unwrap();
        let store = StagingStore::new(pool, "w1");
        let done = store.stage("orders", "100", &[record("SO-1")]).await.unwrap();
        let open = store.stage("orders", "100", &[record("SO-2")]).await.unwrap();

        store
            .advance(&done, BatchStatus::Pending, BatchStatus::Failed)
            .await
            .unwrap();
        assert_eq!(
            store.mark_cleaned(&done).await.unwrap(),
            BatchStatus::Cleaned
        );
        assert_eq!(
            store.mark_cleaned(&done).await.unwrap(),
            BatchStatus::Cleaned
        );
        // A PENDING batch cannot be cleaned.
        assert!(store.mark_cleaned(&open).await.is_err());

        assert_eq!(store.sweep(chrono::Duration::zero()).await.unwrap(), 1);
        assert!(store.records(&done).await.unwrap().is_empty());
        assert_eq!(store.records(&open).await.unwrap().len(), 1);
    }
}
