//! End-to-end run: detect → stage → claim → validate → plan → dispatch →
//! reconcile, with the batch advanced through its lifecycle along the way.
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::AuditLedger;
use crate::board::BoardApi;
use crate::config::{ColumnMapping, Config};
use crate::db::{self, Pool};
use crate::detect::ChangeDetector;
use crate::gateway::rate_limit::{Clock, RateLimiter, TokioClock};
use crate::gateway::{ApiGateway, GatewaySettings, RecordResult, RecordStatus};
use crate::model::{
    group_key, AuditEntry, BatchCounts, BatchStatus, ChangeKind, EntityKind, NewStagedRecord,
    OperationType, Payload, SourceRow, TITLE_FIELD,
};
use crate::planner::{by_level, BatchPlanner};
use crate::reconcile::ReconciliationWriter;
use crate::staging::StagingStore;
use crate::validate::{InvalidRecord, ValidationRules, Validator};

/// Immutable run settings derived from the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub board_id: String,
    pub subitem_board_id: Option<String>,
    pub max_batch_size: usize,
    pub max_workers: usize,
    pub columns: Vec<ColumnMapping>,
    pub hash_columns: Vec<String>,
    pub rules: ValidationRules,
    pub retention: chrono::Duration,
    /// Lifetime of the per-source run lease.
    pub lease_ttl: chrono::Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRecord {
    pub record_id: i64,
    pub business_key: String,
    pub error: String,
}

/// Human-readable summary of one run, plus the process exit code.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub source: String,
    pub batch_id: Option<String>,
    /// Final batch status; `None` when nothing was staged or the claim was lost.
    pub status: Option<BatchStatus>,
    /// No record passed validation.
    pub rejected: bool,
    /// Another run held the source lease or the batch claim.
    pub claim_lost: bool,
    pub cancelled: bool,
    pub dry_run: bool,
    pub counts: BatchCounts,
    pub invalid: Vec<InvalidRecord>,
    pub failed: Vec<FailedRecord>,
    pub skipped: Vec<FailedRecord>,
    /// Succeeded records whose echoed values disagreed with what was sent.
    pub mismatched: Vec<FailedRecord>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        match self.status {
            None | Some(BatchStatus::Complete) | Some(BatchStatus::Cleaned) => 0,
            Some(BatchStatus::Failed) | Some(BatchStatus::Invalid) if self.rejected => 3,
            Some(BatchStatus::Partial) => 2,
            Some(_) => 1,
        }
    }

    fn verdict(&self) -> String {
        match (self.status, self.rejected, self.claim_lost) {
            (_, _, true) if self.batch_id.is_none() => {
                "SKIPPED (source is being synced by another run)".to_string()
            }
            (_, _, true) => "SKIPPED (batch claimed by another worker)".to_string(),
            (None, _, _) => "NOTHING TO DO".to_string(),
            (Some(_), true, _) => "INVALID".to_string(),
            (Some(status), false, _) => status.to_string(),
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source {}", self.source)?;
        if let Some(batch_id) = &self.batch_id {
            write!(f, ", batch {batch_id}")?;
        }
        write!(f, ": {}", self.verdict())?;
        if self.dry_run {
            write!(f, " (dry run)")?;
        }
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        writeln!(f)?;
        let c = &self.counts;
        writeln!(
            f,
            "  total {}  valid {}  invalid {}  succeeded {}  failed {}  skipped {}",
            c.total, c.valid, c.invalid, c.succeeded, c.failed, c.skipped
        )?;
        for rec in &self.invalid {
            writeln!(
                f,
                "  INVALID {} (#{}): {}",
                rec.business_key,
                rec.record_id,
                rec.reasons.join("; ")
            )?;
        }
        for rec in &self.failed {
            writeln!(f, "  FAILED  {} (#{}): {}", rec.business_key, rec.record_id, rec.error)?;
        }
        for rec in &self.skipped {
            writeln!(f, "  SKIPPED {} (#{}): {}", rec.business_key, rec.record_id, rec.error)?;
        }
        for rec in &self.mismatched {
            writeln!(f, "  CHECK   {} (#{}): {}", rec.business_key, rec.record_id, rec.error)?;
        }
        Ok(())
    }
}

pub struct Orchestrator {
    pool: Pool,
    settings: SyncSettings,
    staging: StagingStore,
    gateway: ApiGateway,
    detector: ChangeDetector,
    planner: BatchPlanner,
    reconciler: ReconciliationWriter,
    ledger: AuditLedger,
}

impl Orchestrator {
    pub fn new(
        pool: Pool,
        api: Arc<dyn BoardApi>,
        settings: SyncSettings,
        gateway_settings: GatewaySettings,
        worker_id: impl Into<String>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
        let limiter = RateLimiter::shared(gateway_settings.rate_limit, clock.clone());
        Self::with_limiter(pool, api, settings, gateway_settings, worker_id, limiter, clock)
    }

    /// Use a limiter shared with other orchestrators in the process, and a
    /// specific clock.
    pub fn with_limiter(
        pool: Pool,
        api: Arc<dyn BoardApi>,
        settings: SyncSettings,
        gateway_settings: GatewaySettings,
        worker_id: impl Into<String>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let gateway =
            ApiGateway::with_limiter(api, pool.clone(), gateway_settings, limiter, clock);
        Self {
            staging: StagingStore::new(pool.clone(), worker_id),
            detector: ChangeDetector::new(settings.hash_columns.clone()),
            planner: BatchPlanner::new(settings.max_batch_size),
            reconciler: ReconciliationWriter::new(pool.clone()),
            ledger: AuditLedger::new(pool.clone()),
            gateway,
            settings,
            pool,
        }
    }

    pub fn from_config(cfg: &Config, pool: Pool, api: Arc<dyn BoardApi>) -> Self {
        let worker_id = cfg
            .app
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
        Self::new(
            pool,
            api,
            cfg.sync_settings(),
            cfg.gateway_settings(),
            worker_id,
        )
    }

    pub fn staging(&self) -> &StagingStore {
        &self.staging
    }

    pub fn gateway(&self) -> &ApiGateway {
        &self.gateway
    }

    pub fn ledger(&self) -> &AuditLedger {
        &self.ledger
    }

    /// Detect changes in `source`, stage them as a new batch and drive it.
    /// Runs on the same source and board never overlap: a run that finds the
    /// source lease taken returns at once with `claim_lost` set.
    #[instrument(skip(self, cancel))]
    pub async fn run(&self, source: &str, cancel: &CancellationToken) -> Result<RunReport> {
        let board_id = self.settings.board_id.as_str();
        if !self
            .staging
            .lease(source, board_id, self.settings.lease_ttl)
            .await?
        {
            warn!("another run is syncing this source; skipping");
            return Ok(RunReport {
                source: source.to_string(),
                claim_lost: true,
                dry_run: self.gateway.is_dry_run(),
                ..Default::default()
            });
        }
        let result = self.run_leased(source, cancel).await;
        if let Err(err) = self.staging.release_lease(source, board_id).await {
            warn!(error = %format!("{err:#}"), "failed to release source lease");
        }
        result
    }

    async fn run_leased(&self, source: &str, cancel: &CancellationToken) -> Result<RunReport> {
        self.gateway
            .refresh_schemas(self.settings.subitem_board_id.as_deref())
            .await
            .context("failed to load board schema")?;
        self.gateway.reset_dry_run();

        let rows = db::list_source_rows(&self.pool, source).await?;
        let records = self.changed_records(source, &rows).await?;
        if records.is_empty() {
            info!("no changes to sync");
            return Ok(RunReport {
                source: source.to_string(),
                dry_run: self.gateway.is_dry_run(),
                ..Default::default()
            });
        }

        let batch_id = self
            .staging
            .stage(source, &self.settings.board_id, &records)
            .await?;
        self.run_batch(&batch_id, cancel).await
    }

    /// Classify every row and turn the changed ones, plus any group they
    /// need that does not exist yet, into records to stage.
    async fn changed_records(
        &self,
        source: &str,
        rows: &[SourceRow],
    ) -> Result<Vec<NewStagedRecord>> {
        let mut records = Vec::new();
        let mut groups = BTreeSet::new();
        let (mut new, mut changed, mut deleted, mut unchanged) = (0, 0, 0, 0);

        for row in rows {
            let change = self
                .detector
                .classify(row, row.last_synced_hash.as_deref());
            match change.kind {
                ChangeKind::New => new += 1,
                ChangeKind::Changed => changed += 1,
                ChangeKind::Deleted => deleted += 1,
                ChangeKind::Unchanged => unchanged += 1,
            }
            let Some(operation) = OperationType::for_change(change.kind) else {
                continue;
            };

            let parent_key = match row.entity {
                EntityKind::Subitem => row.parent_key.clone(),
                _ => row.group_title.as_deref().map(group_key),
            };
            if operation != OperationType::Delete && row.entity == EntityKind::Item {
                if let Some(title) = row.group_title.as_deref() {
                    groups.insert(title.trim().to_string());
                }
            }
            let (payload, content_hash) = match operation {
                OperationType::Delete => (Payload::new(), None),
                _ => (self.map_fields(row), Some(change.content_hash)),
            };
            records.push(NewStagedRecord {
                entity: row.entity,
                operation,
                business_key: row.business_key.clone(),
                parent_key,
                payload,
                content_hash,
                source_reference: source.to_string(),
            });
        }
        info!(new, changed, deleted, unchanged, "change detection finished");

        let mut group_records = Vec::new();
        for title in groups {
            let key = group_key(&title);
            if self.gateway.lookup_ref(&key).await?.is_some() {
                continue;
            }
            group_records.push(NewStagedRecord {
                entity: EntityKind::Group,
                operation: OperationType::Create,
                business_key: key,
                parent_key: None,
                payload: [(TITLE_FIELD.to_string(), title)].into_iter().collect(),
                content_hash: None,
                source_reference: source.to_string(),
            });
        }
        group_records.extend(records);
        Ok(group_records)
    }

    fn map_fields(&self, row: &SourceRow) -> Payload {
        self.settings
            .columns
            .iter()
            .filter_map(|m| {
                row.fields
                    .get(&m.source)
                    .map(|v| (m.target.clone(), v.clone()))
            })
            .collect()
    }

    /// Claim and drive an already staged batch. Losing the claim is not an
    /// error: another worker owns the batch.
    #[instrument(skip(self, cancel))]
    pub async fn run_batch(&self, batch_id: &str, cancel: &CancellationToken) -> Result<RunReport> {
        let batch = self.staging.batch(batch_id).await?;
        let mut report = RunReport {
            source: batch.source.clone(),
            batch_id: Some(batch_id.to_string()),
            dry_run: self.gateway.is_dry_run(),
            ..Default::default()
        };
        if self.staging.claim(batch_id).await?.is_none() {
            warn!("batch already claimed; skipping");
            report.claim_lost = true;
            return Ok(report);
        }

        match self.drive(batch_id, cancel, &mut report).await {
            Ok(()) => Ok(report),
            Err(err) => {
                error!(error = %format!("{err:#}"), "run aborted");
                self.abandon(batch_id).await;
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        batch_id: &str,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) -> Result<()> {
        let mut status = self
            .staging
            .advance(batch_id, BatchStatus::Pending, BatchStatus::Validating)
            .await?;

        let mut schemas = self.gateway.schemas();
        if schemas.items.board_id.is_empty() {
            schemas = self
                .gateway
                .refresh_schemas(self.settings.subitem_board_id.as_deref())
                .await
                .context("failed to load board schema")?;
        }
        let validator = Validator::new(self.pool.clone(), schemas, self.settings.rules.clone());
        let validation = validator.validate(batch_id).await?;
        let records = self.staging.records(batch_id).await?;

        let mut counts = BatchCounts {
            total: records.len() as i64,
            valid: validation.valid as i64,
            invalid: validation.invalid as i64,
            ..Default::default()
        };
        report.invalid = validation.invalid_records;

        if validation.valid == 0 {
            status = self
                .staging
                .advance(batch_id, status, BatchStatus::Invalid)
                .await?;
            status = self
                .staging
                .advance(batch_id, status, BatchStatus::Failed)
                .await?;
            self.staging.save_counts(batch_id, &counts).await?;
            warn!("no record passed validation; batch rejected");
            report.rejected = true;
            report.status = Some(status);
            report.counts = counts;
            return Ok(());
        }

        status = self
            .staging
            .advance(batch_id, status, BatchStatus::Valid)
            .await?;
        status = self
            .staging
            .advance(batch_id, status, BatchStatus::Dispatching)
            .await?;

        let levels = by_level(self.planner.plan(&records));
        let mut results: Vec<RecordResult> = Vec::new();
        let mut aborted: Option<&'static str> = None;

        for (level, groups) in levels {
            if aborted.is_none() && cancel.is_cancelled() {
                aborted = Some("run cancelled");
            }
            if let Some(reason) = aborted {
                let skipped: Vec<RecordResult> = groups
                    .iter()
                    .flat_map(|g| g.records.iter())
                    .map(|r| RecordResult::skipped(r, reason))
                    .collect();
                self.reconciler.apply(&skipped).await?;
                results.extend(skipped);
                continue;
            }

            info!(level = level.as_str(), groups = groups.len(), "dispatching level");
            let level_results: Vec<Vec<RecordResult>> = stream::iter(groups.iter())
                .map(|group| async move {
                    let results = self.gateway.dispatch(group, cancel).await;
                    self.reconciler.apply(&results).await?;
                    Ok::<_, anyhow::Error>(results)
                })
                .buffer_unordered(self.settings.max_workers.max(1))
                .try_collect()
                .await?;
            let level_results: Vec<RecordResult> = level_results.into_iter().flatten().collect();
            if level_results.iter().any(RecordResult::is_infrastructure_failure) {
                aborted = Some("aborted after a local store failure");
            }
            results.extend(level_results);
        }
        results.sort_by_key(|r| r.record_id);

        for result in &results {
            match &result.status {
                RecordStatus::Succeeded { mismatches, .. } => {
                    counts.succeeded += 1;
                    if !mismatches.is_empty() {
                        report.mismatched.push(FailedRecord {
                            record_id: result.record_id,
                            business_key: result.business_key.clone(),
                            error: mismatches.join("; "),
                        });
                    }
                }
                RecordStatus::Failed { error, .. } => {
                    counts.failed += 1;
                    report.failed.push(FailedRecord {
                        record_id: result.record_id,
                        business_key: result.business_key.clone(),
                        error: error.clone(),
                    });
                }
                RecordStatus::Skipped { reason } => {
                    counts.skipped += 1;
                    report.skipped.push(FailedRecord {
                        record_id: result.record_id,
                        business_key: result.business_key.clone(),
                        error: reason.clone(),
                    });
                }
            }
        }

        report.cancelled = cancel.is_cancelled();
        let verdict = final_status(&counts, report.cancelled);
        status = self.staging.advance(batch_id, status, verdict).await?;
        self.staging.save_counts(batch_id, &counts).await?;
        info!(
            status = status.as_str(),
            succeeded = counts.succeeded,
            failed = counts.failed,
            skipped = counts.skipped,
            invalid = counts.invalid,
            "batch finished"
        );
        report.status = Some(status);
        report.counts = counts;
        Ok(())
    }

    /// Best effort after a fatal error: retire the batch and give up the
    /// claim so a later run can stage the rows again.
    async fn abandon(&self, batch_id: &str) {
        match self.staging.batch(batch_id).await {
            Ok(batch) if !batch.status.is_terminal() => {
                let target = match (batch.status, db::count_outcomes(&self.pool, batch_id).await) {
                    (BatchStatus::Dispatching, Ok(outcomes))
                        if outcomes.get("SUCCEEDED").copied().unwrap_or(0) > 0 =>
                    {
                        BatchStatus::Partial
                    }
                    _ => BatchStatus::Failed,
                };
                if let Err(err) = self.staging.advance(batch_id, batch.status, target).await {
                    warn!(error = %format!("{err:#}"), "could not retire batch");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(error = %format!("{err:#}"), "could not read batch"),
        }
        if let Err(err) = self.staging.release(batch_id).await {
            warn!(error = %format!("{err:#}"), "could not release claim");
        }
    }

    /// Replay the batch's audit ledger backwards. A second call is a no-op.
    pub async fn rollback(&self, batch_id: &str, reason: &str) -> Result<Vec<AuditEntry>> {
        if self.gateway.schemas().items.board_id.is_empty() {
            self.gateway
                .refresh_schemas(self.settings.subitem_board_id.as_deref())
                .await
                .context("failed to load board schema")?;
        }
        self.ledger.rollback(&self.gateway, batch_id, reason).await
    }

    pub async fn clean(&self, batch_id: &str) -> Result<BatchStatus> {
        self.staging.mark_cleaned(batch_id).await
    }

    /// Drop staged records of batches cleaned before the retention window.
    pub async fn sweep(&self) -> Result<u64> {
        self.staging.sweep(self.settings.retention).await
    }
}

/// Verdict for a dispatched batch. A cancelled run is never FAILED.
fn final_status(counts: &BatchCounts, cancelled: bool) -> BatchStatus {
    if counts.failed == 0 && counts.skipped == 0 && counts.invalid == 0 && !cancelled {
        BatchStatus::Complete
    } else if counts.succeeded > 0 || cancelled {
        BatchStatus::Partial
    } else {
        BatchStatus::Failed
    }
}
