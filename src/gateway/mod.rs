//! Rate-limited, retrying execution of dispatch groups against the board.
//!
//! Every outbound call goes through [`ApiGateway::call`], which draws from
//! the shared [`RateLimiter`], bounds the call with a timeout and drives the
//! retry state machine. Entity refs are consulted before each mutation so a
//! rerun never creates a second external entity for the same business key.
use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::board::{ApiError, BoardApi, ColumnValues, MutationAck};
use crate::columns::{BoardSchema, ColumnType, SchemaSet};
use crate::db::{self, Pool};
use crate::detect::normalize;
use crate::model::{
    AuditEntry, EntityKind, ExternalEntityRef, OperationType, Payload, RecordOutcome,
    StagedRecord, GROUP_FIELD, NAME_FIELD, TITLE_FIELD,
};
use crate::planner::DispatchGroup;

pub mod rate_limit;
pub mod retry;

use rate_limit::{Clock, RateLimit, RateLimiter, TokioClock};
use retry::{RetryOutcome, RetryPolicy};

#[derive(Debug, Clone, PartialEq)]
pub struct GatewaySettings {
    pub board_id: String,
    pub max_workers: usize,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimit,
    pub dry_run: bool,
}

/// One field written by a successful mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retries exhausted on timeouts, throttling or 5xx.
    Transient,
    /// Rejected by the platform or missing a parent; never retried.
    Permanent,
    /// The local store failed; the run must stop dispatching.
    Infrastructure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStatus {
    Succeeded {
        /// `None` only for a delete of an entity that never existed.
        external_id: Option<String>,
        /// Board physically holding the entity.
        board_id: Option<String>,
        changes: Vec<FieldChange>,
        /// Columns the platform echoed back with a different value.
        mismatches: Vec<String>,
    },
    Failed {
        kind: FailureKind,
        error: String,
    },
    Skipped {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordResult {
    pub record_id: i64,
    pub batch_id: String,
    pub entity: EntityKind,
    pub business_key: String,
    /// Operation actually performed after the idempotency guard.
    pub operation: OperationType,
    pub source_reference: String,
    pub content_hash: Option<String>,
    pub status: RecordStatus,
    pub attempts: u32,
    pub dry_run: bool,
}

impl RecordResult {
    pub fn outcome(&self) -> RecordOutcome {
        match self.status {
            RecordStatus::Succeeded { .. } => RecordOutcome::Succeeded,
            RecordStatus::Failed { .. } => RecordOutcome::Failed,
            RecordStatus::Skipped { .. } => RecordOutcome::Skipped,
        }
    }

    pub fn external_id(&self) -> Option<&str> {
        match &self.status {
            RecordStatus::Succeeded { external_id, .. } => external_id.as_deref(),
            _ => None,
        }
    }

    pub fn error_text(&self) -> Option<String> {
        match &self.status {
            RecordStatus::Succeeded { mismatches, .. } if mismatches.is_empty() => None,
            RecordStatus::Succeeded { mismatches, .. } => {
                Some(format!("echo mismatch: {}", mismatches.join("; ")))
            }
            RecordStatus::Failed { error, .. } => Some(error.clone()),
            RecordStatus::Skipped { reason } => Some(reason.clone()),
        }
    }

    pub fn is_infrastructure_failure(&self) -> bool {
        matches!(
            self.status,
            RecordStatus::Failed {
                kind: FailureKind::Infrastructure,
                ..
            }
        )
    }

    /// Result for a record that was never handed to the gateway.
    pub fn skipped(record: &StagedRecord, reason: impl Into<String>) -> Self {
        Self {
            record_id: record.id,
            batch_id: record.batch_id.clone(),
            entity: record.entity,
            business_key: record.business_key.clone(),
            operation: record.operation,
            source_reference: record.source_reference.clone(),
            content_hash: record.content_hash.clone(),
            status: RecordStatus::Skipped {
                reason: reason.into(),
            },
            attempts: 0,
            dry_run: false,
        }
    }
}

struct Attempted {
    status: RecordStatus,
    attempts: u32,
}

impl Attempted {
    fn immediate(status: RecordStatus) -> Self {
        Self {
            status,
            attempts: 0,
        }
    }

    fn permanent(error: impl Into<String>) -> Self {
        Self::immediate(RecordStatus::Failed {
            kind: FailureKind::Permanent,
            error: error.into(),
        })
    }
}

enum Parent {
    Root,
    Known(String),
    Missing(String),
}

pub struct ApiGateway {
    api: Arc<dyn BoardApi>,
    pool: Pool,
    settings: GatewaySettings,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    workers: Semaphore,
    schemas: RwLock<Arc<SchemaSet>>,
    text_only: BoardSchema,
    dry_run_refs: Mutex<HashMap<String, ExternalEntityRef>>,
    dry_run_seq: AtomicU64,
}

impl ApiGateway {
    pub fn new(api: Arc<dyn BoardApi>, pool: Pool, settings: GatewaySettings) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
        let limiter = RateLimiter::shared(settings.rate_limit, clock.clone());
        Self::with_limiter(api, pool, settings, limiter, clock)
    }

    /// Build a gateway drawing from an existing limiter, so every gateway in
    /// the process shares one budget.
    pub fn with_limiter(
        api: Arc<dyn BoardApi>,
        pool: Pool,
        settings: GatewaySettings,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let workers = Semaphore::new(settings.max_workers.max(1));
        Self {
            api,
            pool,
            settings,
            limiter,
            clock,
            workers,
            schemas: RwLock::new(Arc::new(SchemaSet::default())),
            text_only: BoardSchema::default(),
            dry_run_refs: Mutex::new(HashMap::new()),
            dry_run_seq: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn is_dry_run(&self) -> bool {
        self.settings.dry_run
    }

    pub fn schemas(&self) -> Arc<SchemaSet> {
        self.schemas
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Load the column metadata of the item board (and the subitem board,
    /// when there is one) and cache it for conversion.
    #[instrument(skip(self))]
    pub async fn refresh_schemas(&self, subitem_board: Option<&str>) -> Result<Arc<SchemaSet>> {
        let items = self.load_schema(&self.settings.board_id).await?;
        let subitems = match subitem_board {
            Some(id) => Some(self.load_schema(id).await?),
            None => None,
        };
        let set = Arc::new(SchemaSet { items, subitems });
        match self.schemas.write() {
            Ok(mut guard) => *guard = set.clone(),
            Err(poisoned) => *poisoned.into_inner() = set.clone(),
        }
        debug!(columns = set.items.columns.len(), "board schema cached");
        Ok(set)
    }

    /// Live runs read the board and store what they saw. Dry runs never touch
    /// the network: they use the stored copy, or convert everything as text
    /// when the board has never been read.
    async fn load_schema(&self, board_id: &str) -> Result<BoardSchema> {
        if self.settings.dry_run {
            if let Some(schema) = db::fetch_board_schema(&self.pool, board_id).await? {
                return Ok(schema);
            }
            warn!(board_id, "no stored schema for dry run; values convert as text");
            return Ok(BoardSchema {
                board_id: board_id.to_string(),
                ..BoardSchema::default()
            });
        }
        let cancel = CancellationToken::new();
        let schema = self
            .call(&cancel, || self.api.board_schema(board_id))
            .await
            .result?;
        db::save_board_schema(&self.pool, &schema).await?;
        Ok(schema)
    }

    /// Forget synthetic ids handed out by a previous dry run.
    pub fn reset_dry_run(&self) {
        self.dry_run_refs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.dry_run_seq.store(0, Ordering::SeqCst);
    }

    /// Known external entity for a business key. Dry runs also see the
    /// synthetic entities they created.
    pub async fn lookup_ref(&self, business_key: &str) -> Result<Option<ExternalEntityRef>> {
        if self.settings.dry_run {
            let planned = self
                .dry_run_refs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(business_key)
                .cloned();
            if planned.is_some() {
                return Ok(planned);
            }
        }
        db::fetch_entity_ref(&self.pool, &self.settings.board_id, business_key).await
    }

    async fn remember(&self, entity_ref: ExternalEntityRef) -> Result<()> {
        if self.settings.dry_run {
            self.dry_run_refs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(entity_ref.business_key.clone(), entity_ref);
            return Ok(());
        }
        db::upsert_entity_ref(&self.pool, &entity_ref).await
    }

    async fn forget(&self, business_key: &str) -> Result<()> {
        if self.settings.dry_run {
            self.dry_run_refs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(business_key);
            return Ok(());
        }
        db::delete_entity_ref(&self.pool, &self.settings.board_id, business_key).await
    }

    fn synthetic_id(&self) -> String {
        let n = self.dry_run_seq.fetch_add(1, Ordering::SeqCst) + 1;
        format!("dry-run-{n}")
    }

    fn schema_for(&self, schemas: &SchemaSet, entity: EntityKind) -> BoardSchema {
        schemas
            .for_entity(entity)
            .cloned()
            .unwrap_or_else(|| self.text_only.clone())
    }

    /// One rate-limited, timed, retried API call. Cancellation is honoured
    /// before the limiter wait and before the call; an issued call runs to
    /// completion.
    async fn call<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let limiter = &self.limiter;
        let timeout = self.settings.call_timeout;
        retry::run(&self.settings.retry, self.clock.as_ref(), |attempt| {
            let call = op();
            async move {
                if cancel.is_cancelled() {
                    return Err(ApiError::Cancelled);
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                    _ = limiter.acquire() => {}
                }
                if cancel.is_cancelled() {
                    return Err(ApiError::Cancelled);
                }
                debug!(attempt, "issuing board API call");
                match tokio::time::timeout(timeout, call).await {
                    Ok(res) => res,
                    Err(_) => Err(ApiError::Timeout),
                }
            }
        })
        .await
    }

    /// Execute one dispatch group. Records run concurrently up to the
    /// worker limit; results come back in staging order.
    #[instrument(skip_all, fields(level = group.level.as_str(), parent = ?group.parent_key, records = group.records.len()))]
    pub async fn dispatch(
        &self,
        group: &DispatchGroup,
        cancel: &CancellationToken,
    ) -> Vec<RecordResult> {
        let mut results: Vec<RecordResult> = stream::iter(group.records.iter())
            .map(|record| self.dispatch_record(record, cancel))
            .buffer_unordered(self.settings.max_workers.max(1))
            .collect()
            .await;
        results.sort_by_key(|r| r.record_id);
        results
    }

    async fn dispatch_record(
        &self,
        record: &StagedRecord,
        cancel: &CancellationToken,
    ) -> RecordResult {
        let _permit = self.workers.acquire().await.ok();
        if cancel.is_cancelled() {
            return self.finish(
                record,
                record.operation,
                Attempted::immediate(RecordStatus::Skipped {
                    reason: "run cancelled".into(),
                }),
            );
        }
        match self.execute(record, cancel).await {
            Ok((operation, attempted)) => self.finish(record, operation, attempted),
            Err(err) => {
                error!(record_id = record.id, error = %format!("{err:#}"), "local store failure during dispatch");
                self.finish(
                    record,
                    record.operation,
                    Attempted::immediate(RecordStatus::Failed {
                        kind: FailureKind::Infrastructure,
                        error: format!("{err:#}"),
                    }),
                )
            }
        }
    }

    fn finish(&self, record: &StagedRecord, operation: OperationType, attempted: Attempted) -> RecordResult {
        match &attempted.status {
            RecordStatus::Succeeded { external_id, .. } => info!(
                record_id = record.id,
                business_key = %record.business_key,
                operation = operation.as_str(),
                external_id = external_id.as_deref().unwrap_or("-"),
                "record dispatched"
            ),
            RecordStatus::Failed { error, .. } => warn!(
                record_id = record.id,
                business_key = %record.business_key,
                attempts = attempted.attempts,
                error = %error,
                "record failed"
            ),
            RecordStatus::Skipped { reason } => {
                debug!(record_id = record.id, reason = %reason, "record skipped")
            }
        }
        RecordResult {
            record_id: record.id,
            batch_id: record.batch_id.clone(),
            entity: record.entity,
            business_key: record.business_key.clone(),
            operation,
            source_reference: record.source_reference.clone(),
            content_hash: record.content_hash.clone(),
            status: attempted.status,
            attempts: attempted.attempts,
            dry_run: self.settings.dry_run,
        }
    }

    async fn execute(
        &self,
        record: &StagedRecord,
        cancel: &CancellationToken,
    ) -> Result<(OperationType, Attempted)> {
        let existing = self.lookup_ref(&record.business_key).await?;
        let operation = match (record.operation, &existing) {
            (OperationType::Create, Some(found)) => {
                info!(
                    business_key = %record.business_key,
                    external_id = %found.external_id,
                    "entity already exists; rewriting CREATE as UPDATE"
                );
                OperationType::Update
            }
            (OperationType::Update, None) => {
                warn!(business_key = %record.business_key, "no external entity to update; creating it");
                OperationType::Create
            }
            (op, _) => op,
        };

        let attempted = match (record.entity, operation) {
            (EntityKind::Group, OperationType::Delete) => {
                Attempted::permanent("groups are never deleted by the sync")
            }
            (_, OperationType::Delete) => self.delete(record, existing, cancel).await?,
            (EntityKind::Group, _) => self.upsert_group(record, existing, cancel).await?,
            (_, OperationType::Create) => self.create_item(record, cancel).await?,
            (_, OperationType::Update) => match existing {
                Some(found) => self.update_item(record, found, cancel).await?,
                None => Attempted::permanent("no external entity to update"),
            },
        };
        Ok((operation, attempted))
    }

    async fn upsert_group(
        &self,
        record: &StagedRecord,
        existing: Option<ExternalEntityRef>,
        cancel: &CancellationToken,
    ) -> Result<Attempted> {
        // A group carries nothing but its title, so a known group is done.
        if let Some(found) = existing {
            return Ok(Attempted::immediate(RecordStatus::Succeeded {
                external_id: Some(found.external_id),
                board_id: None,
                changes: Vec::new(),
                mismatches: Vec::new(),
            }));
        }
        let title = record
            .payload
            .get(TITLE_FIELD)
            .cloned()
            .unwrap_or_default();
        let board_id = self.settings.board_id.as_str();

        let (result, attempts) = if self.settings.dry_run {
            (Ok(self.synthetic_id()), 0)
        } else {
            let outcome = self
                .call(cancel, || self.api.create_group(board_id, &title))
                .await;
            (outcome.result, outcome.attempts)
        };
        let external_id = match result {
            Ok(id) => id,
            Err(err) => return self.recover_existing(record, err, attempts, None, cancel).await,
        };

        let mut synced_values = Payload::new();
        synced_values.insert(TITLE_FIELD.to_string(), title.clone());
        self.remember(ExternalEntityRef {
            board_id: self.settings.board_id.clone(),
            business_key: record.business_key.clone(),
            entity: EntityKind::Group,
            external_id: external_id.clone(),
            parent_external_id: None,
            item_board_id: None,
            synced_values,
        })
        .await?;
        Ok(Attempted {
            status: RecordStatus::Succeeded {
                external_id: Some(external_id),
                board_id: None,
                changes: vec![FieldChange {
                    field: TITLE_FIELD.to_string(),
                    old_value: None,
                    new_value: Some(title),
                }],
                mismatches: Vec::new(),
            },
            attempts,
        })
    }

    async fn resolve_parent(&self, record: &StagedRecord) -> Result<Parent> {
        let Some(parent_key) = record.parent_key.as_deref() else {
            return Ok(Parent::Root);
        };
        Ok(match self.lookup_ref(parent_key).await? {
            Some(found) => Parent::Known(found.external_id),
            None => Parent::Missing(parent_key.to_string()),
        })
    }

    async fn create_item(
        &self,
        record: &StagedRecord,
        cancel: &CancellationToken,
    ) -> Result<Attempted> {
        let schemas = self.schemas();
        let schema = self.schema_for(&schemas, record.entity);
        let values = match schema.column_values(&record.payload) {
            Ok(values) => values,
            Err((field, err)) => return Ok(Attempted::permanent(format!("field '{field}': {err}"))),
        };
        let name = item_name(record);

        let parent = match self.resolve_parent(record).await? {
            Parent::Known(id) => Some(id),
            Parent::Root if record.entity == EntityKind::Item => None,
            Parent::Root => return Ok(Attempted::permanent("subitem has no parent item")),
            Parent::Missing(key) => {
                return Ok(Attempted::permanent(format!(
                    "parent '{key}' has no external id"
                )))
            }
        };

        let (result, attempts) = if self.settings.dry_run {
            let ack = MutationAck {
                id: self.synthetic_id(),
                board_id: None,
                values: Default::default(),
            };
            (Ok(ack), 0)
        } else {
            let board_id = self.settings.board_id.as_str();
            let outcome = match record.entity {
                EntityKind::Subitem => {
                    let parent_id = parent.as_deref().unwrap_or_default();
                    self.call(cancel, || self.api.create_subitem(parent_id, &name, &values))
                        .await
                }
                _ => {
                    let group_id = parent.as_deref();
                    self.call(cancel, || {
                        self.api.create_item(board_id, group_id, &name, &values)
                    })
                    .await
                }
            };
            (outcome.result, outcome.attempts)
        };
        let ack = match result {
            Ok(ack) => ack,
            Err(err) => return self.recover_existing(record, err, attempts, parent, cancel).await,
        };

        let item_board = ack
            .board_id
            .clone()
            .or_else(|| self.default_item_board(&schemas, record.entity));
        let changes = diff(None, &record.payload);
        let mismatches = echo_mismatches(&values, &ack.values);
        if !mismatches.is_empty() {
            warn!(business_key = %record.business_key, ?mismatches, "board echoed values that differ from what was sent");
        }
        self.remember(ExternalEntityRef {
            board_id: self.settings.board_id.clone(),
            business_key: record.business_key.clone(),
            entity: record.entity,
            external_id: ack.id.clone(),
            parent_external_id: parent,
            item_board_id: item_board.clone(),
            synced_values: record.payload.clone(),
        })
        .await?;
        Ok(Attempted {
            status: RecordStatus::Succeeded {
                external_id: Some(ack.id),
                board_id: item_board,
                changes,
                mismatches,
            },
            attempts,
        })
    }

    async fn update_item(
        &self,
        record: &StagedRecord,
        found: ExternalEntityRef,
        cancel: &CancellationToken,
    ) -> Result<Attempted> {
        let schemas = self.schemas();
        let schema = self.schema_for(&schemas, record.entity);
        let mut values = match schema.column_values(&record.payload) {
            Ok(values) => values,
            Err((field, err)) => return Ok(Attempted::permanent(format!("field '{field}': {err}"))),
        };
        if let Some(name) = record.payload.get(NAME_FIELD) {
            values.insert(NAME_FIELD.to_string(), Value::String(name.clone()));
        }
        let mut changes = diff(Some(&found.synced_values), &record.payload);
        let board_id = found
            .item_board_id
            .clone()
            .unwrap_or_else(|| self.settings.board_id.clone());

        // Items follow their group title; subitems never change parent.
        let move_to = match (record.entity, self.resolve_parent(record).await?) {
            (EntityKind::Item, Parent::Known(group_id))
                if found.parent_external_id.as_deref() != Some(group_id.as_str()) =>
            {
                Some(group_id)
            }
            (EntityKind::Item, Parent::Missing(key)) => {
                return Ok(Attempted::permanent(format!(
                    "parent '{key}' has no external id"
                )))
            }
            _ => None,
        };

        let mut attempts = 0;
        let mut mismatches = Vec::new();
        if !self.settings.dry_run {
            let item_id = found.external_id.as_str();
            if let Some(group_id) = move_to.as_deref() {
                let outcome = self
                    .call(cancel, || self.api.move_item_to_group(item_id, group_id))
                    .await;
                attempts += outcome.attempts;
                if let Err(err) = outcome.result {
                    return Ok(Attempted {
                        status: failure_status(&err),
                        attempts,
                    });
                }
            }
            if !changes.is_empty() {
                let board = board_id.as_str();
                let outcome = self
                    .call(cancel, || self.api.update_item(board, item_id, &values))
                    .await;
                attempts += outcome.attempts;
                match outcome.result {
                    Ok(ack) => mismatches = echo_mismatches(&values, &ack.values),
                    Err(err) => {
                        // The move already happened; keep the ref in step with the board.
                        if let Some(group_id) = move_to {
                            self.remember(ExternalEntityRef {
                                parent_external_id: Some(group_id),
                                ..found
                            })
                            .await?;
                        }
                        return Ok(Attempted {
                            status: failure_status(&err),
                            attempts,
                        });
                    }
                }
            }
        }
        if !mismatches.is_empty() {
            warn!(business_key = %record.business_key, ?mismatches, "board echoed values that differ from what was sent");
        }

        if let Some(group_id) = &move_to {
            changes.push(FieldChange {
                field: GROUP_FIELD.to_string(),
                old_value: found.parent_external_id.clone(),
                new_value: Some(group_id.clone()),
            });
        }
        let mut synced_values = found.synced_values.clone();
        synced_values.extend(record.payload.clone());
        let external_id = found.external_id.clone();
        let parent_external_id = move_to.or_else(|| found.parent_external_id.clone());
        self.remember(ExternalEntityRef {
            synced_values,
            parent_external_id,
            ..found
        })
        .await?;
        Ok(Attempted {
            status: RecordStatus::Succeeded {
                external_id: Some(external_id),
                board_id: Some(board_id),
                changes,
                mismatches,
            },
            attempts,
        })
    }

    async fn delete(
        &self,
        record: &StagedRecord,
        existing: Option<ExternalEntityRef>,
        cancel: &CancellationToken,
    ) -> Result<Attempted> {
        let Some(found) = existing else {
            debug!(business_key = %record.business_key, "nothing to delete");
            return Ok(Attempted::immediate(RecordStatus::Succeeded {
                external_id: None,
                board_id: None,
                changes: Vec::new(),
                mismatches: Vec::new(),
            }));
        };
        let (result, attempts) = if self.settings.dry_run {
            (Ok(()), 0)
        } else {
            let item_id = found.external_id.as_str();
            let outcome = self.call(cancel, || self.api.delete_item(item_id)).await;
            (outcome.result, outcome.attempts)
        };
        match result {
            // Already gone, e.g. removed together with its parent.
            Ok(()) | Err(ApiError::NotFound(_)) => {}
            Err(err) => {
                return Ok(Attempted {
                    status: failure_status(&err),
                    attempts,
                })
            }
        }
        self.forget(&record.business_key).await?;
        Ok(Attempted {
            status: RecordStatus::Succeeded {
                external_id: Some(found.external_id),
                board_id: found.item_board_id,
                changes: Vec::new(),
                mismatches: Vec::new(),
            },
            attempts,
        })
    }

    /// A CREATE answered with "already exists" succeeds when the business key
    /// is already known (for instance, created by an overlapping run), or
    /// when the platform names the entity it collided with. An adopted item
    /// then gets the record's values pushed onto it.
    async fn recover_existing(
        &self,
        record: &StagedRecord,
        err: ApiError,
        attempts: u32,
        parent: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Attempted> {
        let ApiError::AlreadyExists { existing_id, .. } = &err else {
            return Ok(Attempted {
                status: failure_status(&err),
                attempts,
            });
        };
        if let Some(found) = self.lookup_ref(&record.business_key).await? {
            info!(business_key = %record.business_key, "create reported existing entity; treating as success");
            return Ok(Attempted {
                status: RecordStatus::Succeeded {
                    external_id: Some(found.external_id),
                    board_id: found.item_board_id,
                    changes: Vec::new(),
                    mismatches: Vec::new(),
                },
                attempts,
            });
        }
        let Some(existing_id) = existing_id.clone() else {
            return Ok(Attempted {
                status: failure_status(&err),
                attempts,
            });
        };

        info!(business_key = %record.business_key, external_id = %existing_id, "adopting existing board entity");
        let adopted = ExternalEntityRef {
            board_id: self.settings.board_id.clone(),
            business_key: record.business_key.clone(),
            entity: record.entity,
            external_id: existing_id.clone(),
            parent_external_id: parent,
            item_board_id: self.default_item_board(&self.schemas(), record.entity),
            synced_values: Payload::new(),
        };
        if record.entity == EntityKind::Group {
            self.remember(ExternalEntityRef {
                synced_values: record.payload.clone(),
                ..adopted
            })
            .await?;
            return Ok(Attempted {
                status: RecordStatus::Succeeded {
                    external_id: Some(existing_id),
                    board_id: None,
                    changes: Vec::new(),
                    mismatches: Vec::new(),
                },
                attempts,
            });
        }
        let pushed = self.update_item(record, adopted, cancel).await?;
        Ok(Attempted {
            attempts: attempts + pushed.attempts,
            ..pushed
        })
    }

    fn default_item_board(&self, schemas: &SchemaSet, entity: EntityKind) -> Option<String> {
        match entity {
            EntityKind::Group => None,
            EntityKind::Subitem => schemas.subitems.as_ref().map(|s| s.board_id.clone()),
            EntityKind::Item => Some(self.settings.board_id.clone()),
        }
    }

    /// Write an audit entry's old value back to the board.
    #[instrument(skip_all, fields(entry_id = entry.id, external_id = %entry.external_id, field = %entry.field))]
    pub async fn compensate(&self, entry: &AuditEntry) -> Result<(), ApiError> {
        if entry.entity == EntityKind::Group {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        if entry.field == GROUP_FIELD {
            // An item cannot be taken out of every group, only moved back.
            let Some(group_id) = entry.old_value.as_deref() else {
                return Ok(());
            };
            if self.settings.dry_run {
                return Ok(());
            }
            return self
                .call(&cancel, || {
                    self.api.move_item_to_group(&entry.external_id, group_id)
                })
                .await
                .result;
        }
        let raw = entry.old_value.as_deref().unwrap_or("");
        let mut values = ColumnValues::new();
        if entry.field == NAME_FIELD {
            values.insert(NAME_FIELD.to_string(), Value::String(raw.to_string()));
        } else {
            let schemas = self.schemas();
            let ty = schemas
                .for_entity(entry.entity)
                .and_then(|s| s.column(&entry.field))
                .map(|c| c.ty.clone())
                .unwrap_or(ColumnType::Text);
            let value = ty.convert(raw).map_err(|e| ApiError::Rejected {
                code: "ColumnValue".into(),
                message: e.to_string(),
            })?;
            values.insert(entry.field.clone(), value);
        }
        if self.settings.dry_run {
            return Ok(());
        }
        let board_id = entry
            .board_id
            .clone()
            .unwrap_or_else(|| self.settings.board_id.clone());
        self.call(&cancel, || {
            self.api
                .update_item(&board_id, &entry.external_id, &values)
        })
        .await
        .result
        .map(|_| ())
    }
}

fn item_name(record: &StagedRecord) -> String {
    record
        .payload
        .get(NAME_FIELD)
        .filter(|n| !n.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| record.business_key.clone())
}

fn failure_status(err: &ApiError) -> RecordStatus {
    match err {
        ApiError::Cancelled => RecordStatus::Skipped {
            reason: "run cancelled".into(),
        },
        e if e.is_transient() => RecordStatus::Failed {
            kind: FailureKind::Transient,
            error: format!("retries exhausted: {e}"),
        },
        e => RecordStatus::Failed {
            kind: FailureKind::Permanent,
            error: e.to_string(),
        },
    }
}

/// Echoed columns whose display text disagrees with the value sent. Columns
/// without a plain-text rendering (checkboxes, dropdowns) are not compared.
fn echo_mismatches(sent: &ColumnValues, echoed: &BTreeMap<String, Option<String>>) -> Vec<String> {
    echoed
        .iter()
        .filter_map(|(column, text)| {
            let expected = sent.get(column).and_then(display_text)?;
            let got = text.as_deref().unwrap_or("");
            (!same_text(&expected, got))
                .then(|| format!("column '{column}' sent '{expected}', board shows '{got}'"))
        })
        .collect()
}

fn display_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => Some(String::new()),
        Value::Object(map) => ["label", "date", "text", "phone"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

fn same_text(expected: &str, got: &str) -> bool {
    if normalize(expected) == normalize(got) {
        return true;
    }
    match (expected.trim().parse::<f64>(), got.trim().parse::<f64>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Fields whose value differs from what was last pushed.
fn diff(previous: Option<&Payload>, payload: &Payload) -> Vec<FieldChange> {
    payload
        .iter()
        .filter_map(|(field, new)| {
            let old = previous.and_then(|p| p.get(field)).cloned();
            (old.as_deref() != Some(new.as_str())).then(|| FieldChange {
                field: field.clone(),
                old_value: old,
                new_value: Some(new.clone()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(pairs: &[(&str, &str)]) -> Payload {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn diff_reports_only_changed_fields() {
        let before = payload(&[("name", "SO-1"), ("qty", "2")]);
        let after = payload(&[("name", "SO-1"), ("qty", "3"), ("status", "Open")]);
        let changes = diff(Some(&before), &after);
        assert_eq!(
            changes,
            vec![
                FieldChange {
                    field: "qty".into(),
                    old_value: Some("2".into()),
                    new_value: Some("3".into()),
                },
                FieldChange {
                    field: "status".into(),
                    old_value: None,
                    new_value: Some("Open".into()),
                },
            ]
        );
        assert_eq!(diff(None, &after).len(), 3);
    }

    #[test]
    fn echo_mismatches_compare_display_text() {
        let sent: ColumnValues = serde_json::from_value(serde_json::json!({
            "numbers_qty": "5",
            "status": { "label": "Open" },
            "due": { "date": "2025-09-01" },
            "done": { "checked": "true" },
        }))
        .unwrap();
        let echoed: BTreeMap<String, Option<String>> = [
            ("numbers_qty", Some("5.0")),
            ("status", Some("open")),
            ("due", Some("2025-09-02")),
            ("done", Some("v")),
            ("other", Some("x")),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
        .collect();
        assert_eq!(
            echo_mismatches(&sent, &echoed),
            vec!["column 'due' sent '2025-09-01', board shows '2025-09-02'".to_string()]
        );
    }

    #[test]
    fn failures_are_classified() {
        assert!(matches!(
            failure_status(&ApiError::Timeout),
            RecordStatus::Failed {
                kind: FailureKind::Transient,
                ..
            }
        ));
        assert!(matches!(
            failure_status(&ApiError::NotFound("x".into())),
            RecordStatus::Failed {
                kind: FailureKind::Permanent,
                ..
            }
        ));
        assert!(matches!(
            failure_status(&ApiError::Cancelled),
            RecordStatus::Skipped { .. }
        ));
    }
}
