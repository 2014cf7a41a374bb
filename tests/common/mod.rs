#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use board_sync::board::{ApiError, BoardApi, ColumnValues, MutationAck};
use board_sync::columns::{BoardSchema, ColumnSpec, ColumnType};
use board_sync::config::ColumnMapping;
use board_sync::db::{self, NewSourceRow, Pool};
use board_sync::gateway::rate_limit::{Clock, FakeClock, RateLimit, RateLimiter};
use board_sync::gateway::retry::RetryPolicy;
use board_sync::gateway::GatewaySettings;
use board_sync::model::EntityKind;
use board_sync::orchestrator::{Orchestrator, SyncSettings};
use board_sync::validate::ValidationRules;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub const BOARD: &str = "100";
pub const SUBITEM_BOARD: &str = "200";
pub const SOURCE: &str = "orders";

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateGroup {
        board_id: String,
        title: String,
    },
    CreateItem {
        board_id: String,
        group_id: Option<String>,
        name: String,
        values: ColumnValues,
    },
    UpdateItem {
        board_id: String,
        item_id: String,
        values: ColumnValues,
    },
    CreateSubitem {
        parent_id: String,
        name: String,
        values: ColumnValues,
    },
    DeleteItem {
        item_id: String,
    },
    MoveItem {
        item_id: String,
        group_id: String,
    },
}

/// In-memory board that records every call with the virtual time it arrived.
pub struct RecordingBoard {
    clock: Arc<FakeClock>,
    calls: Mutex<Vec<Call>>,
    stamps: Mutex<Vec<Duration>>,
    failures: Mutex<VecDeque<ApiError>>,
    rejected_names: Mutex<HashSet<String>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
    echoes: Mutex<HashMap<String, String>>,
    mutations: AtomicU64,
    seq: AtomicU64,
}

impl RecordingBoard {
    pub fn new(clock: Arc<FakeClock>) -> Self {
        Self {
            clock,
            calls: Mutex::new(Vec::new()),
            stamps: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            rejected_names: Mutex::new(HashSet::new()),
            cancel_after: Mutex::new(None),
            echoes: Mutex::new(HashMap::new()),
            mutations: AtomicU64::new(0),
            seq: AtomicU64::new(0),
        }
    }

    /// Fail the next mutations, in order, with these errors.
    pub async fn fail_next(&self, errors: Vec<ApiError>) {
        self.failures.lock().await.extend(errors);
    }

    pub async fn reject_name(&self, name: &str) {
        self.rejected_names.lock().await.insert(name.to_string());
    }

    /// Cancel `token` while serving the `n`th mutation.
    pub async fn cancel_after(&self, n: usize, token: CancellationToken) {
        *self.cancel_after.lock().await = Some((n, token));
    }

    /// Answer every write of `column` with `text` as the stored display value.
    pub async fn echo(&self, column: &str, text: &str) {
        self.echoes
            .lock()
            .await
            .insert(column.to_string(), text.to_string());
    }

    async fn echoed(&self, sent: &ColumnValues) -> BTreeMap<String, Option<String>> {
        self.echoes
            .lock()
            .await
            .iter()
            .filter(|(column, _)| sent.contains_key(column.as_str()))
            .map(|(column, text)| (column.clone(), Some(text.clone())))
            .collect()
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    pub async fn stamps(&self) -> Vec<Duration> {
        let mut stamps = self.stamps.lock().await.clone();
        stamps.sort();
        stamps
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn mutate(&self, at: Duration, call: Call) -> Result<(), ApiError> {
        self.stamps.lock().await.push(at);
        let name = match &call {
            Call::CreateItem { name, .. } | Call::CreateSubitem { name, .. } => Some(name.clone()),
            _ => None,
        };
        self.calls.lock().await.push(call);

        let n = self.mutations.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = self.cancel_after.lock().await.as_ref() {
            if n as usize >= *after {
                token.cancel();
            }
        }
        if let Some(err) = self.failures.lock().await.pop_front() {
            return Err(err);
        }
        if let Some(name) = name {
            if self.rejected_names.lock().await.contains(&name) {
                return Err(ApiError::Rejected {
                    code: "ColumnValueException".into(),
                    message: format!("invalid value for item {name}"),
                });
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BoardApi for RecordingBoard {
    async fn create_group(&self, board_id: &str, title: &str) -> Result<String, ApiError> {
        let at = self.clock.now();
        self.mutate(
            at,
            Call::CreateGroup {
                board_id: board_id.into(),
                title: title.into(),
            },
        )
        .await?;
        Ok(self.next_id("group"))
    }

    async fn create_item(
        &self,
        board_id: &str,
        group_id: Option<&str>,
        name: &str,
        values: &ColumnValues,
    ) -> Result<MutationAck, ApiError> {
        let at = self.clock.now();
        self.mutate(
            at,
            Call::CreateItem {
                board_id: board_id.into(),
                group_id: group_id.map(str::to_string),
                name: name.into(),
                values: values.clone(),
            },
        )
        .await?;
        Ok(MutationAck {
            id: self.next_id("item"),
            board_id: Some(board_id.into()),
            values: self.echoed(values).await,
        })
    }

    async fn update_item(
        &self,
        board_id: &str,
        item_id: &str,
        values: &ColumnValues,
    ) -> Result<MutationAck, ApiError> {
        let at = self.clock.now();
        self.mutate(
            at,
            Call::UpdateItem {
                board_id: board_id.into(),
                item_id: item_id.into(),
                values: values.clone(),
            },
        )
        .await?;
        Ok(MutationAck {
            id: item_id.into(),
            board_id: Some(board_id.into()),
            values: self.echoed(values).await,
        })
    }

    async fn create_subitem(
        &self,
        parent_item_id: &str,
        name: &str,
        values: &ColumnValues,
    ) -> Result<MutationAck, ApiError> {
        let at = self.clock.now();
        self.mutate(
            at,
            Call::CreateSubitem {
                parent_id: parent_item_id.into(),
                name: name.into(),
                values: values.clone(),
            },
        )
        .await?;
        Ok(MutationAck {
            id: self.next_id("subitem"),
            board_id: Some(SUBITEM_BOARD.into()),
            values: self.echoed(values).await,
        })
    }

    async fn delete_item(&self, item_id: &str) -> Result<(), ApiError> {
        let at = self.clock.now();
        self.mutate(
            at,
            Call::DeleteItem {
                item_id: item_id.into(),
            },
        )
        .await
    }

    async fn move_item_to_group(&self, item_id: &str, group_id: &str) -> Result<(), ApiError> {
        let at = self.clock.now();
        self.mutate(
            at,
            Call::MoveItem {
                item_id: item_id.into(),
                group_id: group_id.into(),
            },
        )
        .await
    }

    async fn board_schema(&self, board_id: &str) -> Result<BoardSchema, ApiError> {
        let at = self.clock.now();
        self.stamps.lock().await.push(at);
        let mut columns = vec![
            ColumnSpec {
                id: "numbers_qty".into(),
                title: "Qty".into(),
                ty: ColumnType::Numbers,
            },
            ColumnSpec {
                id: "status".into(),
                title: "Status".into(),
                ty: ColumnType::Status {
                    labels: vec!["Open".into(), "Shipped".into()],
                },
            },
        ];
        if board_id == BOARD {
            columns.push(ColumnSpec {
                id: "total".into(),
                title: "Total".into(),
                ty: ColumnType::ReadOnly {
                    kind: "formula".into(),
                },
            });
        }
        Ok(BoardSchema::new(board_id, columns))
    }
}

pub fn sync_settings() -> SyncSettings {
    let columns = [
        ("order_name", "name"),
        ("qty", "numbers_qty"),
        ("status", "status"),
    ]
    .into_iter()
    .map(|(source, target)| ColumnMapping {
        source: source.into(),
        target: target.into(),
    })
    .collect();
    SyncSettings {
        board_id: BOARD.into(),
        subitem_board_id: Some(SUBITEM_BOARD.into()),
        max_batch_size: 25,
        max_workers: 4,
        columns,
        hash_columns: vec!["order_name".into(), "qty".into(), "status".into()],
        rules: ValidationRules::default(),
        retention: chrono::Duration::hours(1),
        lease_ttl: chrono::Duration::hours(1),
    }
}

pub fn gateway_settings() -> GatewaySettings {
    GatewaySettings {
        board_id: BOARD.into(),
        max_workers: 4,
        call_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
            jitter: false,
        },
        rate_limit: RateLimit {
            calls_per_interval: 60,
            interval: Duration::from_secs(60),
            burst: 10,
        },
        dry_run: false,
    }
}

pub struct Harness {
    pub pool: Pool,
    pub clock: Arc<FakeClock>,
    pub board: Arc<RecordingBoard>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(sync_settings(), gateway_settings()).await
    }

    pub async fn with(settings: SyncSettings, gateway: GatewaySettings) -> Self {
        let pool = db::init_memory_pool().await.unwrap();
        let clock = Arc::new(FakeClock::new());
        let board = Arc::new(RecordingBoard::new(clock.clone()));
        let orchestrator = orchestrator_on(&pool, &clock, &board, settings, gateway, "worker-a");
        Self {
            pool,
            clock,
            board,
            orchestrator,
        }
    }

    pub fn clock_now(&self) -> Duration {
        self.clock.now()
    }

    /// A second worker sharing this harness's store, board and clock.
    pub fn worker(&self, worker_id: &str) -> Orchestrator {
        self.worker_with(worker_id, gateway_settings())
    }

    pub fn worker_with(&self, worker_id: &str, gateway: GatewaySettings) -> Orchestrator {
        orchestrator_on(
            &self.pool,
            &self.clock,
            &self.board,
            sync_settings(),
            gateway,
            worker_id,
        )
    }
}

fn orchestrator_on(
    pool: &Pool,
    clock: &Arc<FakeClock>,
    board: &Arc<RecordingBoard>,
    settings: SyncSettings,
    gateway: GatewaySettings,
    worker_id: &str,
) -> Orchestrator {
    let clock: Arc<dyn Clock> = clock.clone();
    let limiter = RateLimiter::shared(gateway.rate_limit, clock.clone());
    Orchestrator::with_limiter(
        pool.clone(),
        board.clone(),
        settings,
        gateway,
        worker_id,
        limiter,
        clock,
    )
}

pub fn item(key: &str, group: Option<&str>, name: &str, qty: &str) -> NewSourceRow {
    NewSourceRow {
        source: SOURCE.into(),
        business_key: key.into(),
        entity: EntityKind::Item,
        group_title: group.map(str::to_string),
        parent_key: None,
        fields: [
            ("order_name".to_string(), name.to_string()),
            ("qty".to_string(), qty.to_string()),
            ("status".to_string(), "Open".to_string()),
        ]
        .into_iter()
        .collect(),
        deleted: false,
    }
}

pub fn subitem(key: &str, parent: &str, name: &str, qty: &str) -> NewSourceRow {
    NewSourceRow {
        source: SOURCE.into(),
        business_key: key.into(),
        entity: EntityKind::Subitem,
        group_title: None,
        parent_key: Some(parent.into()),
        fields: [
            ("order_name".to_string(), name.to_string()),
            ("qty".to_string(), qty.to_string()),
        ]
        .into_iter()
        .collect(),
        deleted: false,
    }
}

pub async fn load(pool: &Pool, rows: &[NewSourceRow]) {
    for row in rows {
        db::upsert_source_row(pool, row).await.unwrap();
    }
}

/// Most calls seen in any window of length `window`.
pub fn max_in_window(stamps: &[Duration], window: Duration) -> usize {
    stamps
        .iter()
        .map(|start| {
            stamps
                .iter()
                .filter(|t| **t >= *start && **t < *start + window)
                .count()
        })
        .max()
        .unwrap_or(0)
}
