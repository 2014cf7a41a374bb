//! Input models consumed by repositories.
//!
//! Keep these structs focused on the data written by queries. Business logic
//! lives in higher layers.

use crate::model::{EntityKind, RecordOutcome};
use std::collections::BTreeMap;

/// A row handed over by the extraction layer.
#[derive(Debug, Clone)]
pub struct NewSourceRow {
    pub source: String,
    pub business_key: String,
    pub entity: EntityKind,
    pub group_title: Option<String>,
    pub parent_key: Option<String>,
    pub fields: BTreeMap<String, String>,
    pub deleted: bool,
}

/// Outcome columns written back onto a staged record after dispatch.
#[derive(Debug, Clone)]
pub struct OutcomeUpdate {
    pub outcome: RecordOutcome,
    pub external_id: Option<String>,
    pub error_text: Option<String>,
    pub attempts: i64,
}

/// One mutated field, before it is given an id by the ledger.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub batch_id: String,
    pub entity: EntityKind,
    pub board_id: Option<String>,
    pub external_id: String,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}
