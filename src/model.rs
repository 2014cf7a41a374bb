use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Target-field → value mapping carried by a staged record.
pub type Payload = BTreeMap<String, String>;

/// Payload key holding the item/subitem title.
pub const NAME_FIELD: &str = "name";
/// Payload key holding a group title.
pub const TITLE_FIELD: &str = "title";
/// Audit field recording an item's move between groups.
pub const GROUP_FIELD: &str = "group";

/// Business key of the derived group record for a group title.
pub fn group_key(title: &str) -> String {
    format!("group:{}", title.trim())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    New,
    Changed,
    Unchanged,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::New => "NEW",
            ChangeKind::Changed => "CHANGED",
            ChangeKind::Unchanged => "UNCHANGED",
            ChangeKind::Deleted => "DELETED",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Group,
    Item,
    Subitem,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Group => "group",
            EntityKind::Item => "item",
            EntityKind::Subitem => "subitem",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "group" => Some(EntityKind::Group),
            "item" => Some(EntityKind::Item),
            "subitem" => Some(EntityKind::Subitem),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "CREATE",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(OperationType::Create),
            "UPDATE" => Some(OperationType::Update),
            "DELETE" => Some(OperationType::Delete),
            _ => None,
        }
    }

    /// Operation needed to push a change of the given kind, if any.
    pub fn for_change(kind: ChangeKind) -> Option<Self> {
        match kind {
            ChangeKind::New => Some(OperationType::Create),
            ChangeKind::Changed => Some(OperationType::Update),
            ChangeKind::Deleted => Some(OperationType::Delete),
            ChangeKind::Unchanged => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ValidationStatus {
    Pending,
    Valid,
    Invalid,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Pending => "PENDING",
            ValidationStatus::Valid => "VALID",
            ValidationStatus::Invalid => "INVALID",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ValidationStatus::Pending),
            "VALID" => Some(ValidationStatus::Valid),
            "INVALID" => Some(ValidationStatus::Invalid),
            _ => None,
        }
    }
}

/// Per-record dispatch outcome stored on the staged record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RecordOutcome {
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOutcome::Pending => "PENDING",
            RecordOutcome::Succeeded => "SUCCEEDED",
            RecordOutcome::Failed => "FAILED",
            RecordOutcome::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(RecordOutcome::Pending),
            "SUCCEEDED" => Some(RecordOutcome::Succeeded),
            "FAILED" => Some(RecordOutcome::Failed),
            "SKIPPED" => Some(RecordOutcome::Skipped),
            _ => None,
        }
    }
}

/// Lifecycle of a batch. Transitions only move forward; see [`BatchStatus::can_advance_to`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BatchStatus {
    Pending,
    Validating,
    Valid,
    Invalid,
    Dispatching,
    Partial,
    Complete,
    Failed,
    Cleaned,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal batch transition {from} -> {to}")]
pub struct TransitionError {
    pub from: BatchStatus,
    pub to: BatchStatus,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::Validating => "VALIDATING",
            BatchStatus::Valid => "VALID",
            BatchStatus::Invalid => "INVALID",
            BatchStatus::Dispatching => "DISPATCHING",
            BatchStatus::Partial => "PARTIAL",
            BatchStatus::Complete => "COMPLETE",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Cleaned => "CLEANED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(BatchStatus::Pending),
            "VALIDATING" => Some(BatchStatus::Validating),
            "VALID" => Some(BatchStatus::Valid),
            "INVALID" => Some(BatchStatus::Invalid),
            "DISPATCHING" => Some(BatchStatus::Dispatching),
            "PARTIAL" => Some(BatchStatus::Partial),
            "COMPLETE" => Some(BatchStatus::Complete),
            "FAILED" => Some(BatchStatus::Failed),
            "CLEANED" => Some(BatchStatus::Cleaned),
            _ => None,
        }
    }

    /// Terminal with respect to a single run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Complete | BatchStatus::Partial | BatchStatus::Failed | BatchStatus::Cleaned
        )
    }

    /// The forward-only transition table. COMPLETE and PARTIAL are only
    /// reachable from DISPATCHING; FAILED is reachable from any pre-dispatch
    /// state so an infrastructure error can retire the batch.
    pub fn can_advance_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Pending, Validating)
                | (Validating, Valid)
                | (Validating, Invalid)
                | (Valid, Dispatching)
                | (Dispatching, Complete)
                | (Dispatching, Partial)
                | (Dispatching, Failed)
                | (Pending, Failed)
                | (Validating, Failed)
                | (Valid, Failed)
                | (Invalid, Failed)
                | (Complete, Cleaned)
                | (Partial, Cleaned)
                | (Failed, Cleaned)
        )
    }

    pub fn advance(self, next: BatchStatus) -> Result<BatchStatus, TransitionError> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(TransitionError { from: self, to: next })
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of one source row for the current run. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub source: String,
    pub business_key: String,
    pub content_hash: String,
    pub previous_hash: Option<String>,
    pub kind: ChangeKind,
}

/// A row of the relational order store as seen by the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRow {
    pub id: i64,
    pub source: String,
    pub business_key: String,
    pub entity: EntityKind,
    pub group_title: Option<String>,
    pub parent_key: Option<String>,
    pub fields: BTreeMap<String, String>,
    pub deleted: bool,
    pub external_id: Option<String>,
    pub last_synced_hash: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Input to `StagingStore::stage`.
#[derive(Debug, Clone)]
pub struct NewStagedRecord {
    pub entity: EntityKind,
    pub operation: OperationType,
    pub business_key: String,
    /// Group key for items, parent item key for subitems.
    pub parent_key: Option<String>,
    pub payload: Payload,
    pub content_hash: Option<String>,
    pub source_reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedRecord {
    /// Staging sequence number; also the stable tie-break for dispatch order.
    pub id: i64,
    pub batch_id: String,
    pub entity: EntityKind,
    pub operation: OperationType,
    pub business_key: String,
    pub parent_key: Option<String>,
    pub payload: Payload,
    pub content_hash: Option<String>,
    pub validation_status: ValidationStatus,
    pub validation_errors: Vec<String>,
    pub source_reference: String,
    pub outcome: RecordOutcome,
    pub external_id: Option<String>,
    pub error_text: Option<String>,
    pub attempt_count: i64,
    pub claimed_by: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchCounts {
    pub total: i64,
    pub valid: i64,
    pub invalid: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub skipped: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub status: BatchStatus,
    pub source: String,
    pub board_id: String,
    pub claimed_by: Option<String>,
    pub counts: BatchCounts,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalEntityRef {
    /// Target board the business key is scoped to.
    pub board_id: String,
    pub business_key: String,
    pub entity: EntityKind,
    pub external_id: String,
    pub parent_external_id: Option<String>,
    /// Board that physically holds the entity (subitems live on their own board).
    pub item_board_id: Option<String>,
    /// Field values last pushed for this entity.
    pub synced_values: Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    pub id: i64,
    pub batch_id: String,
    pub entity: EntityKind,
    pub board_id: Option<String>,
    pub external_id: String,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub attempted_at: DateTime<Utc>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub rollback_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_status_moves_forward_only() {
        assert!(BatchStatus::Pending.can_advance_to(BatchStatus::Validating));
        assert!(BatchStatus::Validating.can_advance_to(BatchStatus::Invalid));
        assert!(BatchStatus::Dispatching.can_advance_to(BatchStatus::Partial));
        assert!(!BatchStatus::Valid.can_advance_to(BatchStatus::Complete));
        assert!(!BatchStatus::Complete.can_advance_to(BatchStatus::Dispatching));
        assert!(!BatchStatus::Cleaned.can_advance_to(BatchStatus::Pending));

        let err = BatchStatus::Valid.advance(BatchStatus::Partial).unwrap_err();
        assert_eq!(err.from, BatchStatus::Valid);
        assert_eq!(err.to, BatchStatus::Partial);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            BatchStatus::Pending,
            BatchStatus::Dispatching,
            BatchStatus::Cleaned,
        ] {
            assert_eq!(BatchStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BatchStatus::parse("OPEN"), None);
    }

    #[test]
    fn unchanged_rows_need_no_operation() {
        assert_eq!(OperationType::for_change(ChangeKind::Unchanged), None);
        assert_eq!(
            OperationType::for_change(ChangeKind::New),
            Some(OperationType::Create)
        );
    }
}
