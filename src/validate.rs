//! Local checks applied to staged records before any network call.
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::columns::SchemaSet;
use crate::db::{self, Pool};
use crate::model::{
    EntityKind, OperationType, StagedRecord, ValidationStatus, NAME_FIELD, TITLE_FIELD,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRules {
    pub max_fields: usize,
    pub max_value_len: usize,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            max_fields: 40,
            max_value_len: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidRecord {
    pub record_id: i64,
    pub business_key: String,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub batch_id: String,
    pub valid: usize,
    pub invalid: usize,
    pub invalid_records: Vec<InvalidRecord>,
}

pub struct Validator {
    pool: Pool,
    schemas: Arc<SchemaSet>,
    rules: ValidationRules,
}

impl Validator {
    pub fn new(pool: Pool, schemas: Arc<SchemaSet>, rules: ValidationRules) -> Self {
        Self {
            pool,
            schemas,
            rules,
        }
    }

    /// Check every record of the batch and persist its status in one transaction.
    #[instrument(skip(self))]
    pub async fn validate(&self, batch_id: &str) -> Result<ValidationReport> {
        let records = db::fetch_staged_records(&self.pool, batch_id).await?;
        let mut report = ValidationReport {
            batch_id: batch_id.to_string(),
            ..Default::default()
        };

        let mut tx = self.pool.begin().await?;
        for record in &records {
            let reasons = self.check(record);
            if reasons.is_empty() {
                db::set_validation_tx(&mut tx, record.id, ValidationStatus::Valid, &[]).await?;
                report.valid += 1;
            } else {
                warn!(
                    record_id = record.id,
                    business_key = %record.business_key,
                    ?reasons,
                    "record failed validation"
                );
                db::set_validation_tx(&mut tx, record.id, ValidationStatus::Invalid, &reasons)
                    .await?;
                report.invalid += 1;
                report.invalid_records.push(InvalidRecord {
                    record_id: record.id,
                    business_key: record.business_key.clone(),
                    reasons,
                });
            }
        }
        tx.commit().await?;

        info!(valid = report.valid, invalid = report.invalid, "batch validated");
        Ok(report)
    }

    /// Reasons the record cannot be dispatched; empty when it is valid.
    pub fn check(&self, record: &StagedRecord) -> Vec<String> {
        let mut reasons = Vec::new();

        if record.business_key.trim().is_empty() {
            reasons.push("missing business key".to_string());
        }
        if record.entity == EntityKind::Subitem && is_blank(record.parent_key.as_deref()) {
            reasons.push("subitem has no parent item reference".to_string());
        }
        if record.operation == OperationType::Delete {
            return reasons;
        }

        match record.entity {
            EntityKind::Group => {
                if is_blank(record.payload.get(TITLE_FIELD).map(String::as_str)) {
                    reasons.push("group has no title".to_string());
                }
            }
            EntityKind::Item | EntityKind::Subitem => {
                if record.operation == OperationType::Create
                    && is_blank(record.payload.get(NAME_FIELD).map(String::as_str))
                {
                    reasons.push(format!("missing required field '{NAME_FIELD}'"));
                }
            }
        }

        if record.payload.len() > self.rules.max_fields {
            reasons.push(format!(
                "payload has {} fields (limit {})",
                record.payload.len(),
                self.rules.max_fields
            ));
        }
        for (field, value) in &record.payload {
            let len = value.chars().count();
            if len > self.rules.max_value_len {
                reasons.push(format!(
                    "field '{field}' is {len} characters (limit {})",
                    self.rules.max_value_len
                ));
            }
        }

        if let Some(schema) = self.schemas.for_entity(record.entity) {
            for (field, value) in &record.payload {
                if field == NAME_FIELD {
                    continue;
                }
                match schema.column(field) {
                    None if !schema.columns.is_empty() => {
                        reasons.push(format!(
                            "column '{field}' does not exist on board {}",
                            schema.board_id
                        ));
                    }
                    None => {}
                    Some(column) => {
                        if let Err(err) = column.ty.convert(value) {
                            reasons.push(format!("field '{field}': {err}"));
                        }
                    }
                }
            }
        }

        reasons
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(|v| v.trim().is_empty()).unwrap_or(true)
}
