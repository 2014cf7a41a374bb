//! Column metadata for a target board and conversion of raw source values
//! into the JSON shape each column type expects on the wire.
//!
//! Every writable column kind is one variant of [`ColumnType`]. Supporting a
//! new kind means adding a variant and its arm in [`ColumnType::convert`].

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::model::EntityKind;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("'{value}' is not a number")]
    NotANumber { value: String },
    #[error("'{value}' is not a recognised date")]
    NotADate { value: String },
    #[error("'{value}' is not a valid email address")]
    NotAnEmail { value: String },
    #[error("label '{value}' is not one of {allowed:?}")]
    UnknownLabel { value: String, allowed: Vec<String> },
    #[error("'{value}' is not a boolean")]
    NotABoolean { value: String },
    #[error("column type '{kind}' is read-only")]
    ReadOnly { kind: String },
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d", "%d.%m.%Y"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnType {
    Name,
    Text,
    LongText,
    Numbers,
    Date,
    Status {
        #[serde(default)]
        labels: Vec<String>,
    },
    Dropdown {
        #[serde(default)]
        labels: Vec<String>,
    },
    Checkbox,
    Email,
    Link,
    Phone,
    /// Formula, mirror and other computed columns.
    ReadOnly { kind: String },
}

impl ColumnType {
    /// Map the platform's column type string and its settings JSON.
    pub fn from_api(kind: &str, settings: Option<&Value>) -> Self {
        match kind {
            "name" => ColumnType::Name,
            "text" => ColumnType::Text,
            "long_text" | "long-text" => ColumnType::LongText,
            "numbers" | "numeric" => ColumnType::Numbers,
            "date" => ColumnType::Date,
            "status" | "color" => ColumnType::Status {
                labels: status_labels(settings),
            },
            "dropdown" => ColumnType::Dropdown {
                labels: dropdown_labels(settings),
            },
            "checkbox" | "boolean" => ColumnType::Checkbox,
            "email" => ColumnType::Email,
            "link" => ColumnType::Link,
            "phone" => ColumnType::Phone,
            other => ColumnType::ReadOnly {
                kind: other.to_string(),
            },
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            ColumnType::Name => "name",
            ColumnType::Text => "text",
            ColumnType::LongText => "long_text",
            ColumnType::Numbers => "numbers",
            ColumnType::Date => "date",
            ColumnType::Status { .. } => "status",
            ColumnType::Dropdown { .. } => "dropdown",
            ColumnType::Checkbox => "checkbox",
            ColumnType::Email => "email",
            ColumnType::Link => "link",
            ColumnType::Phone => "phone",
            ColumnType::ReadOnly { kind } => kind,
        }
    }

    /// Convert a raw source value. An empty value clears the column.
    pub fn convert(&self, raw: &str) -> Result<Value, ConversionError> {
        let value = raw.trim();
        if let ColumnType::ReadOnly { kind } = self {
            return Err(ConversionError::ReadOnly { kind: kind.clone() });
        }
        if value.is_empty() {
            return Ok(match self {
                ColumnType::Checkbox => Value::Null,
                _ => Value::String(String::new()),
            });
        }
        match self {
            ColumnType::Name | ColumnType::Text => Ok(Value::String(value.to_string())),
            ColumnType::LongText => Ok(json!({ "text": value })),
            ColumnType::Numbers => {
                let cleaned: String = value.chars().filter(|c| *c != ',').collect();
                let number: f64 = cleaned.parse().map_err(|_| ConversionError::NotANumber {
                    value: value.to_string(),
                })?;
                if !number.is_finite() {
                    return Err(ConversionError::NotANumber {
                        value: value.to_string(),
                    });
                }
                Ok(Value::String(format_number(number)))
            }
            ColumnType::Date => {
                let date = parse_date(value).ok_or_else(|| ConversionError::NotADate {
                    value: value.to_string(),
                })?;
                Ok(json!({ "date": date.format("%Y-%m-%d").to_string() }))
            }
            ColumnType::Status { labels } => {
                ensure_label(value, labels)?;
                Ok(json!({ "label": value }))
            }
            ColumnType::Dropdown { labels } => {
                let picked: Vec<&str> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect();
                for label in &picked {
                    ensure_label(label, labels)?;
                }
                Ok(json!({ "labels": picked }))
            }
            ColumnType::Checkbox => match value.to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "1" | "x" => Ok(json!({ "checked": "true" })),
                "false" | "no" | "n" | "0" => Ok(Value::Null),
                _ => Err(ConversionError::NotABoolean {
                    value: value.to_string(),
                }),
            },
            ColumnType::Email => {
                let valid = value
                    .split_once('@')
                    .map(|(user, domain)| !user.is_empty() && domain.contains('.'))
                    .unwrap_or(false);
                if !valid {
                    return Err(ConversionError::NotAnEmail {
                        value: value.to_string(),
                    });
                }
                Ok(json!({ "email": value, "text": value }))
            }
            ColumnType::Link => Ok(json!({ "url": value, "text": value })),
            ColumnType::Phone => {
                let digits: String = value
                    .chars()
                    .filter(|c| c.is_ascii_digit() || *c == '+')
                    .collect();
                Ok(json!({ "phone": digits }))
            }
            ColumnType::ReadOnly { .. } => unreachable!("handled above"),
        }
    }
}

fn ensure_label(value: &str, labels: &[String]) -> Result<(), ConversionError> {
    // Boards without declared labels accept anything.
    if labels.is_empty() || labels.iter().any(|l| l == value) {
        return Ok(());
    }
    Err(ConversionError::UnknownLabel {
        value: value.to_string(),
        allowed: labels.to_vec(),
    })
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    // Timestamps keep only their date part.
    let head = value.split(['T', ' ']).next().unwrap_or(value);
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(head, fmt).ok())
}

fn format_number(number: f64) -> String {
    if number.fract() == 0.0 && number.abs() < 1e15 {
        format!("{}", number as i64)
    } else {
        number.to_string()
    }
}

fn status_labels(settings: Option<&Value>) -> Vec<String> {
    let Some(labels) = settings.and_then(|s| s.get("labels")) else {
        return Vec::new();
    };
    match labels {
        Value::Object(map) => {
            let mut pairs: Vec<(i64, String)> = map
                .iter()
                .filter_map(|(k, v)| Some((k.parse().ok()?, v.as_str()?.to_string())))
                .collect();
            pairs.sort();
            pairs.into_iter().map(|(_, l)| l).collect()
        }
        Value::Array(items) => items.iter().filter_map(label_name).collect(),
        _ => Vec::new(),
    }
}

fn dropdown_labels(settings: Option<&Value>) -> Vec<String> {
    settings
        .and_then(|s| s.get("labels"))
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(label_name).collect())
        .unwrap_or_default()
}

fn label_name(item: &Value) -> Option<String> {
    item.as_str()
        .or_else(|| item.get("name").and_then(Value::as_str))
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub id: String,
    pub title: String,
    #[serde(flatten)]
    pub ty: ColumnType,
}

/// Cached column metadata of one board.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardSchema {
    pub board_id: String,
    pub columns: BTreeMap<String, ColumnSpec>,
}

impl BoardSchema {
    pub fn new(board_id: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self {
            board_id: board_id.into(),
            columns: columns.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }

    pub fn column(&self, id: &str) -> Option<&ColumnSpec> {
        self.columns.get(id)
    }

    /// Convert a whole payload into the column-values map sent to the API.
    /// The item name is excluded; it travels as its own mutation argument.
    pub fn column_values(
        &self,
        payload: &BTreeMap<String, String>,
    ) -> Result<serde_json::Map<String, Value>, (String, ConversionError)> {
        let mut out = serde_json::Map::new();
        for (field, raw) in payload {
            if field == crate::model::NAME_FIELD {
                continue;
            }
            let ty = self
                .column(field)
                .map(|c| c.ty.clone())
                .unwrap_or(ColumnType::Text);
            let value = ty.convert(raw).map_err(|e| (field.clone(), e))?;
            out.insert(field.clone(), value);
        }
        Ok(out)
    }
}

/// Schemas fetched once per run: the item board and, when configured, the
/// board holding subitems.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaSet {
    pub items: BoardSchema,
    pub subitems: Option<BoardSchema>,
}

impl SchemaSet {
    /// Groups have no columns, so they have no schema.
    pub fn for_entity(&self, entity: EntityKind) -> Option<&BoardSchema> {
        match entity {
            EntityKind::Group => None,
            EntityKind::Item => Some(&self.items),
            EntityKind::Subitem => self.subitems.as_ref(),
        }
    }
}
