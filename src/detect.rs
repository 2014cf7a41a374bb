//! Content hashing and change classification for source rows.
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::model::{ChangeKind, ChangeRecord, SourceRow};

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Separates column entries inside the hash input (ASCII unit separator).
const FIELD_SEP: char = '\u{1f}';
/// Introduces the group title of an item (ASCII record separator).
const GROUP_SEP: char = '\u{1e}';

/// Read-only: computes hashes, never touches persisted state.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    columns: Vec<String>,
}

impl ChangeDetector {
    /// `columns` fixes both the hashed subset and its order.
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// SHA-256 hex digest over the normalised configured columns.
    pub fn hash(&self, fields: &BTreeMap<String, String>) -> String {
        self.digest(fields, None)
    }

    /// Hash of everything a sync pushes for `row`: its configured columns and,
    /// for a grouped item, the group it belongs in.
    pub fn row_hash(&self, row: &SourceRow) -> String {
        let group = row
            .group_title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        self.digest(&row.fields, group)
    }

    fn digest(&self, fields: &BTreeMap<String, String>, group: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        for column in &self.columns {
            let value = fields.get(column).map(String::as_str).unwrap_or("");
            hasher.update(column.as_bytes());
            hasher.update(b"=");
            hasher.update(normalize(value).as_bytes());
            hasher.update(FIELD_SEP.to_string().as_bytes());
        }
        if let Some(title) = group {
            hasher.update(GROUP_SEP.to_string().as_bytes());
            hasher.update(title.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Classify a row against the hash recorded by the last successful sync.
    pub fn classify(&self, row: &SourceRow, previous_hash: Option<&str>) -> ChangeRecord {
        let content_hash = self.row_hash(row);
        let kind = match (row.deleted, previous_hash) {
            (true, Some(_)) => ChangeKind::Deleted,
            // Deleted before it was ever synced: nothing to do remotely.
            (true, None) => ChangeKind::Unchanged,
            (false, None) => ChangeKind::New,
            (false, Some(prev)) if prev != content_hash => ChangeKind::Changed,
            (false, Some(_)) => ChangeKind::Unchanged,
        };
        ChangeRecord {
            source: row.source.clone(),
            business_key: row.business_key.clone(),
            content_hash,
            previous_hash: previous_hash.map(str::to_string),
            kind,
        }
    }
}

/// Trim, collapse inner whitespace and lowercase.
pub fn normalize(value: &str) -> String {
    WHITESPACE
        .replace_all(value.trim(), " ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKind;

    fn row(fields: &[(&str, &str)]) -> SourceRow {
        SourceRow {
            id: 1,
            source: "orders".into(),
            business_key: "SO-1:1".into(),
            entity: EntityKind::Item,
            group_title: None,
            parent_key: None,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            deleted: false,
            external_id: None,
            last_synced_hash: None,
            last_synced_at: None,
        }
    }

    fn detector() -> ChangeDetector {
        ChangeDetector::new(vec!["customer".into(), "qty".into()])
    }

    #[test]
    fn hash_ignores_whitespace_and_case() {
        let d = detector();
        let a = row(&[("customer", "ACME  Corp "), ("qty", "5")]);
        let b = row(&[("customer", "acme corp"), ("qty", " 5")]);
        assert_eq!(d.hash(&a.fields), d.hash(&b.fields));
    }

    #[test]
    fn hash_ignores_unconfigured_columns() {
        let d = detector();
        let a = row(&[("customer", "acme"), ("qty", "5"), ("notes", "x")]);
        let b = row(&[("customer", "acme"), ("qty", "5"), ("notes", "y")]);
        assert_eq!(d.hash(&a.fields), d.hash(&b.fields));
    }

    #[test]
    fn hash_depends_on_column_order() {
        let fields = row(&[("customer", "5"), ("qty", "acme")]).fields;
        let forward = ChangeDetector::new(vec!["customer".into(), "qty".into()]);
        let reverse = ChangeDetector::new(vec!["qty".into(), "customer".into()]);
        assert_ne!(forward.hash(&fields), reverse.hash(&fields));
    }

    #[test]
    fn hash_is_stable_across_threads() {
        let d = detector();
        let r = row(&[("customer", "acme"), ("qty", "5")]);
        let expected = d.hash(&r.fields);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let d = d.clone();
                let fields = r.fields.clone();
                std::thread::spawn(move || d.hash(&fields))
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), expected);
        }
        assert_eq!(expected.len(), 64);
    }

    #[test]
    fn classify_new_changed_unchanged() {
        let d = detector();
        let r = row(&[("customer", "acme"), ("qty", "5")]);
        let first = d.classify(&r, None);
        assert_eq!(first.kind, ChangeKind::New);

        let same = d.classify(&r, Some(&first.content_hash));
        assert_eq!(same.kind, ChangeKind::Unchanged);

        let edited = row(&[("customer", "acme"), ("qty", "6")]);
        let changed = d.classify(&edited, Some(&first.content_hash));
        assert_eq!(changed.kind, ChangeKind::Changed);
        assert_eq!(changed.previous_hash.as_deref(), Some(first.content_hash.as_str()));
    }

    #[test]
    fn moving_an_item_to_another_group_is_a_change() {
        let d = detector();
        let mut r = row(&[("customer", "acme"), ("qty", "5")]);
        assert_eq!(d.row_hash(&r), d.hash(&r.fields));

        r.group_title = Some("FALL-2025".into());
        let first = d.classify(&r, None);
        assert_ne!(first.content_hash, d.hash(&r.fields));
        r.group_title = Some(" FALL-2025 ".into());
        assert_eq!(d.classify(&r, Some(&first.content_hash)).kind, ChangeKind::Unchanged);
        r.group_title = Some("WINTER".into());
        assert_eq!(d.classify(&r, Some(&first.content_hash)).kind, ChangeKind::Changed);
    }

    #[test]
    fn classify_deleted_rows() {
        let d = detector();
        let mut r = row(&[("customer", "acme")]);
        r.deleted = true;
        assert_eq!(d.classify(&r, Some("abc")).kind, ChangeKind::Deleted);
        assert_eq!(d.classify(&r, None).kind, ChangeKind::Unchanged);
    }
}
