//! Dependency-ordered, size-bounded dispatch plan for a batch.
//!
//! Levels run strictly one after another (groups, then items, then
//! subitems). Inside a level, records are partitioned by the parent they
//! hang off, so unrelated partitions may dispatch concurrently.
use std::collections::HashMap;

use crate::model::{EntityKind, StagedRecord, ValidationStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DispatchLevel {
    Groups,
    Items,
    Subitems,
}

impl DispatchLevel {
    pub fn of(entity: EntityKind) -> Self {
        match entity {
            EntityKind::Group => DispatchLevel::Groups,
            EntityKind::Item => DispatchLevel::Items,
            EntityKind::Subitem => DispatchLevel::Subitems,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchLevel::Groups => "groups",
            DispatchLevel::Items => "items",
            DispatchLevel::Subitems => "subitems",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchGroup {
    pub level: DispatchLevel,
    /// Group key for items, parent item key for subitems.
    pub parent_key: Option<String>,
    /// Records in staging order; never more than the configured maximum.
    pub records: Vec<StagedRecord>,
}

#[derive(Debug, Clone)]
pub struct BatchPlanner {
    max_batch_size: usize,
}

impl BatchPlanner {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Partition the VALID records. The result is level-major; within a
    /// level, partitions appear in order of their first staged record.
    pub fn plan(&self, records: &[StagedRecord]) -> Vec<DispatchGroup> {
        let mut valid: Vec<&StagedRecord> = records
            .iter()
            .filter(|r| r.validation_status == ValidationStatus::Valid)
            .collect();
        valid.sort_by_key(|r| (DispatchLevel::of(r.entity), r.id));

        let mut partitions: Vec<(DispatchLevel, Option<String>, Vec<StagedRecord>)> = Vec::new();
        let mut index: HashMap<(DispatchLevel, Option<String>), usize> = HashMap::new();
        for record in valid {
            let level = DispatchLevel::of(record.entity);
            let parent = match level {
                DispatchLevel::Groups => None,
                _ => record.parent_key.clone(),
            };
            let slot = *index.entry((level, parent.clone())).or_insert_with(|| {
                partitions.push((level, parent, Vec::new()));
                partitions.len() - 1
            });
            partitions[slot].2.push(record.clone());
        }

        partitions
            .into_iter()
            .flat_map(|(level, parent, records)| {
                records
                    .chunks(self.max_batch_size)
                    .map(|chunk| DispatchGroup {
                        level,
                        parent_key: parent.clone(),
                        records: chunk.to_vec(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// Split a plan into its levels, preserving order.
pub fn by_level(groups: Vec<DispatchGroup>) -> Vec<(DispatchLevel, Vec<DispatchGroup>)> {
    let mut levels: Vec<(DispatchLevel, Vec<DispatchGroup>)> = Vec::new();
    for group in groups {
        match levels.last_mut() {
            Some((level, members)) if *level == group.level => members.push(group),
            _ => levels.push((group.level, vec![group])),
        }
    }
    levels
}
