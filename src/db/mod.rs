//! Database module: write/view models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: input and view structs used by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! Callers import from `board_sync::db`; the repository API and the models
//! are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{NewAuditEntry, NewSourceRow, OutcomeUpdate};
