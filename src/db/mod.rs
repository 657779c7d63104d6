//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into those models.
//!
//! External modules should import from `inbox_sentry::db` — we re-export the
//! repository API and commonly used models for convenience.

pub mod model;
pub mod repo;

pub use repo::*;

// Surface view models used by callers (e.g., the triage workflow).
pub use model::{CandidateForNotify, MessageForSummary, RunForTriage};
