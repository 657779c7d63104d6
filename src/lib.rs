//! Inbox Sentry: a durable mail-triage worker.
//!
//! Batches of message ids are submitted as triage runs. A single worker
//! drives each run through fetch, summarize, filter, decide and notify
//! stages, checkpointing progress in SQLite so a crash resumes where the
//! last stage finished.

pub mod config;
pub mod db;
pub mod filter;
pub mod mail;
pub mod model;
pub mod push;
pub mod retry;
pub mod summarizer;
pub mod triage;
