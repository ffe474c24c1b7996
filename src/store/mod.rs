//! Durable store: task, workflow, and message rows behind an async-safe
//! SQLite handle. `claim_task` is the single concurrency primitive for turn
//! ownership.

mod db;
mod models;

pub use db::{Store, StoreHandle, MERGING_STAGE};
pub use models::*;
