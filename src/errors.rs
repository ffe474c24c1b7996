//! Typed error hierarchy for the orchestrator seams.
//!
//! Two enums cover the places where callers branch on failure kind:
//! - `RuntimeError`: agent turn failures (spawn, stream, timeout)
//! - `MergeError`: merge pipeline step failures
//!
//! Everything else uses `anyhow` with context, matching the rest of the
//! codebase.

use std::time::Duration;

use thiserror::Error;

/// Errors from an agent runtime turn.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("agent turn timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent stream error: {0}")]
    Stream(String),

    #[error("agent process exited with code {code:?} and no usable output")]
    NoUsableOutput { code: Option<i32> },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the merge pipeline. The failing step determines what an
/// operator inspects in the preserved worktree.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("rebase onto main line failed: {0}")]
    Rebase(String),

    #[error("test command failed: {0}")]
    Test(String),

    #[error("merge into main line failed: {0}")]
    Merge(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
