// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use relaymint_kernel::error::KernelError;
use relaymint_kernel::session::SessionState;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum MinerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("session tree already flushed: {0}")]
    AlreadyFlushed(String),

    #[error("session tree not flushed: {0}")]
    NotFlushed(String),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("{0} already started")]
    AlreadyStarted(&'static str),

    #[error("submission failed for session {session_id}: {reason}")]
    SubmissionFailed { session_id: String, reason: String },

    #[error("store error: {0}")]
    Io(#[from] StoreError),

    #[error("invalid transition for {session_id}: {from} -> {to}")]
    InvalidTransition {
        session_id: String,
        from: SessionState,
        to: SessionState,
    },

    #[error("concurrent update conflict on {0}")]
    Conflict(String),

    #[error("accumulator error: {0}")]
    Accumulator(KernelError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("chain query failed: {0}")]
    Chain(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type MinerResult<T> = Result<T, MinerError>;

impl MinerError {
    /// Map a tree error for `session_id` onto the session-level taxonomy.
    pub fn from_kernel(session_id: &str, err: KernelError) -> Self {
        match err {
            KernelError::AlreadyFlushed => MinerError::AlreadyFlushed(session_id.to_string()),
            KernelError::NotFlushed => MinerError::NotFlushed(session_id.to_string()),
            other => MinerError::Accumulator(other),
        }
    }

    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            MinerError::NotFound(_) => "not_found",
            MinerError::AlreadyFlushed(_) => "already_flushed",
            MinerError::NotFlushed(_) => "not_flushed",
            MinerError::Closed(_) => "closed",
            MinerError::AlreadyStarted(_) => "already_started",
            MinerError::SubmissionFailed { .. } => "submission_failed",
            MinerError::Io(_) => "io",
            MinerError::InvalidTransition { .. } => "invalid_transition",
            MinerError::Conflict(_) => "conflict",
            MinerError::Accumulator(_) => "accumulator",
            MinerError::Serialization(_) => "serialization",
            MinerError::InvalidInput(_) => "invalid_input",
            MinerError::Chain(_) => "chain",
            MinerError::Cancelled => "cancelled",
        }
    }
}

impl From<KernelError> for MinerError {
    fn from(e: KernelError) -> Self {
        MinerError::Accumulator(e)
    }
}

impl From<serde_json::Error> for MinerError {
    fn from(e: serde_json::Error) -> Self {
        MinerError::Serialization(e.to_string())
    }
}
