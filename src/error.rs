//! Error types for the synchronization engine
//!
//! One `thiserror` enum per layer. Errors that travel through the
//! single-flight rendezvous (`LedgerError`, `FetchError`) are `Clone` and
//! carry plain messages instead of boxed sources, so every waiter of a shared
//! fetch receives the same value.

use std::time::Duration;

use genealogy_types::{BranchErrorKind, NodeId};
use thiserror::Error;

/// Main error type for the engine's public API
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine is not running")]
    NotRunning,

    #[error("Tracking for {0} has stopped")]
    Stopped(NodeId),
}

/// Failure of a single ledger read
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Transient network/RPC failure; retried with backoff
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// Read exceeded its timeout; not retried
    #[error("ledger read timed out after {0:?}")]
    Timeout(Duration),
}

impl LedgerError {
    /// Annotation kind used when this failure truncates a branch
    pub fn branch_kind(&self) -> BranchErrorKind {
        match self {
            LedgerError::Unavailable(_) => BranchErrorKind::LedgerUnavailable,
            LedgerError::Timeout(_) => BranchErrorKind::BranchTimeout,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }
}

/// Fatal failure of a whole tree fetch. Only the root can cause one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("root {root} could not be resolved: {source}")]
    RootUnavailable { root: NodeId, source: LedgerError },
}

impl FetchError {
    pub fn root(&self) -> &NodeId {
        match self {
            FetchError::RootUnavailable { root, .. } => root,
        }
    }
}

/// Live event channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("stream lagged, {0} events skipped")]
    Lagged(u64),
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {var}: {value:?}")]
    Env { var: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for engine operations
pub type SyncResult<T> = Result<T, SyncError>;
