//! Error types for the subscription store.

use crate::types::State;
use thiserror::Error;

/// Main error type for store operations.
///
/// The enum is `Clone` so that a single status can resolve any number of
/// pending state-change notifiers; io and codec errors are folded into
/// string-carrying variants for that reason.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("illegal state transition for version {version}: {from} -> {to}")]
    IllegalTransition {
        version: i64,
        from: State,
        to: State,
    },

    #[error("subscription set version not found: {0}")]
    KeyNotFound(i64),

    #[error("subscription set is not mutable")]
    NotMutable,

    #[error("subscription store has been closed")]
    StoreGone,

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("database is locked by another process")]
    Locked,

    #[error("database not initialized")]
    NotInitialized,

    #[error("invalid database format: {0}")]
    InvalidFormat(String),

    #[error("subscription set error: {0}")]
    SetError(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
