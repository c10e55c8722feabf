//! Error types for portalflow.

use thiserror::Error;

use crate::model::{ExchangeId, Status};

#[derive(Debug, Error)]
pub enum Error {
    #[error("execution not found: {0}")]
    NotFound(String),

    /// Admission rejected: a live execution already holds the fingerprint.
    /// Not a failure from the caller's point of view.
    #[error("duplicate of live execution {0}")]
    Duplicate(ExchangeId),

    /// The record was not in any of the expected statuses (or does not exist).
    #[error("stale transition on {exchange_id}: expected one of {expected:?}, wanted {to}")]
    StaleTransition {
        exchange_id: ExchangeId,
        expected: Vec<Status>,
        to: Status,
    },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("event publish failed: {0}")]
    Publish(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
