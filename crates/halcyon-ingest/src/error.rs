//! Error types for the collection engine
//!
//! The variants follow how a failure must be handled, not where it came
//! from: auth problems need a token refresh, transient problems are retried
//! with backoff, client errors fail the run immediately, normalization
//! problems skip a single record, and sink problems abort the run before
//! its checkpoint is committed.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for ingest operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Error type for the collection engine
#[derive(Error, Debug)]
pub enum IngestError {
    /// Token rejected and could not be refreshed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Timeout, connection reset, 5xx or 429 after all retries
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// 4xx other than 401/403/429
    #[error("API returned HTTP {status} for {url}: {body}")]
    Client {
        status: u16,
        url: String,
        body: String,
    },

    /// Payload does not fit the object type's schema
    #[error("Cannot normalize {object_type} record: {reason}")]
    Normalization { object_type: String, reason: String },

    /// Output sink unavailable
    #[error("Sink write failed: {0}")]
    SinkWrite(String),

    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown object type: {0}")]
    UnknownObjectType(String),

    /// Shutdown requested while a run was in flight
    #[error("Collection cancelled")]
    Cancelled,

    /// Whole-run deadline exceeded
    #[error("Collection run exceeded its deadline of {0:?}")]
    Timeout(Duration),

    #[error("Invalid JSON from API: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] halcyon_common::HalcyonError),
}

impl IngestError {
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientNetwork(msg.into())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        Self::SinkWrite(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn normalization(object_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Normalization {
            object_type: object_type.into(),
            reason: reason.into(),
        }
    }

    /// Whether the request that produced this error may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }

    /// Short stable label used in health reports and status events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::TransientNetwork(_) => "transient_network",
            Self::Client { .. } => "client",
            Self::Normalization { .. } => "normalization",
            Self::SinkWrite(_) => "sink_write",
            Self::Checkpoint(_) => "checkpoint",
            Self::Config(_) => "config",
            Self::UnknownObjectType(_) => "unknown_object_type",
            Self::Cancelled => "cancelled",
            Self::Timeout(_) => "timeout",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Common(_) => "common",
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            Self::Config(format!("invalid HTTP request: {err}"))
        } else if let Some(status) = err.status() {
            Self::Client {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
                body: err.to_string(),
            }
        } else {
            // timeouts, connect failures, resets, truncated bodies
            Self::TransientNetwork(err.to_string())
        }
    }
}
