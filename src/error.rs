//! Error taxonomy for the harvesting pipeline.
//!
//! | Error | Raised by | Retryable |
//! |-------|-----------|-----------|
//! | [`FetchError`] | adapter `fetch` | yes, except [`FetchError::InvalidUrl`] |
//! | [`ParseError`] | adapter `parse` | yes (by policy) |
//! | [`PersistenceError`] | adapter `store`, catalog store | yes |
//! | [`HarvestError::Timeout`] | orchestrator attempt deadline | yes |
//! | [`HarvestError::ExhaustedRetries`] | orchestrator | terminal |

use std::time::Duration;

use thiserror::Error;

use crate::models::{CheckpointStatus, HostType};

/// Failure while retrieving raw source data.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid URL for {kind} source: {url} ({reason})")]
    InvalidUrl {
        kind: HostType,
        url: String,
        reason: String,
    },

    #[error("HTTP {status} from {url}: {body}")]
    Http {
        status: u16,
        url: String,
        body: String,
    },

    #[error("rate limited by {url}")]
    RateLimited { url: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("could not decode response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

impl FetchError {
    /// Invalid URLs never succeed on retry; everything else may.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::InvalidUrl { .. })
    }

    /// Whether an HTTP-level retry inside the adapter makes sense.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::RateLimited { .. } => true,
            FetchError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Network(err.to_string())
    }
}

/// Structural defect in a fetched payload.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Transaction or constraint failure in the catalog store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored value: {0}")]
    Corrupt(String),
}

/// Top-level error of a harvest request.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("harvest of {url} timed out after {}s", .after.as_secs())]
    Timeout { url: String, after: Duration },

    #[error("harvest of {url} failed after {attempts} attempts; last error: {last_error}")]
    ExhaustedRetries {
        url: String,
        attempts: u32,
        last_error: String,
    },

    #[error("harvest of {url} is already in progress")]
    InFlight { url: String },

    #[error("no adapter registered for source kind '{0}'")]
    UnsupportedSource(HostType),

    #[error("checkpoint for {url} cannot move from {from} to {to}")]
    InvalidTransition {
        url: String,
        from: CheckpointStatus,
        to: CheckpointStatus,
    },
}

impl HarvestError {
    /// Whether the orchestrator's retry layer should try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            HarvestError::Fetch(e) => e.is_retryable(),
            HarvestError::Parse(_) | HarvestError::Persistence(_) | HarvestError::Timeout { .. } => {
                true
            }
            HarvestError::ExhaustedRetries { .. }
            | HarvestError::InFlight { .. }
            | HarvestError::UnsupportedSource(_)
            | HarvestError::InvalidTransition { .. } => false,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            HarvestError::Fetch(_) => "fetch",
            HarvestError::Parse(_) => "parse",
            HarvestError::Persistence(_) => "persistence",
            HarvestError::Timeout { .. } => "timeout",
            HarvestError::ExhaustedRetries { .. } => "exhausted",
            HarvestError::InFlight { .. } => "in_flight",
            HarvestError::UnsupportedSource(_) => "unsupported",
            HarvestError::InvalidTransition { .. } => "invalid_transition",
        }
    }
}

/// Error from a catalog updater operation.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("server not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Harvest(#[from] HarvestError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
