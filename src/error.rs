//! Typed failures raised by the pipeline components.

use chrono::NaiveDateTime;
use thiserror::Error;

/// Errors from building or updating the request store
#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    /// Two records share an SR number
    #[error("duplicate service request {0}")]
    DuplicateId(String),

    /// Closure timestamp earlier than creation
    #[error("service request {0} closed before it was created")]
    ClosedBeforeCreated(String),
}

/// Errors from feature computation
#[derive(Debug, Error, PartialEq)]
pub enum FeatureError {
    #[error("service request {0} not found")]
    NotFound(String),

    /// `as_of` precedes the request's creation
    #[error("as-of {as_of} precedes creation of {sr_number} at {created_at}")]
    InvalidTimestamp {
        sr_number: String,
        as_of: NaiveDateTime,
        created_at: NaiveDateTime,
    },
}

/// Errors from equity and hotspot queries
#[derive(Debug, Error, PartialEq)]
pub enum AnalyticsError {
    #[error("invalid area '{0}'")]
    InvalidArea(String),

    #[error("invalid area type '{0}'")]
    InvalidAreaType(String),

    #[error("invalid category '{0}'")]
    InvalidCategory(String),

    /// Look-back window outside the supported range
    #[error("invalid window of {0} days")]
    InvalidWindow(i64),

    /// No closed requests to aggregate
    #[error("no closed requests for {0}")]
    EmptyGroup(String),
}

/// Errors from the prediction model boundary
#[derive(Debug, Error, PartialEq)]
pub enum PredictorError {
    /// Model could not produce an output
    #[error("model unavailable: {0}")]
    Unavailable(String),

    /// Model output violates the prediction contract
    #[error("prediction contract breach: {0}")]
    ContractBreach(String),
}
