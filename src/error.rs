use chrono::NaiveDate;
use thiserror::Error;

/// Reasons a bar is excluded from the working set.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BarError {
    #[error("{time}: field {field} is not a finite number")]
    NonFinite { time: NaiveDate, field: &'static str },
    #[error("{time}: prices must be positive")]
    NonPositivePrice { time: NaiveDate },
    #[error("{time}: negative volume {volume}")]
    NegativeVolume { time: NaiveDate, volume: f64 },
    #[error("{time}: high {high} is below max(open, close)")]
    HighBelowBody { time: NaiveDate, high: f64 },
    #[error("{time}: low {low} is above min(open, close)")]
    LowAboveBody { time: NaiveDate, low: f64 },
    #[error("record {index}: {reason}")]
    Unparseable { index: usize, reason: String },
}

/// Failures of the bar-source collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("bar source timed out after {0} ms")]
    Timeout(u64),
    #[error("bar source failed: {0}")]
    Upstream(String),
    #[error("bar source returned an unreadable payload: {0}")]
    Decode(String),
}

/// Failures of the push feed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StreamError {
    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connect timed out after {0} ms")]
    ConnectTimeout(u64),
    #[error("no push feed is configured")]
    NotConfigured,
}

/// Errors surfaced by the query service.
///
/// Kept `Clone` so a single in-flight fetch can hand the same outcome to every
/// caller waiting on it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("invalid indicator configuration: {0}")]
    Configuration(String),
    #[error("fetch failure: {0}")]
    Fetch(#[from] FetchError),
    #[error("stream failure: {0}")]
    Stream(#[from] StreamError),
    #[error("query was superseded by a newer request")]
    Superseded,
    #[error("internal error: {0}")]
    Internal(String),
}

impl QueryError {
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, QueryError::Fetch(_))
    }

    pub fn is_stream_failure(&self) -> bool {
        matches!(self, QueryError::Stream(_))
    }
}
