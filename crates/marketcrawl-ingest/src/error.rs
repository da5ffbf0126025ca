//! Error taxonomy for the crawl-and-ingest pipeline
//!
//! Record-level problems ([`SchemaError`]) are absorbed by the ingestor.
//! Page-level ([`PageFailure`]) and batch-level ([`IngestError`]) failures
//! surface to the caller once retries are spent, carrying the page index so a
//! run can be resumed.

use crate::models::CompositeKey;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single page request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Network error, timeout, 5xx or rate limiting; worth retrying
    #[error("transient fetch failure: {reason}")]
    Transient {
        reason: String,
        /// Minimum wait requested by the server (`Retry-After`)
        retry_after: Option<Duration>,
    },

    /// 4xx other than rate limiting, or a response we cannot interpret
    #[error("permanent fetch failure: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// A page that could not be fetched
#[derive(Error, Debug, Clone, PartialEq)]
#[error("page {page} failed after {attempts} attempt(s): {source}")]
pub struct PageFailure {
    pub page: u32,
    pub attempts: u32,
    #[source]
    pub source: FetchError,
}

/// A raw record that does not fit the extension schema
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("missing required field `{0}`")]
    Missing(&'static str),

    #[error("field `{field}` has the wrong shape: expected {expected}")]
    WrongShape {
        field: &'static str,
        expected: &'static str,
    },

    #[error("field `{field}` is out of range: {detail}")]
    OutOfRange { field: &'static str, detail: String },

    #[error("lastUpdated ({last_updated}) is earlier than publishedDate ({published_date})")]
    DateOrder {
        last_updated: String,
        published_date: String,
    },
}

/// One failed attempt at writing a batch
#[derive(Error, Debug)]
pub enum SinkWriteError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("blocking write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}

/// A batch that could not be committed within the retry budget
#[derive(Error, Debug)]
#[error("batch for page {page} ({}) failed after {attempts} attempt(s): {source}", describe_range(.key_range))]
pub struct IngestError {
    pub page: u32,
    /// First and last composite key of the batch, in batch order
    pub key_range: Option<(CompositeKey, CompositeKey)>,
    pub attempts: u32,
    #[source]
    pub source: SinkWriteError,
}

fn describe_range(range: &Option<(CompositeKey, CompositeKey)>) -> String {
    match range {
        Some((first, last)) => format!("keys {}..{}", first, last),
        None => "empty batch".to_string(),
    }
}

fn describe_page(page: &Option<u32>) -> String {
    match page {
        Some(page) => format!("last committed page: {}", page),
        None => "no page committed yet".to_string(),
    }
}

/// Result type for pipeline runs
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Run-terminating failure, annotated with the resume point
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("crawl aborted, {}: {failure}", describe_page(.last_committed))]
    Fetch {
        failure: PageFailure,
        last_committed: Option<u32>,
    },

    #[error("ingest aborted, {}: {source}", describe_page(.last_committed))]
    Ingest {
        #[source]
        source: IngestError,
        last_committed: Option<u32>,
    },

    #[error("sink setup failed: {0}")]
    Sink(#[from] SinkWriteError),

    #[error("state error: {0}")]
    State(#[from] marketcrawl_common::CommonError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// Last page whose batch was durably committed before the failure
    pub fn last_committed(&self) -> Option<u32> {
        match self {
            Self::Fetch { last_committed, .. } | Self::Ingest { last_committed, .. } => {
                *last_committed
            },
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_error_names_last_committed_page() {
        let err = PipelineError::Fetch {
            failure: PageFailure {
                page: 7,
                attempts: 4,
                source: FetchError::transient("HTTP 503"),
            },
            last_committed: Some(6),
        };

        let msg = err.to_string();
        assert!(msg.contains("last committed page: 6"), "{}", msg);
        assert!(msg.contains("page 7 failed after 4 attempt(s)"), "{}", msg);
        assert_eq!(err.last_committed(), Some(6));
    }

    #[test]
    fn test_ingest_error_names_key_range() {
        let err = IngestError {
            page: 2,
            key_range: Some((CompositeKey::new("a", "1"), CompositeKey::new("z", "9"))),
            attempts: 3,
            source: SinkWriteError::Timeout(Duration::from_secs(1)),
        };
        let msg = err.to_string();
        assert!(msg.contains("page 2"));
        assert!(msg.contains("keys a/1..z/9"));
    }

    #[test]
    fn test_fetch_error_classification() {
        assert!(FetchError::transient("reset").is_transient());
        assert!(!FetchError::permanent("404").is_transient());
    }
}
