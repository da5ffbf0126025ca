//! Normalize, deduplicate and persist fetched pages
//!
//! A page becomes one batch. The batch is upserted into the store inside a
//! transaction, appended to the CSV file, and only then committed, so both
//! sinks either gain the whole batch or nothing. The one exception is a write
//! that times out without a known outcome: the CSV may then hold rows the
//! store lacks, never the reverse.

pub mod csv_sink;
pub mod dedupe;
pub mod normalize;
pub mod store;

pub use csv_sink::{CsvAppend, CsvSink};
pub use dedupe::dedupe;
pub use normalize::normalize;
pub use store::ExtensionStore;

use crate::config::SinkConfig;
use crate::error::{IngestError, SinkWriteError};
use crate::fetcher::FetchedPage;
use crate::models::{CompositeKey, ExtensionRecord};
use crate::retry::Backoff;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of one committed batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub page: u32,
    /// Rows written to each sink after deduplication
    pub written: usize,
    /// Records dropped for schema violations
    pub skipped: usize,
    /// Composite keys of the written rows, in batch order
    pub keys: Vec<CompositeKey>,
}

/// Persists batches into the CSV and relational sinks
pub struct Ingestor {
    store: ExtensionStore,
    csv: CsvSink,
    write_timeout: Duration,
    max_retries: u32,
    backoff: Backoff,
}

impl Ingestor {
    /// Open both sinks described by `config`
    pub async fn open(config: &SinkConfig) -> Result<Self, SinkWriteError> {
        let store = ExtensionStore::connect(&config.database_url, config.write_timeout()).await?;
        Ok(Self::new(store, CsvSink::new(&config.csv_path), config))
    }

    pub fn new(store: ExtensionStore, csv: CsvSink, config: &SinkConfig) -> Self {
        let base = Duration::from_millis(config.backoff_base_ms);
        Self {
            store,
            csv,
            write_timeout: config.write_timeout(),
            max_retries: config.max_retries,
            backoff: Backoff::new(base, config.write_timeout().max(base)),
        }
    }

    pub fn store(&self) -> &ExtensionStore {
        &self.store
    }

    pub fn csv(&self) -> &CsvSink {
        &self.csv
    }

    /// Normalize every raw record of `page`, skipping schema violations
    pub fn prepare(&self, page: &FetchedPage) -> (Vec<ExtensionRecord>, usize) {
        let mut skipped = 0;
        let mut records = Vec::with_capacity(page.records.len());

        for (position, raw) in page.records.iter().enumerate() {
            match normalize(raw) {
                Ok(record) => records.push(record),
                Err(err) => {
                    skipped += 1;
                    match raw.composite_key() {
                        Some(key) => {
                            warn!(page = page.index, key = %key, error = %err, "Skipping record")
                        },
                        None => warn!(page = page.index, position, error = %err, "Skipping record"),
                    }
                },
            }
        }

        (dedupe(records), skipped)
    }

    /// Commit one page as a batch, retrying sink failures with backoff
    pub async fn ingest_page(&self, page: &FetchedPage) -> Result<BatchReport, IngestError> {
        let (records, skipped) = self.prepare(page);
        let keys: Vec<CompositeKey> = records.iter().map(ExtensionRecord::key).collect();

        if records.is_empty() {
            info!(page = page.index, skipped, "Nothing to write for page");
            return Ok(BatchReport {
                page: page.index,
                written: 0,
                skipped,
                keys,
            });
        }

        let max_attempts = self.max_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.commit(&records).await {
                Ok(written) => {
                    info!(page = page.index, written, skipped, attempt, "Committed batch");
                    return Ok(BatchReport {
                        page: page.index,
                        written,
                        skipped,
                        keys,
                    });
                },
                Err(err) if attempt >= max_attempts => {
                    error!(page = page.index, attempts = attempt, error = %err, "Batch commit failed");
                    let key_range = match (keys.first(), keys.last()) {
                        (Some(first), Some(last)) => Some((first.clone(), last.clone())),
                        _ => None,
                    };
                    return Err(IngestError {
                        page: page.index,
                        key_range,
                        attempts: attempt,
                        source: err,
                    });
                },
                Err(err) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        page = page.index,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Batch commit failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                },
            }
        }
    }

    /// One all-or-nothing attempt at writing `records` to both sinks
    async fn commit(&self, records: &[ExtensionRecord]) -> Result<usize, SinkWriteError> {
        let mut tx = self.store.begin().await?;
        let written = within(self.write_timeout, store::upsert_in(&mut tx, records)).await?;

        let sink = self.csv.clone();
        let rows = records.to_vec();
        let append = match blocking(self.write_timeout, move || sink.write_csv(&rows)).await {
            Ok(append) => append,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Store rollback failed");
                }
                return Err(err);
            },
        };

        if let Err(err) = within(self.write_timeout, tx.commit()).await {
            if truncates_csv_after(&err) {
                let sink = self.csv.clone();
                if let Err(undo_err) = blocking(self.write_timeout, move || sink.rollback(append)).await {
                    error!(
                        path = %self.csv.path().display(),
                        error = %undo_err,
                        "Failed to remove CSV rows of an uncommitted batch"
                    );
                }
            } else {
                // the commit may still land; dropping the rows could leave the store ahead of the CSV
                warn!(
                    path = %self.csv.path().display(),
                    csv_rows = append.rows,
                    "Store commit timed out, keeping the appended CSV rows"
                );
            }
            return Err(err);
        }

        debug!(rows = written, csv_rows = append.rows, "Batch written to both sinks");
        Ok(written)
    }
}

async fn within<T, E, F>(limit: Duration, fut: F) -> Result<T, SinkWriteError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<SinkWriteError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(SinkWriteError::Timeout(limit)),
    }
}

/// Run blocking file IO off the runtime, bounded by `limit`
///
/// On timeout the closure keeps running on its worker thread.
async fn blocking<T, F>(limit: Duration, f: F) -> Result<T, SinkWriteError>
where
    F: FnOnce() -> Result<T, SinkWriteError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(join_err.into()),
        Err(_) => Err(SinkWriteError::Timeout(limit)),
    }
}

/// Whether a failed commit definitely left the store unchanged
fn truncates_csv_after(commit_err: &SinkWriteError) -> bool {
    !matches!(commit_err, SinkWriteError::Timeout(_))
}
