//! End-to-end crawl: fetch a page, archive it, commit it, advance the cursor
//!
//! Pages are processed strictly one after another. The cursor only moves
//! after a batch reached both sinks, so a restart resumes at the first page
//! that was not committed.

use crate::archive::RawArchive;
use crate::config::{MarketplaceConfig, SinkConfig};
use crate::cursor::ResumeCursor;
use crate::error::{PipelineError, Result};
use crate::fetcher::{Fetcher, PageSource};
use crate::ingest::Ingestor;
use crate::models::{CompositeKey, RawExtension};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of [`Pipeline::run`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// First page requested in this run
    pub first_page: u32,
    /// Last page durably committed, including earlier runs
    pub last_committed: Option<u32>,
    pub pages_committed: u32,
    /// Distinct composite keys seen in fetched records
    pub distinct_records: usize,
    pub rows_written: usize,
    pub skipped: usize,
    /// The source ran out of pages; the cursor was cleared
    pub exhausted: bool,
    pub cancelled: bool,
}

/// Wires a [`PageSource`] to the sinks
pub struct Pipeline<S> {
    source: S,
    marketplace: MarketplaceConfig,
    ingestor: Ingestor,
    cursor: ResumeCursor,
    archive: Option<RawArchive>,
    cancel: CancellationToken,
    progress: ProgressBar,
    fresh: bool,
}

impl<S: PageSource> Pipeline<S> {
    pub fn new(
        source: S,
        marketplace: MarketplaceConfig,
        ingestor: Ingestor,
        sinks: &SinkConfig,
    ) -> Self {
        Self {
            source,
            marketplace,
            ingestor,
            cursor: ResumeCursor::new(&sinks.cursor_path),
            archive: sinks.raw_dir.as_ref().map(RawArchive::new),
            cancel: CancellationToken::new(),
            progress: ProgressBar::hidden(),
            fresh: false,
        }
    }

    /// Validate both configurations and open the sinks
    pub async fn open(source: S, marketplace: MarketplaceConfig, sinks: &SinkConfig) -> Result<Self> {
        marketplace.validate().map_err(PipelineError::Config)?;
        sinks.validate().map_err(PipelineError::Config)?;

        let ingestor = Ingestor::open(sinks).await?;
        Ok(Self::new(source, marketplace, ingestor, sinks))
    }

    /// Ignore and clear any stored cursor before the run
    pub fn fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Show a progress bar on the terminal
    pub fn with_progress(mut self) -> Self {
        self.progress = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} pages ({eta})")
        {
            self.progress.set_style(style.progress_chars("#>-"));
        }
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    pub fn cursor(&self) -> &ResumeCursor {
        &self.cursor
    }

    /// Crawl up to `max_pages` pages, committing each before fetching the next
    pub async fn run(&self, max_pages: u32) -> Result<RunSummary> {
        if self.fresh && self.cursor.clear()? {
            info!("Discarded stored cursor, starting a fresh snapshot");
        }

        let resume = self.cursor.load()?.map(|state| state.last_committed_page);
        let mut fetcher = Fetcher::new(&self.source, &self.marketplace);
        if let Some(page) = resume {
            info!(page, "Resuming after last committed page");
            fetcher = fetcher.resume_after(page);
        }

        let mut summary = RunSummary {
            first_page: fetcher.start_page(),
            last_committed: resume,
            ..RunSummary::default()
        };
        let mut seen: HashSet<CompositeKey> = HashSet::new();
        let mut last_seen = summary.first_page.saturating_sub(1);
        let mut reached_end = false;

        self.progress
            .set_length(u64::from(max_pages.saturating_sub(last_seen)));
        self.progress.set_message("Crawling marketplace");

        let pages = fetcher.pages(max_pages);
        futures::pin_mut!(pages);

        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!(last_committed = ?summary.last_committed, "Crawl cancelled");
                    summary.cancelled = true;
                    break;
                },
                item = pages.next() => item,
            };

            let page = match item {
                Some(Ok(page)) => page,
                Some(Err(failure)) => {
                    self.progress.abandon();
                    return Err(PipelineError::Fetch {
                        failure,
                        last_committed: summary.last_committed,
                    });
                },
                None => break,
            };

            last_seen = page.index;
            reached_end = page.is_last;
            seen.extend(page.records.iter().filter_map(RawExtension::composite_key));

            if let Some(archive) = &self.archive {
                if let Err(err) = archive.save(&page) {
                    warn!(page = page.index, error = %err, "Failed to archive raw page");
                }
            }

            let report = match self.ingestor.ingest_page(&page).await {
                Ok(report) => report,
                Err(source) => {
                    self.progress.abandon();
                    return Err(PipelineError::Ingest {
                        source,
                        last_committed: summary.last_committed,
                    });
                },
            };

            self.cursor.save(page.index)?;
            summary.last_committed = Some(page.index);
            summary.pages_committed += 1;
            summary.rows_written += report.written;
            summary.skipped += report.skipped;

            self.progress.inc(1);
            self.progress
                .set_message(format!("{} distinct extensions", seen.len()));
        }

        summary.distinct_records = seen.len();
        // An empty page ends the stream before max_pages is reached.
        summary.exhausted = !summary.cancelled && (reached_end || last_seen < max_pages);

        if summary.exhausted {
            self.cursor.clear()?;
        }
        self.progress.finish_and_clear();

        info!(
            first_page = summary.first_page,
            last_committed = ?summary.last_committed,
            pages = summary.pages_committed,
            rows = summary.rows_written,
            skipped = summary.skipped,
            distinct = summary.distinct_records,
            exhausted = summary.exhausted,
            "Crawl finished"
        );

        Ok(summary)
    }
}
