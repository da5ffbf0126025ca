//! Paginated fetch from the marketplace
//!
//! [`Fetcher`] walks pages of a [`PageSource`] in order, retrying transient
//! failures with exponential backoff and stopping at the first permanent one.
//! It never reorders or deduplicates records and never touches the sinks.

pub mod client;

pub use client::MarketplaceClient;

use crate::config::MarketplaceConfig;
use crate::error::{FetchError, PageFailure};
use crate::models::RawExtension;
use crate::retry::Backoff;
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A paginated source of raw extension objects
///
/// One call is one attempt; retrying is the fetcher's job.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, page: u32, page_size: u32) -> Result<SourcePage, FetchError>;
}

#[async_trait]
impl<T: PageSource + ?Sized> PageSource for Arc<T> {
    async fn fetch_page(&self, page: u32, page_size: u32) -> Result<SourcePage, FetchError> {
        (**self).fetch_page(page, page_size).await
    }
}

#[async_trait]
impl<'a, T: PageSource + ?Sized> PageSource for &'a T {
    async fn fetch_page(&self, page: u32, page_size: u32) -> Result<SourcePage, FetchError> {
        (**self).fetch_page(page, page_size).await
    }
}

/// One page as returned by the source
#[derive(Debug, Clone, Default)]
pub struct SourcePage {
    pub extensions: Vec<RawExtension>,
    /// Total result count, when the source reports one
    pub total_count: Option<u64>,
}

impl SourcePage {
    fn covers_total(&self, page: u32, page_size: u32) -> bool {
        self.total_count
            .is_some_and(|total| u64::from(page) * u64::from(page_size) >= total)
    }
}

/// A successfully fetched, non-empty page
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// 1-based page index
    pub index: u32,
    pub records: Vec<RawExtension>,
    /// The source reported that nothing follows this page
    pub is_last: bool,
}

/// Outcome of [`Fetcher::crawl`]
#[derive(Debug, Default)]
pub struct CrawlReport {
    /// Pages fetched before the crawl stopped, in order
    pub pages: Vec<FetchedPage>,
    /// Distinct composite keys across all fetched records
    pub distinct_records: usize,
    /// The page-level failure that stopped the crawl, if any
    pub failure: Option<PageFailure>,
}

impl CrawlReport {
    pub fn last_page(&self) -> Option<u32> {
        self.pages.last().map(|page| page.index)
    }

    pub fn record_count(&self) -> usize {
        self.pages.iter().map(|page| page.records.len()).sum()
    }
}

/// Walks a [`PageSource`] page by page
pub struct Fetcher<S> {
    source: S,
    page_size: u32,
    max_retries: u32,
    timeout: Duration,
    backoff: Backoff,
    resume_after: Option<u32>,
}

impl<S: PageSource> Fetcher<S> {
    pub fn new(source: S, config: &MarketplaceConfig) -> Self {
        Self {
            source,
            page_size: config.page_size,
            max_retries: config.max_retries,
            timeout: config.timeout(),
            backoff: Backoff::from_millis(config.backoff_base_ms, config.max_backoff_ms),
            resume_after: None,
        }
    }

    /// Skip pages up to and including `last_committed`
    pub fn resume_after(mut self, last_committed: u32) -> Self {
        self.resume_after = Some(last_committed);
        self
    }

    pub fn start_page(&self) -> u32 {
        self.resume_after.map_or(1, |page| page.saturating_add(1))
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Lazy sequence of pages from [`start_page`](Self::start_page) to `max_pages`
    ///
    /// Ends after an empty page, after the page that covers the source's
    /// reported total, or after yielding a page failure.
    pub fn pages(&self, max_pages: u32) -> impl Stream<Item = Result<FetchedPage, PageFailure>> + '_ {
        stream::unfold(Some(self.start_page()), move |next| async move {
            let page = next?;
            if page > max_pages {
                debug!(max_pages, "Reached page limit");
                return None;
            }

            match self.fetch_with_retry(page).await {
                Ok(source_page) if source_page.extensions.is_empty() => {
                    info!(page, "No more extensions found after page {}", page - 1);
                    None
                },
                Ok(source_page) => {
                    let is_last = source_page.covers_total(page, self.page_size);
                    let following = if is_last { None } else { page.checked_add(1) };
                    let fetched = FetchedPage {
                        index: page,
                        records: source_page.extensions,
                        is_last,
                    };
                    Some((Ok(fetched), following))
                },
                Err(failure) => Some((Err(failure), None)),
            }
        })
    }

    /// Fetch every page into memory
    ///
    /// Pages fetched before a failure are kept in the report.
    pub async fn crawl(&self, max_pages: u32) -> CrawlReport {
        let mut report = CrawlReport::default();
        let mut seen = HashSet::new();

        let pages = self.pages(max_pages);
        futures::pin_mut!(pages);

        while let Some(item) = pages.next().await {
            match item {
                Ok(page) => {
                    seen.extend(page.records.iter().filter_map(RawExtension::composite_key));
                    info!(
                        page = page.index,
                        records = page.records.len(),
                        total = seen.len(),
                        "Crawled page"
                    );
                    report.pages.push(page);
                },
                Err(failure) => report.failure = Some(failure),
            }
        }

        report.distinct_records = seen.len();
        report
    }

    async fn fetch_with_retry(&self, page: u32) -> Result<SourcePage, PageFailure> {
        let max_attempts = self.max_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result =
                match tokio::time::timeout(self.timeout, self.source.fetch_page(page, self.page_size))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::transient(format!(
                        "request timed out after {:?}",
                        self.timeout
                    ))),
                };

            let err = match result {
                Ok(source_page) => {
                    debug!(page, attempt, records = source_page.extensions.len(), "Fetched page");
                    return Ok(source_page);
                },
                Err(err) => err,
            };

            let retry_after = match &err {
                FetchError::Permanent(_) => {
                    error!(page, error = %err, "Permanent failure, aborting crawl");
                    return Err(PageFailure {
                        page,
                        attempts: attempt,
                        source: err,
                    });
                },
                FetchError::Transient { retry_after, .. } => *retry_after,
            };

            if attempt >= max_attempts {
                warn!(page, attempts = attempt, error = %err, "Retries exhausted");
                return Err(PageFailure {
                    page,
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.backoff.delay_with_hint(attempt, retry_after);
            warn!(
                page,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Source answering from a script keyed by page; unscripted pages are empty
    #[derive(Default)]
    struct ScriptedSource {
        pages: HashMap<u32, Vec<Result<SourcePage, FetchError>>>,
        default: Option<Result<SourcePage, FetchError>>,
        calls: Mutex<Vec<u32>>,
    }

    impl ScriptedSource {
        fn page(mut self, page: u32, ids: &[&str]) -> Self {
            self.pages.entry(page).or_default().push(Ok(source_page(ids, None)));
            self
        }

        fn fail(mut self, page: u32, err: FetchError) -> Self {
            self.pages.entry(page).or_default().push(Err(err));
            self
        }

        fn calls(&self) -> Vec<u32> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        async fn fetch_page(&self, page: u32, _page_size: u32) -> Result<SourcePage, FetchError> {
            let mut calls = self.calls.lock().unwrap();
            let attempt = calls.iter().filter(|p| **p == page).count();
            calls.push(page);

            match self.pages.get(&page) {
                Some(script) => script
                    .get(attempt)
                    .or_else(|| script.last())
                    .cloned()
                    .unwrap_or_else(|| Ok(SourcePage::default())),
                None => self.default.clone().unwrap_or_else(|| Ok(SourcePage::default())),
            }
        }
    }

    /// Source whose first `stalls` calls hang for an hour
    struct StallingSource {
        stalls: usize,
        calls: Mutex<usize>,
    }

    impl StallingSource {
        fn new(stalls: usize) -> Self {
            Self {
                stalls,
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl PageSource for StallingSource {
        async fn fetch_page(&self, _page: u32, _page_size: u32) -> Result<SourcePage, FetchError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if call <= self.stalls {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(source_page(&["a"], Some(1)))
        }
    }

    fn source_page(ids: &[&str], total_count: Option<u64>) -> SourcePage {
        SourcePage {
            extensions: ids
                .iter()
                .map(|id| {
                    RawExtension::new(json!({
                        "publisher": { "publisherId": "pub" },
                        "extensionId": id
                    }))
                })
                .collect(),
            total_count,
        }
    }

    fn config(max_retries: u32) -> MarketplaceConfig {
        MarketplaceConfig::builder()
            .page_size(2)
            .max_retries(max_retries)
            .backoff_ms(1, 2)
            .build()
    }

    #[tokio::test]
    async fn test_crawl_stops_at_empty_page() {
        let source = ScriptedSource::default().page(1, &["a", "b"]).page(2, &["c"]);
        let fetcher = Fetcher::new(source, &config(3));

        let report = fetcher.crawl(10).await;

        assert!(report.failure.is_none());
        assert_eq!(report.last_page(), Some(2));
        assert_eq!(report.distinct_records, 3);
        assert_eq!(fetcher.source().calls(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_crawl_respects_max_pages() {
        let source = ScriptedSource::default()
            .page(1, &["a"])
            .page(2, &["b"])
            .page(3, &["c"]);
        let fetcher = Fetcher::new(source, &config(3));

        let report = fetcher.crawl(2).await;

        assert_eq!(report.last_page(), Some(2));
        assert_eq!(fetcher.source().calls(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_crawl_stops_when_total_count_covered() {
        let mut source = ScriptedSource::default();
        source
            .pages
            .insert(1, vec![Ok(source_page(&["a", "b"], Some(3)))]);
        source.pages.insert(2, vec![Ok(source_page(&["c"], Some(3)))]);
        let fetcher = Fetcher::new(source, &config(3));

        let report = fetcher.crawl(10).await;

        assert_eq!(report.pages.len(), 2);
        assert!(report.pages[1].is_last);
        assert_eq!(fetcher.source().calls(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_bounded() {
        let source = ScriptedSource::default()
            .page(1, &["a", "b"])
            .fail(2, FetchError::transient("HTTP 503"));
        let fetcher = Fetcher::new(source, &config(3));

        let report = fetcher.crawl(10).await;

        let failure = report.failure.as_ref().expect("page 2 should fail");
        assert_eq!(failure.page, 2);
        assert_eq!(failure.attempts, 4);
        assert!(failure.source.is_transient());
        // earlier page survives the failure
        assert_eq!(report.last_page(), Some(1));
        assert_eq!(report.distinct_records, 2);
        assert_eq!(fetcher.source().calls(), vec![1, 2, 2, 2, 2]);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let source = ScriptedSource::default()
            .fail(1, FetchError::transient("connection reset"))
            .page(1, &["a"]);
        let fetcher = Fetcher::new(source, &config(2));

        let report = fetcher.crawl(1).await;

        assert!(report.failure.is_none());
        assert_eq!(report.record_count(), 1);
        assert_eq!(fetcher.source().calls(), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let source = ScriptedSource::default()
            .page(1, &["a"])
            .fail(2, FetchError::permanent("HTTP 404"))
            .page(3, &["c"]);
        let fetcher = Fetcher::new(source, &config(5));

        let report = fetcher.crawl(10).await;

        let failure = report.failure.as_ref().expect("page 2 should fail");
        assert_eq!(failure.attempts, 1);
        assert!(!failure.source.is_transient());
        assert_eq!(fetcher.source().calls(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_resume_after_skips_committed_pages() {
        let source = ScriptedSource::default()
            .page(6, &["f"])
            .page(7, &["g"]);
        let fetcher = Fetcher::new(source, &config(0)).resume_after(5);

        assert_eq!(fetcher.start_page(), 6);
        let report = fetcher.crawl(10).await;

        assert_eq!(report.pages.first().map(|p| p.index), Some(6));
        assert_eq!(fetcher.source().calls(), vec![6, 7, 8]);
    }

    #[tokio::test]
    async fn test_records_keep_source_order_and_duplicates() {
        let source = ScriptedSource::default().page(1, &["b", "a", "b"]);
        let fetcher = Fetcher::new(source, &config(0));

        let report = fetcher.crawl(1).await;

        let ids: Vec<_> = report.pages[0]
            .records
            .iter()
            .map(|r| r.composite_key().unwrap().extension_id)
            .collect();
        assert_eq!(ids, vec!["b", "a", "b"]);
        assert_eq!(report.distinct_records, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_request_times_out_and_is_retried() {
        let config = MarketplaceConfig::builder()
            .page_size(2)
            .timeout_secs(1)
            .max_retries(2)
            .backoff_ms(1, 2)
            .build();
        let fetcher = Fetcher::new(StallingSource::new(1), &config);

        let report = fetcher.crawl(1).await;

        assert!(report.failure.is_none());
        assert_eq!(report.record_count(), 1);
        assert_eq!(fetcher.source().calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_is_transient() {
        let config = MarketplaceConfig::builder()
            .page_size(2)
            .timeout_secs(1)
            .max_retries(1)
            .backoff_ms(1, 2)
            .build();
        let fetcher = Fetcher::new(StallingSource::new(usize::MAX), &config);

        let report = fetcher.crawl(1).await;

        let failure = report.failure.as_ref().expect("every attempt stalls");
        assert_eq!(failure.attempts, 2);
        assert!(failure.source.is_transient());
        assert!(failure.source.to_string().contains("timed out"), "{}", failure.source);
        assert_eq!(fetcher.source().calls(), 2);
    }
}
