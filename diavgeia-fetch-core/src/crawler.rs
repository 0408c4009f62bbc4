//! Crawls the Diavgeia search API for one day and feeds valid decisions into
//! the shared [`WorkQueue`].
//!
//! Pages are requested in order with a page size of [`PAGE_SIZE`]; the number
//! of pages is `ceil(total / size)` taken from the first response. Records that
//! fail validation get exactly one corrective re-fetch through their self-link.
//! Whatever happens, the crawler closes the queue when it returns, which is
//! the single terminate signal for the run.

use std::future::Future;
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::contract::{DecisionSource, FetchError, SearchPage, SearchQuery, PAGE_SIZE};
use crate::decision::Decision;
use crate::queue::{QueueClosed, QueuedDecision, WorkQueue};
use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("authentication rejected: {0}")]
    Unauthorized(#[source] FetchError),
    #[error("search API contract violated: {0}")]
    Contract(String),
    #[error("giving up on {what} after {attempts} attempts: {source}")]
    Exhausted {
        what: String,
        attempts: u32,
        #[source]
        source: FetchError,
    },
    #[error(transparent)]
    Fetch(FetchError),
    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),
}

/// What one crawl did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CrawlSummary {
    pub total: u64,
    pub pages: u64,
    pub seen: usize,
    pub enqueued: usize,
    pub refetched: usize,
    pub invalid: usize,
    pub limit_reached: bool,
}

pub struct Crawler {
    worker_id: String,
    source: Arc<dyn DecisionSource>,
    queue: Arc<WorkQueue>,
    date: NaiveDate,
    limit: Option<usize>,
    retry: RetryPolicy,
}

impl Crawler {
    pub fn new(
        worker_id: impl Into<String>,
        source: Arc<dyn DecisionSource>,
        queue: Arc<WorkQueue>,
        date: NaiveDate,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            source,
            queue,
            date,
            limit: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Crawl every page for the day, then emit the terminate signal.
    pub async fn crawl(&self) -> Result<CrawlSummary, CrawlError> {
        let result = self.crawl_pages().await;
        if self.queue.close() {
            debug!(worker = %self.worker_id, "Terminate signal emitted");
        }
        match &result {
            Ok(summary) => info!(
                worker = %self.worker_id,
                pages = summary.pages,
                enqueued = summary.enqueued,
                invalid = summary.invalid,
                "Crawl finished"
            ),
            Err(e) => warn!(worker = %self.worker_id, error = %e, "Crawl aborted"),
        }
        result
    }

    async fn crawl_pages(&self) -> Result<CrawlSummary, CrawlError> {
        let mut summary = CrawlSummary::default();
        let query = SearchQuery::for_day(self.date);

        let Some(first) = self.search(&query).await? else {
            info!(worker = %self.worker_id, date = %self.date, "No decisions for date");
            return Ok(summary);
        };
        if first.info.size == 0 {
            return Err(CrawlError::Contract(format!(
                "search reported page size 0 for {} (total {})",
                self.date, first.info.total
            )));
        }
        let max_page = first.info.total.div_ceil(first.info.size);
        summary.total = first.info.total;
        info!(
            worker = %self.worker_id,
            total = first.info.total,
            page_size = first.info.size,
            max_page,
            "Search window sized"
        );

        let mut pending = Some(first);
        for page in 0..max_page {
            let results = match pending.take() {
                Some(results) => results,
                None => match self.search(&query.page(page)).await? {
                    Some(results) => results,
                    None => {
                        warn!(worker = %self.worker_id, page, "Search page unexpectedly empty, stopping");
                        break;
                    }
                },
            };
            info!(worker = %self.worker_id, "Crawling page {}/{}.", page, max_page);
            summary.pages += 1;

            for raw in results.decisions {
                summary.seen += 1;
                self.crawl_decision(raw, &mut summary).await?;
                if self.limit.is_some_and(|limit| summary.enqueued >= limit) {
                    summary.limit_reached = true;
                    warn!(
                        worker = %self.worker_id,
                        limit = summary.enqueued,
                        "Reached limit, stopping crawl."
                    );
                    return Ok(summary);
                }
            }
        }
        Ok(summary)
    }

    async fn crawl_decision(
        &self,
        raw: Value,
        summary: &mut CrawlSummary,
    ) -> Result<(), CrawlError> {
        let raw = match Decision::validate(&raw) {
            Ok(()) => raw,
            Err(reason) => {
                debug!(worker = %self.worker_id, %reason, record = %raw, "Got invalid decision");
                let Some(link) = Decision::self_link(&raw) else {
                    warn!(worker = %self.worker_id, %reason, "Invalid decision has no self-link, skipping");
                    summary.invalid += 1;
                    return Ok(());
                };
                summary.refetched += 1;
                let fetched = self
                    .retrying(link, || self.source.fetch_decision(link))
                    .await;
                match fetched {
                    Ok(value) => value,
                    Err(e @ CrawlError::Unauthorized(_)) => return Err(e),
                    Err(e) => {
                        warn!(worker = %self.worker_id, url = link, error = %e, "Self-link re-fetch failed, skipping");
                        summary.invalid += 1;
                        return Ok(());
                    }
                }
            }
        };

        match Decision::from_value(raw) {
            Ok(decision) => {
                self.queue.push(QueuedDecision::first(decision)).await?;
                summary.enqueued += 1;
            }
            Err(reason) => {
                warn!(worker = %self.worker_id, %reason, "Decision still invalid after re-fetch, skipping");
                summary.invalid += 1;
            }
        }
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Option<SearchPage>, CrawlError> {
        debug_assert_eq!(query.size, PAGE_SIZE);
        let what = format!("search page {}", query.page);
        self.retrying(&what, || self.source.search(query)).await
    }

    async fn retrying<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, CrawlError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && self.retry.allows_retry(attempt) => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(worker = %self.worker_id, what, attempt, ?delay, error = %e, "Transient failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(CrawlError::Exhausted {
                        what: what.to_string(),
                        attempts: attempt,
                        source: e,
                    })
                }
                Err(e @ FetchError::Unauthorized { .. }) => return Err(CrawlError::Unauthorized(e)),
                Err(e) => return Err(CrawlError::Fetch(e)),
            }
        }
    }
}
