//! One dispatch run: crawl → download → upload for a single date.
//!
//! The dispatcher constructs the shared queue, HTTP client and (optionally)
//! the uploader once, hands them to the workers by `Arc`, and waits for every
//! worker to finish. The first unrecoverable worker failure cancels the rest
//! and is returned to the caller.
//!
//! # Navigation
//! - Main entrypoint: [`Dispatcher::execute`]
//! - Test seam: [`Dispatcher::execute_with`] takes any [`DecisionSource`].

use std::sync::Arc;

use chrono::NaiveDate;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::api::DiavgeiaClient;
use crate::config::{ConfigError, SessionConfig};
use crate::contract::{DecisionSource, ObjectStore};
use crate::crawler::{CrawlError, CrawlSummary, Crawler};
use crate::download::{DownloadError, DownloadSummary, Downloader};
use crate::monitor::Monitor;
use crate::queue::WorkQueue;
use crate::retry::DeadLetterLog;
use crate::uploader::Uploader;

pub const DEAD_LETTER_FILE: &str = "dead_letter.jsonl";

/// Outcome of a dispatch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub date: NaiveDate,
    pub crawl: CrawlSummary,
    pub downloads: DownloadSummary,
    /// Terminate observations by downloaders; equals the worker count on a clean run.
    pub terminations: usize,
}

impl DispatchReport {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            crawl: CrawlSummary::default(),
            downloads: DownloadSummary::default(),
            terminations: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid session configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("building HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("crawler failed: {0}")]
    Crawl(#[from] CrawlError),
    #[error("downloader failed: {0}")]
    Download(#[from] DownloadError),
    #[error("worker task did not complete: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl DispatchError {
    /// Authentication rejections are the one run failure a retry will not fix.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            DispatchError::Crawl(CrawlError::Unauthorized(_))
                | DispatchError::Download(DownloadError::Unauthorized(_))
        )
    }
}

enum WorkerOutcome {
    Crawl(Result<CrawlSummary, CrawlError>),
    Download(Result<DownloadSummary, DownloadError>),
    Monitor,
}

pub struct Dispatcher {
    config: Arc<SessionConfig>,
}

impl Dispatcher {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Runs the pipeline against the live Diavgeia API.
    pub async fn execute(
        &self,
        store: Option<Arc<dyn ObjectStore>>,
    ) -> Result<DispatchReport, DispatchError> {
        self.config.validate()?;
        let client = DiavgeiaClient::from_config(&self.config)?;
        self.execute_with(Arc::new(client), store).await
    }

    pub async fn execute_with(
        &self,
        source: Arc<dyn DecisionSource>,
        store: Option<Arc<dyn ObjectStore>>,
    ) -> Result<DispatchReport, DispatchError> {
        let config = self.config.clone();
        info!(config = ?config, "Dispatcher started");
        info!(date = %config.date, "Fetching all decisions for: {}...", config.date);

        let queue = Arc::new(WorkQueue::new(config.queue_capacity));
        let cancel = CancellationToken::new();
        let monitor_stop = cancel.child_token();
        let dead_letters = Arc::new(DeadLetterLog::new(config.export_path.join(DEAD_LETTER_FILE)));
        let uploader = store.map(|store| Arc::new(Uploader::new(store, config.upload_prefix.clone())));
        if uploader.is_none() {
            info!("No object store configured, artifacts stay local");
        }
        if config.crawl_workers > 1 {
            warn!(
                configured = config.crawl_workers,
                "Only one crawler runs per date to keep page order, ignoring extra crawl workers"
            );
        }

        let day = config.date.format("%Y%m%d").to_string();
        let mut workers: JoinSet<WorkerOutcome> = JoinSet::new();

        let crawler = Crawler::new(format!("Crawler-{day}"), source.clone(), queue.clone(), config.date)
            .with_limit(config.limit)
            .with_retry(config.retry);
        workers.spawn(
            async move { WorkerOutcome::Crawl(crawler.crawl().await) }
                .instrument(info_span!("crawler", date = %config.date)),
        );

        for id in 0..config.download_workers {
            let downloader = Downloader::new(
                format!("Downloader-{day}-{id}"),
                source.clone(),
                queue.clone(),
                config.clone(),
                dead_letters.clone(),
            )
            .with_uploader(uploader.clone())
            .with_cancellation(cancel.clone());
            workers.spawn(
                async move { WorkerOutcome::Download(downloader.run().await) }
                    .instrument(info_span!("downloader", date = %config.date, id)),
            );
        }

        let monitor = Monitor::new(queue.clone(), config.monitor, monitor_stop.clone());
        workers.spawn(
            async move {
                monitor.run().await;
                WorkerOutcome::Monitor
            }
            .instrument(info_span!("monitor", date = %config.date)),
        );

        let mut report = DispatchReport::empty(config.date);
        let mut first_error: Option<DispatchError> = None;
        let mut pipeline_left = 1 + config.download_workers;

        while let Some(joined) = workers.join_next().await {
            let failure = match joined {
                Ok(WorkerOutcome::Crawl(Ok(summary))) => {
                    report.crawl = summary;
                    pipeline_left -= 1;
                    None
                }
                Ok(WorkerOutcome::Crawl(Err(e))) => {
                    pipeline_left -= 1;
                    Some(DispatchError::Crawl(e))
                }
                Ok(WorkerOutcome::Download(Ok(summary))) => {
                    report.downloads.merge(&summary);
                    pipeline_left -= 1;
                    None
                }
                Ok(WorkerOutcome::Download(Err(e))) => {
                    pipeline_left -= 1;
                    Some(DispatchError::Download(e))
                }
                Ok(WorkerOutcome::Monitor) => None,
                Err(e) => {
                    pipeline_left = pipeline_left.saturating_sub(1);
                    Some(DispatchError::Join(e))
                }
            };

            if let Some(e) = failure {
                if first_error.is_none() {
                    error!(error = %e, "Worker failed, cancelling run");
                    cancel.cancel();
                    queue.close();
                    first_error = Some(e);
                } else {
                    warn!(error = %e, "Additional worker failure after cancellation");
                }
            }
            if pipeline_left == 0 {
                monitor_stop.cancel();
            }
        }

        report.terminations = queue.terminations();
        match first_error {
            Some(e) => {
                error!(date = %config.date, error = %e, "Fetching failed.");
                Err(e)
            }
            None => {
                info!(
                    date = %config.date,
                    enqueued = report.crawl.enqueued,
                    processed = report.downloads.processed,
                    documents = report.downloads.documents_written,
                    dead_lettered = report.downloads.dead_lettered,
                    uploaded = report.downloads.uploaded,
                    unchanged = report.downloads.unchanged,
                    "Fetching finished successfully."
                );
                Ok(report)
            }
        }
    }
}

/// Runs one dispatch per day in `[from, to)`, in order, stopping at the first failure.
pub async fn dispatch_range<F>(
    template: &SessionConfig,
    from: NaiveDate,
    to: NaiveDate,
    mut store_for_run: F,
) -> Result<Vec<DispatchReport>, DispatchError>
where
    F: FnMut() -> Option<Arc<dyn ObjectStore>>,
{
    let dates = crate::config::date_range(from, to)?;
    let mut reports = Vec::with_capacity(dates.len());
    for date in dates {
        let dispatcher = Dispatcher::new(template.for_date(date));
        reports.push(dispatcher.execute(store_for_run()).await?);
    }
    Ok(reports)
}
