//! Downloader workers: pop decisions from the shared queue and persist them as
//! export artifacts under `<export_root>/<date>/<ada>/`.
//!
//! Every decision gets a gzipped metadata file; the attached document is
//! fetched and gzipped next to it when downloads are enabled and the record
//! has a document URL. Transient network failures put the decision back on
//! the queue (with backoff) until the retry policy gives up, at which point
//! it goes to the dead-letter log.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::contract::{DecisionSource, FetchError};
use crate::decision::Decision;
use crate::fsutil::{gzip, save_file};
use crate::queue::{QueueItem, QueuedDecision, WorkQueue};
use crate::retry::DeadLetterLog;
use crate::uploader::{UploadOutcome, Uploader};

pub const METADATA_SUFFIX: &str = "json.gz";
pub const DOCUMENT_SUFFIX: &str = "pdf.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Metadata,
    Document,
}

/// One file written for a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportArtifact {
    pub date: NaiveDate,
    pub ada: String,
    pub kind: ArtifactKind,
    pub path: PathBuf,
}

impl ExportArtifact {
    pub fn new(export_root: &Path, date: NaiveDate, ada: &str, kind: ArtifactKind) -> Self {
        let suffix = match kind {
            ArtifactKind::Metadata => METADATA_SUFFIX,
            ArtifactKind::Document => DOCUMENT_SUFFIX,
        };
        Self {
            date,
            ada: ada.to_string(),
            kind,
            path: artifact_dir(export_root, date, ada).join(format!("{ada}.{suffix}")),
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// `<export_root>/<YYYY-MM-DD>/<ada>`
pub fn artifact_dir(export_root: &Path, date: NaiveDate, ada: &str) -> PathBuf {
    export_root.join(date.format("%Y-%m-%d").to_string()).join(ada)
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialising metadata for {ada}: {source}")]
    Serialise {
        ada: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("authentication rejected: {0}")]
    Unauthorized(#[source] FetchError),
}

/// Per-worker counters, summed by the dispatcher.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub processed: usize,
    pub metadata_written: usize,
    pub documents_written: usize,
    pub documents_skipped: usize,
    pub document_failures: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub uploaded: usize,
    pub unchanged: usize,
    pub upload_failures: usize,
}

impl DownloadSummary {
    pub fn merge(&mut self, other: &DownloadSummary) {
        self.processed += other.processed;
        self.metadata_written += other.metadata_written;
        self.documents_written += other.documents_written;
        self.documents_skipped += other.documents_skipped;
        self.document_failures += other.document_failures;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.uploaded += other.uploaded;
        self.unchanged += other.unchanged;
        self.upload_failures += other.upload_failures;
    }
}

enum PersistError {
    Transient(FetchError),
    Fatal(DownloadError),
}

pub struct Downloader {
    worker_id: String,
    source: Arc<dyn DecisionSource>,
    queue: Arc<WorkQueue>,
    config: Arc<SessionConfig>,
    uploader: Option<Arc<Uploader>>,
    dead_letters: Arc<DeadLetterLog>,
    cancel: CancellationToken,
}

impl Downloader {
    pub fn new(
        worker_id: impl Into<String>,
        source: Arc<dyn DecisionSource>,
        queue: Arc<WorkQueue>,
        config: Arc<SessionConfig>,
        dead_letters: Arc<DeadLetterLog>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            source,
            queue,
            config,
            uploader: None,
            dead_letters,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_uploader(mut self, uploader: Option<Arc<Uploader>>) -> Self {
        self.uploader = uploader;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Pop loop. Returns when the terminate signal is observed or the run is cancelled.
    pub async fn run(&self) -> Result<DownloadSummary, DownloadError> {
        let mut summary = DownloadSummary::default();
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!(worker = %self.worker_id, "Run cancelled, stopping downloader");
                    break;
                }
                item = self.queue.pop() => item,
            };
            match item {
                QueueItem::Terminate => break,
                QueueItem::Decision(queued) => self.handle(queued, &mut summary).await?,
            }
        }
        info!(
            worker = %self.worker_id,
            processed = summary.processed,
            documents = summary.documents_written,
            retried = summary.retried,
            "Shutting down downloader."
        );
        Ok(summary)
    }

    async fn handle(
        &self,
        queued: QueuedDecision,
        summary: &mut DownloadSummary,
    ) -> Result<(), DownloadError> {
        let ada = queued.decision.ada().to_string();
        debug!(worker = %self.worker_id, ada = %ada, attempt = queued.attempt, "Downloading");
        match self.persist(&queued.decision, summary).await {
            Ok(artifacts) => {
                summary.processed += 1;
                summary.metadata_written += 1;
                debug!(worker = %self.worker_id, ada = %ada, "Downloaded");
                self.upload(&artifacts, summary).await;
                Ok(())
            }
            Err(PersistError::Transient(e)) => {
                let policy = &self.config.retry;
                if policy.allows_retry(queued.attempt) {
                    let delay = policy.delay_after(queued.attempt);
                    warn!(
                        worker = %self.worker_id,
                        ada = %ada,
                        attempt = queued.attempt,
                        ?delay,
                        error = %e,
                        "Transient failure, putting decision back on the queue"
                    );
                    tokio::time::sleep(delay).await;
                    self.queue.requeue(queued.next_attempt());
                    summary.retried += 1;
                } else {
                    self.dead_letters
                        .record(&queued.decision, queued.attempt, &e.to_string())
                        .await;
                    summary.dead_lettered += 1;
                }
                Ok(())
            }
            Err(PersistError::Fatal(e)) => {
                error!(worker = %self.worker_id, ada = %ada, error = %e, "Downloader failed");
                Err(e)
            }
        }
    }

    async fn persist(
        &self,
        decision: &Decision,
        summary: &mut DownloadSummary,
    ) -> Result<Vec<ExportArtifact>, PersistError> {
        let ada = decision.ada();
        let date = decision
            .submission_date(self.config.timezone)
            .unwrap_or(self.config.date);
        let mtime = decision
            .submission_secs()
            .and_then(|secs| u32::try_from(secs).ok())
            .unwrap_or(0);
        let mut artifacts = Vec::with_capacity(2);

        let metadata = ExportArtifact::new(&self.config.export_path, date, ada, ArtifactKind::Metadata);
        let json = decision
            .metadata_json()
            .map_err(|source| PersistError::Fatal(DownloadError::Serialise {
                ada: ada.to_string(),
                source,
            }))?;
        write_gzipped(&json, mtime, &metadata.path).await?;
        artifacts.push(metadata);

        if !self.config.download_documents {
            debug!(worker = %self.worker_id, ada, "Skipping document download.");
            return Ok(artifacts);
        }
        let url = decision.document_url();
        if url.is_empty() {
            warn!(worker = %self.worker_id, ada, "No document for ada {:?}.", ada);
            summary.documents_skipped += 1;
            return Ok(artifacts);
        }

        let bytes = match self.source.fetch_document(url).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_transient() => return Err(PersistError::Transient(e)),
            Err(e @ FetchError::Unauthorized { .. }) => {
                return Err(PersistError::Fatal(DownloadError::Unauthorized(e)))
            }
            Err(e) => {
                error!(worker = %self.worker_id, ada, url, error = %e, "Document download failed, keeping metadata only");
                summary.document_failures += 1;
                return Ok(artifacts);
            }
        };
        let document = ExportArtifact::new(&self.config.export_path, date, ada, ArtifactKind::Document);
        write_gzipped(&bytes, mtime, &document.path).await?;
        summary.documents_written += 1;
        artifacts.push(document);
        Ok(artifacts)
    }

    async fn upload(&self, artifacts: &[ExportArtifact], summary: &mut DownloadSummary) {
        let Some(uploader) = &self.uploader else {
            return;
        };
        for artifact in artifacts {
            match uploader.upload_artifact(artifact).await {
                Ok(UploadOutcome::Uploaded { .. }) => summary.uploaded += 1,
                Ok(UploadOutcome::Unchanged { .. }) => summary.unchanged += 1,
                Err(e) => {
                    error!(
                        worker = %self.worker_id,
                        path = %artifact.path.display(),
                        error = %e,
                        "Upload failed"
                    );
                    summary.upload_failures += 1;
                }
            }
        }
    }
}

async fn write_gzipped(bytes: &[u8], mtime: u32, path: &Path) -> Result<(), PersistError> {
    let io = |source| {
        PersistError::Fatal(DownloadError::Io {
            path: path.to_path_buf(),
            source,
        })
    };
    let compressed = gzip(bytes, mtime).map_err(io)?;
    save_file(&compressed, path).await.map_err(io)
}
