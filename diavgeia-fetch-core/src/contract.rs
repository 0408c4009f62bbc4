//! # contract: seams between the pipeline and the outside world
//!
//! The pipeline talks to three collaborators it does not own:
//! - [`DecisionSource`]: the Diavgeia open-data API (search pages, self-links, documents).
//! - [`ObjectStore`]: versioned remote object storage used for mirroring.
//! - [`JobRunner`]: whatever the daemon runs on each scheduled tick.
//!
//! All three are async traits annotated for `mockall`, so tests can drive the
//! crawler, downloaders and scheduler deterministically.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDate;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use serde::Deserialize;
use serde_json::Value;

use crate::dispatcher::DispatchReport;

/// Page size used for every search request.
pub const PAGE_SIZE: u32 = 500;

/// Query parameters of one search request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub size: u32,
    pub page: u64,
}

impl SearchQuery {
    /// Page 0 of the window `[date, date + 1 day)`.
    pub fn for_day(date: NaiveDate) -> Self {
        Self {
            from_date: date,
            to_date: date.succ_opt().unwrap_or(date),
            size: PAGE_SIZE,
            page: 0,
        }
    }

    pub fn page(&self, page: u64) -> Self {
        Self {
            page,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchInfo {
    pub total: u64,
    pub size: u64,
}

/// One page of search results. Decisions stay raw until validated.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchPage {
    pub info: SearchInfo,
    #[serde(default)]
    pub decisions: Vec<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Connection reset, disconnect, truncated body or timeout. Worth retrying.
    #[error("transient failure fetching {url}: {reason}")]
    Transient { url: String, reason: String },
    #[error("authentication rejected by {url} (HTTP {status})")]
    Unauthorized { url: String, status: u16 },
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("unexpected response from {url}: {reason}")]
    Contract { url: String, reason: String },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

/// Read side of the Diavgeia API.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait DecisionSource: Send + Sync {
    /// Fetch one search page. `Ok(None)` means the API has no content for the window.
    async fn search(&self, query: &SearchQuery) -> Result<Option<SearchPage>, FetchError>;

    /// Re-fetch a single decision through its self-link.
    async fn fetch_decision(&self, url: &str) -> Result<Value, FetchError>;

    /// Download the document attached to a decision.
    async fn fetch_document(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// A version of an object already present in the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredVersion {
    pub id: String,
    pub key: String,
    /// Hex SHA-256 of the content, when the store recorded one.
    pub checksum: Option<String>,
}

/// A local file to be stored as a new version of `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewObject {
    pub key: String,
    pub path: PathBuf,
    pub checksum: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object store rejected credentials: {0}")]
    Unauthorized(String),
    #[error("object store request failed: {0}")]
    Request(String),
    #[error("reading local artifact failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Versioned remote object storage.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// All stored versions whose key is exactly `key`.
    async fn list_versions(&self, key: &str) -> Result<Vec<StoredVersion>, StoreError>;

    /// Store `object` as a new version.
    async fn upload(&self, object: NewObject) -> Result<StoredVersion, StoreError>;
}

/// Error type for scheduled jobs (simple boxed error, like any dispatch failure).
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// One unit of scheduled work: a full dispatch run for `date`.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, date: NaiveDate) -> Result<DispatchReport, JobError>;
}
