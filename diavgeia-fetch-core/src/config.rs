use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{debug, info};

use crate::monitor::MonitorSettings;
use crate::retry::RetryPolicy;

pub const DEFAULT_API_BASE: &str = "https://diavgeia.gov.gr/opendata";
pub const DEFAULT_UPLOAD_PREFIX: &str = "sink2";
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Europe::Athens;
pub const MAX_WORKERS: usize = 100;

/// Opaque credential pair for the Diavgeia API (sent as basic auth).
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub user: String,
    #[serde(skip)]
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything one dispatch run needs. Immutable for the duration of the run.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub date: NaiveDate,
    pub crawl_workers: usize,
    pub download_workers: usize,
    pub download_documents: bool,
    pub export_path: PathBuf,
    pub upload_prefix: String,
    /// Stop crawling after this many valid decisions.
    pub limit: Option<usize>,
    pub api_base: String,
    pub credentials: Credentials,
    /// Zone used to turn submission timestamps into export dates.
    #[serde(serialize_with = "serialize_tz")]
    pub timezone: Tz,
    pub retry: RetryPolicy,
    pub monitor: MonitorSettings,
    /// Bound on decisions waiting in the queue; `None` is unbounded.
    pub queue_capacity: Option<usize>,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one download worker is required")]
    NoDownloadWorkers,
    #[error("at least one crawl worker is required")]
    NoCrawlWorkers,
    #[error("{kind} workers must be at most {max}, got {requested}")]
    TooManyWorkers {
        kind: &'static str,
        requested: usize,
        max: usize,
    },
    #[error("export path must not be empty")]
    EmptyExportPath,
    #[error("API credentials are missing")]
    MissingCredentials,
    #[error("limit must be greater than zero")]
    ZeroLimit,
    #[error("date range is empty: {from} is not before {to}")]
    EmptyRange { from: NaiveDate, to: NaiveDate },
}

impl SessionConfig {
    pub fn new(date: NaiveDate, export_path: impl Into<PathBuf>, credentials: Credentials) -> Self {
        Self {
            date,
            crawl_workers: 1,
            download_workers: 4,
            download_documents: true,
            export_path: export_path.into(),
            upload_prefix: DEFAULT_UPLOAD_PREFIX.to_string(),
            limit: None,
            api_base: DEFAULT_API_BASE.to_string(),
            credentials,
            timezone: DEFAULT_TIMEZONE,
            retry: RetryPolicy::default(),
            monitor: MonitorSettings::default(),
            queue_capacity: None,
            request_timeout: Duration::from_secs(60),
        }
    }

    /// Same settings, different day.
    pub fn for_date(&self, date: NaiveDate) -> Self {
        Self {
            date,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.download_workers == 0 {
            return Err(ConfigError::NoDownloadWorkers);
        }
        if self.crawl_workers == 0 {
            return Err(ConfigError::NoCrawlWorkers);
        }
        for (kind, requested) in [("download", self.download_workers), ("crawl", self.crawl_workers)] {
            if requested > MAX_WORKERS {
                return Err(ConfigError::TooManyWorkers {
                    kind,
                    requested,
                    max: MAX_WORKERS,
                });
            }
        }
        if self.export_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyExportPath);
        }
        if self.credentials.user.is_empty() || self.credentials.password.is_empty() {
            return Err(ConfigError::MissingCredentials);
        }
        if self.limit == Some(0) {
            return Err(ConfigError::ZeroLimit);
        }
        Ok(())
    }

    pub fn trace_loaded(&self) {
        info!(
            date = %self.date,
            crawl_workers = self.crawl_workers,
            download_workers = self.download_workers,
            download_documents = self.download_documents,
            export_path = %self.export_path.display(),
            upload_prefix = %self.upload_prefix,
            limit = ?self.limit,
            timezone = %self.timezone,
            "Loaded session config"
        );
        debug!(?self, "Session config loaded (full debug)");
    }
}

/// Days in `[from, to)`, oldest first.
pub fn date_range(from: NaiveDate, to: NaiveDate) -> Result<Vec<NaiveDate>, ConfigError> {
    if from >= to {
        return Err(ConfigError::EmptyRange { from, to });
    }
    Ok(from.iter_days().take_while(|day| *day < to).collect())
}

fn serialize_tz<S: serde::Serializer>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(tz.name())
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig::new(
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            "/tmp/exports",
            Credentials::new("user", "secret"),
        )
    }

    #[test]
    fn defaults_are_valid() {
        assert_eq!(config().validate(), Ok(()));
    }

    #[test]
    fn rejects_zero_workers_and_zero_limit() {
        let mut cfg = config();
        cfg.download_workers = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::NoDownloadWorkers));

        let mut cfg = config();
        cfg.limit = Some(0);
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroLimit));
    }

    #[test]
    fn worker_counts_are_capped() {
        let mut cfg = config();
        cfg.download_workers = MAX_WORKERS;
        assert_eq!(cfg.validate(), Ok(()));

        cfg.download_workers = 100_000;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::TooManyWorkers {
                kind: "download",
                requested: 100_000,
                max: MAX_WORKERS,
            })
        );

        let mut cfg = config();
        cfg.crawl_workers = MAX_WORKERS + 1;
        assert!(matches!(cfg.validate(), Err(ConfigError::TooManyWorkers { kind: "crawl", .. })));
    }

    #[test]
    fn debug_output_hides_password() {
        let rendered = format!("{:?}", config());
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn date_range_is_half_open() {
        let from = NaiveDate::from_ymd_opt(2024, 2, 28).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        let days: Vec<String> = date_range(from, to).unwrap().iter().map(|d| d.to_string()).collect();
        assert_eq!(days, ["2024-02-28", "2024-02-29", "2024-03-01"]);
        assert_eq!(date_range(to, from), Err(ConfigError::EmptyRange { from: to, to: from }));
        assert!(date_range(from, from).is_err());
    }

    #[test]
    fn for_date_keeps_everything_else() {
        let cfg = config();
        let next = cfg.for_date(NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
        assert_eq!(next.date.to_string(), "2024-03-02");
        assert_eq!(next.download_workers, cfg.download_workers);
        assert_eq!(next.export_path, cfg.export_path);
    }
}
