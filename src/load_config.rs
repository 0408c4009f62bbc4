//! Builds the run configuration from, in increasing precedence: built-in
//! defaults, an optional YAML file, environment variables (and `.env`), and
//! command-line flags. Secrets only ever come from the environment.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::info;

use diavgeia_fetch_core::config::{Credentials, SessionConfig};
use diavgeia_fetch_core::scheduler::{ScheduleSettings, DEFAULT_SCHEDULE_TIME};

use crate::logging::LogSettings;
use crate::upload::B2Credentials;

pub const DEFAULT_EXPORT_PATH: &str = "./exports";

/// Non-secret settings; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub crawl_workers: Option<usize>,
    pub download_workers: Option<usize>,
    pub download_pdf: Option<bool>,
    pub export_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub upload_prefix: Option<String>,
    pub limit: Option<usize>,
    pub api_base: Option<String>,
    pub timezone: Option<String>,
    pub queue_capacity: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub schedule_time: Option<String>,
    pub schedule_timezone: Option<String>,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config YAML {}", path.display()))
    }

    /// Same keys, upper-cased, read from the environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            crawl_workers: env_parsed("CRAWL_WORKERS")?,
            download_workers: env_parsed("DOWNLOAD_WORKERS")?,
            download_pdf: env_parsed("DOWNLOAD_PDF")?,
            export_path: env_var("EXPORT_PATH").map(PathBuf::from),
            log_path: env_var("LOG_PATH").map(PathBuf::from),
            log_level: env_var("LOG_LEVEL"),
            upload_prefix: env_var("UPLOAD_PREFIX"),
            limit: env_parsed("LIMIT")?,
            api_base: env_var("DIAVGEIA_API_BASE"),
            timezone: env_var("TIMEZONE"),
            queue_capacity: env_parsed("QUEUE_CAPACITY")?,
            request_timeout_secs: env_parsed("REQUEST_TIMEOUT_SECS")?,
            max_attempts: env_parsed("MAX_ATTEMPTS")?,
            schedule_time: env_var("SCHEDULE_TIME"),
            schedule_timezone: env_var("SCHEDULE_TIMEZONE"),
        })
    }

    /// Fields set in `other` win.
    pub fn overlay(self, other: FileConfig) -> FileConfig {
        FileConfig {
            crawl_workers: other.crawl_workers.or(self.crawl_workers),
            download_workers: other.download_workers.or(self.download_workers),
            download_pdf: other.download_pdf.or(self.download_pdf),
            export_path: other.export_path.or(self.export_path),
            log_path: other.log_path.or(self.log_path),
            log_level: other.log_level.or(self.log_level),
            upload_prefix: other.upload_prefix.or(self.upload_prefix),
            limit: other.limit.or(self.limit),
            api_base: other.api_base.or(self.api_base),
            timezone: other.timezone.or(self.timezone),
            queue_capacity: other.queue_capacity.or(self.queue_capacity),
            request_timeout_secs: other.request_timeout_secs.or(self.request_timeout_secs),
            max_attempts: other.max_attempts.or(self.max_attempts),
            schedule_time: other.schedule_time.or(self.schedule_time),
            schedule_timezone: other.schedule_timezone.or(self.schedule_timezone),
        }
    }
}

/// Everything the binary needs after startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub schedule: ScheduleSettings,
    pub logging: LogSettings,
    /// Mirroring is enabled only when this is present.
    pub b2: Option<B2Credentials>,
}

impl AppConfig {
    pub fn trace_loaded(&self) {
        self.session.trace_loaded();
        info!(
            schedule_time = %self.schedule.time.format("%H:%M"),
            schedule_timezone = %self.schedule.timezone,
            log_level = %self.logging.level,
            log_path = ?self.logging.path,
            upload_enabled = self.b2.is_some(),
            bucket = ?self.b2.as_ref().map(|b2| &b2.bucket_name),
            "Loaded application config"
        );
    }
}

/// Loads config for `date`. `flags` carries command-line overrides.
pub fn load_config(config_file: Option<&Path>, flags: FileConfig, date: NaiveDate) -> Result<AppConfig> {
    let file = match config_file {
        Some(path) => FileConfig::from_path(path)?,
        None => FileConfig::default(),
    };
    let merged = file.overlay(FileConfig::from_env()?).overlay(flags);

    let credentials = Credentials::new(
        required_env("DIAVGEIA_API_USER")?,
        required_env("DIAVGEIA_API_PASSWORD")?,
    );

    let mut session = SessionConfig::new(
        date,
        merged
            .export_path
            .unwrap_or_else(|| PathBuf::from(DEFAULT_EXPORT_PATH)),
        credentials,
    );
    if let Some(n) = merged.crawl_workers {
        session.crawl_workers = n;
    }
    if let Some(n) = merged.download_workers {
        session.download_workers = n;
    }
    if let Some(enabled) = merged.download_pdf {
        session.download_documents = enabled;
    }
    if let Some(prefix) = merged.upload_prefix {
        session.upload_prefix = prefix;
    }
    if let Some(api_base) = merged.api_base {
        session.api_base = api_base;
    }
    if let Some(tz) = merged.timezone {
        session.timezone = tz
            .parse()
            .map_err(|_| anyhow::anyhow!("unknown timezone {tz:?}"))?;
    }
    if let Some(secs) = merged.request_timeout_secs {
        session.request_timeout = Duration::from_secs(secs);
    }
    if let Some(attempts) = merged.max_attempts {
        session.retry.max_attempts = attempts;
    }
    session.limit = merged.limit;
    session.queue_capacity = merged.queue_capacity;
    session.validate().context("invalid session configuration")?;

    let schedule = ScheduleSettings::parse(
        merged.schedule_time.as_deref().unwrap_or(DEFAULT_SCHEDULE_TIME),
        merged
            .schedule_timezone
            .as_deref()
            .unwrap_or(session.timezone.name()),
    )?;

    let logging = LogSettings {
        level: merged
            .log_level
            .unwrap_or_else(|| crate::logging::DEFAULT_LOG_LEVEL.to_string()),
        path: merged.log_path,
    };
    crate::logging::parse_level(&logging.level)?;

    Ok(AppConfig {
        session,
        schedule,
        logging,
        b2: b2_from_env()?,
    })
}

/// All of `B2_KEY_ID`, `B2_KEY` and `BUCKET_NAME`, or none of them.
fn b2_from_env() -> Result<Option<B2Credentials>> {
    let key_id = env_var("B2_KEY_ID");
    let key = env_var("B2_KEY");
    let bucket = env_var("BUCKET_NAME");
    match (key_id, key, bucket) {
        (None, None, None) => Ok(None),
        (Some(key_id), Some(application_key), Some(bucket_name)) => Ok(Some(B2Credentials {
            key_id,
            application_key,
            bucket_name,
        })),
        _ => bail!("B2_KEY_ID, B2_KEY and BUCKET_NAME must be set together to enable uploads"),
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn required_env(key: &str) -> Result<String> {
    env_var(key).with_context(|| format!("{key} environment variable not set"))
}

fn env_parsed<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env_var(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{key} has invalid value {raw:?}: {e}"))
        })
        .transpose()
}
