//! Command-line surface of diavgeia-fetch.
//!
//! Two subcommands:
//! - `fetch`: harvest one date (`--date`) or every date in `[--from-date, --to-date)`, then exit.
//! - `daemon`: stay up and harvest the previous day at the scheduled local time.
//!
//! Pipeline logic lives in `diavgeia-fetch-core`; this module only resolves
//! configuration, initialises logging and wires the B2 store in.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};

use diavgeia_fetch_core::dispatcher::{dispatch_range, Dispatcher};

use crate::daemon::run_daemon;
use crate::load_config::{load_config, AppConfig, FileConfig};
use crate::logging::init_logging;
use crate::upload::connect_store;

/// Harvest Diavgeia transparency decisions and mirror them to Backblaze B2.
#[derive(Parser, Debug)]
#[clap(
    name = "diavgeia-fetch",
    version,
    about = "Harvest Diavgeia transparency decisions and mirror them to Backblaze B2"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch all decisions submitted on one date, or on each date of a range
    Fetch {
        /// Date to fetch. Format: YYYY-MM-DD
        #[clap(
            long,
            value_name = "YYYY-MM-DD",
            conflicts_with_all = ["from_date", "to_date"],
            required_unless_present = "from_date"
        )]
        date: Option<NaiveDate>,
        /// First date of a range (inclusive)
        #[clap(long, value_name = "YYYY-MM-DD", requires = "to_date")]
        from_date: Option<NaiveDate>,
        /// End of a range (exclusive)
        #[clap(long, value_name = "YYYY-MM-DD", requires = "from_date")]
        to_date: Option<NaiveDate>,
        #[clap(flatten)]
        settings: SettingsArgs,
    },
    /// Run until SIGTERM/SIGINT, fetching the previous day once a day
    Daemon {
        #[clap(flatten)]
        settings: SettingsArgs,
    },
}

/// Overrides shared by every subcommand. Anything unset falls back to the
/// environment, then the YAML file, then defaults.
#[derive(Args, Debug, Default, Clone)]
pub struct SettingsArgs {
    /// Optional YAML config file
    #[clap(long)]
    pub config: Option<PathBuf>,
    #[clap(long)]
    pub export_path: Option<PathBuf>,
    #[clap(long)]
    pub log_path: Option<PathBuf>,
    /// DEBUG, INFO, WARNING, ERROR or CRITICAL
    #[clap(long)]
    pub log_level: Option<String>,
    #[clap(long)]
    pub crawl_workers: Option<usize>,
    #[clap(long)]
    pub download_workers: Option<usize>,
    /// Download the documents attached to decisions
    #[clap(long)]
    pub download_pdf: Option<bool>,
    #[clap(long)]
    pub upload_prefix: Option<String>,
    /// Stop after this many valid decisions
    #[clap(long)]
    pub limit: Option<usize>,
    #[clap(long)]
    pub api_base: Option<String>,
    /// Attempts per request before giving up on a transient failure
    #[clap(long)]
    pub max_attempts: Option<u32>,
    /// Daily firing time for the daemon, HH:MM
    #[clap(long)]
    pub schedule_time: Option<String>,
    #[clap(long)]
    pub schedule_timezone: Option<String>,
}

impl SettingsArgs {
    fn overrides(&self) -> FileConfig {
        FileConfig {
            crawl_workers: self.crawl_workers,
            download_workers: self.download_workers,
            download_pdf: self.download_pdf,
            export_path: self.export_path.clone(),
            log_path: self.log_path.clone(),
            log_level: self.log_level.clone(),
            upload_prefix: self.upload_prefix.clone(),
            limit: self.limit,
            api_base: self.api_base.clone(),
            max_attempts: self.max_attempts,
            schedule_time: self.schedule_time.clone(),
            schedule_timezone: self.schedule_timezone.clone(),
            ..FileConfig::default()
        }
    }

    fn load(&self, date: NaiveDate) -> Result<AppConfig> {
        let config = load_config(self.config.as_deref(), self.overrides(), date)?;
        if let Some(file) = init_logging(&config.logging)? {
            tracing::info!(log_file = %file.display(), "Logging to file");
        }
        config.trace_loaded();
        Ok(config)
    }
}

/// Async entrypoint shared by `main` and the integration tests.
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Fetch {
            date,
            from_date,
            to_date,
            settings,
        } => match (date, from_date, to_date) {
            (Some(date), None, None) => {
                let config = settings.load(date)?;
                let store = connect_store(config.b2.as_ref())
                    .await
                    .context("connecting to B2")?;
                let report = Dispatcher::new(config.session)
                    .execute(store)
                    .await
                    .with_context(|| format!("fetching {date}"))?;
                tracing::info!(command = "fetch", ?report, "Fetch complete");
                Ok(())
            }
            (None, Some(from), Some(to)) => {
                let config = settings.load(from)?;
                let store = connect_store(config.b2.as_ref())
                    .await
                    .context("connecting to B2")?;
                let reports = dispatch_range(&config.session, from, to, || store.clone())
                    .await
                    .with_context(|| format!("fetching {from}..{to}"))?;
                tracing::info!(command = "fetch", days = reports.len(), "Range fetch complete");
                Ok(())
            }
            _ => bail!("pass either --date or both --from-date and --to-date"),
        },
        Commands::Daemon { settings } => {
            let config = settings.load(chrono::Local::now().date_naive())?;
            run_daemon(config).await
        }
    }
}
