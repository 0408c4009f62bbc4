use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use tracing::info;

use diavgeia_fetch_core::config::SessionConfig;
use diavgeia_fetch_core::contract::{JobError, JobRunner};
use diavgeia_fetch_core::dispatcher::{DispatchReport, Dispatcher};
use diavgeia_fetch_core::scheduler::{install_signal_handlers, Scheduler};

use crate::load_config::AppConfig;
use crate::upload::{connect_store, B2Credentials};

/// One scheduled harvest: the configured session, moved to the target date.
pub struct DailyFetch {
    template: SessionConfig,
    b2: Option<B2Credentials>,
}

impl DailyFetch {
    pub fn new(template: SessionConfig, b2: Option<B2Credentials>) -> Self {
        Self { template, b2 }
    }
}

#[async_trait]
impl JobRunner for DailyFetch {
    async fn run(&self, date: NaiveDate) -> Result<DispatchReport, JobError> {
        // Fresh B2 authorisation per run; tokens expire within a day.
        let store = connect_store(self.b2.as_ref()).await?;
        let report = Dispatcher::new(self.template.for_date(date))
            .execute(store)
            .await?;
        Ok(report)
    }
}

pub async fn run_daemon(config: AppConfig) -> Result<()> {
    info!("Starting daemon mode scheduler...");
    let shutdown = CancellationToken::new();
    install_signal_handlers(shutdown.clone()).context("installing signal handlers")?;

    let runner = Arc::new(DailyFetch::new(config.session, config.b2));
    let fired = Scheduler::new(runner, config.schedule)
        .run(shutdown)
        .await?;
    info!(fired, "Daemon stopped");
    Ok(())
}
