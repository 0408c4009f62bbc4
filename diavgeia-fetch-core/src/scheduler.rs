//! Daemon scheduler: fires one job per day at a fixed local time.
//!
//! Each firing targets the day before the trigger (in the schedule timezone)
//! and runs in its own task, so a failing or panicking run is logged and the
//! loop carries on to the next day. Shutdown is only observed while waiting
//! for the next firing; an in-flight run is never interrupted.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::DEFAULT_TIMEZONE;
use crate::contract::JobRunner;
use crate::dispatcher::DispatchReport;

pub const DEFAULT_SCHEDULE_TIME: &str = "03:00";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid schedule time {0:?}, expected HH:MM")]
    InvalidTime(String),
    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),
    #[error("no valid firing time for {time} in {timezone}")]
    NoFiringTime { time: NaiveTime, timezone: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduleSettings {
    pub time: NaiveTime,
    #[serde(serialize_with = "serialize_tz")]
    pub timezone: Tz,
}

impl ScheduleSettings {
    pub fn parse(time: &str, timezone: &str) -> Result<Self, ScheduleError> {
        let time = NaiveTime::parse_from_str(time, "%H:%M")
            .map_err(|_| ScheduleError::InvalidTime(time.to_string()))?;
        let timezone = timezone
            .parse::<Tz>()
            .map_err(|_| ScheduleError::UnknownTimezone(timezone.to_string()))?;
        Ok(Self { time, timezone })
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            time: NaiveTime::from_hms_opt(3, 0, 0).unwrap_or(NaiveTime::MIN),
            timezone: DEFAULT_TIMEZONE,
        }
    }
}

fn serialize_tz<S: serde::Serializer>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(tz.name())
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// First firing strictly after `now`. A time skipped by a DST jump fires an
/// hour later; a repeated time fires on its first occurrence.
pub fn next_fire_after(
    now: DateTime<Utc>,
    settings: &ScheduleSettings,
) -> Result<DateTime<Utc>, ScheduleError> {
    let tz = settings.timezone;
    let mut day = now.with_timezone(&tz).date_naive();
    for _ in 0..3 {
        let naive = day.and_time(settings.time);
        let local = tz
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| tz.from_local_datetime(&(naive + chrono::Duration::hours(1))).earliest());
        if let Some(candidate) = local.map(|t| t.with_timezone(&Utc)) {
            if candidate > now {
                return Ok(candidate);
            }
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    Err(ScheduleError::NoFiringTime {
        time: settings.time,
        timezone: tz.name().to_string(),
    })
}

/// The day a firing at `trigger` should fetch: yesterday, local to `tz`.
pub fn target_date(trigger: DateTime<Utc>, tz: Tz) -> NaiveDate {
    let local = trigger.with_timezone(&tz).date_naive();
    local.checked_sub_days(Days::new(1)).unwrap_or(local)
}

#[derive(Debug)]
pub enum JobOutcome {
    Succeeded { date: NaiveDate, report: DispatchReport },
    Failed { date: NaiveDate, error: String },
    Panicked { date: NaiveDate },
}

impl JobOutcome {
    pub fn date(&self) -> NaiveDate {
        match self {
            JobOutcome::Succeeded { date, .. }
            | JobOutcome::Failed { date, .. }
            | JobOutcome::Panicked { date } => *date,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded { .. })
    }
}

pub struct Scheduler {
    runner: Arc<dyn JobRunner>,
    settings: ScheduleSettings,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn JobRunner>, settings: ScheduleSettings) -> Self {
        Self {
            runner,
            settings,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &ScheduleSettings {
        &self.settings
    }

    /// Loops until `shutdown` is cancelled. Returns the number of firings.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<usize, ScheduleError> {
        info!(
            time = %self.settings.time.format("%H:%M"),
            timezone = %self.settings.timezone,
            "Scheduled daily job at {} {}",
            self.settings.time.format("%H:%M"),
            self.settings.timezone
        );
        let mut fired = 0;
        loop {
            let now = self.clock.now();
            let next = next_fire_after(now, &self.settings)?;
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!(next = %next.with_timezone(&self.settings.timezone), "Waiting for next firing");

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let outcome = self.fire(next).await;
            fired += 1;
            if !outcome.is_success() {
                warn!(date = %outcome.date(), "Daily job failed, continuing with the next scheduled run");
            }
        }
        info!(fired, "Daemon shutdown requested. Exiting gracefully.");
        Ok(fired)
    }

    /// Runs the job for `trigger` in its own task and reports how it ended.
    pub async fn fire(&self, trigger: DateTime<Utc>) -> JobOutcome {
        let date = target_date(trigger, self.settings.timezone);
        info!(%date, "Scheduler triggered daily job.");
        let runner = self.runner.clone();
        let handle = tokio::spawn(
            async move { runner.run(date).await }.instrument(info_span!("scheduled_run", %date)),
        );
        match handle.await {
            Ok(Ok(report)) => {
                info!(%date, processed = report.downloads.processed, "Scheduler finished daily job successfully.");
                JobOutcome::Succeeded { date, report }
            }
            Ok(Err(e)) => {
                error!(%date, error = %e, "Daily job failed");
                JobOutcome::Failed {
                    date,
                    error: e.to_string(),
                }
            }
            Err(e) if e.is_panic() => {
                error!(%date, "Daily job panicked");
                JobOutcome::Panicked { date }
            }
            Err(e) => {
                error!(%date, error = %e, "Daily job was aborted");
                JobOutcome::Failed {
                    date,
                    error: e.to_string(),
                }
            }
        }
    }
}

/// Cancels `shutdown` on SIGTERM or SIGINT instead of exiting the process.
#[cfg(unix)]
pub fn install_signal_handlers(
    shutdown: CancellationToken,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        };
        info!(signal = name, "Received {}. Requesting graceful shutdown...", name);
        shutdown.cancel();
    }))
}

#[cfg(not(unix))]
pub fn install_signal_handlers(
    shutdown: CancellationToken,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for ctrl-c");
                    return;
                }
            }
        }
        info!("Received ctrl-c. Requesting graceful shutdown...");
        shutdown.cancel();
    }))
}
