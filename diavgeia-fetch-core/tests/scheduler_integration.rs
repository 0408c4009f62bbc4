use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tokio_util::sync::CancellationToken;

use diavgeia_fetch_core::contract::MockJobRunner;
use diavgeia_fetch_core::dispatcher::DispatchReport;
use diavgeia_fetch_core::scheduler::{Clock, JobOutcome, ScheduleSettings, Scheduler};

/// Wall clock that follows tokio's (paused) time.
struct PausedClock {
    base: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl PausedClock {
    fn starting_at(rfc3339: &str) -> Self {
        Self {
            base: DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc),
            start: tokio::time::Instant::now(),
        }
    }
}

impl Clock for PausedClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now() - self.start;
        self.base + chrono::Duration::from_std(elapsed).unwrap()
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_failed_run_does_not_stop_next_firing() {
    let shutdown = CancellationToken::new();
    let mut runner = MockJobRunner::new();
    runner
        .expect_run()
        .withf(|d: &NaiveDate| *d == date(2024, 1, 9))
        .times(1)
        .returning(|_| Err("search API unavailable".into()));
    let stop = shutdown.clone();
    runner
        .expect_run()
        .withf(|d: &NaiveDate| *d == date(2024, 1, 10))
        .times(1)
        .returning(move |d| {
            stop.cancel();
            Ok(DispatchReport::empty(d))
        });

    let settings = ScheduleSettings::parse("03:00", "Europe/Athens").unwrap();
    let scheduler = Scheduler::new(Arc::new(runner), settings)
        .with_clock(Arc::new(PausedClock::starting_at("2024-01-10T00:30:00Z")));

    let fired = scheduler.run(shutdown).await.unwrap();
    assert_eq!(fired, 2);
}

#[tokio::test]
async fn test_panicking_run_is_isolated() {
    let mut runner = MockJobRunner::new();
    runner.expect_run().times(1).returning(|_| panic!("worker bug"));

    let scheduler = Scheduler::new(Arc::new(runner), ScheduleSettings::default());
    let trigger = DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z").unwrap().with_timezone(&Utc);
    let outcome = scheduler.fire(trigger).await;

    assert!(matches!(outcome, JobOutcome::Panicked { .. }));
    // 03:00 Athens on June 1st; the target is May 31st.
    assert_eq!(outcome.date(), date(2024, 5, 31));
}

#[tokio::test]
async fn test_cancelled_before_first_firing_runs_nothing() {
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let mut runner = MockJobRunner::new();
    runner.expect_run().never();

    let scheduler = Scheduler::new(Arc::new(runner), ScheduleSettings::default());
    assert_eq!(scheduler.run(shutdown).await.unwrap(), 0);
}
