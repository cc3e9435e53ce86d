//! Daily sweep that finalizes reservations left uncommitted when their day ends,
//! plus the background WAL compactor.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{error, info, warn};

use crate::engine::{Engine, EngineError, FinalizeReport};

/// Source of "now" for the scheduler. The scheduler's clock is the only
/// authority on which day has elapsed.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and replays.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Fixed local wall-clock time at which yesterday is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeSchedule {
    pub at: NaiveTime,
    pub tz: Tz,
}

impl Default for FinalizeSchedule {
    fn default() -> Self {
        Self {
            at: NaiveTime::from_hms_opt(0, 5, 0).unwrap_or(NaiveTime::MIN),
            tz: chrono_tz::Asia::Kolkata,
        }
    }
}

impl FinalizeSchedule {
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    /// The most recent fully elapsed local day.
    pub fn sweep_date(&self, now: DateTime<Utc>) -> Option<NaiveDate> {
        self.local_date(now).pred_opt()
    }

    /// First instant strictly after `now` at which the local clock reads `at`.
    /// Days where `at` does not exist locally (DST gap) are skipped.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut date = self.local_date(now);
        for _ in 0..=2 {
            if let Some(candidate) = self.tz.from_local_datetime(&date.and_time(self.at)).earliest() {
                let candidate = candidate.with_timezone(&Utc);
                if candidate > now {
                    return candidate;
                }
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        now + chrono::Duration::days(1)
    }
}

/// How soon a sweep that left a day unfinished is retried.
pub const SWEEP_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// Finalize every elapsed day not yet swept, up to yesterday according to `clock`.
pub async fn sweep(
    engine: &Engine,
    schedule: &FinalizeSchedule,
    clock: &dyn Clock,
) -> Result<Vec<FinalizeReport>, EngineError> {
    let now = clock.now();
    let today = schedule.local_date(now);
    let Some(date) = schedule.sweep_date(now) else {
        return Err(EngineError::DayNotElapsed(today));
    };
    let result = engine.finalize_through(date, today).await;
    let status = match &result {
        Ok(reports) if reports.iter().all(|r| r.failed.is_empty()) => "ok",
        Ok(_) => "partial",
        Err(_) => "error",
    };
    metrics::counter!(crate::observability::SWEEPS_TOTAL, "status" => status).increment(1);
    result
}

/// Returns false when some day still has to be retried.
async fn sweep_and_log(engine: &Engine, schedule: &FinalizeSchedule, clock: &dyn Clock) -> bool {
    match sweep(engine, schedule, clock).await {
        Ok(reports) => {
            for report in &reports {
                info!(
                    "sweep for {:?}: {} finalized, {} already committed, {} failed",
                    report.date,
                    report.finalized.len(),
                    report.skipped.len(),
                    report.failed.len()
                );
            }
            reports.iter().all(|r| r.failed.is_empty())
        }
        Err(e) => {
            error!("sweep failed: {e}");
            false
        }
    }
}

/// Background task: one catch-up sweep at startup, then one per day at `schedule.at`.
/// An incomplete sweep is retried after `SWEEP_RETRY_DELAY`.
pub async fn run_finalizer(engine: Arc<Engine>, schedule: FinalizeSchedule, clock: Arc<dyn Clock>) {
    let mut complete = sweep_and_log(&engine, &schedule, clock.as_ref()).await;
    loop {
        let now = clock.now();
        let next = schedule.next_run_after(now);
        let mut wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        if !complete {
            wait = wait.min(SWEEP_RETRY_DELAY);
        }
        info!("next sweep in {}s", wait.as_secs());
        tokio::time::sleep(wait).await;
        complete = sweep_and_log(&engine, &schedule, clock.as_ref()).await;
    }
}

/// Background task that compacts the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => {
                metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
                info!("compacted WAL after {appends} appends");
            }
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
