// # Cron Registry
//
// Named jobs, each driven by its own scheduling task.
//
// ## Job lifecycle
//
// ```text
// add() ──► Valid ──init()──► Running ──shutdown()──► (stopped)
//   │
//   └─────► Invalid   (terminal: reported by the next init(), never run)
// ```
//
// ## Overlap
//
// A fire that arrives while the previous run of the same job is still in
// progress is skipped with a warning. `run_now()` goes through the same
// guard. Jobs never block each other.
//
// ## Time
//
// Fire times are computed on the wall clock of the configured timezone.
// Each job loop re-reads the clock after every wake-up and never sleeps
// longer than `MAX_SLEEP`, so a stepped or suspended clock shifts at most
// one fire by that much. Tests swap in `TokioClock` to drive schedules
// with paused time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::expr::{CronExpr, CronParseError};
use crate::config::DEFAULT_TIME_ZONE;
use crate::{Error, Result};

/// Work run on every fire of a job
#[async_trait]
pub trait CronTask: Send + Sync {
    async fn run(&self);
}

struct FnTask<F>(F);

#[async_trait]
impl<F, Fut> CronTask for FnTask<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn run(&self) {
        (self.0)().await
    }
}

/// Wrap an async closure as a [`CronTask`]
pub fn task_fn<F, Fut>(f: F) -> Arc<dyn CronTask>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnTask(f))
}

/// Resolve a timezone name, falling back to `America/New_York` when unset
pub fn parse_timezone(name: Option<&str>) -> Result<Tz> {
    let name = match name.map(str::trim) {
        Some(name) if !name.is_empty() => name,
        _ => DEFAULT_TIME_ZONE,
    };
    name.parse::<Tz>()
        .map_err(|e| Error::config(format!("Invalid TIME_ZONE '{}': {}", name, e)))
}

/// Longest a job loop sleeps before looking at the wall clock again
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Source of the current wall-clock time
pub trait WallClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock advanced by tokio's clock
///
/// Starts at a given wall time and moves with `tokio::time::Instant`, so
/// schedules follow paused and auto-advanced time in tests.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl TokioClock {
    /// Start at the current system time
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Start at `wall`
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            mono: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WallClock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.mono);
        self.wall + chrono::TimeDelta::from_std(elapsed).unwrap_or(chrono::TimeDelta::zero())
    }
}

/// Observable state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Expression parsed; not scheduled yet
    Valid,
    /// Scheduled
    Running,
    /// Expression rejected; never scheduled
    Invalid,
}

/// A job `init()` refused to schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedJob {
    pub name: String,
    pub expression: String,
    pub error: CronParseError,
}

/// Outcome of [`CronRegistry::init`]
#[derive(Debug, Clone, Default)]
pub struct InitReport {
    /// Jobs scheduled by this call
    pub started: Vec<String>,
    /// Jobs with invalid expressions not reported by an earlier call
    pub rejected: Vec<RejectedJob>,
}

struct CronJob {
    expression: String,
    schedule: std::result::Result<CronExpr, CronParseError>,
    task: Arc<dyn CronTask>,
    cancel: CancellationToken,
    busy: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    reported: bool,
}

impl CronJob {
    fn state(&self) -> JobState {
        match (&self.schedule, &self.handle) {
            (Err(_), _) => JobState::Invalid,
            (Ok(_), Some(_)) => JobState::Running,
            (Ok(_), None) => JobState::Valid,
        }
    }
}

/// Registry of named cron jobs
///
/// # Example
///
/// ```rust,no_run
/// use dcron_core::cron::{CronRegistry, task_fn};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> dcron_core::Result<()> {
/// let mut registry = CronRegistry::new(chrono_tz::America::New_York, CancellationToken::new());
/// registry.add("dns", "* * * * *", task_fn(|| async { /* check IP */ }));
/// let report = registry.init();
/// assert!(report.rejected.is_empty());
/// registry.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct CronRegistry {
    timezone: Tz,
    shutdown: CancellationToken,
    clock: Arc<dyn WallClock>,
    tracker: TaskTracker,
    jobs: BTreeMap<String, CronJob>,
}

impl CronRegistry {
    /// Create a registry whose schedules stop when `shutdown` is cancelled
    pub fn new(timezone: Tz, shutdown: CancellationToken) -> Self {
        Self::with_clock(timezone, shutdown, Arc::new(SystemClock))
    }

    /// Create a registry reading the time from `clock`
    pub fn with_clock(timezone: Tz, shutdown: CancellationToken, clock: Arc<dyn WallClock>) -> Self {
        Self {
            timezone,
            shutdown,
            clock,
            tracker: TaskTracker::new(),
            jobs: BTreeMap::new(),
        }
    }

    /// Scheduler timezone
    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Add or replace a job
    ///
    /// The job is stored even when the expression is invalid; `init()`
    /// reports it. Replacing a running job stops its schedule.
    pub fn add(&mut self, name: impl Into<String>, expression: &str, task: Arc<dyn CronTask>) -> JobState {
        let name = name.into();
        let job = CronJob {
            expression: expression.to_string(),
            schedule: CronExpr::parse(expression),
            task,
            cancel: self.shutdown.child_token(),
            busy: Arc::new(AtomicBool::new(false)),
            handle: None,
            reported: false,
        };
        let state = job.state();

        if let Some(previous) = self.jobs.insert(name.clone(), job) {
            tracing::debug!("Replacing cron job '{}' ({})", name, previous.expression);
            previous.cancel.cancel();
        }

        state
    }

    /// Current state of a job
    pub fn job_state(&self, name: &str) -> Option<JobState> {
        self.jobs.get(name).map(CronJob::state)
    }

    /// Registered job names
    pub fn job_names(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }

    /// Schedule every valid job that is not running yet
    ///
    /// Invalid jobs are logged and reported once per `add()`. Must be
    /// called from within a tokio runtime.
    pub fn init(&mut self) -> InitReport {
        let mut report = InitReport::default();

        for (name, job) in self.jobs.iter_mut() {
            match &job.schedule {
                Err(_) if job.reported => {}
                Err(error) => {
                    job.reported = true;
                    tracing::error!(
                        "Cron job '{}' has invalid expression '{}': {}",
                        name,
                        job.expression,
                        error
                    );
                    report.rejected.push(RejectedJob {
                        name: name.clone(),
                        expression: job.expression.clone(),
                        error: error.clone(),
                    });
                }
                Ok(_) if job.handle.is_some() => {}
                Ok(schedule) => {
                    let schedule_loop = ScheduleLoop {
                        name: name.clone(),
                        schedule: schedule.clone(),
                        timezone: self.timezone,
                        clock: self.clock.clone(),
                        task: job.task.clone(),
                        cancel: job.cancel.clone(),
                        busy: job.busy.clone(),
                        tracker: self.tracker.clone(),
                    };
                    job.handle = Some(tokio::spawn(schedule_loop.run()));
                    tracing::info!("Scheduled cron job '{}' ({} {})", name, schedule, self.timezone);
                    report.started.push(name.clone());
                }
            }
        }

        report
    }

    /// Run a valid job right away, outside its schedule
    ///
    /// Returns `false` when the job is unknown, invalid or still running.
    /// Must be called from within a tokio runtime.
    pub fn run_now(&self, name: &str) -> bool {
        let Some(job) = self.jobs.get(name) else {
            return false;
        };
        if job.schedule.is_err() || self.shutdown.is_cancelled() {
            return false;
        }
        start_run(name, &job.busy, &job.task, &self.tracker)
    }

    /// Stop every schedule and wait for in-flight runs to finish
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();

        for (name, job) in self.jobs.iter_mut() {
            if let Some(handle) = job.handle.take()
                && let Err(e) = handle.await
            {
                tracing::warn!("Scheduling task for '{}' ended abnormally: {}", name, e);
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Cron registry stopped");
    }
}

/// Clears a job's busy flag when its run ends, even by panic
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Spawn one run of a job unless the previous one is still going
fn start_run(name: &str, busy: &Arc<AtomicBool>, task: &Arc<dyn CronTask>, tracker: &TaskTracker) -> bool {
    if busy.swap(true, Ordering::AcqRel) {
        return false;
    }

    tracing::debug!("Cron job '{}' starting", name);
    let guard = BusyGuard(busy.clone());
    let task = task.clone();
    tracker.spawn(async move {
        let _guard = guard;
        task.run().await;
    });
    true
}

struct ScheduleLoop {
    name: String,
    schedule: CronExpr,
    timezone: Tz,
    clock: Arc<dyn WallClock>,
    task: Arc<dyn CronTask>,
    cancel: CancellationToken,
    busy: Arc<AtomicBool>,
    tracker: TaskTracker,
}

impl ScheduleLoop {
    async fn run(self) {
        let mut last = self.clock.now().with_timezone(&self.timezone);

        loop {
            let Some(next) = self.schedule.next_after(&last) else {
                tracing::warn!("Cron job '{}' has no upcoming fire time, stopping", self.name);
                return;
            };
            let target = next.with_timezone(&Utc);

            loop {
                let now = self.clock.now();
                if now >= target {
                    break;
                }
                let wait = (target - now).to_std().unwrap_or_default().min(MAX_SLEEP);
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        tracing::debug!("Cron job '{}' cancelled", self.name);
                        return;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            // Fires the clock jumped over are not replayed
            last = self.clock.now().with_timezone(&self.timezone).max(next);

            if !start_run(&self.name, &self.busy, &self.task, &self.tracker) {
                tracing::warn!(
                    "Cron job '{}' is still running, skipping the {} fire",
                    self.name,
                    next
                );
            }
        }
    }
}
