use crate::error::PollError;
use crate::synchronizer::{PollReport, Synchronizer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub interval: Duration,
    /// Upper bound on the backoff delay, as a multiple of `interval`.
    pub backoff_cap_factor: u32,
}

/// Delay before the next poll after `consecutive_failures` transport failures.
pub fn next_delay(config: &ScheduleConfig, consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        return config.interval;
    }
    let factor = 2u32
        .saturating_pow(consecutive_failures)
        .min(config.backoff_cap_factor.max(1));
    config.interval.saturating_mul(factor)
}

/// Longest wait between polls, whatever the configured interval and backoff.
const MAX_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// `at + delay`, clamped instead of overflowing the clock.
fn later(at: Instant, delay: Duration) -> Instant {
    let delay = delay.min(MAX_DELAY);
    at.checked_add(delay).unwrap_or(at)
}

/// Poll deadlines anchored to the schedule rather than to when a poll finished,
/// so slow polls do not accumulate drift. Deadlines already in the past are
/// skipped rather than fired back to back.
#[derive(Debug, Clone)]
pub struct Cadence {
    config: ScheduleConfig,
    next_deadline: Instant,
    consecutive_failures: u32,
}

impl Cadence {
    pub fn new(config: ScheduleConfig, first_deadline: Instant) -> Self {
        Self {
            config,
            next_deadline: first_deadline,
            consecutive_failures: 0,
        }
    }

    pub fn next_deadline(&self) -> Instant {
        self.next_deadline
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Records the outcome of a scheduled poll and moves the deadline forward.
    pub fn after_scheduled(&mut self, outcome: &Result<PollReport, PollError>, now: Instant) {
        self.record(outcome);
        let delay = next_delay(&self.config, self.consecutive_failures);
        let mut next = later(self.next_deadline, delay);
        if next <= now {
            let behind = now.duration_since(next).as_nanos();
            let skipped =
                u32::try_from(behind / delay.as_nanos().max(1) + 1).unwrap_or(u32::MAX);
            debug!(skipped, "poll overran its slot; skipping missed ticks");
            next = later(next, delay.saturating_mul(skipped));
        }
        self.next_deadline = next;
    }

    /// Records the outcome of an out-of-band poll without moving the deadline.
    pub fn after_manual(&mut self, outcome: &Result<PollReport, PollError>) {
        self.record(outcome);
    }

    fn record(&mut self, outcome: &Result<PollReport, PollError>) {
        match outcome {
            Ok(_) => self.consecutive_failures = 0,
            Err(PollError::Transport(_)) => self.consecutive_failures += 1,
            // Auth failures keep the normal cadence and busy polls change nothing.
            Err(PollError::Auth(_)) | Err(PollError::Busy) => {}
        }
    }
}

/// Running poll loop. Dropping the handle without [`SchedulerHandle::stop`]
/// leaves the task running until the runtime shuts down.
pub(crate) struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signals shutdown and waits for an in-flight poll to finish.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!("poll scheduler task ended abnormally: {err}");
        }
    }
}

pub(crate) fn spawn(sync: Arc<Synchronizer>, config: ScheduleConfig) -> SchedulerHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        info!(interval_secs = config.interval.as_secs(), "poll scheduler started");
        let mut cadence = Cadence::new(config, Instant::now());

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = sleep_until(cadence.next_deadline()) => {
                    let outcome = sync.poll_once().await;
                    log_outcome(&outcome, "scheduled");
                    cadence.after_scheduled(&outcome, Instant::now());
                }
                _ = sync.refresh.notified() => {
                    let outcome = sync.poll_once().await;
                    log_outcome(&outcome, "requested");
                    cadence.after_manual(&outcome);
                }
            }

            if *shutdown_rx.borrow() {
                break;
            }
        }

        info!("poll scheduler stopped");
    });

    SchedulerHandle { shutdown, task }
}

fn log_outcome(outcome: &Result<PollReport, PollError>, trigger: &str) {
    match outcome {
        Ok(report) if report.diff.is_empty() => {
            debug!(trigger, poll_seq = report.poll_seq, "poll finished; no changes");
        }
        Ok(report) => info!(
            trigger,
            poll_seq = report.poll_seq,
            added = report.diff.added.len(),
            read_changed = report.diff.read_changed.len(),
            removed = report.diff.removed.len(),
            "poll finished"
        ),
        Err(PollError::Busy) => debug!(trigger, "poll skipped; previous cycle still running"),
        Err(err @ PollError::Auth(_)) => warn!(trigger, "poll failed: {err}"),
        Err(err @ PollError::Transport(_)) => warn!(trigger, "poll failed; backing off: {err}"),
    }
}
