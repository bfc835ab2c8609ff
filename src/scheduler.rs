// =============================================================================
// Scheduler — cooperative periodic jobs with per-job fault isolation
// =============================================================================
//
// A direct port of the "safe scheduler" pattern: a job that panics or
// returns an error is logged and its failure recorded, but the scheduler
// keeps running every other job. `rerun_immediately` controls whether a
// failed job is retried on the very next poll (the default) or pushed back
// by one full period, matching the two ways the original bot's `schedule`
// wrapper can be configured.
// =============================================================================

use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tracing::error;

type JobAction = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Job {
    name: &'static str,
    period: Duration,
    rerun_immediately: bool,
    action: JobAction,
    last_run: Option<Instant>,
    next_run: Instant,
}

impl Job {
    fn due(&self, now: Instant) -> bool {
        now >= self.next_run
    }
}

/// Runs registered jobs on their own periods from a single cooperative loop.
/// Poll granularity is fixed at 1s since the fastest job in this bot (the
/// scout tick) is typically configured no faster than that anyway.
pub struct Scheduler {
    jobs: Vec<Job>,
    poll_interval: Duration,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: Vec::new(),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Register a job that runs every `period`, starting immediately on the
    /// first poll. `rerun_immediately` governs failure backoff: `true` means
    /// a failed job is retried on the very next poll, `false` pushes it back
    /// by a full `period`.
    pub fn every<F>(&mut self, name: &'static str, period: Duration, rerun_immediately: bool, action: F)
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.jobs.push(Job {
            name,
            period,
            rerun_immediately,
            action: Box::new(action),
            last_run: None,
            next_run: Instant::now(),
        });
    }

    /// Runs until `shutdown` fires. Each due job runs in turn on the calling
    /// task; a long-running job delays the ones behind it in the list, which
    /// is acceptable since none of this bot's jobs block for long.
    pub async fn run(&mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_due_jobs().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn run_due_jobs(&mut self) {
        let now = Instant::now();
        for job in &mut self.jobs {
            if !job.due(now) {
                continue;
            }
            match (job.action)().await {
                Ok(()) => {
                    job.last_run = Some(Instant::now());
                    job.next_run = Instant::now() + job.period;
                }
                Err(e) => {
                    error!(job = job.name, error = %e, "scheduled job failed");
                    job.last_run = Some(Instant::now());
                    if !job.rerun_immediately {
                        job.next_run = Instant::now() + job.period;
                    }
                    // rerun_immediately: next_run left as-is, so it's still
                    // due and will be retried on the next poll.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn due_job_runs_and_reschedules_for_next_period() {
        let mut scheduler = Scheduler::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        scheduler.every("count", Duration::from_millis(10), true, move || {
            let calls = calls2.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        scheduler.run_due_jobs().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Not due again immediately.
        scheduler.run_due_jobs().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(15)).await;
        scheduler.run_due_jobs().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_job_with_rerun_immediately_retries_on_next_poll() {
        let mut scheduler = Scheduler::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        scheduler.every("flaky", Duration::from_secs(60), true, move || {
            let calls = calls2.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    anyhow::bail!("simulated failure")
                } else {
                    Ok(())
                }
            })
        });

        scheduler.run_due_jobs().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Still due despite the long period, because the failure didn't push next_run out.
        scheduler.run_due_jobs().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_job_without_rerun_immediately_backs_off_a_full_period() {
        let mut scheduler = Scheduler::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        scheduler.every("flaky", Duration::from_secs(60), false, move || {
            let calls = calls2.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("simulated failure")
            })
        });

        scheduler.run_due_jobs().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        scheduler.run_due_jobs().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
