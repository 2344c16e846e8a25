//! Background job execution with bounded retries.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info, warn};

/// A unit of background work.
#[async_trait]
pub trait Job: Send + Sync {
    type Output: Send;

    fn name(&self) -> &str;

    async fn run(&self) -> anyhow::Result<Self::Output>;
}

/// Exponential backoff between attempts of one job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Final state of one job execution.
#[derive(Debug)]
pub enum JobOutcome<T> {
    Succeeded { attempts: u32, output: T },
    Failed { attempts: u32, error: anyhow::Error },
    Cancelled { attempts: u32 },
}

impl<T> JobOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            JobOutcome::Succeeded { attempts, .. }
            | JobOutcome::Failed { attempts, .. }
            | JobOutcome::Cancelled { attempts } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded { .. })
    }
}

fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Wait until the shutdown flag is raised. A dropped sender never resolves.
async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    let raised = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !raised {
        std::future::pending::<()>().await;
    }
}

/// Run `job`, retrying failures per `policy`. Backoff waits end early on shutdown.
pub async fn run_with_retry<J: Job + ?Sized>(
    job: &J,
    policy: RetryPolicy,
    shutdown: &mut watch::Receiver<bool>,
) -> JobOutcome<J::Output> {
    let mut attempts = 0;

    loop {
        attempts += 1;

        let error = match job.run().await {
            Ok(output) => return JobOutcome::Succeeded { attempts, output },
            Err(e) => e,
        };

        let retry = attempts - 1;
        if retry >= policy.max_retries {
            return JobOutcome::Failed { attempts, error };
        }

        let delay = policy.delay_for(retry);
        warn!(
            job = job.name(),
            attempt = attempts,
            error = %error,
            retry_in_ms = delay.as_millis() as u64,
            "Job failed, retrying"
        );

        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown_signal(shutdown) => {
                return JobOutcome::Cancelled { attempts };
            }
        }
    }
}

/// Runs a job on a fixed period. Executions are sequential, so a slow run
/// delays the next tick rather than overlapping it.
pub struct IntervalScheduler {
    period: Duration,
    policy: RetryPolicy,
}

impl IntervalScheduler {
    pub fn new(period: Duration, policy: RetryPolicy) -> Self {
        Self { period, policy }
    }

    /// Loop until `shutdown` is raised. Returns the number of completed executions.
    pub async fn run<J: Job + ?Sized>(&self, job: &J, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut executions = 0;

        info!(
            job = job.name(),
            period_secs = self.period.as_secs(),
            "Scheduler started"
        );

        loop {
            if is_shutdown(&shutdown) {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_signal(&mut shutdown) => break,
            }

            match run_with_retry(job, self.policy, &mut shutdown).await {
                JobOutcome::Succeeded { attempts, .. } => {
                    executions += 1;
                    info!(job = job.name(), attempts = attempts, "Job completed");
                }
                JobOutcome::Failed { attempts, error } => {
                    executions += 1;
                    error!(
                        job = job.name(),
                        attempts = attempts,
                        error = %error,
                        "Job failed after retries"
                    );
                }
                JobOutcome::Cancelled { attempts } => {
                    info!(job = job.name(), attempts = attempts, "Job cancelled");
                    break;
                }
            }
        }

        info!(job = job.name(), executions = executions, "Scheduler stopped");
        executions
    }
}
