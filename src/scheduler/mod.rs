use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub mod jobs;

/// When a job fires: once a day at a fixed UTC wall-clock time, or on a
/// fixed interval.
#[derive(Debug, Clone, Copy)]
pub enum Cadence {
    Daily { hour: u32, minute: u32 },
    Every(Duration),
}

impl Cadence {
    /// Next fire strictly after `now`.
    pub fn next_fire(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Cadence::Every(interval) => {
                now + chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::zero())
            }
            Cadence::Daily { hour, minute } => {
                let date = now.date_naive();
                let today = Utc
                    .from_utc_datetime(&date.and_hms_opt(hour, minute, 0).unwrap_or_default());
                if today > now {
                    today
                } else {
                    Utc.from_utc_datetime(
                        &(date + chrono::Duration::days(1))
                            .and_hms_opt(hour, minute, 0)
                            .unwrap_or_default(),
                    )
                }
            }
        }
    }
}

/// One named maintenance task. `run` returns a human-readable summary that
/// ends up in the log line.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;
    fn cadence(&self) -> Cadence;
    async fn run(&self) -> anyhow::Result<String>;
}

async fn run_logged(job: &dyn Job) -> anyhow::Result<String> {
    let name = job.name();
    info!(job = name, "job starting");
    let started = std::time::Instant::now();
    match job.run().await {
        Ok(summary) => {
            info!(job = name, elapsed_ms = started.elapsed().as_millis() as u64, %summary, "job finished");
            Ok(summary)
        }
        Err(e) => {
            error!(job = name, elapsed_ms = started.elapsed().as_millis() as u64, "job failed: {e:#}");
            Err(e)
        }
    }
}

/// Owns the job clocks. Constructed explicitly with its job set and handed
/// to whoever needs to trigger jobs; there is deliberately no global
/// instance.
pub struct Scheduler {
    jobs: Vec<Arc<dyn Job>>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(jobs: Vec<Arc<dyn Job>>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            jobs,
            shutdown,
            handles: Vec::new(),
        }
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|j| j.name()).collect()
    }

    /// Spawn one clock loop per job. Idempotent start is not supported;
    /// call once.
    pub fn start(&mut self) {
        for job in &self.jobs {
            let job = job.clone();
            let mut shutdown = self.shutdown.subscribe();
            self.handles.push(tokio::spawn(async move {
                loop {
                    let now = Utc::now();
                    let wait = (job.cadence().next_fire(now) - now)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {
                            // Errors are logged inside; one failed run never
                            // stops the clock.
                            let _ = run_logged(job.as_ref()).await;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }
        info!(jobs = self.jobs.len(), "scheduler started");
    }

    /// Run one job now, synchronously, returning its summary. An in-flight
    /// scheduled run of the same job is unaffected.
    pub async fn trigger(&self, name: &str) -> anyhow::Result<String> {
        let job = self
            .jobs
            .iter()
            .find(|j| j.name() == name)
            .ok_or_else(|| anyhow::anyhow!("unknown job: {name}"))?;
        run_logged(job.as_ref()).await
    }

    /// Cancel the clocks and wait for every loop, letting any in-flight run
    /// finish first.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!("scheduler loop panicked: {e}");
            }
        }
        info!("scheduler stopped");
    }
}
