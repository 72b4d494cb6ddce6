//! Periodic tick driver.
//!
//! Handlers are registered with a period and an initial delay and each runs on
//! its own task until the cancellation token fires. Tests call the handlers
//! directly instead of starting the driver.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

#[async_trait]
pub trait TickHandler: Send + Sync {
    async fn tick(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickSchedule {
    pub period: Duration,
    /// Time before the first tick.
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub execute: TickSchedule,
    pub promote: TickSchedule,
    /// When false no timers are started.
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            execute: TickSchedule {
                period: Duration::from_secs(1),
                delay: Duration::from_secs(60),
            },
            promote: TickSchedule {
                period: Duration::from_secs(30),
                delay: Duration::ZERO,
            },
            enabled: true,
        }
    }
}

struct Job {
    name: &'static str,
    schedule: TickSchedule,
    handler: Arc<dyn TickHandler>,
}

pub struct Scheduler {
    jobs: Vec<Job>,
    enabled: bool,
}

impl Scheduler {
    pub fn new(enabled: bool) -> Self {
        Scheduler {
            jobs: Vec::new(),
            enabled,
        }
    }

    /// The queue's execution tick and the promotion tick, as configured.
    pub fn with_handlers(
        config: &SchedulerConfig,
        execute: Arc<dyn TickHandler>,
        promote: Arc<dyn TickHandler>,
    ) -> Self {
        let mut scheduler = Scheduler::new(config.enabled);
        scheduler.register("execute", config.execute, execute);
        scheduler.register("promote", config.promote, promote);
        scheduler
    }

    pub fn register(
        &mut self,
        name: &'static str,
        schedule: TickSchedule,
        handler: Arc<dyn TickHandler>,
    ) {
        self.jobs.push(Job {
            name,
            schedule,
            handler,
        });
    }

    pub fn spawn(self, cancel_token: CancellationToken) -> Vec<JoinHandle<()>> {
        if !self.enabled {
            info!("Tick scheduler disabled");
            return Vec::new();
        }

        self.jobs
            .into_iter()
            .map(|job| {
                let cancel_token = cancel_token.clone();
                let span = info_span!("tick", job = job.name);
                tokio::spawn(run(job, cancel_token).instrument(span))
            })
            .collect()
    }
}

async fn run(job: Job, cancel_token: CancellationToken) {
    tokio::select! {
        _ = cancel_token.cancelled() => return,
        _ = sleep(job.schedule.delay) => {}
    }

    debug!(period = ?job.schedule.period, "Tick started");
    let mut ticks = interval(job.schedule.period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticks.tick() => {
                if AssertUnwindSafe(job.handler.tick()).catch_unwind().await.is_err() {
                    error!("Tick handler panicked");
                }
            }
        }
    }

    debug!("Tick stopped");
}
