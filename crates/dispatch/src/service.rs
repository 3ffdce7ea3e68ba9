//! Periodic driver for the scheduler and worker loops.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use campaign_core::config::AppConfig;
use campaign_core::error::CampaignResult;
use campaign_core::event_bus::EventSink;
use campaign_core::templates::MessageRenderer;
use campaign_delivery::{DeliveryEngine, MailTransport, RateLimiter};
use campaign_store::DispatchStore;

use crate::recovery::RecoveryReport;
use crate::scheduler::{ScheduleReport, Scheduler};
use crate::worker::{Worker, WorkerReport};

/// One scheduler pass followed by one worker pass.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub schedule: ScheduleReport,
    pub recovery: RecoveryReport,
    pub work: WorkerReport,
}

pub struct DispatchService {
    scheduler: Arc<Scheduler>,
    worker: Arc<Worker>,
    config: AppConfig,
}

impl DispatchService {
    /// Wires the rate limiter, delivery engine, scheduler and worker over a
    /// shared store.
    pub fn new(
        config: AppConfig,
        store: Arc<dyn DispatchStore>,
        transport: Arc<dyn MailTransport>,
        renderer: Arc<dyn MessageRenderer>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), store.clone()));
        let engine = Arc::new(DeliveryEngine::new(&config.delivery, store.clone(), limiter.clone()));
        let scheduler = Scheduler::new(&config.scheduler, store.clone(), engine, renderer, events.clone());
        let worker = Worker::new(&config.worker, store, limiter, transport, events);
        Self {
            scheduler: Arc::new(scheduler),
            worker: Arc::new(worker),
            config,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Runs each enabled component once, scheduler first.
    pub async fn run_once(&self) -> CampaignResult<CycleReport> {
        let mut report = CycleReport::default();
        if self.config.scheduler.enabled {
            report.schedule = self.scheduler.schedule_due_work(Utc::now()).await?;
        }
        if self.config.worker.enabled {
            let (recovery, work) = self.worker.run_cycle(Utc::now()).await?;
            report.recovery = recovery;
            report.work = work;
        }
        Ok(report)
    }

    /// Spawns the enabled loops. Each stops after its current cycle once
    /// `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.config.scheduler.enabled {
            let scheduler = self.scheduler.clone();
            let every = Duration::from_secs(self.config.scheduler.interval_secs);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                run_loop("scheduler", every, shutdown, || {
                    let scheduler = scheduler.clone();
                    async move { scheduler.schedule_due_work(Utc::now()).await.map(|_| ()) }
                })
                .await;
            }));
        }

        if self.config.worker.enabled {
            let worker = self.worker.clone();
            let every = Duration::from_secs(self.config.worker.interval_secs);
            handles.push(tokio::spawn(async move {
                run_loop("worker", every, shutdown, || {
                    let worker = worker.clone();
                    async move { worker.run_cycle(Utc::now()).await.map(|_| ()) }
                })
                .await;
            }));
        }

        info!(
            node_id = %self.config.node_id,
            scheduler_interval_secs = self.config.scheduler.interval_secs,
            worker_interval_secs = self.config.worker.interval_secs,
            loops = handles.len(),
            "Dispatch service started"
        );
        handles
    }
}

async fn run_loop<F, Fut>(name: &'static str, every: Duration, mut shutdown: watch::Receiver<bool>, mut cycle: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = CampaignResult<()>>,
{
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = cycle().await {
                    metrics::counter!("dispatch.cycle_errors", "loop" => name).increment(1);
                    error!(loop_name = name, error = %e, "Dispatch cycle failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(loop_name = name, "Dispatch loop stopping");
                    break;
                }
            }
        }
    }
}
