//! Lease reaper and retry sweep, run at the start of every worker cycle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use campaign_core::config::WorkerConfig;
use campaign_core::error::CampaignResult;
use campaign_core::event_bus::{make_event, DispatchEventType, EventSink};
use campaign_core::types::EmailJob;
use campaign_store::DispatchStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub leases_released: usize,
    pub retries_requeued: usize,
}

pub struct Recovery {
    store: Arc<dyn DispatchStore>,
    events: Arc<dyn EventSink>,
    max_attempts: u32,
    batch_size: usize,
}

impl Recovery {
    pub fn new(config: &WorkerConfig, store: Arc<dyn DispatchStore>, events: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            events,
            max_attempts: config.max_attempts,
            batch_size: config.batch_size,
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> CampaignResult<RecoveryReport> {
        let released = self.store.release_expired_leases(now).await?;
        for job in &released {
            warn!(
                job_id = %job.id,
                mailbox_id = %job.mailbox_id,
                claimed_at = ?job.claimed_at,
                "Lease expired while sending, job returned to queue"
            );
            self.emit(DispatchEventType::JobLeaseExpired, job);
        }
        if !released.is_empty() {
            metrics::counter!("dispatch.leases_expired").increment(released.len() as u64);
        }

        let requeued = self.store.requeue_failed(now, self.max_attempts, self.batch_size).await?;
        for job in &requeued {
            info!(job_id = %job.id, attempts = job.attempt_count, "Failed job re-queued for retry");
            self.emit(DispatchEventType::JobRequeued, job);
        }
        if !requeued.is_empty() {
            metrics::counter!("dispatch.jobs_requeued").increment(requeued.len() as u64);
        }

        Ok(RecoveryReport {
            leases_released: released.len(),
            retries_requeued: requeued.len(),
        })
    }

    /// Operator retry of a job whose automatic retries are exhausted.
    pub async fn requeue(&self, job_id: Uuid, now: DateTime<Utc>) -> CampaignResult<EmailJob> {
        let job = self.store.requeue_job(job_id, now).await?;
        metrics::counter!("dispatch.jobs_requeued").increment(1);
        self.emit(DispatchEventType::JobRequeued, &job);
        Ok(job)
    }

    fn emit(&self, event_type: DispatchEventType, job: &EmailJob) {
        let mut event = make_event(event_type, Some(job.enrollment_id), Some(job.id), Some(job.campaign_id));
        if let Some(error) = &job.last_error {
            event = event.with_detail(error.clone());
        }
        self.events.emit(event);
    }
}
