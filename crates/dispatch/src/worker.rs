//! Send worker.
//!
//! Each queued job is claimed through the rate limiter, handed to the
//! transport, and its outcome recorded. A capacity refusal defers the job
//! without spending an attempt; a provider failure spends one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use campaign_core::config::{ExhaustionPolicy, WorkerConfig};
use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::event_bus::{make_event, DispatchEventType, EventSink};
use campaign_core::types::{CampaignStep, EmailJob, EnrollmentUpdate, Refusal, SendReceipt};
use campaign_delivery::{MailTransport, OutboundEmail, RateLimiter, TransportError};
use campaign_store::{ClaimOutcome, DispatchStore};

use crate::recovery::{Recovery, RecoveryReport};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub sent: usize,
    pub failed: usize,
    pub deferred: usize,
    /// Claimed by someone else between the scan and the claim, or sent
    /// after the lease ran out and the job was handed to another claim.
    pub skipped: usize,
}

impl WorkerReport {
    pub fn processed(&self) -> usize {
        self.sent + self.failed + self.deferred
    }
}

/// What became of one claimed job.
enum Delivery {
    Sent,
    Failed,
    /// The claim was reaped before the outcome could be recorded.
    Superseded,
}

pub struct Worker {
    store: Arc<dyn DispatchStore>,
    limiter: Arc<RateLimiter>,
    transport: Arc<dyn MailTransport>,
    events: Arc<dyn EventSink>,
    recovery: Recovery,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        config: &WorkerConfig,
        store: Arc<dyn DispatchStore>,
        limiter: Arc<RateLimiter>,
        transport: Arc<dyn MailTransport>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            recovery: Recovery::new(config, store.clone(), events.clone()),
            store,
            limiter,
            transport,
            events,
            config: config.clone(),
        }
    }

    pub fn recovery(&self) -> &Recovery {
        &self.recovery
    }

    /// Recovery sweep followed by one batch of sends.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CampaignResult<(RecoveryReport, WorkerReport)> {
        let recovered = self.recovery.sweep(now).await?;
        let processed = self.process_queued_jobs(now).await?;
        Ok((recovered, processed))
    }

    /// Works one batch of ready jobs. Sends run one at a time so each claim
    /// sees the previous send of the same mailbox.
    pub async fn process_queued_jobs(&self, now: DateTime<Utc>) -> CampaignResult<WorkerReport> {
        let started = Instant::now();
        let jobs = self.store.due_jobs(now, self.config.batch_size).await?;
        let mut report = WorkerReport::default();

        for job in jobs {
            let at = clock(now, started);
            let lease_until = later(at, self.config.lease_secs)?;
            match self.store.claim_job(job.id, at, lease_until, &*self.limiter).await? {
                ClaimOutcome::Unavailable => {
                    debug!(job_id = %job.id, "Job already claimed");
                    report.skipped += 1;
                }
                ClaimOutcome::Refused(refusal) => {
                    if self.defer(&job, &refusal, at).await? {
                        report.deferred += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                ClaimOutcome::Claimed(job) => match self.deliver(&job, now, started).await? {
                    Delivery::Sent => report.sent += 1,
                    Delivery::Failed => report.failed += 1,
                    Delivery::Superseded => report.skipped += 1,
                },
            }
        }

        if report.processed() > 0 {
            info!(
                sent = report.sent,
                failed = report.failed,
                deferred = report.deferred,
                "Worker cycle finished"
            );
        }
        Ok(report)
    }

    async fn defer(&self, job: &EmailJob, refusal: &Refusal, at: DateTime<Utc>) -> CampaignResult<bool> {
        let reason = refusal.to_string();
        let retry_at = later(at, self.config.deferral_secs)?;
        match self.store.defer_job(job.id, reason.clone(), retry_at, at).await {
            Ok(_) => {}
            Err(CampaignError::Conflict(_)) => return Ok(false),
            Err(e) => return Err(e),
        }
        debug!(job_id = %job.id, mailbox_id = %job.mailbox_id, reason = %reason, retry_at = %retry_at, "Job deferred");
        metrics::counter!("dispatch.jobs_deferred", "reason" => refusal.kind()).increment(1);
        self.events.emit(
            make_event(
                DispatchEventType::JobDeferred,
                Some(job.enrollment_id),
                Some(job.id),
                Some(job.campaign_id),
            )
            .with_detail(reason),
        );
        Ok(true)
    }

    /// Sends a claimed job and records the result under its claim.
    async fn deliver(&self, job: &EmailJob, now: DateTime<Utc>, started: Instant) -> CampaignResult<Delivery> {
        let Some(claim_id) = job.claim_id else {
            return Err(CampaignError::Conflict(format!("job {}: claimed without a claim id", job.id)));
        };
        let email = OutboundEmail::from(job);
        let timeout = Duration::from_secs(self.config.send_timeout_secs);
        let result = match tokio::time::timeout(timeout, self.transport.send(&email)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };
        let finished = clock(now, started);

        match result {
            Ok(provider_message_id) => {
                let receipt = SendReceipt {
                    provider_message_id,
                    accepted_at: finished,
                };
                self.record_success(job, claim_id, receipt).await
            }
            Err(error) => self.record_failure(job, claim_id, &error, finished).await,
        }
    }

    async fn record_success(
        &self,
        job: &EmailJob,
        claim_id: Uuid,
        receipt: SendReceipt,
    ) -> CampaignResult<Delivery> {
        let accepted_at = receipt.accepted_at;
        let next_step = self
            .store
            .get_campaign(job.campaign_id)
            .await?
            .and_then(|c| c.step(job.step_number + 1).map(|s| due_or_end_of_time(s, accepted_at)));
        let update = match next_step {
            Some(next_send_at) => EnrollmentUpdate::Advance { next_send_at },
            None => EnrollmentUpdate::Complete,
        };

        let recorded = match self.store.record_send_success(job.id, claim_id, receipt, update).await {
            Ok(recorded) => recorded,
            Err(CampaignError::Conflict(detail)) => {
                // The lease ran out and the job went to another claim, which
                // owns the outcome now.
                warn!(job_id = %job.id, detail = %detail, "Send finished after its lease expired");
                metrics::counter!("dispatch.sends_superseded").increment(1);
                return Ok(Delivery::Superseded);
            }
            Err(e) => return Err(e),
        };

        info!(
            job_id = %job.id,
            enrollment_id = %job.enrollment_id,
            step = job.step_number,
            to = %job.to_email,
            message_id = %recorded.message.provider_message_id,
            "Email sent"
        );
        metrics::counter!("dispatch.jobs_sent").increment(1);
        self.events.emit(make_event(
            DispatchEventType::JobSent,
            Some(job.enrollment_id),
            Some(job.id),
            Some(job.campaign_id),
        ));

        if recorded.enrollment_updated {
            let event_type = match update {
                EnrollmentUpdate::Advance { .. } | EnrollmentUpdate::SkipStep { next_send_at: Some(_) } => {
                    DispatchEventType::EnrollmentAdvanced
                }
                EnrollmentUpdate::Complete | EnrollmentUpdate::SkipStep { next_send_at: None } => {
                    metrics::counter!("dispatch.enrollments_completed").increment(1);
                    DispatchEventType::EnrollmentCompleted
                }
            };
            debug!(
                enrollment_id = %recorded.enrollment.id,
                step = recorded.enrollment.current_step_number,
                status = ?recorded.enrollment.status,
                "Enrollment updated"
            );
            self.events.emit(make_event(
                event_type,
                Some(job.enrollment_id),
                Some(job.id),
                Some(job.campaign_id),
            ));
        }
        Ok(Delivery::Sent)
    }

    async fn record_failure(
        &self,
        job: &EmailJob,
        claim_id: Uuid,
        error: &TransportError,
        at: DateTime<Utc>,
    ) -> CampaignResult<Delivery> {
        let retry_at = later(at, self.config.failure_backoff_secs)?;
        let failed = match self
            .store
            .record_send_failure(job.id, claim_id, error.to_string(), retry_at, at)
            .await
        {
            Ok(failed) => failed,
            Err(CampaignError::Conflict(detail)) => {
                warn!(job_id = %job.id, detail = %detail, error = %error, "Send failed after its lease expired");
                metrics::counter!("dispatch.sends_superseded").increment(1);
                return Ok(Delivery::Superseded);
            }
            Err(e) => return Err(e),
        };
        metrics::counter!("dispatch.jobs_failed").increment(1);

        let exhausted = failed.attempt_count >= self.config.max_attempts;
        if exhausted {
            warn!(
                job_id = %job.id,
                enrollment_id = %job.enrollment_id,
                attempts = failed.attempt_count,
                policy = ?self.config.on_exhausted,
                error = %error,
                "Send failed, retries exhausted"
            );
        } else {
            warn!(
                job_id = %job.id,
                attempts = failed.attempt_count,
                retry_at = %retry_at,
                error = %error,
                "Send failed"
            );
        }

        self.events.emit(
            make_event(
                DispatchEventType::JobFailed,
                Some(job.enrollment_id),
                Some(job.id),
                Some(job.campaign_id),
            )
            .with_detail(error.to_string()),
        );
        if exhausted {
            self.events.emit(make_event(
                DispatchEventType::JobRetriesExhausted,
                Some(job.enrollment_id),
                Some(job.id),
                Some(job.campaign_id),
            ));
            if self.config.on_exhausted == ExhaustionPolicy::SkipStep {
                self.skip_step(&failed, at).await?;
            }
        }
        Ok(Delivery::Failed)
    }

    /// Gives up on an exhausted job and lets the next step follow on its own
    /// delay, counted from the final failure.
    async fn skip_step(&self, job: &EmailJob, at: DateTime<Utc>) -> CampaignResult<()> {
        let next_send_at = self
            .store
            .get_campaign(job.campaign_id)
            .await?
            .and_then(|c| c.step(job.step_number + 1).map(|s| due_or_end_of_time(s, at)));
        let update = EnrollmentUpdate::SkipStep { next_send_at };

        let moved = match self.store.skip_failed_job(job.id, update, at).await {
            Ok(moved) => moved,
            Err(CampaignError::Conflict(detail)) => {
                debug!(job_id = %job.id, detail = %detail, "Failed job changed before its step was skipped");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        metrics::counter!("dispatch.steps_skipped").increment(1);
        self.events.emit(
            make_event(
                DispatchEventType::StepSkipped,
                Some(job.enrollment_id),
                Some(job.id),
                Some(job.campaign_id),
            )
            .with_detail(format!("step {}", job.step_number)),
        );
        if moved && next_send_at.is_none() {
            metrics::counter!("dispatch.enrollments_completed").increment(1);
            self.events.emit(make_event(
                DispatchEventType::EnrollmentCompleted,
                Some(job.enrollment_id),
                Some(job.id),
                Some(job.campaign_id),
            ));
        }
        Ok(())
    }
}

/// When `step` falls due after `from`, or the last representable instant.
fn due_or_end_of_time(step: &CampaignStep, from: DateTime<Utc>) -> DateTime<Utc> {
    step.due_after(from).unwrap_or_else(|| {
        warn!(step_id = %step.id, step = step.order, "Step delay overflows the calendar");
        DateTime::<Utc>::MAX_UTC
    })
}

/// Cycle time advanced by the wall time spent in the cycle so far.
fn clock(now: DateTime<Utc>, started: Instant) -> DateTime<Utc> {
    chrono::Duration::from_std(started.elapsed())
        .ok()
        .and_then(|elapsed| now.checked_add_signed(elapsed))
        .unwrap_or(now)
}

fn later(at: DateTime<Utc>, secs: u64) -> CampaignResult<DateTime<Utc>> {
    chrono::Duration::from_std(Duration::from_secs(secs))
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .ok_or_else(|| CampaignError::Config(format!("{secs}s after {at} is out of range")))
}
