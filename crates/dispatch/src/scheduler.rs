//! Due-work scheduler.
//!
//! Turns due enrollments into `Queued` jobs. The enrollment cursor is never
//! moved here; only a confirmed send advances it.
//!
//! An enrollment with a configuration problem is blocked in the store and
//! stays out of later cycles until its campaign, profile or lead changes.
//! An enrollment whose profile has no free mailbox is left as it is and the
//! cycle pages past it, so busy profiles cannot crowd out the rest.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use campaign_core::config::SchedulerConfig;
use campaign_core::error::CampaignResult;
use campaign_core::event_bus::{make_event, DispatchEventType, EventSink};
use campaign_core::templates::MessageRenderer;
use campaign_core::types::{CampaignEnrollment, EmailJob, JobStatus};
use campaign_delivery::{DeliveryEngine, Selection};
use campaign_store::{DispatchStore, DueKey, JobInsert};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleReport {
    /// Due enrollments examined, acted on or not.
    pub scanned: usize,
    pub jobs_created: usize,
    pub enrollments_completed: usize,
    /// Missing campaign, profile or lead, an empty profile, or a step that
    /// failed to render. Each of these enrollments is now blocked.
    pub config_errors: usize,
    /// No mailbox in the profile could send this cycle.
    pub no_mailbox: usize,
    /// Lost a race with another scheduler or an enrollment transition.
    pub superseded: usize,
}

enum Outcome {
    Created,
    Completed,
    ConfigError,
    NoMailbox,
    Superseded,
}

impl Outcome {
    /// Whether the enrollment counts against the batch.
    fn acted(&self) -> bool {
        matches!(self, Outcome::Created | Outcome::Completed | Outcome::ConfigError)
    }
}

pub struct Scheduler {
    store: Arc<dyn DispatchStore>,
    engine: Arc<DeliveryEngine>,
    renderer: Arc<dyn MessageRenderer>,
    events: Arc<dyn EventSink>,
    batch_size: usize,
    max_scan: usize,
}

impl Scheduler {
    pub fn new(
        config: &SchedulerConfig,
        store: Arc<dyn DispatchStore>,
        engine: Arc<DeliveryEngine>,
        renderer: Arc<dyn MessageRenderer>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            engine,
            renderer,
            events,
            batch_size: config.batch_size,
            max_scan: config.max_scan.max(config.batch_size),
        }
    }

    /// Works through due enrollments until `batch_size` of them were acted
    /// on (job created, sequence completed or configuration error parked) or
    /// `max_scan` were examined.
    ///
    /// Per-enrollment configuration problems are logged and skipped; only a
    /// store failure aborts the cycle.
    pub async fn schedule_due_work(&self, now: DateTime<Utc>) -> CampaignResult<ScheduleReport> {
        let mut report = ScheduleReport::default();
        let mut busy_profiles = HashSet::new();
        let mut after: Option<DueKey> = None;
        let mut acted = 0;

        'pages: while acted < self.batch_size && report.scanned < self.max_scan {
            let page_size = self.batch_size.min(self.max_scan - report.scanned);
            let page = self.store.due_enrollments(now, after, page_size).await?;
            let last_page = page.len() < page_size;

            for enrollment in &page {
                after = DueKey::of(enrollment);
                report.scanned += 1;
                let outcome = self.schedule_enrollment(enrollment, now, &mut busy_profiles).await?;
                if outcome.acted() {
                    acted += 1;
                }
                match outcome {
                    Outcome::Created => report.jobs_created += 1,
                    Outcome::Completed => report.enrollments_completed += 1,
                    Outcome::ConfigError => report.config_errors += 1,
                    Outcome::NoMailbox => report.no_mailbox += 1,
                    Outcome::Superseded => report.superseded += 1,
                }
                if acted >= self.batch_size {
                    break 'pages;
                }
            }
            if last_page {
                break;
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                jobs_created = report.jobs_created,
                completed = report.enrollments_completed,
                no_mailbox = report.no_mailbox,
                config_errors = report.config_errors,
                "Scheduler cycle finished"
            );
        }
        Ok(report)
    }

    async fn schedule_enrollment(
        &self,
        enrollment: &CampaignEnrollment,
        now: DateTime<Utc>,
        busy_profiles: &mut HashSet<Uuid>,
    ) -> CampaignResult<Outcome> {
        let Some(campaign) = self.store.get_campaign(enrollment.campaign_id).await? else {
            return self.config_error(enrollment, "campaign_not_found", "campaign not found", now).await;
        };

        let Some(step) = campaign.step(enrollment.current_step_number) else {
            if self.store.complete_enrollment(enrollment.id, now).await? {
                info!(
                    enrollment_id = %enrollment.id,
                    campaign_id = %campaign.id,
                    step = enrollment.current_step_number,
                    "No step at cursor, enrollment completed"
                );
                metrics::counter!("dispatch.enrollments_completed").increment(1);
                self.events.emit(make_event(
                    DispatchEventType::EnrollmentCompleted,
                    Some(enrollment.id),
                    None,
                    Some(campaign.id),
                ));
                return Ok(Outcome::Completed);
            }
            return Ok(Outcome::Superseded);
        };

        let Some(profile_id) = campaign.sending_profile_id else {
            return self
                .config_error(enrollment, "no_sending_profile", "campaign has no sending profile", now)
                .await;
        };

        let Some(lead) = self.store.get_lead(enrollment.lead_id).await? else {
            return self.config_error(enrollment, "lead_not_found", "lead not found", now).await;
        };

        let rendered = match self.renderer.render(step, &lead) {
            Ok(rendered) => rendered,
            Err(e) => {
                return self.config_error(enrollment, "render_failed", &e.to_string(), now).await;
            }
        };

        if busy_profiles.contains(&profile_id) {
            return Ok(Outcome::NoMailbox);
        }
        let mailbox = match self.engine.select(profile_id, now).await? {
            Selection::Selected(mailbox) => mailbox,
            Selection::Exhausted => {
                debug!(
                    enrollment_id = %enrollment.id,
                    profile_id = %profile_id,
                    "No mailbox available, retrying next cycle"
                );
                busy_profiles.insert(profile_id);
                return Ok(Outcome::NoMailbox);
            }
            Selection::ProfileNotFound => {
                return self
                    .config_error(enrollment, "profile_not_found", "sending profile not found", now)
                    .await;
            }
            Selection::EmptyProfile => {
                return self
                    .config_error(enrollment, "empty_profile", "sending profile has no mailboxes", now)
                    .await;
            }
        };

        let job = EmailJob {
            id: Uuid::new_v4(),
            enrollment_id: enrollment.id,
            campaign_id: campaign.id,
            step_id: step.id,
            step_number: step.order,
            mailbox_id: mailbox.id,
            from_email: mailbox.email.clone(),
            from_name: mailbox.display_name.clone(),
            to_email: lead.email.clone(),
            subject: rendered.subject,
            body_html: rendered.body_html,
            status: JobStatus::Queued,
            scheduled_at: now,
            next_attempt_at: None,
            attempt_count: 0,
            last_error: None,
            deferral_reason: None,
            claim_id: None,
            claimed_at: None,
            lease_expires_at: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        };
        let job_id = job.id;

        match self.store.create_job(job).await? {
            JobInsert::Created => {
                info!(
                    job_id = %job_id,
                    enrollment_id = %enrollment.id,
                    step = step.order,
                    mailbox = %mailbox.email,
                    "Job queued"
                );
                metrics::counter!("dispatch.jobs_created").increment(1);
                self.events.emit(make_event(
                    DispatchEventType::JobQueued,
                    Some(enrollment.id),
                    Some(job_id),
                    Some(campaign.id),
                ));
                Ok(Outcome::Created)
            }
            JobInsert::AlreadyPending { existing_job_id } => {
                debug!(enrollment_id = %enrollment.id, existing_job_id = %existing_job_id, "Step already has a job");
                Ok(Outcome::Superseded)
            }
            JobInsert::Stale => {
                debug!(enrollment_id = %enrollment.id, "Enrollment changed while scheduling");
                Ok(Outcome::Superseded)
            }
        }
    }

    async fn config_error(
        &self,
        enrollment: &CampaignEnrollment,
        reason: &'static str,
        detail: &str,
        now: DateTime<Utc>,
    ) -> CampaignResult<Outcome> {
        if !self.store.block_enrollment(enrollment.id, detail.to_string(), now).await? {
            return Ok(Outcome::Superseded);
        }
        warn!(
            enrollment_id = %enrollment.id,
            campaign_id = %enrollment.campaign_id,
            reason = reason,
            detail = detail,
            "Enrollment blocked on configuration error"
        );
        metrics::counter!("dispatch.config_errors", "reason" => reason).increment(1);
        self.events.emit(
            make_event(
                DispatchEventType::ConfigurationError,
                Some(enrollment.id),
                None,
                Some(enrollment.campaign_id),
            )
            .with_detail(detail),
        );
        Ok(Outcome::ConfigError)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::{t0, Harness};
    use campaign_core::types::{CampaignStatus, EnrollmentStatus};
    use chrono::Duration;

    #[tokio::test]
    async fn test_creates_one_job_per_due_enrollment() {
        let h = Harness::new(&[0, 48], 100, 0);
        let e = h.enroll_lead("Ada", t0()).await;

        let report = h.scheduler().schedule_due_work(t0()).await.unwrap();
        assert_eq!(report.jobs_created, 1);

        let jobs = h.store.jobs_for_enrollment(e.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].step_number, 1);
        assert_eq!(jobs[0].status, JobStatus::Queued);
        assert_eq!(jobs[0].subject, "Hi Ada");
        assert_eq!(jobs[0].from_email, "sdr@outbound.example.com");
        assert_eq!(h.events.count_type(DispatchEventType::JobQueued), 1);

        // The cursor stays put until the job is sent.
        let e = h.store.get_enrollment(e.id).await.unwrap().unwrap();
        assert_eq!(e.current_step_number, 1);
    }

    #[tokio::test]
    async fn test_second_run_creates_nothing() {
        let h = Harness::new(&[0], 100, 0);
        h.enroll_lead("Ada", t0()).await;
        h.enroll_lead("Grace", t0()).await;

        let scheduler = h.scheduler();
        assert_eq!(scheduler.schedule_due_work(t0()).await.unwrap().jobs_created, 2);
        let again = scheduler.schedule_due_work(t0() + Duration::minutes(5)).await.unwrap();
        assert_eq!(again, ScheduleReport::default());
        assert_eq!(h.store.jobs().len(), 2);
    }

    #[tokio::test]
    async fn test_not_yet_due_enrollment_ignored() {
        let h = Harness::new(&[2], 100, 0);
        h.enroll_lead("Ada", t0()).await;
        let scheduler = h.scheduler();
        assert_eq!(scheduler.schedule_due_work(t0()).await.unwrap().scanned, 0);
        assert_eq!(scheduler.schedule_due_work(t0() + Duration::hours(2)).await.unwrap().jobs_created, 1);
    }

    #[tokio::test]
    async fn test_missing_step_completes_enrollment() {
        let h = Harness::new(&[0], 100, 0);
        let e = h.enroll_lead("Ada", t0()).await;
        h.replace_steps(&[]);

        let report = h.scheduler().schedule_due_work(t0()).await.unwrap();
        assert_eq!(report.enrollments_completed, 1);
        assert_eq!(report.jobs_created, 0);

        let e = h.store.get_enrollment(e.id).await.unwrap().unwrap();
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert!(e.next_send_at.is_none());
        assert_eq!(h.events.count_type(DispatchEventType::EnrollmentCompleted), 1);
    }

    #[tokio::test]
    async fn test_campaign_without_profile_is_blocked_until_fixed() {
        let h = Harness::new(&[0], 100, 0);
        let e = h.enroll_lead("Ada", t0()).await;
        h.set_profile(None);

        let scheduler = h.scheduler();
        let report = scheduler.schedule_due_work(t0()).await.unwrap();
        assert_eq!(report.config_errors, 1);
        assert!(h.store.jobs().is_empty());
        assert_eq!(h.events.count_type(DispatchEventType::ConfigurationError), 1);

        let after = h.store.get_enrollment(e.id).await.unwrap().unwrap();
        assert_eq!(after.status, EnrollmentStatus::Active);
        assert_eq!(after.next_send_at, e.next_send_at);
        assert_eq!(after.current_step_number, 1);
        assert_eq!(after.blocked_reason.as_deref(), Some("campaign has no sending profile"));

        // Not retried on its own.
        let later = scheduler.schedule_due_work(t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(later.scanned, 0);
        assert_eq!(h.events.count_type(DispatchEventType::ConfigurationError), 1);

        h.set_profile(Some(h.profile_id));
        let fixed = scheduler.schedule_due_work(t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(fixed.jobs_created, 1);
        assert!(h.store.get_enrollment(e.id).await.unwrap().unwrap().blocked_reason.is_none());
    }

    #[tokio::test]
    async fn test_broken_enrollments_do_not_starve_the_batch() {
        let h = Harness::new(&[0], 100, 0);
        let broken = h.add_campaign(None);
        h.enroll_many(broken, 60, t0()).await;
        let healthy = h.enroll_lead("Ada", t0() + Duration::minutes(1)).await;

        let scheduler = h.scheduler();
        let now = t0() + Duration::minutes(1);
        let first = scheduler.schedule_due_work(now).await.unwrap();
        assert_eq!(first.config_errors, 50);
        assert_eq!(first.jobs_created, 0);

        let second = scheduler.schedule_due_work(now).await.unwrap();
        assert_eq!(second.config_errors, 10);
        assert_eq!(second.jobs_created, 1);
        assert_eq!(h.store.jobs_for_enrollment(healthy.id).await.unwrap().len(), 1);

        let third = scheduler.schedule_due_work(now + Duration::minutes(5)).await.unwrap();
        assert_eq!(third, ScheduleReport::default());
        assert_eq!(h.events.count_type(DispatchEventType::ConfigurationError), 60);

        // Giving the campaign a profile releases every blocked enrollment.
        let mut campaign = h.store.campaign(broken).unwrap();
        campaign.sending_profile_id = Some(h.profile_id);
        h.store.upsert_campaign(campaign).unwrap();
        let fixed = scheduler.schedule_due_work(now + Duration::minutes(10)).await.unwrap();
        assert_eq!(fixed.jobs_created, 50);
    }

    #[tokio::test]
    async fn test_busy_profile_does_not_fill_the_batch() {
        let h = Harness::new(&[0], 100, 0);
        let busy = h.add_campaign(Some(h.add_inactive_profile()));
        let waiting = h.enroll_many(busy, 60, t0()).await;
        let healthy = h.enroll_lead("Ada", t0() + Duration::minutes(1)).await;

        let scheduler = h.scheduler();
        let now = t0() + Duration::minutes(1);
        let report = scheduler.schedule_due_work(now).await.unwrap();
        assert_eq!(report.scanned, 61);
        assert_eq!(report.no_mailbox, 60);
        assert_eq!(report.jobs_created, 1);
        assert_eq!(report.config_errors, 0);
        assert_eq!(h.store.jobs_for_enrollment(healthy.id).await.unwrap().len(), 1);

        // Capacity skips are transient: the same enrollments come back.
        let again = scheduler.schedule_due_work(now + Duration::minutes(1)).await.unwrap();
        assert_eq!(again.no_mailbox, 60);
        let e = h.store.get_enrollment(waiting[0].id).await.unwrap().unwrap();
        assert!(e.blocked_reason.is_none());
        assert_eq!(e.updated_at, waiting[0].updated_at);
    }

    #[tokio::test]
    async fn test_scan_stops_at_max_scan() {
        let h = Harness::new(&[0], 100, 0);
        let busy = h.add_campaign(Some(h.add_inactive_profile()));
        h.enroll_many(busy, 20, t0()).await;

        let config = SchedulerConfig {
            batch_size: 5,
            max_scan: 12,
            ..SchedulerConfig::default()
        };
        let report = h.scheduler_with(&config).schedule_due_work(t0()).await.unwrap();
        assert_eq!(report.scanned, 12);
        assert_eq!(report.no_mailbox, 12);
    }

    #[tokio::test]
    async fn test_missing_profile_record_is_config_error() {
        let h = Harness::new(&[0], 100, 0);
        h.enroll_lead("Ada", t0()).await;
        h.set_profile(Some(Uuid::new_v4()));

        let report = h.scheduler().schedule_due_work(t0()).await.unwrap();
        assert_eq!(report.config_errors, 1);
        assert_eq!(report.no_mailbox, 0);
    }

    #[tokio::test]
    async fn test_no_mailbox_leaves_enrollment_untouched() {
        let h = Harness::new(&[0], 100, 0);
        let e = h.enroll_lead("Ada", t0()).await;
        h.set_mailbox_active(false);

        let report = h.scheduler().schedule_due_work(t0()).await.unwrap();
        assert_eq!(report.no_mailbox, 1);
        assert!(h.store.jobs().is_empty());
        assert_eq!(h.store.get_enrollment(e.id).await.unwrap().unwrap().updated_at, e.updated_at);

        h.set_mailbox_active(true);
        assert_eq!(h.scheduler().schedule_due_work(t0()).await.unwrap().jobs_created, 1);
    }

    #[tokio::test]
    async fn test_paused_campaign_produces_no_work() {
        let h = Harness::new(&[0], 100, 0);
        h.enroll_lead("Ada", t0()).await;
        h.store.set_campaign_status(h.campaign_id, CampaignStatus::Paused).unwrap();
        assert_eq!(h.scheduler().schedule_due_work(t0()).await.unwrap().scanned, 0);
    }

    #[tokio::test]
    async fn test_missing_lead_is_config_error() {
        let h = Harness::new(&[0], 100, 0);
        let e = h.enroll_lead("Ada", t0()).await;
        h.store.remove_lead(e.lead_id);

        let report = h.scheduler().schedule_due_work(t0()).await.unwrap();
        assert_eq!(report.config_errors, 1);
        assert!(h.store.jobs().is_empty());

        // Re-importing the lead gives the enrollment another chance.
        h.store.upsert_lead(campaign_core::types::Lead {
            id: e.lead_id,
            email: "ada@example.com".to_string(),
            first_name: Some("Ada".to_string()),
            ..Default::default()
        });
        assert_eq!(h.scheduler().schedule_due_work(t0()).await.unwrap().jobs_created, 1);
    }
}
