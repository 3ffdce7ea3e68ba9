//! In-memory dispatch store backed by DashMap and a single ledger lock.
//!
//! Production: replace with PostgreSQL (one transaction per trait method,
//! `FOR UPDATE SKIP LOCKED` on job claims and a per-mailbox advisory lock
//! around the quota check). This provides the same API surface for
//! development and testing.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::types::{
    start_of_utc_day, Availability, Campaign, CampaignEnrollment, CampaignStatus, EmailJob,
    EmailMessage, EnrollmentStatus, EnrollmentUpdate, JobStatus, Lead, MailboxUsage, SendReceipt,
    SendingDomain, SendingMailbox, SendingProfile,
};

use crate::store::{ClaimOutcome, DispatchStore, DueKey, JobInsert, RecordedSend, SlotAdmission};

/// Thread-safe in-memory store for sending configuration, campaigns, leads,
/// enrollments, jobs and the message log.
pub struct MemoryStore {
    domains: DashMap<Uuid, SendingDomain>,
    mailboxes: DashMap<Uuid, SendingMailbox>,
    profiles: DashMap<Uuid, SendingProfile>,
    campaigns: DashMap<Uuid, Campaign>,
    leads: DashMap<Uuid, Lead>,
    ledger: Mutex<Ledger>,
}

/// Everything that must change together lives behind one lock.
#[derive(Default)]
struct Ledger {
    enrollments: HashMap<Uuid, CampaignEnrollment>,
    jobs: HashMap<Uuid, EmailJob>,
    /// Job holding each (enrollment, step) slot until it is `Sent`.
    open_slots: HashMap<(Uuid, u32), Uuid>,
    /// Message log per mailbox, ordered by `sent_at`.
    messages: HashMap<Uuid, Vec<EmailMessage>>,
    /// `Sending` claims per mailbox: job id -> claimed at.
    in_flight: HashMap<Uuid, HashMap<Uuid, DateTime<Utc>>>,
}

impl Ledger {
    fn usage(&self, mailbox_id: Uuid, now: DateTime<Utc>) -> MailboxUsage {
        let day_start = start_of_utc_day(now);
        let mut usage = MailboxUsage::default();
        if let Some(log) = self.messages.get(&mailbox_id) {
            usage.sent_today = log.iter().rev().take_while(|m| m.sent_at >= day_start).count() as u32;
            usage.last_send_at = log.last().map(|m| m.sent_at);
        }
        if let Some(claims) = self.in_flight.get(&mailbox_id) {
            for claimed_at in claims.values() {
                if *claimed_at >= day_start {
                    usage.in_flight += 1;
                }
                usage.last_send_at = usage.last_send_at.max(Some(*claimed_at));
            }
        }
        usage
    }

    fn append_message(&mut self, message: EmailMessage) {
        let log = self.messages.entry(message.mailbox_id).or_default();
        let at = log.partition_point(|m| m.sent_at <= message.sent_at);
        log.insert(at, message);
    }

    fn release_claim(&mut self, mailbox_id: Uuid, job_id: Uuid) {
        if let Some(claims) = self.in_flight.get_mut(&mailbox_id) {
            claims.remove(&job_id);
            if claims.is_empty() {
                self.in_flight.remove(&mailbox_id);
            }
        }
    }

    fn job_mut(&mut self, id: Uuid) -> CampaignResult<&mut EmailJob> {
        self.jobs.get_mut(&id).ok_or_else(|| CampaignError::not_found("job", id))
    }

    fn enrollment_mut(&mut self, id: Uuid) -> CampaignResult<&mut CampaignEnrollment> {
        self.enrollments
            .get_mut(&id)
            .ok_or_else(|| CampaignError::not_found("enrollment", id))
    }

    fn unblock_where(&mut self, selects: impl Fn(&CampaignEnrollment) -> bool, now: DateTime<Utc>) -> usize {
        let mut released = 0;
        for enrollment in self.enrollments.values_mut() {
            if selects(enrollment) && enrollment.unblock(now) {
                released += 1;
            }
        }
        released
    }
}

fn expect_claim(job: &EmailJob, claim_id: Uuid) -> CampaignResult<()> {
    expect_status(job, JobStatus::Sending)?;
    if job.claim_id == Some(claim_id) {
        Ok(())
    } else {
        Err(CampaignError::Conflict(format!(
            "job {} is held by another claim",
            job.id
        )))
    }
}

fn expect_status(job: &EmailJob, expected: JobStatus) -> CampaignResult<()> {
    if job.status == expected {
        Ok(())
    } else {
        Err(CampaignError::Conflict(format!(
            "job {} is {:?}, expected {:?}",
            job.id, job.status, expected
        )))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Dispatch store initialized (in-memory, development mode)");
        Self {
            domains: DashMap::new(),
            mailboxes: DashMap::new(),
            profiles: DashMap::new(),
            campaigns: DashMap::new(),
            leads: DashMap::new(),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    // ─── Operator configuration ────────────────────────────────────────────

    pub fn upsert_domain(&self, domain: SendingDomain) {
        self.domains.insert(domain.id, domain);
    }

    pub fn upsert_mailbox(&self, mailbox: SendingMailbox) {
        self.mailboxes.insert(mailbox.id, mailbox);
    }

    pub fn upsert_profile(&self, profile: SendingProfile) {
        let profile_id = profile.id;
        self.profiles.insert(profile_id, profile);
        let campaigns: Vec<Uuid> = self
            .campaigns
            .iter()
            .filter(|c| c.sending_profile_id == Some(profile_id))
            .map(|c| c.id)
            .collect();
        self.unblock(|e| campaigns.contains(&e.campaign_id));
    }

    /// Rejects campaigns whose steps fail [`Campaign::validate`].
    pub fn upsert_campaign(&self, campaign: Campaign) -> CampaignResult<()> {
        campaign.validate()?;
        info!(campaign_id = %campaign.id, name = %campaign.name, steps = campaign.steps.len(), "Storing campaign");
        let campaign_id = campaign.id;
        self.campaigns.insert(campaign_id, campaign);
        self.unblock(|e| e.campaign_id == campaign_id);
        Ok(())
    }

    pub fn upsert_lead(&self, lead: Lead) {
        let lead_id = lead.id;
        self.leads.insert(lead_id, lead);
        self.unblock(|e| e.lead_id == lead_id);
    }

    /// Gives blocked enrollments touched by a configuration change another look.
    fn unblock(&self, selects: impl Fn(&CampaignEnrollment) -> bool) {
        let released = self.ledger.lock().unblock_where(selects, Utc::now());
        if released > 0 {
            info!(enrollments = released, "Configuration updated, blocked enrollments released");
        }
    }

    /// Drops a lead deleted on the CRM side. Its enrollments stay and are
    /// reported as configuration errors by the scheduler.
    pub fn remove_lead(&self, id: Uuid) -> Option<Lead> {
        self.leads.remove(&id).map(|(_, lead)| lead)
    }

    pub fn set_campaign_status(&self, id: Uuid, status: CampaignStatus) -> CampaignResult<Campaign> {
        let mut entry = self
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| CampaignError::not_found("campaign", id))?;
        info!(campaign_id = %id, ?status, "Updating campaign status");
        entry.status = status;
        Ok(entry.clone())
    }

    pub fn set_mailbox_active(&self, id: Uuid, active: bool) -> CampaignResult<SendingMailbox> {
        let mut entry = self
            .mailboxes
            .get_mut(&id)
            .ok_or_else(|| CampaignError::not_found("mailbox", id))?;
        info!(mailbox_id = %id, email = %entry.email, active, "Updating mailbox state");
        entry.is_active = active;
        Ok(entry.clone())
    }

    pub fn campaign(&self, id: Uuid) -> Option<Campaign> {
        self.campaigns.get(&id).map(|r| r.value().clone())
    }

    /// Backfills the message log, e.g. with sends made before this store
    /// took over a mailbox.
    pub fn import_message(&self, message: EmailMessage) {
        self.ledger.lock().append_message(message);
    }

    // ─── Reporting ─────────────────────────────────────────────────────────

    pub fn jobs(&self) -> Vec<EmailJob> {
        let mut jobs: Vec<EmailJob> = self.ledger.lock().jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn enrollments(&self) -> Vec<CampaignEnrollment> {
        let mut enrollments: Vec<CampaignEnrollment> =
            self.ledger.lock().enrollments.values().cloned().collect();
        enrollments.sort_by_key(|e| e.enrolled_at);
        enrollments
    }

    pub fn messages(&self) -> Vec<EmailMessage> {
        let ledger = self.ledger.lock();
        let mut messages: Vec<EmailMessage> = ledger.messages.values().flatten().cloned().collect();
        messages.sort_by_key(|m| m.sent_at);
        messages
    }

    fn transition_enrollment(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut CampaignEnrollment) -> CampaignResult<()>,
    ) -> CampaignResult<CampaignEnrollment> {
        let mut ledger = self.ledger.lock();
        let enrollment = ledger.enrollment_mut(id)?;
        apply(enrollment)?;
        enrollment.updated_at = now;
        info!(enrollment_id = %id, status = ?enrollment.status, "Enrollment status changed");
        Ok(enrollment.clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DispatchStore for MemoryStore {
    async fn get_campaign(&self, id: Uuid) -> CampaignResult<Option<Campaign>> {
        Ok(self.campaigns.get(&id).map(|r| r.value().clone()))
    }

    async fn get_lead(&self, id: Uuid) -> CampaignResult<Option<Lead>> {
        Ok(self.leads.get(&id).map(|r| r.value().clone()))
    }

    async fn get_profile(&self, id: Uuid) -> CampaignResult<Option<SendingProfile>> {
        Ok(self.profiles.get(&id).map(|r| r.value().clone()))
    }

    async fn get_mailbox(&self, id: Uuid) -> CampaignResult<Option<SendingMailbox>> {
        Ok(self.mailboxes.get(&id).map(|r| r.value().clone()))
    }

    async fn get_domain(&self, id: Uuid) -> CampaignResult<Option<SendingDomain>> {
        Ok(self.domains.get(&id).map(|r| r.value().clone()))
    }

    async fn get_enrollment(&self, id: Uuid) -> CampaignResult<Option<CampaignEnrollment>> {
        Ok(self.ledger.lock().enrollments.get(&id).cloned())
    }

    async fn get_job(&self, id: Uuid) -> CampaignResult<Option<EmailJob>> {
        Ok(self.ledger.lock().jobs.get(&id).cloned())
    }

    async fn jobs_for_enrollment(&self, enrollment_id: Uuid) -> CampaignResult<Vec<EmailJob>> {
        let ledger = self.ledger.lock();
        let mut jobs: Vec<EmailJob> = ledger
            .jobs
            .values()
            .filter(|j| j.enrollment_id == enrollment_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.step_number, j.created_at));
        Ok(jobs)
    }

    async fn messages_for_mailbox(
        &self,
        mailbox_id: Uuid,
        since: DateTime<Utc>,
    ) -> CampaignResult<Vec<EmailMessage>> {
        let ledger = self.ledger.lock();
        Ok(ledger
            .messages
            .get(&mailbox_id)
            .map(|log| log.iter().filter(|m| m.sent_at >= since).cloned().collect())
            .unwrap_or_default())
    }

    async fn mailbox_usage(&self, mailbox_id: Uuid, now: DateTime<Utc>) -> CampaignResult<MailboxUsage> {
        Ok(self.ledger.lock().usage(mailbox_id, now))
    }

    async fn enroll(
        &self,
        campaign_id: Uuid,
        lead_id: Uuid,
        now: DateTime<Utc>,
    ) -> CampaignResult<CampaignEnrollment> {
        let campaign = self
            .campaigns
            .get(&campaign_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| CampaignError::not_found("campaign", campaign_id))?;
        if campaign.steps.is_empty() {
            return Err(CampaignError::Conflict(format!("campaign {campaign_id} has no steps")));
        }
        if !self.leads.contains_key(&lead_id) {
            return Err(CampaignError::not_found("lead", lead_id));
        }
        let next_send_at = match campaign.step(1) {
            Some(step) => step.due_after(now).ok_or_else(|| {
                CampaignError::Config(format!("campaign {campaign_id}: step 1 delay is out of range"))
            })?,
            None => now,
        };

        let mut ledger = self.ledger.lock();
        if ledger
            .enrollments
            .values()
            .any(|e| e.campaign_id == campaign_id && e.lead_id == lead_id)
        {
            return Err(CampaignError::Conflict(format!(
                "lead {lead_id} is already enrolled in campaign {campaign_id}"
            )));
        }
        let enrollment = CampaignEnrollment {
            id: Uuid::new_v4(),
            campaign_id,
            lead_id,
            status: EnrollmentStatus::Active,
            current_step_number: 1,
            next_send_at: Some(next_send_at),
            last_sent_at: None,
            blocked_reason: None,
            blocked_at: None,
            enrolled_at: now,
            updated_at: now,
        };
        info!(
            enrollment_id = %enrollment.id,
            campaign_id = %campaign_id,
            lead_id = %lead_id,
            "Lead enrolled in campaign"
        );
        ledger.enrollments.insert(enrollment.id, enrollment.clone());
        Ok(enrollment)
    }

    async fn pause_enrollment(&self, id: Uuid, now: DateTime<Utc>) -> CampaignResult<CampaignEnrollment> {
        self.transition_enrollment(id, now, |e| match e.status {
            EnrollmentStatus::Active => {
                e.status = EnrollmentStatus::Paused;
                Ok(())
            }
            other => Err(CampaignError::Conflict(format!("cannot pause enrollment {id} in {other:?}"))),
        })
    }

    async fn resume_enrollment(&self, id: Uuid, now: DateTime<Utc>) -> CampaignResult<CampaignEnrollment> {
        self.transition_enrollment(id, now, |e| match e.status {
            EnrollmentStatus::Paused => {
                e.status = EnrollmentStatus::Active;
                if e.next_send_at.is_none() {
                    e.next_send_at = Some(now);
                }
                Ok(())
            }
            other => Err(CampaignError::Conflict(format!("cannot resume enrollment {id} in {other:?}"))),
        })
    }

    async fn stop_enrollment(&self, id: Uuid, now: DateTime<Utc>) -> CampaignResult<CampaignEnrollment> {
        self.transition_enrollment(id, now, |e| match e.status {
            EnrollmentStatus::Completed => {
                Err(CampaignError::Conflict(format!("enrollment {id} already completed")))
            }
            _ => {
                e.status = EnrollmentStatus::Stopped;
                e.next_send_at = None;
                Ok(())
            }
        })
    }

    async fn due_enrollments(
        &self,
        now: DateTime<Utc>,
        after: Option<DueKey>,
        limit: usize,
    ) -> CampaignResult<Vec<CampaignEnrollment>> {
        let ledger = self.ledger.lock();
        let mut due: Vec<(DueKey, CampaignEnrollment)> = ledger
            .enrollments
            .values()
            .filter(|e| e.is_due(now))
            .filter_map(|e| DueKey::of(e).map(|key| (key, e)))
            .filter(|(key, _)| after.map_or(true, |after| *key > after))
            .filter(|(_, e)| !ledger.open_slots.contains_key(&(e.id, e.current_step_number)))
            // A missing campaign stays visible so the scheduler can report it.
            .filter(|(_, e)| {
                self.campaigns
                    .get(&e.campaign_id)
                    .map_or(true, |c| c.status == CampaignStatus::Active)
            })
            .map(|(key, e)| (key, e.clone()))
            .collect();
        due.sort_by_key(|(key, _)| *key);
        due.truncate(limit);
        Ok(due.into_iter().map(|(_, e)| e).collect())
    }

    async fn block_enrollment(&self, id: Uuid, reason: String, now: DateTime<Utc>) -> CampaignResult<bool> {
        let mut ledger = self.ledger.lock();
        let enrollment = ledger.enrollment_mut(id)?;
        if enrollment.status != EnrollmentStatus::Active {
            return Ok(false);
        }
        enrollment.block(reason, now);
        Ok(true)
    }

    async fn complete_enrollment(&self, id: Uuid, now: DateTime<Utc>) -> CampaignResult<bool> {
        let mut ledger = self.ledger.lock();
        let enrollment = ledger.enrollment_mut(id)?;
        if enrollment.status != EnrollmentStatus::Active {
            return Ok(false);
        }
        enrollment.complete(now);
        Ok(true)
    }

    async fn create_job(&self, job: EmailJob) -> CampaignResult<JobInsert> {
        let mut ledger = self.ledger.lock();
        let slot = (job.enrollment_id, job.step_number);
        if let Some(existing) = ledger.open_slots.get(&slot) {
            return Ok(JobInsert::AlreadyPending {
                existing_job_id: *existing,
            });
        }
        let enrollment = ledger
            .enrollments
            .get(&job.enrollment_id)
            .ok_or_else(|| CampaignError::not_found("enrollment", job.enrollment_id))?;
        if enrollment.status != EnrollmentStatus::Active
            || enrollment.current_step_number != job.step_number
        {
            return Ok(JobInsert::Stale);
        }
        debug!(job_id = %job.id, enrollment_id = %job.enrollment_id, step = job.step_number, "Job queued");
        ledger.open_slots.insert(slot, job.id);
        ledger.jobs.insert(job.id, job);
        Ok(JobInsert::Created)
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> CampaignResult<Vec<EmailJob>> {
        let ledger = self.ledger.lock();
        let mut due: Vec<EmailJob> = ledger.jobs.values().filter(|j| j.is_ready(now)).cloned().collect();
        due.sort_by_key(|j| (j.next_attempt_at.unwrap_or(j.scheduled_at), j.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_job(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        admission: &dyn SlotAdmission,
    ) -> CampaignResult<ClaimOutcome> {
        let mut guard = self.ledger.lock();
        let ledger = &mut *guard;
        let mailbox_id = match ledger.jobs.get(&id) {
            Some(job) if job.is_ready(now) => job.mailbox_id,
            _ => return Ok(ClaimOutcome::Unavailable),
        };

        let mailbox = self.mailboxes.get(&mailbox_id).map(|r| r.value().clone());
        let domain = mailbox
            .as_ref()
            .and_then(|m| self.domains.get(&m.domain_id).map(|r| r.value().clone()));
        let usage = ledger.usage(mailbox_id, now);
        if let Availability::Refused { refusal } = admission.admit(mailbox.as_ref(), domain.as_ref(), &usage, now) {
            return Ok(ClaimOutcome::Refused(refusal));
        }

        let job = ledger.job_mut(id)?;
        job.status = JobStatus::Sending;
        job.claim_id = Some(Uuid::new_v4());
        job.claimed_at = Some(now);
        job.lease_expires_at = Some(lease_until);
        job.deferral_reason = None;
        job.updated_at = now;
        let claimed = job.clone();
        ledger.in_flight.entry(mailbox_id).or_default().insert(id, now);
        Ok(ClaimOutcome::Claimed(claimed))
    }

    async fn defer_job(
        &self,
        id: Uuid,
        reason: String,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CampaignResult<EmailJob> {
        let mut ledger = self.ledger.lock();
        let job = ledger.job_mut(id)?;
        expect_status(job, JobStatus::Queued)?;
        job.next_attempt_at = Some(next_attempt_at);
        job.deferral_reason = Some(reason);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn record_send_failure(
        &self,
        id: Uuid,
        claim_id: Uuid,
        error: String,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CampaignResult<EmailJob> {
        let mut ledger = self.ledger.lock();
        let job = ledger.job_mut(id)?;
        expect_claim(job, claim_id)?;
        job.status = JobStatus::Failed;
        job.claim_id = None;
        job.attempt_count += 1;
        job.last_error = Some(error);
        job.next_attempt_at = Some(next_attempt_at);
        job.lease_expires_at = None;
        job.updated_at = now;
        let failed = job.clone();
        ledger.release_claim(failed.mailbox_id, id);
        Ok(failed)
    }

    async fn record_send_success(
        &self,
        id: Uuid,
        claim_id: Uuid,
        receipt: SendReceipt,
        update: EnrollmentUpdate,
    ) -> CampaignResult<RecordedSend> {
        let mut guard = self.ledger.lock();
        let ledger = &mut *guard;

        // Validate everything before the first mutation.
        let job = ledger.jobs.get_mut(&id).ok_or_else(|| CampaignError::not_found("job", id))?;
        expect_claim(job, claim_id)?;
        let enrollment = ledger
            .enrollments
            .get_mut(&job.enrollment_id)
            .ok_or_else(|| CampaignError::not_found("enrollment", job.enrollment_id))?;

        let sent_at = job.claimed_at.unwrap_or(receipt.accepted_at);
        job.status = JobStatus::Sent;
        job.claim_id = None;
        job.sent_at = Some(receipt.accepted_at);
        job.lease_expires_at = None;
        job.next_attempt_at = None;
        job.updated_at = receipt.accepted_at;

        let enrollment_updated = enrollment.apply_update(job.step_number, update, receipt.accepted_at);
        if !enrollment_updated {
            warn!(
                job_id = %id,
                enrollment_id = %enrollment.id,
                job_step = job.step_number,
                current_step = enrollment.current_step_number,
                "Sent job no longer matches enrollment cursor"
            );
        }

        let message = EmailMessage {
            id: Uuid::new_v4(),
            job_id: id,
            enrollment_id: job.enrollment_id,
            mailbox_id: job.mailbox_id,
            provider_message_id: receipt.provider_message_id,
            from_email: job.from_email.clone(),
            to_email: job.to_email.clone(),
            subject: job.subject.clone(),
            sent_at,
            accepted_at: receipt.accepted_at,
        };
        let job = job.clone();
        let enrollment = enrollment.clone();

        let slot = (job.enrollment_id, job.step_number);
        if ledger.open_slots.get(&slot) == Some(&id) {
            ledger.open_slots.remove(&slot);
        }
        ledger.release_claim(job.mailbox_id, id);
        ledger.append_message(message.clone());

        Ok(RecordedSend {
            job,
            message,
            enrollment,
            enrollment_updated,
        })
    }

    async fn skip_failed_job(
        &self,
        id: Uuid,
        update: EnrollmentUpdate,
        now: DateTime<Utc>,
    ) -> CampaignResult<bool> {
        if !matches!(update, EnrollmentUpdate::SkipStep { .. }) {
            return Err(CampaignError::Conflict(format!("job {id}: only a step skip may resolve a failed job")));
        }
        let mut guard = self.ledger.lock();
        let ledger = &mut *guard;
        let job = ledger.jobs.get_mut(&id).ok_or_else(|| CampaignError::not_found("job", id))?;
        expect_status(job, JobStatus::Failed)?;
        job.next_attempt_at = None;
        job.updated_at = now;

        let slot = (job.enrollment_id, job.step_number);
        if ledger.open_slots.get(&slot) == Some(&id) {
            ledger.open_slots.remove(&slot);
        }
        let enrollment = ledger.enrollment_mut(slot.0)?;
        let moved = enrollment.apply_update(slot.1, update, now);
        info!(
            job_id = %id,
            enrollment_id = %slot.0,
            step = slot.1,
            moved,
            "Failed job given up, step skipped"
        );
        Ok(moved)
    }

    async fn release_expired_leases(&self, now: DateTime<Utc>) -> CampaignResult<Vec<EmailJob>> {
        let mut guard = self.ledger.lock();
        let ledger = &mut *guard;
        let mut released = Vec::new();
        for job in ledger.jobs.values_mut() {
            let expired = job.status == JobStatus::Sending && job.lease_expires_at.is_some_and(|at| at <= now);
            if !expired {
                continue;
            }
            job.status = JobStatus::Queued;
            job.claim_id = None;
            job.lease_expires_at = None;
            job.next_attempt_at = None;
            job.last_error = Some("lease expired while sending".to_string());
            job.updated_at = now;
            released.push(job.clone());
        }
        for job in &released {
            ledger.release_claim(job.mailbox_id, job.id);
        }
        Ok(released)
    }

    async fn requeue_failed(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> CampaignResult<Vec<EmailJob>> {
        let mut ledger = self.ledger.lock();
        let mut eligible: Vec<(DateTime<Utc>, Uuid)> = ledger
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Failed && j.attempt_count < max_attempts)
            .filter_map(|j| match j.next_attempt_at {
                Some(at) if at > now => None,
                at => Some((at.unwrap_or(j.updated_at), j.id)),
            })
            .collect();
        eligible.sort();
        eligible.truncate(limit);

        let mut requeued = Vec::with_capacity(eligible.len());
        for (_, id) in eligible {
            let job = ledger.job_mut(id)?;
            job.status = JobStatus::Queued;
            job.next_attempt_at = None;
            job.updated_at = now;
            requeued.push(job.clone());
        }
        Ok(requeued)
    }

    async fn requeue_job(&self, id: Uuid, now: DateTime<Utc>) -> CampaignResult<EmailJob> {
        let mut ledger = self.ledger.lock();
        let (enrollment_id, step) = ledger
            .jobs
            .get(&id)
            .map(|j| (j.enrollment_id, j.step_number))
            .ok_or_else(|| CampaignError::not_found("job", id))?;
        if ledger.open_slots.get(&(enrollment_id, step)) != Some(&id) {
            return Err(CampaignError::Conflict(format!(
                "job {id}: enrollment {enrollment_id} has moved past step {step}"
            )));
        }
        let job = ledger.job_mut(id)?;
        expect_status(job, JobStatus::Failed)?;
        job.status = JobStatus::Queued;
        job.next_attempt_at = None;
        job.updated_at = now;
        info!(job_id = %id, attempts = job.attempt_count, "Job re-queued by operator");
        Ok(job.clone())
    }
}
