//! The enrollment store contract.
//!
//! Every method is a single transaction against the backing store. The
//! methods that mutate job or enrollment state re-validate the state they
//! transition from, so callers racing on the same row see `Conflict` or
//! `Unavailable` instead of a double transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use campaign_core::error::CampaignResult;
use campaign_core::types::{
    Availability, Campaign, CampaignEnrollment, EmailJob, EmailMessage, EnrollmentUpdate, Lead,
    MailboxUsage, Refusal, SendReceipt, SendingDomain, SendingMailbox, SendingProfile,
};

/// Decides whether a mailbox may take one more send given its usage.
///
/// Invoked by [`DispatchStore::claim_job`] while the store holds the lock
/// (or transaction) that also records the claim, so the decision and the
/// reservation cannot interleave with another claimer.
pub trait SlotAdmission: Send + Sync {
    fn admit(
        &self,
        mailbox: Option<&SendingMailbox>,
        domain: Option<&SendingDomain>,
        usage: &MailboxUsage,
        now: DateTime<Utc>,
    ) -> Availability;
}

/// Position in the due-enrollment order, used to page past enrollments a
/// scheduler cycle has already looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DueKey {
    pub next_send_at: DateTime<Utc>,
    pub enrolled_at: DateTime<Utc>,
    pub id: Uuid,
}

impl DueKey {
    pub fn of(enrollment: &CampaignEnrollment) -> Option<Self> {
        enrollment.next_send_at.map(|next_send_at| DueKey {
            next_send_at,
            enrolled_at: enrollment.enrolled_at,
            id: enrollment.id,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobInsert {
    Created,
    /// Another job already holds the (enrollment, step) slot.
    AlreadyPending { existing_job_id: Uuid },
    /// The enrollment left `Active` or moved past the job's step since it
    /// was read.
    Stale,
}

#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The job is now `Sending` and holds a lease and a quota slot.
    Claimed(EmailJob),
    /// The mailbox has no capacity; the job is untouched.
    Refused(Refusal),
    /// The job is gone or no longer `Queued` (another worker took it).
    Unavailable,
}

/// Result of recording a provider-accepted send.
#[derive(Debug, Clone)]
pub struct RecordedSend {
    pub job: EmailJob,
    pub message: EmailMessage,
    pub enrollment: CampaignEnrollment,
    /// `false` when the enrollment cursor had already moved past the job's step.
    pub enrollment_updated: bool,
}

#[async_trait]
pub trait DispatchStore: Send + Sync {
    // ─── Reads ───────────────────────────────────────────────────────────

    async fn get_campaign(&self, id: Uuid) -> CampaignResult<Option<Campaign>>;
    async fn get_lead(&self, id: Uuid) -> CampaignResult<Option<Lead>>;
    async fn get_profile(&self, id: Uuid) -> CampaignResult<Option<SendingProfile>>;
    async fn get_mailbox(&self, id: Uuid) -> CampaignResult<Option<SendingMailbox>>;
    async fn get_domain(&self, id: Uuid) -> CampaignResult<Option<SendingDomain>>;
    async fn get_enrollment(&self, id: Uuid) -> CampaignResult<Option<CampaignEnrollment>>;
    async fn get_job(&self, id: Uuid) -> CampaignResult<Option<EmailJob>>;
    async fn jobs_for_enrollment(&self, enrollment_id: Uuid) -> CampaignResult<Vec<EmailJob>>;

    /// Messages of one mailbox with `sent_at >= since`, oldest first.
    async fn messages_for_mailbox(
        &self,
        mailbox_id: Uuid,
        since: DateTime<Utc>,
    ) -> CampaignResult<Vec<EmailMessage>>;

    /// Quota consumption of a mailbox for the UTC day containing `now`.
    async fn mailbox_usage(&self, mailbox_id: Uuid, now: DateTime<Utc>) -> CampaignResult<MailboxUsage>;

    // ─── Enrollment triggers ─────────────────────────────────────────────

    /// Enrolls a lead at step 1, due after step 1's delay.
    async fn enroll(
        &self,
        campaign_id: Uuid,
        lead_id: Uuid,
        now: DateTime<Utc>,
    ) -> CampaignResult<CampaignEnrollment>;
    async fn pause_enrollment(&self, id: Uuid, now: DateTime<Utc>) -> CampaignResult<CampaignEnrollment>;
    async fn resume_enrollment(&self, id: Uuid, now: DateTime<Utc>) -> CampaignResult<CampaignEnrollment>;
    async fn stop_enrollment(&self, id: Uuid, now: DateTime<Utc>) -> CampaignResult<CampaignEnrollment>;

    // ─── Scheduler side ──────────────────────────────────────────────────

    /// Active, unblocked, due enrollments of active campaigns whose current
    /// step has no open job, in [`DueKey`] order starting after `after`.
    ///
    /// A job keeps its step open while `Queued`, `Sending` or `Failed` until
    /// it is sent or its step is skipped.
    async fn due_enrollments(
        &self,
        now: DateTime<Utc>,
        after: Option<DueKey>,
        limit: usize,
    ) -> CampaignResult<Vec<CampaignEnrollment>>;

    /// Parks an `Active` enrollment with a configuration problem. It stays
    /// out of due work until the store sees its campaign, the campaign's
    /// profile or its lead updated. Returns `false` if it was not `Active`.
    async fn block_enrollment(&self, id: Uuid, reason: String, now: DateTime<Utc>) -> CampaignResult<bool>;

    /// Marks an exhausted sequence `Completed`. Returns `false` if the
    /// enrollment is no longer `Active`.
    async fn complete_enrollment(&self, id: Uuid, now: DateTime<Utc>) -> CampaignResult<bool>;

    async fn create_job(&self, job: EmailJob) -> CampaignResult<JobInsert>;

    // ─── Worker side ─────────────────────────────────────────────────────

    /// `Queued` jobs ready at `now`, oldest first.
    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> CampaignResult<Vec<EmailJob>>;

    /// Atomically evaluates `admission` against the job's mailbox and, if
    /// allowed, moves the job to `Sending` with a lease until `lease_until`.
    async fn claim_job(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        admission: &dyn SlotAdmission,
    ) -> CampaignResult<ClaimOutcome>;

    /// Pushes a `Queued` job back without counting an attempt.
    async fn defer_job(
        &self,
        id: Uuid,
        reason: String,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CampaignResult<EmailJob>;

    /// Records a provider failure for the claim `claim_id`. `Conflict` if the
    /// job is no longer held under that claim.
    async fn record_send_failure(
        &self,
        id: Uuid,
        claim_id: Uuid,
        error: String,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CampaignResult<EmailJob>;

    /// Marks the job `Sent`, appends the message and applies `update` to the
    /// enrollment as one unit. `Conflict` if the job is no longer held under
    /// `claim_id`.
    async fn record_send_success(
        &self,
        id: Uuid,
        claim_id: Uuid,
        receipt: SendReceipt,
        update: EnrollmentUpdate,
    ) -> CampaignResult<RecordedSend>;

    /// Gives up on a `Failed` job: its step is released and `update` (a
    /// [`EnrollmentUpdate::SkipStep`]) is applied to the enrollment. The job
    /// stays `Failed` for inspection. Returns whether the enrollment moved.
    async fn skip_failed_job(
        &self,
        id: Uuid,
        update: EnrollmentUpdate,
        now: DateTime<Utc>,
    ) -> CampaignResult<bool>;

    // ─── Recovery ────────────────────────────────────────────────────────

    /// Returns `Sending` jobs whose lease expired to `Queued`.
    async fn release_expired_leases(&self, now: DateTime<Utc>) -> CampaignResult<Vec<EmailJob>>;

    /// Returns `Failed` jobs with attempts left and elapsed backoff to `Queued`.
    async fn requeue_failed(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> CampaignResult<Vec<EmailJob>>;

    /// Operator re-queue of a `Failed` job regardless of its attempt count.
    /// `Conflict` once the enrollment has moved past the job's step.
    async fn requeue_job(&self, id: Uuid, now: DateTime<Utc>) -> CampaignResult<EmailJob>;
}
