use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{CampaignError, CampaignResult};

// ─── Sending infrastructure ─────────────────────────────────────────────

/// A verified outbound domain. Deactivating it gates every mailbox under it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendingDomain {
    pub id: Uuid,
    pub domain: String,
    pub is_active: bool,
}

/// Coarse maturity tier of a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupState {
    Cold,
    Warming,
    Warm,
}

/// One outbound sending identity. Operator-managed, read-only to dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendingMailbox {
    pub id: Uuid,
    pub domain_id: Uuid,
    pub email: String,
    pub display_name: String,
    /// Max sends per UTC calendar day.
    pub daily_cap: u32,
    /// Minimum spacing between consecutive sends from this mailbox.
    pub min_delay_seconds: u64,
    pub warmup_state: WarmupState,
    pub is_active: bool,
}

/// Membership of a mailbox in a profile. A weight of zero keeps the mailbox
/// configured but never selected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProfileMailbox {
    pub mailbox_id: Uuid,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Named pool of mailboxes a campaign draws from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendingProfile {
    pub id: Uuid,
    pub name: String,
    pub mailboxes: Vec<ProfileMailbox>,
}

// ─── Campaigns and recipients ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

/// One templated message of a drip sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignStep {
    pub id: Uuid,
    /// 1-based position in the sequence.
    pub order: u32,
    #[serde(default)]
    pub delay_hours: u32,
    #[serde(default)]
    pub delay_minutes: u32,
    pub subject_template: String,
    pub body_template: String,
}

/// Longest delay a step may wait after its predecessor.
pub const MAX_STEP_DELAY_DAYS: i64 = 365;

impl CampaignStep {
    /// Delay after the previous step (or after enrollment for step 1).
    pub fn delay(&self) -> Duration {
        Duration::hours(i64::from(self.delay_hours)) + Duration::minutes(i64::from(self.delay_minutes))
    }

    /// When this step becomes due if its predecessor happened at `from`.
    /// `None` if the instant is not representable.
    pub fn due_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        from.checked_add_signed(self.delay())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub status: CampaignStatus,
    pub sending_profile_id: Option<Uuid>,
    pub steps: Vec<CampaignStep>,
}

impl Campaign {
    /// Looks up the step with the given 1-based order.
    pub fn step(&self, order: u32) -> Option<&CampaignStep> {
        self.steps.iter().find(|s| s.order == order)
    }

    pub fn validate(&self) -> CampaignResult<()> {
        let max = Duration::days(MAX_STEP_DELAY_DAYS);
        for step in &self.steps {
            if step.order == 0 {
                return Err(CampaignError::Config(format!(
                    "campaign {}: step orders start at 1",
                    self.id
                )));
            }
            if step.delay() > max {
                return Err(CampaignError::Config(format!(
                    "campaign {}: step {} delay exceeds {MAX_STEP_DELAY_DAYS} days",
                    self.id, step.order
                )));
            }
        }
        Ok(())
    }
}

/// Recipient record supplied by the CRM side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub custom_fields: HashMap<String, String>,
}

impl Lead {
    /// Flattens the lead into the variable map handed to template rendering.
    /// Custom fields never shadow the built-in names.
    pub fn template_variables(&self) -> HashMap<String, String> {
        let mut vars = self.custom_fields.clone();
        vars.insert("email".to_string(), self.email.clone());
        let builtins = [
            ("first_name", &self.first_name),
            ("last_name", &self.last_name),
            ("company", &self.company),
        ];
        for (name, value) in builtins {
            vars.insert(name.to_string(), value.clone().unwrap_or_default());
        }
        vars
    }
}

// ─── Enrollment state machine ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Stopped,
    Completed,
}

/// Per-recipient cursor through a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignEnrollment {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub lead_id: Uuid,
    pub status: EnrollmentStatus,
    /// The step about to be attempted.
    pub current_step_number: u32,
    pub next_send_at: Option<DateTime<Utc>>,
    pub last_sent_at: Option<DateTime<Utc>>,
    /// Configuration problem that keeps this enrollment out of due work
    /// until the campaign, its profile or the lead is updated.
    #[serde(default)]
    pub blocked_reason: Option<String>,
    #[serde(default)]
    pub blocked_at: Option<DateTime<Utc>>,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How a resolved job moves an enrollment forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EnrollmentUpdate {
    /// The step was sent and another one follows.
    Advance { next_send_at: DateTime<Utc> },
    /// The step was sent and was the last one.
    Complete,
    /// The step was given up on without a send. Without a following step
    /// the sequence ends.
    SkipStep { next_send_at: Option<DateTime<Utc>> },
}

impl CampaignEnrollment {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EnrollmentStatus::Active
            && self.blocked_reason.is_none()
            && self.next_send_at.is_some_and(|at| at <= now)
    }

    /// Applies the resolution of the job for `job_step`.
    ///
    /// Returns `false` and leaves the cursor untouched when `job_step` is not
    /// the current step, so a stale job can never move the cursor.
    pub fn apply_update(&mut self, job_step: u32, update: EnrollmentUpdate, now: DateTime<Utc>) -> bool {
        if job_step != self.current_step_number {
            return false;
        }
        self.updated_at = now;
        match update {
            EnrollmentUpdate::Advance { next_send_at } => {
                self.last_sent_at = Some(now);
                self.move_to_next_step(Some(next_send_at));
            }
            EnrollmentUpdate::Complete => {
                self.last_sent_at = Some(now);
                self.finish();
            }
            EnrollmentUpdate::SkipStep { next_send_at: Some(at) } => self.move_to_next_step(Some(at)),
            EnrollmentUpdate::SkipStep { next_send_at: None } => self.finish(),
        }
        true
    }

    fn move_to_next_step(&mut self, next_send_at: Option<DateTime<Utc>>) {
        self.current_step_number += 1;
        self.next_send_at = match self.status {
            EnrollmentStatus::Stopped | EnrollmentStatus::Completed => None,
            EnrollmentStatus::Active | EnrollmentStatus::Paused => next_send_at,
        };
    }

    fn finish(&mut self) {
        if self.status != EnrollmentStatus::Stopped {
            self.status = EnrollmentStatus::Completed;
        }
        self.next_send_at = None;
    }

    /// Parks the enrollment until its configuration is fixed.
    pub fn block(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.blocked_reason = Some(reason.into());
        self.blocked_at = Some(now);
        self.updated_at = now;
    }

    /// Returns `true` if a block was lifted.
    pub fn unblock(&mut self, now: DateTime<Utc>) -> bool {
        if self.blocked_reason.take().is_none() {
            return false;
        }
        self.blocked_at = None;
        self.updated_at = now;
        true
    }

    /// Terminal transition taken when the sequence has no step at the cursor.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = EnrollmentStatus::Completed;
        self.next_send_at = None;
        self.updated_at = now;
    }
}

// ─── Jobs and messages ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Sending,
    Sent,
    Failed,
}

impl JobStatus {
    /// `Queued` and `Sending` jobs hold the (enrollment, step) slot.
    pub fn is_pending(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Sending)
    }
}

/// One concrete send attempt with its content snapshotted at schedule time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailJob {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub campaign_id: Uuid,
    pub step_id: Uuid,
    pub step_number: u32,
    pub mailbox_id: Uuid,
    pub from_email: String,
    pub from_name: String,
    pub to_email: String,
    pub subject: String,
    pub body_html: String,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Why the last send-time availability check refused the job.
    pub deferral_reason: Option<String>,
    /// Fencing token of the current `Sending` claim. Outcomes reported
    /// under any other token are rejected.
    #[serde(default)]
    pub claim_id: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailJob {
    /// Whether the worker may pick this job up at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued
            && self.scheduled_at <= now
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Immutable log row of a provider-accepted send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub id: Uuid,
    pub job_id: Uuid,
    pub enrollment_id: Uuid,
    pub mailbox_id: Uuid,
    pub provider_message_id: String,
    pub from_email: String,
    pub to_email: String,
    pub subject: String,
    /// Instant the send slot was reserved; what caps and spacing count.
    pub sent_at: DateTime<Utc>,
    pub accepted_at: DateTime<Utc>,
}

/// Provider acknowledgement of a send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub provider_message_id: String,
    pub accepted_at: DateTime<Utc>,
}

// ─── Availability ───────────────────────────────────────────────────────

/// Current consumption of a mailbox's quota.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxUsage {
    /// Messages logged since the start of the UTC day.
    pub sent_today: u32,
    /// Claims currently `Sending` that were reserved today.
    pub in_flight: u32,
    /// Most recent message or in-flight claim.
    pub last_send_at: Option<DateTime<Utc>>,
}

impl MailboxUsage {
    pub fn used_today(&self) -> u32 {
        self.sent_today + self.in_flight
    }
}

/// Why a mailbox may not send right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Refusal {
    MailboxNotFound,
    MailboxInactive,
    DomainInactive,
    DailyCapReached { used: u32, cap: u32 },
    WarmupCeiling { used: u32, ceiling: u32 },
    MinDelay { remaining_secs: i64 },
}

impl Refusal {
    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Refusal::MailboxNotFound => "mailbox_not_found",
            Refusal::MailboxInactive => "mailbox_inactive",
            Refusal::DomainInactive => "domain_inactive",
            Refusal::DailyCapReached { .. } => "daily_cap",
            Refusal::WarmupCeiling { .. } => "warmup_ceiling",
            Refusal::MinDelay { .. } => "min_delay",
        }
    }
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Refusal::MailboxNotFound => write!(f, "mailbox not found"),
            Refusal::MailboxInactive => write!(f, "mailbox is inactive"),
            Refusal::DomainInactive => write!(f, "sending domain is inactive"),
            Refusal::DailyCapReached { used, cap } => {
                write!(f, "daily cap reached ({used}/{cap})")
            }
            Refusal::WarmupCeiling { used, ceiling } => {
                write!(f, "warmup ceiling reached ({used}/{ceiling})")
            }
            Refusal::MinDelay { remaining_secs } => {
                write!(f, "minimum send delay not elapsed, wait {remaining_secs}s")
            }
        }
    }
}

/// Answer to "may this mailbox send right now?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Availability {
    Allowed,
    Refused { refusal: Refusal },
}

impl Availability {
    pub fn refused(refusal: Refusal) -> Self {
        Availability::Refused { refusal }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Availability::Allowed)
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            Availability::Allowed => None,
            Availability::Refused { refusal } => Some(refusal.to_string()),
        }
    }
}

/// Midnight UTC of the day containing `now`.
pub fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn enrollment(step: u32, now: DateTime<Utc>) -> CampaignEnrollment {
        CampaignEnrollment {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            lead_id: Uuid::new_v4(),
            status: EnrollmentStatus::Active,
            current_step_number: step,
            next_send_at: Some(now),
            last_sent_at: None,
            blocked_reason: None,
            blocked_at: None,
            enrolled_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_advance_moves_cursor_forward() {
        let now = Utc::now();
        let mut e = enrollment(1, now);
        let next = now + Duration::hours(24);
        assert!(e.apply_update(1, EnrollmentUpdate::Advance { next_send_at: next }, now));
        assert_eq!(e.current_step_number, 2);
        assert_eq!(e.next_send_at, Some(next));
        assert_eq!(e.last_sent_at, Some(now));
        assert_eq!(e.status, EnrollmentStatus::Active);
    }

    #[test]
    fn test_complete_clears_next_send() {
        let now = Utc::now();
        let mut e = enrollment(2, now);
        assert!(e.apply_update(2, EnrollmentUpdate::Complete, now));
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert!(e.next_send_at.is_none());
        assert_eq!(e.current_step_number, 2);
    }

    #[test]
    fn test_stale_step_is_ignored() {
        let now = Utc::now();
        let mut e = enrollment(3, now);
        let applied = e.apply_update(2, EnrollmentUpdate::Advance { next_send_at: now }, now);
        assert!(!applied);
        assert_eq!(e.current_step_number, 3);
        assert!(e.last_sent_at.is_none());
    }

    #[test]
    fn test_paused_enrollment_advances_but_stays_paused() {
        let now = Utc::now();
        let mut e = enrollment(1, now);
        e.status = EnrollmentStatus::Paused;
        e.apply_update(1, EnrollmentUpdate::Advance { next_send_at: now }, now);
        assert_eq!(e.status, EnrollmentStatus::Paused);
        assert_eq!(e.current_step_number, 2);
        assert!(!e.is_due(now));
    }

    #[test]
    fn test_skip_step_moves_on_without_a_send() {
        let now = Utc::now();
        let mut e = enrollment(1, now);
        let next = now + Duration::hours(48);
        assert!(e.apply_update(1, EnrollmentUpdate::SkipStep { next_send_at: Some(next) }, now));
        assert_eq!(e.current_step_number, 2);
        assert_eq!(e.next_send_at, Some(next));
        assert!(e.last_sent_at.is_none());

        assert!(e.apply_update(2, EnrollmentUpdate::SkipStep { next_send_at: None }, now));
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert!(e.next_send_at.is_none());
    }

    #[test]
    fn test_blocked_enrollment_is_not_due_until_unblocked() {
        let now = Utc::now();
        let mut e = enrollment(1, now);
        e.block("campaign has no sending profile", now);
        assert!(!e.is_due(now));
        assert!(e.unblock(now));
        assert!(!e.unblock(now));
        assert!(e.is_due(now));
    }

    #[test]
    fn test_absurd_step_delay_rejected() {
        let step = |delay_hours| CampaignStep {
            id: Uuid::new_v4(),
            order: 1,
            delay_hours,
            delay_minutes: 0,
            subject_template: String::new(),
            body_template: String::new(),
        };
        let mut campaign = Campaign {
            id: Uuid::new_v4(),
            name: "c".to_string(),
            status: CampaignStatus::Active,
            sending_profile_id: None,
            steps: vec![step(72)],
        };
        campaign.validate().unwrap();

        campaign.steps = vec![step(u32::MAX)];
        let err = campaign.validate().unwrap_err();
        assert!(err.to_string().contains("365 days"));
        assert!(step(u32::MAX).due_after(DateTime::<Utc>::MAX_UTC).is_none());
    }

    #[test]
    fn test_step_delay() {
        let step = CampaignStep {
            id: Uuid::new_v4(),
            order: 2,
            delay_hours: 2,
            delay_minutes: 30,
            subject_template: String::new(),
            body_template: String::new(),
        };
        assert_eq!(step.delay(), Duration::minutes(150));
    }

    #[test]
    fn test_lead_variables_prefer_builtins() {
        let mut custom = HashMap::new();
        custom.insert("email".to_string(), "spoofed@example.com".to_string());
        custom.insert("plan".to_string(), "pro".to_string());
        let lead = Lead {
            id: Uuid::new_v4(),
            email: "ada@example.com".to_string(),
            first_name: Some("Ada".to_string()),
            custom_fields: custom,
            ..Default::default()
        };
        let vars = lead.template_variables();
        assert_eq!(vars["email"], "ada@example.com");
        assert_eq!(vars["first_name"], "Ada");
        assert_eq!(vars["last_name"], "");
        assert_eq!(vars["plan"], "pro");
    }

    #[test]
    fn test_refusal_reason_carries_counts() {
        let a = Availability::refused(Refusal::DailyCapReached { used: 5, cap: 5 });
        assert!(!a.is_allowed());
        assert!(a.reason().unwrap().contains("5/5"));
        assert!(Availability::Allowed.reason().is_none());
    }

    #[test]
    fn test_start_of_utc_day() {
        let now = Utc.with_ymd_and_hms(2026, 3, 9, 17, 42, 5).unwrap();
        let start = start_of_utc_day(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 9, 0, 0, 0).unwrap());
    }
}
