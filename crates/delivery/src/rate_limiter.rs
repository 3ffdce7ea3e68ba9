//! Per-mailbox send admission.
//!
//! A mailbox may send when, in this order:
//!
//! 1. the mailbox and its domain are active,
//! 2. today's sends are below its configured `daily_cap`,
//! 3. today's sends are below the ceiling of its warmup tier,
//! 4. `min_delay_seconds` have passed since its most recent send.
//!
//! "Today's sends" is derived from the message log plus in-flight claims,
//! never from a stored counter. The read-only [`RateLimiter::check_availability`]
//! serves mailbox selection; the worker passes the limiter to
//! [`DispatchStore::claim_job`] as a [`SlotAdmission`] so the same rules are
//! re-evaluated and the slot reserved in one step.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use campaign_core::config::RateLimitConfig;
use campaign_core::error::CampaignResult;
use campaign_core::types::{
    Availability, MailboxUsage, Refusal, SendingDomain, SendingMailbox, WarmupState,
};
use campaign_store::{DispatchStore, SlotAdmission};

pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn DispatchStore>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, store: Arc<dyn DispatchStore>) -> Self {
        Self { config, store }
    }

    /// Answers "may this mailbox send right now?" without reserving anything.
    pub async fn check_availability(&self, mailbox_id: Uuid, now: DateTime<Utc>) -> CampaignResult<Availability> {
        Ok(self.check_mailbox(mailbox_id, now).await?.1)
    }

    /// Like [`check_availability`](Self::check_availability) but also hands
    /// back the mailbox it loaded.
    pub async fn check_mailbox(
        &self,
        mailbox_id: Uuid,
        now: DateTime<Utc>,
    ) -> CampaignResult<(Option<SendingMailbox>, Availability)> {
        let Some(mailbox) = self.store.get_mailbox(mailbox_id).await? else {
            return Ok((None, Availability::refused(Refusal::MailboxNotFound)));
        };
        let domain = self.store.get_domain(mailbox.domain_id).await?;
        let usage = self.store.mailbox_usage(mailbox_id, now).await?;
        let availability = self.evaluate(Some(&mailbox), domain.as_ref(), &usage, now);
        Ok((Some(mailbox), availability))
    }

    /// Ceiling imposed by the warmup tier, independent of the configured cap.
    pub fn warmup_ceiling(&self, state: WarmupState) -> Option<u32> {
        match state {
            WarmupState::Cold => Some(self.config.cold_daily_ceiling),
            WarmupState::Warming => self.config.warming_daily_ceiling,
            WarmupState::Warm => None,
        }
    }

    pub fn evaluate(
        &self,
        mailbox: Option<&SendingMailbox>,
        domain: Option<&SendingDomain>,
        usage: &MailboxUsage,
        now: DateTime<Utc>,
    ) -> Availability {
        let availability = self.evaluate_rules(mailbox, domain, usage, now);
        if let Availability::Refused { refusal } = &availability {
            debug!(
                mailbox_id = ?mailbox.map(|m| m.id),
                reason = %refusal,
                "Mailbox not available"
            );
            metrics::counter!("dispatch.mailbox_refusals", "reason" => refusal.kind()).increment(1);
        }
        availability
    }

    fn evaluate_rules(
        &self,
        mailbox: Option<&SendingMailbox>,
        domain: Option<&SendingDomain>,
        usage: &MailboxUsage,
        now: DateTime<Utc>,
    ) -> Availability {
        let Some(mailbox) = mailbox else {
            return Availability::refused(Refusal::MailboxNotFound);
        };
        if !mailbox.is_active {
            return Availability::refused(Refusal::MailboxInactive);
        }
        if !domain.is_some_and(|d| d.is_active && d.id == mailbox.domain_id) {
            return Availability::refused(Refusal::DomainInactive);
        }

        let used = usage.used_today();
        if used >= mailbox.daily_cap {
            return Availability::refused(Refusal::DailyCapReached {
                used,
                cap: mailbox.daily_cap,
            });
        }

        if let Some(ceiling) = self.warmup_ceiling(mailbox.warmup_state) {
            if used >= ceiling {
                return Availability::refused(Refusal::WarmupCeiling { used, ceiling });
            }
        }

        if let Some(last) = usage.last_send_at {
            let min_delay = i64::try_from(mailbox.min_delay_seconds).unwrap_or(i64::MAX);
            let elapsed = (now - last).num_seconds();
            if elapsed < min_delay {
                return Availability::refused(Refusal::MinDelay {
                    remaining_secs: min_delay - elapsed,
                });
            }
        }

        Availability::Allowed
    }
}

impl SlotAdmission for RateLimiter {
    fn admit(
        &self,
        mailbox: Option<&SendingMailbox>,
        domain: Option<&SendingDomain>,
        usage: &MailboxUsage,
        now: DateTime<Utc>,
    ) -> Availability {
        self.evaluate(mailbox, domain, usage, now)
    }
}
