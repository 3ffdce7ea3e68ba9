//! Shared fixture for the unit tests of this crate.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use campaign_core::config::{AppConfig, SchedulerConfig, WorkerConfig};
use campaign_core::event_bus::{capture_sink, CaptureSink};
use campaign_core::templates::PlaceholderRenderer;
use campaign_core::types::{
    Campaign, CampaignEnrollment, CampaignStatus, CampaignStep, Lead, ProfileMailbox, SendingDomain,
    SendingMailbox, SendingProfile, WarmupState,
};
use campaign_delivery::{DeliveryEngine, RateLimiter, RecordingTransport};
use campaign_store::{DispatchStore, MemoryStore};

use crate::scheduler::Scheduler;
use crate::worker::Worker;

/// Monday morning, far from a UTC day boundary.
pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).unwrap()
}

pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub transport: Arc<RecordingTransport>,
    pub events: Arc<CaptureSink>,
    pub config: AppConfig,
    pub campaign_id: Uuid,
    pub profile_id: Uuid,
    pub domain_id: Uuid,
    pub mailbox_id: Uuid,
}

impl Harness {
    /// One warm mailbox in one profile, and a campaign whose steps are
    /// delayed by `delays_hours`.
    pub fn new(delays_hours: &[u32], daily_cap: u32, min_delay_seconds: u64) -> Self {
        Self::with_transport(delays_hours, daily_cap, min_delay_seconds, Arc::new(RecordingTransport::new()))
    }

    pub fn with_transport(
        delays_hours: &[u32],
        daily_cap: u32,
        min_delay_seconds: u64,
        transport: Arc<RecordingTransport>,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let domain_id = Uuid::new_v4();
        store.upsert_domain(SendingDomain {
            id: domain_id,
            domain: "outbound.example.com".to_string(),
            is_active: true,
        });
        let mailbox_id = Uuid::new_v4();
        store.upsert_mailbox(SendingMailbox {
            id: mailbox_id,
            domain_id,
            email: "sdr@outbound.example.com".to_string(),
            display_name: "Sam".to_string(),
            daily_cap,
            min_delay_seconds,
            warmup_state: WarmupState::Warm,
            is_active: true,
        });
        let profile_id = Uuid::new_v4();
        store.upsert_profile(SendingProfile {
            id: profile_id,
            name: "default".to_string(),
            mailboxes: vec![ProfileMailbox { mailbox_id, weight: 1 }],
        });
        let campaign_id = Uuid::new_v4();
        store.upsert_campaign(Campaign {
            id: campaign_id,
            name: "Outreach".to_string(),
            status: CampaignStatus::Active,
            sending_profile_id: Some(profile_id),
            steps: steps(delays_hours),
        })
        .unwrap();

        Self {
            store,
            transport,
            events: capture_sink(),
            config: AppConfig::default(),
            campaign_id,
            profile_id,
            domain_id,
            mailbox_id,
        }
    }

    /// A second one-step campaign drawing from `profile_id`.
    pub fn add_campaign(&self, profile_id: Option<Uuid>) -> Uuid {
        let id = Uuid::new_v4();
        self.store
            .upsert_campaign(Campaign {
                id,
                name: "Side campaign".to_string(),
                status: CampaignStatus::Active,
                sending_profile_id: profile_id,
                steps: steps(&[0]),
            })
            .unwrap();
        id
    }

    /// A profile whose only mailbox is inactive.
    pub fn add_inactive_profile(&self) -> Uuid {
        let mailbox_id = Uuid::new_v4();
        self.store.upsert_mailbox(SendingMailbox {
            id: mailbox_id,
            domain_id: self.domain_id,
            email: "paused@outbound.example.com".to_string(),
            display_name: "Paused".to_string(),
            daily_cap: 100,
            min_delay_seconds: 0,
            warmup_state: WarmupState::Warm,
            is_active: false,
        });
        let profile_id = Uuid::new_v4();
        self.store.upsert_profile(SendingProfile {
            id: profile_id,
            name: "paused".to_string(),
            mailboxes: vec![ProfileMailbox { mailbox_id, weight: 1 }],
        });
        profile_id
    }

    /// Enrolls `count` fresh leads in `campaign_id`.
    pub async fn enroll_many(&self, campaign_id: Uuid, count: usize, now: DateTime<Utc>) -> Vec<CampaignEnrollment> {
        let mut enrollments = Vec::with_capacity(count);
        for i in 0..count {
            let lead = Lead {
                id: Uuid::new_v4(),
                email: format!("bulk{i}@example.com"),
                first_name: Some(format!("Lead{i}")),
                ..Default::default()
            };
            let lead_id = lead.id;
            self.store.upsert_lead(lead);
            enrollments.push(self.store.enroll(campaign_id, lead_id, now).await.unwrap());
        }
        enrollments
    }

    pub async fn enroll_lead(&self, first_name: &str, now: DateTime<Utc>) -> CampaignEnrollment {
        let lead = Lead {
            id: Uuid::new_v4(),
            email: format!("{}@example.com", first_name.to_lowercase()),
            first_name: Some(first_name.to_string()),
            ..Default::default()
        };
        let lead_id = lead.id;
        self.store.upsert_lead(lead);
        self.store
            .enroll(self.campaign_id, lead_id, now)
            .await
            .unwrap()
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(self.config.rate_limit.clone(), self.store.clone()))
    }

    pub fn scheduler(&self) -> Scheduler {
        self.scheduler_with(&self.config.scheduler)
    }

    pub fn scheduler_with(&self, config: &SchedulerConfig) -> Scheduler {
        let limiter = self.limiter();
        let engine = Arc::new(DeliveryEngine::new(&self.config.delivery, self.store.clone(), limiter));
        Scheduler::new(
            config,
            self.store.clone(),
            engine,
            Arc::new(PlaceholderRenderer::new()),
            self.events.clone(),
        )
    }

    pub fn worker(&self) -> Worker {
        self.worker_with(&self.config.worker)
    }

    pub fn worker_with(&self, config: &WorkerConfig) -> Worker {
        Worker::new(
            config,
            self.store.clone(),
            self.limiter(),
            self.transport.clone(),
            self.events.clone(),
        )
    }

    pub fn replace_steps(&self, delays_hours: &[u32]) {
        self.update_campaign(|c| c.steps = steps(delays_hours));
    }

    pub fn set_profile(&self, profile_id: Option<Uuid>) {
        self.update_campaign(|c| c.sending_profile_id = profile_id);
    }

    pub fn set_mailbox_active(&self, active: bool) {
        self.store.set_mailbox_active(self.mailbox_id, active).unwrap();
    }

    fn update_campaign(&self, apply: impl FnOnce(&mut Campaign)) {
        let mut campaign = self.store.campaign(self.campaign_id).unwrap();
        apply(&mut campaign);
        self.store.upsert_campaign(campaign).unwrap();
    }
}

fn steps(delays_hours: &[u32]) -> Vec<CampaignStep> {
    delays_hours
        .iter()
        .enumerate()
        .map(|(i, delay)| CampaignStep {
            id: Uuid::new_v4(),
            order: i as u32 + 1,
            delay_hours: *delay,
            delay_minutes: 0,
            subject_template: "Hi {{first_name}}".to_string(),
            body_template: format!("<p>Hello {{{{first_name}}}}, this is step {}</p>", i + 1),
        })
        .collect()
}
