//! Demo data for local runs: one domain, three mailboxes at different
//! warmup stages, a three-step campaign and a handful of enrolled leads.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use campaign_core::error::CampaignResult;
use campaign_core::types::{
    Campaign, CampaignStatus, CampaignStep, Lead, ProfileMailbox, SendingDomain, SendingMailbox,
    SendingProfile, WarmupState,
};
use campaign_store::{DispatchStore, MemoryStore};

/// Seeds the store and returns the number of enrollments created.
pub async fn seed(store: &MemoryStore, now: DateTime<Utc>) -> CampaignResult<usize> {
    let domain = SendingDomain {
        id: Uuid::new_v4(),
        domain: "outreach.demo.example".to_string(),
        is_active: true,
    };

    let mailboxes = vec![
        ("alex", "Alex Rivera", 40, 90, WarmupState::Warm, 3),
        ("jordan", "Jordan Lee", 25, 120, WarmupState::Warming, 2),
        ("casey", "Casey Morgan", 50, 300, WarmupState::Cold, 1),
    ];

    let mut members = Vec::new();
    for (local, name, cap, delay, warmup, weight) in mailboxes {
        let id = Uuid::new_v4();
        store.upsert_mailbox(SendingMailbox {
            id,
            domain_id: domain.id,
            email: format!("{local}@{}", domain.domain),
            display_name: name.to_string(),
            daily_cap: cap,
            min_delay_seconds: delay,
            warmup_state: warmup,
            is_active: true,
        });
        members.push(ProfileMailbox { mailbox_id: id, weight });
    }
    store.upsert_domain(domain);

    let profile_id = Uuid::new_v4();
    store.upsert_profile(SendingProfile {
        id: profile_id,
        name: "SDR team".to_string(),
        mailboxes: members,
    });

    let steps = vec![
        (0, 0, "Quick question about {{company}}", "<p>Hi {{first_name}},</p><p>Are you the right person to talk to about outbound at {{company}}?</p>"),
        (48, 0, "Re: Quick question about {{company}}", "<p>Hi {{first_name}}, just bumping this up in your inbox.</p>"),
        (96, 30, "Closing the loop", "<p>{{first_name}}, I'll stop here. Reply any time if {{role}} priorities change.</p>"),
    ];
    let campaign_id = Uuid::new_v4();
    store.upsert_campaign(Campaign {
        id: campaign_id,
        name: "Demo outbound sequence".to_string(),
        status: CampaignStatus::Active,
        sending_profile_id: Some(profile_id),
        steps: steps
            .into_iter()
            .enumerate()
            .map(|(i, (hours, minutes, subject, body))| CampaignStep {
                id: Uuid::new_v4(),
                order: i as u32 + 1,
                delay_hours: hours,
                delay_minutes: minutes,
                subject_template: subject.to_string(),
                body_template: body.to_string(),
            })
            .collect(),
    })?;

    let leads = vec![
        ("Ada", "Lovelace", "Analytical Engines", "CTO"),
        ("Grace", "Hopper", "Compiler Works", "VP Engineering"),
        ("Katherine", "Johnson", "Orbital Dynamics", "Head of Research"),
        ("Alan", "Turing", "Bletchley Labs", "Founder"),
        ("Margaret", "Hamilton", "Apollo Software", "Director"),
    ];

    let mut enrolled = 0;
    for (first, last, company, role) in leads {
        let mut custom_fields = HashMap::new();
        custom_fields.insert("role".to_string(), role.to_string());
        let lead = Lead {
            id: Uuid::new_v4(),
            email: format!("{}.{}@example.com", first.to_lowercase(), last.to_lowercase()),
            first_name: Some(first.to_string()),
            last_name: Some(last.to_string()),
            company: Some(company.to_string()),
            custom_fields,
        };
        let lead_id = lead.id;
        store.upsert_lead(lead);
        store.enroll(campaign_id, lead_id, now).await?;
        enrolled += 1;
    }

    Ok(enrolled)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seed_enrolls_demo_leads() {
        let store = MemoryStore::new();
        let now = Utc::now();
        assert_eq!(seed(&store, now).await.unwrap(), 5);
        assert_eq!(store.due_enrollments(now, None, 50).await.unwrap().len(), 5);
    }
}
