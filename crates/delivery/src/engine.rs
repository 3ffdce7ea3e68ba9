//! Mailbox selection for a sending profile.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use tracing::debug;
use uuid::Uuid;

use campaign_core::config::{DeliveryConfig, SelectionStrategy};
use campaign_core::error::CampaignResult;
use campaign_core::types::{Availability, ProfileMailbox, SendingMailbox};
use campaign_store::DispatchStore;

use crate::rate_limiter::RateLimiter;

/// Outcome of a mailbox selection.
#[derive(Debug, Clone)]
pub enum Selection {
    Selected(SendingMailbox),
    /// Every mailbox of the profile is constrained right now.
    Exhausted,
    ProfileNotFound,
    /// The profile has no mailbox with a positive weight.
    EmptyProfile,
}

impl Selection {
    pub fn into_mailbox(self) -> Option<SendingMailbox> {
        match self {
            Selection::Selected(mailbox) => Some(mailbox),
            _ => None,
        }
    }
}

/// Picks an eligible mailbox out of a profile's pool.
///
/// `Shuffle` orders the pool by weighted random keys on every call and keeps
/// no state. `RoundRobin` keeps a per-profile cursor into the cumulative
/// weights of the pool; the cursor lives in this process only.
pub struct DeliveryEngine {
    store: Arc<dyn DispatchStore>,
    limiter: Arc<RateLimiter>,
    strategy: SelectionStrategy,
    cursors: DashMap<Uuid, u64>,
}

impl DeliveryEngine {
    pub fn new(config: &DeliveryConfig, store: Arc<dyn DispatchStore>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            store,
            limiter,
            strategy: config.selection,
            cursors: DashMap::new(),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Returns the first mailbox of the profile the rate limiter admits, or
    /// `None` when the profile is missing, empty, or fully constrained.
    pub async fn select_mailbox(
        &self,
        profile_id: Uuid,
        now: DateTime<Utc>,
    ) -> CampaignResult<Option<SendingMailbox>> {
        Ok(self.select(profile_id, now).await?.into_mailbox())
    }

    pub async fn select(&self, profile_id: Uuid, now: DateTime<Utc>) -> CampaignResult<Selection> {
        let Some(profile) = self.store.get_profile(profile_id).await? else {
            debug!(profile_id = %profile_id, "Sending profile not found");
            return Ok(Selection::ProfileNotFound);
        };

        let pool: Vec<ProfileMailbox> = profile.mailboxes.iter().filter(|m| m.weight > 0).copied().collect();
        if pool.is_empty() {
            debug!(profile_id = %profile_id, name = %profile.name, "Sending profile has no mailboxes");
            return Ok(Selection::EmptyProfile);
        }

        for candidate in self.candidate_order(profile_id, &pool) {
            let (mailbox, availability) = self.limiter.check_mailbox(candidate.mailbox_id, now).await?;
            match (mailbox, availability) {
                (Some(mailbox), Availability::Allowed) => {
                    if let Some(next) = candidate.next_cursor {
                        self.cursors.insert(profile_id, next);
                    }
                    debug!(profile_id = %profile_id, mailbox_id = %mailbox.id, "Mailbox selected");
                    return Ok(Selection::Selected(mailbox));
                }
                (_, availability) => {
                    debug!(
                        profile_id = %profile_id,
                        mailbox_id = %candidate.mailbox_id,
                        reason = ?availability.reason(),
                        "Skipping constrained mailbox"
                    );
                }
            }
        }

        debug!(profile_id = %profile_id, "No mailbox available in profile");
        Ok(Selection::Exhausted)
    }

    fn candidate_order(&self, profile_id: Uuid, pool: &[ProfileMailbox]) -> Vec<Candidate> {
        match self.strategy {
            SelectionStrategy::Shuffle => weighted_shuffle(pool, &mut rand::thread_rng()),
            SelectionStrategy::RoundRobin => self.rotation(profile_id, pool),
        }
    }

    fn rotation(&self, profile_id: Uuid, pool: &[ProfileMailbox]) -> Vec<Candidate> {
        let cursor = self.cursors.get(&profile_id).map(|c| *c).unwrap_or(0);
        rotation_from(pool, cursor)
    }
}

struct Candidate {
    mailbox_id: Uuid,
    next_cursor: Option<u64>,
}

/// Rotation order starting at `cursor`, a position in `[0, total weight)`
/// where each member owns a run of positions as long as its weight. The
/// member owning the cursor comes first and moves the cursor one step; any
/// other member restarts the cursor one past the start of its run.
fn rotation_from(pool: &[ProfileMailbox], cursor: u64) -> Vec<Candidate> {
    let mut starts = Vec::with_capacity(pool.len());
    let mut total: u64 = 0;
    for member in pool {
        starts.push(total);
        total += u64::from(member.weight);
    }
    if total == 0 {
        return Vec::new();
    }
    let cursor = cursor % total;
    let first = starts.partition_point(|start| *start <= cursor).saturating_sub(1);

    let mut order: Vec<Candidate> = Vec::with_capacity(pool.len());
    for offset in 0..pool.len() {
        let index = (first + offset) % pool.len();
        let mailbox_id = pool[index].mailbox_id;
        if order.iter().any(|c| c.mailbox_id == mailbox_id) {
            continue;
        }
        let position = if offset == 0 { cursor } else { starts[index] };
        order.push(Candidate {
            mailbox_id,
            next_cursor: Some((position + 1) % total),
        });
    }
    order
}

/// Weighted random permutation (Efraimidis–Spirakis): each entry draws
/// `u^(1/weight)` and the pool is sorted by descending key.
fn weighted_shuffle(pool: &[ProfileMailbox], rng: &mut impl Rng) -> Vec<Candidate> {
    let mut keyed: Vec<(f64, Uuid)> = pool
        .iter()
        .map(|m| {
            let u: f64 = rng.gen_range(f64::EPSILON..1.0);
            (u.powf(1.0 / f64::from(m.weight)), m.mailbox_id)
        })
        .collect();
    keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
    keyed
        .into_iter()
        .map(|(_, mailbox_id)| Candidate {
            mailbox_id,
            next_cursor: None,
        })
        .collect()
}
