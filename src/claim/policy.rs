//! Rebalancing policy: how many units to claim per cycle and in what order
//!
//! Fairness is best-effort. Every instance discovers the same ordered list and
//! sleeps a random jitter before each claim, so concurrent instances spread
//! over the candidates instead of all racing for the head of the list.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;

use crate::config::RebalanceConfig;
use crate::models::WorkUnit;

/// Discovery order: priority ascending, never-claimed first, then longest-expired, then id
pub fn discovery_order(a: &WorkUnit, b: &WorkUnit) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| match (a.claim_expires, b.claim_expires) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(&y),
        })
        .then_with(|| a.id.cmp(&b.id))
}

/// Per-cycle claim budget and pacing
#[derive(Debug, Clone)]
pub struct RebalancePolicy {
    batch_size: usize,
    max_jitter: Duration,
    max_units_per_instance: usize,
}

impl RebalancePolicy {
    pub fn new(batch_size: usize, max_jitter: Duration, max_units_per_instance: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_jitter,
            max_units_per_instance,
        }
    }

    pub fn from_config(config: &RebalanceConfig) -> Self {
        Self::new(
            config.batch_size,
            config.max_jitter(),
            config.max_units_per_instance,
        )
    }

    /// Claims to attempt this cycle given how many units are already held
    pub fn claim_budget(&self, owned: usize) -> usize {
        if self.max_units_per_instance == 0 {
            self.batch_size
        } else {
            self.batch_size
                .min(self.max_units_per_instance.saturating_sub(owned))
        }
    }

    /// How many candidates to ask discovery for; over-fetches to absorb conflicts
    pub fn discovery_limit(&self, owned: usize) -> usize {
        self.claim_budget(owned).saturating_mul(2)
    }

    /// Pick this cycle's claim targets from discovery output
    ///
    /// Skips entities this instance already holds a shard of and takes at most
    /// one shard per entity, preserving discovery order.
    pub fn plan(
        &self,
        candidates: Vec<WorkUnit>,
        held_entities: &HashSet<String>,
        owned: usize,
    ) -> Vec<WorkUnit> {
        let budget = self.claim_budget(owned);
        let mut seen = HashSet::new();
        candidates
            .into_iter()
            .filter(|u| !held_entities.contains(&u.entity_id))
            .filter(|u| seen.insert(u.entity_id.clone()))
            .take(budget)
            .collect()
    }

    /// Random delay in `[0, max_jitter]` to sleep before a claim
    pub fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}
