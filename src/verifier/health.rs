use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

use crate::db::LinkStatus;

/// Rolling health of one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub active: u64,
    pub dead: u64,
    pub rate_limited: u64,
    /// Probes that settled nothing (network errors).
    pub unknown: u64,
    pub samples: u64,
    /// `active / (active + dead)`; 1.0 until a definitive result is seen.
    pub score: f64,
}

/// Per-provider rolling windows of probe outcomes.
#[derive(Debug)]
pub struct HealthBook {
    window: usize,
    providers: BTreeMap<String, VecDeque<LinkStatus>>,
}

impl HealthBook {
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            providers: BTreeMap::new(),
        }
    }

    /// Record one probe outcome; the oldest sample falls out when the window is full.
    pub fn record(&mut self, provider: &str, outcome: LinkStatus) {
        let samples = self.providers.entry(provider.to_string()).or_default();
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(outcome);
    }

    #[must_use]
    pub fn get(&self, provider: &str) -> Option<ProviderHealth> {
        self.providers
            .get(provider)
            .map(|samples| summarize(provider, samples))
    }

    /// Health of every provider seen so far, by name.
    #[must_use]
    pub fn all(&self) -> Vec<ProviderHealth> {
        self.providers
            .iter()
            .map(|(name, samples)| summarize(name, samples))
            .collect()
    }
}

fn summarize(provider: &str, samples: &VecDeque<LinkStatus>) -> ProviderHealth {
    let mut health = ProviderHealth {
        provider: provider.to_string(),
        active: 0,
        dead: 0,
        rate_limited: 0,
        unknown: 0,
        samples: samples.len() as u64,
        score: 1.0,
    };
    for outcome in samples {
        match outcome {
            LinkStatus::Active => health.active += 1,
            LinkStatus::Dead => health.dead += 1,
            LinkStatus::RateLimited => health.rate_limited += 1,
            LinkStatus::Unknown => health.unknown += 1,
        }
    }
    let decided = health.active + health.dead;
    if decided > 0 {
        health.score = health.active as f64 / decided as f64;
    }
    health
}
