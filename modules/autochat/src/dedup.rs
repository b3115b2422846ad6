use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Trim is triggered once the registry holds more than this many ids.
pub const DEDUP_HIGH_WATER: usize = 500;
/// Number of most recent ids kept after a trim.
pub const DEDUP_LOW_WATER: usize = 400;

/// Bounded record of inbound event ids already processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupRegistry {
    seen: HashMap<String, DateTime<Utc>>,
}

impl DedupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time `event_id` is seen, false afterwards.
    pub fn observe(&mut self, event_id: &str) -> bool {
        self.observe_at(event_id, Utc::now())
    }

    /// Like [`observe`](Self::observe) with an explicit clock. Stamps are kept
    /// strictly increasing so recency order stays total even on a coarse clock.
    pub fn observe_at(&mut self, event_id: &str, now: DateTime<Utc>) -> bool {
        if self.seen.contains_key(event_id) {
            return false;
        }
        let stamp = match self.latest() {
            Some(latest) if now <= latest => latest + Duration::microseconds(1),
            _ => now,
        };
        self.seen.insert(event_id.to_string(), stamp);
        if self.seen.len() > DEDUP_HIGH_WATER {
            self.trim_to(DEDUP_LOW_WATER);
        }
        true
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.seen.contains_key(event_id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }

    fn latest(&self) -> Option<DateTime<Utc>> {
        self.seen.values().max().copied()
    }

    /// Keep only the `keep` most recently observed ids.
    fn trim_to(&mut self, keep: usize) {
        let mut by_recency: Vec<(String, DateTime<Utc>)> = self.seen.drain().collect();
        by_recency.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        by_recency.truncate(keep);
        self.seen = by_recency.into_iter().collect();
        tracing::debug!(kept = self.seen.len(), "Trimmed dedup registry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_is_true_exactly_once() {
        let mut reg = DedupRegistry::new();
        assert!(reg.observe("42"));
        assert!(!reg.observe("42"));
        assert!(!reg.observe("42"));
        assert!(reg.observe("43"));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn trims_to_most_recent_after_high_water() {
        let mut reg = DedupRegistry::new();
        let base = Utc::now();
        for i in 0..DEDUP_HIGH_WATER {
            assert!(reg.observe_at(&format!("id-{i}"), base + Duration::seconds(i as i64)));
            assert!(reg.len() <= DEDUP_HIGH_WATER);
        }
        assert_eq!(reg.len(), DEDUP_HIGH_WATER);

        // The 501st id triggers the trim.
        assert!(reg.observe_at("id-500", base + Duration::seconds(500)));
        assert_eq!(reg.len(), DEDUP_LOW_WATER);

        // Ids 101..=500 survive, 0..=100 are evicted.
        for i in 0..=100 {
            assert!(!reg.contains(&format!("id-{i}")), "id-{i} should be evicted");
        }
        for i in 101..=500 {
            assert!(reg.contains(&format!("id-{i}")), "id-{i} should be retained");
        }
    }

    #[test]
    fn evicted_ids_are_new_again() {
        let mut reg = DedupRegistry::new();
        let base = Utc::now();
        for i in 0..=DEDUP_HIGH_WATER {
            reg.observe_at(&format!("id-{i}"), base + Duration::seconds(i as i64));
        }
        assert!(reg.observe_at("id-0", base + Duration::seconds(1000)));
        assert!(!reg.observe_at("id-450", base + Duration::seconds(1001)));
    }

    #[test]
    fn identical_clock_readings_keep_insertion_order() {
        let mut reg = DedupRegistry::new();
        let frozen = Utc::now();
        for i in 0..=DEDUP_HIGH_WATER {
            reg.observe_at(&format!("id-{i}"), frozen);
        }
        assert_eq!(reg.len(), DEDUP_LOW_WATER);
        assert!(!reg.contains("id-100"));
        assert!(reg.contains("id-101"));
        assert!(reg.contains("id-500"));
    }
}
