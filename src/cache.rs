//! Time-bounded store of raw extraction output.
//!
//! One entry per pattern key per pass. Entries age out after `max_age` and
//! the oldest are evicted once `max_entries` is exceeded. Canonical state
//! never lives here, so a sweep cannot lose derived entities.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{CacheConfig, Timings};
use crate::entity::Candidate;

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub pattern_key: String,
    pub data: Vec<Candidate>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub evicted_by_age: u64,
    pub evicted_by_size: u64,
}

#[derive(Debug, Clone)]
pub struct ResultCache {
    entries: VecDeque<CacheEntry>,
    max_age: chrono::Duration,
    max_entries: usize,
    evicted_by_age: u64,
    evicted_by_size: u64,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(5 * 60), 1000)
    }
}

impl ResultCache {
    pub fn new(max_age: Duration, max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_age: chrono::Duration::from_std(max_age)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
            max_entries: max_entries.max(1),
            evicted_by_age: 0,
            evicted_by_size: 0,
        }
    }

    pub fn from_config(config: &CacheConfig, timings: &Timings) -> Self {
        Self::new(timings.cache_max_age, config.max_entries)
    }

    pub fn put(&mut self, pattern_key: impl Into<String>, data: Vec<Candidate>) {
        self.put_at(pattern_key, data, Utc::now());
    }

    /// Insert with an explicit timestamp, evicting the oldest entries when
    /// the cap is exceeded.
    pub fn put_at(&mut self, pattern_key: impl Into<String>, data: Vec<Candidate>, now: DateTime<Utc>) {
        self.entries.push_back(CacheEntry {
            pattern_key: pattern_key.into(),
            data,
            timestamp: now,
        });

        let mut evicted = 0u64;
        while self.entries.len() > self.max_entries {
            self.evict_oldest();
            evicted += 1;
        }
        if evicted > 0 {
            self.evicted_by_size += evicted;
            tracing::debug!(evicted, cap = self.max_entries, "cache cap reached");
        }
    }

    pub fn sweep(&mut self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Remove every entry older than `max_age` relative to `now`.
    pub fn sweep_at(&mut self, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = now.checked_sub_signed(self.max_age) else {
            return 0;
        };
        let before = self.entries.len();
        self.entries.retain(|entry| entry.timestamp >= cutoff);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.evicted_by_age += removed as u64;
            tracing::debug!(removed, remaining = self.entries.len(), "cache sweep");
        }
        removed
    }

    /// Most recent entry for a pattern key.
    pub fn latest(&self, pattern_key: &str) -> Option<&CacheEntry> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.pattern_key == pattern_key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            evicted_by_age: self.evicted_by_age,
            evicted_by_size: self.evicted_by_size,
        }
    }

    fn evict_oldest(&mut self) {
        // Timestamps are caller-supplied, so insertion order is not
        // guaranteed to be age order.
        let oldest = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| entry.timestamp)
            .map(|(index, _)| index);
        if let Some(index) = oldest {
            self.entries.remove(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + seconds, 0).expect("timestamp")
    }

    #[test]
    fn sweep_removes_entries_past_max_age() {
        let mut cache = ResultCache::new(Duration::from_secs(300), 1000);
        cache.put_at("tasks", Vec::new(), at(0));
        cache.put_at("inventory", Vec::new(), at(200));

        assert_eq!(cache.sweep_at(at(301)), 1);
        assert!(cache.latest("tasks").is_none());
        assert!(cache.latest("inventory").is_some());
        assert_eq!(cache.stats().evicted_by_age, 1);
    }

    #[test]
    fn entry_exactly_at_max_age_survives() {
        let mut cache = ResultCache::new(Duration::from_secs(300), 1000);
        cache.put_at("tasks", Vec::new(), at(0));
        assert_eq!(cache.sweep_at(at(300)), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cap_evicts_oldest_first() {
        let mut cache = ResultCache::new(Duration::from_secs(300), 3);
        cache.put_at("a", Vec::new(), at(10));
        cache.put_at("b", Vec::new(), at(5));
        cache.put_at("c", Vec::new(), at(20));
        cache.put_at("d", Vec::new(), at(30));

        assert_eq!(cache.len(), 3);
        assert!(cache.latest("b").is_none());
        assert!(cache.latest("a").is_some());
        assert_eq!(cache.stats().evicted_by_size, 1);
    }

    #[test]
    fn latest_prefers_newest_entry() {
        let mut cache = ResultCache::default();
        cache.put_at("tasks", Vec::new(), at(0));
        cache.put_at("tasks", Vec::new(), at(10));
        assert_eq!(cache.latest("tasks").map(|e| e.timestamp), Some(at(10)));
    }
}
