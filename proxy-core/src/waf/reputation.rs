//! IP reputation cache
//!
//! A TTL-cached reputation score per source IP, consulted by
//! the WAF alongside the rule engine, anomaly detector, and geo blocker.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
pub struct ReputationRecord {
    pub score: u32,
    fetched_at: Instant,
}

impl ReputationRecord {
    fn is_stale(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() >= ttl
    }
}

/// Concurrent TTL cache of IP reputation scores. Higher score = worse
/// reputation, on the same 0-100 scale as WAF rule severity so the two can
/// be summed directly into one blocking-threshold comparison.
#[derive(Clone)]
pub struct ReputationCache {
    entries: std::sync::Arc<DashMap<IpAddr, ReputationRecord>>,
    ttl: Duration,
}

impl ReputationCache {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: std::sync::Arc::new(DashMap::new()), ttl }
    }

    /// Returns a cached, non-stale score if present.
    pub fn get(&self, ip: &IpAddr) -> Option<u32> {
        match self.entries.get(ip) {
            Some(record) if !record.is_stale(self.ttl) => Some(record.score),
            Some(_) => None,
            None => None,
        }
    }

    pub fn put(&self, ip: IpAddr, score: u32) {
        self.entries.insert(ip, ReputationRecord { score, fetched_at: Instant::now() });
    }

    pub fn sweep_stale(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, record| !record.is_stale(ttl));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_put_and_get() {
        let cache = ReputationCache::new(Duration::from_secs(60));
        let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        cache.put(ip, 80);
        assert_eq!(cache.get(&ip), Some(80));
    }

    #[test]
    fn test_stale_entry_returns_none() {
        let cache = ReputationCache::new(Duration::from_millis(1));
        let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 5));
        cache.put(ip, 50);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&ip), None);
    }

    #[test]
    fn test_missing_entry_returns_none() {
        let cache = ReputationCache::new(Duration::from_secs(60));
        assert_eq!(cache.get(&IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9))), None);
    }
}
