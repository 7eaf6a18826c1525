//! Identity/IP blocklist
//!
//! A `BlocklistEntry` is either permanent or time-limited.
//! The rate limiter is the only writer (inserting after repeated
//! rate-limit violations with exponential backoff); every other component
//! only reads.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone)]
pub struct BlocklistEntry {
    pub reason: String,
    pub inserted_at: Instant,
    /// `None` means permanent.
    pub expires_at: Option<Instant>,
    pub violation_count: u32,
}

impl BlocklistEntry {
    fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(t) => Instant::now() >= t,
            None => false,
        }
    }
}

/// Concurrent blocklist keyed by source IP. Whitelisted IPs are never
/// inserted, respecting the rate limiter's whitelist-exclusion rule.
#[derive(Clone, Default)]
pub struct Blocklist {
    entries: std::sync::Arc<DashMap<IpAddr, BlocklistEntry>>,
    whitelist: std::sync::Arc<std::collections::HashSet<IpAddr>>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_whitelist(whitelist: std::collections::HashSet<IpAddr>) -> Self {
        Self { entries: std::sync::Arc::new(DashMap::new()), whitelist: std::sync::Arc::new(whitelist) }
    }

    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.whitelist.contains(ip)
    }

    /// Insert or extend a block, respecting the whitelist. The rate limiter
    /// computes the exponential backoff duration and
    /// passes it in; `None` means permanent.
    pub fn block(&self, ip: IpAddr, reason: impl Into<String>, duration: Option<Duration>) {
        if self.is_whitelisted(&ip) {
            return;
        }
        let now = Instant::now();
        let mut entry = self.entries.entry(ip).or_insert_with(|| BlocklistEntry {
            reason: String::new(),
            inserted_at: now,
            expires_at: None,
            violation_count: 0,
        });
        entry.reason = reason.into();
        entry.violation_count += 1;
        entry.expires_at = duration.map(|d| now + d);
    }

    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        match self.entries.get(ip) {
            Some(entry) if entry.is_expired() => {
                drop(entry);
                self.entries.remove(ip);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn unblock(&self, ip: &IpAddr) {
        self.entries.remove(ip);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sweep expired entries; called from a periodic cleanup task rather
    /// than on every read, so `is_blocked` never pays for a dead entry it
    /// didn't encounter.
    pub fn sweep_expired(&self) {
        self.entries.retain(|_, entry| !entry.is_expired());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    #[test]
    fn test_block_and_check() {
        let bl = Blocklist::new();
        assert!(!bl.is_blocked(&ip(1)));
        bl.block(ip(1), "too many requests", None);
        assert!(bl.is_blocked(&ip(1)));
    }

    #[test]
    fn test_whitelist_excludes_from_blocking() {
        let mut whitelist = std::collections::HashSet::new();
        whitelist.insert(ip(5));
        let bl = Blocklist::with_whitelist(whitelist);
        bl.block(ip(5), "anything", None);
        assert!(!bl.is_blocked(&ip(5)));
    }

    #[test]
    fn test_expiring_entry_becomes_unblocked() {
        let bl = Blocklist::new();
        bl.block(ip(2), "burst", Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!bl.is_blocked(&ip(2)));
    }

    #[test]
    fn test_repeated_violations_increment_count() {
        let bl = Blocklist::new();
        bl.block(ip(3), "first", Some(Duration::from_secs(60)));
        bl.block(ip(3), "second", Some(Duration::from_secs(60)));
        assert_eq!(bl.entries.get(&ip(3)).unwrap().violation_count, 2);
    }
}
