//! Flow entity and state machine
//!
//! A `Flow` is one accepted connection as it moves through
//! the slow path. `FlowState` enumerates the state machine exactly:
//! NEW → AUTH → TLS → HTTP_PARSE → ROUTE → FORWARDING → CLOSING → CLOSED,
//! with WS_UPGRADE as a side path taken from HTTP_PARSE when the request
//! carries an `Upgrade: websocket` header.

use std::net::IpAddr;
use std::time::Instant;

use crate::ids::{FlowId, RuleId};
use crate::rules::model::Destination;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    New,
    Auth,
    Tls,
    HttpParse,
    WsUpgrade,
    Route,
    Forwarding,
    Closing,
    Closed,
}

impl FlowState {
    /// Valid forward transitions. `WS_UPGRADE` is reached
    /// only from `HTTP_PARSE` and rejoins at `FORWARDING` once the 101
    /// handshake completes, never revisiting `ROUTE`.
    pub fn can_transition_to(self, next: FlowState) -> bool {
        use FlowState::*;
        matches!(
            (self, next),
            (New, Auth)
                | (New, Tls)
                | (New, HttpParse)
                | (New, Route)
                | (Auth, Tls)
                | (Auth, HttpParse)
                | (Auth, Route)
                | (Tls, HttpParse)
                | (Tls, Route)
                | (HttpParse, WsUpgrade)
                | (HttpParse, Route)
                | (WsUpgrade, Forwarding)
                | (Route, Forwarding)
                | (_, Closing)
                | (Closing, Closed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiveTuple {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

#[derive(Debug, Default)]
pub struct FlowCounters {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
}

/// One live connection being processed by the slow path.
pub struct Flow {
    pub id: FlowId,
    pub tuple: FiveTuple,
    pub matched_rule: Option<RuleId>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub state: FlowState,
    pub counters: FlowCounters,
    pub authenticated: bool,
    pub identity: Option<String>,
    pub destination: Option<Destination>,
}

impl Flow {
    pub fn new(tuple: FiveTuple) -> Self {
        let now = Instant::now();
        Self {
            id: FlowId::new(),
            tuple,
            matched_rule: None,
            created_at: now,
            last_activity: now,
            state: FlowState::New,
            counters: FlowCounters::default(),
            authenticated: false,
            identity: None,
            destination: None,
        }
    }

    /// Attempt a state transition, returning `false` (and leaving state
    /// unchanged) if the transition is not legal per the state machine.
    #[must_use]
    pub fn transition(&mut self, next: FlowState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.last_activity = Instant::now();
        true
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.state == FlowState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn tuple() -> FiveTuple {
        FiveTuple {
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            src_port: 51000,
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            dst_port: 443,
        }
    }

    #[test]
    fn test_new_flow_starts_in_new_state() {
        let flow = Flow::new(tuple());
        assert_eq!(flow.state, FlowState::New);
        assert!(!flow.authenticated);
    }

    #[test]
    fn test_legal_transition_chain() {
        let mut flow = Flow::new(tuple());
        assert!(flow.transition(FlowState::Auth));
        assert!(flow.transition(FlowState::Tls));
        assert!(flow.transition(FlowState::HttpParse));
        assert!(flow.transition(FlowState::Route));
        assert!(flow.transition(FlowState::Forwarding));
        assert!(flow.transition(FlowState::Closing));
        assert!(flow.transition(FlowState::Closed));
        assert!(flow.is_terminal());
    }

    #[test]
    fn test_ws_upgrade_side_path() {
        let mut flow = Flow::new(tuple());
        assert!(flow.transition(FlowState::HttpParse));
        assert!(flow.transition(FlowState::WsUpgrade));
        assert!(flow.transition(FlowState::Forwarding));
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut flow = Flow::new(tuple());
        // Cannot jump straight to Forwarding from New.
        assert!(!flow.transition(FlowState::Forwarding));
        assert_eq!(flow.state, FlowState::New);
    }

    #[test]
    fn test_any_state_can_close() {
        let mut flow = Flow::new(tuple());
        assert!(flow.transition(FlowState::Closing));
        assert!(flow.transition(FlowState::Closed));
    }
}
