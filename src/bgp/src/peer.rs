use std::{net::IpAddr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::family::Family;

pub const DEFAULT_PEER_PORT: u16 = 179;
pub const DEFAULT_CONNECT_RETRY_TIME: u64 = 120;
pub const DEFAULT_HOLD_TIME: u64 = 90;
pub const DEFAULT_KEEPALIVE_TIME: u64 = 30;
pub const DEFAULT_EBGP_MULTIHOP: u8 = 1;
pub const DEFAULT_RESTART_TIME: u32 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timers {
    pub connect_retry_secs: u64,
    pub hold_time_secs: u64,
    pub keepalive_secs: u64,
}

impl Default for Timers {
    fn default() -> Self {
        Timers {
            connect_retry_secs: DEFAULT_CONNECT_RETRY_TIME,
            hold_time_secs: DEFAULT_HOLD_TIME,
            keepalive_secs: DEFAULT_KEEPALIVE_TIME,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GracefulRestart {
    pub enabled: bool,
    pub restart_time_secs: u32,
}

impl Default for GracefulRestart {
    fn default() -> Self {
        GracefulRestart {
            enabled: false,
            restart_time_secs: DEFAULT_RESTART_TIME,
        }
    }
}

/// Desired configuration of a single BGP peer.
#[derive(Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub name: String,
    pub address: IpAddr,
    pub peer_asn: u32,
    pub peer_port: u16,
    pub auth_password: Option<String>,
    pub timers: Timers,
    pub ebgp_multihop: u8,
    pub graceful_restart: GracefulRestart,
    pub families: Vec<Family>,
}

impl Neighbor {
    pub fn new(name: &str, address: IpAddr, peer_asn: u32) -> Self {
        Neighbor {
            name: name.to_string(),
            address,
            peer_asn,
            peer_port: DEFAULT_PEER_PORT,
            auth_password: None,
            timers: Timers::default(),
            ebgp_multihop: DEFAULT_EBGP_MULTIHOP,
            graceful_restart: GracefulRestart::default(),
            families: Family::defaults(),
        }
    }

    /// Whether moving from `self` to `next` has to bounce the session.
    /// Transport, timer and authentication changes are not applied to a
    /// running session.
    pub fn requires_reset(&self, next: &Neighbor) -> bool {
        self.peer_port != next.peer_port
            || self.ebgp_multihop != next.ebgp_multihop
            || self.timers != next.timers
            || self.auth_password != next.auth_password
            || self.graceful_restart != next.graceful_restart
    }

    pub fn is_ibgp(&self, local_asn: u32) -> bool {
        self.peer_asn == local_asn
    }
}

// The password never shows up in logs.
impl std::fmt::Debug for Neighbor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Neighbor")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("peer_asn", &self.peer_asn)
            .field("peer_port", &self.peer_port)
            .field(
                "auth_password",
                &self.auth_password.as_ref().map(|_| "<redacted>"),
            )
            .field("timers", &self.timers)
            .field("ebgp_multihop", &self.ebgp_multihop)
            .field("graceful_restart", &self.graceful_restart)
            .field("families", &self.families)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Unknown,
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Unknown => "unknown",
            SessionState::Idle => "idle",
            SessionState::Connect => "connect",
            SessionState::Active => "active",
            SessionState::OpenSent => "opensent",
            SessionState::OpenConfirm => "openconfirm",
            SessionState::Established => "established",
        }
    }

    pub fn all() -> [SessionState; 7] {
        [
            SessionState::Unknown,
            SessionState::Idle,
            SessionState::Connect,
            SessionState::Active,
            SessionState::OpenSent,
            SessionState::OpenConfirm,
            SessionState::Established,
        ]
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime view of a peer as reported by the speaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub name: String,
    pub local_asn: u32,
    pub address: IpAddr,
    pub peer_asn: u32,
    pub peer_port: u16,
    pub state: SessionState,
    #[serde(serialize_with = "serialize_opt_secs")]
    pub uptime: Option<Duration>,
    pub routes_received: u64,
    pub routes_advertised: u64,
    pub timers: Timers,
    pub families: Vec<Family>,
}

fn serialize_opt_secs<S: serde::Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs()),
        None => s.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn base() -> Neighbor {
        Neighbor::new("peer", "10.0.0.1".parse().unwrap(), 65002)
    }

    #[rstest(
        modify,
        expected,
        case(|_n: &mut Neighbor| {}, false),
        case(|n: &mut Neighbor| n.timers.hold_time_secs = 30, true),
        case(|n: &mut Neighbor| n.peer_port = 1179, true),
        case(|n: &mut Neighbor| n.ebgp_multihop = 4, true),
        case(|n: &mut Neighbor| n.auth_password = Some("secret".to_string()), true),
        case(|n: &mut Neighbor| n.graceful_restart.enabled = true, true),
        case(|n: &mut Neighbor| n.families = vec![Family::IPV4_UNICAST], false),
        case(|n: &mut Neighbor| n.name = "renamed".to_string(), false)
    )]
    fn test_requires_reset(modify: fn(&mut Neighbor), expected: bool) {
        let current = base();
        let mut next = base();
        modify(&mut next);
        assert_eq!(expected, current.requires_reset(&next));
    }

    #[test]
    fn test_debug_redacts_password() {
        let mut n = base();
        n.auth_password = Some("very-secret".to_string());
        let out = format!("{:?}", n);
        assert!(!out.contains("very-secret"));
        assert!(out.contains("<redacted>"));
    }
}
