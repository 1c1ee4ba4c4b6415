use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid ASN {0}")]
    InvalidAsn(i64),

    #[error("invalid peer address {0}")]
    InvalidPeerAddress(String),

    #[error("invalid router id {0}")]
    InvalidRouterId(String),

    #[error("invalid port {0}")]
    InvalidPort(i32),

    #[error("invalid timer {name}: {value}")]
    InvalidTimer { name: &'static str, value: i32 },

    #[error("invalid address family {afi}/{safi}")]
    InvalidFamily { afi: String, safi: String },

    #[error("invalid community {0}")]
    InvalidCommunity(String),

    #[error("invalid large community {0}")]
    InvalidLargeCommunity(String),

    #[error("invalid local preference {0}")]
    InvalidLocalPreference(i64),

    #[error("invalid CIDR {0}")]
    InvalidCidr(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),
}
