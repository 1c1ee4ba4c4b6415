use std::net::{IpAddr, Ipv4Addr};

use ipnet::IpNet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("router {asn} not found")]
    RouterNotFound { asn: u32 },

    #[error("router {asn} already exists with a different global configuration")]
    RouterExists { asn: u32 },

    #[error("router {asn} runs with router id {current}, requested {requested}")]
    RouterIdMismatch {
        asn: u32,
        current: Ipv4Addr,
        requested: Ipv4Addr,
    },

    #[error("failed to start router {asn}: {reason}")]
    Start { asn: u32, reason: String },

    #[error("duplicate peer address {addr}")]
    DuplicatePeer { addr: IpAddr },

    #[error("peer {addr} not found")]
    PeerNotFound { addr: IpAddr },

    #[error("invalid address family: {0}")]
    InvalidFamily(String),

    #[error("invalid table type: {0}")]
    InvalidTableType(String),

    #[error("peer {addr}: {source}")]
    Peer {
        addr: IpAddr,
        #[source]
        source: Box<Error>,
    },

    #[error("path {prefix}: {source}")]
    Path {
        prefix: IpNet,
        #[source]
        source: Box<Error>,
    },

    #[error("speaker error: {0}")]
    Speaker(String),

    #[error("speaker is stopped")]
    Stopped,

    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Batch(Vec<Error>),
}

impl Error {
    pub(crate) fn peer(addr: IpAddr, source: Error) -> Self {
        Error::Peer {
            addr,
            source: Box::new(source),
        }
    }

    pub(crate) fn path(prefix: IpNet, source: Error) -> Self {
        Error::Path {
            prefix,
            source: Box::new(source),
        }
    }

    /// Collapse a list of errors collected from a best-effort batch.
    pub fn batch(mut errors: Vec<Error>) -> Result<(), Error> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Batch(errors)),
        }
    }

    /// A router could not be brought up at all.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Start { .. } => true,
            Error::Batch(errs) => errs.iter().any(|e| e.is_fatal()),
            _ => false,
        }
    }

    /// Flatten nested batches into the leaf errors.
    pub fn leaves(&self) -> Vec<&Error> {
        match self {
            Error::Batch(errs) => errs.iter().flat_map(|e| e.leaves()).collect(),
            e => vec![e],
        }
    }
}
