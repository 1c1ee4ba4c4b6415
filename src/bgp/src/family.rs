use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Afi {
    Ipv4,
    Ipv6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Safi {
    Unicast,
    Multicast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Family {
    pub afi: Afi,
    pub safi: Safi,
}

impl Family {
    pub const IPV4_UNICAST: Family = Family {
        afi: Afi::Ipv4,
        safi: Safi::Unicast,
    };
    pub const IPV6_UNICAST: Family = Family {
        afi: Afi::Ipv6,
        safi: Safi::Unicast,
    };

    pub fn new(afi: Afi, safi: Safi) -> Self {
        Self { afi, safi }
    }

    /// Unicast family a prefix is carried in.
    pub fn for_prefix(prefix: &IpNet) -> Self {
        match prefix {
            IpNet::V4(_) => Self::IPV4_UNICAST,
            IpNet::V6(_) => Self::IPV6_UNICAST,
        }
    }

    pub fn carries(&self, prefix: &IpNet) -> bool {
        matches!(
            (self.afi, prefix),
            (Afi::Ipv4, IpNet::V4(_)) | (Afi::Ipv6, IpNet::V6(_))
        )
    }

    pub fn defaults() -> Vec<Family> {
        vec![Self::IPV4_UNICAST, Self::IPV6_UNICAST]
    }
}

impl std::fmt::Display for Afi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Afi::Ipv4 => write!(f, "ipv4"),
            Afi::Ipv6 => write!(f, "ipv6"),
        }
    }
}

impl std::fmt::Display for Safi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Safi::Unicast => write!(f, "unicast"),
            Safi::Multicast => write!(f, "multicast"),
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.afi, self.safi)
    }
}

impl FromStr for Afi {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ipv4" => Ok(Afi::Ipv4),
            "ipv6" => Ok(Afi::Ipv6),
            _ => Err(Error::InvalidFamily(s.to_string())),
        }
    }
}

impl FromStr for Safi {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unicast" => Ok(Safi::Unicast),
            "multicast" => Ok(Safi::Multicast),
            _ => Err(Error::InvalidFamily(s.to_string())),
        }
    }
}

// Accepts "ipv4-unicast", "ipv4/unicast" and a bare "ipv4" meaning unicast.
impl FromStr for Family {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, |c| c == '-' || c == '/');
        let afi = parts
            .next()
            .ok_or_else(|| Error::InvalidFamily(s.to_string()))?
            .parse::<Afi>()
            .map_err(|_| Error::InvalidFamily(s.to_string()))?;
        let safi = match parts.next() {
            Some(safi) => safi
                .parse::<Safi>()
                .map_err(|_| Error::InvalidFamily(s.to_string()))?,
            None => Safi::Unicast,
        };
        Ok(Family { afi, safi })
    }
}
