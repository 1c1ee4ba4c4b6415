use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use bgpcp_bgp::{
    family::Family,
    peer::{GracefulRestart, Timers, DEFAULT_PEER_PORT},
};

use super::error::Error;

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(group = "cilium.io", version = "v2", kind = "CiliumBGPPeerConfig")]
#[kube(shortname = "bgppeerconfig")]
#[kube(
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPPeerConfigSpec {
    pub transport: Option<CiliumBGPTransport>,
    pub timers: Option<CiliumBGPTimers>,
    pub auth_secret_ref: Option<String>,
    pub graceful_restart: Option<CiliumBGPNeighborGracefulRestart>,
    #[serde(rename = "ebgpMultihop")]
    pub ebgp_multihop: Option<i32>,
    pub families: Option<Vec<CiliumBGPFamilyWithAdverts>>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPTransport {
    pub peer_port: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPTimers {
    pub connect_retry_time_seconds: Option<i32>,
    pub hold_time_seconds: Option<i32>,
    pub keep_alive_time_seconds: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPNeighborGracefulRestart {
    pub enabled: bool,
    pub restart_time_seconds: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPFamily {
    pub afi: String,
    pub safi: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPFamilyWithAdverts {
    pub afi: String,
    pub safi: String,
    pub advertisements: Option<LabelSelector>,
}

impl CiliumBGPFamily {
    pub fn to_family(&self) -> Result<Family, Error> {
        parse_family(&self.afi, &self.safi)
    }
}

impl CiliumBGPFamilyWithAdverts {
    pub fn to_family(&self) -> Result<Family, Error> {
        parse_family(&self.afi, &self.safi)
    }
}

fn parse_family(afi: &str, safi: &str) -> Result<Family, Error> {
    format!("{afi}-{safi}")
        .parse::<Family>()
        .map_err(|_| Error::InvalidFamily {
            afi: afi.to_string(),
            safi: safi.to_string(),
        })
}

fn timer(name: &'static str, value: Option<i32>, default: u64) -> Result<u64, Error> {
    match value {
        None => Ok(default),
        Some(v) if v > 0 => Ok(v as u64),
        Some(v) => Err(Error::InvalidTimer { name, value: v }),
    }
}

impl CiliumBGPTimers {
    pub fn to_timers(&self) -> Result<Timers, Error> {
        let defaults = Timers::default();
        let timers = Timers {
            connect_retry_secs: timer(
                "connectRetryTimeSeconds",
                self.connect_retry_time_seconds,
                defaults.connect_retry_secs,
            )?,
            hold_time_secs: timer(
                "holdTimeSeconds",
                self.hold_time_seconds,
                defaults.hold_time_secs,
            )?,
            keepalive_secs: timer(
                "keepAliveTimeSeconds",
                self.keep_alive_time_seconds,
                defaults.keepalive_secs,
            )?,
        };
        if timers.keepalive_secs > timers.hold_time_secs {
            return Err(Error::InvalidTimer {
                name: "keepAliveTimeSeconds",
                value: self.keep_alive_time_seconds.unwrap_or_default(),
            });
        }
        Ok(timers)
    }
}

impl CiliumBGPNeighborGracefulRestart {
    pub fn to_graceful_restart(&self) -> Result<GracefulRestart, Error> {
        let defaults = GracefulRestart::default();
        let restart_time_secs = match self.restart_time_seconds {
            None => defaults.restart_time_secs,
            Some(v) if (1..=4095).contains(&v) => v as u32,
            Some(v) => {
                return Err(Error::InvalidTimer {
                    name: "restartTimeSeconds",
                    value: v,
                })
            }
        };
        Ok(GracefulRestart {
            enabled: self.enabled,
            restart_time_secs,
        })
    }
}

pub fn peer_port(port: Option<i32>) -> Result<u16, Error> {
    match port {
        None => Ok(DEFAULT_PEER_PORT),
        Some(p) if (1..=65535).contains(&p) => Ok(p as u16),
        Some(p) => Err(Error::InvalidPort(p)),
    }
}

pub fn ebgp_multihop(ttl: Option<i32>) -> Result<u8, Error> {
    match ttl {
        None => Ok(bgpcp_bgp::peer::DEFAULT_EBGP_MULTIHOP),
        Some(t) if (1..=255).contains(&t) => Ok(t as u8),
        Some(t) => Err(Error::InvalidTimer {
            name: "ebgpMultihop",
            value: t,
        }),
    }
}
