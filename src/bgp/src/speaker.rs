use std::{net::{IpAddr, Ipv4Addr}, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;

use crate::{
    error::Error,
    path::{Path, Route, RouteQuery},
    peer::{Neighbor, PeerStatus},
    policy::RoutePolicy,
};

/// Identity of a virtual router. Every field is fixed for the lifetime of
/// the speaker that runs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    pub asn: u32,
    pub router_id: Ipv4Addr,
    pub listen_port: Option<u16>,
}

impl GlobalConfig {
    pub fn new(asn: u32, router_id: Ipv4Addr) -> Self {
        GlobalConfig {
            asn,
            router_id,
            listen_port: None,
        }
    }
}

/// Operations a single running BGP speaker exposes.
#[async_trait]
pub trait Speaker: Send + Sync {
    fn global(&self) -> &GlobalConfig;
    async fn configure_neighbor(&self, neighbor: &Neighbor) -> Result<(), Error>;
    async fn reset_neighbor(&self, address: IpAddr) -> Result<(), Error>;
    async fn remove_neighbor(&self, address: IpAddr) -> Result<(), Error>;
    async fn advertise_path(&self, path: &Path) -> Result<(), Error>;
    async fn withdraw_path(&self, path: &Path) -> Result<(), Error>;
    async fn set_policies(&self, policies: &[RoutePolicy]) -> Result<(), Error>;
    async fn query_peers(&self) -> Result<Vec<PeerStatus>, Error>;
    async fn query_routes(&self, query: &RouteQuery) -> Result<Vec<Route>, Error>;
    async fn query_policies(&self) -> Result<Vec<RoutePolicy>, Error>;
    async fn stop(&self) -> Result<(), Error>;
}

#[async_trait]
pub trait SpeakerFactory: Send + Sync {
    async fn start(&self, global: &GlobalConfig) -> Result<Arc<dyn Speaker>, Error>;
}
