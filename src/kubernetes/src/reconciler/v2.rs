//! Pipeline driven by the `CiliumBGPNodeConfig` of the node. Every BGP
//! instance reconciles independently, peers are configured through
//! `CiliumBGPPeerConfig` and announcements through `CiliumBGPAdvertisement`.

pub mod neighbor;
pub mod peer_advertisement;
pub mod pod_cidr;
pub mod pod_ip_pool;
pub mod preflight;
pub mod route_policy;
pub mod service;
pub mod state;

use std::sync::Arc;

use async_trait::async_trait;
use bgpcp_bgp::manager::RouterManager;

use crate::crd::node_config::CiliumBGPNodeInstance;

use super::{snapshot::Snapshot, InstanceState, ReconcileContext, Reconciler, StageResult};

pub const STAGE_PREFLIGHT: &str = "Preflight";
pub const STAGE_NEIGHBOR: &str = "Neighbor";
pub const STAGE_ROUTE_POLICY: &str = "RoutePolicy";
pub const STAGE_POD_CIDR: &str = "PodCIDR";
pub const STAGE_SERVICE: &str = "Service";
pub const STAGE_POD_IP_POOL: &str = "PodIPPool";
pub const STAGE_STATUS: &str = "NodeConfigStatus";

/// Desired state of one BGP instance.
pub struct V2Input {
    pub manager: Arc<dyn RouterManager>,
    pub snapshot: Arc<Snapshot>,
    pub instance: CiliumBGPNodeInstance,
}

impl V2Input {
    /// Name used for rows about the node config itself.
    pub fn node_config_name(&self) -> &str {
        &self.snapshot.node_name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V2Stage {
    Preflight,
    Neighbor,
    RoutePolicy,
    PodCIDR,
    Service,
    PodIPPool,
}

impl V2Stage {
    pub const PIPELINE: [V2Stage; 6] = [
        V2Stage::Preflight,
        V2Stage::Neighbor,
        V2Stage::RoutePolicy,
        V2Stage::PodCIDR,
        V2Stage::Service,
        V2Stage::PodIPPool,
    ];
}

#[async_trait]
impl Reconciler for V2Stage {
    type Input = V2Input;

    fn name(&self) -> &'static str {
        match self {
            V2Stage::Preflight => STAGE_PREFLIGHT,
            V2Stage::Neighbor => STAGE_NEIGHBOR,
            V2Stage::RoutePolicy => STAGE_ROUTE_POLICY,
            V2Stage::PodCIDR => STAGE_POD_CIDR,
            V2Stage::Service => STAGE_SERVICE,
            V2Stage::PodIPPool => STAGE_POD_IP_POOL,
        }
    }

    fn depends_on(&self) -> &'static [&'static str] {
        match self {
            V2Stage::Preflight => &[],
            V2Stage::Neighbor => &[STAGE_PREFLIGHT],
            V2Stage::RoutePolicy => &[STAGE_PREFLIGHT, STAGE_NEIGHBOR],
            V2Stage::PodCIDR | V2Stage::Service | V2Stage::PodIPPool => {
                &[STAGE_PREFLIGHT, STAGE_ROUTE_POLICY]
            }
        }
    }

    async fn reconcile(
        &self,
        _ctx: &ReconcileContext,
        input: &V2Input,
        state: &mut InstanceState,
    ) -> StageResult {
        match self {
            V2Stage::Preflight => preflight::reconcile(input, state).await,
            V2Stage::Neighbor => neighbor::reconcile(input, state).await,
            V2Stage::RoutePolicy => route_policy::reconcile(input, state).await,
            V2Stage::PodCIDR => pod_cidr::reconcile(input, state).await,
            V2Stage::Service => service::reconcile(input, state).await,
            V2Stage::PodIPPool => pod_ip_pool::reconcile(input, state).await,
        }
    }
}
